//! Shared graph region.
//!
//! Graphs draw their section slots from one bounded region sized at boss
//! init.  Freeing a graph returns its slots; node arrays are never part of
//! the region.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use crate::error::{KernelError, Result};

#[derive(Debug)]
pub(crate) struct GraphRegion {
    capacity: usize,
    slots: Mutex<RegionSlots>,
}

#[derive(Debug, Default)]
struct RegionSlots {
    used: usize,
    graphs: HashMap<Uuid, usize>,
}

impl GraphRegion {
    /// Map a region of `capacity` section slots.
    pub(crate) fn map(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(KernelError::RegionUnavailable {
                reason: "region must hold at least one section".into(),
            });
        }
        Ok(Self {
            capacity,
            slots: Mutex::new(RegionSlots::default()),
        })
    }

    pub(crate) fn reserve(&self, graph: Uuid, sections: usize) -> Result<()> {
        let mut slots = self.lock();
        let available = self.capacity - slots.used;
        if sections > available {
            return Err(KernelError::RegionExhausted {
                requested: sections,
                available,
            });
        }
        slots.used += sections;
        slots.graphs.insert(graph, sections);
        Ok(())
    }

    pub(crate) fn release(&self, graph: Uuid) -> Result<usize> {
        let mut slots = self.lock();
        let sections = slots
            .graphs
            .remove(&graph)
            .ok_or(KernelError::GraphNotFound { graph })?;
        slots.used -= sections;
        Ok(sections)
    }

    pub(crate) fn contains(&self, graph: Uuid) -> bool {
        self.lock().graphs.contains_key(&graph)
    }

    pub(crate) fn live_graphs(&self) -> usize {
        self.lock().graphs.len()
    }

    pub(crate) fn available(&self) -> usize {
        self.capacity - self.lock().used
    }

    fn lock(&self) -> MutexGuard<'_, RegionSlots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
