//! System-wide load table.
//!
//! Each concrete core type carries a [`CoreLoad`]: the maximum load its
//! managers report, the capacity limit set by clients (`0..=1000`, where
//! any limit at or above the maximum means unrestricted) and the load
//! currently admitted.  The table is
//! guarded by a single mutex; capacity is advisory to managers, enforced
//! here only through [`LoadTable::admit`].

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};
use crate::graph::CoreType;

/// Upper bound of the capacity range; also means "unrestricted".
pub const MAX_CAPACITY: u32 = 1000;

/// Load bookkeeping for one core type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreLoad {
    /// Highest maximum load reported by the core's managers.
    pub maximum: u32,
    /// Client-set capacity limit in `0..=MAX_CAPACITY`.
    pub limit: u32,
    /// Load currently admitted for execution.
    pub current: u32,
}

impl CoreLoad {
    /// A limit at or above the core's maximum load restricts nothing.  A
    /// limit of zero always throttles.
    fn is_unrestricted(&self) -> bool {
        self.limit >= MAX_CAPACITY || self.limit >= self.maximum.max(1)
    }

    fn would_admit(&self, cost: u32) -> bool {
        if self.is_unrestricted() {
            return true;
        }
        self.current.saturating_add(cost) <= self.limit
    }
}

/// Per-core load table.  Cheaply cloneable (`Arc`-backed).
#[derive(Debug, Clone, Default)]
pub struct LoadTable {
    inner: Arc<Mutex<BTreeMap<CoreType, CoreLoad>>>,
}

impl LoadTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a manager's maximum load for `core`.  The first registration
    /// creates the entry with an unrestricted limit.
    pub fn register(&self, core: CoreType, maximum: u32) {
        let maximum = maximum.min(MAX_CAPACITY);
        self.lock()
            .entry(core)
            .and_modify(|load| load.maximum = load.maximum.max(maximum))
            .or_insert(CoreLoad {
                maximum,
                limit: MAX_CAPACITY,
                current: 0,
            });
    }

    /// Set the capacity limit, clamped to `0..=MAX_CAPACITY`.  Returns the
    /// stored value.
    pub fn set_capacity(&self, core: CoreType, limit: i64) -> Result<u32> {
        let clamped = u32::try_from(limit.clamp(0, i64::from(MAX_CAPACITY))).unwrap_or(MAX_CAPACITY);
        let mut table = self.lock();
        let load = table
            .get_mut(&core)
            .ok_or(KernelError::CoreUnavailable { core })?;
        load.limit = clamped;
        tracing::debug!(%core, requested = limit, limit = clamped, "capacity set");
        Ok(clamped)
    }

    pub fn capacity(&self, core: CoreType) -> Result<u32> {
        self.lock()
            .get(&core)
            .map(|load| load.limit)
            .ok_or(KernelError::CoreUnavailable { core })
    }

    pub fn load(&self, core: CoreType) -> Option<CoreLoad> {
        self.lock().get(&core).copied()
    }

    pub fn cores(&self) -> Vec<CoreType> {
        self.lock().keys().copied().collect()
    }

    /// Admit `cost` units of work on `core`.
    ///
    /// Returns `None` when the core is unknown or the capacity limit would be
    /// exceeded.  The returned guard releases the load when dropped.
    pub fn admit(&self, core: CoreType, cost: u32) -> Option<LoadGuard> {
        let mut table = self.lock();
        let load = table.get_mut(&core)?;
        if !load.would_admit(cost) {
            tracing::debug!(%core, cost, current = load.current, limit = load.limit, "admission refused");
            return None;
        }
        load.current = load.current.saturating_add(cost);
        Some(LoadGuard {
            table: self.clone(),
            core,
            cost,
        })
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<CoreType, CoreLoad>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Admitted load; released on drop.
#[derive(Debug)]
pub struct LoadGuard {
    table: LoadTable,
    core: CoreType,
    cost: u32,
}

impl LoadGuard {
    pub fn core(&self) -> CoreType {
        self.core
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        if let Some(load) = self.table.lock().get_mut(&self.core) {
            load.current = load.current.saturating_sub(self.cost);
        }
    }
}
