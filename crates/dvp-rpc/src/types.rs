//! Remote cores, call parameters and the pointer translation table.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{RpcError, Result};

/// Hard upper bound on pointer translations carried by one call.
pub const MAX_TRANSLATIONS: usize = 1024;

/// Width of a pointer stored inside parameter bytes.
pub const POINTER_SIZE: usize = std::mem::size_of::<u64>();

// ---------------------------------------------------------------------------
// Cores and channel state
// ---------------------------------------------------------------------------

/// Identity of a remote core reachable through a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RemoteCore(pub u32);

impl std::fmt::Display for RemoteCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "core{}", self.0)
    }
}

/// Lifecycle of a channel to one remote core.
///
/// ```text
/// Connected --(peer restarted)--> Reopening --(reopened)--> Connected
///                                          \--(retries exhausted)--> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelState {
    Connected,
    Reopening,
    Closed,
}

/// How a restart attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestartOutcome {
    /// The channel was reopened after `attempts` tries.
    Recovered { attempts: u32 },
    /// Every one of `attempts` reopen tries failed; the channel is closed.
    Failed { attempts: u32 },
}

/// Delivered to the registered restart handler once per restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartEvent {
    pub core: RemoteCore,
    pub outcome: RestartOutcome,
}

impl RestartEvent {
    pub fn recovered(&self) -> bool {
        matches!(self.outcome, RestartOutcome::Recovered { .. })
    }
}

/// Handler invoked after an unexpected peer restart has been resolved.
pub type RestartCallback = Arc<dyn Fn(&RestartEvent) + Send + Sync>;

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Which side reads and which side writes a parameter's referenced memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// The remote side only reads: flush before the call.
    ReadOnly,
    /// The remote side only writes: invalidate after the call.
    WriteOnly,
    /// Both: flush before and invalidate after.
    ReadWrite,
}

impl Direction {
    pub fn remote_reads(self) -> bool {
        matches!(self, Self::ReadOnly | Self::ReadWrite)
    }

    pub fn remote_writes(self) -> bool {
        matches!(self, Self::WriteOnly | Self::ReadWrite)
    }
}

/// One argument of a remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcParam {
    pub direction: Direction,
    pub data: Vec<u8>,
    /// Transport-private handle slot.
    pub reserved: u64,
}

impl RpcParam {
    pub fn new(direction: Direction, data: Vec<u8>) -> Self {
        Self {
            direction,
            data,
            reserved: 0,
        }
    }

    /// A read-only 32-bit value.
    pub fn value(value: u32) -> Self {
        Self::new(Direction::ReadOnly, value.to_le_bytes().to_vec())
    }

    /// A single pointer to memory the remote side accesses as `direction`.
    pub fn pointer(direction: Direction, addr: u64) -> Self {
        Self::new(direction, addr.to_le_bytes().to_vec())
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Read a little-endian `u32` at `offset`.
    pub fn read_u32(&self, offset: usize) -> Option<u32> {
        let bytes = self.data.get(offset..offset.checked_add(4)?)?;
        Some(u32::from_le_bytes(bytes.try_into().ok()?))
    }

    /// Read a little-endian pointer at `offset`.
    pub fn read_pointer(&self, offset: usize) -> Option<u64> {
        let bytes = self.data.get(offset..offset.checked_add(POINTER_SIZE)?)?;
        Some(u64::from_le_bytes(bytes.try_into().ok()?))
    }

    /// Overwrite the pointer at `offset`.  Returns `false` when out of range.
    pub fn write_pointer(&mut self, offset: usize, addr: u64) -> bool {
        let Some(end) = offset.checked_add(POINTER_SIZE) else {
            return false;
        };
        match self.data.get_mut(offset..end) {
            Some(slot) => {
                slot.copy_from_slice(&addr.to_le_bytes());
                true
            }
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Translation table
// ---------------------------------------------------------------------------

/// A pointer embedded in a parameter that must be rewritten for the remote
/// address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerPatch {
    /// Index of the parameter holding the pointer.
    pub param: usize,
    /// Byte offset of the pointer inside the parameter.
    pub offset: usize,
    /// Bytes of memory the pointer covers (the cache-maintenance range).
    pub len: usize,
    /// Memory type the pointed-to buffer was allocated as.
    pub mem_type: dvp_mem::MemType,
}

/// Bounded list of pointer patches for one call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Translation {
    patches: Vec<PointerPatch>,
}

impl Translation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a patch.  Exceeding [`MAX_TRANSLATIONS`] is rejected.
    pub fn push(&mut self, patch: PointerPatch) -> Result<()> {
        if self.patches.len() >= MAX_TRANSLATIONS {
            return Err(RpcError::TranslationOverflow {
                count: self.patches.len() + 1,
                limit: MAX_TRANSLATIONS,
            });
        }
        self.patches.push(patch);
        Ok(())
    }

    pub fn patches(&self) -> &[PointerPatch] {
        &self.patches
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }
}

impl FromIterator<PointerPatch> for Translation {
    /// Collects without the bound; `remote_execute` re-checks it.
    fn from_iter<I: IntoIterator<Item = PointerPatch>>(iter: I) -> Self {
        Self {
            patches: iter.into_iter().collect(),
        }
    }
}
