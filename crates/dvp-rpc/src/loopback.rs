//! In-process loopback transport.
//!
//! Models a set of remote cores that live in the same process: each core has
//! its own remote address space, sees the *device* view of every mapped
//! plane, and runs functions from a shared firmware table.  Failure
//! injection hooks let callers simulate peer restarts, ordinary call
//! failures and refused reopens.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dvp_mem::PAGE_SIZE;

use crate::error::TransportError;
use crate::transport::{MappedRegion, Transport};
use crate::types::{RemoteCore, RpcParam};

const REMOTE_BASE: u64 = 0x8000_0000;

/// A function in the loopback firmware table.
pub type RemoteFn = Arc<dyn Fn(&RemoteMemory, &mut [RpcParam]) -> i32 + Send + Sync>;

// ---------------------------------------------------------------------------
// Remote memory view
// ---------------------------------------------------------------------------

/// The mappings visible to one remote core during a call.
#[derive(Debug, Clone, Default)]
pub struct RemoteMemory {
    regions: BTreeMap<u64, MappedRegion>,
}

impl RemoteMemory {
    /// Find the region containing `remote_addr` and the offset into it.
    pub fn region(&self, remote_addr: u64) -> Option<(&MappedRegion, usize)> {
        let (base, region) = self.regions.range(..=remote_addr).next_back()?;
        let offset = (remote_addr - base) as usize;
        (offset < region.size).then_some((region, offset))
    }

    /// Copy `len` bytes of the device view starting at `remote_addr`.
    pub fn read(&self, remote_addr: u64, len: usize) -> Option<Vec<u8>> {
        let (region, offset) = self.region(remote_addr)?;
        let end = offset.checked_add(len).filter(|end| *end <= region.size)?;
        Some(region.storage.device_read()[offset..end].to_vec())
    }

    /// Overwrite device bytes starting at `remote_addr`.
    pub fn write(&self, remote_addr: u64, bytes: &[u8]) -> bool {
        let Some((region, offset)) = self.region(remote_addr) else {
            return false;
        };
        let Some(end) = offset
            .checked_add(bytes.len())
            .filter(|end| *end <= region.size)
        else {
            return false;
        };
        region.storage.device_write()[offset..end].copy_from_slice(bytes);
        true
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RemoteSide {
    open: bool,
    memory: RemoteMemory,
    next_addr: u64,
}

#[derive(Default)]
struct LoopState {
    cores: HashMap<RemoteCore, RemoteSide>,
    functions: HashMap<u32, RemoteFn>,
    pending_restarts: u32,
    pending_failures: u32,
    refused_opens: u32,
    opens: u64,
    calls: u64,
}

/// In-process [`Transport`] implementation.
#[derive(Default)]
pub struct LoopbackTransport {
    state: Mutex<LoopState>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `f` as remote function `index` for every core.
    pub fn register_function(&self, index: u32, f: RemoteFn) {
        self.lock().functions.insert(index, f);
    }

    /// The next `count` calls fail as if the peer restarted mid-call.
    pub fn inject_peer_restarts(&self, count: u32) {
        self.lock().pending_restarts = count;
    }

    /// The next `count` calls fail with an ordinary transport error.
    pub fn inject_failures(&self, count: u32) {
        self.lock().pending_failures = count;
    }

    /// The next `count` open attempts are refused.
    pub fn refuse_opens(&self, count: u32) {
        self.lock().refused_opens = count;
    }

    /// Successful opens so far, across all cores.
    pub fn open_count(&self) -> u64 {
        self.lock().opens
    }

    /// Calls that reached a remote function.
    pub fn call_count(&self) -> u64 {
        self.lock().calls
    }

    /// Live remote mappings on `core`.
    pub fn mapping_count(&self, core: RemoteCore) -> usize {
        self.lock()
            .cores
            .get(&core)
            .map(|side| side.memory.len())
            .unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, LoopState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for LoopbackTransport {
    fn name(&self) -> &str {
        "loopback"
    }

    fn open(&self, core: RemoteCore) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.refused_opens > 0 {
            state.refused_opens -= 1;
            return Err(TransportError::Failed {
                reason: format!("{core} refused open"),
            });
        }
        state.opens += 1;
        state.cores.insert(
            core,
            RemoteSide {
                open: true,
                memory: RemoteMemory::default(),
                next_addr: REMOTE_BASE,
            },
        );
        tracing::trace!(%core, "loopback channel opened");
        Ok(())
    }

    fn close(&self, core: RemoteCore) {
        if let Some(side) = self.lock().cores.get_mut(&core) {
            side.open = false;
            side.memory = RemoteMemory::default();
        }
    }

    fn map(&self, core: RemoteCore, region: &MappedRegion) -> Result<u64, TransportError> {
        let mut state = self.lock();
        let side = state
            .cores
            .get_mut(&core)
            .filter(|side| side.open)
            .ok_or_else(|| TransportError::Failed {
                reason: format!("{core} is not open"),
            })?;
        let addr = side.next_addr;
        let window = region.size.div_ceil(PAGE_SIZE).max(1) * PAGE_SIZE + PAGE_SIZE;
        side.next_addr += window as u64;
        side.memory.regions.insert(addr, region.clone());
        Ok(addr)
    }

    fn unmap(&self, core: RemoteCore, remote_addr: u64) -> Result<(), TransportError> {
        let mut state = self.lock();
        state
            .cores
            .get_mut(&core)
            .and_then(|side| side.memory.regions.remove(&remote_addr))
            .map(|_| ())
            .ok_or_else(|| TransportError::Failed {
                reason: format!("{remote_addr:#x} is not mapped on {core}"),
            })
    }

    fn call(
        &self,
        core: RemoteCore,
        function: u32,
        params: &mut [RpcParam],
    ) -> Result<i32, TransportError> {
        let (f, memory) = {
            let mut state = self.lock();
            if state.pending_restarts > 0 {
                state.pending_restarts -= 1;
                if let Some(side) = state.cores.get_mut(&core) {
                    side.open = false;
                    side.memory = RemoteMemory::default();
                }
                return Err(TransportError::PeerRestarted);
            }
            if state.pending_failures > 0 {
                state.pending_failures -= 1;
                return Err(TransportError::Failed {
                    reason: "injected failure".into(),
                });
            }
            let memory = match state.cores.get(&core) {
                Some(side) if side.open => side.memory.clone(),
                _ => {
                    return Err(TransportError::Failed {
                        reason: format!("{core} is not open"),
                    });
                }
            };
            let f = state
                .functions
                .get(&function)
                .cloned()
                .ok_or_else(|| TransportError::Failed {
                    reason: format!("unknown remote function {function}"),
                })?;
            state.calls += 1;
            (f, memory)
        };
        Ok(f(&memory, params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dvp_mem::{MemType, MemoryManager, PlaneLayout};

    fn region_of(mem: &MemoryManager, len: u32) -> (dvp_mem::Buffer, MappedRegion) {
        let buffer = mem
            .calloc(MemType::Tiled1dUncached, &[PlaneLayout::linear(len, 1)])
            .unwrap();
        let plane = buffer.plane(0).unwrap().clone();
        let region = MappedRegion {
            local_addr: plane.addr(),
            size: plane.size(),
            mem_type: plane.mem_type(),
            handle: plane.handle(),
            storage: Arc::clone(plane.storage()),
        };
        (buffer, region)
    }

    #[test]
    fn map_and_call_reads_remote_memory() {
        let mem = MemoryManager::default();
        let transport = LoopbackTransport::new();
        let core = RemoteCore(1);
        transport.register_function(
            7,
            Arc::new(|memory, params| {
                let addr = params[0].read_pointer(0).unwrap_or(0);
                memory.read(addr, 1).map(|b| b[0] as i32).unwrap_or(-1)
            }),
        );
        transport.open(core).unwrap();

        let (buffer, region) = region_of(&mem, 16);
        buffer.plane(0).unwrap().storage().write()[0] = 9;
        let remote = transport.map(core, &region).unwrap();
        assert!(remote >= REMOTE_BASE);

        let mut params = [RpcParam::pointer(crate::Direction::ReadOnly, remote)];
        assert_eq!(transport.call(core, 7, &mut params), Ok(9));
        assert_eq!(transport.call_count(), 1);
    }

    #[test]
    fn peer_restart_drops_mappings() {
        let mem = MemoryManager::default();
        let transport = LoopbackTransport::new();
        let core = RemoteCore(3);
        transport.register_function(0, Arc::new(|_, _| 0));
        transport.open(core).unwrap();
        let (_buffer, region) = region_of(&mem, 8);
        transport.map(core, &region).unwrap();
        assert_eq!(transport.mapping_count(core), 1);

        transport.inject_peer_restarts(1);
        assert_eq!(
            transport.call(core, 0, &mut []),
            Err(TransportError::PeerRestarted)
        );
        assert_eq!(transport.mapping_count(core), 0);
        assert!(transport.call(core, 0, &mut []).is_err());

        transport.open(core).unwrap();
        assert_eq!(transport.call(core, 0, &mut []), Ok(0));
    }

    #[test]
    fn refused_opens_are_counted_down() {
        let transport = LoopbackTransport::new();
        transport.refuse_opens(2);
        assert!(transport.open(RemoteCore(0)).is_err());
        assert!(transport.open(RemoteCore(0)).is_err());
        assert!(transport.open(RemoteCore(0)).is_ok());
        assert_eq!(transport.open_count(), 1);
    }

    #[test]
    fn unknown_function_fails() {
        let transport = LoopbackTransport::new();
        transport.open(RemoteCore(0)).unwrap();
        assert!(matches!(
            transport.call(RemoteCore(0), 99, &mut []),
            Err(TransportError::Failed { .. })
        ));
    }

    #[test]
    fn remote_write_respects_bounds() {
        let mem = MemoryManager::default();
        let transport = LoopbackTransport::new();
        let core = RemoteCore(0);
        transport.open(core).unwrap();
        let (buffer, region) = region_of(&mem, 4);
        let remote = transport.map(core, &region).unwrap();

        let mut memory = RemoteMemory::default();
        memory.regions.insert(remote, region);
        assert!(memory.write(remote + 2, &[1, 2]));
        assert!(!memory.write(remote + PAGE_SIZE as u64 - 1, &[1, 2]));
        assert_eq!(buffer.plane(0).unwrap().storage().read()[3], 2);
    }
}
