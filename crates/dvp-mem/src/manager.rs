//! Typed allocator, sharer and importer.
//!
//! The [`MemoryManager`] hands out [`Buffer`]s of a given [`MemType`],
//! assigns each plane a page-aligned local address in its own domain, and
//! keeps an address registry so other subsystems (the RPC context in
//! particular) can learn a buffer's identity from a raw address.
//!
//! Addresses are never reused within a domain, so a stale translation can
//! never alias a later allocation.
//!
//! Sharing moves planes out of the sender's domain into a [`ShareBroker`];
//! importing in another domain (another `MemoryManager` built on the same
//! broker) takes them back out and maps them at fresh local addresses.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::Serialize;

use crate::buffer::{Buffer, Plane, PlaneStorage, SharedBuffer};
use crate::config::MemoryConfig;
use crate::error::{MemError, Result};
use crate::types::{MAX_PLANES, MemHandle, MemType, PAGE_SIZE, PlaneLayout, SharedFd, align_up};

/// Distance between the address windows of two domains.
const DOMAIN_WINDOW: u64 = 1 << 40;
const ADDRESS_BASE: u64 = 0x1000_0000;

static NEXT_DOMAIN: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// Share broker
// ---------------------------------------------------------------------------

struct Exported {
    mem_type: MemType,
    storage: Arc<PlaneStorage>,
}

/// Holds exported planes between `share` and `import`.
///
/// Stands in for the kernel object table that backs transferable file
/// descriptors: every memory manager built on the same broker can import
/// what the others export.
#[derive(Clone, Default)]
pub struct ShareBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Default)]
struct BrokerInner {
    exported: Mutex<HashMap<SharedFd, Exported>>,
    next_fd: AtomicU64,
}

impl ShareBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of descriptors exported but not yet imported.
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SharedFd, Exported>> {
        self.inner
            .exported
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn export(&self, mem_type: MemType, storage: Arc<PlaneStorage>) -> SharedFd {
        let fd = SharedFd(self.inner.next_fd.fetch_add(1, Ordering::Relaxed) + 3);
        self.lock().insert(fd, Exported { mem_type, storage });
        fd
    }

    /// Remove every descriptor in `fds`.  All present descriptors are
    /// closed even when one is missing.
    fn take_all(&self, fds: &[SharedFd]) -> Result<Vec<Exported>> {
        let mut table = self.lock();
        let mut taken = Vec::with_capacity(fds.len());
        let mut missing = None;
        for fd in fds {
            match table.remove(fd) {
                Some(exported) => taken.push(exported),
                None => missing = missing.or(Some(*fd)),
            }
        }
        match missing {
            Some(fd) => Err(MemError::UnknownDescriptor { fd }),
            None => Ok(taken),
        }
    }
}

// ---------------------------------------------------------------------------
// Sharing errors
// ---------------------------------------------------------------------------

/// A failed `share`, handing the untouched buffer back to its owner.
#[derive(Debug, thiserror::Error)]
#[error("share failed: {error}")]
pub struct ShareError {
    #[source]
    pub error: MemError,
    buffer: Buffer,
}

impl ShareError {
    pub fn into_buffer(self) -> Buffer {
        self.buffer
    }
}

// ---------------------------------------------------------------------------
// Memory manager
// ---------------------------------------------------------------------------

/// Snapshot of allocator usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemStats {
    pub live_planes: usize,
    pub live_bytes: usize,
}

/// Typed allocator for one memory domain.
///
/// Cheaply cloneable (`Arc`-backed) and `Send + Sync`.
#[derive(Clone)]
pub struct MemoryManager {
    inner: Arc<Inner>,
}

struct Inner {
    domain: u64,
    config: MemoryConfig,
    broker: ShareBroker,
    /// Live planes keyed by base address.
    planes: RwLock<BTreeMap<u64, Plane>>,
    next_addr: AtomicU64,
    next_handle: AtomicU64,
    live_bytes: AtomicUsize,
}

impl MemoryManager {
    /// Create a manager with its own private broker.
    pub fn new(config: MemoryConfig) -> Self {
        Self::with_broker(config, ShareBroker::new())
    }

    /// Create a manager that exchanges shared buffers through `broker`.
    pub fn with_broker(config: MemoryConfig, broker: ShareBroker) -> Self {
        let domain = NEXT_DOMAIN.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(domain, limit = ?config.limit_bytes, "memory manager created");
        Self {
            inner: Arc::new(Inner {
                domain,
                config,
                broker,
                planes: RwLock::new(BTreeMap::new()),
                next_addr: AtomicU64::new(ADDRESS_BASE + domain * DOMAIN_WINDOW),
                next_handle: AtomicU64::new(1),
                live_bytes: AtomicUsize::new(0),
            }),
        }
    }

    pub fn broker(&self) -> &ShareBroker {
        &self.inner.broker
    }

    pub fn stats(&self) -> MemStats {
        MemStats {
            live_planes: self.read_planes().len(),
            live_bytes: self.inner.live_bytes.load(Ordering::Acquire),
        }
    }

    /// Allocate `layouts.len()` zeroed planes of `mem_type`.
    ///
    /// Atomic: if any plane fails, every plane already mapped by this call is
    /// released before the error is returned.
    pub fn calloc(&self, mem_type: MemType, layouts: &[PlaneLayout]) -> Result<Buffer> {
        check_plane_count(layouts.len())?;
        let sizes = layouts
            .iter()
            .enumerate()
            .map(|(i, layout)| {
                layout.validate(i)?;
                mem_type
                    .allocation_size(layout)
                    .ok_or_else(|| MemError::InvalidLayout {
                        plane: i,
                        reason: format!("{mem_type} allocation size overflows"),
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut planes: Vec<Plane> = Vec::with_capacity(layouts.len());
        for (i, (layout, size)) in layouts.iter().zip(sizes).enumerate() {
            let storage = self.reserve(i, size).and_then(|()| {
                PlaneStorage::zeroed(i, size, mem_type.is_cached()).inspect_err(|_| {
                    self.inner.live_bytes.fetch_sub(size, Ordering::AcqRel);
                })
            });
            match storage {
                Ok(storage) => planes.push(self.map(mem_type, *layout, Arc::new(storage))),
                Err(err) => {
                    for plane in &planes {
                        self.unmap(plane);
                    }
                    tracing::warn!(%mem_type, plane = i, error = %err, "allocation rolled back");
                    return Err(err);
                }
            }
        }

        tracing::debug!(
            %mem_type,
            planes = planes.len(),
            bytes = planes.iter().map(Plane::size).sum::<usize>(),
            "buffer allocated"
        );

        Ok(Buffer {
            domain: self.inner.domain,
            mem_type,
            planes,
        })
    }

    /// Release every plane of `buffer`.
    pub fn free(&self, buffer: Buffer) -> Result<()> {
        self.check_owner(&buffer)?;
        for plane in &buffer.planes {
            self.unmap(plane);
        }
        tracing::debug!(mem_type = %buffer.mem_type, planes = buffer.planes.len(), "buffer freed");
        Ok(())
    }

    /// Export `buffer` as transferable descriptors.
    ///
    /// On success the buffer leaves this domain: its addresses are unmapped
    /// here and only the returned descriptors refer to the storage.
    pub fn share(&self, buffer: Buffer) -> std::result::Result<SharedBuffer, ShareError> {
        let mem_type = buffer.mem_type;
        let check = self.check_owner(&buffer).and_then(|()| {
            if mem_type.is_shareable() {
                Ok(())
            } else {
                Err(MemError::NotShareable { mem_type })
            }
        });
        if let Err(error) = check {
            return Err(ShareError { error, buffer });
        }

        let fds = buffer
            .planes
            .iter()
            .map(|plane| {
                self.unmap(plane);
                self.inner
                    .broker
                    .export(mem_type, Arc::clone(&plane.storage))
            })
            .collect::<Vec<_>>();

        tracing::debug!(%mem_type, ?fds, "buffer shared");
        Ok(SharedBuffer { mem_type, fds })
    }

    /// Map descriptors produced by `share` into this domain.
    ///
    /// The descriptors are consumed whether or not the import succeeds.
    pub fn import(
        &self,
        mem_type: MemType,
        layouts: &[PlaneLayout],
        shared: SharedBuffer,
    ) -> Result<Buffer> {
        let exported = self.inner.broker.take_all(&shared.fds)?;
        if shared.mem_type != mem_type {
            return Err(MemError::TypeMismatch {
                expected: mem_type,
                found: shared.mem_type,
            });
        }
        check_plane_count(layouts.len())?;
        if layouts.len() != exported.len() {
            return Err(MemError::PlaneCount {
                count: exported.len(),
            });
        }

        for (i, (layout, exp)) in layouts.iter().zip(&exported).enumerate() {
            layout.validate(i)?;
            if exp.mem_type != mem_type {
                return Err(MemError::TypeMismatch {
                    expected: mem_type,
                    found: exp.mem_type,
                });
            }
            let needed = mem_type
                .plane_extent(layout)
                .ok_or_else(|| MemError::InvalidLayout {
                    plane: i,
                    reason: format!("{mem_type} plane extent overflows"),
                })?;
            if needed > exp.storage.len() {
                return Err(MemError::LayoutMismatch {
                    plane: i,
                    needed,
                    available: exp.storage.len(),
                });
            }
        }

        let planes = layouts
            .iter()
            .zip(exported)
            .map(|(layout, exp)| {
                self.inner
                    .live_bytes
                    .fetch_add(exp.storage.len(), Ordering::AcqRel);
                self.map(mem_type, *layout, exp.storage)
            })
            .collect::<Vec<_>>();

        tracing::debug!(%mem_type, planes = planes.len(), "buffer imported");
        Ok(Buffer {
            domain: self.inner.domain,
            mem_type,
            planes,
        })
    }

    /// Publish the CPU view of every plane to the device view.
    ///
    /// Returns the number of bytes copied (zero for uncached types).
    pub fn flush(&self, buffer: &Buffer) -> Result<usize> {
        self.check_owner(buffer)?;
        let bytes = buffer
            .planes
            .iter()
            .map(|p| p.storage.flush_range(p.used_range()))
            .sum();
        tracing::trace!(mem_type = %buffer.mem_type, bytes, "buffer flushed");
        Ok(bytes)
    }

    /// Pull the device view of every plane into the CPU view.
    pub fn invalidate(&self, buffer: &Buffer) -> Result<usize> {
        self.check_owner(buffer)?;
        let bytes = buffer
            .planes
            .iter()
            .map(|p| p.storage.invalidate_range(p.used_range()))
            .sum();
        tracing::trace!(mem_type = %buffer.mem_type, bytes, "buffer invalidated");
        Ok(bytes)
    }

    /// Flush exactly `len` bytes starting at local address `addr`.
    pub fn flush_range(&self, addr: u64, len: usize) -> Result<usize> {
        let (plane, range) = self.resolve(addr, len)?;
        Ok(plane.storage.flush_range(range))
    }

    /// Invalidate exactly `len` bytes starting at local address `addr`.
    pub fn invalidate_range(&self, addr: u64, len: usize) -> Result<usize> {
        let (plane, range) = self.resolve(addr, len)?;
        Ok(plane.storage.invalidate_range(range))
    }

    /// Find the live plane containing `addr`.
    pub fn lookup(&self, addr: u64) -> Option<Plane> {
        let planes = self.read_planes();
        let (_, plane) = planes.range(..=addr).next_back()?;
        (addr < plane.addr + plane.size() as u64).then(|| plane.clone())
    }

    /// Find the plane containing `addr..addr + len` and the byte range
    /// within it.
    pub fn resolve(&self, addr: u64, len: usize) -> Result<(Plane, Range<usize>)> {
        let plane = self.lookup(addr).ok_or(MemError::UnknownAddress { addr })?;
        let start = (addr - plane.addr) as usize;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= plane.size())
            .ok_or(MemError::OutOfBounds { addr, len })?;
        Ok((plane, start..end))
    }

    // -- Private helpers ----------------------------------------------------

    fn read_planes(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<u64, Plane>> {
        self.inner
            .planes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn check_owner(&self, buffer: &Buffer) -> Result<()> {
        if buffer.domain == self.inner.domain {
            Ok(())
        } else {
            Err(MemError::ForeignBuffer)
        }
    }

    /// Charge `size` bytes against the configured limit.
    fn reserve(&self, plane: usize, size: usize) -> Result<()> {
        let Some(limit) = self.inner.config.limit_bytes else {
            self.inner.live_bytes.fetch_add(size, Ordering::AcqRel);
            return Ok(());
        };
        self.inner
            .live_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                live.checked_add(size).filter(|total| *total <= limit)
            })
            .map(|_| ())
            .map_err(|live| MemError::OutOfMemory {
                plane,
                requested: size,
                available: limit.saturating_sub(live),
            })
    }

    fn map(&self, mem_type: MemType, layout: PlaneLayout, storage: Arc<PlaneStorage>) -> Plane {
        let window = align_up(storage.len().max(1), PAGE_SIZE) + PAGE_SIZE;
        let addr = self
            .inner
            .next_addr
            .fetch_add(window as u64, Ordering::Relaxed);
        let handle = MemHandle(self.inner.next_handle.fetch_add(1, Ordering::Relaxed));
        let plane = Plane {
            addr,
            handle,
            layout,
            stride: mem_type.stride_for(&layout),
            mem_type,
            storage,
        };
        self.inner
            .planes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(addr, plane.clone());
        tracing::trace!(addr = format_args!("{addr:#x}"), %handle, %mem_type, "plane mapped");
        plane
    }

    fn unmap(&self, plane: &Plane) {
        let removed = self
            .inner
            .planes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&plane.addr);
        if removed.is_some() {
            self.inner
                .live_bytes
                .fetch_sub(plane.size(), Ordering::AcqRel);
        } else {
            tracing::warn!(addr = format_args!("{:#x}", plane.addr), "unmap of unknown plane");
        }
    }
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}

fn check_plane_count(count: usize) -> Result<()> {
    if (1..=MAX_PLANES).contains(&count) {
        Ok(())
    } else {
        Err(MemError::PlaneCount { count })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::nv12;

    #[test]
    fn calloc_nv12_frame() {
        let mem = MemoryManager::default();
        let buffer = mem
            .calloc(MemType::Virtual, &nv12(320, 240))
            .expect("calloc should succeed");

        assert_eq!(buffer.plane_count(), 2);
        let y = buffer.plane(0).unwrap();
        let uv = buffer.plane(1).unwrap();
        assert_eq!(y.size(), 320 * 240);
        assert_eq!(uv.size(), 320 * 120);
        assert!(y.stride() >= 320);
        assert_eq!(y.stride(), uv.stride());
        assert_ne!(y.addr(), 0);
        assert_ne!(y.addr(), uv.addr());
        assert!(y.storage().read().iter().all(|b| *b == 0));
    }

    #[test]
    fn calloc_rolls_back_on_failure() {
        let mem = MemoryManager::new(MemoryConfig::new().with_limit_bytes(100_000));
        let result = mem.calloc(
            MemType::Virtual,
            &[
                PlaneLayout::new(320, 240, 1),
                PlaneLayout::new(320, 240, 1),
            ],
        );

        assert!(matches!(result, Err(MemError::OutOfMemory { plane: 1, .. })));
        assert_eq!(mem.stats(), MemStats::default());
    }

    #[test]
    fn calloc_rejects_layouts_too_large_to_address() {
        let mem = MemoryManager::default();
        let huge = PlaneLayout::new(u32::MAX, u32::MAX, 4);
        for mem_type in [MemType::Virtual, MemType::Tiled2dCached] {
            assert!(matches!(
                mem.calloc(mem_type, &[huge]),
                Err(MemError::InvalidLayout { plane: 0, .. })
            ));
        }
        assert_eq!(mem.stats(), MemStats::default());
    }

    #[test]
    fn calloc_reports_host_exhaustion_and_rolls_back() {
        let mem = MemoryManager::default();
        let result = mem.calloc(
            MemType::Virtual,
            &[
                PlaneLayout::new(16, 16, 1),
                PlaneLayout::new(u32::MAX, u32::MAX, 1),
            ],
        );

        assert!(matches!(result, Err(MemError::OutOfMemory { plane: 1, .. })));
        assert_eq!(mem.stats(), MemStats::default());
    }

    #[test]
    fn calloc_rejects_bad_plane_counts() {
        let mem = MemoryManager::default();
        assert!(matches!(
            mem.calloc(MemType::Virtual, &[]),
            Err(MemError::PlaneCount { count: 0 })
        ));
        let five = [PlaneLayout::new(4, 4, 1); 5];
        assert!(matches!(
            mem.calloc(MemType::Virtual, &five),
            Err(MemError::PlaneCount { count: 5 })
        ));
    }

    #[test]
    fn free_releases_accounting() {
        let mem = MemoryManager::default();
        let buffer = mem
            .calloc(MemType::Tiled1dCached, &[PlaneLayout::linear(10, 1)])
            .unwrap();
        assert_eq!(mem.stats().live_planes, 1);
        assert_eq!(mem.stats().live_bytes, PAGE_SIZE);

        mem.free(buffer).expect("free");
        assert_eq!(mem.stats(), MemStats::default());
    }

    #[test]
    fn free_rejects_foreign_buffer() {
        let a = MemoryManager::default();
        let b = MemoryManager::default();
        let buffer = a.calloc(MemType::Virtual, &[PlaneLayout::linear(8, 1)]).unwrap();
        assert!(matches!(b.free(buffer), Err(MemError::ForeignBuffer)));
    }

    #[test]
    fn lookup_finds_interior_addresses() {
        let mem = MemoryManager::default();
        let buffer = mem
            .calloc(MemType::Virtual, &[PlaneLayout::new(16, 16, 1)])
            .unwrap();
        let base = buffer.plane(0).unwrap().addr();

        assert_eq!(mem.lookup(base + 10).map(|p| p.addr()), Some(base));
        assert!(mem.lookup(base + 256).is_none());
        assert!(matches!(
            mem.resolve(base + 250, 10),
            Err(MemError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn virtual_memory_cannot_be_shared() {
        let mem = MemoryManager::default();
        let buffer = mem.calloc(MemType::Virtual, &[PlaneLayout::linear(8, 1)]).unwrap();
        let err = mem.share(buffer).expect_err("virtual is private");
        assert!(matches!(err.error, MemError::NotShareable { .. }));
        assert_eq!(
            err.to_string(),
            "share failed: memory type virtual does not support sharing"
        );
        let source = std::error::Error::source(&err).expect("share error has a source");
        assert!(source.is::<MemError>());

        // The buffer comes back intact and can still be freed.
        let buffer = err.into_buffer();
        mem.free(buffer).expect("free after failed share");
    }

    #[test]
    fn share_then_import_across_domains() {
        let broker = ShareBroker::new();
        let sender = MemoryManager::with_broker(MemoryConfig::default(), broker.clone());
        let receiver = MemoryManager::with_broker(MemoryConfig::default(), broker.clone());

        let layouts = nv12(64, 32);
        let buffer = sender.calloc(MemType::SharedVirtual, &layouts).unwrap();
        buffer.plane(0).unwrap().storage().write()[5] = 42;
        let sender_addr = buffer.plane(0).unwrap().addr();

        let shared = sender.share(buffer).expect("share");
        assert_eq!(shared.fds.len(), 2);
        assert_eq!(broker.pending(), 2);
        assert_eq!(sender.stats().live_planes, 0);

        let imported = receiver
            .import(MemType::SharedVirtual, &layouts, shared)
            .expect("import");
        assert_eq!(broker.pending(), 0);
        assert_eq!(imported.plane(0).unwrap().storage().read()[5], 42);
        assert_ne!(imported.plane(0).unwrap().addr(), sender_addr);
        assert_eq!(receiver.stats().live_planes, 2);
    }

    #[test]
    fn import_consumes_descriptors_once() {
        let broker = ShareBroker::new();
        let a = MemoryManager::with_broker(MemoryConfig::default(), broker.clone());
        let b = MemoryManager::with_broker(MemoryConfig::default(), broker);
        let layouts = [PlaneLayout::linear(32, 1)];

        let shared = a
            .share(a.calloc(MemType::Tiled1dUncached, &layouts).unwrap())
            .unwrap();
        let again = shared.clone();

        b.import(MemType::Tiled1dUncached, &layouts, shared).unwrap();
        assert!(matches!(
            b.import(MemType::Tiled1dUncached, &layouts, again),
            Err(MemError::UnknownDescriptor { .. })
        ));
    }

    #[test]
    fn import_checks_type_and_size() {
        let broker = ShareBroker::new();
        let a = MemoryManager::with_broker(MemoryConfig::default(), broker.clone());
        let b = MemoryManager::with_broker(MemoryConfig::default(), broker);

        let small = [PlaneLayout::new(8, 8, 1)];
        let shared = a.share(a.calloc(MemType::SharedVirtual, &small).unwrap()).unwrap();
        assert!(matches!(
            b.import(MemType::Tiled1dCached, &small, shared),
            Err(MemError::TypeMismatch { .. })
        ));

        let shared = a.share(a.calloc(MemType::SharedVirtual, &small).unwrap()).unwrap();
        assert!(matches!(
            b.import(MemType::SharedVirtual, &[PlaneLayout::new(64, 64, 1)], shared),
            Err(MemError::LayoutMismatch { .. })
        ));

        let shared = a.share(a.calloc(MemType::SharedVirtual, &small).unwrap()).unwrap();
        assert!(matches!(
            b.import(
                MemType::SharedVirtual,
                &[PlaneLayout::new(u32::MAX, u32::MAX, 4)],
                shared
            ),
            Err(MemError::InvalidLayout { plane: 0, .. })
        ));
        assert_eq!(b.stats().live_planes, 0);
    }

    #[test]
    fn flush_and_invalidate_are_noops_when_uncached() {
        let mem = MemoryManager::default();
        let buffer = mem
            .calloc(MemType::Tiled2dUncached, &[PlaneLayout::new(16, 4, 1)])
            .unwrap();
        assert_eq!(mem.flush(&buffer).unwrap(), 0);
        assert_eq!(mem.invalidate(&buffer).unwrap(), 0);
    }

    #[test]
    fn flush_covers_exactly_the_used_rows() {
        let mem = MemoryManager::default();
        let buffer = mem
            .calloc(MemType::Tiled2dCached, &[PlaneLayout::new(16, 4, 1)])
            .unwrap();
        let plane = buffer.plane(0).unwrap();
        plane.storage().write()[plane.stride() * 3 + 15] = 1;

        let bytes = mem.flush(&buffer).unwrap();
        assert_eq!(bytes, plane.stride() * 3 + 16);
        assert_eq!(plane.storage().device_read()[plane.stride() * 3 + 15], 1);
    }

    #[test]
    fn range_maintenance_by_address() {
        let mem = MemoryManager::default();
        let buffer = mem
            .calloc(MemType::Tiled1dCached, &[PlaneLayout::linear(64, 1)])
            .unwrap();
        let plane = buffer.plane(0).unwrap();
        plane.storage().device_write()[10] = 5;

        assert_eq!(mem.invalidate_range(plane.addr() + 8, 4).unwrap(), 4);
        assert_eq!(plane.storage().read()[10], 5);
        assert!(matches!(
            mem.flush_range(1, 4),
            Err(MemError::UnknownAddress { addr: 1 })
        ));
    }
}
