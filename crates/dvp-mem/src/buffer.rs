//! Owned buffer descriptors and their backing plane storage.
//!
//! A [`Buffer`] bundles every plane of one allocation together with its
//! address, handle, stride and memory type.  It is deliberately not `Clone`:
//! exactly one owner may free or share it.  Kernels that need to read or
//! write a plane hold a cheap [`Plane`] clone instead, which keeps the
//! storage alive but carries no ownership of the allocation.
//!
//! Cached memory types keep two views of each plane: the *local* view the
//! CPU reads and writes, and the *device* view that remote cores observe.
//! `flush` publishes local bytes to the device view, `invalidate` pulls
//! device bytes back.  Uncached types have a single view shared by both.

use std::ops::Range;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::error::{MemError, Result};
use crate::types::{MemHandle, MemType, PlaneLayout, SharedFd};

// ---------------------------------------------------------------------------
// Plane storage
// ---------------------------------------------------------------------------

/// Bytes backing one plane.
#[derive(Debug)]
pub struct PlaneStorage {
    local: RwLock<Vec<u8>>,
    device: Option<RwLock<Vec<u8>>>,
    len: usize,
}

impl PlaneStorage {
    /// Zero-filled storage for plane `plane`, failing with
    /// [`MemError::OutOfMemory`] when the host cannot provide `len` bytes.
    pub(crate) fn zeroed(plane: usize, len: usize, cached: bool) -> Result<Self> {
        let device = if cached {
            Some(RwLock::new(zeroed_vec(plane, len)?))
        } else {
            None
        };
        Ok(Self {
            local: RwLock::new(zeroed_vec(plane, len)?),
            device,
            len,
        })
    }

    /// Allocated length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the plane has zero length.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the plane keeps a separate device view.
    pub fn is_cached(&self) -> bool {
        self.device.is_some()
    }

    /// Read the CPU-side bytes.
    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.local.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write the CPU-side bytes.
    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.local.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read the bytes a remote core observes.
    pub fn device_read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.device
            .as_ref()
            .unwrap_or(&self.local)
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Write the bytes a remote core observes.
    pub fn device_write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.device
            .as_ref()
            .unwrap_or(&self.local)
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy `range` from the local view to the device view.
    ///
    /// Locks are always taken local first, then device.
    pub fn flush_range(&self, range: Range<usize>) -> usize {
        let Some(device) = &self.device else {
            return 0;
        };
        let local = self.read();
        let mut device = device.write().unwrap_or_else(PoisonError::into_inner);
        device[range.clone()].copy_from_slice(&local[range.clone()]);
        range.len()
    }

    /// Copy `range` from the device view to the local view.
    pub fn invalidate_range(&self, range: Range<usize>) -> usize {
        let Some(device) = &self.device else {
            return 0;
        };
        let mut local = self.write();
        let device = device.read().unwrap_or_else(PoisonError::into_inner);
        local[range.clone()].copy_from_slice(&device[range.clone()]);
        range.len()
    }
}

fn zeroed_vec(plane: usize, len: usize) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    bytes
        .try_reserve_exact(len)
        .map_err(|_| MemError::OutOfMemory {
            plane,
            requested: len,
            available: 0,
        })?;
    bytes.resize(len, 0);
    Ok(bytes)
}

// ---------------------------------------------------------------------------
// Planes and buffers
// ---------------------------------------------------------------------------

/// One plane of a buffer: its local address, handle, geometry and storage.
#[derive(Debug, Clone)]
pub struct Plane {
    pub(crate) addr: u64,
    pub(crate) handle: MemHandle,
    pub(crate) layout: PlaneLayout,
    pub(crate) stride: usize,
    pub(crate) mem_type: MemType,
    pub(crate) storage: Arc<PlaneStorage>,
}

impl Plane {
    /// Local address of the first byte.
    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn handle(&self) -> MemHandle {
        self.handle
    }

    pub fn layout(&self) -> PlaneLayout {
        self.layout
    }

    /// Bytes between the starts of consecutive rows.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Allocated bytes, including row and page padding.
    pub fn size(&self) -> usize {
        self.storage.len()
    }

    pub fn mem_type(&self) -> MemType {
        self.mem_type
    }

    pub fn storage(&self) -> &Arc<PlaneStorage> {
        &self.storage
    }

    /// Byte range touched by the plane's rows (excludes trailing padding).
    pub fn used_range(&self) -> Range<usize> {
        let rows = self.layout.rows() as usize;
        if rows == 0 {
            return 0..0;
        }
        0..(self.stride * (rows - 1) + self.layout.row_bytes())
    }
}

/// Owned descriptor for the planes of one allocation or import.
#[derive(Debug)]
pub struct Buffer {
    pub(crate) domain: u64,
    pub(crate) mem_type: MemType,
    pub(crate) planes: Vec<Plane>,
}

impl Buffer {
    pub fn mem_type(&self) -> MemType {
        self.mem_type
    }

    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    pub fn plane(&self, index: usize) -> Option<&Plane> {
        self.planes.get(index)
    }

    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }

    /// Total allocated bytes across all planes.
    pub fn total_size(&self) -> usize {
        self.planes.iter().map(Plane::size).sum()
    }
}

/// Transferable form of a shared buffer: one descriptor per plane.
///
/// Produced by consuming a [`Buffer`] in `share`; consumed by `import` in the
/// receiving domain.  It carries no pointers and may be serialized across a
/// process boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedBuffer {
    pub mem_type: MemType,
    pub fds: Vec<SharedFd>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreservable_storage_is_out_of_memory() {
        let err = PlaneStorage::zeroed(2, usize::MAX, false).unwrap_err();
        assert!(matches!(
            err,
            MemError::OutOfMemory {
                plane: 2,
                requested: usize::MAX,
                ..
            }
        ));
    }

    #[test]
    fn uncached_views_alias() {
        let storage = PlaneStorage::zeroed(0, 8, false).unwrap();
        storage.write()[3] = 7;
        assert_eq!(storage.device_read()[3], 7);
        assert_eq!(storage.flush_range(0..8), 0);
    }

    #[test]
    fn cached_views_diverge_until_flush() {
        let storage = PlaneStorage::zeroed(0, 8, true).unwrap();
        storage.write()[0..4].copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(&storage.device_read()[0..4], &[0, 0, 0, 0]);

        assert_eq!(storage.flush_range(0..2), 2);
        assert_eq!(&storage.device_read()[0..4], &[1, 2, 0, 0]);
    }

    #[test]
    fn invalidate_pulls_device_bytes() {
        let storage = PlaneStorage::zeroed(0, 4, true).unwrap();
        storage.device_write().copy_from_slice(&[9, 9, 9, 9]);
        assert_eq!(storage.read()[0], 0);

        storage.invalidate_range(1..3);
        assert_eq!(&storage.read()[..], &[0, 9, 9, 0]);
    }

    #[test]
    fn shared_buffer_serializes() {
        let shared = SharedBuffer {
            mem_type: MemType::SharedVirtual,
            fds: vec![SharedFd(3), SharedFd(4)],
        };
        let json = serde_json::to_string(&shared).unwrap();
        let back: SharedBuffer = serde_json::from_str(&json).unwrap();
        assert_eq!(back, shared);
    }
}
