//! Memory types, plane layouts and opaque handles.

use serde::{Deserialize, Serialize};

use crate::error::{MemError, Result};

/// Most planes a single allocation may carry (e.g. Y, U, V, alpha).
pub const MAX_PLANES: usize = 4;

/// Page granularity used for address assignment and tiled sizing.
pub const PAGE_SIZE: usize = 4096;

/// Row alignment of 2D tiled and accelerator containers.
pub const TILER_STRIDE_ALIGN: usize = 4096;

// ---------------------------------------------------------------------------
// Memory types
// ---------------------------------------------------------------------------

/// Selects the allocation and caching backend of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemType {
    /// Plain process-private virtual memory.
    Virtual,
    /// Linear tiler memory, CPU cached.
    Tiled1dCached,
    /// Linear tiler memory, CPU uncached.
    Tiled1dUncached,
    /// 2D tiler container, CPU cached.
    Tiled2dCached,
    /// 2D tiler container, CPU uncached.
    Tiled2dUncached,
    /// Accelerator-owned 2D memory, never cached on the CPU.
    Accel2dUncached,
    /// OS-shared virtual memory, CPU cached.
    SharedVirtual,
}

impl MemType {
    /// Every memory type, in declaration order.
    pub const ALL: [MemType; 7] = [
        MemType::Virtual,
        MemType::Tiled1dCached,
        MemType::Tiled1dUncached,
        MemType::Tiled2dCached,
        MemType::Tiled2dUncached,
        MemType::Accel2dUncached,
        MemType::SharedVirtual,
    ];

    /// Whether the CPU caches this memory, i.e. whether flush/invalidate
    /// actually do anything.
    pub fn is_cached(self) -> bool {
        matches!(
            self,
            Self::Virtual | Self::Tiled1dCached | Self::Tiled2dCached | Self::SharedVirtual
        )
    }

    /// Whether buffers of this type can be exported with `share`.
    pub fn is_shareable(self) -> bool {
        !matches!(self, Self::Virtual)
    }

    /// Whether rows are padded to the 2D container stride.
    pub fn is_2d(self) -> bool {
        matches!(
            self,
            Self::Tiled2dCached | Self::Tiled2dUncached | Self::Accel2dUncached
        )
    }

    /// Byte stride of one row of the given layout in this memory type.
    pub fn stride_for(self, layout: &PlaneLayout) -> usize {
        let row = layout.row_bytes();
        if self.is_2d() {
            checked_align_up(row, TILER_STRIDE_ALIGN).unwrap_or(usize::MAX)
        } else {
            row
        }
    }

    /// Bytes spanned by every row of the layout at this type's stride, or
    /// `None` if that does not fit in `usize`.
    pub fn plane_extent(self, layout: &PlaneLayout) -> Option<usize> {
        self.stride_for(layout).checked_mul(layout.rows() as usize)
    }

    /// Bytes actually reserved for one plane of the given layout, or `None`
    /// if the size overflows.
    pub fn allocation_size(self, layout: &PlaneLayout) -> Option<usize> {
        let bytes = self.plane_extent(layout)?;
        match self {
            Self::Virtual | Self::SharedVirtual => Some(bytes),
            _ => checked_align_up(bytes, PAGE_SIZE),
        }
    }
}

impl std::fmt::Display for MemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Virtual => "virtual",
            Self::Tiled1dCached => "tiled1d-cached",
            Self::Tiled1dUncached => "tiled1d-uncached",
            Self::Tiled2dCached => "tiled2d-cached",
            Self::Tiled2dUncached => "tiled2d-uncached",
            Self::Accel2dUncached => "accel2d-uncached",
            Self::SharedVirtual => "shared-virtual",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Plane layouts
// ---------------------------------------------------------------------------

/// Dimensions of one plane.
///
/// A sub-sampled plane keeps the full image `width`/`height` and divides by
/// `x_scale`/`y_scale`; its packed size is
/// `(width / x_scale) * (height / y_scale) * bytes_per_element`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaneLayout {
    pub width: u32,
    pub height: u32,
    pub bytes_per_element: u32,
    pub x_scale: u32,
    pub y_scale: u32,
}

impl PlaneLayout {
    /// A full-resolution plane.
    pub fn new(width: u32, height: u32, bytes_per_element: u32) -> Self {
        Self {
            width,
            height,
            bytes_per_element,
            x_scale: 1,
            y_scale: 1,
        }
    }

    /// A one-dimensional plane of `len` elements.
    pub fn linear(len: u32, bytes_per_element: u32) -> Self {
        Self::new(len, 1, bytes_per_element)
    }

    /// Sub-sample this plane by the given factors.
    pub fn subsampled(mut self, x_scale: u32, y_scale: u32) -> Self {
        self.x_scale = x_scale;
        self.y_scale = y_scale;
        self
    }

    /// Elements per row after sub-sampling.
    pub fn columns(&self) -> u32 {
        self.width / self.x_scale.max(1)
    }

    /// Rows after sub-sampling.
    pub fn rows(&self) -> u32 {
        self.height / self.y_scale.max(1)
    }

    /// Packed bytes in one row.
    pub fn row_bytes(&self) -> usize {
        (self.columns() as usize).saturating_mul(self.bytes_per_element as usize)
    }

    /// Packed byte size of the plane, saturating at `usize::MAX`.
    pub fn byte_size(&self) -> usize {
        self.row_bytes().saturating_mul(self.rows() as usize)
    }

    fn checked_byte_size(&self) -> Option<usize> {
        (self.columns() as usize)
            .checked_mul(self.bytes_per_element as usize)?
            .checked_mul(self.rows() as usize)
    }

    /// Reject zero dimensions, scale factors that sub-sample to nothing and
    /// planes too large to address.
    pub fn validate(&self, plane: usize) -> Result<()> {
        let reason = if self.width == 0 || self.height == 0 {
            "zero dimension"
        } else if self.bytes_per_element == 0 {
            "zero element size"
        } else if self.x_scale == 0 || self.y_scale == 0 {
            "zero scale factor"
        } else if self.columns() == 0 || self.rows() == 0 {
            "scale factor larger than dimension"
        } else if self.checked_byte_size().is_none() {
            "plane size overflows the address space"
        } else {
            return Ok(());
        };
        Err(MemError::InvalidLayout {
            plane,
            reason: reason.into(),
        })
    }
}

/// Layout of a semi-planar 4:2:0 frame: a full Y plane followed by an
/// interleaved UV plane at half height.
pub fn nv12(width: u32, height: u32) -> [PlaneLayout; 2] {
    [
        PlaneLayout::new(width, height, 1),
        PlaneLayout::new(width, height, 2).subsampled(2, 2),
    ]
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// OS-level handle of an allocated plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemHandle(pub u64);

impl std::fmt::Display for MemHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// Transferable descriptor produced by `share` and consumed by `import`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SharedFd(pub u64);

impl std::fmt::Display for SharedFd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fd{}", self.0)
    }
}

pub(crate) fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

pub(crate) fn checked_align_up(value: usize, align: usize) -> Option<usize> {
    value.div_ceil(align).checked_mul(align)
}
