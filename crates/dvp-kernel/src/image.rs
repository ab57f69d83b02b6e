//! 8-bit image views over memory-manager planes.

use dvp_mem::Plane;

/// A single-plane, one-byte-per-pixel image backed by a [`Plane`].
///
/// Cloning shares the plane storage.  Pixel access goes through the CPU-side
/// (local) view; remote cores see the device view after a flush.
#[derive(Debug, Clone)]
pub struct Image {
    plane: Plane,
}

impl Image {
    pub fn new(plane: Plane) -> Self {
        Self { plane }
    }

    pub fn plane(&self) -> &Plane {
        &self.plane
    }

    pub fn width(&self) -> u32 {
        self.plane.layout().columns()
    }

    pub fn height(&self) -> u32 {
        self.plane.layout().rows()
    }

    pub fn stride(&self) -> usize {
        self.plane.stride()
    }

    /// Whether every pixel is a single byte.
    pub fn is_8bit(&self) -> bool {
        self.plane.layout().bytes_per_element == 1
    }

    pub fn same_shape(&self, other: &Image) -> bool {
        self.width() == other.width() && self.height() == other.height()
    }

    /// Packed copy of every row, without stride padding.
    pub fn read_pixels(&self) -> Vec<u8> {
        let width = self.width() as usize;
        let stride = self.stride();
        let bytes = self.plane.storage().read();
        let mut out = Vec::with_capacity(width * self.height() as usize);
        for y in 0..self.height() as usize {
            out.extend_from_slice(&bytes[y * stride..y * stride + width]);
        }
        out
    }

    /// Overwrite every row from packed `pixels`.  Returns `false` when the
    /// length does not match the image.
    pub fn write_pixels(&self, pixels: &[u8]) -> bool {
        let width = self.width() as usize;
        if width == 0 || pixels.len() != width * self.height() as usize {
            return pixels.is_empty() && width * self.height() as usize == 0;
        }
        let stride = self.stride();
        let mut bytes = self.plane.storage().write();
        for (y, row) in pixels.chunks_exact(width).enumerate() {
            bytes[y * stride..y * stride + width].copy_from_slice(row);
        }
        true
    }

    pub fn fill(&self, value: u8) {
        let pixels = vec![value; self.width() as usize * self.height() as usize];
        self.write_pixels(&pixels);
    }
}
