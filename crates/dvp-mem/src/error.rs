//! Memory manager error types.
//!
//! Every allocation, sharing and cache-maintenance failure surfaces through
//! [`MemError`].  Failures are always reported synchronously and never leave
//! a partial allocation behind.

use crate::types::{MemType, SharedFd};

/// Unified error type for the DVP memory manager.
#[derive(Debug, thiserror::Error)]
pub enum MemError {
    /// A plane layout has a zero dimension or scale factor.
    #[error("invalid layout for plane {plane}: {reason}")]
    InvalidLayout { plane: usize, reason: String },

    /// The number of planes requested is outside `1..=MAX_PLANES`.
    #[error("unsupported plane count: {count}")]
    PlaneCount { count: usize },

    /// The allocator budget cannot satisfy the request.
    #[error("out of memory allocating plane {plane}: requested {requested} bytes, {available} available")]
    OutOfMemory {
        plane: usize,
        requested: usize,
        available: usize,
    },

    /// The memory type cannot be exported to another domain.
    #[error("memory type {mem_type} does not support sharing")]
    NotShareable { mem_type: MemType },

    /// A shared descriptor is unknown or was already consumed.
    #[error("unknown shared descriptor: {fd}")]
    UnknownDescriptor { fd: SharedFd },

    /// A descriptor was imported as a different memory type than it was
    /// exported with.
    #[error("memory type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: MemType, found: MemType },

    /// The imported plane is smaller than the layout requires.
    #[error("plane {plane} too small for layout: need {needed} bytes, have {available}")]
    LayoutMismatch {
        plane: usize,
        needed: usize,
        available: usize,
    },

    /// No live plane contains the given local address.
    #[error("no buffer mapped at address {addr:#x}")]
    UnknownAddress { addr: u64 },

    /// A byte range reaches past the end of the plane that contains it.
    #[error("range {addr:#x}+{len} exceeds plane bounds")]
    OutOfBounds { addr: u64, len: usize },

    /// The buffer was allocated by a different memory manager.
    #[error("buffer is not owned by this memory manager")]
    ForeignBuffer,
}

/// Convenience alias used throughout the memory crate.
pub type Result<T> = std::result::Result<T, MemError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_memory_display() {
        let err = MemError::OutOfMemory {
            plane: 1,
            requested: 4096,
            available: 100,
        };
        assert_eq!(
            err.to_string(),
            "out of memory allocating plane 1: requested 4096 bytes, 100 available"
        );
    }

    #[test]
    fn not_shareable_display() {
        let err = MemError::NotShareable {
            mem_type: MemType::Virtual,
        };
        assert_eq!(err.to_string(), "memory type virtual does not support sharing");
    }

    #[test]
    fn unknown_address_is_hex() {
        let err = MemError::UnknownAddress { addr: 0x1000 };
        assert_eq!(err.to_string(), "no buffer mapped at address 0x1000");
    }
}
