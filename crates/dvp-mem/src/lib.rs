//! DVP typed memory manager.
//!
//! Allocates, frees, shares, imports and cache-maintains multi-plane buffers
//! of a fixed set of memory types:
//!
//! - **[`types`]** -- [`MemType`], [`PlaneLayout`] stride/size rules and the
//!   opaque [`MemHandle`] / [`SharedFd`] identities.
//! - **[`buffer`]** -- the owned [`Buffer`] descriptor, per-plane [`Plane`]
//!   views and the local/device [`PlaneStorage`] cache model.
//! - **[`manager`]** -- the [`MemoryManager`] allocator with its address
//!   registry, plus the [`ShareBroker`] that carries exported planes between
//!   domains.
//! - **[`error`]** -- [`MemError`] via [`thiserror`].
//!
//! This crate has no dependency on the rest of the framework.

pub mod buffer;
pub mod config;
pub mod error;
pub mod manager;
pub mod types;

pub use buffer::{Buffer, Plane, PlaneStorage, SharedBuffer};
pub use config::MemoryConfig;
pub use error::{MemError, Result};
pub use manager::{MemStats, MemoryManager, ShareBroker, ShareError};
pub use types::{MAX_PLANES, MemHandle, MemType, PAGE_SIZE, PlaneLayout, SharedFd, nv12};
