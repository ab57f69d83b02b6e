//! DVP kernel graph boss.
//!
//! Clients describe image-processing work as graphs of kernel nodes and hand
//! them to the [`Boss`], which routes every node to the best graph manager
//! for its kernel and core affinity:
//!
//! - **[`graph`]** -- [`KernelNode`], shared [`NodeArray`]s, sections, order
//!   ranks and the [`KernelGraph`] handle.
//! - **[`kernels`]** -- the built-in kernel set and its reference pixel
//!   implementations.
//! - **[`manager`]** -- the [`GraphManager`] plugin trait and the priority
//!   routing table.
//! - **[`managers`]** -- the built-in CPU worker-pool manager and the remote
//!   DSP manager driven through [`dvp_rpc`].
//! - **[`load`]** -- per-core capacity limits and admission.
//! - **[`boss`]** -- initialization, verification, dispatch and completion
//!   delivery.
//! - **[`config`]** -- TOML configuration.
//! - **[`error`]** -- [`KernelError`] via [`thiserror`].
//!
//! Memory comes from [`dvp_mem`]; every handle type here is `Send + Sync`
//! and meant for a multi-threaded tokio runtime.

pub mod boss;
pub mod config;
pub mod error;
pub mod graph;
pub mod image;
pub mod kernels;
pub mod load;
pub mod manager;
pub mod managers;
mod region;

pub use boss::{Boss, BossBuilder, CompletionStream, CoreInfo, Dispatch, SectionCompletion};
pub use config::{BossConfig, CpuConfig, DspConfig};
pub use error::{KernelError, Result};
pub use graph::{
    CoreType, KernelGraph, KernelId, KernelNode, NodeArray, NodeStatus, PerfRecord, Section,
};
pub use image::Image;
pub use load::{CoreLoad, LoadGuard, LoadTable, MAX_CAPACITY};
pub use manager::{GraphManager, ManagerContext, ManagerInfo};
pub use managers::{CpuManager, DSP_REMOTE_CORE, DspManager};
