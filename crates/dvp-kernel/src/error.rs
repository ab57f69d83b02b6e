//! Kernel error types.
//!
//! Every public API in this crate returns [`KernelError`].  Per-node failures
//! are never errors: they are recorded in each node's
//! [`NodeStatus`](crate::graph::NodeStatus) and in the executed counts of
//! section completions.  Only synchronous rejections (bad graph shape,
//! exhausted region, unknown core, allocation failures) surface here.

use std::path::PathBuf;

use dvp_mem::MemError;
use dvp_rpc::RpcError;
use uuid::Uuid;

use crate::graph::CoreType;

/// Unified error type for the kernel graph boss.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    // -- Lifecycle ----------------------------------------------------------
    /// The shared graph region could not be mapped.
    #[error("graph region unavailable: {reason}")]
    RegionUnavailable { reason: String },

    /// The boss has been deinitialized.
    #[error("boss is shut down")]
    ShutDown,

    /// A remote manager was registered but no transport was supplied.
    #[error("manager `{manager}` is remote but no transport is configured")]
    NoTransport { manager: String },

    /// A manager failed its one-time setup.
    #[error("manager `{manager}` failed to initialize: {reason}")]
    ManagerInit { manager: String, reason: String },

    // -- Graph construction -------------------------------------------------
    /// Not enough free section slots in the shared region.
    #[error("graph region exhausted: requested {requested} sections, {available} available")]
    RegionExhausted { requested: usize, available: usize },

    /// A graph must have at least one section.
    #[error("a graph needs at least one section")]
    EmptyGraph,

    /// The graph was not allocated by this boss or was already freed.
    #[error("graph not found: {graph}")]
    GraphNotFound { graph: Uuid },

    /// Section index outside the graph.
    #[error("section {section} out of range (graph has {count})")]
    SectionOutOfRange { section: usize, count: usize },

    /// The section has not been initialized with a node range.
    #[error("section {section} is not initialized")]
    SectionUninitialized { section: usize },

    /// The node range lies outside the node array, or is empty.
    #[error("invalid node range {first}..{first}+{count} for an array of {len} nodes")]
    InvalidNodeRange {
        first: usize,
        count: usize,
        len: usize,
    },

    /// Two sections of one graph claim overlapping nodes.
    #[error("section {section} overlaps section {other}")]
    SectionOverlap { section: usize, other: usize },

    /// The sections of a graph reference different node arrays.
    #[error("section {section} uses a different node array than the rest of the graph")]
    ForeignNodeArray { section: usize },

    /// The sections leave some nodes uncovered.
    #[error("sections do not cover node {node}")]
    PartitionGap { node: usize },

    /// The order array length differs from the section count.
    #[error("order array has {found} entries, graph has {expected} sections")]
    OrderLength { expected: usize, found: usize },

    // -- Capacity -----------------------------------------------------------
    /// No enabled manager is registered for the core.
    #[error("core unavailable: {core}")]
    CoreUnavailable { core: CoreType },

    // -- Configuration ------------------------------------------------------
    /// The configuration file could not be read.
    #[error("failed to read config {}: {source}", path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration could not be parsed.
    #[error("invalid config: {reason}")]
    Config { reason: String },

    // -- Wrapped subsystem errors -------------------------------------------
    #[error(transparent)]
    Memory(#[from] MemError),

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// Convenience alias used throughout the kernel crate.
pub type Result<T> = std::result::Result<T, KernelError>;
