//! DVP remote procedure calls.
//!
//! Lets a local process execute functions on remote cores that share memory
//! with it:
//!
//! - **[`types`]** -- [`RemoteCore`], call parameters and the bounded
//!   [`Translation`] table of embedded pointers.
//! - **[`transport`]** -- the [`Transport`] trait a concrete channel
//!   implements.
//! - **[`loopback`]** -- [`LoopbackTransport`], an in-process transport with
//!   failure injection.
//! - **[`context`]** -- [`RpcContext`]: associations, pointer translation,
//!   cache maintenance, remote execution and the restart protocol.
//! - **[`error`]** -- [`RpcError`] and [`TransportError`].

pub mod config;
pub mod context;
pub mod error;
pub mod loopback;
pub mod transport;
pub mod types;

pub use config::RpcConfig;
pub use context::RpcContext;
pub use error::{Result, RpcError, TransportError};
pub use loopback::{LoopbackTransport, RemoteFn, RemoteMemory};
pub use transport::{MappedRegion, Transport};
pub use types::{
    ChannelState, Direction, MAX_TRANSLATIONS, POINTER_SIZE, PointerPatch, RemoteCore,
    RestartCallback, RestartEvent, RestartOutcome, RpcParam, Translation,
};
