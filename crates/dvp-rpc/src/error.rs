//! RPC error types.
//!
//! Transport failures are classified into ordinary failures, which surface to
//! the caller of `remote_execute`, and peer restarts, which additionally
//! drive the channel through the restart protocol.

use dvp_mem::{MemError, MemType};

use crate::types::RemoteCore;

/// Error reported by a [`Transport`](crate::transport::Transport).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The remote side rejected or lost the request.
    #[error("transport failure: {reason}")]
    Failed { reason: String },

    /// The remote peer was restarted underneath the channel.
    #[error("peer restarted")]
    PeerRestarted,
}

/// Unified error type for the RPC context.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// No channel has been opened to the core.
    #[error("no channel open to {core}")]
    NotOpen { core: RemoteCore },

    /// The channel is being re-established after a peer restart.
    #[error("channel to {core} is reopening")]
    Reopening { core: RemoteCore },

    /// The channel gave up after exhausting its restart retries.
    #[error("channel to {core} is closed")]
    Closed { core: RemoteCore },

    /// The call failed because the peer restarted during it.
    #[error("peer {core} restarted during call")]
    PeerRestarted { core: RemoteCore },

    /// An ordinary transport failure.
    #[error("transport error on {core}: {source}")]
    Transport {
        core: RemoteCore,
        #[source]
        source: TransportError,
    },

    /// More pointer translations were requested than one call may carry.
    #[error("too many pointer translations: {count} > {limit}")]
    TranslationOverflow { count: usize, limit: usize },

    /// A translation entry points outside its parameter.
    #[error("translation {index} is invalid: {reason}")]
    InvalidTranslation { index: usize, reason: String },

    /// No mapping exists for the remote address.
    #[error("no translation for remote address {addr:#x} on {core}")]
    UnknownRemoteAddress { core: RemoteCore, addr: u64 },

    /// The address was translated under a different memory type.
    #[error("memory type mismatch at {addr:#x}: mapped as {mapped}, requested {requested}")]
    TypeMismatch {
        addr: u64,
        mapped: MemType,
        requested: MemType,
    },

    /// The buffer is already associated.
    #[error("address {addr:#x} is already associated")]
    AlreadyAssociated { addr: u64 },

    /// The buffer has no association to remove.
    #[error("address {addr:#x} is not associated")]
    NotAssociated { addr: u64 },

    /// The memory manager could not identify the buffer.
    #[error(transparent)]
    Memory(#[from] MemError),
}

/// Convenience alias used throughout the RPC crate.
pub type Result<T> = std::result::Result<T, RpcError>;
