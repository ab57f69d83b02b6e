//! Transport contract.
//!
//! A transport moves calls and mappings to one class of remote cores.  It
//! knows nothing about association tables or cache maintenance; the
//! [`RpcContext`](crate::context::RpcContext) layers those on top.

use std::sync::Arc;

use dvp_mem::{MemHandle, MemType, PlaneStorage};

use crate::error::TransportError;
use crate::types::{RemoteCore, RpcParam};

/// A local plane being made visible to a remote core.
#[derive(Debug, Clone)]
pub struct MappedRegion {
    pub local_addr: u64,
    pub size: usize,
    pub mem_type: MemType,
    pub handle: MemHandle,
    pub storage: Arc<PlaneStorage>,
}

/// Channel to a family of remote cores.
pub trait Transport: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Open (or reopen) the channel to `core`.
    fn open(&self, core: RemoteCore) -> Result<(), TransportError>;

    /// Close the channel.  Closing an unopened channel is a no-op.
    fn close(&self, core: RemoteCore);

    /// Map `region` into the remote address space, returning its remote base.
    fn map(&self, core: RemoteCore, region: &MappedRegion) -> Result<u64, TransportError>;

    /// Remove a mapping created by [`Transport::map`].
    fn unmap(&self, core: RemoteCore, remote_addr: u64) -> Result<(), TransportError>;

    /// Invoke remote function `function` with already-translated `params`.
    fn call(
        &self,
        core: RemoteCore,
        function: u32,
        params: &mut [RpcParam],
    ) -> Result<i32, TransportError>;
}
