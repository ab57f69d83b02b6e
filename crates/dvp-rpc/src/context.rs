//! Per-process RPC context.
//!
//! The [`RpcContext`] owns every cross-domain mapping: explicit buffer
//! associations, forward (local → remote) and backward (remote → local)
//! translation tables, and the per-core channel state machine.  Graph
//! managers never cache remote addresses themselves; after a peer restart
//! the context drops every translation for that core and the next
//! `mem_xlate_forward` maps the buffer afresh.
//!
//! All translation tables sit behind a single mutex.  Channel state lives in
//! a [`DashMap`] keyed by core so that a restart on one core never blocks
//! calls to another.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use dvp_mem::{MemError, MemHandle, MemType, MemoryManager, Plane, PlaneStorage};

use crate::config::RpcConfig;
use crate::error::{Result, RpcError, TransportError};
use crate::transport::{MappedRegion, Transport};
use crate::types::{
    ChannelState, MAX_TRANSLATIONS, PointerPatch, RemoteCore, RestartCallback, RestartEvent,
    RestartOutcome, RpcParam, Translation,
};

// ---------------------------------------------------------------------------
// Internal tables
// ---------------------------------------------------------------------------

struct Channel {
    state: ChannelState,
    handler: Option<RestartHandler>,
}

#[derive(Clone)]
struct RestartHandler {
    callback: RestartCallback,
    retries: u32,
}

struct Association {
    handle: MemHandle,
    size: usize,
    mem_type: MemType,
    storage: Arc<PlaneStorage>,
}

#[derive(Debug, Clone, Copy)]
struct Mapping {
    remote: u64,
    size: usize,
    mem_type: MemType,
}

#[derive(Default)]
struct Tables {
    associations: BTreeMap<u64, Association>,
    /// `(core, local base)` → remote mapping.
    forward: BTreeMap<(RemoteCore, u64), Mapping>,
    /// `(core, remote base)` → local base.
    backward: BTreeMap<(RemoteCore, u64), u64>,
}

impl Tables {
    fn insert(&mut self, core: RemoteCore, local: u64, mapping: Mapping) {
        self.forward.insert((core, local), mapping);
        self.backward.insert((core, mapping.remote), local);
    }

    fn remove(&mut self, core: RemoteCore, local: u64) -> Option<Mapping> {
        let mapping = self.forward.remove(&(core, local))?;
        self.backward.remove(&(core, mapping.remote));
        Some(mapping)
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Cross-domain execution and translation context.
///
/// Cheaply cloneable (`Arc`-backed) and `Send + Sync`.
#[derive(Clone)]
pub struct RpcContext {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    memory: MemoryManager,
    config: RpcConfig,
    channels: DashMap<RemoteCore, Channel>,
    tables: Mutex<Tables>,
}

impl RpcContext {
    pub fn new(transport: Arc<dyn Transport>, memory: MemoryManager, config: RpcConfig) -> Self {
        tracing::info!(transport = transport.name(), "rpc context created");
        Self {
            inner: Arc::new(Inner {
                transport,
                memory,
                config,
                channels: DashMap::new(),
                tables: Mutex::new(Tables::default()),
            }),
        }
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.inner.memory
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    // -- Channels -----------------------------------------------------------

    /// Open the channel to `core`.  Reopening a closed channel keeps its
    /// registered restart handler.
    pub fn open(&self, core: RemoteCore) -> Result<()> {
        self.inner
            .transport
            .open(core)
            .map_err(|source| RpcError::Transport { core, source })?;
        self.inner
            .channels
            .entry(core)
            .and_modify(|ch| ch.state = ChannelState::Connected)
            .or_insert(Channel {
                state: ChannelState::Connected,
                handler: None,
            });
        tracing::info!(%core, "rpc channel opened");
        Ok(())
    }

    /// Unmap every translation for `core` and close its channel.
    pub fn close(&self, core: RemoteCore) {
        let purged = self.purge_core(core, true);
        self.inner.transport.close(core);
        self.inner.channels.remove(&core);
        tracing::info!(%core, purged, "rpc channel closed");
    }

    /// Current state of the channel to `core`, if one was opened.
    pub fn state(&self, core: RemoteCore) -> Option<ChannelState> {
        self.inner.channels.get(&core).map(|ch| ch.state)
    }

    /// Register the handler fired after an unexpected restart of `core`.
    ///
    /// `retries` bounds the reopen attempts made before the channel is
    /// declared closed and the handler is told so.
    pub fn restart_callback_register(
        &self,
        core: RemoteCore,
        callback: RestartCallback,
        retries: u32,
    ) -> Result<()> {
        let mut channel = self
            .inner
            .channels
            .get_mut(&core)
            .ok_or(RpcError::NotOpen { core })?;
        channel.handler = Some(RestartHandler { callback, retries });
        tracing::debug!(%core, retries, "restart handler registered");
        Ok(())
    }

    // -- Associations -------------------------------------------------------

    /// Bind a plane's handle to the translation tables.
    pub fn associate(&self, plane: &Plane) -> Result<()> {
        let mut tables = self.lock_tables();
        if tables.associations.contains_key(&plane.addr()) {
            return Err(RpcError::AlreadyAssociated { addr: plane.addr() });
        }
        tables.associations.insert(
            plane.addr(),
            Association {
                handle: plane.handle(),
                size: plane.size(),
                mem_type: plane.mem_type(),
                storage: Arc::clone(plane.storage()),
            },
        );
        tracing::trace!(addr = format_args!("{:#x}", plane.addr()), handle = %plane.handle(), "plane associated");
        Ok(())
    }

    /// Undo one successful [`associate`](Self::associate), purging every
    /// remote translation of the plane.
    pub fn dissociate(&self, plane: &Plane) -> Result<()> {
        let removed = self.lock_tables().associations.remove(&plane.addr());
        if removed.is_none() {
            return Err(RpcError::NotAssociated { addr: plane.addr() });
        }
        self.mem_remove(plane.addr(), plane.size(), plane.mem_type());
        Ok(())
    }

    pub fn association_count(&self) -> usize {
        self.lock_tables().associations.len()
    }

    // -- Translation --------------------------------------------------------

    /// Remote-visible address of `local`, mapping its buffer on first use.
    pub fn mem_xlate_forward(
        &self,
        core: RemoteCore,
        local: u64,
        size: usize,
        mem_type: MemType,
    ) -> Result<u64> {
        self.ensure_connected(core)?;
        let mut tables = self.lock_tables();
        let region = self.identify(&tables, local)?;
        if region.mem_type != mem_type {
            return Err(RpcError::TypeMismatch {
                addr: local,
                mapped: region.mem_type,
                requested: mem_type,
            });
        }
        let offset = local - region.local_addr;
        (offset as usize)
            .checked_add(size)
            .filter(|end| *end <= region.size)
            .ok_or(MemError::OutOfBounds { addr: local, len: size })?;

        if let Some(mapping) = tables.forward.get(&(core, region.local_addr)) {
            return Ok(mapping.remote + offset);
        }

        let remote = self
            .inner
            .transport
            .map(core, &region)
            .map_err(|source| RpcError::Transport { core, source })?;
        tables.insert(
            core,
            region.local_addr,
            Mapping {
                remote,
                size: region.size,
                mem_type,
            },
        );
        tracing::trace!(
            %core,
            local = format_args!("{:#x}", region.local_addr),
            remote = format_args!("{remote:#x}"),
            "buffer mapped"
        );
        Ok(remote + offset)
    }

    /// Local address of `remote`; the inverse of
    /// [`mem_xlate_forward`](Self::mem_xlate_forward).
    pub fn mem_xlate_backward(
        &self,
        core: RemoteCore,
        remote: u64,
        mem_type: MemType,
    ) -> Result<u64> {
        let tables = self.lock_tables();
        let unknown = RpcError::UnknownRemoteAddress { core, addr: remote };
        let Some((&(found, remote_base), &local_base)) =
            tables.backward.range(..=(core, remote)).next_back()
        else {
            return Err(unknown);
        };
        if found != core {
            return Err(unknown);
        }
        let Some(mapping) = tables.forward.get(&(core, local_base)) else {
            return Err(unknown);
        };
        let offset = remote - remote_base;
        if offset as usize >= mapping.size {
            return Err(unknown);
        }
        if mapping.mem_type != mem_type {
            return Err(RpcError::TypeMismatch {
                addr: remote,
                mapped: mapping.mem_type,
                requested: mem_type,
            });
        }
        Ok(local_base + offset)
    }

    /// Purge every translation of buffers overlapping `local..local + size`
    /// on every core.  Must run before the buffer is freed.
    ///
    /// Returns the number of mappings removed.
    pub fn mem_remove(&self, local: u64, size: usize, mem_type: MemType) -> usize {
        let end = local.saturating_add(size as u64);
        let mut tables = self.lock_tables();
        let doomed: Vec<(RemoteCore, u64)> = tables
            .forward
            .iter()
            .filter(|((_, base), m)| {
                m.mem_type == mem_type && *base < end && local < base + m.size as u64
            })
            .map(|(key, _)| *key)
            .collect();

        for (core, base) in &doomed {
            if let Some(mapping) = tables.remove(*core, *base) {
                if let Err(err) = self.inner.transport.unmap(*core, mapping.remote) {
                    tracing::warn!(%core, error = %err, "remote unmap failed");
                }
            }
        }
        if !doomed.is_empty() {
            tracing::trace!(
                local = format_args!("{local:#x}"),
                removed = doomed.len(),
                "translations removed"
            );
        }
        doomed.len()
    }

    /// Live translations on `core`.
    pub fn mapping_count(&self, core: RemoteCore) -> usize {
        self.lock_tables()
            .forward
            .keys()
            .filter(|(c, _)| *c == core)
            .count()
    }

    // -- Cache maintenance --------------------------------------------------

    /// Publish CPU writes in `addr..addr + size` so `core` can read them.
    pub fn flush(&self, core: RemoteCore, addr: u64, size: usize, mem_type: MemType) -> Result<usize> {
        if !mem_type.is_cached() {
            return Ok(0);
        }
        let (storage, range) = self.cache_range(addr, size, mem_type)?;
        let bytes = storage.flush_range(range);
        tracing::trace!(%core, addr = format_args!("{addr:#x}"), bytes, "flushed for remote");
        Ok(bytes)
    }

    /// Discard stale CPU lines in `addr..addr + size` after `core` wrote them.
    pub fn invalidate(
        &self,
        core: RemoteCore,
        addr: u64,
        size: usize,
        mem_type: MemType,
    ) -> Result<usize> {
        if !mem_type.is_cached() {
            return Ok(0);
        }
        let (storage, range) = self.cache_range(addr, size, mem_type)?;
        let bytes = storage.invalidate_range(range);
        tracing::trace!(%core, addr = format_args!("{addr:#x}"), bytes, "invalidated after remote");
        Ok(bytes)
    }

    // -- Remote execution ---------------------------------------------------

    /// Call remote `function` on `core`.
    ///
    /// Every pointer named in `translation` is translated forward before the
    /// call and backward after it; memory the remote side reads is flushed
    /// first and memory it writes is invalidated afterwards.  On failure the
    /// parameters are restored to their local addresses.  After a successful
    /// call every pointer is translated back before any invalidation runs,
    /// and the first invalidation error is returned once all have been tried.
    pub fn remote_execute(
        &self,
        core: RemoteCore,
        function: u32,
        params: &mut [RpcParam],
        translation: &Translation,
    ) -> Result<i32> {
        if translation.len() > MAX_TRANSLATIONS {
            return Err(RpcError::TranslationOverflow {
                count: translation.len(),
                limit: MAX_TRANSLATIONS,
            });
        }
        self.ensure_connected(core)?;

        let mut applied: Vec<(PointerPatch, u64)> = Vec::with_capacity(translation.len());
        for (index, patch) in translation.patches().iter().enumerate() {
            match self.apply_patch(core, index, patch, params) {
                Ok(local) => applied.push((*patch, local)),
                Err(err) => {
                    restore(params, &applied);
                    return Err(err);
                }
            }
        }

        match self.inner.transport.call(core, function, params) {
            Ok(ret) => {
                let locals: Vec<u64> = applied
                    .iter()
                    .map(|(patch, original)| self.unpatch(core, patch, *original, params))
                    .collect();
                let mut first_error = None;
                for ((patch, _), local) in applied.iter().zip(locals) {
                    if !params[patch.param].direction.remote_writes() {
                        continue;
                    }
                    if let Err(err) = self.invalidate(core, local, patch.len, patch.mem_type) {
                        tracing::warn!(%core, param = patch.param, error = %err, "invalidate after remote call failed");
                        first_error.get_or_insert(err);
                    }
                }
                if let Some(err) = first_error {
                    return Err(err);
                }
                tracing::trace!(%core, function, ret, translations = applied.len(), "remote call returned");
                Ok(ret)
            }
            Err(TransportError::PeerRestarted) => {
                restore(params, &applied);
                self.recover(core);
                Err(RpcError::PeerRestarted { core })
            }
            Err(source) => {
                restore(params, &applied);
                Err(RpcError::Transport { core, source })
            }
        }
    }

    /// Close every channel and drop all associations.
    pub fn shutdown(&self) {
        let cores: Vec<RemoteCore> = self.inner.channels.iter().map(|e| *e.key()).collect();
        for core in cores {
            self.close(core);
        }
        let leaked = std::mem::take(&mut self.lock_tables().associations);
        if !leaked.is_empty() {
            tracing::warn!(count = leaked.len(), "associations outstanding at shutdown");
        }
        tracing::info!("rpc context shut down");
    }

    // -- Private helpers ----------------------------------------------------

    fn lock_tables(&self) -> MutexGuard<'_, Tables> {
        self.inner
            .tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_connected(&self, core: RemoteCore) -> Result<()> {
        match self.inner.channels.get(&core).map(|ch| ch.state) {
            Some(ChannelState::Connected) => Ok(()),
            Some(ChannelState::Reopening) => Err(RpcError::Reopening { core }),
            Some(ChannelState::Closed) => Err(RpcError::Closed { core }),
            None => Err(RpcError::NotOpen { core }),
        }
    }

    /// Identify the buffer containing `addr`: explicit associations first,
    /// then the memory manager's registry.
    fn identify(&self, tables: &Tables, addr: u64) -> Result<MappedRegion> {
        let associated = tables
            .associations
            .range(..=addr)
            .next_back()
            .filter(|(base, a)| addr < **base + a.size as u64);
        if let Some((base, a)) = associated {
            return Ok(MappedRegion {
                local_addr: *base,
                size: a.size,
                mem_type: a.mem_type,
                handle: a.handle,
                storage: Arc::clone(&a.storage),
            });
        }
        let plane = self
            .inner
            .memory
            .lookup(addr)
            .ok_or(MemError::UnknownAddress { addr })?;
        Ok(MappedRegion {
            local_addr: plane.addr(),
            size: plane.size(),
            mem_type: plane.mem_type(),
            handle: plane.handle(),
            storage: Arc::clone(plane.storage()),
        })
    }

    fn cache_range(
        &self,
        addr: u64,
        size: usize,
        mem_type: MemType,
    ) -> Result<(Arc<PlaneStorage>, std::ops::Range<usize>)> {
        let region = {
            let tables = self.lock_tables();
            self.identify(&tables, addr)?
        };
        if region.mem_type != mem_type {
            return Err(RpcError::TypeMismatch {
                addr,
                mapped: region.mem_type,
                requested: mem_type,
            });
        }
        let start = (addr - region.local_addr) as usize;
        let end = start
            .checked_add(size)
            .filter(|end| *end <= region.size)
            .ok_or(MemError::OutOfBounds { addr, len: size })?;
        Ok((region.storage, start..end))
    }

    fn apply_patch(
        &self,
        core: RemoteCore,
        index: usize,
        patch: &PointerPatch,
        params: &mut [RpcParam],
    ) -> Result<u64> {
        let invalid = |reason: &str| RpcError::InvalidTranslation {
            index,
            reason: reason.into(),
        };
        let param = params
            .get_mut(patch.param)
            .ok_or_else(|| invalid("parameter index out of range"))?;
        let local = param
            .read_pointer(patch.offset)
            .ok_or_else(|| invalid("pointer offset out of range"))?;
        let remote = self.mem_xlate_forward(core, local, patch.len, patch.mem_type)?;
        if param.direction.remote_reads() {
            self.flush(core, local, patch.len, patch.mem_type)?;
        }
        param.write_pointer(patch.offset, remote);
        Ok(local)
    }

    /// Translate the pointer the remote side left in the parameter back to
    /// a local address, falling back to the original on failure.
    fn unpatch(
        &self,
        core: RemoteCore,
        patch: &PointerPatch,
        original: u64,
        params: &mut [RpcParam],
    ) -> u64 {
        let param = &mut params[patch.param];
        let local = param
            .read_pointer(patch.offset)
            .and_then(|remote| self.mem_xlate_backward(core, remote, patch.mem_type).ok())
            .unwrap_or_else(|| {
                tracing::warn!(%core, param = patch.param, "remote returned an untranslatable pointer");
                original
            });
        param.write_pointer(patch.offset, local);
        local
    }

    /// Drop every translation for `core`; optionally unmap on the remote
    /// side as well.
    fn purge_core(&self, core: RemoteCore, unmap: bool) -> usize {
        let mut tables = self.lock_tables();
        let locals: Vec<u64> = tables
            .forward
            .keys()
            .filter(|(c, _)| *c == core)
            .map(|(_, local)| *local)
            .collect();
        for local in &locals {
            if let Some(mapping) = tables.remove(core, *local) {
                if unmap {
                    if let Err(err) = self.inner.transport.unmap(core, mapping.remote) {
                        tracing::debug!(%core, error = %err, "unmap during close failed");
                    }
                }
            }
        }
        locals.len()
    }

    /// Run the restart protocol after `core` reported a peer restart.
    fn recover(&self, core: RemoteCore) {
        let handler = {
            let Some(mut channel) = self.inner.channels.get_mut(&core) else {
                return;
            };
            if channel.state != ChannelState::Connected {
                return;
            }
            channel.state = ChannelState::Reopening;
            channel.handler.clone()
        };

        let purged = self.purge_core(core, false);
        let retries = handler
            .as_ref()
            .map(|h| h.retries)
            .unwrap_or(self.inner.config.restart_retries);
        tracing::warn!(%core, retries, purged, "peer restarted, reopening channel");

        let mut outcome = RestartOutcome::Failed { attempts: retries };
        for attempt in 1..=retries {
            self.inner.transport.close(core);
            match self.inner.transport.open(core) {
                Ok(()) => {
                    outcome = RestartOutcome::Recovered { attempts: attempt };
                    break;
                }
                Err(err) => {
                    tracing::warn!(%core, attempt, error = %err, "reopen attempt failed");
                }
            }
        }

        let state = match outcome {
            RestartOutcome::Recovered { .. } => ChannelState::Connected,
            RestartOutcome::Failed { .. } => ChannelState::Closed,
        };
        if let Some(mut channel) = self.inner.channels.get_mut(&core) {
            channel.state = state;
        }
        tracing::info!(%core, ?outcome, "restart protocol finished");

        if let Some(handler) = handler {
            (handler.callback)(&RestartEvent { core, outcome });
        }
    }
}

fn restore(params: &mut [RpcParam], applied: &[(PointerPatch, u64)]) {
    for (patch, local) in applied {
        if let Some(param) = params.get_mut(patch.param) {
            param.write_pointer(patch.offset, *local);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
