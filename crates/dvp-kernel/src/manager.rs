//! Graph manager plugin contract and the kernel → manager routing table.
//!
//! Every physical core type is served by one or more [`GraphManager`]
//! implementations.  The boss registers them into a [`ManagerTable`] sorted
//! by priority and asks the table which manager should run a given kernel on
//! a given core.
//!
//! # Routing
//!
//! A manager is eligible for `(kernel, core)` when it is enabled, its
//! priority is non-zero, it claims the kernel and it serves `core` (any core
//! matches [`CoreType::Any`]).  Among eligible managers the lowest priority
//! number wins; equal priorities go to the earlier registration.  Priority 0
//! managers are initialized and introspectable but never selected.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dvp_mem::MemoryManager;
use dvp_rpc::{RemoteCore, RestartEvent, RpcContext};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::graph::{CoreType, KernelId, KernelNode};
use crate::load::MAX_CAPACITY;

// ---------------------------------------------------------------------------
// Plugin contract
// ---------------------------------------------------------------------------

/// Shared services handed to a manager at init time.
#[derive(Clone)]
pub struct ManagerContext {
    pub memory: MemoryManager,
    /// Present whenever any registered manager is remote.
    pub rpc: Option<RpcContext>,
}

/// Per-core execution backend.
///
/// `execute` never fails as a whole: per-node failures are written into each
/// node's status and the return value counts the nodes that ran
/// successfully.
#[async_trait]
pub trait GraphManager: Send + Sync {
    /// Short name used in logs and introspection.
    fn name(&self) -> &str;

    /// Core type this manager serves.
    fn core(&self) -> CoreType;

    fn supported_kernels(&self) -> Vec<KernelId>;

    /// Function indices the manager calls on its own core.
    fn supported_local_calls(&self) -> Vec<u32> {
        Vec::new()
    }

    /// Function indices the manager calls on a remote core.
    fn supported_remote_calls(&self) -> Vec<u32> {
        Vec::new()
    }

    /// Relative throughput in `0..=1000`.
    fn maximum_load(&self) -> u32 {
        MAX_CAPACITY
    }

    /// The remote core this manager drives, if it is not local.
    fn remote_core(&self) -> Option<RemoteCore> {
        None
    }

    fn is_remote(&self) -> bool {
        self.remote_core().is_some()
    }

    async fn init(&self, ctx: ManagerContext) -> Result<()>;

    async fn deinit(&self);

    /// Called after the RPC context resolved an unexpected restart of this
    /// manager's remote core.  In-flight work is the manager's to fail.
    fn restart(&self, event: &RestartEvent);

    /// Run `nodes` in order; returns how many succeeded.
    async fn execute(&self, nodes: &mut [KernelNode]) -> usize;
}

// ---------------------------------------------------------------------------
// Registration records
// ---------------------------------------------------------------------------

/// Introspection snapshot of a registered manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerInfo {
    pub name: String,
    pub core: CoreType,
    pub priority: u32,
    pub enabled: bool,
    pub remote: Option<RemoteCore>,
    pub kernels: Vec<KernelId>,
    pub local_calls: Vec<u32>,
    pub remote_calls: Vec<u32>,
    pub maximum_load: u32,
    pub registered_at: DateTime<Utc>,
}

pub(crate) struct Registration {
    pub(crate) info: ManagerInfo,
    pub(crate) manager: Arc<dyn GraphManager>,
    sequence: usize,
}

impl Registration {
    pub(crate) fn sequence(&self) -> usize {
        self.sequence
    }

    fn routable(&self) -> bool {
        self.info.enabled && self.info.priority != 0
    }

    fn serves(&self, kernel: KernelId, core: CoreType) -> bool {
        self.routable()
            && (core == CoreType::Any || core == self.info.core)
            && self.info.kernels.contains(&kernel)
    }
}

/// Managers in routing order.
#[derive(Default)]
pub(crate) struct ManagerTable {
    entries: Vec<Registration>,
}

impl ManagerTable {
    /// Snapshot the manager's introspection and insert it in routing order.
    pub(crate) fn insert(&mut self, manager: Arc<dyn GraphManager>, priority: u32) -> usize {
        let sequence = self.entries.len();
        let info = ManagerInfo {
            name: manager.name().to_string(),
            core: manager.core(),
            priority,
            enabled: true,
            remote: manager.remote_core(),
            kernels: manager.supported_kernels(),
            local_calls: manager.supported_local_calls(),
            remote_calls: manager.supported_remote_calls(),
            maximum_load: manager.maximum_load().min(MAX_CAPACITY),
            registered_at: Utc::now(),
        };
        tracing::info!(
            manager = %info.name,
            core = %info.core,
            priority,
            kernels = info.kernels.len(),
            "graph manager registered"
        );
        self.entries.push(Registration {
            info,
            manager,
            sequence,
        });
        self.entries.sort_by_key(Self::rank);
        sequence
    }

    /// Priority 0 sorts last; ties keep registration order.
    fn rank(entry: &Registration) -> (bool, u32, usize) {
        (entry.info.priority == 0, entry.info.priority, entry.sequence)
    }

    pub(crate) fn disable(&mut self, sequence: usize) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.sequence == sequence) {
            entry.info.enabled = false;
        }
    }

    pub(crate) fn get(&self, sequence: usize) -> Option<&Registration> {
        self.entries.iter().find(|e| e.sequence == sequence)
    }

    /// Best manager for `kernel` on `core`.
    pub(crate) fn route(&self, kernel: KernelId, core: CoreType) -> Option<&Registration> {
        self.entries.iter().find(|e| e.serves(kernel, core))
    }

    pub(crate) fn iter(&self) -> impl DoubleEndedIterator<Item = &Registration> {
        self.entries.iter()
    }

    pub(crate) fn infos(&self) -> Vec<ManagerInfo> {
        self.entries.iter().map(|e| e.info.clone()).collect()
    }

    pub(crate) fn has_enabled(&self, core: CoreType) -> bool {
        self.entries
            .iter()
            .any(|e| e.info.enabled && e.info.core == core)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels;

    struct Fake {
        name: &'static str,
        core: CoreType,
        kernels: Vec<KernelId>,
    }

    #[async_trait]
    impl GraphManager for Fake {
        fn name(&self) -> &str {
            self.name
        }
        fn core(&self) -> CoreType {
            self.core
        }
        fn supported_kernels(&self) -> Vec<KernelId> {
            self.kernels.clone()
        }
        async fn init(&self, _ctx: ManagerContext) -> Result<()> {
            Ok(())
        }
        async fn deinit(&self) {}
        fn restart(&self, _event: &RestartEvent) {}
        async fn execute(&self, nodes: &mut [KernelNode]) -> usize {
            nodes.len()
        }
    }

    fn fake(name: &'static str, core: CoreType, kernels: &[KernelId]) -> Arc<dyn GraphManager> {
        Arc::new(Fake {
            name,
            core,
            kernels: kernels.to_vec(),
        })
    }

    #[test]
    fn lower_priority_number_wins() {
        let mut table = ManagerTable::default();
        table.insert(fake("slow", CoreType::Cpu, &[kernels::COPY]), 2);
        table.insert(fake("fast", CoreType::Cpu, &[kernels::COPY]), 1);
        let chosen = table.route(kernels::COPY, CoreType::Cpu).unwrap();
        assert_eq!(chosen.info.name, "fast");
    }

    #[test]
    fn ties_go_to_earlier_registration() {
        let mut table = ManagerTable::default();
        table.insert(fake("first", CoreType::Cpu, &[kernels::XOR]), 3);
        table.insert(fake("second", CoreType::Cpu, &[kernels::XOR]), 3);
        assert_eq!(
            table.route(kernels::XOR, CoreType::Cpu).unwrap().info.name,
            "first"
        );
    }

    #[test]
    fn priority_zero_is_never_routed() {
        let mut table = ManagerTable::default();
        table.insert(fake("manual", CoreType::Dsp, &[kernels::ADD]), 0);
        assert!(table.route(kernels::ADD, CoreType::Dsp).is_none());
        assert!(table.route(kernels::ADD, CoreType::Any).is_none());
        assert_eq!(table.infos().len(), 1);
    }

    #[test]
    fn any_affinity_picks_best_core() {
        let mut table = ManagerTable::default();
        table.insert(fake("cpu", CoreType::Cpu, &[kernels::INVERT]), 2);
        table.insert(fake("dsp", CoreType::Dsp, &[kernels::INVERT]), 1);
        let chosen = table.route(kernels::INVERT, CoreType::Any).unwrap();
        assert_eq!(chosen.info.core, CoreType::Dsp);
        assert!(table.route(kernels::INVERT, CoreType::Gpu).is_none());
    }

    #[test]
    fn disabled_managers_are_skipped() {
        let mut table = ManagerTable::default();
        let a = table.insert(fake("a", CoreType::Cpu, &[kernels::COPY]), 1);
        let b = table.insert(fake("b", CoreType::Cpu, &[kernels::COPY]), 2);
        table.disable(a);
        let chosen = table.route(kernels::COPY, CoreType::Cpu).unwrap();
        assert_eq!(chosen.info.name, "b");
        assert_eq!(table.get(chosen.sequence()).unwrap().info.name, "b");
        assert!(table.has_enabled(CoreType::Cpu));
        table.disable(b);
        assert!(!table.has_enabled(CoreType::Cpu));
    }
}
