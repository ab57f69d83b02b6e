//! Kernel graph boss.
//!
//! The [`Boss`] is the single entry point that owns every registered graph
//! manager, the [`LoadTable`], the shared graph region, the memory manager
//! and (when any manager is remote) the RPC context.
//!
//! # Dispatch
//!
//! `process` groups a graph's sections by order rank.  Ranks run in
//! ascending order; every section of one rank runs concurrently, and the
//! next rank starts only after each completion of the current rank has been
//! sent.  Inside a section, consecutive nodes routed to the same manager are
//! dispatched as one run.  Completions are delivered over a bounded channel;
//! no lock is held while a completion is sent, so receivers may call back
//! into the boss.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use dvp_mem::{Buffer, MemType, MemoryManager, PlaneLayout};
use dvp_rpc::{LoopbackTransport, RpcContext, Transport};
use futures::stream::{FuturesUnordered, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::BossConfig;
use crate::error::{KernelError, Result};
use crate::graph::{CoreType, KernelGraph, KernelId, KernelNode, NodeArray, NodeStatus, PerfRecord, Section};
use crate::image::Image;
use crate::load::{CoreLoad, LoadTable};
use crate::manager::{GraphManager, ManagerContext, ManagerInfo, ManagerTable};
use crate::managers::{CpuManager, DSP_REMOTE_CORE, DspManager, dsp};
use crate::region::GraphRegion;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// How `process` waits for the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Return only after every section has completed.
    Sync,
    /// Spawn the dispatch onto the runtime and return immediately.
    Async,
}

/// One finished section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionCompletion {
    pub graph: Uuid,
    pub section: usize,
    /// Nodes that executed successfully; may be below `nodes`.
    pub executed: usize,
    pub nodes: usize,
}

impl SectionCompletion {
    pub fn is_complete(&self) -> bool {
        self.executed == self.nodes
    }
}

/// Receiver side of one `process` call.  Yields exactly one
/// [`SectionCompletion`] per section, then ends.
#[derive(Debug)]
pub struct CompletionStream {
    rx: mpsc::Receiver<SectionCompletion>,
    expected: usize,
}

impl CompletionStream {
    /// Number of completions this stream will yield.
    pub fn expected(&self) -> usize {
        self.expected
    }

    pub async fn next_completion(&mut self) -> Option<SectionCompletion> {
        self.rx.recv().await
    }

    /// Wait for every remaining completion.
    pub async fn collect_all(mut self) -> Vec<SectionCompletion> {
        let mut out = Vec::with_capacity(self.expected);
        while let Some(completion) = self.rx.recv().await {
            out.push(completion);
        }
        out
    }
}

impl Stream for CompletionStream {
    type Item = SectionCompletion;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Introspection of one core type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreInfo {
    pub core: CoreType,
    pub load: CoreLoad,
    pub managers: Vec<ManagerInfo>,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Collects managers and a transport before [`BossBuilder::init`].
pub struct BossBuilder {
    config: BossConfig,
    managers: Vec<(Arc<dyn GraphManager>, u32)>,
    transport: Option<Arc<dyn Transport>>,
}

impl BossBuilder {
    /// Register `manager` with routing `priority` (1 is highest, 0 never
    /// routes).
    pub fn register(self, manager: impl GraphManager + 'static, priority: u32) -> Self {
        self.register_arc(Arc::new(manager), priority)
    }

    pub fn register_arc(mut self, manager: Arc<dyn GraphManager>, priority: u32) -> Self {
        self.managers.push((manager, priority));
        self
    }

    /// Transport used by remote managers.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Register the built-in managers enabled in the configuration.  The DSP
    /// manager gets a loopback transport with its firmware installed unless
    /// a transport was already supplied.
    pub fn with_default_managers(mut self) -> Self {
        if self.config.cpu.enabled {
            let cpu = CpuManager::new(self.config.cpu.workers);
            let priority = self.config.cpu.priority;
            self = self.register(cpu, priority);
        }
        if self.config.dsp.enabled {
            if self.transport.is_none() {
                let loopback = Arc::new(LoopbackTransport::new());
                dsp::firmware::install(&loopback);
                self.transport = Some(loopback);
            }
            let priority = self.config.dsp.priority;
            self = self.register(DspManager::new(DSP_REMOTE_CORE), priority);
        }
        self
    }

    /// Map the graph region, bring up memory and RPC, and initialize every
    /// manager in priority order.  Managers that fail to initialize stay
    /// registered but disabled.
    pub async fn init(self) -> Result<Boss> {
        let Self {
            config,
            managers,
            transport,
        } = self;

        let region = GraphRegion::map(config.region_sections)?;
        let memory = MemoryManager::new(config.memory.clone());

        let rpc = match managers.iter().find(|(m, _)| m.is_remote()) {
            Some((remote, _)) => {
                let transport = transport.ok_or_else(|| KernelError::NoTransport {
                    manager: remote.name().to_string(),
                })?;
                Some(RpcContext::new(transport, memory.clone(), config.rpc.clone()))
            }
            None => None,
        };

        let mut table = ManagerTable::default();
        for (manager, priority) in managers {
            table.insert(manager, priority);
        }

        let load = LoadTable::new();
        let ctx = ManagerContext {
            memory: memory.clone(),
            rpc: rpc.clone(),
        };
        let mut failed = Vec::new();
        for entry in table.iter() {
            match entry.manager.init(ctx.clone()).await {
                Ok(()) => {
                    load.register(entry.info.core, entry.info.maximum_load);
                    if let (Some(rpc), Some(remote)) = (&rpc, entry.info.remote) {
                        let weak = Arc::downgrade(&entry.manager);
                        let callback = Arc::new(move |event: &dvp_rpc::RestartEvent| {
                            if let Some(manager) = weak.upgrade() {
                                manager.restart(event);
                            }
                        });
                        if let Err(err) = rpc.restart_callback_register(
                            remote,
                            callback,
                            config.rpc.restart_retries,
                        ) {
                            tracing::warn!(manager = %entry.info.name, error = %err, "restart handler not registered");
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(manager = %entry.info.name, error = %err, "graph manager disabled");
                    failed.push(entry.sequence());
                }
            }
        }
        for sequence in failed {
            table.disable(sequence);
        }

        tracing::info!(
            managers = table.infos().len(),
            region_sections = config.region_sections,
            remote = rpc.is_some(),
            "boss initialized"
        );

        Ok(Boss {
            inner: Arc::new(BossInner {
                config,
                memory,
                rpc,
                managers: table,
                load,
                region,
                shut_down: AtomicBool::new(false),
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// Boss
// ---------------------------------------------------------------------------

/// Top-level orchestrator.  Cheaply cloneable (`Arc`-backed).
#[derive(Clone)]
pub struct Boss {
    inner: Arc<BossInner>,
}

struct BossInner {
    config: BossConfig,
    memory: MemoryManager,
    rpc: Option<RpcContext>,
    managers: ManagerTable,
    load: LoadTable,
    region: GraphRegion,
    shut_down: AtomicBool,
}

impl Boss {
    pub fn builder(config: BossConfig) -> BossBuilder {
        BossBuilder {
            config,
            managers: Vec::new(),
            transport: None,
        }
    }

    /// Initialize with the built-in managers the configuration enables.
    pub async fn init(config: BossConfig) -> Result<Self> {
        Self::builder(config).with_default_managers().init().await
    }

    /// Deinitialize managers in reverse priority order and tear down RPC.
    /// Calling it again is a no-op.
    pub async fn deinit(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for entry in self.inner.managers.iter().rev() {
            if entry.info.enabled {
                entry.manager.deinit().await;
                tracing::info!(manager = %entry.info.name, "graph manager unregistered");
            }
        }
        if let Some(rpc) = &self.inner.rpc {
            rpc.shutdown();
        }

        let graphs = self.inner.region.live_graphs();
        if graphs > 0 {
            tracing::warn!(graphs, "graphs still allocated at deinit");
        }
        let stats = self.inner.memory.stats();
        if stats.live_planes > 0 {
            tracing::warn!(planes = stats.live_planes, bytes = stats.live_bytes, "buffers still allocated at deinit");
        }
        tracing::info!("boss deinitialized");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &BossConfig {
        &self.inner.config
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.inner.memory
    }

    pub fn rpc(&self) -> Option<&RpcContext> {
        self.inner.rpc.as_ref()
    }

    /// Every registered manager in routing order.
    pub fn managers(&self) -> Vec<ManagerInfo> {
        self.inner.managers.infos()
    }

    // -- Nodes and graphs ---------------------------------------------------

    /// Allocate `len` default nodes.  The array is owned by the caller.
    pub fn alloc_nodes(&self, len: usize) -> NodeArray {
        NodeArray::new(len)
    }

    /// Release the caller's handle.  Returns `false` if a live graph section
    /// still references the array.
    pub fn free_nodes(&self, nodes: NodeArray) -> bool {
        let exclusive = nodes.handle_count() == 1;
        if !exclusive {
            tracing::warn!(handles = nodes.handle_count(), "node array freed while still referenced");
        }
        exclusive
    }

    /// Allocate a graph of `sections` sections from the shared region.
    pub fn alloc_graph(&self, sections: usize) -> Result<KernelGraph> {
        self.ensure_running()?;
        if sections == 0 {
            return Err(KernelError::EmptyGraph);
        }
        let graph = KernelGraph::new(sections);
        self.inner.region.reserve(graph.id(), sections)?;
        tracing::debug!(
            graph = %graph.id(),
            sections,
            available = self.inner.region.available(),
            "graph allocated"
        );
        Ok(graph)
    }

    /// Bind `nodes[first..first + count]` to section `index` of `graph`.
    pub fn init_section(
        &self,
        graph: &KernelGraph,
        index: usize,
        nodes: &NodeArray,
        first: usize,
        count: usize,
    ) -> Result<()> {
        self.check_graph(graph)?;
        graph.init_section(index, nodes, first, count)
    }

    /// Return the graph's section slots to the region, waiting for any
    /// in-flight processing of it to finish first.  Nodes are untouched.
    pub async fn free_graph(&self, graph: KernelGraph) -> Result<()> {
        let exec = graph.exec_lock();
        let _running = exec.lock().await;
        let sections = self.inner.region.release(graph.id())?;
        tracing::debug!(graph = %graph.id(), sections, "graph freed");
        Ok(())
    }

    // -- Verification -------------------------------------------------------

    /// Check every node of one section against the routing table.  Nodes no
    /// manager can run are marked [`NodeStatus::KernelNotSupported`].
    /// Returns the number of runnable nodes.  Affinity is never changed.
    pub fn verify(&self, graph: &KernelGraph, index: usize) -> Result<usize> {
        self.check_graph(graph)?;
        if index >= graph.section_count() {
            return Err(KernelError::SectionOutOfRange {
                section: index,
                count: graph.section_count(),
            });
        }
        let section = graph
            .section(index)
            .ok_or(KernelError::SectionUninitialized { section: index })?;
        Ok(self.inner.verify_section(&section))
    }

    /// Verify every section and mark the graph verified so later `process`
    /// calls skip the check.
    pub fn verify_graph(&self, graph: &KernelGraph) -> Result<usize> {
        self.check_graph(graph)?;
        let sections = graph.partition()?;
        let valid = sections.iter().map(|s| self.inner.verify_section(s)).sum();
        graph.set_verified(true);
        tracing::debug!(graph = %graph.id(), valid, "graph verified");
        Ok(valid)
    }

    // -- Processing ---------------------------------------------------------

    /// Dispatch every section of `graph`.
    ///
    /// Shape errors are reported synchronously.  Per-node failures are
    /// recorded in node status fields and in each completion's executed
    /// count.
    pub async fn process(&self, graph: &KernelGraph, dispatch: Dispatch) -> Result<CompletionStream> {
        self.ensure_running()?;
        self.check_graph(graph)?;
        let sections = graph.partition()?;

        let expected = sections.len();
        let (tx, rx) = mpsc::channel(expected);
        let run = run_graph(Arc::clone(&self.inner), graph.clone(), sections, tx);
        match dispatch {
            Dispatch::Sync => run.await,
            Dispatch::Async => {
                tokio::spawn(run);
            }
        }
        Ok(CompletionStream { rx, expected })
    }

    /// [`process`](Self::process) with [`Dispatch::Sync`], returning the
    /// completions in the order they were emitted.
    pub async fn process_sync(&self, graph: &KernelGraph) -> Result<Vec<SectionCompletion>> {
        let stream = self.process(graph, Dispatch::Sync).await?;
        Ok(stream.collect_all().await)
    }

    // -- Capacity and introspection -----------------------------------------

    /// Set the capacity limit of `core`, clamped to `0..=1000`.
    pub fn set_capacity(&self, core: CoreType, limit: i64) -> Result<u32> {
        self.ensure_core(core)?;
        self.inner.load.set_capacity(core, limit)
    }

    pub fn get_capacity(&self, core: CoreType) -> Result<u32> {
        self.ensure_core(core)?;
        self.inner.load.capacity(core)
    }

    pub fn query_core(&self, core: CoreType) -> Option<CoreInfo> {
        let load = self.inner.load.load(core)?;
        let managers = self
            .inner
            .managers
            .iter()
            .filter(|e| e.info.core == core)
            .map(|e| e.info.clone())
            .collect();
        Some(CoreInfo {
            core,
            load,
            managers,
        })
    }

    /// The manager that would run `kernel` on `core`.
    pub fn query_core_for_kernel(&self, kernel: KernelId, core: CoreType) -> Option<ManagerInfo> {
        self.inner
            .managers
            .route(kernel, core)
            .map(|e| e.info.clone())
    }

    // -- Buffers ------------------------------------------------------------

    /// Allocate a single-plane 8-bit image.
    pub fn alloc_image(&self, mem_type: MemType, width: u32, height: u32) -> Result<(Buffer, Image)> {
        let buffer = self
            .inner
            .memory
            .calloc(mem_type, &[PlaneLayout::new(width, height, 1)])?;
        let plane = buffer
            .plane(0)
            .cloned()
            .ok_or(dvp_mem::MemError::PlaneCount {
                count: buffer.plane_count(),
            })?;
        Ok((buffer, Image::new(plane)))
    }

    /// Purge remote translations of every plane, then free the buffer.
    pub fn free_buffer(&self, buffer: Buffer) -> Result<()> {
        if let Some(rpc) = &self.inner.rpc {
            for plane in buffer.planes() {
                rpc.mem_remove(plane.addr(), plane.size(), plane.mem_type());
            }
        }
        self.inner.memory.free(buffer)?;
        Ok(())
    }

    // -- Private helpers ----------------------------------------------------

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(KernelError::ShutDown);
        }
        Ok(())
    }

    fn ensure_core(&self, core: CoreType) -> Result<()> {
        if core.is_concrete() && self.inner.managers.has_enabled(core) {
            Ok(())
        } else {
            Err(KernelError::CoreUnavailable { core })
        }
    }

    fn check_graph(&self, graph: &KernelGraph) -> Result<()> {
        if self.inner.region.contains(graph.id()) {
            Ok(())
        } else {
            Err(KernelError::GraphNotFound { graph: graph.id() })
        }
    }
}

impl BossInner {
    fn verify_section(&self, section: &Section) -> usize {
        let mut guard = section.nodes().lock();
        let Some(nodes) = guard.get_mut(section.range()) else {
            return 0;
        };
        let mut valid = 0;
        for node in nodes {
            if self.managers.route(node.kernel, node.affinity).is_some() {
                if node.status == NodeStatus::KernelNotSupported {
                    node.status = NodeStatus::Pending;
                }
                valid += 1;
            } else {
                if node.status != NodeStatus::KernelNotSupported {
                    tracing::warn!(kernel = %node.kernel, core = %node.affinity, "kernel not supported on core");
                }
                node.status = NodeStatus::KernelNotSupported;
            }
        }
        valid
    }

    /// Copy the section's nodes out, execute them, and write them back.
    async fn run_section(&self, graph: &KernelGraph, index: usize, section: &Section) -> usize {
        graph.start_section(index);
        let range = section.range();
        let copied = section.nodes().lock().get(range.clone()).map(<[KernelNode]>::to_vec);
        let Some(mut work) = copied else {
            tracing::warn!(section = index, "section range no longer fits its node array");
            graph.finish_section(index);
            return 0;
        };

        let executed = self.execute_nodes(&mut work).await;

        if let Some(slot) = section.nodes().lock().get_mut(range) {
            slot.clone_from_slice(&work);
        }
        graph.finish_section(index);
        executed
    }

    /// Split nodes into runs of the same routed manager and dispatch each.
    async fn execute_nodes(&self, work: &mut [KernelNode]) -> usize {
        let mut executed = 0;
        let mut start = 0;
        while start < work.len() {
            let Some(target) = self.resolve(&mut work[start]) else {
                start += 1;
                continue;
            };
            let mut end = start + 1;
            while end < work.len() && self.resolve(&mut work[end]) == Some(target) {
                end += 1;
            }
            executed += self.dispatch_run(target, &mut work[start..end]).await;
            start = end;
        }
        executed
    }

    /// Routed manager for a node, resolving [`CoreType::Any`] affinity.
    fn resolve(&self, node: &mut KernelNode) -> Option<usize> {
        if node.status == NodeStatus::KernelNotSupported {
            return None;
        }
        let Some(entry) = self.managers.route(node.kernel, node.affinity) else {
            node.status = NodeStatus::KernelNotSupported;
            return None;
        };
        if node.affinity == CoreType::Any {
            node.affinity = entry.info.core;
        }
        Some(entry.sequence())
    }

    async fn dispatch_run(&self, sequence: usize, nodes: &mut [KernelNode]) -> usize {
        let Some(entry) = self.managers.get(sequence) else {
            return 0;
        };
        let core = entry.info.core;
        let cost = u32::try_from(nodes.len()).unwrap_or(u32::MAX);
        let Some(_admitted) = self.load.admit(core, cost) else {
            tracing::warn!(manager = %entry.info.name, %core, nodes = nodes.len(), "run throttled by capacity");
            for node in nodes.iter_mut() {
                node.status = NodeStatus::Throttled;
            }
            return 0;
        };
        tracing::debug!(manager = %entry.info.name, %core, nodes = nodes.len(), "dispatching run");
        entry.manager.execute(nodes).await
    }
}

/// Drive one `process` call to completion.
async fn run_graph(
    inner: Arc<BossInner>,
    graph: KernelGraph,
    sections: Vec<Section>,
    tx: mpsc::Sender<SectionCompletion>,
) {
    let exec = graph.exec_lock();
    let _running = exec.lock().await;

    if !inner.region.contains(graph.id()) {
        tracing::debug!(graph = %graph.id(), "graph freed before dispatch; skipping");
        return;
    }

    if !graph.is_verified() {
        let valid: usize = sections.iter().map(|s| inner.verify_section(s)).sum();
        graph.set_verified(true);
        tracing::debug!(graph = %graph.id(), valid, "graph verified on first process");
    }

    graph.with_perf(PerfRecord::start);
    for (rank, indices) in graph.ranks() {
        let mut running: FuturesUnordered<_> = indices
            .into_iter()
            .filter_map(|index| sections.get(index).map(|s| (index, s)))
            .map(|(index, section)| {
                let inner = &inner;
                let graph = &graph;
                async move {
                    let executed = inner.run_section(graph, index, section).await;
                    (index, section.count(), executed)
                }
            })
            .collect();

        while let Some((section, nodes, executed)) = running.next().await {
            tracing::debug!(graph = %graph.id(), rank, section, executed, nodes, "section complete");
            let completion = SectionCompletion {
                graph: graph.id(),
                section,
                executed,
                nodes,
            };
            if tx.send(completion).await.is_err() {
                tracing::debug!(graph = %graph.id(), "completion receiver dropped");
            }
        }
    }
    let elapsed = graph.with_perf(PerfRecord::stop);
    tracing::debug!(graph = %graph.id(), ?elapsed, "graph processed");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels;

    async fn cpu_boss() -> Boss {
        Boss::init(BossConfig::default().with_cpu_workers(2)).await.unwrap()
    }

    fn noop_graph(boss: &Boss, sections: usize, per_section: usize) -> (KernelGraph, NodeArray) {
        let nodes = boss.alloc_nodes(sections * per_section);
        let graph = boss.alloc_graph(sections).unwrap();
        for s in 0..sections {
            boss.init_section(&graph, s, &nodes, s * per_section, per_section)
                .unwrap();
        }
        (graph, nodes)
    }

    #[tokio::test]
    async fn zero_region_fails_init() {
        let result = Boss::init(BossConfig::default().with_region_sections(0)).await;
        assert!(matches!(result, Err(KernelError::RegionUnavailable { .. })));
    }

    #[tokio::test]
    async fn remote_manager_needs_transport() {
        let result = Boss::builder(BossConfig::default())
            .register(DspManager::new(DSP_REMOTE_CORE), 1)
            .init()
            .await;
        assert!(matches!(result, Err(KernelError::NoTransport { .. })));
    }

    #[tokio::test]
    async fn any_affinity_is_resolved_on_process() {
        let boss = cpu_boss().await;
        let (graph, nodes) = noop_graph(&boss, 1, 2);
        assert_eq!(boss.verify(&graph, 0).unwrap(), 2);
        assert!(nodes.snapshot().iter().all(|n| n.affinity == CoreType::Any));

        let completions = boss.process_sync(&graph).await.unwrap();
        assert_eq!(completions.len(), 1);
        assert!(completions[0].is_complete());
        assert!(nodes.snapshot().iter().all(|n| n.affinity == CoreType::Cpu && n.status == NodeStatus::Ok));
        assert!(graph.section(0).unwrap().is_primed());
        assert_eq!(graph.perf().runs, 1);
    }

    #[tokio::test]
    async fn capacity_zero_throttles() {
        let boss = cpu_boss().await;
        let (graph, nodes) = noop_graph(&boss, 1, 3);
        assert_eq!(boss.set_capacity(CoreType::Cpu, -40).unwrap(), 0);

        let completions = boss.process_sync(&graph).await.unwrap();
        assert_eq!(completions[0].executed, 0);
        assert!(nodes.snapshot().iter().all(|n| n.status == NodeStatus::Throttled));

        assert_eq!(boss.set_capacity(CoreType::Cpu, 5000).unwrap(), 1000);
        let completions = boss.process_sync(&graph).await.unwrap();
        assert_eq!(completions[0].executed, 3);
    }

    #[tokio::test]
    async fn capacity_on_missing_core_is_rejected() {
        let boss = cpu_boss().await;
        assert!(matches!(
            boss.set_capacity(CoreType::Gpu, 10),
            Err(KernelError::CoreUnavailable { core: CoreType::Gpu })
        ));
        assert!(boss.get_capacity(CoreType::Any).is_err());
        assert_eq!(boss.get_capacity(CoreType::Cpu).unwrap(), 1000);
    }

    #[tokio::test]
    async fn deinit_is_idempotent_and_blocks_new_work() {
        let boss = cpu_boss().await;
        let (graph, _nodes) = noop_graph(&boss, 1, 1);
        boss.deinit().await;
        boss.deinit().await;
        assert!(boss.is_shut_down());
        assert!(matches!(boss.alloc_graph(1), Err(KernelError::ShutDown)));
        assert!(matches!(
            boss.process(&graph, Dispatch::Sync).await,
            Err(KernelError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn freed_graphs_are_unknown() {
        let boss = cpu_boss().await;
        let (graph, nodes) = noop_graph(&boss, 2, 1);
        assert!(!boss.free_nodes(nodes.clone()));
        boss.free_graph(graph.clone()).await.unwrap();
        assert!(matches!(
            boss.verify_graph(&graph),
            Err(KernelError::GraphNotFound { .. })
        ));
        assert!(boss.free_graph(graph).await.is_err());
        assert!(boss.free_nodes(nodes));
    }

    #[tokio::test]
    async fn async_dispatch_skips_a_graph_freed_first() {
        let boss = cpu_boss().await;
        let (graph, nodes) = noop_graph(&boss, 2, 2);

        let stream = boss.process(&graph, Dispatch::Async).await.unwrap();
        boss.free_graph(graph.clone()).await.unwrap();

        assert_eq!(stream.expected(), 2);
        assert!(stream.collect_all().await.is_empty());
        assert!(nodes.snapshot().iter().all(|n| n.status == NodeStatus::Pending));
        assert_eq!(graph.perf().runs, 0);
    }

    #[tokio::test]
    async fn query_core_for_kernel_reports_router_choice() {
        let boss = cpu_boss().await;
        let info = boss
            .query_core_for_kernel(kernels::THRESHOLD, CoreType::Any)
            .unwrap();
        assert_eq!(info.core, CoreType::Cpu);
        assert!(boss.query_core_for_kernel(kernels::ADD, CoreType::Dsp).is_none());
        let core = boss.query_core(CoreType::Cpu).unwrap();
        assert_eq!(core.managers.len(), 1);
        assert_eq!(core.load.limit, 1000);
        assert!(boss.query_core(CoreType::Dsp).is_none());
    }
}
