//! Reference CPU manager.
//!
//! Runs the built-in kernels on the blocking thread pool, at most `workers`
//! nodes at a time across all sections.  Nodes within one call run strictly
//! in order, since later nodes of a section may consume earlier outputs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dvp_rpc::RestartEvent;
use tokio::sync::Semaphore;

use crate::error::Result;
use crate::graph::{CoreType, KernelId, KernelNode, NodeStatus};
use crate::kernels;
use crate::manager::{GraphManager, ManagerContext};

/// Nominal clock recorded into node perf records.
const CPU_CLOCK_HZ: u64 = 1_000_000_000;

pub struct CpuManager {
    name: String,
    kernels: Vec<KernelId>,
    workers: Arc<Semaphore>,
    ready: AtomicBool,
}

impl CpuManager {
    pub fn new(workers: usize) -> Self {
        Self {
            name: "cpu".into(),
            kernels: kernels::BUILTIN.to_vec(),
            workers: Arc::new(Semaphore::new(workers.max(1))),
            ready: AtomicBool::new(false),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Restrict the advertised kernel set.
    pub fn with_kernels(mut self, kernels: Vec<KernelId>) -> Self {
        self.kernels = kernels;
        self
    }

    async fn run(&self, node: &KernelNode) -> NodeStatus {
        if !self.kernels.contains(&node.kernel) {
            return NodeStatus::KernelNotSupported;
        }
        let Ok(permit) = Arc::clone(&self.workers).acquire_owned().await else {
            return NodeStatus::ExecutionFailed;
        };
        let job = node.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            kernels::execute_local(&job)
        });
        match handle.await {
            Ok(status) => status,
            Err(err) => {
                tracing::warn!(manager = %self.name, kernel = %node.kernel, error = %err, "kernel task failed");
                NodeStatus::ExecutionFailed
            }
        }
    }
}

#[async_trait]
impl GraphManager for CpuManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn core(&self) -> CoreType {
        CoreType::Cpu
    }

    fn supported_kernels(&self) -> Vec<KernelId> {
        self.kernels.clone()
    }

    fn supported_local_calls(&self) -> Vec<u32> {
        self.kernels.iter().map(|k| k.0).collect()
    }

    async fn init(&self, _ctx: ManagerContext) -> Result<()> {
        self.ready.store(true, Ordering::SeqCst);
        tracing::info!(
            manager = %self.name,
            workers = self.workers.available_permits(),
            "cpu manager ready"
        );
        Ok(())
    }

    async fn deinit(&self) {
        self.ready.store(false, Ordering::SeqCst);
        tracing::info!(manager = %self.name, "cpu manager stopped");
    }

    fn restart(&self, event: &RestartEvent) {
        tracing::debug!(manager = %self.name, core = %event.core, "ignoring restart of a remote core");
    }

    async fn execute(&self, nodes: &mut [KernelNode]) -> usize {
        if !self.ready.load(Ordering::SeqCst) {
            for node in nodes.iter_mut() {
                node.status = NodeStatus::ExecutionFailed;
            }
            return 0;
        }

        let mut executed = 0;
        for node in nodes.iter_mut() {
            node.perf.clock_rate_hz = CPU_CLOCK_HZ;
            node.perf.start();
            node.status = self.run(node).await;
            node.perf.stop();
            if node.status == NodeStatus::Ok {
                executed += 1;
            } else {
                tracing::debug!(manager = %self.name, kernel = %node.kernel, status = ?node.status, "node failed");
            }
        }
        executed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Image;
    use dvp_mem::{MemType, MemoryManager, PlaneLayout};

    fn ctx(memory: &MemoryManager) -> ManagerContext {
        ManagerContext {
            memory: memory.clone(),
            rpc: None,
        }
    }

    #[tokio::test]
    async fn runs_nodes_in_order() {
        let memory = MemoryManager::default();
        let layout = [PlaneLayout::new(8, 8, 1)];
        let a = Image::new(memory.calloc(MemType::Virtual, &layout).unwrap().plane(0).unwrap().clone());
        let b = Image::new(memory.calloc(MemType::Virtual, &layout).unwrap().plane(0).unwrap().clone());
        let c = Image::new(memory.calloc(MemType::Virtual, &layout).unwrap().plane(0).unwrap().clone());
        a.fill(100);

        let manager = CpuManager::new(2);
        manager.init(ctx(&memory)).await.unwrap();
        let mut nodes = vec![
            KernelNode::new(kernels::INVERT, CoreType::Cpu).with_images(vec![a.clone(), b.clone()]),
            KernelNode::new(kernels::THRESHOLD, CoreType::Cpu)
                .with_images(vec![b.clone(), c.clone()])
                .with_value(150),
        ];
        assert_eq!(manager.execute(&mut nodes).await, 2);
        assert!(b.read_pixels().iter().all(|p| *p == 155));
        assert!(c.read_pixels().iter().all(|p| *p == 255));
        assert!(nodes.iter().all(|n| n.perf.runs == 1 && n.perf.clock_rate_hz == CPU_CLOCK_HZ));
    }

    #[tokio::test]
    async fn partial_failure_is_counted() {
        let memory = MemoryManager::default();
        let manager = CpuManager::new(1).with_kernels(vec![kernels::NOOP]);
        manager.init(ctx(&memory)).await.unwrap();

        let mut nodes = vec![
            KernelNode::new(kernels::NOOP, CoreType::Cpu),
            KernelNode::new(kernels::COPY, CoreType::Cpu),
            KernelNode::new(kernels::NOOP, CoreType::Cpu),
        ];
        assert_eq!(manager.execute(&mut nodes).await, 2);
        assert_eq!(nodes[1].status, NodeStatus::KernelNotSupported);
    }

    #[tokio::test]
    async fn refuses_work_before_init() {
        let manager = CpuManager::new(1);
        let mut nodes = vec![KernelNode::default()];
        assert_eq!(manager.execute(&mut nodes).await, 0);
        assert_eq!(nodes[0].status, NodeStatus::ExecutionFailed);
    }
}
