//! Remote DSP manager.
//!
//! Executes the built-in kernels on a remote core through the
//! [`RpcContext`].  Every node becomes one `remote_execute` call, issued on
//! tokio's blocking pool since the transport is synchronous: a header
//! parameter carrying the kernel, scalar value and geometry, then one
//! parameter per image holding its pointer and stride.  Image pointers are
//! listed in the call's translation table so the context maps them, flushes
//! inputs before the call and invalidates the output after it.
//!
//! [`firmware`] holds the remote side of the protocol for the loopback
//! transport.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use dvp_rpc::{
    Direction, PointerPatch, RemoteCore, RestartEvent, RpcContext, RpcParam, Translation,
};

use crate::error::{KernelError, Result};
use crate::graph::{CoreType, KernelId, KernelNode, NodeStatus};
use crate::kernels;
use crate::manager::{GraphManager, ManagerContext};

/// Remote core the default DSP manager drives.
pub const DSP_REMOTE_CORE: RemoteCore = RemoteCore(1);

const DSP_CLOCK_HZ: u64 = 600_000_000;
const DSP_MAXIMUM_LOAD: u32 = 800;

/// Parameter layout shared by the manager and the firmware.
mod wire {
    /// `kernel, value, width, height, image count`, little-endian u32 each.
    pub const HEADER_LEN: usize = 20;
    /// `pointer (u64), stride (u32)`.
    pub const IMAGE_LEN: usize = 12;
    pub const STRIDE_OFFSET: usize = 8;
}

/// Firmware return codes.
pub mod status {
    pub const OK: i32 = 0;
    pub const BAD_PARAMS: i32 = -1;
    pub const UNSUPPORTED: i32 = -2;
    pub const FAULT: i32 = -3;
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct DspManager {
    remote: RemoteCore,
    rpc: RwLock<Option<RpcContext>>,
    online: AtomicBool,
    restarts: AtomicU64,
}

impl DspManager {
    pub fn new(remote: RemoteCore) -> Self {
        Self {
            remote,
            rpc: RwLock::new(None),
            online: AtomicBool::new(false),
            restarts: AtomicU64::new(0),
        }
    }

    /// Restarts observed since init.
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn context(&self) -> Option<RpcContext> {
        self.rpc
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run one node's remote call on the blocking pool.
    async fn dispatch(&self, rpc: RpcContext, node: &KernelNode) -> NodeStatus {
        let remote = self.remote;
        let job = node.clone();
        let handle = tokio::task::spawn_blocking(move || run_remote(remote, &rpc, &job));
        match handle.await {
            Ok(status) => status,
            Err(err) => {
                tracing::warn!(core = %remote, kernel = %node.kernel, error = %err, "remote call task failed");
                NodeStatus::RemoteFailure
            }
        }
    }
}

/// Header parameter: kernel, value, width, height and image count.
fn encode_header(node: &KernelNode, width: u32, height: u32) -> Option<Vec<u8>> {
    let count = u32::try_from(node.images.len()).ok()?;
    let mut header = Vec::with_capacity(wire::HEADER_LEN);
    for field in [node.kernel.0, node.value, width, height, count] {
        header.extend_from_slice(&field.to_le_bytes());
    }
    Some(header)
}

/// Image parameter: pointer followed by row stride.
fn encode_image(addr: u64, stride: usize) -> Option<Vec<u8>> {
    let stride = u32::try_from(stride).ok()?;
    let mut data = Vec::with_capacity(wire::IMAGE_LEN);
    data.extend_from_slice(&addr.to_le_bytes());
    data.extend_from_slice(&stride.to_le_bytes());
    Some(data)
}

fn run_remote(remote: RemoteCore, rpc: &RpcContext, node: &KernelNode) -> NodeStatus {
    let Some(spec) = kernels::describe(node.kernel) else {
        return NodeStatus::KernelNotSupported;
    };
    if node.images.len() != spec.images() {
        return NodeStatus::InvalidParameters;
    }
    let (width, height) = match node.images.last() {
        Some(output) => {
            if node
                .images
                .iter()
                .any(|i| !i.is_8bit() || !i.same_shape(output))
            {
                return NodeStatus::InvalidParameters;
            }
            (output.width(), output.height())
        }
        None => (0, 0),
    };

    let Some(header) = encode_header(node, width, height) else {
        return NodeStatus::InvalidParameters;
    };
    let mut params = vec![RpcParam::new(Direction::ReadOnly, header)];
    let mut translation = Translation::new();

    for (index, image) in node.images.iter().enumerate() {
        let plane = image.plane();
        let direction = if index < spec.inputs {
            Direction::ReadOnly
        } else {
            Direction::WriteOnly
        };
        let Some(data) = encode_image(plane.addr(), plane.stride()) else {
            return NodeStatus::InvalidParameters;
        };
        params.push(RpcParam::new(direction, data));
        let patch = PointerPatch {
            param: index + 1,
            offset: 0,
            len: plane.used_range().end,
            mem_type: plane.mem_type(),
        };
        if translation.push(patch).is_err() {
            return NodeStatus::InvalidParameters;
        }
    }

    match rpc.remote_execute(remote, firmware::FN_KERNEL, &mut params, &translation) {
        Ok(status::OK) => NodeStatus::Ok,
        Ok(status::BAD_PARAMS) => NodeStatus::InvalidParameters,
        Ok(status::UNSUPPORTED) => NodeStatus::KernelNotSupported,
        Ok(code) => {
            tracing::debug!(core = %remote, kernel = %node.kernel, code, "firmware error");
            NodeStatus::ExecutionFailed
        }
        Err(err) => {
            tracing::warn!(core = %remote, kernel = %node.kernel, error = %err, "remote call failed");
            NodeStatus::RemoteFailure
        }
    }
}

#[async_trait]
impl GraphManager for DspManager {
    fn name(&self) -> &str {
        "dsp"
    }

    fn core(&self) -> CoreType {
        CoreType::Dsp
    }

    fn supported_kernels(&self) -> Vec<KernelId> {
        kernels::BUILTIN.to_vec()
    }

    fn supported_remote_calls(&self) -> Vec<u32> {
        vec![firmware::FN_PING, firmware::FN_KERNEL]
    }

    fn maximum_load(&self) -> u32 {
        DSP_MAXIMUM_LOAD
    }

    fn remote_core(&self) -> Option<RemoteCore> {
        Some(self.remote)
    }

    async fn init(&self, ctx: ManagerContext) -> Result<()> {
        let rpc = ctx.rpc.ok_or_else(|| KernelError::NoTransport {
            manager: self.name().to_string(),
        })?;
        rpc.open(self.remote)?;
        let pong = rpc.remote_execute(self.remote, firmware::FN_PING, &mut [], &Translation::new());
        match pong {
            Ok(status::OK) => {}
            Ok(code) => {
                rpc.close(self.remote);
                return Err(KernelError::ManagerInit {
                    manager: self.name().to_string(),
                    reason: format!("firmware answered ping with {code}"),
                });
            }
            Err(err) => {
                rpc.close(self.remote);
                return Err(err.into());
            }
        }
        *self.rpc.write().unwrap_or_else(PoisonError::into_inner) = Some(rpc);
        self.online.store(true, Ordering::SeqCst);
        tracing::info!(core = %self.remote, "dsp manager ready");
        Ok(())
    }

    async fn deinit(&self) {
        self.online.store(false, Ordering::SeqCst);
        let rpc = self
            .rpc
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(rpc) = rpc {
            rpc.close(self.remote);
        }
        tracing::info!(core = %self.remote, "dsp manager stopped");
    }

    fn restart(&self, event: &RestartEvent) {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        let recovered = event.recovered();
        self.online.store(recovered, Ordering::SeqCst);
        if recovered {
            tracing::info!(core = %event.core, outcome = ?event.outcome, "dsp reconnected");
        } else {
            tracing::warn!(core = %event.core, outcome = ?event.outcome, "dsp lost; failing further work");
        }
    }

    async fn execute(&self, nodes: &mut [KernelNode]) -> usize {
        let rpc = self.context();
        let mut executed = 0;
        for node in nodes.iter_mut() {
            node.perf.clock_rate_hz = DSP_CLOCK_HZ;
            node.perf.start();
            node.status = match (&rpc, self.is_online()) {
                (Some(rpc), true) => self.dispatch(rpc.clone(), node).await,
                _ => NodeStatus::RemoteFailure,
            };
            node.perf.stop();
            if node.status == NodeStatus::Ok {
                executed += 1;
            }
        }
        executed
    }
}

// ---------------------------------------------------------------------------
// Firmware
// ---------------------------------------------------------------------------

/// Remote side of the DSP protocol, installable on a loopback transport.
pub mod firmware {
    use std::sync::Arc;

    use dvp_rpc::{LoopbackTransport, RemoteMemory, RpcParam};

    use super::{status, wire};
    use crate::graph::KernelId;
    use crate::kernels;

    pub const FN_PING: u32 = 0;
    pub const FN_KERNEL: u32 = 1;

    /// Register every firmware function on `transport`.
    pub fn install(transport: &LoopbackTransport) {
        transport.register_function(FN_PING, Arc::new(|_, _| status::OK));
        transport.register_function(FN_KERNEL, Arc::new(run_kernel));
    }

    fn run_kernel(memory: &RemoteMemory, params: &mut [RpcParam]) -> i32 {
        let Some((header, images)) = params.split_first() else {
            return status::BAD_PARAMS;
        };
        let field = |n: usize| header.read_u32(n * 4);
        let (Some(kernel), Some(value), Some(width), Some(height), Some(count)) =
            (field(0), field(1), field(2), field(3), field(4))
        else {
            return status::BAD_PARAMS;
        };
        let Some(spec) = kernels::describe(KernelId(kernel)) else {
            return status::UNSUPPORTED;
        };
        if count as usize != spec.images() || images.len() != spec.images() {
            return status::BAD_PARAMS;
        }
        if spec.outputs == 0 {
            return status::OK;
        }
        if width == 0 || height == 0 {
            return status::BAD_PARAMS;
        }

        let mut planes = Vec::with_capacity(images.len());
        for param in images {
            if param.size() < wire::IMAGE_LEN {
                return status::BAD_PARAMS;
            }
            match (param.read_pointer(0), param.read_u32(wire::STRIDE_OFFSET)) {
                (Some(addr), Some(stride)) => planes.push((addr, stride as u64)),
                _ => return status::BAD_PARAMS,
            }
        }

        let width = width as usize;
        let mut inputs = Vec::with_capacity(spec.inputs);
        for (addr, stride) in &planes[..spec.inputs] {
            let mut pixels = Vec::with_capacity(width * height as usize);
            for y in 0..u64::from(height) {
                match memory.read(addr + y * stride, width) {
                    Some(row) => pixels.extend_from_slice(&row),
                    None => return status::FAULT,
                }
            }
            inputs.push(pixels);
        }
        let views: Vec<&[u8]> = inputs.iter().map(Vec::as_slice).collect();
        let Some(output) = kernels::apply(KernelId(kernel), &views, value) else {
            return status::BAD_PARAMS;
        };

        let (addr, stride) = planes[spec.inputs];
        for (y, row) in output.chunks_exact(width).enumerate() {
            if !memory.write(addr + y as u64 * stride, row) {
                return status::FAULT;
            }
        }
        status::OK
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use crate::image::Image;
    use dvp_mem::{MemType, MemoryConfig, MemoryManager, PlaneLayout};
    use dvp_rpc::{LoopbackTransport, RpcConfig, Transport};

    fn setup() -> (Arc<LoopbackTransport>, MemoryManager, ManagerContext) {
        let transport = Arc::new(LoopbackTransport::new());
        firmware::install(&transport);
        let memory = MemoryManager::new(MemoryConfig::default());
        let rpc = RpcContext::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            memory.clone(),
            RpcConfig::default(),
        );
        let ctx = ManagerContext {
            memory: memory.clone(),
            rpc: Some(rpc),
        };
        (transport, memory, ctx)
    }

    fn image(memory: &MemoryManager, mem_type: MemType) -> Image {
        let buffer = memory
            .calloc(mem_type, &[PlaneLayout::new(16, 4, 1)])
            .unwrap();
        Image::new(buffer.plane(0).unwrap().clone())
    }

    #[tokio::test]
    async fn executes_remotely_with_cache_maintenance() {
        let (transport, memory, ctx) = setup();
        let manager = DspManager::new(DSP_REMOTE_CORE);
        manager.init(ctx).await.unwrap();

        let a = image(&memory, MemType::Tiled2dCached);
        let b = image(&memory, MemType::Tiled1dCached);
        let out = image(&memory, MemType::Tiled2dCached);
        a.fill(0b1010_1010);
        b.fill(0b0110_0110);

        let mut nodes = vec![
            KernelNode::new(kernels::XOR, CoreType::Dsp).with_images(vec![a, b, out.clone()]),
        ];
        assert_eq!(manager.execute(&mut nodes).await, 1);
        assert_eq!(nodes[0].status, NodeStatus::Ok);
        assert!(out.read_pixels().iter().all(|p| *p == 0b1100_1100));
        assert!(transport.call_count() >= 2);
    }

    #[tokio::test]
    async fn init_requires_rpc() {
        let manager = DspManager::new(DSP_REMOTE_CORE);
        let ctx = ManagerContext {
            memory: MemoryManager::default(),
            rpc: None,
        };
        assert!(matches!(
            manager.init(ctx).await,
            Err(KernelError::NoTransport { .. })
        ));
    }

    #[tokio::test]
    async fn unrecovered_restart_fails_further_work() {
        let (_transport, _memory, ctx) = setup();
        let manager = DspManager::new(DSP_REMOTE_CORE);
        manager.init(ctx).await.unwrap();

        manager.restart(&RestartEvent {
            core: DSP_REMOTE_CORE,
            outcome: dvp_rpc::RestartOutcome::Failed { attempts: 3 },
        });
        assert_eq!(manager.restarts(), 1);
        assert!(!manager.is_online());

        let mut nodes = vec![KernelNode::new(kernels::NOOP, CoreType::Dsp)];
        assert_eq!(manager.execute(&mut nodes).await, 0);
        assert_eq!(nodes[0].status, NodeStatus::RemoteFailure);
    }

    #[tokio::test]
    async fn wrong_shapes_are_rejected_locally() {
        let (transport, memory, ctx) = setup();
        let manager = DspManager::new(DSP_REMOTE_CORE);
        manager.init(ctx).await.unwrap();
        let calls = transport.call_count();

        let src = image(&memory, MemType::Virtual);
        let mut nodes = vec![KernelNode::new(kernels::COPY, CoreType::Dsp).with_images(vec![src])];
        assert_eq!(manager.execute(&mut nodes).await, 0);
        assert_eq!(nodes[0].status, NodeStatus::InvalidParameters);
        assert_eq!(transport.call_count(), calls);
    }

    #[tokio::test]
    async fn remote_calls_do_not_stall_the_runtime() {
        let (transport, _memory, ctx) = setup();
        let manager = DspManager::new(DSP_REMOTE_CORE);
        manager.init(ctx).await.unwrap();
        transport.register_function(
            firmware::FN_KERNEL,
            Arc::new(|_, _| {
                std::thread::sleep(Duration::from_millis(200));
                status::OK
            }),
        );

        let ticks = Arc::new(AtomicU32::new(0));
        let ticker = tokio::spawn({
            let ticks = Arc::clone(&ticks);
            async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    ticks.fetch_add(1, Ordering::SeqCst);
                }
            }
        });

        let mut nodes = vec![KernelNode::new(kernels::NOOP, CoreType::Dsp)];
        assert_eq!(manager.execute(&mut nodes).await, 1);
        ticker.abort();
        assert!(ticks.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn oversized_wire_fields_are_rejected() {
        assert_eq!(encode_image(0x1000, usize::MAX), None);
        let data = encode_image(0x1000, 4096).unwrap();
        assert_eq!(data.len(), wire::IMAGE_LEN);
        assert_eq!(&data[wire::STRIDE_OFFSET..], &4096u32.to_le_bytes());

        let node = KernelNode::new(kernels::COPY, CoreType::Dsp).with_value(7);
        let header = encode_header(&node, 16, 4).unwrap();
        assert_eq!(header.len(), wire::HEADER_LEN);
        assert_eq!(&header[4..8], &7u32.to_le_bytes());
    }

    #[test]
    fn firmware_rejects_short_headers() {
        let transport = LoopbackTransport::new();
        firmware::install(&transport);
        transport.open(RemoteCore(0)).unwrap();
        let mut params = [RpcParam::value(kernels::COPY.0)];
        assert_eq!(
            transport.call(RemoteCore(0), firmware::FN_KERNEL, &mut params),
            Ok(status::BAD_PARAMS)
        );
    }
}
