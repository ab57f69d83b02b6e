//! End-to-end tests for the RPC context over the loopback transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use dvp_mem::{MemType, MemoryConfig, MemoryManager, PlaneLayout};
use dvp_rpc::{
    ChannelState, Direction, LoopbackTransport, PointerPatch, RemoteCore, RestartOutcome,
    RpcConfig, RpcContext, RpcError, RpcParam, Transport, Translation,
};

fn context(retries: u32) -> (Arc<LoopbackTransport>, RpcContext) {
    let transport = Arc::new(LoopbackTransport::new());
    let ctx = RpcContext::new(
        Arc::clone(&transport) as Arc<dyn Transport>,
        MemoryManager::new(MemoryConfig::default()),
        RpcConfig::new().with_restart_retries(retries),
    );
    (transport, ctx)
}

/// Remote function 0: sum the bytes of the buffer in param 0 (length in param 1).
fn install_sum(transport: &LoopbackTransport) {
    transport.register_function(
        0,
        Arc::new(|memory, params| {
            let addr = params[0].read_pointer(0).unwrap_or(0);
            let len = params[1].read_u32(0).unwrap_or(0) as usize;
            memory
                .read(addr, len)
                .map(|bytes| bytes.iter().map(|b| *b as i32).sum())
                .unwrap_or(-1)
        }),
    );
}

fn sum_call(addr: u64, len: u32, mem_type: MemType) -> (Vec<RpcParam>, Translation) {
    let params = vec![
        RpcParam::pointer(Direction::ReadOnly, addr),
        RpcParam::value(len),
    ];
    let mut xlate = Translation::new();
    xlate
        .push(PointerPatch {
            param: 0,
            offset: 0,
            len: len as usize,
            mem_type,
        })
        .unwrap();
    (params, xlate)
}

#[test]
fn flush_makes_cpu_writes_visible_remotely() {
    let (transport, ctx) = context(3);
    install_sum(&transport);
    let core = RemoteCore(0);
    ctx.open(core).unwrap();

    let buffer = ctx
        .memory()
        .calloc(MemType::Tiled2dCached, &[PlaneLayout::new(16, 4, 1)])
        .unwrap();
    let plane = buffer.plane(0).unwrap();
    plane.storage().write()[..4].copy_from_slice(&[10, 20, 30, 40]);

    let (mut params, xlate) = sum_call(plane.addr(), 4, MemType::Tiled2dCached);
    assert_eq!(ctx.remote_execute(core, 0, &mut params, &xlate).unwrap(), 100);

    // A second call reuses the cached mapping.
    plane.storage().write()[0] = 0;
    assert_eq!(ctx.remote_execute(core, 0, &mut params, &xlate).unwrap(), 90);
    assert_eq!(transport.mapping_count(core), 1);

    let removed = ctx.mem_remove(plane.addr(), plane.size(), MemType::Tiled2dCached);
    assert_eq!(removed, 1);
    ctx.memory().free(buffer).unwrap();
}

#[test]
fn unflushed_writes_stay_invisible_remotely() {
    let (transport, ctx) = context(3);
    install_sum(&transport);
    let core = RemoteCore(0);
    ctx.open(core).unwrap();

    let buffer = ctx
        .memory()
        .calloc(MemType::Tiled1dCached, &[PlaneLayout::linear(4, 1)])
        .unwrap();
    let plane = buffer.plane(0).unwrap();
    plane.storage().write()[..4].copy_from_slice(&[1, 1, 1, 1]);

    // Direct call without a translation table: the remote side sees the
    // unflushed device view.
    let remote = ctx
        .mem_xlate_forward(core, plane.addr(), 4, MemType::Tiled1dCached)
        .unwrap();
    let mut params = vec![
        RpcParam::pointer(Direction::ReadOnly, remote),
        RpcParam::value(4),
    ];
    assert_eq!(
        ctx.remote_execute(core, 0, &mut params, &Translation::new())
            .unwrap(),
        0
    );

    assert_eq!(
        ctx.flush(core, plane.addr(), 4, MemType::Tiled1dCached).unwrap(),
        4
    );
    assert_eq!(
        ctx.remote_execute(core, 0, &mut params, &Translation::new())
            .unwrap(),
        4
    );
}

#[test]
fn restart_retries_are_bounded() {
    let (transport, ctx) = context(3);
    install_sum(&transport);
    let core = RemoteCore(4);
    ctx.open(core).unwrap();

    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&outcomes);
    ctx.restart_callback_register(
        core,
        Arc::new(move |event| sink.lock().unwrap().push(event.outcome)),
        3,
    )
    .unwrap();

    let opens = transport.open_count();
    transport.inject_peer_restarts(1);
    transport.refuse_opens(u32::MAX);

    let result = ctx.remote_execute(core, 0, &mut [], &Translation::new());
    assert!(matches!(result, Err(RpcError::PeerRestarted { .. })));
    assert_eq!(
        *outcomes.lock().unwrap(),
        vec![RestartOutcome::Failed { attempts: 3 }]
    );
    assert_eq!(transport.open_count(), opens);
    assert_eq!(ctx.state(core), Some(ChannelState::Closed));

    // An explicit reopen brings the channel back.
    transport.refuse_opens(0);
    ctx.open(core).unwrap();
    assert_eq!(ctx.state(core), Some(ChannelState::Connected));
}

#[test]
fn restart_on_one_core_does_not_disturb_another() {
    let (transport, ctx) = context(2);
    install_sum(&transport);
    let a = RemoteCore(1);
    let b = RemoteCore(2);
    ctx.open(a).unwrap();
    ctx.open(b).unwrap();

    let buffer = ctx
        .memory()
        .calloc(MemType::Virtual, &[PlaneLayout::linear(2, 1)])
        .unwrap();
    let plane = buffer.plane(0).unwrap();
    plane.storage().write()[..2].copy_from_slice(&[3, 4]);
    ctx.mem_xlate_forward(b, plane.addr(), 2, MemType::Virtual)
        .unwrap();

    transport.inject_peer_restarts(1);
    let (mut params, xlate) = sum_call(plane.addr(), 2, MemType::Virtual);
    assert!(ctx.remote_execute(a, 0, &mut params, &xlate).is_err());
    assert_eq!(params[0].read_pointer(0), Some(plane.addr()));

    assert_eq!(ctx.mapping_count(a), 0);
    assert_eq!(ctx.mapping_count(b), 1);
    assert_eq!(ctx.remote_execute(b, 0, &mut params, &xlate).unwrap(), 7);
    assert_eq!(ctx.remote_execute(a, 0, &mut params, &xlate).unwrap(), 7);
}

#[test]
fn concurrent_calls_share_one_mapping() {
    let (transport, ctx) = context(3);
    install_sum(&transport);
    let core = RemoteCore(0);
    ctx.open(core).unwrap();

    let buffer = ctx
        .memory()
        .calloc(MemType::SharedVirtual, &[PlaneLayout::linear(8, 1)])
        .unwrap();
    let plane = buffer.plane(0).unwrap().clone();
    plane.storage().write()[..8].copy_from_slice(&[1; 8]);

    let ok = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let ctx = ctx.clone();
            let ok = Arc::clone(&ok);
            let addr = plane.addr();
            thread::spawn(move || {
                for _ in 0..16 {
                    let (mut params, xlate) = sum_call(addr, 8, MemType::SharedVirtual);
                    if matches!(ctx.remote_execute(core, 0, &mut params, &xlate), Ok(8)) {
                        ok.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(ok.load(Ordering::SeqCst), 128);
    assert_eq!(transport.mapping_count(core), 1);
    assert_eq!(transport.call_count(), 128);
}

#[test]
fn shutdown_closes_every_channel() {
    let (transport, ctx) = context(3);
    for n in 0..3 {
        ctx.open(RemoteCore(n)).unwrap();
    }
    let buffer = ctx
        .memory()
        .calloc(MemType::Virtual, &[PlaneLayout::linear(8, 1)])
        .unwrap();
    let plane = buffer.plane(0).unwrap();
    ctx.mem_xlate_forward(RemoteCore(1), plane.addr(), 8, MemType::Virtual)
        .unwrap();

    ctx.shutdown();
    for n in 0..3 {
        assert_eq!(ctx.state(RemoteCore(n)), None);
    }
    assert_eq!(transport.mapping_count(RemoteCore(1)), 0);
}

#[test]
fn config_deserializes_with_defaults() {
    let config: RpcConfig = serde_json::from_str("{}").unwrap();
    assert_eq!(config.restart_retries, 3);
    let config: RpcConfig = serde_json::from_str(r#"{"restart_retries": 7}"#).unwrap();
    assert_eq!(config.restart_retries, 7);
}
