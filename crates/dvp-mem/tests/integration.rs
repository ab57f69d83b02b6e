//! Integration tests for the dvp-mem crate.
//!
//! These tests exercise allocation, sharing and cache maintenance through the
//! public API only.

use dvp_mem::{
    MemError, MemStats, MemType, MemoryConfig, MemoryManager, PlaneLayout, ShareBroker, nv12,
};

#[test]
fn every_type_allocates_and_frees() {
    let mem = MemoryManager::default();
    for mem_type in MemType::ALL {
        let buffer = mem
            .calloc(mem_type, &nv12(64, 48))
            .unwrap_or_else(|e| panic!("{mem_type}: {e}"));
        for plane in buffer.planes() {
            assert!(plane.stride() >= plane.layout().row_bytes());
            assert!(plane.size() >= plane.layout().byte_size());
            assert_eq!(plane.mem_type(), mem_type);
        }
        mem.free(buffer).unwrap();
    }
    assert_eq!(mem.stats(), MemStats::default());
}

#[test]
fn failed_calloc_leaves_nothing_to_free() {
    let mem = MemoryManager::new(MemoryConfig::new().with_limit_bytes(4096 * 3));
    let layouts = [PlaneLayout::linear(4096, 1); 4];

    let err = mem
        .calloc(MemType::Tiled1dCached, &layouts)
        .expect_err("fourth plane exceeds the budget");
    assert!(matches!(err, MemError::OutOfMemory { plane: 3, .. }));
    assert_eq!(mem.stats().live_planes, 0);

    // The full budget is still available afterwards.
    let buffer = mem
        .calloc(MemType::Tiled1dCached, &layouts[..3])
        .expect("budget fully released");
    mem.free(buffer).unwrap();
}

#[test]
fn shared_frame_round_trips_bytes_between_domains() {
    let broker = ShareBroker::new();
    let producer = MemoryManager::with_broker(MemoryConfig::default(), broker.clone());
    let consumer = MemoryManager::with_broker(MemoryConfig::default(), broker);
    let layouts = nv12(32, 16);

    let frame = producer.calloc(MemType::Tiled2dCached, &layouts).unwrap();
    frame.plane(1).unwrap().storage().write()[0] = 0x80;
    let shared = producer.share(frame).unwrap();

    let wire = serde_json::to_string(&shared).unwrap();
    let shared = serde_json::from_str(&wire).unwrap();

    let frame = consumer
        .import(MemType::Tiled2dCached, &layouts, shared)
        .unwrap();
    assert_eq!(frame.plane(1).unwrap().storage().read()[0], 0x80);

    // Writes in the consumer are visible to anyone holding the plane.
    let plane = frame.plane(1).unwrap().clone();
    consumer.free(frame).unwrap();
    assert_eq!(plane.storage().read()[0], 0x80);
    assert_eq!(consumer.stats().live_planes, 0);
}
