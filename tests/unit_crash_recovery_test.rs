// tests/unit_crash_recovery_test.rs

//! Crash consistency: recovery from the backend manifest, and DTL
//! replay for writes the backend never saw.

#[path = "integration/test_helpers.rs"]
mod test_helpers;

use bytes::Bytes;
use peridot::core::dtl::{DtlMode, DtlPeer};
use test_helpers::{TestContext, pattern};

const MIB: u64 = 1 << 20;

#[tokio::test]
async fn restart_recovers_flushed_state_from_the_backend() {
    let ctx = TestContext::new().await;
    let vol = ctx.new_volume("v1", MIB).await;

    let data: Vec<u8> = (0..16 * 4096).map(|i| (i % 249) as u8).collect();
    vol.write(0, &data).await.unwrap();
    vol.create_snapshot("s1".to_string(), Vec::new(), None, false)
        .await
        .unwrap();
    vol.write(16 * 8, &pattern(b'p', 4096)).await.unwrap();
    vol.flush_to_backend().await.unwrap();

    let config = vol.config();

    // The node "crashes": a fresh registry with empty caches recovers
    // the volume purely from the backend.
    let node2 = ctx.restarted_node();
    let recovered = node2.local_restart(config).await.unwrap();

    assert_eq!(
        recovered.read(0, data.len()).await.unwrap(),
        Bytes::from(data)
    );
    assert_eq!(
        recovered.read(16 * 8, 4096).await.unwrap(),
        Bytes::from(pattern(b'p', 4096))
    );
    // The snapshot list survived through the manifest.
    assert_eq!(recovered.list_snapshots().await, vec!["s1".to_string()]);
}

#[tokio::test]
async fn restart_replays_unflushed_writes_from_the_dtl() {
    let ctx = TestContext::new().await;
    let (addr, _server_shutdown) = ctx.start_dtl_server("dtl").await;

    let vol = ctx.new_volume("v1", MIB).await;
    vol.set_failover_cache_config(Some(DtlPeer {
        host: addr.ip().to_string(),
        port: addr.port(),
        mode: DtlMode::Synchronous,
    }))
    .await
    .unwrap();

    // Acknowledged writes that never reach the backend: no flush, no
    // snapshot.
    vol.write(0, &pattern(b'u', 2 * 4096)).await.unwrap();
    vol.sync().await.unwrap();
    let mut config = vol.config();
    config.dtl_peer = Some(DtlPeer {
        host: addr.ip().to_string(),
        port: addr.port(),
        mode: DtlMode::Synchronous,
    });

    // Crash and recover on a fresh node state. The backend only has the
    // initial manifest; the peer's log carries the two clusters.
    let node2 = ctx.restarted_node();
    let recovered = node2.local_restart(config).await.unwrap();

    assert_eq!(
        recovered.read(0, 2 * 4096).await.unwrap(),
        Bytes::from(pattern(b'u', 2 * 4096))
    );
}

#[tokio::test]
async fn unreferenced_local_tlogs_are_dropped_on_restart() {
    let ctx = TestContext::new().await;
    let vol = ctx.new_volume("v1", MIB).await;
    vol.write(0, &pattern(b'x', 4096)).await.unwrap();
    vol.flush_to_backend().await.unwrap();
    let config = vol.config();

    // Plant a stray TLog file that no manifest references.
    let tlog_dir = ctx
        .config
        .node
        .scratch_dir
        .join(&config.id)
        .join("tlogs");
    let stray = tlog_dir.join(peridot::core::types::TLogId::new().object_name());
    tokio::fs::write(&stray, b"garbage").await.unwrap();

    let node2 = ctx.restarted_node();
    let recovered = node2.local_restart(config).await.unwrap();
    assert!(!stray.exists());
    assert_eq!(
        recovered.read(0, 4096).await.unwrap(),
        Bytes::from(pattern(b'x', 4096))
    );
}
