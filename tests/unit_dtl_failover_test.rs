// tests/unit_dtl_failover_test.rs

//! DTL failover: synchronous replication, peer death, degraded writes,
//! and recovery back to OK_SYNC.

#[path = "integration/test_helpers.rs"]
mod test_helpers;

use bytes::Bytes;
use peridot::core::dtl::{DtlMode, DtlPeer};
use std::time::Duration;
use test_helpers::{TestContext, pattern};

const MIB: u64 = 1 << 20;

fn sync_peer(addr: std::net::SocketAddr) -> DtlPeer {
    DtlPeer {
        host: addr.ip().to_string(),
        port: addr.port(),
        mode: DtlMode::Synchronous,
    }
}

#[tokio::test]
async fn peer_death_degrades_and_reconfiguration_recovers() {
    let ctx = TestContext::new().await;
    let (addr, server_shutdown) = ctx.start_dtl_server("dtl-a").await;

    let vol = ctx.new_volume("v1", MIB).await;
    vol.set_failover_cache_config(Some(sync_peer(addr)))
        .await
        .unwrap();
    assert_eq!(vol.failover_state().to_string(), "OK_SYNC");

    vol.write(0, &pattern(b'a', 4096)).await.unwrap();

    // Kill the peer: the next write still succeeds, but the volume
    // degrades.
    drop(server_shutdown);
    tokio::time::sleep(Duration::from_millis(50)).await;

    vol.write(8, &pattern(b'b', 4096)).await.unwrap();
    assert_eq!(vol.failover_state().to_string(), "DEGRADED");
    // Degraded is not halted: reads and writes keep working locally.
    vol.write(16, &pattern(b'c', 4096)).await.unwrap();
    assert_eq!(
        vol.read(8, 4096).await.unwrap(),
        Bytes::from(pattern(b'b', 4096))
    );

    // Bring a peer back and reconfigure: OK_SYNC returns.
    let (addr2, _server2_shutdown) = ctx.start_dtl_server("dtl-b").await;
    vol.set_failover_cache_config(Some(sync_peer(addr2)))
        .await
        .unwrap();
    assert_eq!(vol.failover_state().to_string(), "OK_SYNC");
    vol.write(24, &pattern(b'd', 4096)).await.unwrap();
}

#[tokio::test]
async fn standalone_volume_reports_ok_standalone() {
    let ctx = TestContext::new().await;
    let vol = ctx.new_volume("v1", MIB).await;
    assert_eq!(vol.failover_state().to_string(), "OK_STANDALONE");

    // Dropping a configured peer returns to standalone.
    let (addr, _shutdown) = ctx.start_dtl_server("dtl-a").await;
    vol.set_failover_cache_config(Some(sync_peer(addr)))
        .await
        .unwrap();
    vol.set_failover_cache_config(None).await.unwrap();
    assert_eq!(vol.failover_state().to_string(), "OK_STANDALONE");
}

#[tokio::test]
async fn unreachable_peer_at_configuration_degrades() {
    let ctx = TestContext::new().await;
    let vol = ctx.new_volume("v1", MIB).await;

    vol.set_failover_cache_config(Some(DtlPeer {
        host: "127.0.0.1".to_string(),
        port: 1,
        mode: DtlMode::Synchronous,
    }))
    .await
    .unwrap();
    assert_eq!(vol.failover_state().to_string(), "DEGRADED");

    // Writes continue locally while degraded.
    vol.write(0, &pattern(b'x', 4096)).await.unwrap();
    assert_eq!(
        vol.read(0, 4096).await.unwrap(),
        Bytes::from(pattern(b'x', 4096))
    );
}
