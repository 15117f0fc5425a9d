// tests/unit_dtl_replay_test.rs

//! The peer's log reconstructs exactly the writes after a given SCO.

#[path = "integration/test_helpers.rs"]
mod test_helpers;

use peridot::core::dtl::client::DtlClient;
use peridot::core::dtl::{DtlMode, DtlPeer};
use peridot::core::types::{ClusterAddress, Namespace, ScoName};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::TestContext;

const MIB: u64 = 1 << 20;

#[tokio::test]
async fn peer_log_matches_the_write_sequence() {
    let ctx = TestContext::new().await;
    let (addr, _shutdown) = ctx.start_dtl_server("dtl").await;

    let vol = ctx.new_volume("v1", MIB).await;
    vol.set_failover_cache_config(Some(DtlPeer {
        host: addr.ip().to_string(),
        port: addr.port(),
        mode: DtlMode::Synchronous,
    }))
    .await
    .unwrap();

    // Six clusters: SCO 1 fills (4 clusters), SCO 2 holds two more.
    let mut payloads = Vec::new();
    for i in 0..6u64 {
        let payload = vec![(i + 1) as u8; 4096];
        vol.write(i * 8, &payload).await.unwrap();
        payloads.push(payload);
    }

    // An independent observer replays the peer's log per SCO.
    let observer = Arc::new(DtlClient::new(
        vol.namespace(),
        4096,
        16,
        Duration::from_secs(5),
    ));
    observer
        .set_peer(Some(DtlPeer {
            host: addr.ip().to_string(),
            port: addr.port(),
            mode: DtlMode::Synchronous,
        }))
        .await
        .unwrap();

    let mut replayed: Vec<(ClusterAddress, Vec<u8>)> = Vec::new();
    for sco in 1..=2u32 {
        observer
            .get_sco_from_failover(ScoName::new(sco, 0), |addr, _loc, payload| {
                replayed.push((addr, payload.to_vec()));
            })
            .await
            .unwrap();
    }

    assert_eq!(replayed.len(), 6);
    for (i, (addr, payload)) in replayed.iter().enumerate() {
        assert_eq!(*addr, ClusterAddress(i as u64));
        assert_eq!(payload, &payloads[i]);
    }
}

#[tokio::test]
async fn remove_up_to_trims_the_peer_log() {
    let ctx = TestContext::new().await;
    let (addr, _shutdown) = ctx.start_dtl_server("dtl").await;

    let ns = Namespace::new("trimmed");
    let client = Arc::new(DtlClient::new(ns, 4096, 16, Duration::from_secs(5)));
    client
        .set_peer(Some(DtlPeer {
            host: addr.ip().to_string(),
            port: addr.port(),
            mode: DtlMode::Synchronous,
        }))
        .await
        .unwrap();

    use peridot::core::dtl::protocol::DtlEntry;
    use peridot::core::types::ClusterLocation;
    for sco in 1..=3u32 {
        client
            .add_entries(
                vec![DtlEntry {
                    addr: ClusterAddress(sco as u64),
                    loc: ClusterLocation::new(ScoName::new(sco, 0), 0),
                }],
                bytes::Bytes::from(vec![sco as u8; 4096]),
            )
            .await
            .unwrap();
    }

    client.remove_up_to(ScoName::new(2, 0)).await.unwrap();

    let mut counts = Vec::new();
    for sco in 1..=3u32 {
        let n = client
            .get_sco_from_failover(ScoName::new(sco, 0), |_, _, _| {})
            .await
            .unwrap();
        counts.push(n);
    }
    assert_eq!(counts, vec![0, 0, 1]);
}
