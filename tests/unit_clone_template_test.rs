// tests/unit_clone_template_test.rs

//! Templates, clones, and clone-lineage safety.

#[path = "integration/test_helpers.rs"]
mod test_helpers;

use bytes::Bytes;
use peridot::PeridotError;
use peridot::core::types::Namespace;
use test_helpers::{TestContext, pattern};

const MIB: u64 = 1 << 20;

#[tokio::test]
async fn clone_from_template_sees_parent_data() {
    let ctx = TestContext::new().await;
    let parent = ctx.new_volume("parent", 32 * MIB).await;

    let data: Vec<u8> = (0..64 * 4096).map(|i| (i % 253) as u8).collect();
    parent.write(0, &data).await.unwrap();
    parent.set_as_template().await.unwrap();
    parent.flush_to_backend().await.unwrap();

    let clone = ctx
        .registry
        .create_clone_from_template("clone".to_string(), Namespace::new("ns-clone"), "parent")
        .await
        .unwrap();

    assert_eq!(
        clone.read(0, data.len()).await.unwrap(),
        Bytes::from(data.clone())
    );

    // Writing to the clone leaves the parent untouched.
    clone.write(0, &pattern(b'z', 4096)).await.unwrap();
    assert_eq!(
        clone.read(0, 4096).await.unwrap(),
        Bytes::from(pattern(b'z', 4096))
    );
    assert_eq!(
        parent.read(0, 4096).await.unwrap(),
        Bytes::from(data[..4096].to_vec())
    );
    // And the rest of the clone still reads through to the parent.
    assert_eq!(
        clone.read(8, 4096).await.unwrap(),
        Bytes::from(data[4096..8192].to_vec())
    );
}

#[tokio::test]
async fn set_as_template_is_idempotent() {
    let ctx = TestContext::new().await;
    let vol = ctx.new_volume("v1", MIB).await;

    vol.write(0, &pattern(b'a', 4096)).await.unwrap();
    vol.set_as_template().await.unwrap();
    let snapshots = vol.list_snapshots().await;
    assert_eq!(snapshots.len(), 1);

    vol.set_as_template().await.unwrap();
    assert_eq!(vol.list_snapshots().await, snapshots);

    // Templates are read-only and reject snapshot and scrub operations.
    assert!(matches!(
        vol.write(0, &pattern(b'b', 4096)).await,
        Err(PeridotError::VolumeIsTemplate(_))
    ));
    assert!(matches!(
        vol.create_snapshot("s".to_string(), Vec::new(), None, false)
            .await,
        Err(PeridotError::VolumeIsTemplate(_))
    ));
    assert!(matches!(
        vol.get_scrubbing_work().await,
        Err(PeridotError::InvalidOperation(_))
    ));
}

#[tokio::test]
async fn template_collapses_earlier_snapshots() {
    let ctx = TestContext::new().await;
    let vol = ctx.new_volume("v1", MIB).await;

    vol.write(0, &pattern(b'a', 4096)).await.unwrap();
    vol.create_snapshot("s1".to_string(), Vec::new(), None, false)
        .await
        .unwrap();
    vol.flush_to_backend().await.unwrap();
    vol.write(8, &pattern(b'b', 4096)).await.unwrap();

    vol.set_as_template().await.unwrap();
    let snapshots = vol.list_snapshots().await;
    assert_eq!(snapshots.len(), 1);
    assert_ne!(snapshots[0], "s1");

    // All data is still reachable through the terminal snapshot.
    assert_eq!(
        vol.read(0, 4096).await.unwrap(),
        Bytes::from(pattern(b'a', 4096))
    );
    assert_eq!(
        vol.read(8, 4096).await.unwrap(),
        Bytes::from(pattern(b'b', 4096))
    );
}

#[tokio::test]
async fn clone_requires_a_template_parent() {
    let ctx = TestContext::new().await;
    let _vol = ctx.new_volume("plain", MIB).await;

    let err = ctx
        .registry
        .create_clone_from_template("clone".to_string(), Namespace::new("ns-clone"), "plain")
        .await
        .unwrap_err();
    assert!(matches!(err, PeridotError::InvalidOperation(_)));
}

#[tokio::test]
async fn lineage_guards_deletion_and_rollback() {
    let ctx = TestContext::new().await;
    let parent = ctx.new_volume("parent", MIB).await;

    parent.write(0, &pattern(b'a', 4096)).await.unwrap();
    parent
        .create_snapshot("s1".to_string(), Vec::new(), None, false)
        .await
        .unwrap();
    parent.flush_to_backend().await.unwrap();
    parent.write(8, &pattern(b'b', 4096)).await.unwrap();
    parent
        .create_snapshot("s2".to_string(), Vec::new(), None, false)
        .await
        .unwrap();
    parent.flush_to_backend().await.unwrap();

    let _clone = ctx
        .registry
        .create_clone("clone".to_string(), Namespace::new("ns-clone"), "parent", Some("s2"))
        .await
        .unwrap();

    // The clone descends from the whole chain up to s2: deletion and
    // rollback anywhere in that history are blocked.
    assert!(matches!(
        parent.delete_snapshot("s2").await,
        Err(PeridotError::ObjectStillHasChildren(_))
    ));
    assert!(matches!(
        parent.delete_snapshot("s1").await,
        Err(PeridotError::ObjectStillHasChildren(_))
    ));
    assert!(matches!(
        parent.restore_snapshot("s1").await,
        Err(PeridotError::ObjectStillHasChildren(_))
    ));
    assert!(matches!(
        ctx.registry.destroy_volume("parent", true).await,
        Err(PeridotError::ObjectStillHasChildren(_))
    ));

    // Dropping the clone unblocks the parent.
    ctx.registry.destroy_volume("clone", true).await.unwrap();
    parent.delete_snapshot("s1").await.unwrap();
    parent.restore_snapshot("s2").await.unwrap();
}
