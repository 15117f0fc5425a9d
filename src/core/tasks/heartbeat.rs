// src/core/tasks/heartbeat.rs

//! Ownership heartbeat over the backend lock object.
//!
//! A volume that can migrate holds the `owner_lock` object in its
//! namespace. The heartbeat refreshes the lock through compare-and-swap;
//! when the stored owner is no longer us — another node fenced us out —
//! the loss callback halts the volume before it can issue further
//! backend writes.

use crate::core::backend::BackendConnector;
use crate::core::errors::PeridotError;
use crate::core::types::{Namespace, OWNER_LOCK_OBJECT_NAME};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
struct OwnerLock {
    owner: String,
    counter: u64,
}

impl OwnerLock {
    fn to_bytes(&self) -> Result<Bytes, PeridotError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

/// Claims the lock for `node_id`, stealing only genuinely free locks.
/// A lock held by another node fails the claim.
pub async fn claim_owner_lock(
    backend: &Arc<dyn BackendConnector>,
    ns: &Namespace,
    node_id: &str,
) -> Result<(), PeridotError> {
    let current = match backend.get(ns, OWNER_LOCK_OBJECT_NAME).await {
        Ok(bytes) => Some(bytes),
        Err(PeridotError::ObjectNotFound(_)) => None,
        Err(e) => return Err(e),
    };
    let fresh = OwnerLock {
        owner: node_id.to_string(),
        counter: 0,
    };
    match &current {
        None => {
            if backend
                .compare_and_swap(ns, OWNER_LOCK_OBJECT_NAME, None, fresh.to_bytes()?)
                .await?
            {
                return Ok(());
            }
        }
        Some(bytes) => {
            let held: OwnerLock = serde_json::from_slice(bytes)?;
            if held.owner != node_id {
                return Err(PeridotError::InvalidOperation(format!(
                    "namespace {ns} is owned by node '{}'",
                    held.owner
                )));
            }
            // Re-claim after a restart of the same node.
            if backend
                .compare_and_swap(
                    ns,
                    OWNER_LOCK_OBJECT_NAME,
                    current.clone(),
                    fresh.to_bytes()?,
                )
                .await?
            {
                return Ok(());
            }
        }
    }
    Err(PeridotError::InvalidOperation(format!(
        "lost the race claiming ownership of {ns}"
    )))
}

pub struct HeartbeatTask {
    backend: Arc<dyn BackendConnector>,
    ns: Namespace,
    node_id: String,
    interval: Duration,
    /// Invoked exactly once when ownership is lost; must halt the volume.
    on_loss: Arc<dyn Fn() + Send + Sync>,
}

impl HeartbeatTask {
    pub fn new(
        backend: Arc<dyn BackendConnector>,
        ns: Namespace,
        node_id: String,
        interval: Duration,
        on_loss: Arc<dyn Fn() + Send + Sync>,
    ) -> Self {
        Self {
            backend,
            ns,
            node_id,
            interval,
            on_loss,
        }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("heartbeat task for {} started", self.ns);
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.beat().await {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!("ownership of {} lost; fencing", self.ns);
                            (self.on_loss)();
                            return;
                        }
                        Err(e) => {
                            // Backend hiccups are not fencing; retry on
                            // the next tick.
                            debug!("heartbeat for {} failed: {}", self.ns, e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("heartbeat task for {} shutting down", self.ns);
                    return;
                }
            }
        }
    }

    /// Refreshes the lock. `Ok(false)` means another node owns it.
    async fn beat(&self) -> Result<bool, PeridotError> {
        let bytes = match self.backend.get(&self.ns, OWNER_LOCK_OBJECT_NAME).await {
            Ok(b) => b,
            Err(PeridotError::ObjectNotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        let held: OwnerLock = serde_json::from_slice(&bytes)?;
        if held.owner != self.node_id {
            return Ok(false);
        }
        let refreshed = OwnerLock {
            owner: held.owner.clone(),
            counter: held.counter + 1,
        };
        Ok(self
            .backend
            .compare_and_swap(
                &self.ns,
                OWNER_LOCK_OBJECT_NAME,
                Some(bytes),
                refreshed.to_bytes()?,
            )
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::backend::LocalBackend;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn claim_and_fence() {
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn BackendConnector> =
            Arc::new(LocalBackend::new(dir.path().to_path_buf()));
        let ns = Namespace::new("vol");
        backend.create_namespace(&ns).await.unwrap();

        claim_owner_lock(&backend, &ns, "node-a").await.unwrap();
        // Another node cannot claim a held lock.
        assert!(claim_owner_lock(&backend, &ns, "node-b").await.is_err());
        // The same node can re-claim after a restart.
        claim_owner_lock(&backend, &ns, "node-a").await.unwrap();

        // Simulate a steal, then watch the heartbeat fence.
        let stolen = OwnerLock {
            owner: "node-b".to_string(),
            counter: 99,
        };
        backend
            .put(
                &ns,
                OWNER_LOCK_OBJECT_NAME,
                stolen.to_bytes().unwrap(),
                true,
                None,
            )
            .await
            .unwrap();

        let fenced = Arc::new(AtomicBool::new(false));
        let fenced_clone = fenced.clone();
        let task = HeartbeatTask::new(
            backend,
            ns,
            "node-a".to_string(),
            Duration::from_millis(10),
            Arc::new(move || fenced_clone.store(true, Ordering::SeqCst)),
        );
        let (tx, _) = broadcast::channel(1);
        let handle = tokio::spawn(task.run(tx.subscribe()));
        // The task exits by itself once fenced.
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(fenced.load(Ordering::SeqCst));
        drop(tx);
    }
}
