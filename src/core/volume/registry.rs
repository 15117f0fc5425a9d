// src/core/volume/registry.rs

//! The process-wide volume registry.
//!
//! All volumes on a node live here, keyed by id. Components that need a
//! way back to their volume (the backend task sink, degraded callbacks)
//! hold a `Weak` registry reference plus the volume id instead of owning
//! pointers, which keeps the volume / snapshot-manager / DTL composition
//! a tree.

use super::{Volume, VolumeConfig};
use crate::config::{Config, DtlClientConfig, MetadataConfig};
use crate::core::backend::pipeline::{BackendPipeline, BackendTaskHandler};
use crate::core::backend::BackendConnector;
use crate::core::clustercache::ClusterCache;
use crate::core::datastore::DataStore;
use crate::core::dtl::client::DtlClient;
use crate::core::dtl::VolumeFailoverState;
use crate::core::errors::PeridotError;
use crate::core::metadata::{MetaDataStore, MirroredMetaDataStore, PagedMetaDataStore};
use crate::core::metrics;
use crate::core::scocache::ScoCache;
use crate::core::snapshots::{ParentRef, SnapshotManager};
use crate::core::tasks::failover_monitor::FailoverMonitorTask;
use crate::core::tasks::heartbeat::{HeartbeatTask, claim_owner_lock};
use crate::core::types::{Namespace, ScoName, SnapshotName, TLogId, VolumeId};
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, broadcast};
use tracing::{info, warn};

/// Resolves pipeline callbacks to a volume through the registry. A
/// destroyed volume simply stops resolving.
struct TaskSink {
    registry: Weak<VolumeRegistry>,
    id: VolumeId,
}

impl TaskSink {
    fn volume(&self) -> Option<Arc<Volume>> {
        self.registry.upgrade()?.get(&self.id)
    }
}

#[async_trait]
impl BackendTaskHandler for TaskSink {
    async fn sco_written_to_backend(&self, sco: ScoName, size: u64) {
        if let Some(volume) = self.volume() {
            volume.handle_sco_written(sco, size).await;
        }
    }

    async fn tlog_written_to_backend(&self, tlog: TLogId, sco: ScoName) {
        if let Some(volume) = self.volume() {
            volume.handle_tlog_written(tlog, sco).await;
        }
    }

    async fn tlog_still_referenced(&self, tlog: TLogId) -> bool {
        match self.volume() {
            Some(volume) => volume.handle_tlog_still_referenced(tlog).await,
            None => false,
        }
    }

    async fn report_backend_failure(&self, what: &str) {
        match self.volume() {
            Some(volume) => volume.halt(what),
            None => warn!("backend failure for destroyed volume {}: {}", self.id, what),
        }
    }
}

pub struct VolumeRegistry {
    backend: Arc<dyn BackendConnector>,
    sco_cache: Arc<ScoCache>,
    cluster_cache: Arc<ClusterCache>,
    pipeline: BackendPipeline,
    metadata_cfg: MetadataConfig,
    scratch_dir: PathBuf,
    node_id: String,
    heartbeat_interval: std::time::Duration,
    dtl_defaults: DtlClientConfig,
    volumes: DashMap<VolumeId, Arc<Volume>>,
    /// Cluster-wide management lock: one volume lifecycle operation at a
    /// time on this node.
    management: Mutex<()>,
    shutdown_tx: broadcast::Sender<()>,
    self_weak: Weak<VolumeRegistry>,
}

impl VolumeRegistry {
    pub fn new(
        config: &Config,
        backend: Arc<dyn BackendConnector>,
        sco_cache: Arc<ScoCache>,
        cluster_cache: Arc<ClusterCache>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(4);
        Arc::new_cyclic(|weak| Self {
            backend,
            sco_cache,
            cluster_cache,
            pipeline: BackendPipeline::new(config.backend.clone()),
            metadata_cfg: config.metadata.clone(),
            scratch_dir: config.node.scratch_dir.clone(),
            node_id: config.node.node_id.clone(),
            heartbeat_interval: config.volume_defaults.heartbeat_interval,
            dtl_defaults: config.dtl.clone(),
            volumes: DashMap::new(),
            management: Mutex::new(()),
            shutdown_tx,
            self_weak: weak.clone(),
        })
    }

    pub fn get(&self, id: &str) -> Option<Arc<Volume>> {
        self.volumes.get(id).map(|e| e.value().clone())
    }

    pub fn list(&self) -> Vec<VolumeId> {
        self.volumes.iter().map(|e| e.key().clone()).collect()
    }

    /// Live clones of the given namespace: `(volume id, parent snapshot)`.
    pub fn clones_of(&self, ns: &Namespace) -> Vec<(VolumeId, SnapshotName)> {
        self.volumes
            .iter()
            .filter_map(|e| {
                let cfg = e.value().config();
                let parent = cfg.parent?;
                (&parent.namespace == ns).then(|| (cfg.id, parent.snapshot))
            })
            .collect()
    }

    fn metadata_store(&self, ns: &Namespace) -> Arc<dyn MetaDataStore> {
        let paged =
            PagedMetaDataStore::new(self.metadata_cfg.max_pages, self.metadata_cfg.page_bits);
        if self.metadata_cfg.mds_nodes.is_empty() {
            Arc::new(paged)
        } else {
            Arc::new(MirroredMetaDataStore::new(
                paged,
                ns.clone(),
                self.metadata_cfg.mds_nodes.clone(),
                self.metadata_cfg.mds_timeout,
            ))
        }
    }

    fn tlog_dir(&self, id: &str) -> PathBuf {
        self.scratch_dir.join(id).join("tlogs")
    }

    /// Wires the per-volume services, spawns the volume's background
    /// tasks, and registers it.
    async fn finish_assembly(
        &self,
        config: VolumeConfig,
        manager: SnapshotManager,
        datastore: DataStore,
        metadata: Arc<dyn MetaDataStore>,
        queue: Arc<crate::core::backend::pipeline::VolumeTaskQueue>,
    ) -> Result<Arc<Volume>, PeridotError> {
        let id = config.id.clone();
        let dtl = Arc::new(DtlClient::new(
            config.ns.clone(),
            config.cluster_size() as u32,
            self.dtl_defaults.max_entries,
            self.dtl_defaults.request_timeout,
        ));
        let volume = Volume::assemble(
            config.clone(),
            manager,
            datastore,
            metadata,
            dtl.clone(),
            queue,
            self.sco_cache.clone(),
            self.cluster_cache.clone(),
            self.self_weak.clone(),
        );

        // The degraded callback resolves the volume through the registry,
        // mirroring the task sink.
        let registry = self.self_weak.clone();
        let cb_id = id.clone();
        dtl.initialize(Arc::new(move || {
            if let Some(volume) = registry.upgrade().and_then(|r| r.get(&cb_id)) {
                volume.set_failover_state(VolumeFailoverState::Degraded);
            }
        }));
        if let Some(peer) = config.dtl_peer.clone() {
            if let Err(e) = dtl.set_peer(Some(peer)).await {
                warn!("volume {}: DTL peer unreachable at creation: {}", id, e);
                volume.set_failover_state(VolumeFailoverState::Degraded);
            }
        }

        self.volumes.insert(id.clone(), volume.clone());
        metrics::REGISTERED_VOLUMES.set(self.volumes.len() as f64);

        // Background tasks die with the registry's shutdown broadcast.
        let heartbeat = HeartbeatTask::new(
            self.backend.clone(),
            config.ns.clone(),
            self.node_id.clone(),
            self.heartbeat_interval,
            {
                let registry = self.self_weak.clone();
                let id = id.clone();
                Arc::new(move || {
                    if let Some(volume) = registry.upgrade().and_then(|r| r.get(&id)) {
                        volume.halt("ownership fenced by another node");
                    }
                })
            },
        );
        tokio::spawn(heartbeat.run(self.shutdown_tx.subscribe()));
        let monitor = FailoverMonitorTask::new(
            Arc::downgrade(&volume),
            self.dtl_defaults.health_check_interval,
        );
        tokio::spawn(monitor.run(self.shutdown_tx.subscribe()));

        Ok(volume)
    }

    /// Creates a new volume: namespace, ownership lock, caches, metadata,
    /// snapshot manager, and the initial manifest on the backend.
    pub async fn create_volume(
        &self,
        mut config: VolumeConfig,
    ) -> Result<Arc<Volume>, PeridotError> {
        let _mgmt = self.management.lock().await;
        if self.volumes.contains_key(&config.id) {
            return Err(PeridotError::FileExists(config.id));
        }
        // With automatic failover-cache configuration, new volumes pick
        // up the node's default peer.
        if config.dtl_peer.is_none() && self.dtl_defaults.automatic {
            if let Some(host) = self.dtl_defaults.host.clone() {
                config.dtl_peer = Some(crate::core::dtl::DtlPeer {
                    host,
                    port: self.dtl_defaults.port,
                    mode: self.dtl_defaults.mode,
                });
            }
        }
        if config.size % config.cluster_size() as u64 != 0 {
            return Err(PeridotError::InvalidOperation(
                "volume size must be a whole number of clusters".to_string(),
            ));
        }

        self.backend.create_namespace(&config.ns).await?;
        claim_owner_lock(&self.backend, &config.ns, &self.node_id).await?;
        self.sco_cache
            .register_namespace(&config.ns, config.max_non_disposable_bytes());

        let metadata = self.metadata_store(&config.ns);
        let queue = self.queue_for(&config);

        let manager = SnapshotManager::create(
            config.id.clone(),
            config.ns.clone(),
            config.parent.clone(),
            self.tlog_dir(&config.id),
            config.max_tlog_entries(),
            metadata.clone(),
            queue.clone(),
            self.backend.clone(),
        )
        .await?;
        let datastore = DataStore::new(
            config.nspath.clone(),
            config.cluster_size(),
            config.sco_multiplier,
            self.sco_cache.clone(),
            self.backend.clone(),
            1,
        );

        let volume = self
            .finish_assembly(config, manager, datastore, metadata, queue)
            .await?;
        // The initial manifest must be durable before the volume is
        // announced.
        volume.task_queue().drain().await?;
        info!("created volume {}", volume.id());
        Ok(volume)
    }

    /// Builds a task queue resolving callbacks through the registry. The
    /// queue keeps the resolver alive; the volume itself stays weakly
    /// referenced.
    fn queue_for(
        &self,
        config: &VolumeConfig,
    ) -> Arc<crate::core::backend::pipeline::VolumeTaskQueue> {
        let sink: Arc<dyn BackendTaskHandler> = Arc::new(TaskSink {
            registry: self.self_weak.clone(),
            id: config.id.clone(),
        });
        Arc::new(self.pipeline.queue_with_sink(
            config.ns.clone(),
            self.backend.clone(),
            sink,
        ))
    }

    /// Creates a clone from a template volume's terminal snapshot.
    pub async fn create_clone_from_template(
        &self,
        clone_id: VolumeId,
        clone_ns: Namespace,
        parent_id: &str,
    ) -> Result<Arc<Volume>, PeridotError> {
        let parent = self
            .get(parent_id)
            .ok_or_else(|| PeridotError::ObjectNotFound(parent_id.to_string()))?;
        if !parent.is_template() {
            return Err(PeridotError::InvalidOperation(format!(
                "volume {parent_id} is not a template"
            )));
        }
        self.create_clone(clone_id, clone_ns, parent_id, None).await
    }

    /// Creates a clone rooted at a parent snapshot. The clone inherits
    /// the parent's data through the namespace chain and seeds its
    /// metadata from the parent's TLogs with clone ids shifted one level
    /// up. `snapshot = None` uses the parent's newest snapshot (a
    /// template's terminal one).
    pub async fn create_clone(
        &self,
        clone_id: VolumeId,
        clone_ns: Namespace,
        parent_id: &str,
        snapshot: Option<&str>,
    ) -> Result<Arc<Volume>, PeridotError> {
        let parent = self
            .get(parent_id)
            .ok_or_else(|| PeridotError::ObjectNotFound(parent_id.to_string()))?;
        let (snapshot_name, in_backend) = match snapshot {
            None => parent.template_snapshot().await?,
            Some(name) => parent.snapshot_backend_status(name).await?,
        };
        if !in_backend {
            return Err(PeridotError::PreviousSnapshotNotOnBackend(snapshot_name));
        }

        let parent_cfg = parent.config();
        let mut config = parent_cfg.clone();
        config.id = clone_id;
        config.ns = clone_ns.clone();
        config.parent = Some(ParentRef {
            namespace: parent_cfg.ns.clone(),
            snapshot: snapshot_name.clone(),
        });
        config.is_template = false;
        config.nspath = {
            let mut nspath = vec![clone_ns];
            nspath.extend(parent_cfg.nspath.iter().cloned());
            nspath
        };

        let _mgmt = self.management.lock().await;
        if self.volumes.contains_key(&config.id) {
            return Err(PeridotError::FileExists(config.id));
        }
        self.backend.create_namespace(&config.ns).await?;
        claim_owner_lock(&self.backend, &config.ns, &self.node_id).await?;
        self.sco_cache
            .register_namespace(&config.ns, config.max_non_disposable_bytes());

        let metadata = self.metadata_store(&config.ns);
        let queue = self.queue_for(&config);
        let manager = SnapshotManager::create(
            config.id.clone(),
            config.ns.clone(),
            config.parent.clone(),
            self.tlog_dir(&config.id),
            config.max_tlog_entries(),
            metadata.clone(),
            queue.clone(),
            self.backend.clone(),
        )
        .await?;

        // Seed the clone's view of the parent's history.
        let snapshot_num = parent
            .snapshot_manager_view(|m| m.persistor().find_snapshot(&snapshot_name))
            .await
            .ok_or_else(|| PeridotError::SnapshotNotFound(snapshot_name.clone()))?;
        let parent_tlogs = parent
            .snapshot_manager_view(|m| m.persistor().tlogs_up_to_snapshot(snapshot_num))
            .await;
        manager
            .replay_parent_tlogs(&parent_cfg.ns, &parent_tlogs)
            .await?;

        let datastore = DataStore::new(
            config.nspath.clone(),
            config.cluster_size(),
            config.sco_multiplier,
            self.sco_cache.clone(),
            self.backend.clone(),
            1,
        );
        let volume = self
            .finish_assembly(config, manager, datastore, metadata, queue)
            .await?;
        volume.task_queue().drain().await?;
        info!("created clone {} from {}", volume.id(), parent_id);
        Ok(volume)
    }

    /// Reopens a volume from the backend after a crash or migration. The
    /// manifest is authoritative; local TLogs not referenced there are
    /// aborted, metadata is rebuilt by replay, and the peer's DTL log
    /// covers the SCOs the backend never saw.
    pub async fn local_restart(&self, config: VolumeConfig) -> Result<Arc<Volume>, PeridotError> {
        let _mgmt = self.management.lock().await;
        if self.volumes.contains_key(&config.id) {
            return Err(PeridotError::FileExists(config.id));
        }
        if !self.backend.namespace_exists(&config.ns).await? {
            return Err(PeridotError::ObjectNotFound(config.ns.to_string()));
        }
        claim_owner_lock(&self.backend, &config.ns, &self.node_id).await?;
        self.sco_cache
            .register_namespace(&config.ns, config.max_non_disposable_bytes());

        let manifest = self
            .backend
            .get(&config.ns, crate::core::types::SNAPSHOTS_OBJECT_NAME)
            .await?;
        let metadata = self.metadata_store(&config.ns);
        let queue = self.queue_for(&config);
        let manager = SnapshotManager::open_from_manifest(
            &manifest,
            config.ns.clone(),
            self.tlog_dir(&config.id),
            config.max_tlog_entries(),
            metadata.clone(),
            queue.clone(),
            self.backend.clone(),
        )
        .await?;

        let all_tlogs = manager.persistor().all_tlogs();
        let (replayed, max_sco) = manager.replay_into_metadata(&all_tlogs, true).await?;
        metadata.set_scrub_id(manager.persistor().scrub_id());
        info!(
            "volume {}: recovered {} clusters from {} TLogs",
            config.id,
            replayed,
            all_tlogs.len()
        );

        let datastore = DataStore::new(
            config.nspath.clone(),
            config.cluster_size(),
            config.sco_multiplier,
            self.sco_cache.clone(),
            self.backend.clone(),
            max_sco + 1,
        );
        let volume = self
            .finish_assembly(config.clone(), manager, datastore, metadata, queue)
            .await?;

        // Writes acknowledged through the DTL but never uploaded replay
        // on top, starting after the newest SCO the backend actually
        // holds.
        let max_backend_sco = self
            .backend
            .list(&config.ns, "")
            .await?
            .iter()
            .filter_map(|name| ScoName::parse_object_name(name))
            .map(|sco| sco.number)
            .max()
            .unwrap_or(0);
        if let Err(e) = volume.replay_from_dtl(max_backend_sco).await {
            warn!("DTL replay for {} failed: {}", volume.id(), e);
        }
        volume.task_queue().drain().await?;
        Ok(volume)
    }

    /// Flushes and forgets a volume, keeping its backend namespace. The
    /// counterpart of a migration handing the volume to another node.
    pub async fn detach_volume(&self, id: &str) -> Result<(), PeridotError> {
        let _mgmt = self.management.lock().await;
        let volume = self
            .get(id)
            .ok_or_else(|| PeridotError::ObjectNotFound(id.to_string()))?;
        volume.flush_to_backend().await?;
        self.forget(id, &volume).await;
        info!("detached volume {}", id);
        Ok(())
    }

    /// Destroys a volume. Backend data survives unless `delete_namespace`.
    pub async fn destroy_volume(
        &self,
        id: &str,
        delete_namespace: bool,
    ) -> Result<(), PeridotError> {
        let _mgmt = self.management.lock().await;
        let volume = self
            .get(id)
            .ok_or_else(|| PeridotError::ObjectNotFound(id.to_string()))?;
        let ns = volume.namespace();
        let children = self.clones_of(&ns);
        if !children.is_empty() {
            return Err(PeridotError::ObjectStillHasChildren(format!(
                "volume {id} has clones: {}",
                children
                    .iter()
                    .map(|(id, _)| id.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }
        if !volume.is_halted() {
            let _ = volume.task_queue().drain().await;
        }
        self.forget(id, &volume).await;
        if delete_namespace {
            self.backend.delete_namespace(&ns).await?;
        }
        info!("destroyed volume {} (namespace deleted: {})", id, delete_namespace);
        Ok(())
    }

    async fn forget(&self, id: &str, volume: &Arc<Volume>) {
        let ns = volume.namespace();
        self.volumes.remove(id);
        self.sco_cache.purge_namespace(&ns);
        self.cluster_cache.purge_namespace(&ns);
        let _ = tokio::fs::remove_dir_all(self.scratch_dir.join(id)).await;
        metrics::REGISTERED_VOLUMES.set(self.volumes.len() as f64);
    }

    /// Stops background tasks and flushes all volumes.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        for entry in self.volumes.iter() {
            if let Err(e) = entry.value().flush_to_backend().await {
                warn!("flush of {} during shutdown failed: {}", entry.key(), e);
            }
        }
    }
}
