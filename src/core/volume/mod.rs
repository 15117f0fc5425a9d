// src/core/volume/mod.rs

//! A virtual block volume: the composition root of the engine.
//!
//! The volume owns its namespace, datastore (SCO write stream), snapshot
//! manager, metadata store, DTL client and backend task queue, and
//! enforces the per-volume lock discipline: snapshot operations take the
//! snapshot lock and then the tlog (inner) lock; writes take only the
//! tlog lock; reads take a shared guard on it. Fatal errors halt the
//! volume instead of unwinding: halting is always preferred over
//! corrupting.

pub mod registry;

use crate::config::VolumeDefaultsConfig;
use crate::core::backend::pipeline::{BackendTask, VolumeTaskQueue};
use crate::core::clustercache::{ClusterCache, ClusterCacheBehaviour, ClusterCachePolicy};
use crate::core::datastore::{DataStore, SealedSco};
use crate::core::dtl::client::DtlClient;
use crate::core::dtl::protocol::DtlEntry;
use crate::core::dtl::{DtlPeer, VolumeFailoverState};
use crate::core::errors::PeridotError;
use crate::core::metadata::{MetaDataStore, MetaDataStoreStats};
use crate::core::metrics;
use crate::core::scocache::ScoCache;
use crate::core::scrub::{ScrubResult, ScrubWork};
use crate::core::snapshots::{ParentRef, SnapshotManager};
use crate::core::types::{
    ClusterAddress, ClusterHash, Namespace, ScoName, SnapshotName, TLogId, VolumeId,
};
use bytes::{Bytes, BytesMut};
use parking_lot::RwLock as SyncRwLock;
use registry::VolumeRegistry;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Static per-volume configuration, derived from the node defaults at
/// creation time.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct VolumeConfig {
    pub id: VolumeId,
    pub ns: Namespace,
    /// Volume size in bytes; a whole number of clusters.
    pub size: u64,
    pub lba_size: u32,
    pub cluster_multiplier: u32,
    pub sco_multiplier: u32,
    pub tlog_multiplier: u32,
    pub non_disposable_factor: f64,
    pub parent: Option<ParentRef>,
    /// Namespace chain for clone reads: `[own, parent, grandparent, ..]`.
    pub nspath: Vec<Namespace>,
    pub is_template: bool,
    pub cluster_cache: ClusterCachePolicy,
    pub dtl_peer: Option<DtlPeer>,
    pub sync_ignore_count: u64,
    #[serde(with = "humantime_serde")]
    pub sync_ignore_max: Duration,
    pub max_snapshot_metadata_size: usize,
}

impl VolumeConfig {
    pub fn from_defaults(
        defaults: &VolumeDefaultsConfig,
        id: VolumeId,
        ns: Namespace,
        size: u64,
    ) -> Self {
        Self {
            id,
            nspath: vec![ns.clone()],
            ns,
            size,
            lba_size: defaults.lba_size,
            cluster_multiplier: defaults.cluster_multiplier,
            sco_multiplier: defaults.sco_multiplier,
            tlog_multiplier: defaults.tlog_multiplier,
            non_disposable_factor: defaults.non_disposable_factor,
            parent: None,
            is_template: false,
            cluster_cache: ClusterCachePolicy::default(),
            dtl_peer: None,
            sync_ignore_count: defaults.sync_ignore_count,
            sync_ignore_max: defaults.sync_ignore_max,
            max_snapshot_metadata_size: defaults.max_snapshot_metadata_size,
        }
    }

    pub fn cluster_size(&self) -> usize {
        (self.cluster_multiplier * self.lba_size) as usize
    }

    pub fn clusters(&self) -> u64 {
        self.size / self.cluster_size() as u64
    }

    pub fn max_tlog_entries(&self) -> u64 {
        self.tlog_multiplier as u64 * self.sco_multiplier as u64
    }

    pub fn max_non_disposable_bytes(&self) -> u64 {
        (self.size as f64 * self.non_disposable_factor) as u64
    }
}

/// Point-in-time description of a volume, for the control plane.
#[derive(Serialize, Debug, Clone)]
pub struct VolumeInfo {
    pub id: VolumeId,
    pub namespace: String,
    pub size: u64,
    pub lba_size: u32,
    pub cluster_multiplier: u32,
    pub sco_multiplier: u32,
    pub tlog_multiplier: u32,
    pub failover_state: String,
    pub halted: bool,
    pub is_template: bool,
    pub parent: Option<ParentRef>,
    pub snapshot_count: usize,
    pub cluster_count: u64,
    pub metadata_cache_hits: u64,
    pub metadata_cache_misses: u64,
}

/// State guarded by the tlog lock: the TLog stream and the SCO stream
/// roll over together.
pub(crate) struct VolumeInner {
    pub(crate) manager: SnapshotManager,
    pub(crate) datastore: DataStore,
}

struct SyncIgnoreState {
    ignored: u64,
    last_forced: Instant,
}

pub struct Volume {
    config: SyncRwLock<VolumeConfig>,
    inner: RwLock<VolumeInner>,
    snapshot_lock: Mutex<()>,
    metadata: Arc<dyn MetaDataStore>,
    dtl: Arc<DtlClient>,
    queue: Arc<VolumeTaskQueue>,
    sco_cache: Arc<ScoCache>,
    cluster_cache: Arc<ClusterCache>,
    registry: Weak<VolumeRegistry>,
    failover_state: SyncRwLock<VolumeFailoverState>,
    halted: AtomicBool,
    sync_state: parking_lot::Mutex<SyncIgnoreState>,
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume").finish_non_exhaustive()
    }
}

impl Volume {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn assemble(
        config: VolumeConfig,
        manager: SnapshotManager,
        datastore: DataStore,
        metadata: Arc<dyn MetaDataStore>,
        dtl: Arc<DtlClient>,
        queue: Arc<VolumeTaskQueue>,
        sco_cache: Arc<ScoCache>,
        cluster_cache: Arc<ClusterCache>,
        registry: Weak<VolumeRegistry>,
    ) -> Arc<Self> {
        let initial_state = if config.dtl_peer.is_some() {
            VolumeFailoverState::OkSync
        } else {
            VolumeFailoverState::OkStandalone
        };
        metrics::VOLUME_FAILOVER_STATE
            .with_label_values(&[&initial_state.to_string()])
            .inc();
        Arc::new(Self {
            config: SyncRwLock::new(config),
            inner: RwLock::new(VolumeInner { manager, datastore }),
            snapshot_lock: Mutex::new(()),
            metadata,
            dtl,
            queue,
            sco_cache,
            cluster_cache,
            registry,
            failover_state: SyncRwLock::new(initial_state),
            halted: AtomicBool::new(false),
            sync_state: parking_lot::Mutex::new(SyncIgnoreState {
                ignored: 0,
                last_forced: Instant::now(),
            }),
        })
    }

    // --- Identity and state ---

    pub fn id(&self) -> VolumeId {
        self.config.read().id.clone()
    }

    pub fn namespace(&self) -> Namespace {
        self.config.read().ns.clone()
    }

    pub fn config(&self) -> VolumeConfig {
        self.config.read().clone()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn is_template(&self) -> bool {
        self.config.read().is_template
    }

    pub fn failover_state(&self) -> VolumeFailoverState {
        *self.failover_state.read()
    }

    pub(crate) fn set_failover_state(&self, new: VolumeFailoverState) {
        let mut state = self.failover_state.write();
        if *state == new {
            return;
        }
        metrics::VOLUME_FAILOVER_STATE
            .with_label_values(&[&state.to_string()])
            .dec();
        metrics::VOLUME_FAILOVER_STATE
            .with_label_values(&[&new.to_string()])
            .inc();
        info!("volume {}: {} -> {}", self.config.read().id, *state, new);
        *state = new;
    }

    /// Terminal state: no further I/O is accepted. Operator intervention
    /// required.
    pub fn halt(&self, why: &str) {
        if !self.halted.swap(true, Ordering::SeqCst) {
            error!("volume {} halted: {}", self.config.read().id, why);
            metrics::HALTED_VOLUMES.inc();
        }
    }

    fn check_not_halted(&self) -> Result<(), PeridotError> {
        if self.is_halted() {
            return Err(PeridotError::VolumeHalted(self.id()));
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<(), PeridotError> {
        self.check_not_halted()?;
        if self.is_template() {
            return Err(PeridotError::VolumeIsTemplate(self.id()));
        }
        Ok(())
    }

    /// Propagates a data-path failure after halting: a write that cannot
    /// reach the TLog or SCO stream leaves no safe way to continue.
    fn fatal(&self, e: PeridotError) -> PeridotError {
        self.halt(&e.to_string());
        e
    }

    // --- Write path ---

    pub async fn write(&self, lba: u64, buf: &[u8]) -> Result<(), PeridotError> {
        self.check_writable()?;
        if buf.is_empty() {
            return Ok(());
        }
        let cfg = self.config();
        let cs = cfg.cluster_size() as u64;
        let start = lba
            .checked_mul(cfg.lba_size as u64)
            .ok_or_else(|| PeridotError::InvalidOperation("LBA overflow".to_string()))?;
        let end = start + buf.len() as u64;
        if end > cfg.size {
            return Err(PeridotError::InvalidOperation(format!(
                "write [{start}, {end}) beyond volume size {}",
                cfg.size
            )));
        }

        // Cluster-align the request; head and tail partials are
        // read-modify-write against the current state.
        let first_cluster = start / cs;
        let last_cluster = (end - 1) / cs;
        let mut work: Vec<(ClusterAddress, Bytes)> = Vec::new();
        for ca in first_cluster..=last_cluster {
            let cluster_start = ca * cs;
            let copy_from = start.max(cluster_start);
            let copy_to = end.min(cluster_start + cs);
            let payload = if copy_to - copy_from == cs {
                Bytes::copy_from_slice(
                    &buf[(copy_from - start) as usize..(copy_to - start) as usize],
                )
            } else {
                let existing = self.read_cluster_payload(ClusterAddress(ca)).await?;
                let mut merged = BytesMut::from(&existing[..]);
                merged[(copy_from - cluster_start) as usize..(copy_to - cluster_start) as usize]
                    .copy_from_slice(&buf[(copy_from - start) as usize..(copy_to - start) as usize]);
                merged.freeze()
            };
            work.push((ClusterAddress(ca), payload));
        }

        let mut inner = self.inner.write().await;
        for (addr, payload) in work {
            self.write_one_cluster(&mut inner, &cfg, addr, payload)
                .await?;
        }
        Ok(())
    }

    async fn write_one_cluster(
        &self,
        inner: &mut VolumeInner,
        cfg: &VolumeConfig,
        addr: ClusterAddress,
        payload: Bytes,
    ) -> Result<(), PeridotError> {
        let hash = ClusterHash::of(&payload);

        // Overwrites invalidate any location-keyed cache entry.
        self.cluster_cache.invalidate_location(&cfg.ns, addr);

        // A full non-disposable quota fails the write cleanly, before
        // anything is journaled.
        let (loc, sealed) = match inner.datastore.write_cluster(&payload).await {
            Ok(v) => v,
            Err(e @ PeridotError::InsufficientResources(_)) => return Err(e),
            Err(e) => return Err(self.fatal(e)),
        };

        // The peer must hold the entry before the local ack in
        // synchronous mode. A peer failure degrades the volume; the
        // write itself continues locally.
        if self.dtl.mode().is_some() && !self.dtl.is_degraded() {
            if let Err(e) = self
                .dtl
                .add_entries(vec![DtlEntry { addr, loc }], payload.clone())
                .await
            {
                warn!("DTL forward failed, continuing standalone: {}", e);
                self.set_failover_state(VolumeFailoverState::Degraded);
            }
        }

        inner
            .manager
            .add_cluster(addr, loc, hash)
            .await
            .map_err(|e| self.fatal(e))?;
        self.metadata
            .multi_set(&vec![(addr, loc, hash)])
            .await
            .map_err(|e| self.fatal(e))?;

        if cfg.cluster_cache.behaviour == ClusterCacheBehaviour::CacheOnWrite {
            self.cluster_cache
                .insert(&cfg.cluster_cache, &cfg.ns, addr, hash, payload);
        }

        if let Some(sealed) = sealed {
            self.handle_sealed_sco(&mut inner.manager, sealed)
                .await
                .map_err(|e| self.fatal(e))?;
        }
        if inner.manager.tlog_entries() >= inner.manager.max_tlog_entries() {
            self.roll_tlog(inner).await.map_err(|e| self.fatal(e))?;
        }
        metrics::CLUSTERS_WRITTEN_TOTAL.inc();
        Ok(())
    }

    /// Emits the sealed SCO's CRC into the TLog and schedules its upload.
    async fn handle_sealed_sco(
        &self,
        manager: &mut SnapshotManager,
        sealed: SealedSco,
    ) -> Result<(), PeridotError> {
        manager.add_sco_crc(sealed.checksum).await?;
        self.queue.enqueue(BackendTask::WriteSco {
            sco: sealed.sco,
            path: sealed.path,
            checksum: sealed.checksum,
            overwrite: false,
        });
        Ok(())
    }

    /// Rolls the TLog over. The current SCO seals first so a TLog always
    /// fully covers the SCOs it references, keeping the upload barrier
    /// meaningful.
    async fn roll_tlog(&self, inner: &mut VolumeInner) -> Result<(), PeridotError> {
        if let Some(sealed) = inner.datastore.seal_current().await? {
            self.handle_sealed_sco(&mut inner.manager, sealed).await?;
        }
        inner.manager.rollover_tlog().await
    }

    // --- Read path ---

    pub async fn read(&self, lba: u64, len: usize) -> Result<Bytes, PeridotError> {
        self.check_not_halted()?;
        if len == 0 {
            return Ok(Bytes::new());
        }
        let cfg = self.config();
        let cs = cfg.cluster_size() as u64;
        let start = lba
            .checked_mul(cfg.lba_size as u64)
            .ok_or_else(|| PeridotError::InvalidOperation("LBA overflow".to_string()))?;
        let end = start + len as u64;
        if end > cfg.size {
            return Err(PeridotError::InvalidOperation(format!(
                "read [{start}, {end}) beyond volume size {}",
                cfg.size
            )));
        }

        let mut out = BytesMut::with_capacity(len);
        let first_cluster = start / cs;
        let last_cluster = (end - 1) / cs;
        for ca in first_cluster..=last_cluster {
            let cluster_start = ca * cs;
            let payload = self.read_cluster_payload(ClusterAddress(ca)).await?;
            let from = (start.max(cluster_start) - cluster_start) as usize;
            let to = (end.min(cluster_start + cs) - cluster_start) as usize;
            out.extend_from_slice(&payload[from..to]);
        }
        Ok(out.freeze())
    }

    /// One whole cluster: cluster cache, then SCO cache, then backend.
    /// Unwritten clusters read as zeros.
    async fn read_cluster_payload(&self, addr: ClusterAddress) -> Result<Bytes, PeridotError> {
        let cfg = self.config();
        metrics::CLUSTERS_READ_TOTAL.inc();
        match self.metadata.get(addr).await? {
            None => Ok(Bytes::from(vec![0u8; cfg.cluster_size()])),
            Some((loc, hash)) => {
                if let Some(hit) =
                    self.cluster_cache
                        .lookup(&cfg.cluster_cache, &cfg.ns, addr, hash)
                {
                    return Ok(hit);
                }
                let payload = self.inner.read().await.datastore.read_cluster(loc).await?;
                if cfg.cluster_cache.behaviour == ClusterCacheBehaviour::CacheOnRead {
                    self.cluster_cache.insert(
                        &cfg.cluster_cache,
                        &cfg.ns,
                        addr,
                        hash,
                        payload.clone(),
                    );
                }
                Ok(payload)
            }
        }
    }

    // --- Sync / resize ---

    /// Durability point: TLog fsync plus a DTL flush, subject to the
    /// per-volume sync-ignore policy.
    pub async fn sync(&self) -> Result<(), PeridotError> {
        self.check_not_halted()?;
        {
            let cfg = self.config.read();
            let mut st = self.sync_state.lock();
            if st.ignored < cfg.sync_ignore_count
                && st.last_forced.elapsed() < cfg.sync_ignore_max
            {
                st.ignored += 1;
                return Ok(());
            }
            st.ignored = 0;
            st.last_forced = Instant::now();
        }
        let mut inner = self.inner.write().await;
        inner.datastore.sync().await.map_err(|e| self.fatal(e))?;
        inner.manager.sync().await.map_err(|e| self.fatal(e))?;
        drop(inner);
        if self.dtl.mode().is_some() && !self.dtl.is_degraded() {
            if let Err(e) = self.dtl.flush().await {
                warn!("DTL flush failed: {}", e);
                self.set_failover_state(VolumeFailoverState::Degraded);
            }
        }
        Ok(())
    }

    /// Extend-only resize; existing locations are preserved.
    pub async fn resize(&self, new_size: u64) -> Result<(), PeridotError> {
        self.check_writable()?;
        let mut cfg = self.config.write();
        if new_size < cfg.size {
            return Err(PeridotError::InvalidOperation(
                "volumes can only grow".to_string(),
            ));
        }
        if new_size % cfg.cluster_size() as u64 != 0 {
            return Err(PeridotError::InvalidOperation(
                "size must be a whole number of clusters".to_string(),
            ));
        }
        cfg.size = new_size;
        self.sco_cache
            .set_max_non_disposable(&cfg.ns, cfg.max_non_disposable_bytes());
        Ok(())
    }

    // --- Snapshot operations ---

    pub async fn create_snapshot(
        &self,
        name: SnapshotName,
        metadata: Vec<u8>,
        uuid: Option<Uuid>,
        as_scrubbed: bool,
    ) -> Result<(), PeridotError> {
        self.check_writable()?;
        let cfg = self.config();
        let _snap = self.snapshot_lock.lock().await;
        let mut inner = self.inner.write().await;
        if let Some(sealed) = inner.datastore.seal_current().await? {
            self.handle_sealed_sco(&mut inner.manager, sealed)
                .await
                .map_err(|e| self.fatal(e))?;
        }
        let cluster_count = self.metadata.stats().used_clusters;
        inner
            .manager
            .create_snapshot(
                name,
                metadata,
                uuid,
                as_scrubbed,
                cluster_count,
                cfg.max_snapshot_metadata_size,
            )
            .await?;
        Ok(())
    }

    /// Index of a snapshot, for lineage comparisons.
    async fn snapshot_index(&self, name: &str) -> Result<usize, PeridotError> {
        self.inner
            .read()
            .await
            .manager
            .persistor()
            .find_snapshot(name)
            .ok_or_else(|| PeridotError::SnapshotNotFound(name.to_string()))
    }

    /// Clones whose parent snapshot sits at index >= `min_index`.
    async fn clones_at_or_after(&self, min_index: usize) -> Result<Vec<VolumeId>, PeridotError> {
        let Some(registry) = self.registry.upgrade() else {
            return Ok(Vec::new());
        };
        let ns = self.namespace();
        let mut blocking = Vec::new();
        for (clone_id, parent_snapshot) in registry.clones_of(&ns) {
            match self.snapshot_index(&parent_snapshot).await {
                Ok(idx) if idx >= min_index => blocking.push(clone_id),
                // A clone from an already-deleted snapshot cannot block
                // anything deeper in history.
                _ => {}
            }
        }
        Ok(blocking)
    }

    pub async fn delete_snapshot(&self, name: &str) -> Result<(), PeridotError> {
        self.check_not_halted()?;
        let _snap = self.snapshot_lock.lock().await;
        let idx = self.snapshot_index(name).await?;
        let children = self.clones_at_or_after(idx).await?;
        if !children.is_empty() {
            return Err(PeridotError::ObjectStillHasChildren(format!(
                "snapshot '{}' has clones: {}",
                name,
                children.join(", ")
            )));
        }
        let mut inner = self.inner.write().await;
        inner.manager.delete_snapshot(name)
    }

    pub async fn restore_snapshot(&self, name: &str) -> Result<(), PeridotError> {
        self.check_writable()?;
        let _snap = self.snapshot_lock.lock().await;
        let idx = self.snapshot_index(name).await?;
        // A clone sitting on a later snapshot pins everything after
        // `name`; rolling back past it would orphan the clone.
        let children = self.clones_at_or_after(idx + 1).await?;
        if !children.is_empty() {
            return Err(PeridotError::ObjectStillHasChildren(format!(
                "snapshots after '{}' have clones: {}",
                name,
                children.join(", ")
            )));
        }
        let mut inner = self.inner.write().await;
        inner.datastore.discard_current().await?;
        let outcome = inner.manager.restore_snapshot(name).await?;
        inner.datastore.bump_sco_number(outcome.max_sco_number + 1);
        drop(inner);
        info!(
            "volume {} restored to '{}' ({} clusters replayed)",
            self.id(),
            name,
            outcome.replayed_clusters
        );
        // The peer's log describes overwritten history now.
        if self.dtl.mode().is_some() && !self.dtl.is_degraded() {
            let _ = self.dtl.clear().await;
        }
        Ok(())
    }

    /// Turns the volume into a read-only template with a single terminal
    /// snapshot. Calling it twice is the same as calling it once.
    pub async fn set_as_template(&self) -> Result<(), PeridotError> {
        self.check_not_halted()?;
        if self.is_template() {
            return Ok(());
        }
        let _snap = self.snapshot_lock.lock().await;
        let mut inner = self.inner.write().await;
        if let Some(sealed) = inner.datastore.seal_current().await? {
            self.handle_sealed_sco(&mut inner.manager, sealed)
                .await
                .map_err(|e| self.fatal(e))?;
        }
        inner.manager.set_as_template().await?;
        drop(inner);
        self.config.write().is_template = true;
        info!("volume {} is now a template", self.id());
        Ok(())
    }

    pub async fn list_snapshots(&self) -> Vec<SnapshotName> {
        self.inner
            .read()
            .await
            .manager
            .persistor()
            .snapshots()
            .iter()
            .map(|s| s.name.clone())
            .collect()
    }

    /// The name of the template snapshot clones are created from.
    pub async fn template_snapshot(&self) -> Result<(SnapshotName, bool), PeridotError> {
        let inner = self.inner.read().await;
        let snapshot = inner
            .manager
            .persistor()
            .last_snapshot()
            .ok_or_else(|| PeridotError::InvalidState("template has no snapshot".to_string()))?;
        Ok((snapshot.name.clone(), snapshot.in_backend()))
    }

    /// Whether a named snapshot is fully on the backend.
    pub async fn snapshot_backend_status(
        &self,
        name: &str,
    ) -> Result<(SnapshotName, bool), PeridotError> {
        let inner = self.inner.read().await;
        let persistor = inner.manager.persistor();
        let snapshot = persistor
            .find_snapshot(name)
            .and_then(|num| persistor.snapshot(num))
            .ok_or_else(|| PeridotError::SnapshotNotFound(name.to_string()))?;
        Ok((snapshot.name.clone(), snapshot.in_backend()))
    }

    // --- Scrubbing ---

    pub async fn get_scrubbing_work(&self) -> Result<Vec<Bytes>, PeridotError> {
        self.check_not_halted()?;
        if self.is_template() {
            return Err(PeridotError::InvalidOperation(
                "templates are not scrubbed".to_string(),
            ));
        }
        // Relocations would invalidate locations a clone inherited;
        // scrub work only exists for volumes without live clones.
        let children = self.clones_at_or_after(0).await?;
        if !children.is_empty() {
            return Err(PeridotError::ObjectStillHasChildren(format!(
                "volume has clones: {}",
                children.join(", ")
            )));
        }
        let inner = self.inner.read().await;
        inner
            .manager
            .scrub_candidates()?
            .iter()
            .map(ScrubWork::to_blob)
            .collect()
    }

    pub async fn apply_scrubbing_result(&self, blob: &[u8]) -> Result<(), PeridotError> {
        self.check_not_halted()?;
        let result = ScrubResult::from_blob(blob)?;
        let _snap = self.snapshot_lock.lock().await;
        let mut inner = self.inner.write().await;
        inner.manager.apply_scrub_result(&result).await
    }

    // --- Replication management ---

    /// Reconfigures the replication peer, e.g. from
    /// `setAutomaticFailOverCacheConfig`. A reachable peer brings the
    /// volume back to OK_SYNC through KETCHUP.
    pub async fn set_failover_cache_config(
        &self,
        peer: Option<DtlPeer>,
    ) -> Result<(), PeridotError> {
        self.check_not_halted()?;
        self.config.write().dtl_peer = peer.clone();
        match peer {
            None => {
                self.dtl.set_peer(None).await?;
                self.set_failover_state(VolumeFailoverState::OkStandalone);
            }
            Some(peer) => match self.dtl.set_peer(Some(peer)).await {
                Ok(()) => {
                    self.set_failover_state(VolumeFailoverState::Ketchup);
                    self.resync_dtl().await;
                }
                Err(e) => {
                    warn!("DTL peer unreachable at configuration: {}", e);
                    self.set_failover_state(VolumeFailoverState::Degraded);
                }
            },
        }
        Ok(())
    }

    /// Called by the failover monitor; retries a degraded peer.
    pub async fn failover_health_check(&self) {
        if self.failover_state() != VolumeFailoverState::Degraded {
            return;
        }
        if self.dtl.try_reconnect().await {
            info!("volume {}: DTL peer reachable again", self.id());
            self.set_failover_state(VolumeFailoverState::Ketchup);
            self.resync_dtl().await;
        }
    }

    /// Brings a re-established peer up to date. The peer's stale log is
    /// dropped; from here on every write is forwarded again, and the
    /// backend holds everything older.
    async fn resync_dtl(&self) {
        match self.dtl.clear().await {
            Ok(()) => self.set_failover_state(VolumeFailoverState::OkSync),
            Err(e) => {
                warn!("DTL resync failed: {}", e);
                self.set_failover_state(VolumeFailoverState::Degraded);
            }
        }
    }

    /// Replays the peer's log for SCOs the backend never saw, after a
    /// crash. Entries come back as ordinary writes.
    pub async fn replay_from_dtl(&self, last_synced_sco: u32) -> Result<u64, PeridotError> {
        if self.dtl.mode().is_none() {
            return Ok(0);
        }
        let cfg = self.config();
        let cs = cfg.cluster_size() as u64;
        // Scan first, write after: the replay writes are themselves
        // forwarded to the peer and must not feed back into the scan.
        let mut pending: Vec<(ClusterAddress, Vec<u8>)> = Vec::new();
        let mut sco_number = last_synced_sco + 1;
        loop {
            let mut clusters: Vec<(ClusterAddress, Vec<u8>)> = Vec::new();
            let n = self
                .dtl
                .get_sco_from_failover(ScoName::new(sco_number, 0), |addr, _loc, payload| {
                    clusters.push((addr, payload.to_vec()));
                })
                .await?;
            if n == 0 {
                break;
            }
            pending.extend(clusters);
            sco_number += 1;
        }
        let total = pending.len() as u64;
        for (addr, payload) in pending {
            let lba = addr.0 * cs / cfg.lba_size as u64;
            self.write(lba, &payload).await?;
        }
        if total > 0 {
            info!("volume {}: replayed {} clusters from the DTL", self.id(), total);
        }
        Ok(total)
    }

    // --- Tuning knobs ---

    pub async fn set_sco_multiplier(&self, multiplier: u32) -> Result<(), PeridotError> {
        if multiplier == 0 || multiplier > u16::MAX as u32 {
            return Err(PeridotError::InvalidOperation(
                "SCO multiplier must fit a 16-bit offset".to_string(),
            ));
        }
        let mut inner = self.inner.write().await;
        inner.datastore.set_sco_multiplier(multiplier);
        let mut cfg = self.config.write();
        cfg.sco_multiplier = multiplier;
        inner
            .manager
            .set_max_tlog_entries(cfg.max_tlog_entries());
        Ok(())
    }

    pub async fn set_tlog_multiplier(&self, multiplier: u32) -> Result<(), PeridotError> {
        if multiplier == 0 {
            return Err(PeridotError::InvalidOperation(
                "TLog multiplier must be non-zero".to_string(),
            ));
        }
        let mut inner = self.inner.write().await;
        let mut cfg = self.config.write();
        cfg.tlog_multiplier = multiplier;
        inner
            .manager
            .set_max_tlog_entries(cfg.max_tlog_entries());
        Ok(())
    }

    pub fn set_non_disposable_factor(&self, factor: f64) -> Result<(), PeridotError> {
        if factor <= 0.0 {
            return Err(PeridotError::InvalidOperation(
                "non-disposable factor must be positive".to_string(),
            ));
        }
        let mut cfg = self.config.write();
        cfg.non_disposable_factor = factor;
        self.sco_cache
            .set_max_non_disposable(&cfg.ns, cfg.max_non_disposable_bytes());
        Ok(())
    }

    pub fn set_cluster_cache_policy(&self, policy: ClusterCachePolicy) {
        self.config.write().cluster_cache = policy;
    }

    // --- Info ---

    pub async fn info(&self) -> VolumeInfo {
        let cfg = self.config();
        let stats: MetaDataStoreStats = self.metadata.stats();
        let snapshot_count = self.inner.read().await.manager.persistor().snapshots().len();
        VolumeInfo {
            id: cfg.id,
            namespace: cfg.ns.to_string(),
            size: cfg.size,
            lba_size: cfg.lba_size,
            cluster_multiplier: cfg.cluster_multiplier,
            sco_multiplier: cfg.sco_multiplier,
            tlog_multiplier: cfg.tlog_multiplier,
            failover_state: self.failover_state().to_string(),
            halted: self.is_halted(),
            is_template: cfg.is_template,
            parent: cfg.parent,
            snapshot_count,
            cluster_count: stats.used_clusters,
            metadata_cache_hits: stats.cache_hits,
            metadata_cache_misses: stats.cache_misses,
        }
    }

    /// Flushes everything to the backend and waits for it.
    pub async fn flush_to_backend(&self) -> Result<(), PeridotError> {
        self.check_not_halted()?;
        {
            let mut inner = self.inner.write().await;
            if let Some(sealed) = inner.datastore.seal_current().await? {
                self.handle_sealed_sco(&mut inner.manager, sealed).await?;
            }
            if inner.manager.tlog_entries() > 0 {
                inner.manager.rollover_tlog().await?;
            }
        }
        self.queue.drain().await
    }

    // --- Pipeline callbacks (via the registry task sink) ---

    pub(crate) async fn handle_sco_written(&self, sco: ScoName, _size: u64) {
        self.sco_cache.set_disposable(&self.namespace(), sco);
    }

    pub(crate) async fn handle_tlog_written(&self, tlog: TLogId, sco: ScoName) {
        let synced = {
            let mut inner = self.inner.write().await;
            match inner.manager.tlog_written_to_backend(tlog).await {
                Ok(synced) => synced,
                Err(e) => {
                    warn!("TLog bookkeeping for {} failed: {}", tlog, e);
                    return;
                }
            }
        };
        // The peer can drop everything the backend now holds.
        if sco.number > 0 && self.dtl.mode().is_some() && !self.dtl.is_degraded() {
            let _ = self.dtl.remove_up_to(sco).await;
        }
        if synced && self.failover_state() == VolumeFailoverState::Ketchup {
            self.set_failover_state(VolumeFailoverState::OkSync);
        }
    }

    pub(crate) async fn handle_tlog_still_referenced(&self, tlog: TLogId) -> bool {
        self.inner
            .read()
            .await
            .manager
            .tlog_still_referenced(tlog)
    }

    pub(crate) fn task_queue(&self) -> Arc<VolumeTaskQueue> {
        self.queue.clone()
    }

    pub(crate) async fn snapshot_manager_view<R>(
        &self,
        f: impl FnOnce(&SnapshotManager) -> R,
    ) -> R {
        let inner = self.inner.read().await;
        f(&inner.manager)
    }
}
