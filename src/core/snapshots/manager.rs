// src/core/snapshots/manager.rs

//! Snapshot management: TLog rollovers, snapshot create/delete/restore,
//! templates, scrub bookkeeping, and backend-sync accounting.
//!
//! The manager owns the persistor and the open TLog writer. The volume
//! drives it under the snapshot lock and is responsible for sealing the
//! current SCO before any TLog boundary, so a TLog always fully covers
//! the SCOs it references and the upload barrier holds.

use super::{SnapshotPersistor, TLogMeta};
use crate::core::backend::BackendConnector;
use crate::core::backend::pipeline::{BackendTask, VolumeTaskQueue};
use crate::core::errors::PeridotError;
use crate::core::metadata::MetaDataStore;
use crate::core::scrub::{ScrubResult, ScrubWork};
use crate::core::snapshots::ParentRef;
use crate::core::tlog::{TLogEntry, TLogReader, TLogWriter};
use crate::core::types::{
    ClusterAddress, ClusterHash, ClusterLocation, CorkId, Namespace, ScoName, SnapshotName,
    SnapshotNum, TLogId, VolumeId,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What a restore hands back to the volume for metadata rebuild.
pub struct RestoreOutcome {
    /// Highest SCO number referenced by retained history; the datastore
    /// must allocate past it.
    pub max_sco_number: u32,
    /// Clusters replayed into the metadata store.
    pub replayed_clusters: u64,
}

pub struct SnapshotManager {
    ns: Namespace,
    tlog_dir: PathBuf,
    max_tlog_entries: u64,
    persistor: SnapshotPersistor,
    writer: Option<TLogWriter>,
    metadata: Arc<dyn MetaDataStore>,
    queue: Arc<VolumeTaskQueue>,
    backend: Arc<dyn BackendConnector>,
    /// Last SCO referenced by the open TLog; rides with the upload task
    /// so the DTL can trim up to it.
    last_sco: Option<ScoName>,
}

impl SnapshotManager {
    /// Creates the manager for a brand-new volume: fresh persistor, the
    /// first TLog open, the first cork placed, and the initial manifest
    /// enqueued.
    pub async fn create(
        volume_id: VolumeId,
        ns: Namespace,
        parent: Option<ParentRef>,
        tlog_dir: PathBuf,
        max_tlog_entries: u64,
        metadata: Arc<dyn MetaDataStore>,
        queue: Arc<VolumeTaskQueue>,
        backend: Arc<dyn BackendConnector>,
    ) -> Result<Self, PeridotError> {
        tokio::fs::create_dir_all(&tlog_dir).await?;
        let persistor = SnapshotPersistor::new(volume_id, parent);
        let current = persistor.current_tlog();
        let mut mgr = Self {
            ns,
            tlog_dir,
            max_tlog_entries,
            persistor,
            writer: None,
            metadata,
            queue,
            backend,
            last_sco: None,
        };
        mgr.writer = Some(TLogWriter::create(&mgr.tlog_path(current)).await?);
        mgr.metadata.cork(CorkId::from(current)).await?;
        mgr.persist_manifest()?;
        Ok(mgr)
    }

    /// Reopens a volume from the manifest fetched from the backend. Any
    /// local TLog file not referenced there is an aborted write and is
    /// removed; the previously open TLog (if its local file survived) is
    /// sealed and scheduled for upload, and a fresh TLog takes over.
    pub async fn open_from_manifest(
        manifest: &[u8],
        ns: Namespace,
        tlog_dir: PathBuf,
        max_tlog_entries: u64,
        metadata: Arc<dyn MetaDataStore>,
        queue: Arc<VolumeTaskQueue>,
        backend: Arc<dyn BackendConnector>,
    ) -> Result<Self, PeridotError> {
        tokio::fs::create_dir_all(&tlog_dir).await?;
        let persistor = SnapshotPersistor::deserialize(manifest)?;
        let mut mgr = Self {
            ns,
            tlog_dir,
            max_tlog_entries,
            persistor,
            writer: None,
            metadata,
            queue,
            backend,
            last_sco: None,
        };

        // Sweep aborted local TLogs.
        let mut dir = tokio::fs::read_dir(&mgr.tlog_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(id) = TLogId::parse_object_name(&name) {
                if !mgr.persistor.tlog_referenced(id) {
                    warn!("removing aborted TLog {} after restart", id);
                    let _ = tokio::fs::remove_file(entry.path()).await;
                }
            }
        }

        // Seal the interrupted open TLog if its file survived the crash,
        // then continue on a fresh one.
        let open = mgr.persistor.current_tlog();
        let open_path = mgr.tlog_path(open);
        if tokio::fs::try_exists(&open_path).await? {
            let entries = TLogReader::read_all(&open_path).await?;
            let mut bytes = Vec::with_capacity(entries.len() * crate::core::tlog::TLOG_ENTRY_SIZE);
            for entry in &entries {
                bytes.extend_from_slice(&entry.encode());
            }
            // A torn trailing record would fail the upload's checksum;
            // rewrite the file as exactly the complete entries.
            let checksum = crate::core::tlog::CHECKSUM_ALGO.checksum(&bytes);
            tokio::fs::write(&open_path, &bytes).await?;
            mgr.persistor.close_current_tlog(entries.len() as u64);
            mgr.queue.enqueue(BackendTask::WriteTLog {
                tlog: open,
                path: open_path,
                checksum,
                sco: mgr.last_sco.unwrap_or(ScoName::new(0, 0)),
            });
        } else {
            // The file never made it to disk; nothing of it was
            // acknowledged past the last sync, so it is dropped.
            mgr.persistor.close_current_tlog(0);
        }
        let fresh = mgr.persistor.open_new_tlog();
        mgr.writer = Some(TLogWriter::create(&mgr.tlog_path(fresh)).await?);
        mgr.metadata.cork(CorkId::from(fresh)).await?;
        mgr.persist_manifest()?;
        Ok(mgr)
    }

    pub fn tlog_path(&self, id: TLogId) -> PathBuf {
        self.tlog_dir.join(id.object_name())
    }

    pub fn persistor(&self) -> &SnapshotPersistor {
        &self.persistor
    }

    pub fn max_tlog_entries(&self) -> u64 {
        self.max_tlog_entries
    }

    /// Takes effect at the next rollover check.
    pub fn set_max_tlog_entries(&mut self, max: u64) {
        self.max_tlog_entries = max;
    }

    /// Entries in the open TLog.
    pub fn tlog_entries(&self) -> u64 {
        self.writer.as_ref().map(|w| w.entries()).unwrap_or(0)
    }

    fn writer_mut(&mut self) -> Result<&mut TLogWriter, PeridotError> {
        self.writer
            .as_mut()
            .ok_or_else(|| PeridotError::InvalidState("no open TLog".to_string()))
    }

    // --- Data path ---

    pub async fn add_cluster(
        &mut self,
        addr: ClusterAddress,
        loc: ClusterLocation,
        hash: ClusterHash,
    ) -> Result<(), PeridotError> {
        self.last_sco = Some(loc.sco);
        self.writer_mut()?
            .add(TLogEntry::Cluster { addr, loc, hash })
            .await
    }

    pub async fn add_sco_crc(&mut self, crc: u32) -> Result<(), PeridotError> {
        self.writer_mut()?.add(TLogEntry::ScoCrc(crc)).await
    }

    /// Appends a sync checkpoint and fsyncs the open TLog.
    pub async fn sync(&mut self) -> Result<(), PeridotError> {
        let writer = self.writer_mut()?;
        writer.add(TLogEntry::Sync).await?;
        writer.sync().await
    }

    /// Closes the open TLog, schedules its upload, opens a successor and
    /// corks the metadata store on it. The caller has already sealed the
    /// current SCO and appended its CRC.
    pub async fn rollover_tlog(&mut self) -> Result<(), PeridotError> {
        let writer = self
            .writer
            .take()
            .ok_or_else(|| PeridotError::InvalidState("no open TLog".to_string()))?;
        let (checksum, entries) = writer.close().await?;
        let closed = self.persistor.close_current_tlog(entries);
        self.queue.enqueue(BackendTask::WriteTLog {
            tlog: closed,
            path: self.tlog_path(closed),
            checksum,
            sco: self.last_sco.unwrap_or(ScoName::new(0, 0)),
        });

        let fresh = self.persistor.open_new_tlog();
        self.writer = Some(TLogWriter::create(&self.tlog_path(fresh)).await?);
        self.metadata.cork(CorkId::from(fresh)).await?;
        self.persist_manifest()?;
        debug!("TLog rollover: {} -> {}", closed, fresh);
        Ok(())
    }

    /// Serializes the manifest and enqueues its (barrier) upload.
    pub fn persist_manifest(&self) -> Result<(), PeridotError> {
        let serialized = self.persistor.serialize()?;
        self.queue.enqueue(BackendTask::WriteSnapshots { serialized });
        Ok(())
    }

    // --- Snapshot operations ---

    pub async fn create_snapshot(
        &mut self,
        name: SnapshotName,
        metadata: Vec<u8>,
        uuid: Option<Uuid>,
        as_scrubbed: bool,
        cluster_count: u64,
        max_metadata_size: usize,
    ) -> Result<SnapshotNum, PeridotError> {
        if metadata.len() > max_metadata_size {
            return Err(PeridotError::SnapshotMetadataTooLarge {
                got: metadata.len(),
                max: max_metadata_size,
            });
        }
        if self.persistor.find_snapshot(&name).is_some() {
            return Err(PeridotError::FileExists(name));
        }
        if !self.persistor.last_snapshot_on_backend() {
            return Err(PeridotError::PreviousSnapshotNotOnBackend(
                self.persistor
                    .last_snapshot()
                    .map(|s| s.name.clone())
                    .unwrap_or_default(),
            ));
        }

        let writer = self
            .writer
            .take()
            .ok_or_else(|| PeridotError::InvalidState("no open TLog".to_string()))?;
        let (checksum, entries) = writer.close().await?;
        let closed = self.persistor.close_current_tlog(entries);
        self.queue.enqueue(BackendTask::WriteTLog {
            tlog: closed,
            path: self.tlog_path(closed),
            checksum,
            sco: self.last_sco.unwrap_or(ScoName::new(0, 0)),
        });

        let num = self
            .persistor
            .take_snapshot(name.clone(), uuid, metadata, as_scrubbed, cluster_count)?;
        let fresh = self.persistor.current_tlog();
        self.writer = Some(TLogWriter::create(&self.tlog_path(fresh)).await?);
        self.metadata.cork(CorkId::from(fresh)).await?;
        self.persist_manifest()?;
        info!("created snapshot '{}' (#{})", name, num);
        Ok(num)
    }

    pub fn delete_snapshot(&mut self, name: &str) -> Result<(), PeridotError> {
        let num = self
            .persistor
            .find_snapshot(name)
            .ok_or_else(|| PeridotError::SnapshotNotFound(name.to_string()))?;
        self.persistor.delete_snapshot(num)?;
        self.persist_manifest()?;
        info!("deleted snapshot '{}'", name);
        Ok(())
    }

    /// Rolls the volume back to `name`. Orphaned TLogs are removed
    /// locally and on the backend, the metadata store is rebuilt by
    /// replaying the retained TLogs, and the manifest is rewritten.
    pub async fn restore_snapshot(&mut self, name: &str) -> Result<RestoreOutcome, PeridotError> {
        let num = self
            .persistor
            .find_snapshot(name)
            .ok_or_else(|| PeridotError::SnapshotNotFound(name.to_string()))?;

        // Drop the open writer; its TLog is about to be orphaned.
        if let Some(writer) = self.writer.take() {
            drop(writer);
        }
        let orphans = self.persistor.truncate_to_snapshot(num)?;

        // The orphans' SCOs are orphaned with them: SCO numbers grow
        // monotonically, so everything above the retained maximum goes.
        let retained = self.persistor.tlogs_up_to_snapshot(num);
        let (entries_replayed, max_retained_sco) =
            self.replay_into_metadata(&retained, true).await?;

        let mut orphan_scos = Vec::new();
        for meta in &orphans {
            if let Ok(entries) = self.read_tlog(meta.id).await {
                for entry in entries {
                    if let TLogEntry::Cluster { loc, .. } = entry {
                        if loc.sco.clone_id == 0
                            && loc.sco.number > max_retained_sco
                            && !orphan_scos.contains(&loc.sco)
                        {
                            orphan_scos.push(loc.sco);
                        }
                    }
                }
            }
            let _ = tokio::fs::remove_file(self.tlog_path(meta.id)).await;
        }

        self.queue.enqueue(BackendTask::BlockDeleteTLogs {
            tlogs: orphans.iter().map(|t| t.id).collect(),
        });
        if !orphan_scos.is_empty() {
            self.queue.enqueue(BackendTask::BlockDeleteScos {
                scos: orphan_scos,
            });
        }

        let fresh = self.persistor.current_tlog();
        self.writer = Some(TLogWriter::create(&self.tlog_path(fresh)).await?);
        self.metadata.cork(CorkId::from(fresh)).await?;
        self.persist_manifest()?;
        info!("restored snapshot '{}'", name);
        Ok(RestoreOutcome {
            max_sco_number: max_retained_sco,
            replayed_clusters: entries_replayed,
        })
    }

    /// Collapses history into a terminal snapshot for templates.
    /// Idempotent; the volume flips itself read-only.
    pub async fn set_as_template(&mut self) -> Result<(), PeridotError> {
        let has_open_data = self.tlog_entries() > 0;
        if has_open_data || self.persistor.snapshots().is_empty() {
            let name = format!("template_{}", Uuid::new_v4());
            self.create_snapshot(name, Vec::new(), None, false, 0, usize::MAX)
                .await?;
        }
        let dropped = self.persistor.drop_all_but_last_snapshot();
        if !dropped.is_empty() {
            debug!("template collapse folded {} TLogs", dropped.len());
        }
        self.persist_manifest()?;
        Ok(())
    }

    // --- Backend-sync bookkeeping ---

    /// Callback from the upload pipeline: TLog `id` is durable.
    /// Returns `true` when every closed TLog is now on the backend.
    pub async fn tlog_written_to_backend(&mut self, id: TLogId) -> Result<bool, PeridotError> {
        self.persistor.set_tlog_written_to_backend(id)?;
        self.persist_manifest()?;
        match self.metadata.uncork_up_to(CorkId::from(id)).await {
            Ok(()) => {}
            // A restore may have discarded the cork already.
            Err(PeridotError::InvalidState(msg)) => {
                debug!("uncork for {} skipped: {}", id, msg);
            }
            Err(e) => return Err(e),
        }
        let _ = tokio::fs::remove_file(self.tlog_path(id)).await;
        Ok(self.persistor.backend_up_to_date())
    }

    pub fn tlog_still_referenced(&self, id: TLogId) -> bool {
        self.persistor.tlog_referenced(id)
    }

    // --- Scrubbing ---

    /// One work item per snapshot that is on the backend and not yet
    /// scrubbed. Clone-children filtering is the caller's concern; only
    /// it can see the registry.
    pub fn scrub_candidates(&self) -> Result<Vec<ScrubWork>, PeridotError> {
        Ok(self
            .persistor
            .snapshots()
            .iter()
            .filter(|s| s.in_backend() && !s.scrubbed)
            .map(|s| ScrubWork {
                volume_id: self.persistor.volume_id().clone(),
                namespace: self.ns.clone(),
                snapshot: s.name.clone(),
                snapshot_uuid: s.uuid,
                scrub_id: self.persistor.scrub_id(),
                tlogs: s.tlogs.iter().map(|t| t.id).collect(),
            })
            .collect())
    }

    /// Applies a scrub result: fences on the ScrubId, rewrites the
    /// metadata, swaps the snapshot's TLogs for the scrubbed ones, and
    /// schedules the obsolete objects for deletion.
    pub async fn apply_scrub_result(&mut self, result: &ScrubResult) -> Result<(), PeridotError> {
        let current = self.persistor.scrub_id();
        if result.scrub_id != current {
            return Err(PeridotError::StaleScrubResult {
                expected: current,
                got: result.scrub_id,
            });
        }
        let num = self
            .persistor
            .find_snapshot(&result.snapshot)
            .ok_or_else(|| PeridotError::SnapshotNotFound(result.snapshot.clone()))?;

        self.metadata
            .apply_relocations(current, &result.relocations)
            .await?;
        let replaced = self
            .persistor
            .replace_snapshot_tlogs(num, result.replacement_tlogs.clone())?;
        let new_id = self.persistor.bump_scrub_id();
        self.metadata.set_scrub_id(new_id);

        let mut obsolete = result.obsolete_tlogs.clone();
        for id in replaced {
            if !obsolete.contains(&id) && !self.persistor.tlog_referenced(id) {
                obsolete.push(id);
            }
        }
        for id in &obsolete {
            let _ = tokio::fs::remove_file(self.tlog_path(*id)).await;
        }
        self.queue
            .enqueue(BackendTask::BlockDeleteTLogs { tlogs: obsolete });
        if !result.obsolete_scos.is_empty() {
            self.queue.enqueue(BackendTask::BlockDeleteScos {
                scos: result.obsolete_scos.clone(),
            });
        }
        self.persist_manifest()?;
        info!(
            "applied scrub result for snapshot '{}' (scrub id {} -> {})",
            result.snapshot, current, new_id
        );
        Ok(())
    }

    // --- TLog replay ---

    /// Reads a TLog from the local scratch directory or, failing that,
    /// from the backend.
    async fn read_tlog(&self, id: TLogId) -> Result<Vec<TLogEntry>, PeridotError> {
        self.read_tlog_from(&self.ns.clone(), id).await
    }

    async fn read_tlog_from(
        &self,
        ns: &Namespace,
        id: TLogId,
    ) -> Result<Vec<TLogEntry>, PeridotError> {
        if *ns == self.ns {
            let path = self.tlog_path(id);
            if tokio::fs::try_exists(&path).await? {
                return TLogReader::read_all(&path).await;
            }
        }
        let bytes = self.backend.get(ns, &id.object_name()).await?;
        TLogReader::decode_stream(&bytes)
    }

    /// Replays TLogs into the metadata store. With `clear_first` the
    /// store is wiped, so the result is exactly the replayed history.
    /// Returns `(clusters replayed, highest own-namespace SCO number)`.
    pub async fn replay_into_metadata(
        &self,
        tlogs: &[TLogMeta],
        clear_first: bool,
    ) -> Result<(u64, u32), PeridotError> {
        self.replay_tlogs(&self.ns.clone(), tlogs, clear_first, false)
            .await
    }

    /// Seeds a clone's metadata from its parent's TLogs: every location's
    /// clone id shifts one level up the namespace chain.
    pub async fn replay_parent_tlogs(
        &self,
        parent_ns: &Namespace,
        tlogs: &[TLogMeta],
    ) -> Result<(u64, u32), PeridotError> {
        self.replay_tlogs(parent_ns, tlogs, false, true).await
    }

    async fn replay_tlogs(
        &self,
        ns: &Namespace,
        tlogs: &[TLogMeta],
        clear_first: bool,
        bump_clone_id: bool,
    ) -> Result<(u64, u32), PeridotError> {
        if clear_first {
            self.metadata.clear().await?;
        }
        let mut replayed = 0u64;
        let mut max_sco = 0u32;
        for meta in tlogs {
            let entries = self.read_tlog_from(ns, meta.id).await?;
            let batch: Vec<_> = entries
                .iter()
                .filter_map(|entry| match entry {
                    TLogEntry::Cluster { addr, loc, hash } => {
                        let mut loc = *loc;
                        if bump_clone_id {
                            loc.sco.clone_id += 1;
                        }
                        Some((*addr, loc, *hash))
                    }
                    _ => None,
                })
                .collect();
            for (_, loc, _) in &batch {
                if loc.sco.clone_id == 0 {
                    max_sco = max_sco.max(loc.sco.number);
                }
            }
            replayed += batch.len() as u64;
            self.metadata.multi_set(&batch).await?;
        }
        Ok((replayed, max_sco))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::core::backend::pipeline::{BackendPipeline, BackendTaskHandler};
    use crate::core::backend::{BackendConnector, LocalBackend};
    use crate::core::metadata::PagedMetaDataStore;
    use async_trait::async_trait;
    use std::sync::Weak;

    struct NullHandler;

    #[async_trait]
    impl BackendTaskHandler for NullHandler {
        async fn sco_written_to_backend(&self, _sco: ScoName, _size: u64) {}
        async fn tlog_written_to_backend(&self, _tlog: TLogId, _sco: ScoName) {}
        async fn tlog_still_referenced(&self, _tlog: TLogId) -> bool {
            true
        }
        async fn report_backend_failure(&self, what: &str) {
            panic!("unexpected backend failure: {what}");
        }
    }

    async fn setup(
        dir: &tempfile::TempDir,
    ) -> (SnapshotManager, Arc<dyn BackendConnector>, Namespace) {
        let backend: Arc<dyn BackendConnector> =
            Arc::new(LocalBackend::new(dir.path().join("backend")));
        let ns = Namespace::new("vol");
        backend.create_namespace(&ns).await.unwrap();
        let metadata: Arc<dyn MetaDataStore> = Arc::new(PagedMetaDataStore::new(64, 4));
        let pipeline = BackendPipeline::new(BackendConfig::default());
        let handler: Arc<NullHandler> = Arc::new(NullHandler);
        // Leak the handler so the weak stays alive for the test's runtime.
        let weak: Weak<dyn BackendTaskHandler> =
            Arc::downgrade(&handler) as Weak<dyn BackendTaskHandler>;
        std::mem::forget(handler);
        let queue = Arc::new(pipeline.queue_for(ns.clone(), backend.clone(), weak));
        let mgr = SnapshotManager::create(
            "vol".to_string(),
            ns.clone(),
            None,
            dir.path().join("tlogs"),
            64,
            metadata,
            queue,
            backend.clone(),
        )
        .await
        .unwrap();
        (mgr, backend, ns)
    }

    #[tokio::test]
    async fn snapshot_flow_uploads_tlog_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let (mut mgr, backend, ns) = setup(&dir).await;

        let loc = ClusterLocation::new(ScoName::new(1, 0), 0);
        mgr.add_cluster(ClusterAddress(0), loc, ClusterHash(1))
            .await
            .unwrap();
        mgr.add_sco_crc(0xabcd).await.unwrap();

        let closed = mgr.persistor().current_tlog();
        mgr.create_snapshot("s1".to_string(), Vec::new(), None, false, 1, 4096)
            .await
            .unwrap();
        mgr.queue.drain().await.unwrap();

        assert!(backend.exists(&ns, &closed.object_name()).await.unwrap());
        assert!(backend.exists(&ns, "snapshots").await.unwrap());

        // The uploaded manifest parses and lists the snapshot.
        let manifest = backend.get(&ns, "snapshots").await.unwrap();
        let p = SnapshotPersistor::deserialize(&manifest).unwrap();
        assert!(p.find_snapshot("s1").is_some());
    }

    #[tokio::test]
    async fn tlog_written_callback_uncorks_and_reports_sync() {
        let dir = tempfile::tempdir().unwrap();
        let (mut mgr, _backend, _ns) = setup(&dir).await;

        let loc = ClusterLocation::new(ScoName::new(1, 0), 0);
        mgr.add_cluster(ClusterAddress(7), loc, ClusterHash(7))
            .await
            .unwrap();
        let closed = mgr.persistor().current_tlog();
        mgr.create_snapshot("s1".to_string(), Vec::new(), None, false, 1, 4096)
            .await
            .unwrap();
        assert!(!mgr.persistor().backend_up_to_date());

        let synced = mgr.tlog_written_to_backend(closed).await.unwrap();
        assert!(synced);
        assert!(mgr.persistor().last_snapshot_on_backend());
        // The local TLog file is gone.
        assert!(!mgr.tlog_path(closed).exists());
    }

    #[tokio::test]
    async fn second_snapshot_requires_first_on_backend() {
        let dir = tempfile::tempdir().unwrap();
        let (mut mgr, _backend, _ns) = setup(&dir).await;

        mgr.add_cluster(
            ClusterAddress(0),
            ClusterLocation::new(ScoName::new(1, 0), 0),
            ClusterHash(1),
        )
        .await
        .unwrap();
        mgr.create_snapshot("s1".to_string(), Vec::new(), None, false, 1, 4096)
            .await
            .unwrap();

        let err = mgr
            .create_snapshot("s2".to_string(), Vec::new(), None, false, 1, 4096)
            .await
            .unwrap_err();
        assert!(matches!(err, PeridotError::PreviousSnapshotNotOnBackend(_)));
    }
}
