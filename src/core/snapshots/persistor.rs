// src/core/snapshots/persistor.rs

//! In-memory snapshot tree with manifest (de)serialization.
//!
//! The persistor is a pure state machine: it tracks snapshots, the open
//! TLog list and the per-TLog `written_to_backend` flags, and renders
//! the manifest document. File and backend I/O belong to the snapshot
//! manager.

use super::{
    ParentRef, SNAPSHOTS_FORMAT_VERSION, Snapshot, SnapshotsDocument, TLogMeta,
};
use crate::core::errors::PeridotError;
use crate::core::types::{ScrubId, SnapshotName, SnapshotNum, TLogId, VolumeId};
use bytes::Bytes;
use chrono::Utc;
use uuid::Uuid;

pub struct SnapshotPersistor {
    doc: SnapshotsDocument,
}

impl SnapshotPersistor {
    /// Fresh persistor for a new volume, with the first TLog open.
    pub fn new(volume_id: VolumeId, parent: Option<ParentRef>) -> Self {
        let first = TLogId::new();
        Self {
            doc: SnapshotsDocument {
                format_version: SNAPSHOTS_FORMAT_VERSION,
                volume_id,
                parent,
                snapshots: Vec::new(),
                current: vec![TLogMeta::open(first)],
                last_cork: Some(first.0),
                scrub_id: 0,
            },
        }
    }

    pub fn from_document(doc: SnapshotsDocument) -> Result<Self, PeridotError> {
        if doc.format_version != SNAPSHOTS_FORMAT_VERSION {
            return Err(PeridotError::InvalidOperation(format!(
                "unsupported snapshots format version {}",
                doc.format_version
            )));
        }
        if doc.current.is_empty() {
            return Err(PeridotError::InvalidOperation(
                "snapshots document lacks an open TLog".to_string(),
            ));
        }
        Ok(Self { doc })
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, PeridotError> {
        let doc: SnapshotsDocument = serde_json::from_slice(bytes)?;
        Self::from_document(doc)
    }

    pub fn serialize(&self) -> Result<Bytes, PeridotError> {
        Ok(Bytes::from(serde_json::to_vec(&self.doc)?))
    }

    pub fn document(&self) -> &SnapshotsDocument {
        &self.doc
    }

    pub fn volume_id(&self) -> &VolumeId {
        &self.doc.volume_id
    }

    pub fn parent(&self) -> Option<&ParentRef> {
        self.doc.parent.as_ref()
    }

    // --- TLog bookkeeping ---

    /// The TLog currently being written.
    pub fn current_tlog(&self) -> TLogId {
        self.doc
            .current
            .last()
            .expect("an open TLog always exists")
            .id
    }

    /// Seals the open TLog, recording its entry count.
    pub fn close_current_tlog(&mut self, entries: u64) -> TLogId {
        let meta = self
            .doc
            .current
            .last_mut()
            .expect("an open TLog always exists");
        meta.entries = entries;
        meta.id
    }

    /// Opens a fresh TLog at the tail of the current list.
    pub fn open_new_tlog(&mut self) -> TLogId {
        let id = TLogId::new();
        self.doc.current.push(TLogMeta::open(id));
        self.doc.last_cork = Some(id.0);
        id
    }

    /// Flags a TLog as durable on the backend.
    pub fn set_tlog_written_to_backend(&mut self, id: TLogId) -> Result<(), PeridotError> {
        for meta in self
            .doc
            .snapshots
            .iter_mut()
            .flat_map(|s| s.tlogs.iter_mut())
            .chain(self.doc.current.iter_mut())
        {
            if meta.id == id {
                meta.written_to_backend = true;
                return Ok(());
            }
        }
        Err(PeridotError::ObjectNotFound(id.to_string()))
    }

    /// Whether any snapshot or the current list still references `id`.
    pub fn tlog_referenced(&self, id: TLogId) -> bool {
        self.doc
            .snapshots
            .iter()
            .flat_map(|s| s.tlogs.iter())
            .chain(self.doc.current.iter())
            .any(|meta| meta.id == id)
    }

    /// All closed TLogs are on the backend (the open tail never is).
    pub fn backend_up_to_date(&self) -> bool {
        let open = self.current_tlog();
        self.doc
            .snapshots
            .iter()
            .flat_map(|s| s.tlogs.iter())
            .chain(self.doc.current.iter())
            .all(|meta| meta.written_to_backend || meta.id == open)
    }

    // --- Snapshots ---

    pub fn find_snapshot(&self, name: &str) -> Option<SnapshotNum> {
        self.doc.snapshots.iter().position(|s| s.name == name)
    }

    pub fn snapshot(&self, num: SnapshotNum) -> Option<&Snapshot> {
        self.doc.snapshots.get(num)
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.doc.snapshots
    }

    pub fn last_snapshot(&self) -> Option<&Snapshot> {
        self.doc.snapshots.last()
    }

    /// True when the newest snapshot (if any) is fully on the backend.
    pub fn last_snapshot_on_backend(&self) -> bool {
        self.last_snapshot().map(|s| s.in_backend()).unwrap_or(true)
    }

    /// Seals the current list into a named snapshot and opens a fresh
    /// TLog. The caller must have closed the open TLog beforehand.
    pub fn take_snapshot(
        &mut self,
        name: SnapshotName,
        uuid: Option<Uuid>,
        metadata: Vec<u8>,
        scrubbed: bool,
        cluster_count: u64,
    ) -> Result<SnapshotNum, PeridotError> {
        if self.find_snapshot(&name).is_some() {
            return Err(PeridotError::FileExists(name));
        }
        let tlogs = std::mem::take(&mut self.doc.current);
        self.doc.snapshots.push(Snapshot {
            name,
            uuid: uuid.unwrap_or_else(Uuid::new_v4),
            timestamp: Utc::now(),
            metadata,
            scrubbed,
            cluster_count,
            tlogs,
        });
        self.open_new_tlog();
        Ok(self.doc.snapshots.len() - 1)
    }

    /// Removes a snapshot, folding its TLogs into the successor so later
    /// history stays replayable. With no successor snapshot they fold
    /// into the front of the current list.
    pub fn delete_snapshot(&mut self, num: SnapshotNum) -> Result<(), PeridotError> {
        if num >= self.doc.snapshots.len() {
            return Err(PeridotError::SnapshotNotFound(num.to_string()));
        }
        let removed = self.doc.snapshots.remove(num);
        if let Some(successor) = self.doc.snapshots.get_mut(num) {
            let mut tlogs = removed.tlogs;
            tlogs.extend(successor.tlogs.drain(..));
            successor.tlogs = tlogs;
            successor.scrubbed = false;
        } else {
            let mut tlogs = removed.tlogs;
            tlogs.extend(self.doc.current.drain(..));
            self.doc.current = tlogs;
        }
        Ok(())
    }

    /// TLogs of snapshots `0..=num`, in replay order: the prefix needed
    /// to rebuild state as of that snapshot.
    pub fn tlogs_up_to_snapshot(&self, num: SnapshotNum) -> Vec<TLogMeta> {
        self.doc
            .snapshots
            .iter()
            .take(num + 1)
            .flat_map(|s| s.tlogs.iter().cloned())
            .collect()
    }

    /// Every TLog in order: snapshots first, then the current list.
    pub fn all_tlogs(&self) -> Vec<TLogMeta> {
        self.doc
            .snapshots
            .iter()
            .flat_map(|s| s.tlogs.iter().cloned())
            .chain(self.doc.current.iter().cloned())
            .collect()
    }

    /// Rolls history back to snapshot `num`: snapshots after it and the
    /// whole current list are dropped and returned (the orphans), and a
    /// fresh TLog is opened.
    pub fn truncate_to_snapshot(&mut self, num: SnapshotNum) -> Result<Vec<TLogMeta>, PeridotError> {
        if num >= self.doc.snapshots.len() {
            return Err(PeridotError::SnapshotNotFound(num.to_string()));
        }
        let mut orphans: Vec<TLogMeta> = self
            .doc
            .snapshots
            .drain(num + 1..)
            .flat_map(|s| s.tlogs)
            .collect();
        orphans.extend(std::mem::take(&mut self.doc.current));
        self.doc.current.clear();
        let id = TLogId::new();
        self.doc.current.push(TLogMeta::open(id));
        self.doc.last_cork = Some(id.0);
        Ok(orphans)
    }

    /// Collapses history to the newest snapshot, for template volumes.
    /// Idempotent. Returns the TLogs of the dropped older snapshots.
    pub fn drop_all_but_last_snapshot(&mut self) -> Vec<TLogMeta> {
        let keep = self.doc.snapshots.len().saturating_sub(1);
        let dropped: Vec<TLogMeta> = self
            .doc
            .snapshots
            .drain(..keep)
            .flat_map(|s| s.tlogs)
            .collect();
        // Older TLogs fold into the surviving snapshot: its state is the
        // replay of everything before it.
        if let Some(last) = self.doc.snapshots.first_mut() {
            let mut tlogs = dropped.clone();
            tlogs.extend(last.tlogs.drain(..));
            last.tlogs = tlogs;
        }
        dropped
    }

    /// Swaps a scrubbed snapshot's TLogs for their replacements. Returns
    /// the replaced TLog ids.
    pub fn replace_snapshot_tlogs(
        &mut self,
        num: SnapshotNum,
        replacements: Vec<TLogMeta>,
    ) -> Result<Vec<TLogId>, PeridotError> {
        let snapshot = self
            .doc
            .snapshots
            .get_mut(num)
            .ok_or_else(|| PeridotError::SnapshotNotFound(num.to_string()))?;
        let old = snapshot.tlogs.iter().map(|t| t.id).collect();
        snapshot.tlogs = replacements;
        snapshot.scrubbed = true;
        Ok(old)
    }

    // --- Scrub fencing ---

    pub fn scrub_id(&self) -> ScrubId {
        self.doc.scrub_id
    }

    pub fn bump_scrub_id(&mut self) -> ScrubId {
        self.doc.scrub_id += 1;
        self.doc.scrub_id
    }

    pub fn set_scrub_id(&mut self, id: ScrubId) {
        self.doc.scrub_id = id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persistor() -> SnapshotPersistor {
        SnapshotPersistor::new("vol".to_string(), None)
    }

    #[test]
    fn starts_with_one_open_tlog() {
        let p = persistor();
        assert_eq!(p.all_tlogs().len(), 1);
        assert!(p.backend_up_to_date());
        assert_eq!(p.document().last_cork, Some(p.current_tlog().0));
    }

    #[test]
    fn snapshot_seals_current_list() {
        let mut p = persistor();
        let first = p.current_tlog();
        p.close_current_tlog(10);
        let num = p
            .take_snapshot("s1".to_string(), None, Vec::new(), false, 10)
            .unwrap();
        assert_eq!(num, 0);
        assert_eq!(p.snapshot(0).unwrap().tlogs[0].id, first);
        assert_ne!(p.current_tlog(), first);

        // Duplicate names are refused.
        assert!(matches!(
            p.take_snapshot("s1".to_string(), None, Vec::new(), false, 0),
            Err(PeridotError::FileExists(_))
        ));
    }

    #[test]
    fn manifest_roundtrip() {
        let mut p = persistor();
        p.close_current_tlog(4);
        p.take_snapshot("s1".to_string(), None, b"meta".to_vec(), false, 4)
            .unwrap();
        let bytes = p.serialize().unwrap();
        let q = SnapshotPersistor::deserialize(&bytes).unwrap();
        assert_eq!(q.document(), p.document());
        assert_eq!(q.snapshot(0).unwrap().metadata, b"meta");
    }

    #[test]
    fn rejects_future_format_version() {
        let mut p = persistor();
        p.doc.format_version = SNAPSHOTS_FORMAT_VERSION + 1;
        let bytes = p.serialize().unwrap();
        assert!(SnapshotPersistor::deserialize(&bytes).is_err());
    }

    #[test]
    fn delete_folds_tlogs_into_successor() {
        let mut p = persistor();
        let t1 = p.close_current_tlog(1);
        p.take_snapshot("s1".to_string(), None, Vec::new(), false, 1)
            .unwrap();
        let t2 = p.close_current_tlog(2);
        p.take_snapshot("s2".to_string(), None, Vec::new(), false, 2)
            .unwrap();

        p.delete_snapshot(0).unwrap();
        assert_eq!(p.find_snapshot("s2"), Some(0));
        let tlogs: Vec<TLogId> = p.snapshot(0).unwrap().tlogs.iter().map(|t| t.id).collect();
        assert_eq!(tlogs, vec![t1, t2]);
    }

    #[test]
    fn truncate_returns_orphans() {
        let mut p = persistor();
        let t1 = p.close_current_tlog(1);
        p.take_snapshot("s1".to_string(), None, Vec::new(), false, 1)
            .unwrap();
        let t2 = p.close_current_tlog(2);
        p.take_snapshot("s2".to_string(), None, Vec::new(), false, 2)
            .unwrap();
        let t3 = p.current_tlog();

        let orphans = p.truncate_to_snapshot(0).unwrap();
        let ids: Vec<TLogId> = orphans.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![t2, t3]);
        assert!(p.find_snapshot("s2").is_none());
        assert!(p.tlog_referenced(t1));
        assert!(!p.tlog_referenced(t2));
    }

    #[test]
    fn template_collapse_is_idempotent() {
        let mut p = persistor();
        p.close_current_tlog(1);
        p.take_snapshot("s1".to_string(), None, Vec::new(), false, 1)
            .unwrap();
        p.close_current_tlog(2);
        p.take_snapshot("s2".to_string(), None, Vec::new(), false, 2)
            .unwrap();

        let dropped = p.drop_all_but_last_snapshot();
        assert_eq!(dropped.len(), 1);
        assert_eq!(p.snapshots().len(), 1);
        assert_eq!(p.snapshot(0).unwrap().name, "s2");
        // TLog history folded in; nothing is lost.
        assert_eq!(p.snapshot(0).unwrap().tlogs.len(), 2);

        assert!(p.drop_all_but_last_snapshot().is_empty());
        assert_eq!(p.snapshots().len(), 1);
    }
}
