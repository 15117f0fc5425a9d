// src/core/scrub/mod.rs

//! The interface to the external scrubber.
//!
//! The engine produces one opaque work item per candidate snapshot; the
//! scrubber compacts the snapshot's TLogs and SCOs offline, uploads the
//! replacements, and hands back a result blob. Applying a result is
//! fenced by the `ScrubId` the work item was issued under: the id bumps
//! on every apply, so a duplicate or stale result is rejected instead of
//! rewriting history twice.

use crate::core::errors::PeridotError;
use crate::core::metadata::Relocation;
use crate::core::snapshots::TLogMeta;
use crate::core::types::{Namespace, ScoName, ScrubId, SnapshotName, TLogId, VolumeId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One unit of scrub work: a snapshot and the TLogs describing it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScrubWork {
    pub volume_id: VolumeId,
    pub namespace: Namespace,
    pub snapshot: SnapshotName,
    pub snapshot_uuid: Uuid,
    /// Fencing token the eventual result must carry.
    pub scrub_id: ScrubId,
    pub tlogs: Vec<TLogId>,
}

impl ScrubWork {
    pub fn to_blob(&self) -> Result<Bytes, PeridotError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_blob(blob: &[u8]) -> Result<Self, PeridotError> {
        Ok(serde_json::from_slice(blob)?)
    }
}

/// What the scrubber hands back after compacting one snapshot.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScrubResult {
    pub snapshot: SnapshotName,
    /// Must equal the volume's current scrub id to be applied.
    pub scrub_id: ScrubId,
    /// Metadata rewrites `(address, old location, new location)`.
    pub relocations: Vec<Relocation>,
    /// TLogs replacing the snapshot's originals; the scrubber has
    /// already uploaded them.
    pub replacement_tlogs: Vec<TLogMeta>,
    /// TLogs made obsolete by the replacements.
    pub obsolete_tlogs: Vec<TLogId>,
    /// SCOs no cluster references anymore.
    pub obsolete_scos: Vec<ScoName>,
}

impl ScrubResult {
    pub fn to_blob(&self) -> Result<Bytes, PeridotError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_blob(blob: &[u8]) -> Result<Self, PeridotError> {
        Ok(serde_json::from_slice(blob)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_blob_roundtrip() {
        let work = ScrubWork {
            volume_id: "vol".to_string(),
            namespace: Namespace::new("ns"),
            snapshot: "s1".to_string(),
            snapshot_uuid: Uuid::new_v4(),
            scrub_id: 3,
            tlogs: vec![TLogId::new()],
        };
        let blob = work.to_blob().unwrap();
        assert_eq!(ScrubWork::from_blob(&blob).unwrap(), work);
    }
}
