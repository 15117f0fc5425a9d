// src/core/snapshots/mod.rs

//! The snapshot tree and its persisted form, the `snapshots` manifest.
//!
//! A snapshot is an ordered, named list of TLogs; the volume always has
//! one open (unnamed) tail of TLogs, the *current* list. The manifest on
//! the backend is the source of truth for recovery: it is the only
//! object ever overwritten in place, carries an explicit format version,
//! and is always uploaded behind a barrier so it never references a TLog
//! that is not itself on the backend.

mod manager;
mod persistor;

pub use manager::{RestoreOutcome, SnapshotManager};
pub use persistor::SnapshotPersistor;

use crate::core::types::{Namespace, ScrubId, SnapshotName, TLogId, VolumeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Manifest schema version written into every document.
pub const SNAPSHOTS_FORMAT_VERSION: u32 = 1;

/// Serde helper: snapshot metadata bytes as a hex string.
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

/// One TLog as tracked by the persistor.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TLogMeta {
    pub id: TLogId,
    pub written_to_backend: bool,
    /// Entry count; 0 while the TLog is still open.
    pub entries: u64,
}

impl TLogMeta {
    fn open(id: TLogId) -> Self {
        Self {
            id,
            written_to_backend: false,
            entries: 0,
        }
    }
}

/// A named, sealed point in the volume's history.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub name: SnapshotName,
    pub uuid: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(with = "hex_bytes", default)]
    pub metadata: Vec<u8>,
    pub scrubbed: bool,
    /// Clusters referenced by the volume at snapshot time.
    pub cluster_count: u64,
    pub tlogs: Vec<TLogMeta>,
}

impl Snapshot {
    /// A snapshot is in the backend when every one of its TLogs is.
    pub fn in_backend(&self) -> bool {
        self.tlogs.iter().all(|t| t.written_to_backend)
    }
}

/// Reference to the parent a clone was created from.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ParentRef {
    pub namespace: Namespace,
    pub snapshot: SnapshotName,
}

/// The manifest document as serialized to the backend.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SnapshotsDocument {
    pub format_version: u32,
    pub volume_id: VolumeId,
    pub parent: Option<ParentRef>,
    pub snapshots: Vec<Snapshot>,
    /// The open tail: TLogs since the last snapshot, oldest first. The
    /// last element is the TLog currently being written.
    pub current: Vec<TLogMeta>,
    /// Cork of the currently open TLog.
    pub last_cork: Option<Uuid>,
    /// Fencing token for scrub results.
    pub scrub_id: ScrubId,
}
