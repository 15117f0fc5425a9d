// src/core/types.rs

//! Core identifiers and units of the volume engine.
//!
//! Everything the engine addresses is expressed in these units: logical
//! blocks (LBAs) group into clusters, clusters group into SCOs (Storage
//! Container Objects), and a `ClusterLocation` pins a cluster's payload to
//! an offset inside a SCO. TLogs, corks and snapshots are identified by
//! UUIDs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use uuid::Uuid;

/// Logical block size exposed to clients, in bytes.
pub type LbaSize = u32;
/// Number of LBAs per cluster.
pub type ClusterMultiplier = u32;
/// Number of clusters per SCO.
pub type ScoMultiplier = u32;
/// Number of SCOs covered by one TLog.
pub type TLogMultiplier = u32;

pub type VolumeId = String;
pub type SnapshotName = String;
/// Index of a snapshot in the persistor's ordered snapshot list.
pub type SnapshotNum = usize;

/// Monotonically increasing fencing token for scrub results.
pub type ScrubId = u64;

/// A backend container owned exclusively by one volume.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct Namespace(pub String);

impl Namespace {
    pub fn new(s: impl Into<String>) -> Self {
        Namespace(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cluster offset into the volume's logical address space.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Default,
    bincode::Encode,
    bincode::Decode,
)]
pub struct ClusterAddress(pub u64);

impl fmt::Display for ClusterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Distinguishes self-written SCOs (0) from SCOs inherited up the clone
/// chain (1, 2, ...). A read that resolves to clone id N fetches from the
/// N-th ancestor's namespace.
pub type CloneId = u8;

/// Identity of a Storage Container Object inside a namespace.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub struct ScoName {
    pub number: u32,
    pub clone_id: CloneId,
}

impl ScoName {
    pub fn new(number: u32, clone_id: CloneId) -> Self {
        Self { number, clone_id }
    }

    /// The backend object name: `<sco-number-hex>_<clone-id-hex>`.
    pub fn object_name(&self) -> String {
        format!("{:08x}_{:02x}", self.number, self.clone_id)
    }

    /// Parses a backend object name produced by [`ScoName::object_name`].
    pub fn parse_object_name(name: &str) -> Option<Self> {
        let (num, clone) = name.split_once('_')?;
        if num.len() != 8 || clone.len() != 2 {
            return None;
        }
        Some(Self {
            number: u32::from_str_radix(num, 16).ok()?,
            clone_id: u8::from_str_radix(clone, 16).ok()?,
        })
    }
}

impl fmt::Display for ScoName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.object_name())
    }
}

/// Physical address of a cluster payload: which SCO, and where inside it.
///
/// Packs to exactly 8 bytes on disk and in TLog entries:
/// `[sco-number u32 LE][clone-id u8][reserved u8][offset u16 LE]`.
/// The all-zero value means "unwritten"; reads of unwritten clusters
/// return zeros.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Default,
    bincode::Encode,
    bincode::Decode,
)]
pub struct ClusterLocation {
    pub sco: ScoName,
    /// Cluster offset inside the SCO.
    pub offset: u16,
}

impl Default for ScoName {
    fn default() -> Self {
        Self {
            number: 0,
            clone_id: 0,
        }
    }
}

impl ClusterLocation {
    pub fn new(sco: ScoName, offset: u16) -> Self {
        Self { sco, offset }
    }

    /// The null location: no payload written for this cluster address.
    pub fn null() -> Self {
        Self::default()
    }

    pub fn is_null(&self) -> bool {
        self.sco.number == 0 && self.sco.clone_id == 0 && self.offset == 0
    }

    pub fn to_bytes(self) -> [u8; 8] {
        let mut b = [0u8; 8];
        b[0..4].copy_from_slice(&self.sco.number.to_le_bytes());
        b[4] = self.sco.clone_id;
        b[5] = 0;
        b[6..8].copy_from_slice(&self.offset.to_le_bytes());
        b
    }

    pub fn from_bytes(b: &[u8; 8]) -> Self {
        Self {
            sco: ScoName {
                number: u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
                clone_id: b[4],
            },
            offset: u16::from_le_bytes([b[6], b[7]]),
        }
    }
}

impl fmt::Display for ClusterLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:04x}", self.sco, self.offset)
    }
}

/// 128-bit content hash of a cluster payload (murmur3 x64_128).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Default,
    bincode::Encode,
    bincode::Decode,
)]
pub struct ClusterHash(pub u128);

impl ClusterHash {
    /// Hashes a cluster payload. Infallible for in-memory buffers.
    pub fn of(buf: &[u8]) -> Self {
        let h = murmur3::murmur3_x64_128(&mut Cursor::new(buf), 0)
            .expect("in-memory hashing cannot fail");
        ClusterHash(h)
    }

    pub fn to_bytes(self) -> [u8; 16] {
        self.0.to_le_bytes()
    }

    pub fn from_bytes(b: &[u8; 16]) -> Self {
        ClusterHash(u128::from_le_bytes(*b))
    }
}

/// Identity of a transaction log.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TLogId(pub Uuid);

impl TLogId {
    pub fn new() -> Self {
        TLogId(Uuid::new_v4())
    }

    /// The backend object name: `tlog_<uuid>`.
    pub fn object_name(&self) -> String {
        format!("tlog_{}", self.0)
    }

    pub fn parse_object_name(name: &str) -> Option<Self> {
        let uuid = name.strip_prefix("tlog_")?;
        Some(TLogId(Uuid::parse_str(uuid).ok()?))
    }
}

impl Default for TLogId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TLogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.object_name())
    }
}

/// A write-epoch marker for the metadata store. Corks correspond 1-1 with
/// TLog boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorkId(pub Uuid);

impl CorkId {
    pub fn new() -> Self {
        CorkId(Uuid::new_v4())
    }
}

impl Default for CorkId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<TLogId> for CorkId {
    fn from(id: TLogId) -> Self {
        CorkId(id.0)
    }
}

impl fmt::Display for CorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fixed name of the manifest object inside a namespace. The only object
/// the engine ever overwrites in place.
pub const SNAPSHOTS_OBJECT_NAME: &str = "snapshots";

/// Fixed name of the ownership lock object inside a namespace.
pub const OWNER_LOCK_OBJECT_NAME: &str = "owner_lock";

/// Object name for a scrub work/result artifact.
pub fn scrub_object_name(id: &Uuid) -> String {
    format!("scrub_{id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_location_roundtrip() {
        let loc = ClusterLocation::new(ScoName::new(0x2a, 3), 0x0105);
        let bytes = loc.to_bytes();
        assert_eq!(ClusterLocation::from_bytes(&bytes), loc);
        assert!(!loc.is_null());
        assert!(ClusterLocation::null().is_null());
    }

    #[test]
    fn sco_object_name_roundtrip() {
        let sco = ScoName::new(0xdeadbeef, 0x01);
        assert_eq!(sco.object_name(), "deadbeef_01");
        assert_eq!(ScoName::parse_object_name("deadbeef_01"), Some(sco));
        assert_eq!(ScoName::parse_object_name("nonsense"), None);
    }

    #[test]
    fn tlog_object_name_roundtrip() {
        let id = TLogId::new();
        let name = id.object_name();
        assert!(name.starts_with("tlog_"));
        assert_eq!(TLogId::parse_object_name(&name), Some(id));
    }

    #[test]
    fn hash_is_stable() {
        let a = ClusterHash::of(b"some cluster payload");
        let b = ClusterHash::of(b"some cluster payload");
        let c = ClusterHash::of(b"another cluster payload");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
