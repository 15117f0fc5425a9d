// src/core/tlog/mod.rs

//! The transaction log: an append-only journal of cluster writes.
//!
//! Each TLog describes the logical writes whose payloads land in a bounded
//! set of SCOs; it is the unit of recovery. Entries are fixed 32-byte
//! records:
//!
//! ```text
//! [cluster address u64 LE][cluster location 8B][content hash 16B]
//! ```
//!
//! The entry kind is carried by sentinel cluster addresses: `u64::MAX`
//! marks a SCO CRC record (the CRC-32 of the SCO sealed just before it,
//! stored in the location field), and `u64::MAX - 1` marks a sync
//! checkpoint. Real cluster addresses can never collide with the
//! sentinels: a volume's address space is bounded by its size.
//!
//! A well-formed TLog ends with a trailing SCO CRC record covering the
//! last SCO it references. Readers treat a truncated tail as if the
//! stream ended at the last complete entry.

mod reader;
mod writer;

pub use reader::TLogReader;
pub use writer::TLogWriter;

use crate::core::errors::PeridotError;
use crate::core::types::{ClusterAddress, ClusterHash, ClusterLocation};
use crc::{CRC_32_ISO_HDLC, Crc};

/// Size of one serialized TLog entry.
pub const TLOG_ENTRY_SIZE: usize = 32;

/// Sentinel cluster address marking a SCO CRC entry.
const CA_SCO_CRC: u64 = u64::MAX;
/// Sentinel cluster address marking a sync checkpoint entry.
const CA_SYNC: u64 = u64::MAX - 1;

/// CRC-32 used for SCO payloads and TLog files.
pub static CHECKSUM_ALGO: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// One record in a TLog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TLogEntry {
    /// A logical cluster write.
    Cluster {
        addr: ClusterAddress,
        loc: ClusterLocation,
        hash: ClusterHash,
    },
    /// CRC-32 of the SCO sealed immediately before this record.
    ScoCrc(u32),
    /// A sync checkpoint marker.
    Sync,
}

impl TLogEntry {
    pub fn encode(&self) -> [u8; TLOG_ENTRY_SIZE] {
        let mut buf = [0u8; TLOG_ENTRY_SIZE];
        match self {
            TLogEntry::Cluster { addr, loc, hash } => {
                buf[0..8].copy_from_slice(&addr.0.to_le_bytes());
                buf[8..16].copy_from_slice(&loc.to_bytes());
                buf[16..32].copy_from_slice(&hash.to_bytes());
            }
            TLogEntry::ScoCrc(crc) => {
                buf[0..8].copy_from_slice(&CA_SCO_CRC.to_le_bytes());
                buf[8..12].copy_from_slice(&crc.to_le_bytes());
            }
            TLogEntry::Sync => {
                buf[0..8].copy_from_slice(&CA_SYNC.to_le_bytes());
            }
        }
        buf
    }

    pub fn decode(buf: &[u8; TLOG_ENTRY_SIZE]) -> Result<Self, PeridotError> {
        let addr = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        match addr {
            CA_SCO_CRC => Ok(TLogEntry::ScoCrc(u32::from_le_bytes(
                buf[8..12].try_into().unwrap(),
            ))),
            CA_SYNC => Ok(TLogEntry::Sync),
            _ => {
                let loc = ClusterLocation::from_bytes(buf[8..16].try_into().unwrap());
                if loc.is_null() {
                    return Err(PeridotError::Protocol(format!(
                        "null cluster location for address {addr} in TLog entry"
                    )));
                }
                Ok(TLogEntry::Cluster {
                    addr: ClusterAddress(addr),
                    loc,
                    hash: ClusterHash::from_bytes(buf[16..32].try_into().unwrap()),
                })
            }
        }
    }
}
