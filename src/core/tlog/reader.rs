// src/core/tlog/reader.rs

//! Forward reader for TLog files and byte streams.

use super::{TLOG_ENTRY_SIZE, TLogEntry};
use crate::core::errors::PeridotError;
use std::path::Path;
use tokio::fs::File as TokioFile;
use tokio::io::{AsyncReadExt, BufReader};

/// Streams entries out of a TLog file. A truncated tail (partial final
/// record, e.g. after a crash mid-append) ends the stream at the last
/// complete entry.
pub struct TLogReader {
    reader: BufReader<TokioFile>,
}

impl TLogReader {
    pub async fn open(path: &Path) -> Result<Self, PeridotError> {
        let file = TokioFile::open(path).await?;
        Ok(Self {
            reader: BufReader::new(file),
        })
    }

    /// Returns the next entry, or `None` at end of stream.
    pub async fn next_entry(&mut self) -> Result<Option<TLogEntry>, PeridotError> {
        let mut buf = [0u8; TLOG_ENTRY_SIZE];
        let mut filled = 0;
        while filled < TLOG_ENTRY_SIZE {
            let n = self.reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                // Clean EOF between records, or a torn tail. Either way
                // the stream ends here.
                return Ok(None);
            }
            filled += n;
        }
        TLogEntry::decode(&buf).map(Some)
    }

    /// Reads a whole TLog file into memory.
    pub async fn read_all(path: &Path) -> Result<Vec<TLogEntry>, PeridotError> {
        let mut reader = Self::open(path).await?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Decodes entries from an in-memory byte stream, e.g. a TLog object
    /// fetched from the backend. Truncated tails are tolerated the same
    /// way as on disk.
    pub fn decode_stream(bytes: &[u8]) -> Result<Vec<TLogEntry>, PeridotError> {
        let mut entries = Vec::with_capacity(bytes.len() / TLOG_ENTRY_SIZE);
        for chunk in bytes.chunks_exact(TLOG_ENTRY_SIZE) {
            entries.push(TLogEntry::decode(chunk.try_into().unwrap())?);
        }
        Ok(entries)
    }

    /// True if the stream holds any cluster write at all.
    pub fn has_data(entries: &[TLogEntry]) -> bool {
        entries
            .iter()
            .any(|e| matches!(e, TLogEntry::Cluster { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ClusterAddress, ClusterHash, ClusterLocation, ScoName};
    use tokio::io::AsyncWriteExt;

    fn cluster_entry(i: u64) -> TLogEntry {
        TLogEntry::Cluster {
            addr: ClusterAddress(i),
            loc: ClusterLocation::new(ScoName::new(1, 0), i as u16),
            hash: ClusterHash(i as u128),
        }
    }

    #[tokio::test]
    async fn truncated_tail_ends_at_last_complete_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tlog_torn");

        let mut file = tokio::fs::File::create(&path).await.unwrap();
        file.write_all(&cluster_entry(1).encode()).await.unwrap();
        file.write_all(&cluster_entry(2).encode()).await.unwrap();
        // A torn final record: only half of it made it to disk.
        file.write_all(&cluster_entry(3).encode()[..13])
            .await
            .unwrap();
        file.sync_all().await.unwrap();

        let entries = TLogReader::read_all(&path).await.unwrap();
        assert_eq!(entries, vec![cluster_entry(1), cluster_entry(2)]);
    }

    #[test]
    fn decode_stream_tolerates_partial_tail() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&cluster_entry(9).encode());
        bytes.extend_from_slice(&[0xab; 7]);
        let entries = TLogReader::decode_stream(&bytes).unwrap();
        assert_eq!(entries, vec![cluster_entry(9)]);
    }
}
