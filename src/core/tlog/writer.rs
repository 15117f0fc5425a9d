// src/core/tlog/writer.rs

//! Buffered append-only writer for a single TLog file.

use super::{CHECKSUM_ALGO, TLogEntry};
use crate::core::errors::PeridotError;
use crc::Digest;
use std::path::{Path, PathBuf};
use tokio::fs::{File as TokioFile, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};

/// Writes TLog entries to disk. The file is created on open; rollover is
/// the caller's concern (close this writer, open a new one).
pub struct TLogWriter {
    path: PathBuf,
    writer: BufWriter<TokioFile>,
    digest: Digest<'static, u32>,
    entries: u64,
}

impl TLogWriter {
    /// Creates the TLog file. Fails if it already exists; a TLog identity
    /// is never reused.
    pub async fn create(path: &Path) -> Result<Self, PeridotError> {
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(path)
            .await?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            digest: CHECKSUM_ALGO.digest(),
            entries: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of entries appended so far.
    pub fn entries(&self) -> u64 {
        self.entries
    }

    pub async fn add(&mut self, entry: TLogEntry) -> Result<(), PeridotError> {
        let buf = entry.encode();
        self.writer.write_all(&buf).await?;
        self.digest.update(&buf);
        self.entries += 1;
        Ok(())
    }

    /// Flushes buffered entries and fsyncs the file.
    pub async fn sync(&mut self) -> Result<(), PeridotError> {
        self.writer.flush().await?;
        self.writer.get_ref().sync_all().await?;
        Ok(())
    }

    /// Seals the TLog: flush, fsync, and return the CRC-32 of the whole
    /// file together with the entry count.
    pub async fn close(mut self) -> Result<(u32, u64), PeridotError> {
        self.sync().await?;
        Ok((self.digest.finalize(), self.entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tlog::TLogReader;
    use crate::core::types::{ClusterAddress, ClusterHash, ClusterLocation, ScoName};

    #[tokio::test]
    async fn write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tlog_test");

        let mut writer = TLogWriter::create(&path).await.unwrap();
        for i in 0..10u64 {
            writer
                .add(TLogEntry::Cluster {
                    addr: ClusterAddress(i),
                    loc: ClusterLocation::new(ScoName::new(1, 0), i as u16),
                    hash: ClusterHash(i as u128),
                })
                .await
                .unwrap();
        }
        writer.add(TLogEntry::ScoCrc(0x1234)).await.unwrap();
        let (crc, entries) = writer.close().await.unwrap();
        assert_eq!(entries, 11);
        assert_ne!(crc, 0);

        let entries = TLogReader::read_all(&path).await.unwrap();
        assert_eq!(entries.len(), 11);
        assert_eq!(entries[10], TLogEntry::ScoCrc(0x1234));
    }

    #[tokio::test]
    async fn refuses_to_reuse_a_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tlog_dup");
        let writer = TLogWriter::create(&path).await.unwrap();
        drop(writer);
        assert!(TLogWriter::create(&path).await.is_err());
    }
}
