// src/core/datastore/mod.rs

//! The per-volume SCO write stream and cluster read path.
//!
//! Writes append cluster payloads to the current SCO file in the SCO
//! cache; when the SCO holds `sco_multiplier` clusters it is sealed and
//! handed back to the volume for upload. Reads resolve a
//! `ClusterLocation` against the clone namespace chain: clone id N in a
//! location means "the namespace N levels up", where the payload was
//! written by that ancestor under clone id 0. A read miss in the SCO
//! cache fetches the whole SCO object from the backend — which doubles
//! as readahead for sequential access — and caches it as disposable.

use crate::core::backend::BackendConnector;
use crate::core::errors::PeridotError;
use crate::core::metrics;
use crate::core::scocache::ScoCache;
use crate::core::tlog::CHECKSUM_ALGO;
use crate::core::types::{ClusterLocation, Namespace, ScoName};
use bytes::Bytes;
use crc::Digest;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::{File as TokioFile, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// A SCO that just reached its cluster budget: ready for upload.
#[derive(Debug)]
pub struct SealedSco {
    pub sco: ScoName,
    pub path: PathBuf,
    pub checksum: u32,
    pub size: u64,
}

struct OpenSco {
    sco: ScoName,
    path: PathBuf,
    file: TokioFile,
    clusters: u32,
    digest: Digest<'static, u32>,
}

pub struct DataStore {
    ns: Namespace,
    /// Clone namespace chain: `nspath[0]` is the volume's own namespace,
    /// `nspath[N]` the N-th ancestor.
    nspath: Vec<Namespace>,
    cluster_size: usize,
    sco_multiplier: u32,
    sco_cache: Arc<ScoCache>,
    backend: Arc<dyn BackendConnector>,
    current: Option<OpenSco>,
    next_sco_number: u32,
}

impl DataStore {
    pub fn new(
        nspath: Vec<Namespace>,
        cluster_size: usize,
        sco_multiplier: u32,
        sco_cache: Arc<ScoCache>,
        backend: Arc<dyn BackendConnector>,
        next_sco_number: u32,
    ) -> Self {
        debug_assert!(!nspath.is_empty());
        Self {
            ns: nspath[0].clone(),
            nspath,
            cluster_size,
            sco_multiplier,
            sco_cache,
            backend,
            current: None,
            next_sco_number: next_sco_number.max(1),
        }
    }

    fn sco_size(&self) -> u64 {
        self.sco_multiplier as u64 * self.cluster_size as u64
    }

    /// The SCO the next cluster write will land in.
    pub fn current_sco(&self) -> Option<ScoName> {
        self.current.as_ref().map(|open| open.sco)
    }

    async fn open_new_sco(&mut self) -> Result<(), PeridotError> {
        let sco = ScoName::new(self.next_sco_number, 0);
        self.next_sco_number += 1;
        let new = self.sco_cache.create_sco(&self.ns, sco, self.sco_size())?;
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&new.path)
            .await?;
        debug!("opened SCO {} at {:?}", sco, new.path);
        self.current = Some(OpenSco {
            sco,
            path: new.path,
            file,
            clusters: 0,
            digest: CHECKSUM_ALGO.digest(),
        });
        Ok(())
    }

    /// Appends one cluster payload. Returns its location and, when this
    /// write filled the SCO, the sealed SCO ready for upload.
    pub async fn write_cluster(
        &mut self,
        buf: &[u8],
    ) -> Result<(ClusterLocation, Option<SealedSco>), PeridotError> {
        debug_assert_eq!(buf.len(), self.cluster_size);
        if self.current.is_none() {
            self.open_new_sco().await?;
        }
        let open = self.current.as_mut().expect("SCO opened above");
        open.file.write_all(buf).await?;
        open.digest.update(buf);
        let loc = ClusterLocation::new(open.sco, open.clusters as u16);
        open.clusters += 1;

        let sealed = if open.clusters >= self.sco_multiplier {
            self.seal_current().await?
        } else {
            None
        };
        Ok((loc, sealed))
    }

    /// Seals the current SCO regardless of fill level. Used at snapshot
    /// boundaries and on sync. No-op when nothing was written.
    pub async fn seal_current(&mut self) -> Result<Option<SealedSco>, PeridotError> {
        let Some(mut open) = self.current.take() else {
            return Ok(None);
        };
        if open.clusters == 0 {
            // Nothing in it; put it back.
            self.current = Some(open);
            return Ok(None);
        }
        open.file.flush().await?;
        open.file.sync_all().await?;
        let size = open.clusters as u64 * self.cluster_size as u64;
        self.sco_cache.sco_sealed(&self.ns, open.sco, size);
        let checksum = open.digest.finalize();
        debug!("sealed SCO {} ({} clusters)", open.sco, open.clusters);
        Ok(Some(SealedSco {
            sco: open.sco,
            path: open.path,
            checksum,
            size,
        }))
    }

    /// Fsyncs the current SCO file, if any.
    pub async fn sync(&mut self) -> Result<(), PeridotError> {
        if let Some(open) = self.current.as_mut() {
            open.file.flush().await?;
            open.file.sync_all().await?;
        }
        Ok(())
    }

    /// Reads one cluster payload at `loc`.
    pub async fn read_cluster(&self, loc: ClusterLocation) -> Result<Bytes, PeridotError> {
        let ns = self
            .nspath
            .get(loc.sco.clone_id as usize)
            .ok_or_else(|| {
                PeridotError::Internal(format!(
                    "cluster location {loc} points past the clone chain"
                ))
            })?;
        // The object was written by that ancestor itself, hence clone id 0.
        let sco = ScoName::new(loc.sco.number, 0);
        let offset = loc.offset as u64 * self.cluster_size as u64;

        if let Some(fd) = self.sco_cache.open_sco(ns, sco) {
            let mut buf = vec![0u8; self.cluster_size];
            fd.read_exact_at(&mut buf, offset)?;
            return Ok(Bytes::from(buf));
        }
        metrics::SCO_CACHE_LOOKUPS_TOTAL
            .with_label_values(&["miss"])
            .inc();

        // Fetch the whole SCO: the miss pays for readahead of every other
        // cluster in it.
        let bytes = self.backend.get(ns, &sco.object_name()).await?;
        if (offset + self.cluster_size as u64) > bytes.len() as u64 {
            return Err(PeridotError::Internal(format!(
                "SCO {ns}/{sco} shorter than location {loc} requires"
            )));
        }
        if let Err(e) = self.sco_cache.insert_backend_fetched(ns, sco, &bytes) {
            // The payload is already in hand; a full cache only costs the
            // next reader another fetch.
            debug!("could not cache fetched SCO {}/{}: {}", ns, sco, e);
        }
        Ok(bytes.slice(offset as usize..offset as usize + self.cluster_size))
    }

    /// Forgets the current open SCO and removes it from the cache.
    /// Used by restore, which invalidates everything after a snapshot.
    pub async fn discard_current(&mut self) -> Result<(), PeridotError> {
        if let Some(open) = self.current.take() {
            drop(open.file);
            self.sco_cache.remove_sco(&self.ns, open.sco);
        }
        Ok(())
    }

    /// Lowest SCO number the next write may use; restore rolls this
    /// forward past everything the retained TLogs reference.
    pub fn bump_sco_number(&mut self, min_next: u32) {
        self.next_sco_number = self.next_sco_number.max(min_next);
    }

    /// Takes effect on the next SCO; the open one keeps its budget.
    pub fn set_sco_multiplier(&mut self, multiplier: u32) {
        self.sco_multiplier = multiplier;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MountPointConfig, ScoCacheConfig};
    use crate::core::backend::LocalBackend;

    const CLUSTER_SIZE: usize = 4096;

    async fn setup(sco_multiplier: u32) -> (tempfile::TempDir, DataStore, Arc<ScoCache>) {
        let dir = tempfile::tempdir().unwrap();
        let cache = ScoCache::new(ScoCacheConfig {
            mount_points: vec![MountPointConfig {
                path: dir.path().join("cache"),
                capacity: 1 << 30,
            }],
            ..Default::default()
        })
        .unwrap();
        let ns = Namespace::new("vol");
        cache.register_namespace(&ns, 1 << 30);
        let backend = Arc::new(LocalBackend::new(dir.path().join("backend")));
        backend.create_namespace(&ns).await.unwrap();
        let ds = DataStore::new(
            vec![ns],
            CLUSTER_SIZE,
            sco_multiplier,
            cache.clone(),
            backend,
            1,
        );
        (dir, ds, cache)
    }

    #[tokio::test]
    async fn seals_after_sco_multiplier_clusters() {
        let (_dir, mut ds, _cache) = setup(2).await;
        let buf = vec![0xaa; CLUSTER_SIZE];

        let (loc, sealed) = ds.write_cluster(&buf).await.unwrap();
        assert_eq!(loc, ClusterLocation::new(ScoName::new(1, 0), 0));
        assert!(sealed.is_none());

        let (loc, sealed) = ds.write_cluster(&buf).await.unwrap();
        assert_eq!(loc, ClusterLocation::new(ScoName::new(1, 0), 1));
        let sealed = sealed.unwrap();
        assert_eq!(sealed.sco, ScoName::new(1, 0));
        assert_eq!(sealed.size, 2 * CLUSTER_SIZE as u64);

        // Next write opens SCO 2.
        let (loc, _) = ds.write_cluster(&buf).await.unwrap();
        assert_eq!(loc, ClusterLocation::new(ScoName::new(2, 0), 0));
    }

    #[tokio::test]
    async fn reads_come_back_from_the_cache() {
        let (_dir, mut ds, _cache) = setup(4).await;
        let a = vec![0x11; CLUSTER_SIZE];
        let b = vec![0x22; CLUSTER_SIZE];
        let (loc_a, _) = ds.write_cluster(&a).await.unwrap();
        let (loc_b, _) = ds.write_cluster(&b).await.unwrap();

        assert_eq!(ds.read_cluster(loc_a).await.unwrap(), &a[..]);
        assert_eq!(ds.read_cluster(loc_b).await.unwrap(), &b[..]);
    }

    #[tokio::test]
    async fn cache_miss_fetches_whole_sco_from_backend() {
        let (_dir, mut ds, cache) = setup(2).await;
        let a = vec![0x31; CLUSTER_SIZE];
        let b = vec![0x32; CLUSTER_SIZE];
        let (loc_a, _) = ds.write_cluster(&a).await.unwrap();
        let (loc_b, sealed) = ds.write_cluster(&b).await.unwrap();
        let sealed = sealed.unwrap();

        // Simulate the pipeline: upload, then evict from the cache.
        let payload = std::fs::read(&sealed.path).unwrap();
        ds.backend
            .put(
                &Namespace::new("vol"),
                &sealed.sco.object_name(),
                Bytes::from(payload),
                false,
                Some(sealed.checksum),
            )
            .await
            .unwrap();
        cache.remove_sco(&Namespace::new("vol"), sealed.sco);

        assert_eq!(ds.read_cluster(loc_a).await.unwrap(), &a[..]);
        // The fetch repopulated the cache; this read hits it.
        assert_eq!(ds.read_cluster(loc_b).await.unwrap(), &b[..]);
    }
}
