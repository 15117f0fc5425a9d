// src/core/metadata/mod.rs

//! The per-volume metadata store: `ClusterAddress -> (location, hash)`.
//!
//! Mutations are grouped into *corked* write epochs delimited by
//! `cork`/`uncork_up_to`. A cork corresponds 1-1 with a TLog boundary:
//! entries stay in their epoch until the matching TLog is safe on the
//! backend, at which point the epoch is retired into the paged tier.
//! Lookups consult outstanding epochs newest-first, so readers always
//! see the latest write.

mod mds;
mod paged;

pub use mds::{MdsClient, MdsServer, MirroredMetaDataStore};
pub use paged::PagedMetaDataStore;

use crate::core::errors::PeridotError;
use crate::core::types::{ClusterAddress, ClusterHash, ClusterLocation, CorkId, ScrubId};
use async_trait::async_trait;

/// One metadata value.
pub type MetaDataEntry = (ClusterLocation, ClusterHash);

/// A batch mutation record.
pub type MetaDataBatch = Vec<(ClusterAddress, ClusterLocation, ClusterHash)>;

/// A scrub rewrite: `(address, old location, new location)`. The old
/// location fences against concurrent history.
pub type Relocation = (ClusterAddress, ClusterLocation, ClusterLocation);

/// Counters exposed through volume info.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MetaDataStoreStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub page_evictions: u64,
    pub corked_entries: u64,
    pub used_clusters: u64,
}

#[async_trait]
pub trait MetaDataStore: Send + Sync {
    async fn get(&self, addr: ClusterAddress) -> Result<Option<MetaDataEntry>, PeridotError>;

    async fn multi_get(
        &self,
        addrs: &[ClusterAddress],
    ) -> Result<Vec<Option<MetaDataEntry>>, PeridotError>;

    /// Applies a batch of mutations to the current write epoch.
    async fn multi_set(&self, batch: &MetaDataBatch) -> Result<(), PeridotError>;

    /// Opens a new write epoch.
    async fn cork(&self, cork: CorkId) -> Result<(), PeridotError>;

    /// Declares all epochs up to and including `cork` durable on the
    /// backend; their entries retire into the paged tier.
    async fn uncork_up_to(&self, cork: CorkId) -> Result<(), PeridotError>;

    /// Atomically rewrites locations produced by a scrub run.
    /// `expected_scrub_id` must match the store's current id; the id is
    /// bumped on success, fencing any stale duplicate result.
    async fn apply_relocations(
        &self,
        expected_scrub_id: ScrubId,
        relocations: &[Relocation],
    ) -> Result<ScrubId, PeridotError>;

    async fn clear(&self) -> Result<(), PeridotError>;

    /// Brings lagging replicas up to date. Returns the number of records
    /// that were (or with `dry_run` would be) replayed.
    async fn catch_up(&self, dry_run: bool) -> Result<u64, PeridotError>;

    fn scrub_id(&self) -> ScrubId;

    fn set_scrub_id(&self, id: ScrubId);

    fn stats(&self) -> MetaDataStoreStats;
}
