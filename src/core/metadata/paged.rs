// src/core/metadata/paged.rs

//! Local paged metadata store with an LRU page cache.
//!
//! Entries live on fixed-size pages (2^page_bits entries each). A
//! bounded LRU of hot pages fronts the full page set; uncorked epochs
//! retire into pages through the cache. After a restart the store is
//! rebuilt by replaying TLogs from the backend, so the paged tier itself
//! does not persist.

use super::{MetaDataBatch, MetaDataEntry, MetaDataStore, MetaDataStoreStats, Relocation};
use crate::core::errors::PeridotError;
use crate::core::types::{ClusterAddress, CorkId, ScrubId};
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

type PageId = u64;
type Page = HashMap<u32, MetaDataEntry>;

struct CorkEpoch {
    id: CorkId,
    entries: HashMap<ClusterAddress, MetaDataEntry>,
}

struct Inner {
    /// Hot pages. Eviction only writes back to `pages`, so it is a cheap
    /// bookkeeping move; the LRU exists to bound what lookups touch.
    cache: LruCache<PageId, Page>,
    /// The full page set, keyed by page id.
    pages: BTreeMap<PageId, Page>,
    /// Outstanding corked epochs, oldest first. The back epoch is the
    /// current write target.
    corks: VecDeque<CorkEpoch>,
    used_clusters: u64,
}

pub struct PagedMetaDataStore {
    inner: Mutex<Inner>,
    page_bits: u8,
    scrub_id: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    page_evictions: AtomicU64,
}

impl PagedMetaDataStore {
    pub fn new(max_pages: usize, page_bits: u8) -> Self {
        Self {
            inner: Mutex::new(Inner {
                cache: LruCache::new(NonZeroUsize::new(max_pages.max(1)).unwrap()),
                pages: BTreeMap::new(),
                corks: VecDeque::new(),
                used_clusters: 0,
            }),
            page_bits,
            scrub_id: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            page_evictions: AtomicU64::new(0),
        }
    }

    fn page_id(&self, addr: ClusterAddress) -> PageId {
        addr.0 >> self.page_bits
    }

    fn slot(&self, addr: ClusterAddress) -> u32 {
        (addr.0 & ((1 << self.page_bits) - 1)) as u32
    }

    /// Looks up `addr` in the paged tier, pulling its page through the
    /// cache.
    fn page_lookup(&self, inner: &mut Inner, addr: ClusterAddress) -> Option<MetaDataEntry> {
        let pid = self.page_id(addr);
        let slot = self.slot(addr);
        if let Some(page) = inner.cache.get(&pid) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return page.get(&slot).copied();
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        let page = inner.pages.get(&pid)?.clone();
        let value = page.get(&slot).copied();
        if let Some((evicted_pid, evicted_page)) = inner.cache.push(pid, page) {
            if evicted_pid != pid {
                self.page_evictions.fetch_add(1, Ordering::Relaxed);
                inner.pages.insert(evicted_pid, evicted_page);
            }
        }
        value
    }

    fn lookup(&self, inner: &mut Inner, addr: ClusterAddress) -> Option<MetaDataEntry> {
        for epoch in inner.corks.iter().rev() {
            if let Some(entry) = epoch.entries.get(&addr) {
                return Some(*entry);
            }
        }
        self.page_lookup(inner, addr)
    }

    /// Writes an entry straight into the paged tier, keeping cache and
    /// backing page in sync.
    fn page_store(&self, inner: &mut Inner, addr: ClusterAddress, entry: MetaDataEntry) {
        let pid = self.page_id(addr);
        let slot = self.slot(addr);
        if let Some(page) = inner.cache.get_mut(&pid) {
            page.insert(slot, entry);
            // Mirror into the backing set so eviction never loses data.
            inner.pages.entry(pid).or_default().insert(slot, entry);
            return;
        }
        inner.pages.entry(pid).or_default().insert(slot, entry);
    }
}

#[async_trait]
impl MetaDataStore for PagedMetaDataStore {
    async fn get(&self, addr: ClusterAddress) -> Result<Option<MetaDataEntry>, PeridotError> {
        let mut inner = self.inner.lock();
        Ok(self.lookup(&mut inner, addr))
    }

    async fn multi_get(
        &self,
        addrs: &[ClusterAddress],
    ) -> Result<Vec<Option<MetaDataEntry>>, PeridotError> {
        let mut inner = self.inner.lock();
        Ok(addrs
            .iter()
            .map(|addr| self.lookup(&mut inner, *addr))
            .collect())
    }

    async fn multi_set(&self, batch: &MetaDataBatch) -> Result<(), PeridotError> {
        let mut inner = self.inner.lock();
        for (addr, loc, hash) in batch {
            let previously_used = self.lookup(&mut inner, *addr).is_some();
            if !previously_used && !loc.is_null() {
                inner.used_clusters += 1;
            } else if previously_used && loc.is_null() {
                inner.used_clusters = inner.used_clusters.saturating_sub(1);
            }
            let entry = (*loc, *hash);
            match inner.corks.back_mut() {
                Some(epoch) => {
                    epoch.entries.insert(*addr, entry);
                }
                // No cork open (e.g. while replaying TLogs into a fresh
                // store): write through to the pages.
                None => self.page_store(&mut inner, *addr, entry),
            }
        }
        Ok(())
    }

    async fn cork(&self, cork: CorkId) -> Result<(), PeridotError> {
        let mut inner = self.inner.lock();
        if inner.corks.iter().any(|epoch| epoch.id == cork) {
            return Err(PeridotError::InvalidState(format!(
                "cork {cork} is already open"
            )));
        }
        inner.corks.push_back(CorkEpoch {
            id: cork,
            entries: HashMap::new(),
        });
        Ok(())
    }

    async fn uncork_up_to(&self, cork: CorkId) -> Result<(), PeridotError> {
        let mut inner = self.inner.lock();
        if !inner.corks.iter().any(|epoch| epoch.id == cork) {
            return Err(PeridotError::InvalidState(format!(
                "cork {cork} is not outstanding"
            )));
        }
        loop {
            let epoch = inner
                .corks
                .pop_front()
                .expect("cork presence checked above");
            let done = epoch.id == cork;
            for (addr, entry) in epoch.entries {
                self.page_store(&mut inner, addr, entry);
            }
            debug!("retired cork epoch {}", epoch.id);
            if done {
                return Ok(());
            }
        }
    }

    async fn apply_relocations(
        &self,
        expected_scrub_id: ScrubId,
        relocations: &[Relocation],
    ) -> Result<ScrubId, PeridotError> {
        let current = self.scrub_id.load(Ordering::SeqCst);
        if current != expected_scrub_id {
            return Err(PeridotError::StaleScrubResult {
                expected: current,
                got: expected_scrub_id,
            });
        }
        let mut inner = self.inner.lock();
        for (addr, old_loc, new_loc) in relocations {
            match self.lookup(&mut inner, *addr) {
                Some((loc, hash)) if loc == *old_loc => {
                    self.page_store(&mut inner, *addr, (*new_loc, hash));
                }
                other => {
                    // Scrubbed history is immutable, so a mismatch means
                    // the relocation raced a restore; skip it.
                    warn!(
                        "relocation for {} expected {}, found {:?}; skipping",
                        addr, old_loc, other
                    );
                }
            }
        }
        let next = current + 1;
        self.scrub_id.store(next, Ordering::SeqCst);
        Ok(next)
    }

    async fn clear(&self) -> Result<(), PeridotError> {
        let mut inner = self.inner.lock();
        inner.cache.clear();
        inner.pages.clear();
        inner.corks.clear();
        inner.used_clusters = 0;
        Ok(())
    }

    async fn catch_up(&self, _dry_run: bool) -> Result<u64, PeridotError> {
        // The local store has no replicas to converge.
        Ok(0)
    }

    fn scrub_id(&self) -> ScrubId {
        self.scrub_id.load(Ordering::SeqCst)
    }

    fn set_scrub_id(&self, id: ScrubId) {
        self.scrub_id.store(id, Ordering::SeqCst);
    }

    fn stats(&self) -> MetaDataStoreStats {
        let inner = self.inner.lock();
        MetaDataStoreStats {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            page_evictions: self.page_evictions.load(Ordering::Relaxed),
            corked_entries: inner.corks.iter().map(|e| e.entries.len() as u64).sum(),
            used_clusters: inner.used_clusters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ClusterHash, ClusterLocation, ScoName};

    fn entry(n: u32) -> (ClusterLocation, ClusterHash) {
        (
            ClusterLocation::new(ScoName::new(n, 0), 0),
            ClusterHash(n as u128),
        )
    }

    fn batch_of(addr: u64, n: u32) -> MetaDataBatch {
        let (loc, hash) = entry(n);
        vec![(ClusterAddress(addr), loc, hash)]
    }

    #[tokio::test]
    async fn corked_writes_are_visible_before_uncork() {
        let store = PagedMetaDataStore::new(8, 4);
        let cork = CorkId::new();
        store.cork(cork).await.unwrap();
        store.multi_set(&batch_of(5, 1)).await.unwrap();

        assert_eq!(store.get(ClusterAddress(5)).await.unwrap(), Some(entry(1)));
        assert_eq!(store.stats().corked_entries, 1);

        store.uncork_up_to(cork).await.unwrap();
        assert_eq!(store.get(ClusterAddress(5)).await.unwrap(), Some(entry(1)));
        assert_eq!(store.stats().corked_entries, 0);
    }

    #[tokio::test]
    async fn uncork_retires_all_older_epochs() {
        let store = PagedMetaDataStore::new(8, 4);
        let c1 = CorkId::new();
        let c2 = CorkId::new();
        let c3 = CorkId::new();
        store.cork(c1).await.unwrap();
        store.multi_set(&batch_of(1, 1)).await.unwrap();
        store.cork(c2).await.unwrap();
        store.multi_set(&batch_of(2, 2)).await.unwrap();
        store.cork(c3).await.unwrap();
        store.multi_set(&batch_of(3, 3)).await.unwrap();

        store.uncork_up_to(c2).await.unwrap();
        // c3 remains corked; c1 and c2 retired.
        assert_eq!(store.stats().corked_entries, 1);
        assert_eq!(store.get(ClusterAddress(1)).await.unwrap(), Some(entry(1)));
        assert_eq!(store.get(ClusterAddress(3)).await.unwrap(), Some(entry(3)));
    }

    #[tokio::test]
    async fn newest_epoch_wins_lookup() {
        let store = PagedMetaDataStore::new(8, 4);
        let c1 = CorkId::new();
        let c2 = CorkId::new();
        store.cork(c1).await.unwrap();
        store.multi_set(&batch_of(7, 1)).await.unwrap();
        store.cork(c2).await.unwrap();
        store.multi_set(&batch_of(7, 2)).await.unwrap();
        assert_eq!(store.get(ClusterAddress(7)).await.unwrap(), Some(entry(2)));
    }

    #[tokio::test]
    async fn relocations_fence_on_scrub_id() {
        let store = PagedMetaDataStore::new(8, 4);
        store.multi_set(&batch_of(9, 1)).await.unwrap();

        let (old_loc, _) = entry(1);
        let (new_loc, _) = entry(100);
        let relocs = vec![(ClusterAddress(9), old_loc, new_loc)];

        // Wrong fencing token.
        assert!(matches!(
            store.apply_relocations(41, &relocs).await,
            Err(PeridotError::StaleScrubResult { .. })
        ));

        let next = store.apply_relocations(0, &relocs).await.unwrap();
        assert_eq!(next, 1);
        let (loc, _) = store.get(ClusterAddress(9)).await.unwrap().unwrap();
        assert_eq!(loc, new_loc);

        // Replaying the same result is now stale.
        assert!(matches!(
            store.apply_relocations(0, &relocs).await,
            Err(PeridotError::StaleScrubResult { .. })
        ));
    }

    #[tokio::test]
    async fn page_cache_evicts_but_never_loses() {
        // 2-page cache, 16 entries per page, 100 pages of data.
        let store = PagedMetaDataStore::new(2, 4);
        for i in 0..1600u64 {
            store.multi_set(&batch_of(i, i as u32 + 1)).await.unwrap();
        }
        for i in (0..1600u64).step_by(97) {
            assert_eq!(
                store.get(ClusterAddress(i)).await.unwrap(),
                Some(entry(i as u32 + 1)),
                "address {i}"
            );
        }
        assert!(store.stats().page_evictions > 0);
        assert_eq!(store.stats().used_clusters, 1600);
    }
}
