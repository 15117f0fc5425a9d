// src/core/clustercache/mod.rs

//! Shared in-memory cache of cluster-sized payloads.
//!
//! One cache serves all volumes on the node. A volume opts in with a
//! behaviour (cache on read, cache on write, or not at all) and a mode:
//! content-based entries are keyed by payload hash and deduplicate across
//! volumes; location-based entries are keyed by `(namespace, address)`
//! and must be invalidated on overwrite.

use crate::core::metrics;
use crate::core::types::{ClusterAddress, ClusterHash, Namespace};
use bytes::Bytes;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use strum_macros::{Display, EnumString};

/// When a volume consults or feeds the cache.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterCacheBehaviour {
    #[default]
    CacheOnRead,
    CacheOnWrite,
    NoCache,
}

/// How cache entries are keyed.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterCacheMode {
    #[default]
    ContentBased,
    LocationBased,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    Content(ClusterHash),
    Location(Namespace, ClusterAddress),
}

/// Per-volume cache policy.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClusterCachePolicy {
    pub behaviour: ClusterCacheBehaviour,
    pub mode: ClusterCacheMode,
    /// Cap on this volume's entries, in clusters. `None` means unbounded
    /// (within the global capacity).
    pub limit: Option<usize>,
}

pub struct ClusterCache {
    map: Mutex<LruCache<CacheKey, (Bytes, Namespace)>>,
    per_namespace: DashMap<Namespace, usize>,
    enabled: bool,
}

impl ClusterCache {
    /// `capacity_clusters == 0` disables the cache entirely.
    pub fn new(capacity_clusters: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity_clusters)
            .unwrap_or_else(|| NonZeroUsize::new(1).unwrap());
        Self {
            map: Mutex::new(LruCache::new(capacity)),
            per_namespace: DashMap::new(),
            enabled: capacity_clusters > 0,
        }
    }

    fn key(
        policy: &ClusterCachePolicy,
        ns: &Namespace,
        addr: ClusterAddress,
        hash: ClusterHash,
    ) -> CacheKey {
        match policy.mode {
            ClusterCacheMode::ContentBased => CacheKey::Content(hash),
            ClusterCacheMode::LocationBased => CacheKey::Location(ns.clone(), addr),
        }
    }

    pub fn lookup(
        &self,
        policy: &ClusterCachePolicy,
        ns: &Namespace,
        addr: ClusterAddress,
        hash: ClusterHash,
    ) -> Option<Bytes> {
        if !self.enabled || policy.behaviour == ClusterCacheBehaviour::NoCache {
            return None;
        }
        let key = Self::key(policy, ns, addr, hash);
        let hit = self.map.lock().get(&key).map(|(bytes, _)| bytes.clone());
        let outcome = if hit.is_some() { "hit" } else { "miss" };
        metrics::CLUSTER_CACHE_LOOKUPS_TOTAL
            .with_label_values(&[outcome])
            .inc();
        hit
    }

    /// Inserts a payload if the volume's policy and limit allow. In
    /// content-based mode an existing entry under the same hash is a
    /// dedupe hit and left untouched.
    pub fn insert(
        &self,
        policy: &ClusterCachePolicy,
        ns: &Namespace,
        addr: ClusterAddress,
        hash: ClusterHash,
        payload: Bytes,
    ) {
        if !self.enabled || policy.behaviour == ClusterCacheBehaviour::NoCache {
            return;
        }
        if let Some(limit) = policy.limit {
            let count = self.per_namespace.get(ns).map(|e| *e.value()).unwrap_or(0);
            if count >= limit {
                return;
            }
        }
        let key = Self::key(policy, ns, addr, hash);
        let mut map = self.map.lock();
        if map.contains(&key) {
            return;
        }
        if let Some((_, (_, evicted_ns))) = map.push(key, (payload, ns.clone())) {
            if let Some(mut count) = self.per_namespace.get_mut(&evicted_ns) {
                *count = count.saturating_sub(1);
            }
        }
        *self.per_namespace.entry(ns.clone()).or_insert(0) += 1;
    }

    /// Drops the location-keyed entry for an overwritten cluster.
    pub fn invalidate_location(&self, ns: &Namespace, addr: ClusterAddress) {
        if !self.enabled {
            return;
        }
        let key = CacheKey::Location(ns.clone(), addr);
        if self.map.lock().pop(&key).is_some() {
            if let Some(mut count) = self.per_namespace.get_mut(ns) {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// Removes every entry attributed to a namespace.
    pub fn purge_namespace(&self, ns: &Namespace) {
        if !self.enabled {
            return;
        }
        let mut map = self.map.lock();
        let keys: Vec<CacheKey> = map
            .iter()
            .filter(|(_, (_, owner))| owner == ns)
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            map.pop(&key);
        }
        self.per_namespace.remove(ns);
    }

    pub fn entries(&self) -> usize {
        self.map.lock().len()
    }
}
