// src/core/scocache/mod.rs

//! Disk-backed LRU cache of SCO files, spanning one or more mount points.
//!
//! The cache holds both freshly written SCOs awaiting upload
//! (*non-disposable*) and SCOs that are safe on the backend
//! (*disposable*). Only disposable SCOs may be evicted; the per-namespace
//! non-disposable byte budget caps how far a volume may run ahead of its
//! uploads before writes fail with `InsufficientResources`.
//!
//! Reads go through a small `path -> fd` LRU so steady-state cluster
//! reads do not pay an open/close per call.

mod cleaner;

pub use cleaner::ScoCacheCleanerTask;

use crate::config::ScoCacheConfig;
use crate::core::errors::PeridotError;
use crate::core::metrics;
use crate::core::types::{Namespace, ScoName};
use bytes::Bytes;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::fs::File;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{info, warn};

/// Capacity of the `path -> fd` LRU.
const FD_CACHE_SIZE: usize = 32;

/// One disk location participating in the cache.
pub struct ScoCacheMountPoint {
    pub path: PathBuf,
    pub capacity: u64,
    used: AtomicU64,
    online: AtomicBool,
}

impl ScoCacheMountPoint {
    fn new(path: PathBuf, capacity: u64) -> Self {
        Self {
            path,
            capacity,
            used: AtomicU64::new(0),
            online: AtomicBool::new(true),
        }
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    pub fn free(&self) -> u64 {
        self.capacity.saturating_sub(self.used())
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }
}

/// Byte accounting for one namespace.
#[derive(Debug, Default, Clone, Copy)]
pub struct NamespaceScoInfo {
    pub disposable: u64,
    pub non_disposable: u64,
    pub max_non_disposable: u64,
}

struct CachedSco {
    path: PathBuf,
    mount: Arc<ScoCacheMountPoint>,
    size: u64,
    disposable: bool,
    last_access: AtomicU64,
}

/// A SCO file freshly created in the cache, owned by the datastore until
/// sealed.
#[derive(Debug)]
pub struct NewSco {
    pub sco: ScoName,
    pub path: PathBuf,
}

/// Point-in-time view of the cache, for inspection.
#[derive(Debug)]
pub struct ScoCacheInfo {
    pub mount_points: Vec<(PathBuf, u64, u64, bool)>,
    pub namespaces: Vec<(Namespace, NamespaceScoInfo)>,
    pub cached_scos: usize,
}

pub struct ScoCache {
    cfg: ScoCacheConfig,
    mount_points: RwLock<Vec<Arc<ScoCacheMountPoint>>>,
    namespaces: DashMap<Namespace, NamespaceScoInfo>,
    scos: DashMap<(Namespace, ScoName), CachedSco>,
    fd_cache: Mutex<LruCache<PathBuf, Arc<File>>>,
    access_clock: AtomicU64,
}

impl ScoCache {
    pub fn new(cfg: ScoCacheConfig) -> Result<Arc<Self>, PeridotError> {
        let mut mount_points = Vec::new();
        for mp in &cfg.mount_points {
            std::fs::create_dir_all(&mp.path)?;
            mount_points.push(Arc::new(ScoCacheMountPoint::new(
                mp.path.clone(),
                mp.capacity,
            )));
        }
        Ok(Arc::new(Self {
            cfg,
            mount_points: RwLock::new(mount_points),
            namespaces: DashMap::new(),
            scos: DashMap::new(),
            fd_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(FD_CACHE_SIZE).unwrap(),
            )),
            access_clock: AtomicU64::new(0),
        }))
    }

    pub fn trigger_gap(&self) -> u64 {
        self.cfg.trigger_gap
    }

    pub fn backoff_gap(&self) -> u64 {
        self.cfg.backoff_gap
    }

    pub fn cleanup_interval(&self) -> std::time::Duration {
        self.cfg.cleanup_interval
    }

    fn touch(&self, cached: &CachedSco) {
        let now = self.access_clock.fetch_add(1, Ordering::Relaxed);
        cached.last_access.store(now, Ordering::Relaxed);
    }

    // --- Namespace management ---

    /// Registers a namespace with its non-disposable byte budget. Must be
    /// called before any SCO of that namespace enters the cache.
    pub fn register_namespace(&self, ns: &Namespace, max_non_disposable: u64) {
        self.namespaces.insert(ns.clone(), NamespaceScoInfo {
            max_non_disposable,
            ..Default::default()
        });
    }

    /// Drops every cached SCO of a namespace and its accounting.
    pub fn purge_namespace(&self, ns: &Namespace) {
        let keys: Vec<_> = self
            .scos
            .iter()
            .filter(|e| &e.key().0 == ns)
            .map(|e| e.key().clone())
            .collect();
        for key in keys {
            if let Some((_, cached)) = self.scos.remove(&key) {
                self.drop_file(&cached);
            }
        }
        self.namespaces.remove(ns);
    }

    pub fn namespace_info(&self, ns: &Namespace) -> Option<NamespaceScoInfo> {
        self.namespaces.get(ns).map(|e| *e.value())
    }

    /// Adjusts a namespace's non-disposable budget, e.g. after a resize.
    pub fn set_max_non_disposable(&self, ns: &Namespace, max: u64) {
        if let Some(mut info) = self.namespaces.get_mut(ns) {
            info.max_non_disposable = max;
        }
    }

    // --- Mount point management ---

    pub fn add_mount_point(&self, path: PathBuf, capacity: u64) -> Result<(), PeridotError> {
        std::fs::create_dir_all(&path)?;
        let mut mps = self.mount_points.write();
        if mps.iter().any(|mp| mp.path == path) {
            return Err(PeridotError::FileExists(path.display().to_string()));
        }
        info!("adding SCO cache mount point {:?} ({} bytes)", path, capacity);
        mps.push(Arc::new(ScoCacheMountPoint::new(path, capacity)));
        Ok(())
    }

    /// Takes a mount point out of service. Disposable SCOs on it are
    /// dropped (they remain fetchable from the backend); non-disposable
    /// SCOs pin the mount point and fail the removal.
    pub fn remove_mount_point(&self, path: &Path) -> Result<(), PeridotError> {
        let keys: Vec<_> = self
            .scos
            .iter()
            .filter(|e| e.value().mount.path == path)
            .map(|e| (e.key().clone(), e.value().disposable))
            .collect();
        if keys.iter().any(|(_, disposable)| !disposable) {
            return Err(PeridotError::InvalidOperation(format!(
                "mount point {:?} still holds SCOs not yet on the backend",
                path
            )));
        }
        for (key, _) in keys {
            if let Some((_, cached)) = self.scos.remove(&key) {
                self.account_removed(&key.0, &cached);
                self.evict_fd(&cached.path);
                let _ = std::fs::remove_file(&cached.path);
            }
        }
        let mut mps = self.mount_points.write();
        let before = mps.len();
        mps.retain(|mp| mp.path != path);
        if mps.len() == before {
            return Err(PeridotError::ObjectNotFound(path.display().to_string()));
        }
        Ok(())
    }

    /// Marks a mount point offline: no new SCOs land on it, cached data
    /// stays readable.
    pub fn offline_mount_point(&self, path: &Path) -> Result<(), PeridotError> {
        let mps = self.mount_points.read();
        let mp = mps
            .iter()
            .find(|mp| mp.path == path)
            .ok_or_else(|| PeridotError::ObjectNotFound(path.display().to_string()))?;
        warn!("SCO cache mount point {:?} going offline", path);
        mp.online.store(false, Ordering::Relaxed);
        Ok(())
    }

    pub fn online_mount_point(&self, path: &Path) -> Result<(), PeridotError> {
        let mps = self.mount_points.read();
        let mp = mps
            .iter()
            .find(|mp| mp.path == path)
            .ok_or_else(|| PeridotError::ObjectNotFound(path.display().to_string()))?;
        mp.online.store(true, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn mount_points(&self) -> Vec<Arc<ScoCacheMountPoint>> {
        self.mount_points.read().clone()
    }

    // --- SCO lifecycle ---

    /// Allocates a new SCO file for writing, charging `reserved_size`
    /// against the namespace's non-disposable budget.
    pub fn create_sco(
        &self,
        ns: &Namespace,
        sco: ScoName,
        reserved_size: u64,
    ) -> Result<NewSco, PeridotError> {
        {
            let mut info = self.namespaces.get_mut(ns).ok_or_else(|| {
                PeridotError::Internal(format!("namespace {ns} not registered with SCO cache"))
            })?;
            if info.non_disposable + reserved_size > info.max_non_disposable {
                return Err(PeridotError::InsufficientResources(format!(
                    "namespace {ns} exceeds its non-disposable SCO budget ({} + {} > {})",
                    info.non_disposable, reserved_size, info.max_non_disposable
                )));
            }
            info.non_disposable += reserved_size;
        }

        let mount = self
            .pick_mount_point()
            .ok_or_else(|| {
                // Roll the reservation back; the write fails cleanly.
                if let Some(mut info) = self.namespaces.get_mut(ns) {
                    info.non_disposable -= reserved_size;
                }
                PeridotError::InsufficientResources(
                    "no online SCO cache mount point with free space".to_string(),
                )
            })?;

        let dir = mount.path.join(ns.as_str());
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(sco.object_name());

        mount.used.fetch_add(reserved_size, Ordering::Relaxed);
        metrics::SCO_CACHE_BYTES
            .with_label_values(&[&mount.path.display().to_string()])
            .set(mount.used() as f64);

        let cached = CachedSco {
            path: path.clone(),
            mount,
            size: reserved_size,
            disposable: false,
            last_access: AtomicU64::new(self.access_clock.fetch_add(1, Ordering::Relaxed)),
        };
        self.scos.insert((ns.clone(), sco), cached);
        Ok(NewSco { sco, path })
    }

    /// Adjusts a freshly sealed SCO from its reservation to its actual
    /// size.
    pub fn sco_sealed(&self, ns: &Namespace, sco: ScoName, actual_size: u64) {
        if let Some(mut cached) = self.scos.get_mut(&(ns.clone(), sco)) {
            let reserved = cached.size;
            cached.size = actual_size;
            cached.mount.used.fetch_sub(
                reserved.saturating_sub(actual_size),
                Ordering::Relaxed,
            );
            drop(cached);
            if let Some(mut info) = self.namespaces.get_mut(ns) {
                info.non_disposable =
                    info.non_disposable.saturating_sub(reserved) + actual_size;
            }
        }
    }

    /// Reclassifies an uploaded SCO as disposable: it may now be evicted.
    pub fn set_disposable(&self, ns: &Namespace, sco: ScoName) {
        if let Some(mut cached) = self.scos.get_mut(&(ns.clone(), sco)) {
            if cached.disposable {
                return;
            }
            cached.disposable = true;
            let size = cached.size;
            drop(cached);
            if let Some(mut info) = self.namespaces.get_mut(ns) {
                info.non_disposable = info.non_disposable.saturating_sub(size);
                info.disposable += size;
            }
        }
    }

    /// Stores a SCO fetched back from the backend. It is disposable by
    /// definition.
    pub fn insert_backend_fetched(
        &self,
        ns: &Namespace,
        sco: ScoName,
        bytes: &Bytes,
    ) -> Result<PathBuf, PeridotError> {
        let mount = self.pick_mount_point().ok_or_else(|| {
            PeridotError::InsufficientResources(
                "no online SCO cache mount point with free space".to_string(),
            )
        })?;
        let dir = mount.path.join(ns.as_str());
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(sco.object_name());
        std::fs::write(&path, bytes)?;

        let size = bytes.len() as u64;
        mount.used.fetch_add(size, Ordering::Relaxed);
        if let Some(mut info) = self.namespaces.get_mut(ns) {
            info.disposable += size;
        }
        let cached = CachedSco {
            path: path.clone(),
            mount,
            size,
            disposable: true,
            last_access: AtomicU64::new(self.access_clock.fetch_add(1, Ordering::Relaxed)),
        };
        self.scos.insert((ns.clone(), sco), cached);
        Ok(path)
    }

    /// Opens a cached SCO for reading through the fd LRU. `None` on cache
    /// miss.
    pub fn open_sco(&self, ns: &Namespace, sco: ScoName) -> Option<Arc<File>> {
        let cached = self.scos.get(&(ns.clone(), sco))?;
        self.touch(&cached);
        let path = cached.path.clone();
        drop(cached);

        let mut fds = self.fd_cache.lock();
        if let Some(fd) = fds.get(&path) {
            metrics::SCO_CACHE_LOOKUPS_TOTAL
                .with_label_values(&["hit"])
                .inc();
            return Some(fd.clone());
        }
        match File::open(&path) {
            Ok(file) => {
                let fd = Arc::new(file);
                fds.put(path, fd.clone());
                metrics::SCO_CACHE_LOOKUPS_TOTAL
                    .with_label_values(&["hit"])
                    .inc();
                Some(fd)
            }
            Err(e) => {
                warn!("cached SCO {}/{} unreadable: {}", ns, sco, e);
                None
            }
        }
    }

    /// Drops a SCO from the cache, e.g. when a restore orphans it.
    pub fn remove_sco(&self, ns: &Namespace, sco: ScoName) {
        if let Some((key, cached)) = self.scos.remove(&(ns.clone(), sco)) {
            self.account_removed(&key.0, &cached);
            self.drop_file(&cached);
        }
    }

    pub fn info(&self) -> ScoCacheInfo {
        ScoCacheInfo {
            mount_points: self
                .mount_points
                .read()
                .iter()
                .map(|mp| (mp.path.clone(), mp.capacity, mp.used(), mp.is_online()))
                .collect(),
            namespaces: self
                .namespaces
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            cached_scos: self.scos.len(),
        }
    }

    // --- Internals shared with the cleaner ---

    fn pick_mount_point(&self) -> Option<Arc<ScoCacheMountPoint>> {
        self.mount_points
            .read()
            .iter()
            .filter(|mp| mp.is_online())
            .max_by_key(|mp| mp.free())
            .cloned()
    }

    fn account_removed(&self, ns: &Namespace, cached: &CachedSco) {
        cached.mount.used.fetch_sub(cached.size, Ordering::Relaxed);
        if let Some(mut info) = self.namespaces.get_mut(ns) {
            if cached.disposable {
                info.disposable = info.disposable.saturating_sub(cached.size);
            } else {
                info.non_disposable = info.non_disposable.saturating_sub(cached.size);
            }
        }
    }

    fn drop_file(&self, cached: &CachedSco) {
        self.evict_fd(&cached.path);
        let _ = std::fs::remove_file(&cached.path);
    }

    fn evict_fd(&self, path: &Path) {
        self.fd_cache.lock().pop(path);
    }

    /// Evicts disposable SCOs from one mount point until its free space
    /// reaches `target_free`. Candidates are ordered by owning-namespace
    /// disposable footprint (largest first), then least recently used.
    /// Returns the number of SCOs evicted.
    pub(crate) fn evict_from_mount_point(
        &self,
        mount: &Arc<ScoCacheMountPoint>,
        target_free: u64,
    ) -> usize {
        let mut candidates: Vec<((Namespace, ScoName), u64, u64, u64)> = self
            .scos
            .iter()
            .filter(|e| e.value().disposable && Arc::ptr_eq(&e.value().mount, mount))
            .map(|e| {
                let ns_footprint = self
                    .namespaces
                    .get(&e.key().0)
                    .map(|i| i.disposable)
                    .unwrap_or(0);
                (
                    e.key().clone(),
                    ns_footprint,
                    e.value().last_access.load(Ordering::Relaxed),
                    e.value().size,
                )
            })
            .collect();
        candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));

        let mut evicted = 0;
        for (key, _, _, _) in candidates {
            if mount.free() >= target_free {
                break;
            }
            if let Some((_, cached)) = self.scos.remove(&key) {
                self.account_removed(&key.0, &cached);
                self.drop_file(&cached);
                metrics::SCO_CACHE_EVICTIONS_TOTAL.inc();
                evicted += 1;
            }
        }
        metrics::SCO_CACHE_BYTES
            .with_label_values(&[&mount.path.display().to_string()])
            .set(mount.used() as f64);
        evicted
    }
}
