// src/core/scocache/cleaner.rs

//! Background eviction for the SCO cache.
//!
//! One cleaner task watches all mount points. When a mount point's free
//! space falls below the trigger gap, disposable SCOs are evicted in LRU
//! order, largest namespaces first, until free space recovers to the
//! backoff gap.

use super::ScoCache;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

pub struct ScoCacheCleanerTask {
    cache: Arc<ScoCache>,
}

impl ScoCacheCleanerTask {
    pub fn new(cache: Arc<ScoCache>) -> Self {
        Self { cache }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("SCO cache cleaner task started.");
        let mut interval = tokio::time::interval(self.cache.cleanup_interval());

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.clean_cycle();
                }
                _ = shutdown_rx.recv() => {
                    info!("SCO cache cleaner task shutting down.");
                    return;
                }
            }
        }
    }

    fn clean_cycle(&self) {
        let trigger = self.cache.trigger_gap();
        let backoff = self.cache.backoff_gap();
        for mount in self.cache.mount_points() {
            if !mount.is_online() || mount.free() >= trigger {
                continue;
            }
            info!(
                "SCO cache mount point {:?} below trigger gap ({} free), evicting",
                mount.path,
                mount.free()
            );
            let evicted = self.cache.evict_from_mount_point(&mount, backoff);
            debug!(
                "evicted {} SCOs from {:?}; {} bytes free now",
                evicted,
                mount.path,
                mount.free()
            );
        }
    }
}
