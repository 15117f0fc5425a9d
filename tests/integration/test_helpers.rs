// tests/integration/test_helpers.rs

//! Test helpers and utilities for integration tests.

use peridot::config::{Config, MountPointConfig};
use peridot::core::backend::{BackendConnector, connector_from_config};
use peridot::core::clustercache::ClusterCache;
use peridot::core::dtl::DtlServer;
use peridot::core::scocache::ScoCache;
use peridot::core::volume::registry::VolumeRegistry;
use peridot::core::volume::{Volume, VolumeConfig};
use peridot::core::types::Namespace;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::broadcast;

/// A complete single-node test environment: local backend, SCO cache on
/// a scratch mount point, cluster cache, and a volume registry.
pub struct TestContext {
    pub dir: TempDir,
    pub config: Config,
    pub backend: Arc<dyn BackendConnector>,
    pub sco_cache: Arc<ScoCache>,
    pub cluster_cache: Arc<ClusterCache>,
    pub registry: Arc<VolumeRegistry>,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Builds a context, letting the caller tweak the config first.
    /// Volume geometry defaults are small so rollovers actually happen:
    /// 4 KiB clusters, 4 clusters per SCO, 8 entries per TLog.
    pub async fn with_config(tweak: impl FnOnce(&mut Config)) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("warn")
            .with_test_writer()
            .try_init();

        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = Config::default();
        config.node.node_id = "test-node".to_string();
        config.node.scratch_dir = dir.path().join("scratch");
        config.backend.local_root = dir.path().join("backend");
        config.backend.retry_delay = std::time::Duration::from_millis(50);
        config.sco_cache.mount_points = vec![MountPointConfig {
            path: dir.path().join("scocache"),
            capacity: 1 << 30,
        }];
        config.volume_defaults.lba_size = 512;
        config.volume_defaults.cluster_multiplier = 8;
        config.volume_defaults.sco_multiplier = 4;
        config.volume_defaults.tlog_multiplier = 2;
        config.volume_defaults.heartbeat_interval = std::time::Duration::from_secs(60);
        tweak(&mut config);

        let backend = connector_from_config(&config.backend).expect("backend");
        let sco_cache = ScoCache::new(config.sco_cache.clone()).expect("sco cache");
        let cluster_cache = Arc::new(ClusterCache::new(config.cluster_cache.capacity_clusters));
        let registry = VolumeRegistry::new(
            &config,
            backend.clone(),
            sco_cache.clone(),
            cluster_cache.clone(),
        );
        Self {
            dir,
            config,
            backend,
            sco_cache,
            cluster_cache,
            registry,
        }
    }

    /// A second registry over the same backend and scratch state,
    /// modelling this node restarting after a crash.
    pub fn restarted_node(&self) -> Arc<VolumeRegistry> {
        let sco_cache = ScoCache::new(self.config.sco_cache.clone()).expect("sco cache");
        let cluster_cache =
            Arc::new(ClusterCache::new(self.config.cluster_cache.capacity_clusters));
        VolumeRegistry::new(&self.config, self.backend.clone(), sco_cache, cluster_cache)
    }

    pub fn volume_config(&self, id: &str, size: u64) -> VolumeConfig {
        VolumeConfig::from_defaults(
            &self.config.volume_defaults,
            id.to_string(),
            Namespace::new(format!("ns-{id}")),
            size,
        )
    }

    pub async fn new_volume(&self, id: &str, size: u64) -> Arc<Volume> {
        self.registry
            .create_volume(self.volume_config(id, size))
            .await
            .expect("volume creation")
    }

    /// Starts a DTL server on an ephemeral port. Dropping the returned
    /// sender kills it, connections included.
    pub async fn start_dtl_server(&self, name: &str) -> (std::net::SocketAddr, broadcast::Sender<()>) {
        let server = DtlServer::bind("127.0.0.1:0", self.dir.path().join(name), 4)
            .await
            .expect("dtl server");
        let addr = server.local_addr().expect("dtl addr");
        let (tx, _) = broadcast::channel(1);
        let rx = tx.subscribe();
        tokio::spawn(server.run(rx));
        (addr, tx)
    }
}

/// A repeating pattern buffer of the given length.
pub fn pattern(byte: u8, len: usize) -> Vec<u8> {
    vec![byte; len]
}
