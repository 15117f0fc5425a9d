// src/config.rs

//! Manages engine configuration: loading, defaulting, and validation.

use crate::core::dtl::DtlMode;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for a peridot node.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub sco_cache: ScoCacheConfig,
    #[serde(default)]
    pub cluster_cache: ClusterCacheConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub dtl: DtlClientConfig,
    #[serde(default)]
    pub dtl_server: DtlServerConfig,
    #[serde(default)]
    pub volume_defaults: VolumeDefaultsConfig,
    #[serde(default)]
    pub control: ControlConfig,
}

/// Node identity and scratch storage for open TLogs and metadata pages.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NodeConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    /// Directory holding per-volume scratch state (open TLogs, metadata).
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            scratch_dir: default_scratch_dir(),
            log_level: default_log_level(),
        }
    }
}

/// Which backend driver a namespace is served by.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    #[default]
    Local,
    S3,
    Alba,
    Multi,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,
    /// Root directory for the `local` backend kind.
    #[serde(default = "default_backend_root")]
    pub local_root: PathBuf,
    /// Children for the `multi` backend kind.
    #[serde(default)]
    pub children: Vec<BackendChildConfig>,
    /// Number of worker tasks draining the backend task queues.
    #[serde(default = "default_backend_threads")]
    pub num_threads: usize,
    /// Bounded retry count for SCO uploads.
    #[serde(default = "default_sco_write_retries")]
    pub sco_write_retries: u32,
    #[serde(with = "humantime_serde", default = "default_retry_delay")]
    pub retry_delay: Duration,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BackendChildConfig {
    pub kind: BackendKind,
    pub local_root: PathBuf,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Local,
            local_root: default_backend_root(),
            children: Vec::new(),
            num_threads: default_backend_threads(),
            sco_write_retries: default_sco_write_retries(),
            retry_delay: default_retry_delay(),
        }
    }
}

/// One disk location participating in the SCO cache.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MountPointConfig {
    pub path: PathBuf,
    /// Capacity in bytes budgeted to the cache on this mount point.
    pub capacity: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ScoCacheConfig {
    #[serde(default)]
    pub mount_points: Vec<MountPointConfig>,
    /// When free space falls below this, the cleaner starts evicting.
    #[serde(default = "default_trigger_gap")]
    pub trigger_gap: u64,
    /// The cleaner evicts until free space reaches this.
    #[serde(default = "default_backoff_gap")]
    pub backoff_gap: u64,
    #[serde(with = "humantime_serde", default = "default_cleanup_interval")]
    pub cleanup_interval: Duration,
}

impl Default for ScoCacheConfig {
    fn default() -> Self {
        Self {
            mount_points: Vec::new(),
            trigger_gap: default_trigger_gap(),
            backoff_gap: default_backoff_gap(),
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ClusterCacheConfig {
    /// Total capacity of the shared in-memory cluster cache, in clusters.
    /// `0` disables the cache.
    #[serde(default = "default_cluster_cache_capacity")]
    pub capacity_clusters: usize,
}

impl Default for ClusterCacheConfig {
    fn default() -> Self {
        Self {
            capacity_clusters: default_cluster_cache_capacity(),
        }
    }
}

/// A remote metadata server endpoint for the mirrored MDS store.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MdsNodeConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MetadataConfig {
    /// Maximum number of metadata pages held in the in-memory page cache.
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    /// Entries per page = 2^page_bits.
    #[serde(default = "default_page_bits")]
    pub page_bits: u8,
    /// Remote metadata servers, in master-first order. Empty means local-only.
    #[serde(default)]
    pub mds_nodes: Vec<MdsNodeConfig>,
    #[serde(with = "humantime_serde", default = "default_mds_timeout")]
    pub mds_timeout: Duration,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            max_pages: default_max_pages(),
            page_bits: default_page_bits(),
            mds_nodes: Vec::new(),
            mds_timeout: default_mds_timeout(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DtlClientConfig {
    /// `None` host means the volume runs standalone (no replication peer).
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_dtl_port")]
    pub port: u16,
    #[serde(default)]
    pub mode: DtlMode,
    /// Whether failover configuration is applied automatically or by hand.
    #[serde(default)]
    pub automatic: bool,
    /// Bounded in-flight write descriptor ring.
    #[serde(default = "default_dtl_max_entries")]
    pub max_entries: usize,
    #[serde(with = "humantime_serde", default = "default_dtl_request_timeout")]
    pub request_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_dtl_health_interval")]
    pub health_check_interval: Duration,
}

impl Default for DtlClientConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_dtl_port(),
            mode: DtlMode::default(),
            automatic: false,
            max_entries: default_dtl_max_entries(),
            request_timeout: default_dtl_request_timeout(),
            health_check_interval: default_dtl_health_interval(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DtlServerConfig {
    #[serde(default = "default_dtl_server_addr")]
    pub addr: String,
    /// Root directory for per-namespace log fragments. Globally locked.
    #[serde(default = "default_dtl_server_root")]
    pub root: PathBuf,
    /// Upper bound on worker threads in the request work queue.
    #[serde(default = "default_wq_max_threads")]
    pub wq_max_threads: usize,
}

impl Default for DtlServerConfig {
    fn default() -> Self {
        Self {
            addr: default_dtl_server_addr(),
            root: default_dtl_server_root(),
            wq_max_threads: default_wq_max_threads(),
        }
    }
}

/// Per-volume knobs; a `VolumeConfig` starts from these.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct VolumeDefaultsConfig {
    #[serde(default = "default_lba_size")]
    pub lba_size: u32,
    #[serde(default = "default_cluster_multiplier")]
    pub cluster_multiplier: u32,
    #[serde(default = "default_sco_multiplier")]
    pub sco_multiplier: u32,
    /// Number of SCOs covered by one TLog:
    /// `max_tlog_entries = tlog_multiplier * sco_multiplier`.
    #[serde(default = "default_tlog_multiplier")]
    pub tlog_multiplier: u32,
    /// Cap on not-yet-uploaded SCO cache bytes, as a factor of volume size.
    #[serde(default = "default_non_disposable_factor")]
    pub non_disposable_factor: f64,
    /// Ignore up to this many `sync()` calls before forcing an fsync.
    #[serde(default)]
    pub sync_ignore_count: u64,
    /// ... but never ignore syncs for longer than this.
    #[serde(with = "humantime_serde", default = "default_sync_ignore_max")]
    pub sync_ignore_max: Duration,
    #[serde(default = "default_max_snapshot_metadata_size")]
    pub max_snapshot_metadata_size: usize,
    #[serde(with = "humantime_serde", default = "default_heartbeat_interval")]
    pub heartbeat_interval: Duration,
}

impl Default for VolumeDefaultsConfig {
    fn default() -> Self {
        Self {
            lba_size: default_lba_size(),
            cluster_multiplier: default_cluster_multiplier(),
            sco_multiplier: default_sco_multiplier(),
            tlog_multiplier: default_tlog_multiplier(),
            non_disposable_factor: default_non_disposable_factor(),
            sync_ignore_count: 0,
            sync_ignore_max: default_sync_ignore_max(),
            max_snapshot_metadata_size: default_max_snapshot_metadata_size(),
            heartbeat_interval: default_heartbeat_interval(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ControlConfig {
    /// How many redirect hops a control-plane call may follow.
    #[serde(default = "default_max_redirects")]
    pub max_redirects: u32,
    #[serde(with = "humantime_serde", default = "default_control_timeout")]
    pub request_timeout: Duration,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            max_redirects: default_max_redirects(),
            request_timeout: default_control_timeout(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.sco_cache.backoff_gap < self.sco_cache.trigger_gap {
            return Err(anyhow!(
                "sco_cache.backoff_gap must be >= sco_cache.trigger_gap"
            ));
        }
        let vd = &self.volume_defaults;
        if vd.lba_size == 0 || !vd.lba_size.is_power_of_two() {
            return Err(anyhow!("volume_defaults.lba_size must be a power of two"));
        }
        if vd.cluster_multiplier == 0 || vd.sco_multiplier == 0 || vd.tlog_multiplier == 0 {
            return Err(anyhow!("volume multipliers must be non-zero"));
        }
        if vd.sco_multiplier > u16::MAX as u32 {
            return Err(anyhow!(
                "volume_defaults.sco_multiplier must fit a 16-bit SCO offset"
            ));
        }
        if vd.non_disposable_factor <= 0.0 {
            return Err(anyhow!(
                "volume_defaults.non_disposable_factor must be positive"
            ));
        }
        if self.backend.kind == BackendKind::Multi && self.backend.children.is_empty() {
            return Err(anyhow!("multi backend requires at least one child"));
        }
        if self.dtl_server.wq_max_threads == 0 {
            return Err(anyhow!("dtl_server.wq_max_threads cannot be 0"));
        }
        Ok(())
    }
}

// --- Defaulting functions ---

fn default_node_id() -> String {
    format!("peridot-{}", std::process::id())
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from("/var/lib/peridot/scratch")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_backend_root() -> PathBuf {
    PathBuf::from("/var/lib/peridot/backend")
}

fn default_backend_threads() -> usize {
    4
}

fn default_sco_write_retries() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_trigger_gap() -> u64 {
    // 1 GiB
    1 << 30
}

fn default_backoff_gap() -> u64 {
    // 2 GiB
    2 << 30
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_cluster_cache_capacity() -> usize {
    // Clusters, not bytes. 32Ki clusters of 4 KiB is 128 MiB.
    32 * 1024
}

fn default_max_pages() -> usize {
    1024
}

fn default_page_bits() -> u8 {
    // 256 entries per page.
    8
}

fn default_mds_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_dtl_port() -> u16 {
    23096
}

fn default_dtl_max_entries() -> usize {
    1024
}

fn default_dtl_request_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_dtl_health_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_dtl_server_addr() -> String {
    "0.0.0.0:23096".to_string()
}

fn default_dtl_server_root() -> PathBuf {
    PathBuf::from("/var/lib/peridot/dtl")
}

fn default_wq_max_threads() -> usize {
    16
}

fn default_lba_size() -> u32 {
    512
}

fn default_cluster_multiplier() -> u32 {
    8
}

fn default_sco_multiplier() -> u32 {
    1024
}

fn default_tlog_multiplier() -> u32 {
    20
}

fn default_non_disposable_factor() -> f64 {
    1.5
}

fn default_sync_ignore_max() -> Duration {
    Duration::from_secs(10)
}

fn default_max_snapshot_metadata_size() -> usize {
    4096
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_max_redirects() -> u32 {
    2
}

fn default_control_timeout() -> Duration {
    Duration::from_secs(60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_inverted_watermarks() {
        let mut cfg = Config::default();
        cfg.sco_cache.trigger_gap = 10;
        cfg.sco_cache.backoff_gap = 5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parses_minimal_toml() {
        let cfg: Config = toml::from_str(
            r#"
            [node]
            node_id = "node-a"

            [volume_defaults]
            cluster_multiplier = 8
            sco_multiplier = 32
            "#,
        )
        .unwrap();
        assert_eq!(cfg.node.node_id, "node-a");
        assert_eq!(cfg.volume_defaults.sco_multiplier, 32);
        assert_eq!(cfg.control.max_redirects, 2);
        cfg.validate().unwrap();
    }
}
