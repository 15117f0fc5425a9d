// src/core/metrics.rs

//! Defines and registers Prometheus metrics for engine monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered
//! only once globally for the entire process lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, GaugeVec, TextEncoder, register_counter, register_counter_vec,
    register_gauge, register_gauge_vec,
};

lazy_static! {
    // --- Data path ---
    /// The total number of clusters written across all volumes.
    pub static ref CLUSTERS_WRITTEN_TOTAL: Counter =
        register_counter!("peridot_clusters_written_total", "Total clusters written.").unwrap();
    /// The total number of clusters read across all volumes.
    pub static ref CLUSTERS_READ_TOTAL: Counter =
        register_counter!("peridot_clusters_read_total", "Total clusters read.").unwrap();

    // --- Caches ---
    /// Cluster cache lookups, labeled by outcome (hit/miss).
    pub static ref CLUSTER_CACHE_LOOKUPS_TOTAL: CounterVec =
        register_counter_vec!("peridot_cluster_cache_lookups_total", "Cluster cache lookups.", &["outcome"]).unwrap();
    /// SCO cache reads, labeled by outcome (hit/miss).
    pub static ref SCO_CACHE_LOOKUPS_TOTAL: CounterVec =
        register_counter_vec!("peridot_sco_cache_lookups_total", "SCO cache lookups.", &["outcome"]).unwrap();
    /// Bytes currently cached per SCO cache mount point.
    pub static ref SCO_CACHE_BYTES: GaugeVec =
        register_gauge_vec!("peridot_sco_cache_bytes", "Bytes cached per mount point.", &["mount_point"]).unwrap();
    /// SCOs evicted by the SCO cache cleaner.
    pub static ref SCO_CACHE_EVICTIONS_TOTAL: Counter =
        register_counter!("peridot_sco_cache_evictions_total", "SCOs evicted from the cache.").unwrap();

    // --- Backend pipeline ---
    /// Backend tasks executed, labeled by task kind.
    pub static ref BACKEND_TASKS_TOTAL: CounterVec =
        register_counter_vec!("peridot_backend_tasks_total", "Backend tasks executed.", &["kind"]).unwrap();
    /// Backend task failures, labeled by task kind.
    pub static ref BACKEND_TASK_FAILURES_TOTAL: CounterVec =
        register_counter_vec!("peridot_backend_task_failures_total", "Backend task failures.", &["kind"]).unwrap();

    // --- Replication ---
    /// DTL entries forwarded to the peer.
    pub static ref DTL_ENTRIES_FORWARDED_TOTAL: Counter =
        register_counter!("peridot_dtl_entries_forwarded_total", "DTL entries forwarded to the peer.").unwrap();
    /// Volumes per failover state.
    pub static ref VOLUME_FAILOVER_STATE: GaugeVec =
        register_gauge_vec!("peridot_volume_failover_state", "Volumes per failover state.", &["state"]).unwrap();

    // --- Volume lifecycle ---
    /// Number of volumes currently registered on this node.
    pub static ref REGISTERED_VOLUMES: Gauge =
        register_gauge!("peridot_registered_volumes", "Volumes registered on this node.").unwrap();
    /// Number of halted volumes.
    pub static ref HALTED_VOLUMES: Gauge =
        register_gauge!("peridot_halted_volumes", "Volumes in the terminal halted state.").unwrap();
}

/// Renders all registered metrics in the Prometheus text format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
