// src/server/mod.rs

//! Node startup: wires the process-wide services (backend connector,
//! SCO cache, cluster cache, volume registry) and the network-facing
//! servers (DTL, metadata journal), then runs until interrupted.

pub mod work_queue;

use crate::config::Config;
use crate::core::backend::connector_from_config;
use crate::core::clustercache::ClusterCache;
use crate::core::dtl::DtlServer;
use crate::core::metadata::MdsServer;
use crate::core::scocache::{ScoCache, ScoCacheCleanerTask};
use crate::core::volume::registry::VolumeRegistry;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::info;

/// Everything a running node consists of.
pub struct NodeContext {
    pub registry: Arc<VolumeRegistry>,
    pub sco_cache: Arc<ScoCache>,
    pub cluster_cache: Arc<ClusterCache>,
    pub shutdown_tx: broadcast::Sender<()>,
    tasks: JoinSet<()>,
}

/// Initializes services and binds the servers.
pub async fn setup(config: Config) -> Result<NodeContext> {
    info!(
        "peridot node '{}' starting (backend: {:?})",
        config.node.node_id, config.backend.kind
    );
    tokio::fs::create_dir_all(&config.node.scratch_dir).await?;

    let (shutdown_tx, _) = broadcast::channel(4);
    let mut tasks = JoinSet::new();

    let backend = connector_from_config(&config.backend)?;
    let sco_cache = ScoCache::new(config.sco_cache.clone())?;
    let cluster_cache = Arc::new(ClusterCache::new(config.cluster_cache.capacity_clusters));
    let registry = VolumeRegistry::new(
        &config,
        backend,
        sco_cache.clone(),
        cluster_cache.clone(),
    );

    let cleaner = ScoCacheCleanerTask::new(sco_cache.clone());
    tasks.spawn(cleaner.run(shutdown_tx.subscribe()));

    let dtl_server = DtlServer::bind(
        &config.dtl_server.addr,
        config.dtl_server.root.clone(),
        config.dtl_server.wq_max_threads,
    )
    .await?;
    tasks.spawn(dtl_server.run(shutdown_tx.subscribe()));

    // Remote metadata journals are served from the same node role.
    if !config.metadata.mds_nodes.is_empty() {
        let mds_root = config.node.scratch_dir.join("mds");
        let mds_addr = format!(
            "0.0.0.0:{}",
            config
                .metadata
                .mds_nodes
                .first()
                .map(|n| n.port)
                .unwrap_or(23097)
        );
        let mds_server = MdsServer::bind(&mds_addr, mds_root).await?;
        tasks.spawn(mds_server.run(shutdown_tx.subscribe()));
    }

    Ok(NodeContext {
        registry,
        sco_cache,
        cluster_cache,
        shutdown_tx,
        tasks,
    })
}

/// The main server entry point: set up, wait for ctrl-c, tear down.
pub async fn run(config: Config) -> Result<()> {
    let mut ctx = setup(config).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    let _ = ctx.shutdown_tx.send(());
    ctx.registry.shutdown().await;
    while ctx.tasks.join_next().await.is_some() {}
    info!("peridot node stopped");
    Ok(())
}
