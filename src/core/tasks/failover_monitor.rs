// src/core/tasks/failover_monitor.rs

//! Periodic replication health checks for one volume.
//!
//! A degraded volume keeps writing locally; this task is what brings it
//! back: it retries the peer connection and walks the volume through
//! DEGRADED -> KETCHUP -> OK_SYNC once the peer answers again.

use crate::core::volume::Volume;
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

pub struct FailoverMonitorTask {
    volume: Weak<Volume>,
    interval: Duration,
}

impl FailoverMonitorTask {
    pub fn new(volume: Weak<Volume>, interval: Duration) -> Self {
        Self { volume, interval }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let Some(volume) = self.volume.upgrade() else {
                        debug!("failover monitor: volume gone, stopping");
                        return;
                    };
                    if volume.is_halted() {
                        info!("failover monitor for {} stopping: volume halted", volume.id());
                        return;
                    }
                    volume.failover_health_check().await;
                }
                _ = shutdown_rx.recv() => {
                    return;
                }
            }
        }
    }
}
