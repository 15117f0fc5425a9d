// src/core/backend/pipeline.rs

//! Ordered asynchronous uploads of SCOs, TLogs and the snapshots manifest.
//!
//! Every volume owns a FIFO task queue drained by a shared, fixed-size
//! worker pool. SCO uploads may overtake each other; TLog and manifest
//! uploads are *barrier* tasks: they wait for all preceding tasks of the
//! same volume to finish and block the ones behind them. The manifest is
//! therefore never uploaded before the TLogs it references.
//!
//! Successful TLog uploads call back into the volume, which flips the
//! `written_to_backend` flag, re-uploads the manifest, uncorks the
//! metadata store, trims the DTL and deletes the local TLog file.

use super::BackendConnector;
use crate::config::BackendConfig;
use crate::core::errors::PeridotError;
use crate::core::metrics;
use crate::core::types::{Namespace, SNAPSHOTS_OBJECT_NAME, ScoName, TLogId};
use async_trait::async_trait;
use bytes::Bytes;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Consecutive terminal (non-transient) manifest upload failures after
/// which the volume is halted.
const MAX_TERMINAL_MANIFEST_FAILURES: u32 = 5;

/// Work accepted by a volume's backend queue.
#[derive(Debug)]
pub enum BackendTask {
    /// Upload a sealed SCO file. Not a barrier; uploads may overtake.
    WriteSco {
        sco: ScoName,
        path: PathBuf,
        checksum: u32,
        overwrite: bool,
    },
    /// Upload a sealed TLog file. Barrier: runs strictly after every
    /// `WriteSco` it references.
    WriteTLog {
        tlog: TLogId,
        path: PathBuf,
        checksum: u32,
        /// Last SCO referenced by this TLog; forwarded to the DTL trim.
        sco: ScoName,
    },
    /// Upload the snapshots manifest. Barrier.
    WriteSnapshots { serialized: Bytes },
    DeleteSco { sco: ScoName },
    DeleteTLog { tlog: TLogId },
    BlockDeleteScos { scos: Vec<ScoName> },
    BlockDeleteTLogs { tlogs: Vec<TLogId> },
}

impl BackendTask {
    fn is_barrier(&self) -> bool {
        matches!(
            self,
            BackendTask::WriteTLog { .. } | BackendTask::WriteSnapshots { .. }
        )
    }

    fn kind(&self) -> &'static str {
        match self {
            BackendTask::WriteSco { .. } => "write_sco",
            BackendTask::WriteTLog { .. } => "write_tlog",
            BackendTask::WriteSnapshots { .. } => "write_snapshots",
            BackendTask::DeleteSco { .. } => "delete_sco",
            BackendTask::DeleteTLog { .. } => "delete_tlog",
            BackendTask::BlockDeleteScos { .. } => "block_delete_scos",
            BackendTask::BlockDeleteTLogs { .. } => "block_delete_tlogs",
        }
    }
}

/// The volume-side callbacks the pipeline drives. Implementors are held
/// weakly; a destroyed volume silently stops receiving callbacks.
#[async_trait]
pub trait BackendTaskHandler: Send + Sync {
    async fn sco_written_to_backend(&self, sco: ScoName, size: u64);

    async fn tlog_written_to_backend(&self, tlog: TLogId, sco: ScoName);

    /// Whether the persistor still references this TLog. An upload task
    /// whose local file vanished is dropped when the answer is no (a
    /// restore or snapshot delete removed it), and fatal otherwise.
    async fn tlog_still_referenced(&self, tlog: TLogId) -> bool;

    /// A non-recoverable backend failure: the volume must halt.
    async fn report_backend_failure(&self, what: &str);
}

/// Process-wide upload capacity, shared by all volume queues.
pub struct BackendPipeline {
    sem: Arc<Semaphore>,
    cfg: BackendConfig,
}

impl BackendPipeline {
    pub fn new(cfg: BackendConfig) -> Self {
        Self {
            sem: Arc::new(Semaphore::new(cfg.num_threads.max(1))),
            cfg,
        }
    }

    /// Creates the task queue for one volume.
    pub fn queue_for(
        &self,
        ns: Namespace,
        connector: Arc<dyn BackendConnector>,
        handler: Weak<dyn BackendTaskHandler>,
    ) -> VolumeTaskQueue {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(QueueCtx {
            ns,
            connector,
            handler,
            sem: self.sem.clone(),
            cfg: self.cfg.clone(),
        });
        let join = tokio::spawn(run_queue(rx, ctx));
        VolumeTaskQueue {
            tx,
            join: Some(join),
            handler_keepalive: None,
        }
    }

    /// Like [`BackendPipeline::queue_for`], but the queue keeps the
    /// handler (a resolver object, not the volume itself) alive for its
    /// own lifetime.
    pub fn queue_with_sink(
        &self,
        ns: Namespace,
        connector: Arc<dyn BackendConnector>,
        sink: Arc<dyn BackendTaskHandler>,
    ) -> VolumeTaskQueue {
        let mut queue = self.queue_for(ns, connector, Arc::downgrade(&sink));
        queue.handler_keepalive = Some(sink);
        queue
    }
}

enum QueueItem {
    Task(BackendTask),
    Drain(oneshot::Sender<()>),
}

/// Handle to a volume's FIFO backend queue.
pub struct VolumeTaskQueue {
    tx: mpsc::UnboundedSender<QueueItem>,
    join: Option<tokio::task::JoinHandle<()>>,
    handler_keepalive: Option<Arc<dyn BackendTaskHandler>>,
}

impl VolumeTaskQueue {
    pub fn enqueue(&self, task: BackendTask) {
        if self.tx.send(QueueItem::Task(task)).is_err() {
            warn!("backend queue is shut down; task dropped");
        }
    }

    /// Waits until every task enqueued before this call has completed.
    pub async fn drain(&self) -> Result<(), PeridotError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(QueueItem::Drain(ack_tx))
            .map_err(|_| PeridotError::InvalidState("backend queue is shut down".to_string()))?;
        ack_rx
            .await
            .map_err(|_| PeridotError::InvalidState("backend queue died".to_string()))
    }

    /// Finishes queued work and stops the runner.
    pub async fn shutdown(&mut self) {
        let _ = self.drain().await;
        // Closing the channel ends the runner loop.
        let (dummy_tx, _) = mpsc::unbounded_channel();
        let old_tx = std::mem::replace(&mut self.tx, dummy_tx);
        drop(old_tx);
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

struct QueueCtx {
    ns: Namespace,
    connector: Arc<dyn BackendConnector>,
    handler: Weak<dyn BackendTaskHandler>,
    sem: Arc<Semaphore>,
    cfg: BackendConfig,
}

async fn run_queue(mut rx: mpsc::UnboundedReceiver<QueueItem>, ctx: Arc<QueueCtx>) {
    let mut inflight: JoinSet<()> = JoinSet::new();
    while let Some(item) = rx.recv().await {
        match item {
            QueueItem::Task(task) if task.is_barrier() => {
                // Barrier: drain everything in front, run alone.
                while inflight.join_next().await.is_some() {}
                execute(&ctx, task).await;
            }
            QueueItem::Task(task) => {
                let Ok(permit) = ctx.sem.clone().acquire_owned().await else {
                    return;
                };
                let ctx = ctx.clone();
                inflight.spawn(async move {
                    execute(&ctx, task).await;
                    drop(permit);
                });
            }
            QueueItem::Drain(ack) => {
                while inflight.join_next().await.is_some() {}
                let _ = ack.send(());
            }
        }
    }
    while inflight.join_next().await.is_some() {}
}

async fn execute(ctx: &QueueCtx, task: BackendTask) {
    metrics::BACKEND_TASKS_TOTAL
        .with_label_values(&[task.kind()])
        .inc();
    match task {
        BackendTask::WriteSco {
            sco,
            path,
            checksum,
            overwrite,
        } => write_sco(ctx, sco, path, checksum, overwrite).await,
        BackendTask::WriteTLog {
            tlog,
            path,
            checksum,
            sco,
        } => write_tlog(ctx, tlog, path, checksum, sco).await,
        BackendTask::WriteSnapshots { serialized } => write_snapshots(ctx, serialized).await,
        BackendTask::DeleteSco { sco } => {
            delete_object(ctx, &sco.object_name()).await;
        }
        BackendTask::DeleteTLog { tlog } => {
            delete_object(ctx, &tlog.object_name()).await;
        }
        BackendTask::BlockDeleteScos { scos } => {
            for sco in scos {
                delete_object(ctx, &sco.object_name()).await;
            }
        }
        BackendTask::BlockDeleteTLogs { tlogs } => {
            for tlog in tlogs {
                delete_object(ctx, &tlog.object_name()).await;
            }
        }
    }
}

fn retry_delay(cfg: &BackendConfig, rng: &mut SmallRng) -> Duration {
    // Spread retries out a little so queues do not stampede the backend.
    cfg.retry_delay + Duration::from_millis(rng.gen_range(0..500))
}

async fn write_sco(ctx: &QueueCtx, sco: ScoName, path: PathBuf, checksum: u32, overwrite: bool) {
    let mut rng = SmallRng::from_entropy();
    for attempt in 0..=ctx.cfg.sco_write_retries {
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => Bytes::from(b),
            Err(e) => {
                error!("cannot read SCO file {:?} for upload: {}", path, e);
                report_fatal(ctx, &format!("SCO {sco} source file unreadable: {e}")).await;
                return;
            }
        };
        let size = bytes.len() as u64;
        match ctx
            .connector
            .put(&ctx.ns, &sco.object_name(), bytes, overwrite, Some(checksum))
            .await
        {
            Ok(()) => {
                debug!("SCO {} written to backend ({} bytes)", sco, size);
                if let Some(handler) = ctx.handler.upgrade() {
                    handler.sco_written_to_backend(sco, size).await;
                }
                return;
            }
            Err(e) if attempt < ctx.cfg.sco_write_retries => {
                metrics::BACKEND_TASK_FAILURES_TOTAL
                    .with_label_values(&["write_sco"])
                    .inc();
                warn!(
                    "put of SCO {} failed (attempt {}/{}): {}",
                    sco,
                    attempt + 1,
                    ctx.cfg.sco_write_retries,
                    e
                );
                tokio::time::sleep(retry_delay(&ctx.cfg, &mut rng)).await;
            }
            Err(e) => {
                error!("put of SCO {} failed terminally: {}", sco, e);
                report_fatal(ctx, &format!("SCO {sco} upload failed: {e}")).await;
                return;
            }
        }
    }
}

async fn write_tlog(ctx: &QueueCtx, tlog: TLogId, path: PathBuf, checksum: u32, sco: ScoName) {
    let mut rng = SmallRng::from_entropy();
    loop {
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => Bytes::from(b),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // The local file is gone. If the persistor no longer
                // references this TLog, a restore or snapshot delete beat
                // us to it and the upload is moot. Anything else is a
                // lost journal and the volume cannot continue.
                let referenced = match ctx.handler.upgrade() {
                    Some(handler) => handler.tlog_still_referenced(tlog).await,
                    None => false,
                };
                if referenced {
                    error!("TLog file {:?} vanished while still referenced", path);
                    report_fatal(ctx, &format!("TLog {tlog} file vanished")).await;
                } else {
                    warn!("dropping upload of unreferenced TLog {}", tlog);
                }
                return;
            }
            Err(e) => {
                report_fatal(ctx, &format!("TLog {tlog} file unreadable: {e}")).await;
                return;
            }
        };

        match ctx
            .connector
            .put(
                &ctx.ns,
                &tlog.object_name(),
                bytes,
                false,
                Some(checksum),
            )
            .await
        {
            // A FileExists answer means a previous attempt landed but the
            // response was lost. TLog objects are immutable, so this is
            // success.
            Ok(()) | Err(PeridotError::FileExists(_)) => {
                info!("TLog {} written to backend", tlog);
                if let Some(handler) = ctx.handler.upgrade() {
                    handler.tlog_written_to_backend(tlog, sco).await;
                }
                return;
            }
            Err(e) => {
                metrics::BACKEND_TASK_FAILURES_TOTAL
                    .with_label_values(&["write_tlog"])
                    .inc();
                warn!("put of TLog {} failed, will retry: {}", tlog, e);
                tokio::time::sleep(retry_delay(&ctx.cfg, &mut rng)).await;
            }
        }
    }
}

async fn write_snapshots(ctx: &QueueCtx, serialized: Bytes) {
    let mut rng = SmallRng::from_entropy();
    let mut terminal_failures = 0u32;
    loop {
        match ctx
            .connector
            .put(
                &ctx.ns,
                SNAPSHOTS_OBJECT_NAME,
                serialized.clone(),
                true,
                None,
            )
            .await
        {
            Ok(()) => {
                debug!("snapshots manifest written for {}", ctx.ns);
                return;
            }
            Err(e) => {
                metrics::BACKEND_TASK_FAILURES_TOTAL
                    .with_label_values(&["write_snapshots"])
                    .inc();
                if !e.is_transient() {
                    terminal_failures += 1;
                    if terminal_failures >= MAX_TERMINAL_MANIFEST_FAILURES {
                        error!("manifest upload for {} failed terminally: {}", ctx.ns, e);
                        report_fatal(ctx, &format!("manifest upload failed: {e}")).await;
                        return;
                    }
                }
                warn!("manifest upload for {} failed, will retry: {}", ctx.ns, e);
                tokio::time::sleep(retry_delay(&ctx.cfg, &mut rng)).await;
            }
        }
    }
}

async fn delete_object(ctx: &QueueCtx, name: &str) {
    if let Err(e) = ctx.connector.delete(&ctx.ns, name, true).await {
        // Deletions are best-effort; a leaked object is garbage, not
        // corruption.
        warn!("delete of {}/{} failed: {}", ctx.ns, name, e);
    }
}

async fn report_fatal(ctx: &QueueCtx, what: &str) {
    metrics::BACKEND_TASK_FAILURES_TOTAL
        .with_label_values(&["fatal"])
        .inc();
    if let Some(handler) = ctx.handler.upgrade() {
        handler.report_backend_failure(what).await;
    } else {
        error!("backend failure for {} with no live volume: {}", ctx.ns, what);
    }
}
