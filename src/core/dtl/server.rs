// src/core/dtl/server.rs

//! The DTL server: a TCP acceptor hosting per-namespace log writers.
//!
//! Log fragments persist under a root directory, one subdirectory per
//! namespace and one fragment file per SCO. The root is guarded by an
//! exclusive file lock so two servers never share it. A namespace has at
//! most one live writer: a new `Register` bumps the namespace epoch,
//! and the previous writer's next request fails and closes its
//! connection.

use super::protocol::{DtlEntry, DtlRequest, DtlResponse, framed, recv_message, send_message};
use crate::core::errors::PeridotError;
use crate::core::types::ScoName;
use crate::server::work_queue::WorkQueue;
use dashmap::DashMap;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

struct NamespaceState {
    epoch: u64,
    cluster_size: u32,
    dir: PathBuf,
    /// Serializes fragment appends within the namespace.
    append_lock: Arc<Mutex<()>>,
}

pub struct DtlServer {
    root: PathBuf,
    listener: TcpListener,
    namespaces: Arc<DashMap<String, NamespaceState>>,
    /// Per-acceptor request work queue; log I/O runs on its pool.
    work_queue: Arc<WorkQueue>,
    /// Held for the server's lifetime; the lock dies with the fd.
    _lock_file: File,
}

impl DtlServer {
    pub async fn bind(
        addr: &str,
        root: PathBuf,
        wq_max_threads: usize,
    ) -> Result<Self, PeridotError> {
        tokio::fs::create_dir_all(&root).await?;
        let lock_file = acquire_root_lock(&root)?;
        let listener = TcpListener::bind(addr).await?;
        info!(
            "DTL server listening on {} (root {:?})",
            listener.local_addr()?,
            root
        );
        Ok(Self {
            root,
            listener,
            namespaces: Arc::new(DashMap::new()),
            work_queue: Arc::new(WorkQueue::new("dtl", wq_max_threads)),
            _lock_file: lock_file,
        })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, PeridotError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut connections = tokio::task::JoinSet::new();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!("DTL connection from {}", peer);
                            let root = self.root.clone();
                            let namespaces = self.namespaces.clone();
                            let work_queue = self.work_queue.clone();
                            connections.spawn(async move {
                                if let Err(e) =
                                    handle_connection(stream, root, namespaces, work_queue)
                                        .await
                                {
                                    debug!("DTL connection from {} ended: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => warn!("DTL accept failed: {}", e),
                    }
                }
                // Reap finished connection tasks as they come.
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown_rx.recv() => {
                    info!("DTL server shutting down.");
                    connections.abort_all();
                    return;
                }
            }
        }
    }
}

/// Takes the exclusive advisory lock on the root directory.
fn acquire_root_lock(root: &PathBuf) -> Result<File, PeridotError> {
    let lock_path = root.join(".dtl_lock");
    let file = File::create(&lock_path)?;
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        return Err(PeridotError::InvalidState(format!(
            "DTL root {root:?} is locked by another server"
        )));
    }
    Ok(file)
}

async fn handle_connection(
    stream: TcpStream,
    root: PathBuf,
    namespaces: Arc<DashMap<String, NamespaceState>>,
    work_queue: Arc<WorkQueue>,
) -> Result<(), PeridotError> {
    let mut framed = framed(stream);
    // The namespace this connection registered, with the epoch it got.
    let mut registration: Option<(String, u64)> = None;

    while let Some(req) = recv_message::<_, DtlRequest>(&mut framed).await? {
        let resp = match req {
            DtlRequest::Register {
                namespace,
                cluster_size,
            } => {
                let dir = root.join(&namespace);
                tokio::fs::create_dir_all(&dir).await?;
                let epoch = {
                    let mut entry = namespaces
                        .entry(namespace.clone())
                        .and_modify(|state| {
                            // Replace the previous writer.
                            state.epoch += 1;
                            state.cluster_size = cluster_size;
                        })
                        .or_insert_with(|| NamespaceState {
                            epoch: 0,
                            cluster_size,
                            dir: dir.clone(),
                            append_lock: Arc::new(Mutex::new(())),
                        });
                    entry.value_mut().dir = dir;
                    entry.value().epoch
                };
                info!(
                    "DTL writer registered for namespace '{}' (epoch {})",
                    namespace, epoch
                );
                registration = Some((namespace, epoch));
                DtlResponse::Ok
            }
            other => {
                let Some((ns, my_epoch)) = &registration else {
                    send_message(
                        &mut framed,
                        &DtlResponse::Error {
                            message: "not registered".to_string(),
                        },
                    )
                    .await?;
                    continue;
                };
                let (dir, append_lock, current_epoch) = match namespaces.get(ns) {
                    Some(state) => (
                        state.dir.clone(),
                        state.append_lock.clone(),
                        state.epoch,
                    ),
                    None => {
                        send_message(
                            &mut framed,
                            &DtlResponse::Error {
                                message: "namespace dropped".to_string(),
                            },
                        )
                        .await?;
                        return Ok(());
                    }
                };
                if current_epoch != *my_epoch {
                    // A newer writer took over; this connection is dead.
                    send_message(
                        &mut framed,
                        &DtlResponse::Error {
                            message: "superseded by a newer writer".to_string(),
                        },
                    )
                    .await?;
                    return Ok(());
                }
                match handle_request(other, &dir, &append_lock, &work_queue).await {
                    Ok(resp) => resp,
                    Err(e) => DtlResponse::Error {
                        message: e.to_string(),
                    },
                }
            }
        };
        send_message(&mut framed, &resp).await?;
    }
    Ok(())
}

fn fragment_path(dir: &Path, sco: ScoName) -> PathBuf {
    dir.join(format!("sco_{}.log", sco.object_name()))
}

/// Runs a blocking log-I/O job on the work queue and awaits completion.
async fn offload<T, F>(work_queue: &Arc<WorkQueue>, job: F) -> Result<T, PeridotError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    work_queue
        .submit(job)
        .await
        .map_err(|_| PeridotError::Internal("work queue dropped a job".to_string()))
}

async fn handle_request(
    req: DtlRequest,
    dir: &Path,
    append_lock: &Arc<Mutex<()>>,
    work_queue: &Arc<WorkQueue>,
) -> Result<DtlResponse, PeridotError> {
    match req {
        DtlRequest::AddEntries { entries, payload } => {
            let Some(first) = entries.first() else {
                return Ok(DtlResponse::Ok);
            };
            // Entries of one request always belong to one SCO.
            let sco = ScoName::new(first.loc.sco.number, 0);
            let path = fragment_path(dir, sco);
            let _guard = append_lock.lock().await;
            offload(work_queue, move || {
                append_fragment(&path, &entries, &payload)
            })
            .await??;
            Ok(DtlResponse::Ok)
        }
        DtlRequest::Flush => {
            // Appends are synced as they land; nothing is buffered here.
            Ok(DtlResponse::Ok)
        }
        DtlRequest::Clear => {
            let dir = dir.to_path_buf();
            let _guard = append_lock.lock().await;
            offload(work_queue, move || {
                for entry in std::fs::read_dir(&dir)?.flatten() {
                    let _ = std::fs::remove_file(entry.path());
                }
                Ok::<_, PeridotError>(())
            })
            .await??;
            Ok(DtlResponse::Ok)
        }
        DtlRequest::GetSco { sco } => {
            let path = fragment_path(dir, sco);
            let (entries, payload) =
                offload(work_queue, move || read_fragment(&path)).await??;
            Ok(DtlResponse::ScoData { entries, payload })
        }
        DtlRequest::RemoveUpTo { sco } => {
            let dir = dir.to_path_buf();
            let _guard = append_lock.lock().await;
            offload(work_queue, move || {
                for entry in std::fs::read_dir(&dir)?.flatten() {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if let Some(fragment_sco) = name
                        .strip_prefix("sco_")
                        .and_then(|n| n.strip_suffix(".log"))
                        .and_then(ScoName::parse_object_name)
                    {
                        if fragment_sco.number <= sco.number {
                            let _ = std::fs::remove_file(entry.path());
                        }
                    }
                }
                Ok::<_, PeridotError>(())
            })
            .await??;
            Ok(DtlResponse::Ok)
        }
        DtlRequest::Register { .. } => unreachable!("handled by the connection loop"),
    }
}

fn append_fragment(
    path: &Path,
    entries: &[DtlEntry],
    payload: &[u8],
) -> Result<(), PeridotError> {
    use std::io::Write;
    let record = bincode::encode_to_vec(
        &(entries.to_vec(), payload.to_vec()),
        bincode::config::standard(),
    )?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let mut buf = Vec::with_capacity(4 + record.len());
    buf.extend_from_slice(&(record.len() as u32).to_le_bytes());
    buf.extend_from_slice(&record);
    file.write_all(&buf)?;
    // The client may be waiting synchronously on this ack; the entry has
    // to actually be durable.
    file.sync_data()?;
    Ok(())
}

fn read_fragment(path: &Path) -> Result<(Vec<DtlEntry>, Vec<u8>), PeridotError> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok((Vec::new(), Vec::new()));
        }
        Err(e) => return Err(e.into()),
    };
    let mut entries = Vec::new();
    let mut payload = Vec::new();
    let mut off = 0usize;
    while off + 4 <= bytes.len() {
        let len = u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap()) as usize;
        off += 4;
        if off + len > bytes.len() {
            break;
        }
        let ((record_entries, record_payload), _): ((Vec<DtlEntry>, Vec<u8>), _) =
            bincode::decode_from_slice(&bytes[off..off + len], bincode::config::standard())?;
        entries.extend(record_entries);
        payload.extend(record_payload);
        off += len;
    }
    Ok((entries, payload))
}
