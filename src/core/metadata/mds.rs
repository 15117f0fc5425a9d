// src/core/metadata/mds.rs

//! Mirrored metadata store: local pages plus remote journal replicas.
//!
//! Every mutation applies locally first and is then streamed as a
//! journal record to an ordered list of metadata servers. The first
//! reachable node is the master; when it fails the next one takes over
//! and lagging replicas converge by replaying the journal (`catch_up`).
//! Mirroring failures never fail the write path: the local store is
//! authoritative and the journal is an availability measure.
//!
//! The wire protocol is length-delimited bincode frames, one request or
//! response per frame.

use super::{MetaDataBatch, MetaDataEntry, MetaDataStore, MetaDataStoreStats, Relocation};
use crate::config::MdsNodeConfig;
use crate::core::errors::PeridotError;
use crate::core::types::{ClusterAddress, ClusterHash, ClusterLocation, CorkId, Namespace, ScrubId};
use async_trait::async_trait;
use bincode::config::standard;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, broadcast};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One replicated metadata mutation.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum JournalRecord {
    Set {
        addr: ClusterAddress,
        loc: ClusterLocation,
        hash: ClusterHash,
    },
    Cork { id: u128 },
    UncorkUpTo { id: u128 },
}

#[derive(Debug, bincode::Encode, bincode::Decode)]
enum MdsRequest {
    Register { namespace: String },
    Append { records: Vec<JournalRecord> },
    Replay { namespace: String },
    Ping,
}

#[derive(Debug, bincode::Encode, bincode::Decode)]
enum MdsResponse {
    Ok,
    Records(Vec<JournalRecord>),
    Error(String),
}

type MdsFramed = Framed<TcpStream, LengthDelimitedCodec>;

/// Client side of one metadata-server connection.
pub struct MdsClient {
    framed: MdsFramed,
    timeout: Duration,
}

impl MdsClient {
    pub async fn connect(node: &MdsNodeConfig, timeout: Duration) -> Result<Self, PeridotError> {
        let addr = format!("{}:{}", node.host, node.port);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| PeridotError::Timeout(format!("connect to MDS {addr}")))?
            .map_err(PeridotError::from)?;
        Ok(Self {
            framed: Framed::new(stream, LengthDelimitedCodec::new()),
            timeout,
        })
    }

    async fn call(&mut self, req: MdsRequest) -> Result<MdsResponse, PeridotError> {
        let bytes = bincode::encode_to_vec(&req, standard())?;
        tokio::time::timeout(self.timeout, self.framed.send(Bytes::from(bytes)))
            .await
            .map_err(|_| PeridotError::Timeout("MDS send".to_string()))?
            .map_err(PeridotError::from)?;
        let frame = tokio::time::timeout(self.timeout, self.framed.next())
            .await
            .map_err(|_| PeridotError::Timeout("MDS receive".to_string()))?
            .ok_or_else(|| PeridotError::ReplicationError("MDS closed connection".to_string()))?
            .map_err(PeridotError::from)?;
        let (resp, _) = bincode::decode_from_slice(&frame, standard())?;
        Ok(resp)
    }

    async fn expect_ok(&mut self, req: MdsRequest) -> Result<(), PeridotError> {
        match self.call(req).await? {
            MdsResponse::Ok => Ok(()),
            MdsResponse::Error(e) => Err(PeridotError::ReplicationError(e)),
            other => Err(PeridotError::Protocol(format!(
                "unexpected MDS response {other:?}"
            ))),
        }
    }

    pub async fn register(&mut self, ns: &Namespace) -> Result<(), PeridotError> {
        self.expect_ok(MdsRequest::Register {
            namespace: ns.to_string(),
        })
        .await
    }

    pub async fn append(&mut self, records: Vec<JournalRecord>) -> Result<(), PeridotError> {
        self.expect_ok(MdsRequest::Append { records }).await
    }

    pub async fn replay(&mut self, ns: &Namespace) -> Result<Vec<JournalRecord>, PeridotError> {
        match self
            .call(MdsRequest::Replay {
                namespace: ns.to_string(),
            })
            .await?
        {
            MdsResponse::Records(records) => Ok(records),
            MdsResponse::Error(e) => Err(PeridotError::ReplicationError(e)),
            other => Err(PeridotError::Protocol(format!(
                "unexpected MDS response {other:?}"
            ))),
        }
    }
}

/// Metadata store that mirrors mutations to remote journal replicas.
pub struct MirroredMetaDataStore {
    local: super::PagedMetaDataStore,
    ns: Namespace,
    nodes: Vec<MdsNodeConfig>,
    master: AtomicUsize,
    client: Mutex<Option<MdsClient>>,
    timeout: Duration,
    lagging: AtomicBool,
}

impl MirroredMetaDataStore {
    pub fn new(
        local: super::PagedMetaDataStore,
        ns: Namespace,
        nodes: Vec<MdsNodeConfig>,
        timeout: Duration,
    ) -> Self {
        Self {
            local,
            ns,
            nodes,
            master: AtomicUsize::new(0),
            client: Mutex::new(None),
            timeout,
            lagging: AtomicBool::new(false),
        }
    }

    pub fn master_node(&self) -> &MdsNodeConfig {
        &self.nodes[self.master.load(Ordering::Relaxed) % self.nodes.len()]
    }

    async fn connect_master(&self) -> Result<MdsClient, PeridotError> {
        let start = self.master.load(Ordering::Relaxed);
        let mut last_err = None;
        for i in 0..self.nodes.len() {
            let idx = (start + i) % self.nodes.len();
            let node = &self.nodes[idx];
            match MdsClient::connect(node, self.timeout).await {
                Ok(mut client) => match client.register(&self.ns).await {
                    Ok(()) => {
                        if idx != start {
                            info!(
                                "metadata master for {} moved to {}:{}",
                                self.ns, node.host, node.port
                            );
                            self.master.store(idx, Ordering::Relaxed);
                        }
                        return Ok(client);
                    }
                    Err(e) => last_err = Some(e),
                },
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err
            .unwrap_or_else(|| PeridotError::ReplicationError("no MDS nodes".to_string())))
    }

    /// Ships records to the master replica. Failure flags the mirror as
    /// lagging but never fails the caller.
    async fn forward(&self, records: Vec<JournalRecord>) {
        let mut guard = self.client.lock().await;
        for _ in 0..2 {
            if guard.is_none() {
                match self.connect_master().await {
                    Ok(client) => *guard = Some(client),
                    Err(e) => {
                        warn!("metadata mirror for {} unreachable: {}", self.ns, e);
                        self.lagging.store(true, Ordering::Relaxed);
                        return;
                    }
                }
            }
            let client = guard.as_mut().expect("connected above");
            match client.append(records.clone()).await {
                Ok(()) => return,
                Err(e) => {
                    warn!("metadata mirror append for {} failed: {}", self.ns, e);
                    // Drop the connection and let the retry re-elect.
                    *guard = None;
                    self.master.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        self.lagging.store(true, Ordering::Relaxed);
    }

    pub fn is_lagging(&self) -> bool {
        self.lagging.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MetaDataStore for MirroredMetaDataStore {
    async fn get(&self, addr: ClusterAddress) -> Result<Option<MetaDataEntry>, PeridotError> {
        self.local.get(addr).await
    }

    async fn multi_get(
        &self,
        addrs: &[ClusterAddress],
    ) -> Result<Vec<Option<MetaDataEntry>>, PeridotError> {
        self.local.multi_get(addrs).await
    }

    async fn multi_set(&self, batch: &MetaDataBatch) -> Result<(), PeridotError> {
        self.local.multi_set(batch).await?;
        let records = batch
            .iter()
            .map(|(addr, loc, hash)| JournalRecord::Set {
                addr: *addr,
                loc: *loc,
                hash: *hash,
            })
            .collect();
        self.forward(records).await;
        Ok(())
    }

    async fn cork(&self, cork: CorkId) -> Result<(), PeridotError> {
        self.local.cork(cork).await?;
        self.forward(vec![JournalRecord::Cork {
            id: cork.0.as_u128(),
        }])
        .await;
        Ok(())
    }

    async fn uncork_up_to(&self, cork: CorkId) -> Result<(), PeridotError> {
        self.local.uncork_up_to(cork).await?;
        self.forward(vec![JournalRecord::UncorkUpTo {
            id: cork.0.as_u128(),
        }])
        .await;
        Ok(())
    }

    async fn apply_relocations(
        &self,
        expected_scrub_id: ScrubId,
        relocations: &[Relocation],
    ) -> Result<ScrubId, PeridotError> {
        let next = self
            .local
            .apply_relocations(expected_scrub_id, relocations)
            .await?;
        // Relocations reach the replicas as plain sets of the new value.
        let mut records = Vec::with_capacity(relocations.len());
        for (addr, _, new_loc) in relocations {
            if let Some((_, hash)) = self.local.get(*addr).await? {
                records.push(JournalRecord::Set {
                    addr: *addr,
                    loc: *new_loc,
                    hash,
                });
            }
        }
        self.forward(records).await;
        Ok(next)
    }

    async fn clear(&self) -> Result<(), PeridotError> {
        self.local.clear().await
    }

    /// Replays the master's journal into the local store, converging a
    /// lagging replica.
    async fn catch_up(&self, dry_run: bool) -> Result<u64, PeridotError> {
        let mut client = self.connect_master().await?;
        let records = client.replay(&self.ns).await?;
        let count = records.len() as u64;
        if dry_run {
            return Ok(count);
        }
        self.local.clear().await?;
        for record in records {
            match record {
                JournalRecord::Set { addr, loc, hash } => {
                    self.local.multi_set(&vec![(addr, loc, hash)]).await?;
                }
                JournalRecord::Cork { id } => {
                    self.local.cork(CorkId(Uuid::from_u128(id))).await?;
                }
                JournalRecord::UncorkUpTo { id } => {
                    self.local
                        .uncork_up_to(CorkId(Uuid::from_u128(id)))
                        .await?;
                }
            }
        }
        self.lagging.store(false, Ordering::Relaxed);
        Ok(count)
    }

    fn scrub_id(&self) -> ScrubId {
        self.local.scrub_id()
    }

    fn set_scrub_id(&self, id: ScrubId) {
        self.local.set_scrub_id(id)
    }

    fn stats(&self) -> MetaDataStoreStats {
        self.local.stats()
    }
}

/// A metadata journal server: accepts registrations and appends, and
/// replays a namespace's journal on demand. Journals persist under the
/// root directory, one file per namespace.
pub struct MdsServer {
    root: PathBuf,
    listener: TcpListener,
    journals: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl MdsServer {
    pub async fn bind(addr: &str, root: PathBuf) -> Result<Self, PeridotError> {
        tokio::fs::create_dir_all(&root).await?;
        let listener = TcpListener::bind(addr).await?;
        info!("MDS server listening on {}", listener.local_addr()?);
        Ok(Self {
            root,
            listener,
            journals: Arc::new(DashMap::new()),
        })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, PeridotError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!("MDS connection from {}", peer);
                            let root = self.root.clone();
                            let journals = self.journals.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_mds_connection(stream, root, journals).await {
                                    debug!("MDS connection from {} ended: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => warn!("MDS accept failed: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("MDS server shutting down.");
                    return;
                }
            }
        }
    }
}

async fn handle_mds_connection(
    stream: TcpStream,
    root: PathBuf,
    journals: Arc<DashMap<String, Arc<Mutex<()>>>>,
) -> Result<(), PeridotError> {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    let mut namespace: Option<String> = None;

    while let Some(frame) = framed.next().await {
        let frame = frame?;
        let (req, _): (MdsRequest, _) = bincode::decode_from_slice(&frame, standard())?;
        let resp = match req {
            MdsRequest::Ping => MdsResponse::Ok,
            MdsRequest::Register { namespace: ns } => {
                journals
                    .entry(ns.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(())));
                namespace = Some(ns);
                MdsResponse::Ok
            }
            MdsRequest::Append { records } => match &namespace {
                Some(ns) => {
                    let lock = journals
                        .entry(ns.clone())
                        .or_insert_with(|| Arc::new(Mutex::new(())))
                        .clone();
                    let _guard = lock.lock().await;
                    match append_journal(&root, ns, &records).await {
                        Ok(()) => MdsResponse::Ok,
                        Err(e) => MdsResponse::Error(e.to_string()),
                    }
                }
                None => MdsResponse::Error("not registered".to_string()),
            },
            MdsRequest::Replay { namespace: ns } => match read_journal(&root, &ns).await {
                Ok(records) => MdsResponse::Records(records),
                Err(e) => MdsResponse::Error(e.to_string()),
            },
        };
        let bytes = bincode::encode_to_vec(&resp, standard())?;
        framed.send(Bytes::from(bytes)).await?;
    }
    Ok(())
}

fn journal_path(root: &PathBuf, ns: &str) -> PathBuf {
    root.join(format!("{ns}.journal"))
}

async fn append_journal(
    root: &PathBuf,
    ns: &str,
    records: &[JournalRecord],
) -> Result<(), PeridotError> {
    use tokio::io::AsyncWriteExt;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(journal_path(root, ns))
        .await?;
    let mut buf = Vec::new();
    for record in records {
        let encoded = bincode::encode_to_vec(record, standard())?;
        buf.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        buf.extend_from_slice(&encoded);
    }
    file.write_all(&buf).await?;
    file.sync_data().await?;
    Ok(())
}

async fn read_journal(root: &PathBuf, ns: &str) -> Result<Vec<JournalRecord>, PeridotError> {
    let bytes = match tokio::fs::read(journal_path(root, ns)).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut records = Vec::new();
    let mut off = 0usize;
    while off + 4 <= bytes.len() {
        let len = u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap()) as usize;
        off += 4;
        if off + len > bytes.len() {
            // Torn tail after a crash; everything before it is valid.
            break;
        }
        let (record, _) = bincode::decode_from_slice(&bytes[off..off + len], standard())?;
        records.push(record);
        off += len;
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ScoName;

    #[tokio::test]
    async fn mirror_survives_missing_replica_and_catches_up() {
        let dir = tempfile::tempdir().unwrap();
        let server = MdsServer::bind("127.0.0.1:0", dir.path().to_path_buf())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (shutdown_tx, _) = broadcast::channel(1);
        tokio::spawn(server.run(shutdown_tx.subscribe()));

        let ns = Namespace::new("vol");
        let nodes = vec![
            // Dead node first: the store must fail over to the live one.
            MdsNodeConfig {
                host: "127.0.0.1".to_string(),
                port: 1,
            },
            MdsNodeConfig {
                host: addr.ip().to_string(),
                port: addr.port(),
            },
        ];
        let store = MirroredMetaDataStore::new(
            super::super::PagedMetaDataStore::new(8, 4),
            ns.clone(),
            nodes,
            Duration::from_secs(2),
        );

        let cork = CorkId::new();
        store.cork(cork).await.unwrap();
        store
            .multi_set(&vec![(
                ClusterAddress(3),
                ClusterLocation::new(ScoName::new(1, 0), 0),
                ClusterHash(9),
            )])
            .await
            .unwrap();
        store.uncork_up_to(cork).await.unwrap();

        // The journal on the replica carries everything needed to rebuild.
        let replayed = store.catch_up(true).await.unwrap();
        assert_eq!(replayed, 3);

        store.catch_up(false).await.unwrap();
        let entry = store.get(ClusterAddress(3)).await.unwrap().unwrap();
        assert_eq!(entry.0, ClusterLocation::new(ScoName::new(1, 0), 0));

        drop(shutdown_tx);
    }
}
