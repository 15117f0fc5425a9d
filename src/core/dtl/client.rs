// src/core/dtl/client.rs

//! Client side of the DTL: forwards writes to the replication peer.
//!
//! In synchronous mode every `add_entries` waits for the peer's ack
//! before returning, so a write is durable remotely before it is
//! acknowledged locally. In asynchronous mode entries flow through a
//! bounded ring drained by a forwarder task; a full ring blocks the
//! producer rather than dropping entries.
//!
//! Any peer failure marks the client degraded and fires the volume's
//! degraded callback exactly once per outage; the volume then keeps
//! writing locally and periodically asks for a reconnect.

use super::protocol::{DtlEntry, DtlRequest, DtlResponse, framed, recv_message, send_message};
use super::{DtlMode, DtlPeer};
use crate::core::errors::PeridotError;
use crate::core::metrics;
use crate::core::types::{ClusterAddress, ClusterLocation, Namespace, ScoName};
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{info, warn};

pub type DegradedCallback = Arc<dyn Fn() + Send + Sync>;

type Conn = super::protocol::DtlFramed<TcpStream>;

enum ForwardItem {
    Entries(Vec<DtlEntry>, Bytes),
    Flush(oneshot::Sender<Result<(), PeridotError>>),
    Clear(oneshot::Sender<Result<(), PeridotError>>),
    RemoveUpTo(ScoName),
}

pub struct DtlClient {
    ns: Namespace,
    cluster_size: u32,
    max_entries: usize,
    request_timeout: parking_lot::RwLock<Duration>,
    peer: parking_lot::RwLock<Option<DtlPeer>>,
    degraded_cb: parking_lot::RwLock<Option<DegradedCallback>>,
    degraded: AtomicBool,
    /// Synchronous-mode connection.
    conn: Mutex<Option<Conn>>,
    /// Asynchronous-mode ring into the forwarder task.
    ring_tx: Mutex<Option<mpsc::Sender<ForwardItem>>>,
}

impl DtlClient {
    pub fn new(
        ns: Namespace,
        cluster_size: u32,
        max_entries: usize,
        request_timeout: Duration,
    ) -> Self {
        Self {
            ns,
            cluster_size,
            max_entries,
            request_timeout: parking_lot::RwLock::new(request_timeout),
            peer: parking_lot::RwLock::new(None),
            degraded_cb: parking_lot::RwLock::new(None),
            degraded: AtomicBool::new(false),
            conn: Mutex::new(None),
            ring_tx: Mutex::new(None),
        }
    }

    /// Registers the callback fired when the peer becomes unreachable.
    pub fn initialize(&self, cb: DegradedCallback) {
        *self.degraded_cb.write() = Some(cb);
    }

    pub fn mode(&self) -> Option<DtlMode> {
        self.peer.read().as_ref().map(|p| p.mode)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn set_request_timeout(&self, timeout: Duration) {
        *self.request_timeout.write() = timeout;
    }

    pub fn request_timeout(&self) -> Duration {
        *self.request_timeout.read()
    }

    fn mark_degraded(&self, why: &str) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            warn!("DTL peer for {} degraded: {}", self.ns, why);
            if let Some(cb) = self.degraded_cb.read().clone() {
                cb();
            }
        }
    }

    async fn connect(self: &Arc<Self>, peer: &DtlPeer) -> Result<Conn, PeridotError> {
        let timeout = self.request_timeout();
        let addr = format!("{}:{}", peer.host, peer.port);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| PeridotError::Timeout(format!("connect to DTL peer {addr}")))?
            .map_err(PeridotError::from)?;
        let mut conn = framed(stream);
        let register = DtlRequest::Register {
            namespace: self.ns.to_string(),
            cluster_size: self.cluster_size,
        };
        call(&mut conn, &register, timeout).await?;
        Ok(conn)
    }

    /// Reconfigures the peer. `None` switches the volume to standalone.
    /// With a peer, the connection is (re)established here; success
    /// clears the degraded flag.
    pub async fn set_peer(self: &Arc<Self>, peer: Option<DtlPeer>) -> Result<(), PeridotError> {
        // Tear down whatever is running.
        *self.conn.lock().await = None;
        *self.ring_tx.lock().await = None;
        *self.peer.write() = peer.clone();
        self.degraded.store(false, Ordering::SeqCst);

        let Some(peer) = peer else {
            info!("DTL for {} now standalone", self.ns);
            return Ok(());
        };

        match peer.mode {
            DtlMode::Synchronous => {
                let conn = self.connect(&peer).await?;
                *self.conn.lock().await = Some(conn);
            }
            DtlMode::Asynchronous => {
                let conn = self.connect(&peer).await?;
                let (tx, rx) = mpsc::channel(self.max_entries.max(1));
                let client = self.clone();
                tokio::spawn(client.forwarder_loop(conn, rx));
                *self.ring_tx.lock().await = Some(tx);
            }
        }
        info!(
            "DTL for {} connected to {}:{} ({})",
            self.ns, peer.host, peer.port, peer.mode
        );
        Ok(())
    }

    /// Attempts to re-establish a degraded peer. Returns `true` when the
    /// peer is healthy afterwards.
    pub async fn try_reconnect(self: &Arc<Self>) -> bool {
        let peer = self.peer.read().clone();
        match peer {
            Some(peer) => self.set_peer(Some(peer)).await.is_ok(),
            None => false,
        }
    }

    async fn forwarder_loop(self: Arc<Self>, mut conn: Conn, mut rx: mpsc::Receiver<ForwardItem>) {
        while let Some(item) = rx.recv().await {
            let timeout = self.request_timeout();
            let result = match item {
                ForwardItem::Entries(entries, payload) => {
                    let req = DtlRequest::AddEntries {
                        entries,
                        payload: payload.to_vec(),
                    };
                    call(&mut conn, &req, timeout).await.map(|_| ())
                }
                ForwardItem::Flush(ack) => {
                    let r = call(&mut conn, &DtlRequest::Flush, timeout).await.map(|_| ());
                    let _ = ack.send(r.clone());
                    r
                }
                ForwardItem::Clear(ack) => {
                    let r = call(&mut conn, &DtlRequest::Clear, timeout).await.map(|_| ());
                    let _ = ack.send(r.clone());
                    r
                }
                ForwardItem::RemoveUpTo(sco) => call(&mut conn, &DtlRequest::RemoveUpTo { sco }, timeout)
                    .await
                    .map(|_| ()),
            };
            if let Err(e) = result {
                self.mark_degraded(&e.to_string());
                return;
            }
        }
    }

    /// Forwards one write. Standalone configurations return immediately;
    /// synchronous mode returns only after the peer acked.
    pub async fn add_entries(
        self: &Arc<Self>,
        entries: Vec<DtlEntry>,
        payload: Bytes,
    ) -> Result<(), PeridotError> {
        let Some(mode) = self.mode() else {
            return Ok(());
        };
        if self.is_degraded() {
            return Err(PeridotError::ReplicationError(
                "DTL peer is degraded".to_string(),
            ));
        }
        metrics::DTL_ENTRIES_FORWARDED_TOTAL.inc_by(entries.len() as f64);
        match mode {
            DtlMode::Synchronous => {
                let req = DtlRequest::AddEntries {
                    entries,
                    payload: payload.to_vec(),
                };
                let timeout = self.request_timeout();
                let mut guard = self.conn.lock().await;
                let Some(conn) = guard.as_mut() else {
                    self.mark_degraded("no connection");
                    return Err(PeridotError::ReplicationError(
                        "DTL peer not connected".to_string(),
                    ));
                };
                match call(conn, &req, timeout).await {
                    Ok(_) => Ok(()),
                    Err(e) => {
                        *guard = None;
                        self.mark_degraded(&e.to_string());
                        Err(e)
                    }
                }
            }
            DtlMode::Asynchronous => {
                let tx = self.ring_tx.lock().await.clone();
                match tx {
                    Some(tx) => tx
                        .send(ForwardItem::Entries(entries, payload))
                        .await
                        .map_err(|_| {
                            PeridotError::ReplicationError("DTL forwarder stopped".to_string())
                        }),
                    None => Err(PeridotError::ReplicationError(
                        "DTL forwarder not running".to_string(),
                    )),
                }
            }
        }
    }

    async fn control_call(self: &Arc<Self>, req: DtlRequest) -> Result<(), PeridotError> {
        let Some(mode) = self.mode() else {
            return Ok(());
        };
        if self.is_degraded() {
            return Ok(());
        }
        match mode {
            DtlMode::Synchronous => {
                let timeout = self.request_timeout();
                let mut guard = self.conn.lock().await;
                if let Some(conn) = guard.as_mut() {
                    if let Err(e) = call(conn, &req, timeout).await {
                        *guard = None;
                        self.mark_degraded(&e.to_string());
                        return Err(e);
                    }
                }
                Ok(())
            }
            DtlMode::Asynchronous => {
                let item = match req {
                    DtlRequest::Flush => {
                        let (ack_tx, ack_rx) = oneshot::channel();
                        let tx = self.ring_tx.lock().await.clone();
                        if let Some(tx) = tx {
                            tx.send(ForwardItem::Flush(ack_tx)).await.map_err(|_| {
                                PeridotError::ReplicationError(
                                    "DTL forwarder stopped".to_string(),
                                )
                            })?;
                            return ack_rx.await.map_err(|_| {
                                PeridotError::ReplicationError(
                                    "DTL forwarder stopped".to_string(),
                                )
                            })?;
                        }
                        return Ok(());
                    }
                    DtlRequest::Clear => {
                        let (ack_tx, ack_rx) = oneshot::channel();
                        let tx = self.ring_tx.lock().await.clone();
                        if let Some(tx) = tx {
                            tx.send(ForwardItem::Clear(ack_tx)).await.map_err(|_| {
                                PeridotError::ReplicationError(
                                    "DTL forwarder stopped".to_string(),
                                )
                            })?;
                            return ack_rx.await.map_err(|_| {
                                PeridotError::ReplicationError(
                                    "DTL forwarder stopped".to_string(),
                                )
                            })?;
                        }
                        return Ok(());
                    }
                    DtlRequest::RemoveUpTo { sco } => ForwardItem::RemoveUpTo(sco),
                    _ => {
                        return Err(PeridotError::Internal(
                            "not a DTL control request".to_string(),
                        ));
                    }
                };
                let tx = self.ring_tx.lock().await.clone();
                if let Some(tx) = tx {
                    let _ = tx.send(item).await;
                }
                Ok(())
            }
        }
    }

    /// Waits until everything forwarded so far is durable on the peer.
    pub async fn flush(self: &Arc<Self>) -> Result<(), PeridotError> {
        self.control_call(DtlRequest::Flush).await
    }

    /// Drops the peer's whole log for this namespace.
    pub async fn clear(self: &Arc<Self>) -> Result<(), PeridotError> {
        self.control_call(DtlRequest::Clear).await
    }

    /// Lets the peer trim log fragments for SCOs that are safe on the
    /// backend.
    pub async fn remove_up_to(self: &Arc<Self>, sco: ScoName) -> Result<(), PeridotError> {
        self.control_call(DtlRequest::RemoveUpTo { sco }).await
    }

    /// Replays one SCO's worth of peer log through `processor`. Returns
    /// the number of clusters delivered.
    pub async fn get_sco_from_failover<F>(
        self: &Arc<Self>,
        sco: ScoName,
        mut processor: F,
    ) -> Result<u64, PeridotError>
    where
        F: FnMut(ClusterAddress, ClusterLocation, &[u8]),
    {
        let Some(peer) = self.peer.read().clone() else {
            return Ok(0);
        };
        let timeout = self.request_timeout();
        let mut conn = self.connect(&peer).await?;
        match call(&mut conn, &DtlRequest::GetSco { sco }, timeout).await? {
            DtlResponse::ScoData { entries, payload } => {
                let cs = self.cluster_size as usize;
                if payload.len() != entries.len() * cs {
                    return Err(PeridotError::Protocol(format!(
                        "DTL SCO data length mismatch: {} entries, {} payload bytes",
                        entries.len(),
                        payload.len()
                    )));
                }
                for (i, entry) in entries.iter().enumerate() {
                    processor(entry.addr, entry.loc, &payload[i * cs..(i + 1) * cs]);
                }
                Ok(entries.len() as u64)
            }
            other => Err(PeridotError::Protocol(format!(
                "unexpected DTL response {other:?}"
            ))),
        }
    }
}

/// One request/response exchange with a timeout.
async fn call(
    conn: &mut Conn,
    req: &DtlRequest,
    timeout: Duration,
) -> Result<DtlResponse, PeridotError> {
    tokio::time::timeout(timeout, send_message(conn, req))
        .await
        .map_err(|_| PeridotError::Timeout("DTL send".to_string()))??;
    let resp = tokio::time::timeout(timeout, recv_message::<_, DtlResponse>(conn))
        .await
        .map_err(|_| PeridotError::Timeout("DTL receive".to_string()))??
        .ok_or_else(|| PeridotError::ReplicationError("DTL peer closed".to_string()))?;
    if let DtlResponse::Error { message } = resp {
        return Err(PeridotError::ReplicationError(message));
    }
    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dtl::DtlServer;
    use tokio::sync::broadcast;

    async fn start_server(dir: &tempfile::TempDir) -> (std::net::SocketAddr, broadcast::Sender<()>) {
        let server = DtlServer::bind("127.0.0.1:0", dir.path().join("dtl"), 4)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (tx, _) = broadcast::channel(1);
        tokio::spawn(server.run(tx.subscribe()));
        (addr, tx)
    }

    fn entry(addr: u64, sco: u32, offset: u16) -> DtlEntry {
        DtlEntry {
            addr: ClusterAddress(addr),
            loc: ClusterLocation::new(ScoName::new(sco, 0), offset),
        }
    }

    #[tokio::test]
    async fn synchronous_roundtrip_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _shutdown) = start_server(&dir).await;

        let client = Arc::new(DtlClient::new(
            Namespace::new("vol"),
            8,
            16,
            Duration::from_secs(5),
        ));
        client
            .set_peer(Some(DtlPeer {
                host: addr.ip().to_string(),
                port: addr.port(),
                mode: DtlMode::Synchronous,
            }))
            .await
            .unwrap();

        client
            .add_entries(
                vec![entry(0, 1, 0), entry(1, 1, 1)],
                Bytes::from(vec![0xab; 16]),
            )
            .await
            .unwrap();
        client.flush().await.unwrap();

        let mut seen = Vec::new();
        let n = client
            .get_sco_from_failover(ScoName::new(1, 0), |addr, loc, payload| {
                seen.push((addr, loc, payload.to_vec()));
            })
            .await
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(seen[0].0, ClusterAddress(0));
        assert_eq!(seen[1].2, vec![0xab; 8]);

        // Trimming drops the fragment.
        client.remove_up_to(ScoName::new(1, 0)).await.unwrap();
        let n = client
            .get_sco_from_failover(ScoName::new(1, 0), |_, _, _| {})
            .await
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn peer_failure_marks_degraded_and_fires_callback() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, shutdown) = start_server(&dir).await;

        let client = Arc::new(DtlClient::new(
            Namespace::new("vol"),
            8,
            16,
            Duration::from_millis(500),
        ));
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        client.initialize(Arc::new(move || {
            fired_clone.store(true, Ordering::SeqCst);
        }));
        client
            .set_peer(Some(DtlPeer {
                host: addr.ip().to_string(),
                port: addr.port(),
                mode: DtlMode::Synchronous,
            }))
            .await
            .unwrap();

        // Kill the peer.
        drop(shutdown);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = client
            .add_entries(vec![entry(0, 1, 0)], Bytes::from(vec![0u8; 8]))
            .await;
        assert!(err.is_err());
        assert!(client.is_degraded());
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn standalone_is_a_no_op() {
        let client = Arc::new(DtlClient::new(
            Namespace::new("vol"),
            8,
            16,
            Duration::from_secs(1),
        ));
        client
            .add_entries(vec![entry(0, 1, 0)], Bytes::from(vec![0u8; 8]))
            .await
            .unwrap();
        client.flush().await.unwrap();
    }
}
