// src/core/control/mod.rs

//! Client surface of the control plane this engine consumes.
//!
//! The control plane itself lives elsewhere; what the engine needs is
//! the call convention: line-delimited JSON requests carrying a cluster
//! id, responses that are a value, a numeric error code, or a redirect
//! `{host, port}` pointing at the node currently owning the volume. The
//! client follows at most `max_redirects` hops and then surfaces
//! `MaxRedirectsExceeded` with the terminal address.

use crate::core::errors::PeridotError;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::debug;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ControlRequest {
    pub cluster_id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlResponse {
    Ok { value: Value },
    Redirect { host: String, port: u16 },
    Error { code: u32, message: String },
}

pub struct ControlClient {
    cluster_id: String,
    max_redirects: u32,
    request_timeout: Duration,
}

impl ControlClient {
    pub fn new(cluster_id: String, max_redirects: u32, request_timeout: Duration) -> Self {
        Self {
            cluster_id,
            max_redirects,
            request_timeout,
        }
    }

    /// Performs one control-plane call, following redirects up to the
    /// configured bound.
    pub async fn call(
        &self,
        host: &str,
        port: u16,
        method: &str,
        params: Value,
    ) -> Result<Value, PeridotError> {
        let mut host = host.to_string();
        let mut port = port;
        // max_redirects redirects allow max_redirects + 1 round-trips.
        for hop in 0..=self.max_redirects {
            match self.round_trip(&host, port, method, params.clone()).await? {
                ControlResponse::Ok { value } => return Ok(value),
                ControlResponse::Error { code, message } => {
                    return Err(PeridotError::from_wire_code(code, message));
                }
                ControlResponse::Redirect {
                    host: next_host,
                    port: next_port,
                } => {
                    debug!(
                        "control call '{}' redirected to {}:{} (hop {})",
                        method,
                        next_host,
                        next_port,
                        hop + 1
                    );
                    host = next_host;
                    port = next_port;
                }
            }
        }
        Err(PeridotError::MaxRedirectsExceeded { host, port })
    }

    async fn round_trip(
        &self,
        host: &str,
        port: u16,
        method: &str,
        params: Value,
    ) -> Result<ControlResponse, PeridotError> {
        let addr = format!("{host}:{port}");
        let stream = tokio::time::timeout(self.request_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| PeridotError::Timeout(format!("connect to {addr}")))?
            .map_err(PeridotError::from)?;
        let mut framed = Framed::new(stream, LinesCodec::new());

        let request = ControlRequest {
            cluster_id: self.cluster_id.clone(),
            method: method.to_string(),
            params,
        };
        let line = serde_json::to_string(&request)?;
        tokio::time::timeout(self.request_timeout, framed.send(line))
            .await
            .map_err(|_| PeridotError::Timeout("control send".to_string()))?
            .map_err(|e| PeridotError::Protocol(e.to_string()))?;

        let reply = tokio::time::timeout(self.request_timeout, framed.next())
            .await
            .map_err(|_| PeridotError::Timeout("control receive".to_string()))?
            .ok_or_else(|| PeridotError::Protocol("control peer closed".to_string()))?
            .map_err(|e| PeridotError::Protocol(e.to_string()))?;
        Ok(serde_json::from_str(&reply)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// A control endpoint that always redirects to itself.
    async fn redirect_loop_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let mut framed = Framed::new(stream, LinesCodec::new());
                if let Some(Ok(_line)) = framed.next().await {
                    let resp = ControlResponse::Redirect {
                        host: addr.ip().to_string(),
                        port: addr.port(),
                    };
                    let _ = framed.send(serde_json::to_string(&resp).unwrap()).await;
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn redirect_loop_is_bounded() {
        let addr = redirect_loop_server().await;
        let client = ControlClient::new("cluster".to_string(), 2, Duration::from_secs(2));
        let err = client
            .call(&addr.ip().to_string(), addr.port(), "volume_info", Value::Null)
            .await
            .unwrap_err();
        match err {
            PeridotError::MaxRedirectsExceeded { host, port } => {
                assert_eq!(host, addr.ip().to_string());
                assert_eq!(port, addr.port());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn error_codes_map_back() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, LinesCodec::new());
            let _ = framed.next().await;
            let resp = ControlResponse::Error {
                code: 3,
                message: "nope".to_string(),
            };
            let _ = framed.send(serde_json::to_string(&resp).unwrap()).await;
        });

        let client = ControlClient::new("cluster".to_string(), 2, Duration::from_secs(2));
        let err = client
            .call(&addr.ip().to_string(), addr.port(), "restore", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, PeridotError::SnapshotNotFound(_)));
    }
}
