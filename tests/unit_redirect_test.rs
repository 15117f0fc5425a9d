// tests/unit_redirect_test.rs

//! Control-plane redirect following is bounded by max_redirects.

use futures::{SinkExt, StreamExt};
use peridot::PeridotError;
use peridot::core::control::{ControlClient, ControlResponse};
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::codec::{Framed, LinesCodec};

/// A control endpoint that answers every call with a redirect to itself.
async fn self_redirecting_endpoint() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let redirect = ControlResponse::Redirect {
                host: addr.ip().to_string(),
                port: addr.port(),
            };
            // One task per hop; each connection gets its own redirect.
            tokio::spawn(async move {
                let mut framed = Framed::new(stream, LinesCodec::new());
                while let Some(Ok(_line)) = framed.next().await {
                    let reply = serde_json::to_string(&redirect).unwrap();
                    if framed.send(reply).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    addr
}

#[tokio::test]
async fn redirect_loop_surfaces_max_redirects_exceeded() {
    let addr = self_redirecting_endpoint().await;
    let client = ControlClient::new("cluster-1".to_string(), 2, Duration::from_secs(2));

    let err = client
        .call(
            &addr.ip().to_string(),
            addr.port(),
            "volume_info",
            Value::String("v1".to_string()),
        )
        .await
        .unwrap_err();

    // The terminal hop's address rides with the error.
    match err {
        PeridotError::MaxRedirectsExceeded { host, port } => {
            assert_eq!(host, addr.ip().to_string());
            assert_eq!(port, addr.port());
        }
        other => panic!("expected MaxRedirectsExceeded, got {other}"),
    }
}

#[tokio::test]
async fn successful_call_needs_no_redirects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, LinesCodec::new());
        let _ = framed.next().await;
        let reply = ControlResponse::Ok {
            value: serde_json::json!({"halted": false}),
        };
        let _ = framed.send(serde_json::to_string(&reply).unwrap()).await;
    });

    let client = ControlClient::new("cluster-1".to_string(), 2, Duration::from_secs(2));
    let value = client
        .call(&addr.ip().to_string(), addr.port(), "volume_info", Value::Null)
        .await
        .unwrap();
    assert_eq!(value["halted"], Value::Bool(false));
}
