// src/core/dtl/protocol.rs

//! Framed request/response protocol between DTL client and server.
//!
//! Frames are length-delimited bincode. One request yields exactly one
//! response; there is no pipelining, which keeps the replay path and the
//! single-writer-per-namespace rule trivial to enforce.

use crate::core::errors::PeridotError;
use crate::core::types::{ClusterAddress, ClusterLocation, ScoName};
use bincode::config::standard;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// One replicated write descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct DtlEntry {
    pub addr: ClusterAddress,
    pub loc: ClusterLocation,
}

#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum DtlRequest {
    /// Claims the namespace. A later `Register` from elsewhere replaces
    /// this writer.
    Register {
        namespace: String,
        cluster_size: u32,
    },
    /// Appends entries with their concatenated cluster payloads.
    AddEntries {
        entries: Vec<DtlEntry>,
        payload: Vec<u8>,
    },
    Flush,
    Clear,
    /// Streams back everything logged for one SCO.
    GetSco { sco: ScoName },
    /// Drops log fragments for SCOs up to and including `sco`.
    RemoveUpTo { sco: ScoName },
}

#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum DtlResponse {
    Ok,
    ScoData {
        entries: Vec<DtlEntry>,
        payload: Vec<u8>,
    },
    Error { message: String },
}

pub type DtlFramed<S> = Framed<S, LengthDelimitedCodec>;

pub fn framed<S: AsyncRead + AsyncWrite>(stream: S) -> DtlFramed<S> {
    Framed::new(stream, LengthDelimitedCodec::new())
}

pub async fn send_message<S, M>(framed: &mut DtlFramed<S>, msg: &M) -> Result<(), PeridotError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    M: bincode::Encode,
{
    let bytes = bincode::encode_to_vec(msg, standard())?;
    framed.send(Bytes::from(bytes)).await?;
    Ok(())
}

pub async fn recv_message<S, M>(framed: &mut DtlFramed<S>) -> Result<Option<M>, PeridotError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    M: bincode::Decode<()>,
{
    match framed.next().await {
        Some(frame) => {
            let frame = frame?;
            let (msg, _) = bincode::decode_from_slice(&frame, standard())?;
            Ok(Some(msg))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ScoName;

    #[test]
    fn request_roundtrip() {
        let req = DtlRequest::AddEntries {
            entries: vec![DtlEntry {
                addr: ClusterAddress(7),
                loc: ClusterLocation::new(ScoName::new(3, 0), 2),
            }],
            payload: vec![0xaa; 16],
        };
        let bytes = bincode::encode_to_vec(&req, standard()).unwrap();
        let (decoded, _): (DtlRequest, _) =
            bincode::decode_from_slice(&bytes, standard()).unwrap();
        assert_eq!(decoded, req);
    }
}
