// src/core/dtl/mod.rs

//! The distributed transaction log: a replication cache holding
//! not-yet-uploaded writes on a peer node.
//!
//! The client forwards every write's `(address, location, payload)` to
//! the peer before — in synchronous mode — the local write is
//! acknowledged. Once a SCO is safe on the backend the peer's log is
//! trimmed up to it. After a crash, replaying the peer's log from the
//! last known-synced SCO reconstructs exactly the writes the backend has
//! not seen yet.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::DtlClient;
pub use server::DtlServer;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// How the client waits for the peer.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
pub enum DtlMode {
    /// The peer must acknowledge before the local write is acked.
    Synchronous,
    /// Entries are forwarded in the background.
    #[default]
    Asynchronous,
}

/// Replication health of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum VolumeFailoverState {
    /// Peer configured and in sync.
    #[strum(serialize = "OK_SYNC")]
    OkSync,
    /// No peer configured; running without a replication cache.
    #[strum(serialize = "OK_STANDALONE")]
    OkStandalone,
    /// Peer reachable again; the log is being brought up to date.
    #[strum(serialize = "KETCHUP")]
    Ketchup,
    /// Peer unreachable; writes continue locally.
    #[strum(serialize = "DEGRADED")]
    Degraded,
}

/// Peer endpoint a volume replicates to. `None` anywhere in the config
/// means standalone.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DtlPeer {
    pub host: String,
    pub port: u16,
    pub mode: DtlMode,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn failover_state_string_roundtrip() {
        for state in [
            VolumeFailoverState::OkSync,
            VolumeFailoverState::OkStandalone,
            VolumeFailoverState::Ketchup,
            VolumeFailoverState::Degraded,
        ] {
            let s = state.to_string();
            assert_eq!(VolumeFailoverState::from_str(&s).unwrap(), state);
        }
        assert_eq!(VolumeFailoverState::OkSync.to_string(), "OK_SYNC");
    }
}
