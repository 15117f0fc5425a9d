// src/core/errors.rs

//! Defines the primary error type for the entire engine.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the engine.
/// Using `thiserror` allows for clean error definitions and automatic `From`
/// trait implementations.
#[derive(Error, Debug, Clone)]
pub enum PeridotError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Object '{0}' not found")]
    ObjectNotFound(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Snapshot '{0}' not found")]
    SnapshotNotFound(String),

    #[error("Object '{0}' already exists")]
    FileExists(String),

    #[error("Insufficient resources: {0}")]
    InsufficientResources(String),

    #[error("Previous snapshot '{0}' not yet on the backend")]
    PreviousSnapshotNotOnBackend(String),

    #[error("Object '{0}' still has children")]
    ObjectStillHasChildren(String),

    #[error("Snapshot metadata exceeds {max} bytes (got {got})")]
    SnapshotMetadataTooLarge { got: usize, max: usize },

    #[error("Volume '{0}' is halted")]
    VolumeHalted(String),

    #[error("Volume '{0}' is a template and read-only")]
    VolumeIsTemplate(String),

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Replication error: {0}")]
    ReplicationError(String),

    #[error("Backend error: {0}")]
    BackendError(String),

    #[error("Checksum mismatch on object '{0}'")]
    ChecksumMismatch(String),

    #[error("Stale scrub result: expected scrub id {expected}, got {got}")]
    StaleScrubResult { expected: u64, got: u64 },

    #[error("Maximum number of redirects exceeded; last hop {host}:{port}")]
    MaxRedirectsExceeded { host: String, port: u16 },

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Command not allowed in the current state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PeridotError {
    /// Numeric error code used on the wire by the control-plane surface.
    pub fn wire_code(&self) -> u32 {
        match self {
            PeridotError::ObjectNotFound(_) => 1,
            PeridotError::InvalidOperation(_) | PeridotError::VolumeIsTemplate(_) => 2,
            PeridotError::SnapshotNotFound(_) => 3,
            PeridotError::FileExists(_) => 4,
            PeridotError::InsufficientResources(_) => 5,
            PeridotError::PreviousSnapshotNotOnBackend(_) => 6,
            PeridotError::ObjectStillHasChildren(_) => 7,
            _ => 127,
        }
    }

    /// Reconstructs an error from a wire code and message, for the client
    /// side of the control-plane surface.
    pub fn from_wire_code(code: u32, msg: String) -> Self {
        match code {
            1 => PeridotError::ObjectNotFound(msg),
            2 => PeridotError::InvalidOperation(msg),
            3 => PeridotError::SnapshotNotFound(msg),
            4 => PeridotError::FileExists(msg),
            5 => PeridotError::InsufficientResources(msg),
            6 => PeridotError::PreviousSnapshotNotOnBackend(msg),
            7 => PeridotError::ObjectStillHasChildren(msg),
            _ => PeridotError::Internal(msg),
        }
    }

    /// Transient errors may be retried with backoff; state is unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self, PeridotError::Transient(_) | PeridotError::Timeout(_))
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for PeridotError {
    fn from(e: std::io::Error) -> Self {
        PeridotError::Io(Arc::new(e))
    }
}

impl From<uuid::Error> for PeridotError {
    fn from(e: uuid::Error) -> Self {
        PeridotError::Internal(format!("Failed to parse UUID: {e}"))
    }
}

impl From<serde_json::Error> for PeridotError {
    fn from(e: serde_json::Error) -> Self {
        PeridotError::Internal(format!("JSON serialization/deserialization error: {e}"))
    }
}

impl From<bincode::error::EncodeError> for PeridotError {
    fn from(e: bincode::error::EncodeError) -> Self {
        PeridotError::Protocol(format!("encode error: {e}"))
    }
}

impl From<bincode::error::DecodeError> for PeridotError {
    fn from(e: bincode::error::DecodeError) -> Self {
        PeridotError::Protocol(format!("decode error: {e}"))
    }
}

impl From<String> for PeridotError {
    fn from(s: String) -> Self {
        PeridotError::Internal(s)
    }
}
