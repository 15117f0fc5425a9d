// src/core/backend/mod.rs

//! The narrow contract over the object-store backend.
//!
//! A backend hosts namespaces of opaque objects supporting per-object
//! put/get/delete with optional CRC-32 verification and overwrite
//! semantics. Everything the engine persists — SCOs, TLogs, the
//! `snapshots` manifest, scrub artifacts, the ownership lock — goes
//! through this trait.

mod local;
mod multi;
pub mod pipeline;

pub use local::LocalBackend;
pub use multi::MultiBackend;

use crate::config::{BackendConfig, BackendKind};
use crate::core::errors::PeridotError;
use crate::core::types::Namespace;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Narrow, per-object backend contract. Object names are unique inside a
/// namespace; all objects except the `snapshots` manifest are written
/// once and never overwritten.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn create_namespace(&self, ns: &Namespace) -> Result<(), PeridotError>;

    async fn delete_namespace(&self, ns: &Namespace) -> Result<(), PeridotError>;

    async fn namespace_exists(&self, ns: &Namespace) -> Result<bool, PeridotError>;

    /// Stores an object. With `overwrite = false`, an existing object of
    /// the same name fails the put with `FileExists`. A checksum, when
    /// given, is verified against the stored bytes.
    async fn put(
        &self,
        ns: &Namespace,
        name: &str,
        bytes: Bytes,
        overwrite: bool,
        checksum: Option<u32>,
    ) -> Result<(), PeridotError>;

    async fn get(&self, ns: &Namespace, name: &str) -> Result<Bytes, PeridotError>;

    /// Removes an object. With `may_not_exist`, deleting an absent object
    /// succeeds, making deletions idempotent.
    async fn delete(
        &self,
        ns: &Namespace,
        name: &str,
        may_not_exist: bool,
    ) -> Result<(), PeridotError>;

    async fn exists(&self, ns: &Namespace, name: &str) -> Result<bool, PeridotError>;

    async fn list(&self, ns: &Namespace, prefix: &str) -> Result<Vec<String>, PeridotError>;

    async fn size(&self, ns: &Namespace, name: &str) -> Result<u64, PeridotError>;

    async fn checksum(&self, ns: &Namespace, name: &str) -> Result<u32, PeridotError>;

    /// Atomic compare-and-set of a single object, the primitive the
    /// cluster ownership lock is built on. `expected = None` means the
    /// object must not exist yet. Returns `false` on a lost race.
    async fn compare_and_swap(
        &self,
        ns: &Namespace,
        name: &str,
        expected: Option<Bytes>,
        new: Bytes,
    ) -> Result<bool, PeridotError>;
}

/// Builds a connector from configuration. S3 and Alba drivers live in
/// their own crates and are wired in by the deployment, not here.
pub fn connector_from_config(
    cfg: &BackendConfig,
) -> Result<Arc<dyn BackendConnector>, PeridotError> {
    match cfg.kind {
        BackendKind::Local => Ok(Arc::new(LocalBackend::new(cfg.local_root.clone()))),
        BackendKind::Multi => {
            let mut children: Vec<Arc<dyn BackendConnector>> = Vec::new();
            for child in &cfg.children {
                match child.kind {
                    BackendKind::Local => {
                        children.push(Arc::new(LocalBackend::new(child.local_root.clone())))
                    }
                    other => {
                        return Err(PeridotError::Config(format!(
                            "unsupported multi backend child kind {other:?}"
                        )));
                    }
                }
            }
            Ok(Arc::new(MultiBackend::new(children)?))
        }
        other => Err(PeridotError::Config(format!(
            "backend kind {other:?} requires an external driver"
        ))),
    }
}
