// src/core/backend/local.rs

//! Filesystem-backed object store, one directory per namespace.
//!
//! Puts land in a temporary file and are renamed into place, so readers
//! never observe a half-written object.

use super::BackendConnector;
use crate::core::errors::PeridotError;
use crate::core::tlog::CHECKSUM_ALGO;
use crate::core::types::Namespace;
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

pub struct LocalBackend {
    root: PathBuf,
    /// Serializes compare-and-swap sequences. Single-process semantics
    /// are sufficient for the local driver.
    cas_lock: Mutex<()>,
}

impl LocalBackend {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            cas_lock: Mutex::new(()),
        }
    }

    fn ns_dir(&self, ns: &Namespace) -> PathBuf {
        self.root.join(ns.as_str())
    }

    fn object_path(&self, ns: &Namespace, name: &str) -> PathBuf {
        self.ns_dir(ns).join(name)
    }

    async fn read_object(&self, ns: &Namespace, name: &str) -> Result<Bytes, PeridotError> {
        match fs::read(self.object_path(ns, name)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(PeridotError::ObjectNotFound(format!("{ns}/{name}")))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl BackendConnector for LocalBackend {
    async fn create_namespace(&self, ns: &Namespace) -> Result<(), PeridotError> {
        let dir = self.ns_dir(ns);
        if fs::try_exists(&dir).await? {
            return Err(PeridotError::FileExists(ns.to_string()));
        }
        fs::create_dir_all(&dir).await?;
        Ok(())
    }

    async fn delete_namespace(&self, ns: &Namespace) -> Result<(), PeridotError> {
        match fs::remove_dir_all(self.ns_dir(ns)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(PeridotError::ObjectNotFound(ns.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn namespace_exists(&self, ns: &Namespace) -> Result<bool, PeridotError> {
        Ok(fs::try_exists(self.ns_dir(ns)).await?)
    }

    async fn put(
        &self,
        ns: &Namespace,
        name: &str,
        bytes: Bytes,
        overwrite: bool,
        checksum: Option<u32>,
    ) -> Result<(), PeridotError> {
        if let Some(expected) = checksum {
            let actual = CHECKSUM_ALGO.checksum(&bytes);
            if actual != expected {
                return Err(PeridotError::ChecksumMismatch(format!("{ns}/{name}")));
            }
        }

        let path = self.object_path(ns, name);
        if !overwrite && fs::try_exists(&path).await? {
            return Err(PeridotError::FileExists(format!("{ns}/{name}")));
        }

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, &path).await?;
        debug!("put {}/{} ({} bytes)", ns, name, bytes.len());
        Ok(())
    }

    async fn get(&self, ns: &Namespace, name: &str) -> Result<Bytes, PeridotError> {
        self.read_object(ns, name).await
    }

    async fn delete(
        &self,
        ns: &Namespace,
        name: &str,
        may_not_exist: bool,
    ) -> Result<(), PeridotError> {
        match fs::remove_file(self.object_path(ns, name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound && may_not_exist => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(PeridotError::ObjectNotFound(format!("{ns}/{name}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, ns: &Namespace, name: &str) -> Result<bool, PeridotError> {
        Ok(fs::try_exists(self.object_path(ns, name)).await?)
    }

    async fn list(&self, ns: &Namespace, prefix: &str) -> Result<Vec<String>, PeridotError> {
        let mut names = Vec::new();
        let mut dir = match fs::read_dir(self.ns_dir(ns)).await {
            Ok(d) => d,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(PeridotError::ObjectNotFound(ns.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(prefix) && !name.ends_with(".tmp") {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn size(&self, ns: &Namespace, name: &str) -> Result<u64, PeridotError> {
        match fs::metadata(self.object_path(ns, name)).await {
            Ok(m) => Ok(m.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(PeridotError::ObjectNotFound(format!("{ns}/{name}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn checksum(&self, ns: &Namespace, name: &str) -> Result<u32, PeridotError> {
        let bytes = self.read_object(ns, name).await?;
        Ok(CHECKSUM_ALGO.checksum(&bytes))
    }

    async fn compare_and_swap(
        &self,
        ns: &Namespace,
        name: &str,
        expected: Option<Bytes>,
        new: Bytes,
    ) -> Result<bool, PeridotError> {
        let _guard = self.cas_lock.lock().await;
        let current = match self.read_object(ns, name).await {
            Ok(bytes) => Some(bytes),
            Err(PeridotError::ObjectNotFound(_)) => None,
            Err(e) => return Err(e),
        };
        if current != expected {
            return Ok(false);
        }
        self.put(ns, name, new, true, None).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> (tempfile::TempDir, LocalBackend) {
        let dir = tempfile::tempdir().unwrap();
        let be = LocalBackend::new(dir.path().to_path_buf());
        (dir, be)
    }

    #[tokio::test]
    async fn put_get_delete_cycle() {
        let (_dir, be) = backend();
        let ns = Namespace::new("vol-1");
        be.create_namespace(&ns).await.unwrap();

        be.put(&ns, "obj", Bytes::from_static(b"payload"), false, None)
            .await
            .unwrap();
        assert_eq!(be.get(&ns, "obj").await.unwrap(), &b"payload"[..]);
        assert_eq!(be.size(&ns, "obj").await.unwrap(), 7);

        // No overwrite without the flag.
        assert!(matches!(
            be.put(&ns, "obj", Bytes::from_static(b"x"), false, None)
                .await,
            Err(PeridotError::FileExists(_))
        ));

        be.delete(&ns, "obj", false).await.unwrap();
        assert!(matches!(
            be.get(&ns, "obj").await,
            Err(PeridotError::ObjectNotFound(_))
        ));
        // Idempotent with may_not_exist.
        be.delete(&ns, "obj", true).await.unwrap();
    }

    #[tokio::test]
    async fn put_verifies_checksum() {
        let (_dir, be) = backend();
        let ns = Namespace::new("vol-2");
        be.create_namespace(&ns).await.unwrap();

        let payload = Bytes::from_static(b"checksummed");
        let good = CHECKSUM_ALGO.checksum(&payload);
        be.put(&ns, "ok", payload.clone(), false, Some(good))
            .await
            .unwrap();
        assert!(matches!(
            be.put(&ns, "bad", payload, false, Some(good ^ 1)).await,
            Err(PeridotError::ChecksumMismatch(_))
        ));
    }

    #[tokio::test]
    async fn compare_and_swap_detects_races() {
        let (_dir, be) = backend();
        let ns = Namespace::new("vol-3");
        be.create_namespace(&ns).await.unwrap();

        // Create-if-absent.
        assert!(
            be.compare_and_swap(&ns, "lock", None, Bytes::from_static(b"a"))
                .await
                .unwrap()
        );
        // Second create-if-absent loses.
        assert!(
            !be.compare_and_swap(&ns, "lock", None, Bytes::from_static(b"b"))
                .await
                .unwrap()
        );
        // Swap with the right expectation wins.
        assert!(
            be.compare_and_swap(
                &ns,
                "lock",
                Some(Bytes::from_static(b"a")),
                Bytes::from_static(b"c")
            )
            .await
            .unwrap()
        );
        assert_eq!(be.get(&ns, "lock").await.unwrap(), &b"c"[..]);
    }

    #[tokio::test]
    async fn list_filters_by_prefix() {
        let (_dir, be) = backend();
        let ns = Namespace::new("vol-4");
        be.create_namespace(&ns).await.unwrap();
        for name in ["tlog_a", "tlog_b", "snapshots"] {
            be.put(&ns, name, Bytes::from_static(b"x"), false, None)
                .await
                .unwrap();
        }
        assert_eq!(be.list(&ns, "tlog_").await.unwrap(), vec![
            "tlog_a".to_string(),
            "tlog_b".to_string()
        ]);
    }
}
