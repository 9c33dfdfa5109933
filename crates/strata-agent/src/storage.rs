//! Storage backends for backup files
//!
//! Backends are looked up by the registry key a Store names. The agent
//! registers `noop` and `filesystem`; object-store adapters plug in through
//! [`StorageRegistry::register`].

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use strata_common::IO_TIMEOUT_SECS;

/// Backend settings as sent by the operator
pub type Variables = BTreeMap<String, String>;

/// Failures moving backup files
#[derive(Debug, Error)]
pub enum StorageError {
    /// No backend is registered under the name
    #[error("unknown storage backend: {0}")]
    UnknownBackend(String),

    /// Bucket or location would escape the backend root
    #[error("invalid object path: {0}")]
    InvalidPath(String),

    /// The object does not exist
    #[error("object not found: {0}")]
    NotFound(String),

    /// The operation did not finish in time
    #[error("storage operation timed out after {0}s")]
    Timeout(u64),

    /// Underlying I/O failure
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A place backup files can be pushed to and pulled from
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Upload `source` to `bucket`/`location`
    async fn push(
        &self,
        bucket: &str,
        location: &str,
        source: &Path,
        variables: &Variables,
    ) -> Result<(), StorageError>;

    /// Download `bucket`/`location` into `destination`
    async fn pull(
        &self,
        bucket: &str,
        location: &str,
        destination: &Path,
        variables: &Variables,
    ) -> Result<(), StorageError>;

    /// Remove `bucket`/`location`; removing a missing object succeeds
    async fn delete(
        &self,
        bucket: &str,
        location: &str,
        variables: &Variables,
    ) -> Result<(), StorageError>;
}

/// Accepts every push and stores nothing
#[derive(Debug, Default)]
pub struct NoopBackend;

#[async_trait]
impl StorageBackend for NoopBackend {
    async fn push(
        &self,
        bucket: &str,
        location: &str,
        _source: &Path,
        _variables: &Variables,
    ) -> Result<(), StorageError> {
        debug!(bucket, location, "noop push");
        Ok(())
    }

    async fn pull(
        &self,
        bucket: &str,
        location: &str,
        _destination: &Path,
        _variables: &Variables,
    ) -> Result<(), StorageError> {
        Err(StorageError::NotFound(format!("{bucket}/{location}")))
    }

    async fn delete(
        &self,
        _bucket: &str,
        _location: &str,
        _variables: &Variables,
    ) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Stores objects as files under `<root>/<bucket>/<location>`.
///
/// A `root` variable selects a subdirectory of the configured root; it is
/// resolved like a location and can never leave the configured root.
#[derive(Debug, Clone)]
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Backend rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(
        &self,
        bucket: &str,
        location: &str,
        variables: &Variables,
    ) -> Result<PathBuf, StorageError> {
        let subdir = variables
            .get("root")
            .map(|root| root.trim_start_matches('/'))
            .unwrap_or_default();
        let relative = Path::new(subdir)
            .join(bucket)
            .join(location.trim_start_matches('/'));
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if bucket.is_empty() || location.trim_matches('/').is_empty() || escapes {
            return Err(StorageError::InvalidPath(format!("{subdir}/{bucket}/{location}")));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl StorageBackend for FilesystemBackend {
    async fn push(
        &self,
        bucket: &str,
        location: &str,
        source: &Path,
        variables: &Variables,
    ) -> Result<(), StorageError> {
        let target = self.object_path(bucket, location, variables)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = tokio::fs::copy(source, &target).await?;
        info!(path = %target.display(), bytes, "backup stored");
        Ok(())
    }

    async fn pull(
        &self,
        bucket: &str,
        location: &str,
        destination: &Path,
        variables: &Variables,
    ) -> Result<(), StorageError> {
        let source = self.object_path(bucket, location, variables)?;
        match tokio::fs::copy(&source, destination).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(source.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(
        &self,
        bucket: &str,
        location: &str,
        variables: &Variables,
    ) -> Result<(), StorageError> {
        let target = self.object_path(bucket, location, variables)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Backends by registry key, with every call bounded by a timeout
#[derive(Clone)]
pub struct StorageRegistry {
    backends: HashMap<String, Arc<dyn StorageBackend>>,
    timeout: Duration,
}

impl StorageRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            timeout: Duration::from_secs(IO_TIMEOUT_SECS),
        }
    }

    /// Registry with the built-in `noop` and `filesystem` backends
    pub fn with_builtins(filesystem_root: impl Into<PathBuf>) -> Self {
        let mut registry = Self::new();
        registry.register("noop", Arc::new(NoopBackend));
        registry.register("filesystem", Arc::new(FilesystemBackend::new(filesystem_root)));
        registry
    }

    /// Add or replace a backend
    pub fn register(&mut self, name: &str, backend: Arc<dyn StorageBackend>) {
        self.backends.insert(name.to_string(), backend);
    }

    /// Override the per-call timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn backend(&self, name: &str) -> Result<&Arc<dyn StorageBackend>, StorageError> {
        self.backends
            .get(name)
            .ok_or_else(|| StorageError::UnknownBackend(name.to_string()))
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, StorageError>>,
    ) -> Result<T, StorageError> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| StorageError::Timeout(self.timeout.as_secs()))?
    }

    /// Push through the named backend
    pub async fn push(
        &self,
        backend: &str,
        bucket: &str,
        location: &str,
        source: &Path,
        variables: &Variables,
    ) -> Result<(), StorageError> {
        let backend = self.backend(backend)?;
        self.bounded(backend.push(bucket, location, source, variables))
            .await
    }

    /// Pull through the named backend
    pub async fn pull(
        &self,
        backend: &str,
        bucket: &str,
        location: &str,
        destination: &Path,
        variables: &Variables,
    ) -> Result<(), StorageError> {
        let backend = self.backend(backend)?;
        self.bounded(backend.pull(bucket, location, destination, variables))
            .await
    }

    /// Delete through the named backend
    pub async fn delete(
        &self,
        backend: &str,
        bucket: &str,
        location: &str,
        variables: &Variables,
    ) -> Result<(), StorageError> {
        let backend = self.backend(backend)?;
        self.bounded(backend.delete(bucket, location, variables))
            .await
    }
}

impl Default for StorageRegistry {
    fn default() -> Self {
        Self::new()
    }
}
