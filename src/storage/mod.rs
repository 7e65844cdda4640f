//! Physical storage for Nimbus.
//!
//! Every storage policy type has a [`StorageHandler`] adapter. Handlers only
//! touch the physical store; metadata stays with the engine.
//!
//! - `local`: files under a directory on this machine
//! - `memory`: an in-process flat object store

mod local;
mod memory;

pub use local::LocalHandler;
pub use memory::MemoryHandler;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::filesystem::{FileHeader, Policy, UploadSession};
use crate::{NimbusError, Result};

/// Streamed object content.
pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;

/// An entry returned by [`StorageHandler::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Object {
    /// Base name of the entry.
    pub name: String,
    /// Path relative to the listed directory, `/` separated.
    pub relative_path: String,
    /// Physical key usable with `get`/`delete`.
    pub source: String,
    /// Size in bytes (0 for directories).
    pub size: i64,
    /// Whether the entry is a directory.
    pub is_dir: bool,
}

/// Thumbnail content served by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThumbContent {
    /// Encoded image bytes.
    Bytes(Vec<u8>),
    /// A URL the client fetches directly.
    Redirect(String),
}

/// Credential handed to a client for an out-of-band upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadCredential {
    /// Upload session key.
    pub session_id: String,
    /// Expiry as a unix timestamp in seconds.
    pub expires: i64,
    /// Preferred chunk size (0 = single request).
    pub chunk_size: i64,
    /// Endpoints the client writes to directly. Empty when bytes go through the engine.
    pub upload_urls: Vec<String>,
    /// Backend-specific token.
    pub credential: String,
}

/// Adapter over one kind of physical store.
///
/// Every operation takes a cancellation token; in-flight I/O stops when it
/// fires.
#[async_trait]
pub trait StorageHandler: Send + Sync {
    /// Short name of the backend type.
    fn kind(&self) -> &'static str;

    /// Write the bytes of `reader` under `key` and return how many were written.
    ///
    /// A positive `size` must match the stream exactly; 0 means the size is
    /// not known up front. Retrying is safe. A failed or canceled put leaves
    /// nothing visible to `get` or `list`.
    async fn put(
        &self,
        cancel: &CancellationToken,
        reader: ByteReader,
        key: &str,
        size: i64,
    ) -> Result<i64>;

    /// Open an object for reading. Fails with `NotExist` when absent.
    async fn get(&self, cancel: &CancellationToken, key: &str) -> Result<ByteReader>;

    /// Best-effort batch delete. Returns the keys that could not be removed.
    ///
    /// Keys that are already absent count as removed.
    async fn delete(&self, cancel: &CancellationToken, keys: &[String]) -> Result<Vec<String>>;

    /// Move an object to a new key.
    async fn move_object(&self, cancel: &CancellationToken, src: &str, dst: &str) -> Result<()>;

    /// List objects under `path`.
    async fn list(
        &self,
        cancel: &CancellationToken,
        path: &str,
        recursive: bool,
    ) -> Result<Vec<Object>>;

    /// Fetch the thumbnail stored for `key`.
    async fn thumb(&self, cancel: &CancellationToken, key: &str) -> Result<ThumbContent>;

    /// Issue an upload credential for a session.
    async fn token(
        &self,
        cancel: &CancellationToken,
        ttl: Duration,
        session: &UploadSession,
        header: &FileHeader,
    ) -> Result<UploadCredential>;
}

/// Read an object fully into memory.
pub async fn read_all(
    handler: &dyn StorageHandler,
    cancel: &CancellationToken,
    key: &str,
) -> Result<Vec<u8>> {
    use tokio::io::AsyncReadExt;

    let mut reader = handler.get(cancel, key).await?;
    let mut buf = Vec::new();
    tokio::select! {
        _ = cancel.cancelled() => Err(NimbusError::Canceled),
        read = reader.read_to_end(&mut buf) => {
            read.map_err(|e| NimbusError::Backend(format!("read {key}: {e}")))?;
            Ok(buf)
        }
    }
}

/// Resolves the shared handler of each storage policy.
pub struct HandlerRegistry {
    local_root: PathBuf,
    thumb_suffix: String,
    handlers: RwLock<HashMap<i64, Arc<dyn StorageHandler>>>,
}

impl HandlerRegistry {
    /// Create a registry.
    ///
    /// `local_root` is the directory `local` policies resolve their base path
    /// against. `thumb_suffix` is appended to a key to find its thumbnail.
    pub fn new(local_root: impl Into<PathBuf>, thumb_suffix: impl Into<String>) -> Self {
        Self {
            local_root: local_root.into(),
            thumb_suffix: thumb_suffix.into(),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Install an explicit handler for a policy, replacing any cached one.
    pub async fn register(&self, policy_id: i64, handler: Arc<dyn StorageHandler>) {
        self.handlers.write().await.insert(policy_id, handler);
    }

    /// Get the handler for a policy, building it on first use.
    pub async fn dispatch(&self, policy: &Policy) -> Result<Arc<dyn StorageHandler>> {
        if let Some(handler) = self.handlers.read().await.get(&policy.id) {
            return Ok(Arc::clone(handler));
        }

        let mut handlers = self.handlers.write().await;
        if let Some(handler) = handlers.get(&policy.id) {
            return Ok(Arc::clone(handler));
        }

        let handler: Arc<dyn StorageHandler> = match policy.policy_type.as_str() {
            "local" => Arc::new(LocalHandler::new(
                self.local_root.join(&policy.base_path),
                &self.thumb_suffix,
            )?),
            "memory" => Arc::new(MemoryHandler::new(&self.thumb_suffix)),
            other => return Err(NimbusError::UnknownPolicyType(other.to_string())),
        };
        debug!(
            policy_id = policy.id,
            kind = handler.kind(),
            "storage handler created"
        );
        handlers.insert(policy.id, Arc::clone(&handler));
        Ok(handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(id: i64, policy_type: &str) -> Policy {
        Policy {
            id,
            policy_type: policy_type.to_string(),
            ..Policy::default()
        }
    }

    #[tokio::test]
    async fn test_dispatch_caches_per_policy() {
        let dir = tempfile::tempdir().unwrap();
        let registry = HandlerRegistry::new(dir.path(), "._thumb");

        let a = registry.dispatch(&policy(1, "memory")).await.unwrap();
        let b = registry.dispatch(&policy(1, "memory")).await.unwrap();
        let c = registry.dispatch(&policy(2, "local")).await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.kind(), "memory");
        assert_eq!(c.kind(), "local");
    }

    #[tokio::test]
    async fn test_dispatch_unknown_type() {
        let dir = tempfile::tempdir().unwrap();
        let registry = HandlerRegistry::new(dir.path(), "._thumb");

        let result = registry.dispatch(&policy(3, "ftp")).await;
        assert!(matches!(result, Err(NimbusError::UnknownPolicyType(t)) if t == "ftp"));
    }

    #[tokio::test]
    async fn test_register_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let registry = HandlerRegistry::new(dir.path(), "._thumb");
        let custom: Arc<dyn StorageHandler> = Arc::new(MemoryHandler::new("._thumb"));

        registry.register(7, Arc::clone(&custom)).await;
        let dispatched = registry.dispatch(&policy(7, "local")).await.unwrap();
        assert!(Arc::ptr_eq(&custom, &dispatched));
    }

    #[tokio::test]
    async fn test_read_all() {
        let handler = MemoryHandler::new("._thumb");
        let cancel = CancellationToken::new();
        handler
            .put(&cancel, Box::new(&b"hello"[..]), "a/b.txt", 5)
            .await
            .unwrap();

        let bytes = read_all(&handler, &cancel, "a/b.txt").await.unwrap();
        assert_eq!(bytes, b"hello");
    }
}
