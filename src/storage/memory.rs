//! In-process object store handler.
//!
//! Keys are flat strings; directories are implied by `/` separators the way
//! object stores present them. Individual keys can be marked as failing to
//! delete, which lets callers exercise partial-failure paths.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::distr::Alphanumeric;
use rand::Rng;
use tokio::io::AsyncReadExt;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::{ByteReader, Object, StorageHandler, ThumbContent, UploadCredential};
use crate::filesystem::{FileHeader, UploadSession};
use crate::{NimbusError, Result};

/// Object-store style handler kept in memory.
pub struct MemoryHandler {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
    failing_deletes: RwLock<HashSet<String>>,
    failing_puts: AtomicBool,
    thumb_suffix: String,
}

impl MemoryHandler {
    /// Create an empty store.
    pub fn new(thumb_suffix: &str) -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            failing_deletes: RwLock::new(HashSet::new()),
            failing_puts: AtomicBool::new(false),
            thumb_suffix: thumb_suffix.to_string(),
        }
    }

    /// Make every future delete of `key` fail.
    pub async fn fail_delete(&self, key: impl Into<String>) {
        self.failing_deletes.write().await.insert(key.into());
    }

    /// Make every future put fail, or succeed again.
    pub fn fail_puts(&self, fail: bool) {
        self.failing_puts.store(fail, Ordering::SeqCst);
    }

    /// Whether an object exists.
    pub async fn contains(&self, key: &str) -> bool {
        self.objects.read().await.contains_key(key)
    }

    /// Bytes of an object.
    pub async fn bytes(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.read().await.get(key).cloned()
    }

    /// Number of stored objects.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    /// Store bytes directly.
    pub async fn insert(&self, key: impl Into<String>, bytes: Vec<u8>) {
        self.objects.write().await.insert(key.into(), bytes);
    }
}

#[async_trait]
impl StorageHandler for MemoryHandler {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn put(
        &self,
        cancel: &CancellationToken,
        mut reader: ByteReader,
        key: &str,
        size: i64,
    ) -> Result<i64> {
        if self.failing_puts.load(Ordering::SeqCst) {
            return Err(NimbusError::Backend(format!("write {key}: refused")));
        }
        let mut buf = Vec::new();
        tokio::select! {
            _ = cancel.cancelled() => return Err(NimbusError::Canceled),
            read = reader.read_to_end(&mut buf) => {
                read.map_err(|e| NimbusError::Backend(format!("write {key}: {e}")))?;
            }
        }
        if size > 0 && buf.len() as i64 != size {
            return Err(NimbusError::Backend(format!(
                "write {key}: expected {size} bytes, got {}",
                buf.len()
            )));
        }
        let written = buf.len() as i64;
        self.objects.write().await.insert(key.to_string(), buf);
        Ok(written)
    }

    async fn get(&self, _cancel: &CancellationToken, key: &str) -> Result<ByteReader> {
        let bytes = self
            .objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| NimbusError::NotExist(format!("object {key}")))?;
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }

    async fn delete(&self, _cancel: &CancellationToken, keys: &[String]) -> Result<Vec<String>> {
        let failing = self.failing_deletes.read().await;
        let mut objects = self.objects.write().await;
        let mut failed = Vec::new();
        for key in keys {
            if failing.contains(key) {
                failed.push(key.clone());
            } else {
                objects.remove(key);
            }
        }
        Ok(failed)
    }

    async fn move_object(&self, _cancel: &CancellationToken, src: &str, dst: &str) -> Result<()> {
        let mut objects = self.objects.write().await;
        let bytes = objects
            .remove(src)
            .ok_or_else(|| NimbusError::NotExist(format!("object {src}")))?;
        objects.insert(dst.to_string(), bytes);
        Ok(())
    }

    async fn list(
        &self,
        _cancel: &CancellationToken,
        path: &str,
        recursive: bool,
    ) -> Result<Vec<Object>> {
        let prefix = match path.trim_matches('/') {
            "" => String::new(),
            p => format!("{p}/"),
        };
        let objects = self.objects.read().await;
        let mut dirs = BTreeSet::new();
        let mut result = Vec::new();

        for (key, bytes) in objects.range(prefix.clone()..) {
            let Some(relative) = key.strip_prefix(&prefix) else {
                break;
            };
            if key.ends_with(&self.thumb_suffix) {
                continue;
            }
            let segments: Vec<&str> = relative.split('/').collect();
            if recursive {
                for i in 0..segments.len() - 1 {
                    dirs.insert(segments[..=i].join("/"));
                }
            } else if segments.len() > 1 {
                dirs.insert(segments[0].to_string());
                continue;
            }
            result.push(Object {
                name: segments[segments.len() - 1].to_string(),
                relative_path: relative.to_string(),
                source: key.clone(),
                size: bytes.len() as i64,
                is_dir: false,
            });
        }

        for dir in dirs {
            let name = dir.rsplit('/').next().unwrap_or(&dir).to_string();
            result.push(Object {
                name,
                source: format!("{prefix}{dir}"),
                relative_path: dir,
                size: 0,
                is_dir: true,
            });
        }

        result.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        Ok(result)
    }

    async fn thumb(&self, _cancel: &CancellationToken, key: &str) -> Result<ThumbContent> {
        let thumb_key = format!("{key}{}", self.thumb_suffix);
        self.objects
            .read()
            .await
            .get(&thumb_key)
            .cloned()
            .map(ThumbContent::Bytes)
            .ok_or_else(|| NimbusError::NotExist(format!("object {thumb_key}")))
    }

    async fn token(
        &self,
        _cancel: &CancellationToken,
        ttl: Duration,
        session: &UploadSession,
        _header: &FileHeader,
    ) -> Result<UploadCredential> {
        let credential: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();
        Ok(UploadCredential {
            session_id: session.key.clone(),
            expires: chrono::Utc::now().timestamp() + ttl.as_secs() as i64,
            chunk_size: session.policy.chunk_size,
            upload_urls: vec![format!("memory://{}", session.save_path)],
            credential,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn filled() -> MemoryHandler {
        let handler = MemoryHandler::new("._thumb");
        handler.insert("import/a.txt", b"1".to_vec()).await;
        handler.insert("import/sub/b.txt", b"22".to_vec()).await;
        handler.insert("import/sub/deep/c.txt", b"333".to_vec()).await;
        handler.insert("import/sub/b.txt._thumb", b"t".to_vec()).await;
        handler.insert("other/d.txt", b"4".to_vec()).await;
        handler
    }

    #[tokio::test]
    async fn test_list_flat() {
        let handler = filled().await;
        let listed = handler
            .list(&CancellationToken::new(), "import", false)
            .await
            .unwrap();
        let paths: Vec<_> = listed
            .iter()
            .map(|o| (o.relative_path.as_str(), o.is_dir))
            .collect();
        assert_eq!(paths, vec![("a.txt", false), ("sub", true)]);
    }

    #[tokio::test]
    async fn test_list_recursive() {
        let handler = filled().await;
        let listed = handler
            .list(&CancellationToken::new(), "/import/", true)
            .await
            .unwrap();
        let paths: Vec<_> = listed.iter().map(|o| o.relative_path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["a.txt", "sub", "sub/b.txt", "sub/deep", "sub/deep/c.txt"]
        );
        assert_eq!(listed[4].source, "import/sub/deep/c.txt");
        assert_eq!(listed[4].size, 3);
    }

    #[tokio::test]
    async fn test_delete_with_injected_failure() {
        let handler = filled().await;
        handler.fail_delete("import/a.txt").await;

        let failed = handler
            .delete(
                &CancellationToken::new(),
                &["import/a.txt".to_string(), "other/d.txt".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(failed, vec!["import/a.txt".to_string()]);
        assert!(handler.contains("import/a.txt").await);
        assert!(!handler.contains("other/d.txt").await);
    }

    #[tokio::test]
    async fn test_move_and_thumb() {
        let handler = filled().await;
        let cancel = CancellationToken::new();

        handler
            .move_object(&cancel, "other/d.txt", "moved/d.txt")
            .await
            .unwrap();
        assert!(handler.contains("moved/d.txt").await);
        assert!(handler.move_object(&cancel, "other/d.txt", "x").await.is_err());

        let thumb = handler.thumb(&cancel, "import/sub/b.txt").await.unwrap();
        assert_eq!(thumb, ThumbContent::Bytes(b"t".to_vec()));
    }

    #[tokio::test]
    async fn test_canceled_put() {
        let handler = MemoryHandler::new("._thumb");
        let cancel = CancellationToken::new();
        let (_writer, reader) = tokio::io::duplex(64);
        cancel.cancel();

        let result = handler.put(&cancel, Box::new(reader), "hang", 4).await;
        assert!(matches!(result, Err(NimbusError::Canceled)));
        assert!(handler.is_empty().await);
    }

    #[tokio::test]
    async fn test_put_reports_written_bytes() {
        let handler = MemoryHandler::new("._thumb");
        let cancel = CancellationToken::new();

        let written = handler
            .put(&cancel, Box::new(&b"unknown size"[..]), "a", 0)
            .await
            .unwrap();
        assert_eq!(written, 12);

        let short = handler.put(&cancel, Box::new(&b"abc"[..]), "b", 4).await;
        assert!(matches!(short, Err(NimbusError::Backend(_))));
        assert!(!handler.contains("b").await);

        handler.fail_puts(true);
        let refused = handler.put(&cancel, Box::new(&b"abc"[..]), "c", 3).await;
        assert!(matches!(refused, Err(NimbusError::Backend(_))));
        handler.fail_puts(false);
        assert_eq!(
            handler.put(&cancel, Box::new(&b"abc"[..]), "c", 3).await.unwrap(),
            3
        );
    }
}
