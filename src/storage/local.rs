//! Local disk storage handler.
//!
//! Keys are `/`-separated paths relative to the handler root:
//! ```text
//! {root}/
//! ├── uploads/1/photos/
//! │   ├── k3J9xQ2a_cat.png
//! │   └── k3J9xQ2a_cat.png._thumb
//! └── ...
//! ```
//! Puts stream into a hidden sibling file that is renamed into place once
//! complete.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use super::{ByteReader, Object, StorageHandler, ThumbContent, UploadCredential};
use crate::filesystem::{FileHeader, UploadSession};
use crate::{NimbusError, Result};

/// Storage handler for a directory on the local machine.
#[derive(Debug, Clone)]
pub struct LocalHandler {
    /// Base directory for stored objects.
    root: PathBuf,
    /// Suffix of thumbnail sidecar files.
    thumb_suffix: String,
}

impl LocalHandler {
    /// Create a handler rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>, thumb_suffix: &str) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            thumb_suffix: thumb_suffix.to_string(),
        })
    }

    /// Get the root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key to a path under the root.
    ///
    /// Keys that would escape the root are rejected.
    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key.trim_start_matches('/'));
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => return Err(NimbusError::IllegalName(key.to_string())),
            }
        }
        Ok(self.root.join(relative))
    }

    fn backend(action: &str, key: &str, e: io::Error) -> NimbusError {
        if e.kind() == io::ErrorKind::NotFound {
            NimbusError::NotExist(format!("object {key}"))
        } else {
            NimbusError::Backend(format!("{action} {key}: {e}"))
        }
    }

    fn key_of(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

#[async_trait]
impl StorageHandler for LocalHandler {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn put(
        &self,
        cancel: &CancellationToken,
        mut reader: ByteReader,
        key: &str,
        size: i64,
    ) -> Result<i64> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::backend("mkdir", key, e))?;
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| NimbusError::IllegalName(key.to_string()))?;
        let partial = path.with_file_name(format!(".{file_name}.{}.part", Uuid::new_v4()));

        let written = async {
            let mut file = fs::File::create(&partial).await?;
            let written = tokio::io::copy(&mut reader, &mut file).await?;
            file.flush().await?;
            Ok::<u64, io::Error>(written)
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(NimbusError::Canceled),
            written = written => written.map_err(|e| Self::backend("write", key, e)),
        };

        let result = match outcome {
            Ok(written) if size > 0 && written as i64 != size => Err(NimbusError::Backend(
                format!("write {key}: expected {size} bytes, got {written}"),
            )),
            Ok(written) => fs::rename(&partial, &path)
                .await
                .map(|()| written as i64)
                .map_err(|e| Self::backend("rename", key, e)),
            Err(e) => Err(e),
        };

        if result.is_err() {
            if let Err(e) = fs::remove_file(&partial).await {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to remove partial upload {:?}: {}", partial, e);
                }
            }
        }
        result
    }

    async fn get(&self, _cancel: &CancellationToken, key: &str) -> Result<ByteReader> {
        let path = self.resolve(key)?;
        let file = fs::File::open(&path)
            .await
            .map_err(|e| Self::backend("open", key, e))?;
        Ok(Box::new(file))
    }

    async fn delete(&self, cancel: &CancellationToken, keys: &[String]) -> Result<Vec<String>> {
        let mut failed = Vec::new();
        for key in keys {
            if cancel.is_cancelled() {
                failed.push(key.clone());
                continue;
            }
            let path = match self.resolve(key) {
                Ok(path) => path,
                Err(_) => {
                    failed.push(key.clone());
                    continue;
                }
            };
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Failed to delete {:?}: {}", path, e);
                    failed.push(key.clone());
                }
            }
        }
        Ok(failed)
    }

    async fn move_object(&self, _cancel: &CancellationToken, src: &str, dst: &str) -> Result<()> {
        let from = self.resolve(src)?;
        let to = self.resolve(dst)?;
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::backend("mkdir", dst, e))?;
        }
        fs::rename(&from, &to)
            .await
            .map_err(|e| Self::backend("move", src, e))
    }

    async fn list(
        &self,
        cancel: &CancellationToken,
        path: &str,
        recursive: bool,
    ) -> Result<Vec<Object>> {
        let base = self.resolve(path)?;
        let mut objects = Vec::new();
        let mut pending = vec![base.clone()];

        while let Some(dir) = pending.pop() {
            if cancel.is_cancelled() {
                return Err(NimbusError::Canceled);
            }
            let mut entries = fs::read_dir(&dir)
                .await
                .map_err(|e| Self::backend("list", path, e))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Self::backend("list", path, e))?
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') || name.ends_with(&self.thumb_suffix) {
                    continue;
                }
                let meta = entry
                    .metadata()
                    .await
                    .map_err(|e| Self::backend("stat", &name, e))?;
                let entry_path = entry.path();
                let relative = entry_path
                    .strip_prefix(&base)
                    .unwrap_or(&entry_path)
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");

                objects.push(Object {
                    name,
                    relative_path: relative,
                    source: self.key_of(&entry_path),
                    size: if meta.is_dir() { 0 } else { meta.len() as i64 },
                    is_dir: meta.is_dir(),
                });
                if recursive && meta.is_dir() {
                    pending.push(entry_path);
                }
            }
        }

        objects.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        Ok(objects)
    }

    async fn thumb(&self, _cancel: &CancellationToken, key: &str) -> Result<ThumbContent> {
        let thumb_key = format!("{key}{}", self.thumb_suffix);
        let path = self.resolve(&thumb_key)?;
        let bytes = fs::read(&path)
            .await
            .map_err(|e| Self::backend("thumb", &thumb_key, e))?;
        Ok(ThumbContent::Bytes(bytes))
    }

    async fn token(
        &self,
        _cancel: &CancellationToken,
        ttl: Duration,
        session: &UploadSession,
        _header: &FileHeader,
    ) -> Result<UploadCredential> {
        // Bytes are relayed through the engine, so no direct endpoint is issued.
        Ok(UploadCredential {
            session_id: session.key.clone(),
            expires: chrono::Utc::now().timestamp() + ttl.as_secs() as i64,
            chunk_size: session.policy.chunk_size,
            upload_urls: Vec::new(),
            credential: String::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn setup() -> (TempDir, LocalHandler) {
        let temp_dir = TempDir::new().unwrap();
        let handler = LocalHandler::new(temp_dir.path().join("blobs"), "._thumb").unwrap();
        (temp_dir, handler)
    }

    async fn put(handler: &LocalHandler, key: &str, content: &'static [u8]) {
        handler
            .put(
                &CancellationToken::new(),
                Box::new(content),
                key,
                content.len() as i64,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (_dir, handler) = setup();
        put(&handler, "uploads/1/a.txt", b"Hello, World!").await;

        let mut reader = handler
            .get(&CancellationToken::new(), "uploads/1/a.txt")
            .await
            .unwrap();
        let mut content = Vec::new();
        reader.read_to_end(&mut content).await.unwrap();
        assert_eq!(content, b"Hello, World!");
    }

    #[tokio::test]
    async fn test_get_missing() {
        let (_dir, handler) = setup();
        let result = handler.get(&CancellationToken::new(), "nope").await;
        assert!(matches!(result, Err(NimbusError::NotExist(_))));
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let (_dir, handler) = setup();
        let result = handler
            .put(&CancellationToken::new(), Box::new(&b"x"[..]), "../evil", 1)
            .await;
        assert!(matches!(result, Err(NimbusError::IllegalName(_))));
    }

    #[tokio::test]
    async fn test_size_mismatch_leaves_nothing() {
        let (_dir, handler) = setup();
        let result = handler
            .put(&CancellationToken::new(), Box::new(&b"abc"[..]), "a.txt", 10)
            .await;
        assert!(matches!(result, Err(NimbusError::Backend(_))));

        let listed = handler
            .list(&CancellationToken::new(), "", true)
            .await
            .unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn test_canceled_put() {
        let (_dir, handler) = setup();
        let cancel = CancellationToken::new();
        let (_writer, reader) = tokio::io::duplex(64);
        cancel.cancel();

        let result = handler.put(&cancel, Box::new(reader), "hang.bin", 8).await;
        assert!(matches!(result, Err(NimbusError::Canceled)));
        assert!(!handler.root().join("hang.bin").exists());
    }

    #[tokio::test]
    async fn test_delete_reports_nothing_for_missing() {
        let (_dir, handler) = setup();
        put(&handler, "a.txt", b"a").await;

        let failed = handler
            .delete(
                &CancellationToken::new(),
                &["a.txt".to_string(), "missing.txt".to_string()],
            )
            .await
            .unwrap();
        assert!(failed.is_empty());
        assert!(!handler.root().join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_list_recursive_and_flat() {
        let (_dir, handler) = setup();
        put(&handler, "import/a.txt", b"1").await;
        put(&handler, "import/sub/b.txt", b"22").await;
        put(&handler, "import/sub/b.txt._thumb", b"t").await;

        let cancel = CancellationToken::new();
        let flat = handler.list(&cancel, "import", false).await.unwrap();
        assert_eq!(flat.len(), 2);

        let all = handler.list(&cancel, "import", true).await.unwrap();
        let paths: Vec<_> = all.iter().map(|o| o.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["a.txt", "sub", "sub/b.txt"]);

        let b = &all[2];
        assert_eq!(b.source, "import/sub/b.txt");
        assert_eq!(b.size, 2);
        assert!(!b.is_dir);
        assert!(all[1].is_dir);
    }

    #[tokio::test]
    async fn test_move_and_thumb() {
        let (_dir, handler) = setup();
        let cancel = CancellationToken::new();
        put(&handler, "a.png", b"img").await;
        put(&handler, "b/c.png._thumb", b"thumb").await;

        handler.move_object(&cancel, "a.png", "b/c.png").await.unwrap();
        assert!(handler.root().join("b/c.png").exists());

        let thumb = handler.thumb(&cancel, "b/c.png").await.unwrap();
        assert_eq!(thumb, ThumbContent::Bytes(b"thumb".to_vec()));
        assert!(matches!(
            handler.thumb(&cancel, "a.png").await,
            Err(NimbusError::NotExist(_))
        ));
    }

    #[tokio::test]
    async fn test_put_unknown_size_reports_written() {
        let (_dir, handler) = setup();
        let written = handler
            .put(&CancellationToken::new(), Box::new(&b"four"[..]), "a/b.bin", 0)
            .await
            .unwrap();
        assert_eq!(written, 4);
        assert_eq!(std::fs::read(handler.root().join("a/b.bin")).unwrap(), b"four");
    }
}
