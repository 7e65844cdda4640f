//! Upload sessions.
//!
//! A session is created together with a placeholder record and stored in the
//! TTL store under `callback_{key}`. It ends when the bytes arrive through
//! the engine, when an out-of-band callback completes it, when it is
//! canceled, or when the TTL store lets it expire.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    clean_path, Engine, File, FileHeader, FileRepository, FileStream, HookPreset, Policy,
    ShareRepository, UploadMode,
};
use crate::db::UnitOfWork;
use crate::storage::{ByteReader, UploadCredential};
use crate::{NimbusError, Result};

/// Prefix of upload session keys in the TTL store.
pub const UPLOAD_SESSION_PREFIX: &str = "callback_";

/// Persisted state of an upload session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    /// Opaque session key.
    pub key: String,
    /// Owner ID.
    pub user_id: i64,
    /// Policy the bytes go to, as it was when the session was created.
    pub policy: Policy,
    /// Destination directory.
    pub virtual_path: String,
    /// Declared file name.
    pub name: String,
    /// Declared size in bytes.
    pub size: i64,
    /// Physical key the bytes go to.
    pub save_path: String,
    /// Record the upload replaces once it finishes.
    #[serde(default)]
    pub replaces: Option<i64>,
    /// Client-supplied modification time.
    pub last_modified: Option<DateTime<Utc>>,
    /// Secret the out-of-band callback must present.
    pub callback_secret: String,
    /// Expiry as a unix timestamp in seconds.
    pub expires_at: i64,
}

impl UploadSession {
    /// Key of this session in the TTL store.
    pub fn cache_key(&self) -> String {
        cache_key(&self.key)
    }

    /// Whether the session is past its expiry.
    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() >= self.expires_at
    }
}

fn cache_key(key: &str) -> String {
    format!("{UPLOAD_SESSION_PREFIX}{key}")
}

/// Result of relaying bytes for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpload {
    /// The record was finalized.
    Completed(File),
    /// The client went away; the partial object is gone and the placeholder undone.
    Canceled,
}

impl Engine {
    /// Create an upload session and its placeholder record.
    ///
    /// The placeholder belongs to `uow`; it exists once the unit commits.
    pub async fn create_upload_session(
        &self,
        uow: &mut UnitOfWork<'_>,
        cancel: &CancellationToken,
        mut header: FileHeader,
    ) -> Result<UploadCredential> {
        let key = Uuid::new_v4().to_string();
        let declared_size = header.size;
        header.mode = UploadMode::Nop;
        header.upload_session_id = Some(key.clone());
        header.virtual_path = clean_path(&header.virtual_path);

        self.resolve_origin(uow, &mut header).await?;
        let replaces = header.origin.as_ref().map(|origin| origin.id);
        header.save_path =
            self.policy()
                .generate_save_path(self.user().id, &header.virtual_path, &header.name);

        let virtual_path = header.virtual_path.clone();
        let name = header.name.clone();
        let last_modified = header.last_modified;
        let save_path = header.save_path.clone();

        self.install_preset(HookPreset::Session);
        let placeholder = self
            .upload(
                uow,
                cancel,
                FileStream::new(header, Box::new(tokio::io::empty())),
            )
            .await?;

        let ttl = Duration::from_secs(self.context().config.upload.session_timeout_secs);
        let session = UploadSession {
            key: key.clone(),
            user_id: self.user().id,
            policy: self.policy().clone(),
            virtual_path: virtual_path.clone(),
            name: name.clone(),
            size: declared_size,
            save_path,
            replaces,
            last_modified,
            callback_secret: rand::rng()
                .sample_iter(&Alphanumeric)
                .take(32)
                .map(char::from)
                .collect(),
            expires_at: Utc::now().timestamp() + ttl.as_secs() as i64,
        };

        let token_header =
            FileHeader::new(virtual_path, name, declared_size).with_save_path(&session.save_path);
        let mut credential = self
            .handler()
            .token(cancel, ttl, &session, &token_header)
            .await?;
        credential.expires = session.expires_at;

        self.context()
            .cache
            .set_json(&session.cache_key(), &session, ttl)?;
        info!(
            user_id = self.user().id,
            session = %key,
            file_id = placeholder.id,
            "upload session created"
        );
        Ok(credential)
    }

    /// Fetch a live upload session of the acting user.
    pub fn get_upload_session(&self, key: &str) -> Result<UploadSession> {
        let session: Option<UploadSession> = self.context().cache.get_json(&cache_key(key))?;
        match session {
            Some(session) if session.user_id == self.user().id && !session.is_expired() => {
                Ok(session)
            }
            _ => Err(NimbusError::NotExist(format!("upload session {key}"))),
        }
    }

    /// Relay the bytes of an upload session through the engine.
    ///
    /// A client that goes away yields `Ok(SessionUpload::Canceled)`; the
    /// cleanup happens inside `uow`, which the caller still commits.
    pub async fn upload_session_data(
        &self,
        uow: &mut UnitOfWork<'_>,
        request: &CancellationToken,
        key: &str,
        reader: ByteReader,
    ) -> Result<SessionUpload> {
        let session = self.get_upload_session(key)?;
        if session.policy.id != self.policy().id {
            return Err(NimbusError::Validation(format!(
                "upload session {key} belongs to policy {}",
                session.policy.id
            )));
        }

        let mut header = FileHeader::new(&session.virtual_path, &session.name, session.size)
            .with_save_path(&session.save_path);
        header.upload_session_id = Some(session.key.clone());
        header.last_modified = session.last_modified;
        if let Some(id) = session.replaces {
            header.origin = FileRepository::new(uow.conn()).get_by_id(id).await?;
        }

        self.install_preset(HookPreset::SessionData);
        match self.upload(uow, request, FileStream::new(header, reader)).await {
            Ok(file) => Ok(SessionUpload::Completed(file)),
            Err(NimbusError::Canceled) => Ok(SessionUpload::Canceled),
            Err(e) => Err(e),
        }
    }

    /// Finish a session whose bytes were written out of band.
    pub async fn complete_upload(
        &self,
        uow: &mut UnitOfWork<'_>,
        key: &str,
        size: i64,
        pic_info: &str,
    ) -> Result<File> {
        let session = self.get_upload_session(key)?;
        let file = self
            .finalize_placeholder(uow, &session, size, pic_info)
            .await?;
        if pic_info.is_empty() && session.policy.thumb_needed {
            self.queue_thumbnail(file.clone());
        }
        Ok(file)
    }

    /// Cancel a session: remove its object, its placeholder and the session itself.
    ///
    /// A session that overwrites a file leaves that file as it was.
    pub async fn cancel_upload_session(
        &self,
        uow: &mut UnitOfWork<'_>,
        cancel: &CancellationToken,
        key: &str,
    ) -> Result<()> {
        let session = self.get_upload_session(key)?;

        let origin = match session.replaces {
            Some(id) => FileRepository::new(uow.conn()).get_by_id(id).await?,
            None => None,
        };
        let owned_by_origin = origin.as_ref().is_some_and(|origin| {
            origin.source_name == session.save_path && origin.policy_id == session.policy.id
        });
        if !owned_by_origin {
            let handler = self.context().handlers.dispatch(&session.policy).await?;
            let failed = handler
                .delete(cancel, std::slice::from_ref(&session.save_path))
                .await?;
            if !failed.is_empty() {
                warn!(key = %session.save_path, "object of canceled session could not be removed");
            }
        }

        self.drop_placeholder(uow, &session).await?;
        debug!(session = %key, "upload session canceled");
        Ok(())
    }

    /// Undo the placeholder of a session that will not finish.
    ///
    /// A new file's placeholder is deleted. A replaced file only loses its
    /// session mark. The session leaves the TTL store once `uow` commits.
    pub(crate) async fn drop_placeholder(
        &self,
        uow: &mut UnitOfWork<'_>,
        session: &UploadSession,
    ) -> Result<()> {
        let placeholder = FileRepository::new(uow.conn())
            .get_by_upload_session(self.user().id, &session.key)
            .await?;
        match placeholder {
            Some(file) if session.replaces == Some(file.id) => {
                FileRepository::new(uow.conn())
                    .set_upload_session(file.id, None)
                    .await?;
            }
            Some(file) => {
                FileRepository::new(uow.conn())
                    .delete_batch(std::slice::from_ref(&file))
                    .await?;
                ShareRepository::new(uow.conn())
                    .delete_by_source_ids(&[file.id], false)
                    .await?;
            }
            None => {}
        }
        self.queue_forget_session(&session.key);
        Ok(())
    }

    /// Drop a session from the TTL store.
    pub(crate) fn forget_upload_session(&self, key: &str) {
        self.context().cache.delete(&cache_key(key));
    }

    /// Give the placeholder of a session its final object and size.
    ///
    /// A replaced file is pointed at the new object; its old object goes
    /// away once `uow` commits, as does the session.
    pub(crate) async fn finalize_placeholder(
        &self,
        uow: &mut UnitOfWork<'_>,
        session: &UploadSession,
        size: i64,
        pic_info: &str,
    ) -> Result<File> {
        let key = &session.key;
        let mut files = FileRepository::new(uow.conn());
        let placeholder = files
            .get_by_upload_session(self.user().id, key)
            .await?
            .ok_or_else(|| NimbusError::NotExist(format!("placeholder of session {key}")))?;

        let replaced = placeholder.source_name != session.save_path
            || placeholder.policy_id != session.policy.id;
        if replaced {
            files
                .update_source_name(placeholder.id, session.policy.id, &session.save_path)
                .await?;
        }
        if placeholder.size != size {
            files.update_size(&placeholder, size).await?;
        }
        files
            .finalize_upload(placeholder.id, session.last_modified, pic_info)
            .await?;
        let file = files
            .get_by_id(placeholder.id)
            .await?
            .ok_or_else(|| NimbusError::NotExist("file".to_string()))?;

        if replaced {
            self.retire_object(uow, &placeholder).await?;
        }
        self.queue_forget_session(key);
        debug!(session = %key, file_id = file.id, size, "upload session finalized");
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_cache_key_and_expiry() {
        let session = UploadSession {
            key: "abc".to_string(),
            user_id: 1,
            policy: Policy::default(),
            virtual_path: "/".to_string(),
            name: "b.jpg".to_string(),
            size: 3,
            save_path: "k".to_string(),
            replaces: None,
            last_modified: None,
            callback_secret: "s".to_string(),
            expires_at: Utc::now().timestamp() - 1,
        };
        assert_eq!(session.cache_key(), "callback_abc");
        assert!(session.is_expired());

        let live = UploadSession {
            expires_at: Utc::now().timestamp() + 60,
            ..session
        };
        assert!(!live.is_expired());

        let json = serde_json::to_string(&live).unwrap();
        let back: UploadSession = serde_json::from_str(&json).unwrap();
        assert_eq!(back, live);
    }
}
