//! Hook pipeline.
//!
//! Orchestration methods fire a [`HookEvent`] at fixed points of an upload or
//! import. Hooks registered for the event run in registration order against a
//! shared [`HookContext`]; the first error stops the chain and is handed back
//! to the orchestration method, which then fires the matching failure event.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{Engine, FileHeader, FileRepository, Folder, FolderRepository, NewFile};
use super::{ValidateCapacity, ValidateFile, ValidateThumbnailExtension};
use crate::db::UnitOfWork;
use crate::{NimbusError, Result};

/// Points in an operation where hooks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    /// Before any bytes are written.
    BeforeUpload,
    /// Before an existing physical object is recorded.
    BeforeAddFile,
    /// After the bytes are in place.
    AfterUpload,
    /// The upload failed before or while writing.
    AfterUploadFailed,
    /// The client went away while bytes were being written.
    AfterUploadCanceled,
    /// An `AfterUpload` hook rejected the upload.
    AfterValidateFailed,
}

/// Event data handed to hooks.
#[derive(Debug)]
pub enum HookPayload<'p> {
    /// A file being uploaded.
    File(&'p mut FileHeader),
    /// A physical object being added to `parent`.
    AddFile {
        /// The object being added.
        header: &'p mut FileHeader,
        /// Destination folder.
        parent: &'p Folder,
    },
}

impl HookPayload<'_> {
    /// The file the event is about.
    pub fn header(&self) -> &FileHeader {
        match self {
            HookPayload::File(header) => header,
            HookPayload::AddFile { header, .. } => header,
        }
    }

    /// Mutable access to the file the event is about.
    pub fn header_mut(&mut self) -> &mut FileHeader {
        match self {
            HookPayload::File(header) => header,
            HookPayload::AddFile { header, .. } => header,
        }
    }

    /// Destination folder of an add-file event.
    pub fn parent(&self) -> Option<&Folder> {
        match self {
            HookPayload::File(_) => None,
            HookPayload::AddFile { parent, .. } => Some(*parent),
        }
    }
}

/// Everything a hook can see and touch.
pub struct HookContext<'a, 'c> {
    /// Engine firing the event.
    pub engine: &'a Engine,
    /// Unit of work of the running operation.
    pub uow: &'a mut UnitOfWork<'c>,
    /// Event being fired.
    pub event: HookEvent,
    /// Event data.
    pub payload: HookPayload<'a>,
}

/// A callback attached to an event.
#[async_trait]
pub trait Hook: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Run the hook. An error aborts the chain.
    async fn call(&self, ctx: &mut HookContext<'_, '_>) -> Result<()>;
}

/// A hook backed by a plain closure over the event and file header.
pub struct FnHook<F> {
    name: String,
    f: F,
}

impl<F> FnHook<F>
where
    F: Fn(HookEvent, &mut FileHeader) -> Result<()> + Send + Sync,
{
    /// Wrap a closure.
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> Hook for FnHook<F>
where
    F: Fn(HookEvent, &mut FileHeader) -> Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, ctx: &mut HookContext<'_, '_>) -> Result<()> {
        (self.f)(ctx.event, ctx.payload.header_mut())
    }
}

/// Built-in hook chains for the engine's entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPreset {
    /// Streamed upload through the engine.
    Stream,
    /// Upload session creation (placeholder only).
    Session,
    /// Bytes arriving for an existing upload session.
    SessionData,
    /// Recording objects already present in storage.
    Import,
}

/// Ordered hooks per event.
#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: HashMap<HookEvent, Vec<Arc<dyn Hook>>>,
    preset: Option<HookPreset>,
    custom: bool,
}

impl HookRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the chain of a preset.
    pub fn with_preset(preset: HookPreset) -> Self {
        use HookEvent::*;

        let mut registry = Self::new();
        match preset {
            HookPreset::Stream => {
                registry.register(BeforeUpload, Arc::new(ValidateFile));
                registry.register(BeforeUpload, Arc::new(ValidateCapacity));
                registry.register(AfterUploadCanceled, Arc::new(DeleteTempFile));
                registry.register(AfterUploadFailed, Arc::new(DeleteTempFile));
                registry.register(AfterUpload, Arc::new(CreateFileRecord));
                registry.register(AfterUpload, Arc::new(GenerateThumb));
                registry.register(AfterValidateFailed, Arc::new(DeleteTempFile));
            }
            HookPreset::Session => {
                registry.register(BeforeUpload, Arc::new(ValidateFile));
                registry.register(BeforeUpload, Arc::new(ValidateCapacity));
                registry.register(AfterUpload, Arc::new(ClearFileSize));
                registry.register(AfterUpload, Arc::new(CreateFileRecord));
            }
            HookPreset::SessionData => {
                registry.register(AfterUpload, Arc::new(FinalizeSession));
                registry.register(AfterUpload, Arc::new(GenerateThumb));
                registry.register(AfterUploadCanceled, Arc::new(DeleteTempFile));
                registry.register(AfterUploadCanceled, Arc::new(RemovePlaceholder));
                registry.register(AfterUploadFailed, Arc::new(DeleteTempFile));
                registry.register(AfterValidateFailed, Arc::new(DeleteTempFile));
            }
            HookPreset::Import => {
                registry.register(BeforeAddFile, Arc::new(ValidateFile));
                registry.register(BeforeAddFile, Arc::new(ValidateThumbnailExtension));
                registry.register(BeforeAddFile, Arc::new(ValidateCapacity));
            }
        }
        registry.preset = Some(preset);
        registry
    }

    /// Append a hook to an event.
    pub fn register(&mut self, event: HookEvent, hook: Arc<dyn Hook>) {
        self.hooks.entry(event).or_default().push(hook);
    }

    /// Append a hook registered by a caller. Presets are no longer installed
    /// over a registry with caller hooks.
    pub(crate) fn register_custom(&mut self, event: HookEvent, hook: Arc<dyn Hook>) {
        self.custom = true;
        self.register(event, hook);
    }

    /// Snapshot of the hooks of an event.
    pub fn hooks(&self, event: HookEvent) -> Vec<Arc<dyn Hook>> {
        self.hooks.get(&event).cloned().unwrap_or_default()
    }

    /// Names of the hooks of an event, in order.
    pub fn names(&self, event: HookEvent) -> Vec<String> {
        self.hooks
            .get(&event)
            .map(|hooks| hooks.iter().map(|h| h.name().to_string()).collect())
            .unwrap_or_default()
    }

    /// Preset the registry was built from.
    pub fn preset(&self) -> Option<HookPreset> {
        self.preset
    }

    /// Whether a caller registered hooks directly.
    pub fn is_custom(&self) -> bool {
        self.custom
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut counts: Vec<(HookEvent, usize)> =
            self.hooks.iter().map(|(e, h)| (*e, h.len())).collect();
        counts.sort_by_key(|(e, _)| format!("{e:?}"));
        f.debug_struct("HookRegistry")
            .field("hooks", &counts)
            .field("preset", &self.preset)
            .field("custom", &self.custom)
            .finish()
    }
}

/// Zero the size of a placeholder unless the policy keeps declared sizes.
pub struct ClearFileSize;

#[async_trait]
impl Hook for ClearFileSize {
    fn name(&self) -> &str {
        "clear_file_size"
    }

    async fn call(&self, ctx: &mut HookContext<'_, '_>) -> Result<()> {
        if !ctx.engine.policy().placeholder_with_size {
            ctx.payload.header_mut().size = 0;
        }
        Ok(())
    }
}

/// Insert the file record, or update the record being overwritten.
pub struct CreateFileRecord;

#[async_trait]
impl Hook for CreateFileRecord {
    fn name(&self) -> &str {
        "create_file_record"
    }

    async fn call(&self, ctx: &mut HookContext<'_, '_>) -> Result<()> {
        let engine = ctx.engine;
        let header = ctx.payload.header_mut();
        let folder = engine.ensure_directory(ctx.uow, &header.virtual_path).await?;

        if let Some(origin) = header.origin.clone() {
            let mut files = FileRepository::new(ctx.uow.conn());
            if let Some(key) = header.upload_session_id.as_deref() {
                // The replaced file stays intact until the session finishes.
                files.set_upload_session(origin.id, Some(key)).await?;
                header.record = files.get_by_id(origin.id).await?;
                return Ok(());
            }

            let replaced = origin.source_name != header.save_path
                || origin.policy_id != engine.policy().id;
            if replaced {
                files
                    .update_source_name(origin.id, engine.policy().id, &header.save_path)
                    .await?;
            }
            files.update_size(&origin, header.size).await?;
            header.record = files.get_by_id(origin.id).await?;
            if replaced {
                engine.retire_object(ctx.uow, &origin).await?;
            }
            return Ok(());
        }

        if FolderRepository::new(ctx.uow.conn())
            .name_taken(folder.id, &header.name)
            .await?
        {
            return Err(NimbusError::AlreadyExists(header.full_path()));
        }

        let mut new_file = NewFile::new(
            &header.name,
            engine.user().id,
            folder.id,
            engine.policy().id,
            &header.save_path,
            header.size,
        )
        .with_updated_at(header.last_modified);
        if let Some(key) = &header.upload_session_id {
            new_file = new_file.with_upload_session(key);
        }

        let mut record = FileRepository::new(ctx.uow.conn()).create(&new_file).await?;
        record.position = folder.full_path();
        header.record = Some(record);
        Ok(())
    }
}

/// Remove the physical object written for the upload.
pub struct DeleteTempFile;

#[async_trait]
impl Hook for DeleteTempFile {
    fn name(&self) -> &str {
        "delete_temp_file"
    }

    async fn call(&self, ctx: &mut HookContext<'_, '_>) -> Result<()> {
        let header = ctx.payload.header();
        let key = header.save_path.clone();
        if key.is_empty() {
            return Ok(());
        }
        let owned_by_origin = header.origin.as_ref().is_some_and(|origin| {
            origin.source_name == key && origin.policy_id == ctx.engine.policy().id
        });
        if owned_by_origin {
            return Ok(());
        }
        // The request token may already be canceled.
        let failed = ctx
            .engine
            .handler()
            .delete(&CancellationToken::new(), std::slice::from_ref(&key))
            .await?;
        if !failed.is_empty() {
            warn!(key = %key, "temporary object could not be removed");
        }
        Ok(())
    }
}

/// Queue thumbnail generation for the new record.
pub struct GenerateThumb;

#[async_trait]
impl Hook for GenerateThumb {
    fn name(&self) -> &str {
        "generate_thumb"
    }

    async fn call(&self, ctx: &mut HookContext<'_, '_>) -> Result<()> {
        if !ctx.engine.policy().thumb_needed {
            return Ok(());
        }
        if let Some(record) = &ctx.payload.header().record {
            ctx.engine.queue_thumbnail(record.clone());
        }
        Ok(())
    }
}

/// Drop the placeholder record and the stored session of a canceled upload.
pub struct RemovePlaceholder;

#[async_trait]
impl Hook for RemovePlaceholder {
    fn name(&self) -> &str {
        "remove_placeholder"
    }

    async fn call(&self, ctx: &mut HookContext<'_, '_>) -> Result<()> {
        let Some(key) = ctx.payload.header().upload_session_id.clone() else {
            return Ok(());
        };
        let session = ctx.engine.get_upload_session(&key)?;
        ctx.engine.drop_placeholder(ctx.uow, &session).await
    }
}

/// Turn the placeholder of the session into a finished record.
pub struct FinalizeSession;

#[async_trait]
impl Hook for FinalizeSession {
    fn name(&self) -> &str {
        "finalize_session"
    }

    async fn call(&self, ctx: &mut HookContext<'_, '_>) -> Result<()> {
        let engine = ctx.engine;
        let header = ctx.payload.header_mut();
        let key = header
            .upload_session_id
            .clone()
            .ok_or_else(|| NimbusError::NotExist("upload session".to_string()))?;

        let session = engine.get_upload_session(&key)?;
        let record = engine
            .finalize_placeholder(ctx.uow, &session, header.size, "")
            .await?;
        header.record = Some(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(registry: &HookRegistry, event: HookEvent) -> Vec<String> {
        registry.names(event)
    }

    #[test]
    fn test_stream_preset_order() {
        let registry = HookRegistry::with_preset(HookPreset::Stream);
        assert_eq!(registry.preset(), Some(HookPreset::Stream));
        assert!(!registry.is_custom());
        assert_eq!(
            names(&registry, HookEvent::BeforeUpload),
            vec!["validate_file", "validate_capacity"]
        );
        assert_eq!(
            names(&registry, HookEvent::AfterUpload),
            vec!["create_file_record", "generate_thumb"]
        );
        assert_eq!(
            names(&registry, HookEvent::AfterValidateFailed),
            vec!["delete_temp_file"]
        );
    }

    #[test]
    fn test_session_presets() {
        let session = HookRegistry::with_preset(HookPreset::Session);
        assert_eq!(
            names(&session, HookEvent::AfterUpload),
            vec!["clear_file_size", "create_file_record"]
        );
        assert!(session.hooks(HookEvent::AfterUploadCanceled).is_empty());

        let data = HookRegistry::with_preset(HookPreset::SessionData);
        assert_eq!(
            names(&data, HookEvent::AfterUploadCanceled),
            vec!["delete_temp_file", "remove_placeholder"]
        );
    }

    #[test]
    fn test_import_preset() {
        let registry = HookRegistry::with_preset(HookPreset::Import);
        assert_eq!(
            names(&registry, HookEvent::BeforeAddFile),
            vec![
                "validate_file",
                "validate_thumbnail_extension",
                "validate_capacity"
            ]
        );
        assert!(registry.hooks(HookEvent::BeforeUpload).is_empty());
    }

    #[test]
    fn test_register_appends_in_order() {
        let mut registry = HookRegistry::new();
        registry.register_custom(
            HookEvent::BeforeUpload,
            Arc::new(FnHook::new("a", |_, _| Ok(()))),
        );
        registry.register_custom(
            HookEvent::BeforeUpload,
            Arc::new(FnHook::new("b", |_, _| Ok(()))),
        );
        assert_eq!(names(&registry, HookEvent::BeforeUpload), vec!["a", "b"]);
        assert!(registry.is_custom());
        assert_eq!(registry.preset(), None);
    }

    #[test]
    fn test_payload_accessors() {
        let mut header = FileHeader::new("/", "a.txt", 1);
        let parent = Folder {
            id: 1,
            name: "/".to_string(),
            owner_id: 1,
            parent_id: None,
            created_at: String::new(),
            updated_at: String::new(),
            position: "/".to_string(),
        };

        let mut payload = HookPayload::AddFile {
            header: &mut header,
            parent: &parent,
        };
        payload.header_mut().size = 5;
        assert_eq!(payload.parent().map(|p| p.id), Some(1));
        assert_eq!(payload.header().size, 5);

        let payload = HookPayload::File(&mut header);
        assert!(payload.parent().is_none());
    }
}
