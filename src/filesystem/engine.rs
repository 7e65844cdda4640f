//! The filesystem engine.
//!
//! An [`Engine`] binds one user and one storage policy to the shared
//! [`ServiceContext`]. Every operation takes the unit of work it runs in;
//! the engine never commits on its own except through [`Engine::commit`].

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    clean_path, split_parent, split_path, validate_name, File, FileRepository, Folder,
    FolderRepository, Hook, HookContext, HookEvent, HookPayload, HookPreset, HookRegistry, Policy,
    PolicyRepository,
};
use crate::context::ServiceContext;
use crate::db::{UnitOfWork, User, UserRepository};
use crate::storage::{Object, StorageHandler};
use crate::{NimbusError, Result};

/// Kind of a listed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    /// A folder.
    Dir,
    /// A file.
    File,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectView {
    /// File or folder ID.
    pub id: i64,
    /// Name.
    pub name: String,
    /// Virtual directory containing the entry.
    pub path: String,
    /// Image dimensions for files, empty otherwise.
    pub pic: String,
    /// Size in bytes (0 for folders).
    pub size: i64,
    /// Entry kind.
    #[serde(rename = "type")]
    pub kind: ObjectKind,
    /// Last modification time.
    pub date: String,
}

/// Orchestrates metadata, physical storage and the quota ledger for one user.
pub struct Engine {
    ctx: Arc<ServiceContext>,
    user: User,
    policy: Policy,
    handler: Arc<dyn StorageHandler>,
    hooks: Mutex<HookRegistry>,
    deferred: Mutex<Deferred>,
}

/// Work that only makes sense once the running unit of work has committed.
#[derive(Default)]
struct Deferred {
    thumbnails: Vec<File>,
    sessions: Vec<String>,
    objects: Vec<(Arc<dyn StorageHandler>, Vec<String>)>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Engine {
    /// Create an engine for `user` writing through `policy`.
    pub async fn new(ctx: Arc<ServiceContext>, user: User, policy: Policy) -> Result<Self> {
        let handler = ctx.handlers.dispatch(&policy).await?;
        Ok(Self {
            ctx,
            user,
            policy,
            handler,
            hooks: Mutex::new(HookRegistry::new()),
            deferred: Mutex::new(Deferred::default()),
        })
    }

    /// Load a user and its policy and create an engine for them.
    pub async fn for_user(
        ctx: Arc<ServiceContext>,
        uow: &mut UnitOfWork<'_>,
        user_id: i64,
    ) -> Result<Self> {
        let user = UserRepository::new(uow.conn())
            .get_by_id(user_id)
            .await?
            .ok_or_else(|| NimbusError::NotExist(format!("user {user_id}")))?;
        let policy = PolicyRepository::new(uow.conn())
            .get_by_id(user.policy_id)
            .await?
            .ok_or_else(|| NimbusError::NotExist(format!("policy {}", user.policy_id)))?;
        Self::new(ctx, user, policy).await
    }

    /// Write through another policy from now on.
    pub async fn switch_policy(&mut self, policy: Policy) -> Result<()> {
        self.handler = self.ctx.handlers.dispatch(&policy).await?;
        self.policy = policy;
        Ok(())
    }

    /// The acting user.
    pub fn user(&self) -> &User {
        &self.user
    }

    /// The active storage policy.
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Handler of the active policy.
    pub fn handler(&self) -> &Arc<dyn StorageHandler> {
        &self.handler
    }

    /// Shared services.
    pub fn context(&self) -> &Arc<ServiceContext> {
        &self.ctx
    }

    /// Handler for an arbitrary policy ID.
    pub(crate) async fn handler_for(
        &self,
        uow: &mut UnitOfWork<'_>,
        policy_id: i64,
    ) -> Result<(Policy, Arc<dyn StorageHandler>)> {
        if policy_id == self.policy.id {
            return Ok((self.policy.clone(), Arc::clone(&self.handler)));
        }
        let policy = PolicyRepository::new(uow.conn())
            .get_by_id(policy_id)
            .await?
            .ok_or_else(|| NimbusError::NotExist(format!("policy {policy_id}")))?;
        let handler = self.ctx.handlers.dispatch(&policy).await?;
        Ok((policy, handler))
    }

    /// Register a hook. Built-in presets are not installed over caller hooks.
    pub fn use_hook(&self, event: HookEvent, hook: Arc<dyn Hook>) {
        lock(&self.hooks).register_custom(event, hook);
    }

    /// Install a built-in hook chain unless one is already in place.
    pub fn install_preset(&self, preset: HookPreset) {
        let mut hooks = lock(&self.hooks);
        if hooks.is_custom() || hooks.preset() == Some(preset) {
            return;
        }
        *hooks = HookRegistry::with_preset(preset);
        debug!(?preset, "hook preset installed");
    }

    /// Names of the hooks currently attached to an event.
    pub fn hook_names(&self, event: HookEvent) -> Vec<String> {
        lock(&self.hooks).names(event)
    }

    /// Run the hooks of `event` in order, stopping at the first error.
    pub(crate) async fn trigger(
        &self,
        uow: &mut UnitOfWork<'_>,
        event: HookEvent,
        payload: HookPayload<'_>,
    ) -> Result<()> {
        let hooks = lock(&self.hooks).hooks(event);
        if hooks.is_empty() {
            return Ok(());
        }

        let mut ctx = HookContext {
            engine: self,
            uow,
            event,
            payload,
        };
        for hook in hooks {
            if let Err(e) = hook.call(&mut ctx).await {
                debug!(hook = hook.name(), ?event, error = %e, "hook failed");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Fire a failure event. Errors of compensating hooks are only logged.
    pub(crate) async fn compensate(
        &self,
        uow: &mut UnitOfWork<'_>,
        event: HookEvent,
        payload: HookPayload<'_>,
    ) {
        if let Err(e) = self.trigger(uow, event, payload).await {
            warn!(?event, error = %e, "compensating hooks failed");
        }
    }

    /// Remember a new record for thumbnail generation once its unit commits.
    pub(crate) fn queue_thumbnail(&self, file: File) {
        lock(&self.deferred).thumbnails.push(file);
    }

    /// Drop an upload session from the TTL store once its unit commits.
    pub(crate) fn queue_forget_session(&self, key: &str) {
        lock(&self.deferred).sessions.push(key.to_string());
    }

    /// Remove the object `file` pointed at once its unit commits, unless
    /// another record still references it.
    pub(crate) async fn retire_object(&self, uow: &mut UnitOfWork<'_>, file: &File) -> Result<()> {
        if FileRepository::new(uow.conn())
            .is_source_shared(file)
            .await?
        {
            return Ok(());
        }
        let (_, handler) = self.handler_for(uow, file.policy_id).await?;
        let suffix = &self.ctx.config.thumbnail.file_suffix;
        let keys = vec![
            file.source_name.clone(),
            format!("{}{}", file.source_name, suffix),
        ];
        lock(&self.deferred).objects.push((handler, keys));
        Ok(())
    }

    /// Start generation for every queued record. Returns how many were queued.
    pub fn flush_thumbnails(&self) -> usize {
        let files = std::mem::take(&mut lock(&self.deferred).thumbnails);
        let count = files.len();
        if count > 0 {
            self.schedule_thumbnails(files);
        }
        count
    }

    /// Run the work queued by the operations of a committed unit.
    ///
    /// Call this after committing a unit the engine did not commit itself.
    pub async fn after_commit(&self) {
        let (sessions, objects) = {
            let mut deferred = lock(&self.deferred);
            (
                std::mem::take(&mut deferred.sessions),
                std::mem::take(&mut deferred.objects),
            )
        };
        for key in &sessions {
            self.forget_upload_session(key);
        }
        for (handler, keys) in objects {
            match handler.delete(&CancellationToken::new(), &keys).await {
                Ok(failed) if failed.is_empty() => {}
                Ok(failed) => warn!(?failed, "replaced objects could not be removed"),
                Err(e) => warn!(error = %e, "replaced objects could not be removed"),
            }
        }
        self.flush_thumbnails();
    }

    /// Commit a unit of work and run the work its operations queued.
    pub async fn commit(&self, uow: UnitOfWork<'_>) -> Result<()> {
        uow.commit().await?;
        self.after_commit().await;
        Ok(())
    }

    /// Roll back a unit of work and drop the work its operations queued.
    pub async fn rollback(&self, uow: UnitOfWork<'_>) -> Result<()> {
        *lock(&self.deferred) = Deferred::default();
        uow.rollback().await
    }

    /// List a virtual directory. Placeholders of unfinished uploads are hidden.
    pub async fn list(&self, uow: &mut UnitOfWork<'_>, path: &str) -> Result<Vec<ObjectView>> {
        let path = clean_path(path);
        let folder = FolderRepository::new(uow.conn())
            .resolve_path(self.user.id, &path)
            .await?
            .ok_or_else(|| NimbusError::NotExist(path.clone()))?;

        let folders = FolderRepository::new(uow.conn())
            .list_children(folder.id)
            .await?;
        let files = FileRepository::new(uow.conn())
            .list_by_folder(folder.id)
            .await?;

        let mut objects: Vec<ObjectView> = folders
            .into_iter()
            .map(|f| ObjectView {
                id: f.id,
                name: f.name,
                path: path.clone(),
                pic: String::new(),
                size: 0,
                kind: ObjectKind::Dir,
                date: f.updated_at,
            })
            .collect();
        objects.extend(
            files
                .into_iter()
                .filter(|f| !f.is_placeholder())
                .map(|f| ObjectView {
                    id: f.id,
                    name: f.name,
                    path: path.clone(),
                    pic: f.pic_info,
                    size: f.size,
                    kind: ObjectKind::File,
                    date: f.updated_at,
                }),
        );
        Ok(objects)
    }

    /// Finished files under `path` whose name contains any of `keywords`.
    pub async fn search(
        &self,
        uow: &mut UnitOfWork<'_>,
        path: &str,
        keywords: &[&str],
    ) -> Result<Vec<File>> {
        let root = self.resolve_directory(uow, path).await?;
        let tree = FolderRepository::new(uow.conn())
            .recursive_children(&[root.id], self.user.id)
            .await?;
        let parents: Vec<i64> = tree.iter().map(|f| f.id).collect();
        FileRepository::new(uow.conn())
            .search(self.user.id, &parents, keywords)
            .await
    }

    /// List physical objects of the active policy. Empty unless the policy is listable.
    pub async fn list_physical(&self, cancel: &CancellationToken, path: &str) -> Result<Vec<Object>> {
        if !self.policy.listable {
            return Ok(Vec::new());
        }
        self.handler.list(cancel, path, false).await
    }

    /// Create a directory and any missing parents.
    ///
    /// Fails with `AlreadyExists` when the directory itself exists.
    pub async fn create_directory(&self, uow: &mut UnitOfWork<'_>, path: &str) -> Result<Folder> {
        let (parent_path, name) = split_parent(path);
        if name.is_empty() {
            return Err(NimbusError::AlreadyExists("/".to_string()));
        }
        validate_name(&name)?;

        let parent = self.ensure_directory(uow, &parent_path).await?;
        let mut folder = FolderRepository::new(uow.conn())
            .create(self.user.id, parent.id, &name)
            .await?;
        folder.position = parent.full_path();
        debug!(user_id = self.user.id, path = %folder.full_path(), "directory created");
        Ok(folder)
    }

    /// Resolve a directory, creating it and its parents when missing.
    pub async fn ensure_directory(&self, uow: &mut UnitOfWork<'_>, path: &str) -> Result<Folder> {
        let mut folders = FolderRepository::new(uow.conn());
        let mut current = folders.root_of(self.user.id).await?;

        for segment in split_path(path) {
            let position = current.full_path();
            let mut next = match folders.get_child_folder(current.id, segment).await? {
                Some(folder) => folder,
                None => {
                    validate_name(segment)?;
                    folders.create(self.user.id, current.id, segment).await?
                }
            };
            next.position = position;
            current = next;
        }
        Ok(current)
    }

    /// Resolve an existing directory.
    pub(crate) async fn resolve_directory(
        &self,
        uow: &mut UnitOfWork<'_>,
        path: &str,
    ) -> Result<Folder> {
        FolderRepository::new(uow.conn())
            .resolve_path(self.user.id, path)
            .await?
            .ok_or_else(|| NimbusError::NotExist(clean_path(path)))
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("user", &self.user.id)
            .field("policy", &self.policy.id)
            .field("handler", &self.handler.kind())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::config::Config;
    use crate::db::{Database, NewUser};
    use crate::filesystem::{FnHook, NewPolicy};

    async fn engine() -> (Engine, Database) {
        let db = Database::open_in_memory().await.unwrap();
        let ctx = Arc::new(ServiceContext::new(
            Config::default(),
            db.clone(),
            Arc::new(MemoryStore::default()),
        ));
        let mut uow = UnitOfWork::begin(&db).await.unwrap();
        let policy = PolicyRepository::new(uow.conn())
            .create(&NewPolicy::new("mem", "memory"))
            .await
            .unwrap();
        let user = UserRepository::new(uow.conn())
            .create(&NewUser::new("engine", policy.id))
            .await
            .unwrap();
        let engine = Engine::for_user(ctx, &mut uow, user.id).await.unwrap();
        uow.commit().await.unwrap();
        (engine, db)
    }

    #[tokio::test]
    async fn test_directories() {
        let (engine, db) = engine().await;
        let mut uow = UnitOfWork::begin(&db).await.unwrap();

        let folder = engine.create_directory(&mut uow, "/a/b/c").await.unwrap();
        assert_eq!(folder.full_path(), "/a/b/c");

        let err = engine.create_directory(&mut uow, "/a/b").await.unwrap_err();
        assert!(err.is_already_exists());
        assert!(engine.create_directory(&mut uow, "/").await.is_err());
        assert!(matches!(
            engine.create_directory(&mut uow, "/a/bad?").await,
            Err(NimbusError::IllegalName(_))
        ));

        let again = engine.ensure_directory(&mut uow, "/a/b/c").await.unwrap();
        assert_eq!(again.id, folder.id);
        assert_eq!(again.position, "/a/b");

        let listed = engine.list(&mut uow, "/a").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "b");
        assert_eq!(listed[0].kind, ObjectKind::Dir);
        assert!(engine.list(&mut uow, "/missing").await.is_err());
    }

    #[tokio::test]
    async fn test_preset_not_installed_over_custom_hooks() {
        let (engine, _db) = engine().await;

        engine.install_preset(HookPreset::Stream);
        assert_eq!(
            engine.hook_names(HookEvent::BeforeUpload),
            vec!["validate_file", "validate_capacity"]
        );
        engine.install_preset(HookPreset::Session);
        assert_eq!(
            engine.hook_names(HookEvent::AfterUpload),
            vec!["clear_file_size", "create_file_record"]
        );

        engine.use_hook(
            HookEvent::BeforeUpload,
            Arc::new(FnHook::new("mine", |_, _| Ok(()))),
        );
        engine.install_preset(HookPreset::Stream);
        assert_eq!(
            engine.hook_names(HookEvent::BeforeUpload),
            vec!["validate_file", "validate_capacity", "mine"]
        );
    }

    #[tokio::test]
    async fn test_list_physical_requires_listable_policy() {
        let (engine, _db) = engine().await;
        let listed = engine
            .list_physical(&CancellationToken::new(), "/")
            .await
            .unwrap();
        assert!(listed.is_empty());
    }
}
