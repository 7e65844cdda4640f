//! Test helpers for engine integration tests.
//!
//! Provides a [`Fixture`] with a file-backed database, one user and one
//! in-memory storage policy whose handler the test can inspect.

#![allow(dead_code)]

use std::sync::Arc;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use nimbus::filesystem::{FileRepository, FolderRepository};
use nimbus::{
    Config, Database, Engine, File, FileStream, Folder, MemoryHandler, MemoryStore, NewPolicy,
    NewUser, Policy, PolicyRepository, QuotaLedger, ServiceContext, StorageHandler, UnitOfWork,
    User, UserRepository,
};

/// Capacity given to the fixture user unless a test asks for another.
pub const DEFAULT_CAPACITY: i64 = 1024 * 1024;

/// A user with a policy backed by an inspectable memory store.
pub struct Fixture {
    pub ctx: Arc<ServiceContext>,
    pub storage: Arc<MemoryHandler>,
    pub policy: Policy,
    pub user: User,
    _dir: TempDir,
}

impl Fixture {
    /// Fixture with the default memory policy.
    pub async fn new() -> Self {
        Self::with_policy(NewPolicy::new("memory", "memory"), DEFAULT_CAPACITY).await
    }

    /// Fixture with a custom policy and user capacity.
    pub async fn with_policy(policy: NewPolicy, capacity: i64) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_with(dir.path().join("nimbus.db"), 4)
            .await
            .unwrap();

        let mut config = Config::default();
        config.storage.local_root = dir.path().join("uploads").display().to_string();
        config.thumbnail.max_task_count = 2;
        let ctx = Arc::new(ServiceContext::new(
            config,
            db.clone(),
            Arc::new(MemoryStore::default()),
        ));

        let mut uow = UnitOfWork::begin(&db).await.unwrap();
        let policy = PolicyRepository::new(uow.conn())
            .create(&policy)
            .await
            .unwrap();
        let user = UserRepository::new(uow.conn())
            .create(&NewUser::new("alice", policy.id).with_capacity(capacity))
            .await
            .unwrap();
        uow.commit().await.unwrap();

        let storage = Arc::new(MemoryHandler::new(&ctx.config.thumbnail.file_suffix));
        let handler: Arc<dyn StorageHandler> = storage.clone();
        ctx.handlers.register(policy.id, handler).await;

        Self {
            ctx,
            storage,
            policy,
            user,
            _dir: dir,
        }
    }

    /// Begin a unit of work.
    pub async fn begin(&self) -> UnitOfWork<'static> {
        UnitOfWork::begin(&self.ctx.db).await.unwrap()
    }

    /// A fresh engine for the fixture user.
    pub async fn engine(&self) -> Engine {
        Engine::new(
            Arc::clone(&self.ctx),
            self.user.clone(),
            self.policy.clone(),
        )
        .await
        .unwrap()
    }

    /// Bytes charged to the fixture user.
    pub async fn used(&self) -> i64 {
        let mut uow = self.begin().await;
        QuotaLedger::new(uow.conn()).used(self.user.id).await.unwrap()
    }

    /// Load a file record by ID.
    pub async fn file(&self, id: i64) -> Option<File> {
        let mut uow = self.begin().await;
        FileRepository::new(uow.conn()).get_by_id(id).await.unwrap()
    }

    /// Resolve a directory of the fixture user.
    pub async fn folder(&self, path: &str) -> Option<Folder> {
        let mut uow = self.begin().await;
        FolderRepository::new(uow.conn())
            .resolve_path(self.user.id, path)
            .await
            .unwrap()
    }
}

/// Upload `bytes` as `path/name` and commit.
pub async fn upload(engine: &Engine, fixture: &Fixture, path: &str, name: &str, bytes: &[u8]) -> File {
    let mut uow = fixture.begin().await;
    let file = engine
        .upload_from_stream(
            &mut uow,
            &CancellationToken::new(),
            FileStream::from_bytes(path, name, bytes.to_vec()),
        )
        .await
        .unwrap();
    engine.commit(uow).await.unwrap();
    file
}

/// A PNG of the given dimensions.
pub fn png(width: u32, height: u32) -> Vec<u8> {
    let image = image::DynamicImage::ImageRgb8(image::RgbImage::new(width, height));
    let mut bytes = Vec::new();
    image
        .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    bytes
}
