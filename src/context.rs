//! Process-wide service bundle.
//!
//! Built once at startup and shared by reference with every [`Engine`].
//! Nothing in the crate reaches for hidden globals; the thumbnail pool,
//! storage handlers and session store all hang off this context.
//!
//! [`Engine`]: crate::filesystem::Engine

use std::sync::Arc;

use tracing::info;

use crate::cache::{MemoryStore, TtlStore};
use crate::config::Config;
use crate::db::Database;
use crate::filesystem::ThumbnailPool;
use crate::storage::HandlerRegistry;
use crate::Result;

/// Shared services.
pub struct ServiceContext {
    /// Loaded configuration.
    pub config: Config,
    /// Metadata store.
    pub db: Database,
    /// TTL store for upload sessions.
    pub cache: Arc<dyn TtlStore>,
    /// Storage handler per policy.
    pub handlers: HandlerRegistry,
    /// Bounded thumbnail workers.
    pub thumbnails: ThumbnailPool,
}

impl ServiceContext {
    /// Assemble a context from already opened parts.
    pub fn new(config: Config, db: Database, cache: Arc<dyn TtlStore>) -> Self {
        let handlers = HandlerRegistry::new(
            &config.storage.local_root,
            config.thumbnail.file_suffix.clone(),
        );
        let thumbnails = ThumbnailPool::new(config.thumbnail.worker_count());
        Self {
            config,
            db,
            cache,
            handlers,
            thumbnails,
        }
    }

    /// Open the database named in `config` and build the context around it.
    pub async fn from_config(config: Config) -> Result<Arc<Self>> {
        config.validate()?;
        let db = Database::open_with(&config.database.path, config.database.max_connections)
            .await?;
        info!(path = %config.database.path, "database opened");
        let cache: Arc<dyn TtlStore> = Arc::new(MemoryStore::default());
        Ok(Arc::new(Self::new(config, db, cache)))
    }
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("database", &self.config.database.path)
            .field("thumbnail_workers", &self.thumbnails.capacity())
            .finish()
    }
}
