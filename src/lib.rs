//! Nimbus - transactional virtual filesystem engine for a multi-tenant cloud drive.
//!
//! Every user owns a folder tree whose files live in pluggable physical
//! stores selected by storage policies. Metadata changes run inside an
//! explicit [`UnitOfWork`], physical writes go through a [`StorageHandler`],
//! and every byte is charged to the owner's quota.

pub mod cache;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod filesystem;
pub mod logging;
pub mod quota;
pub mod storage;

pub use cache::{MemoryStore, TtlStore};
pub use config::Config;
pub use context::ServiceContext;
pub use db::{Database, NewUser, UnitOfWork, User, UserRepository};
pub use error::{NimbusError, Result};
pub use filesystem::{
    DeleteOutcome, Engine, File, FileHeader, FileStream, Folder, HookEvent, HookPreset,
    ImportReport, NewPolicy, ObjectView, Policy, PolicyRepository, SessionUpload, UploadMode,
    UploadSession,
};
pub use quota::QuotaLedger;
pub use storage::{HandlerRegistry, LocalHandler, MemoryHandler, StorageHandler};
