//! Explicit unit-of-work handle shared by every metadata accessor.
//!
//! A unit either owns a fresh transaction or borrows a connection from a
//! transaction the caller already holds. Accessors and engine operations only
//! ever see [`UnitOfWork::conn`], so there is a single code path for both.

use sqlx::{Sqlite, SqliteConnection, Transaction};

use super::Database;
use crate::Result;

/// A transaction scope for one logical operation.
pub enum UnitOfWork<'c> {
    /// A transaction started by this unit. Dropped without commit, it rolls back.
    Owned(Transaction<'static, Sqlite>),
    /// A connection inside a transaction the caller owns and commits.
    Inherited(&'c mut SqliteConnection),
}

impl UnitOfWork<'static> {
    /// Begin a fresh transaction.
    pub async fn begin(db: &Database) -> Result<Self> {
        Ok(UnitOfWork::Owned(db.begin().await?))
    }
}

impl<'c> UnitOfWork<'c> {
    /// Reuse a connection from an enclosing transaction.
    pub fn inherit(conn: &'c mut SqliteConnection) -> Self {
        UnitOfWork::Inherited(conn)
    }

    /// Whether this unit commits on its own.
    pub fn is_owned(&self) -> bool {
        matches!(self, UnitOfWork::Owned(_))
    }

    /// The connection statements of this unit run on.
    pub fn conn(&mut self) -> &mut SqliteConnection {
        match self {
            UnitOfWork::Owned(tx) => &mut **tx,
            UnitOfWork::Inherited(conn) => conn,
        }
    }

    /// Commit an owned transaction. Inherited units are committed by their owner.
    pub async fn commit(self) -> Result<()> {
        match self {
            UnitOfWork::Owned(tx) => Ok(tx.commit().await?),
            UnitOfWork::Inherited(_) => Ok(()),
        }
    }

    /// Roll back an owned transaction.
    pub async fn rollback(self) -> Result<()> {
        match self {
            UnitOfWork::Owned(tx) => Ok(tx.rollback().await?),
            UnitOfWork::Inherited(_) => Ok(()),
        }
    }
}

impl std::fmt::Debug for UnitOfWork<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("owned", &self.is_owned())
            .finish()
    }
}
