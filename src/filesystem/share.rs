//! Share records.
//!
//! A share points at a file or a folder by ID. Shares go away together with
//! whatever they point at.

use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use crate::{NimbusError, Result};

/// A share record.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Share {
    /// Unique share ID.
    pub id: i64,
    /// Owner ID.
    pub user_id: i64,
    /// ID of the shared file or folder.
    pub source_id: i64,
    /// Whether `source_id` is a folder.
    pub is_dir: bool,
    /// View counter.
    pub views: i64,
    /// When the share was created.
    pub created_at: String,
}

/// Repository for share records.
pub struct ShareRepository<'a> {
    conn: &'a mut SqliteConnection,
}

impl<'a> ShareRepository<'a> {
    /// Create a new ShareRepository on the given connection.
    pub fn new(conn: &'a mut SqliteConnection) -> Self {
        Self { conn }
    }

    /// Share a file or folder.
    pub async fn create(&mut self, user_id: i64, source_id: i64, is_dir: bool) -> Result<Share> {
        let share = sqlx::query_as::<_, Share>(
            "INSERT INTO shares (user_id, source_id, is_dir) VALUES (?, ?, ?)
             RETURNING id, user_id, source_id, is_dir, views, created_at",
        )
        .bind(user_id)
        .bind(source_id)
        .bind(is_dir)
        .fetch_optional(&mut *self.conn)
        .await?
        .ok_or_else(|| NimbusError::Database("share insert returned no row".to_string()))?;
        Ok(share)
    }

    /// Get a share by ID.
    pub async fn get_by_id(&mut self, id: i64) -> Result<Option<Share>> {
        let share = sqlx::query_as::<_, Share>(
            "SELECT id, user_id, source_id, is_dir, views, created_at FROM shares WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&mut *self.conn)
        .await?;
        Ok(share)
    }

    /// Shares pointing at one object.
    pub async fn list_by_source(&mut self, source_id: i64, is_dir: bool) -> Result<Vec<Share>> {
        let shares = sqlx::query_as::<_, Share>(
            "SELECT id, user_id, source_id, is_dir, views, created_at
             FROM shares WHERE source_id = ? AND is_dir = ? ORDER BY id",
        )
        .bind(source_id)
        .bind(is_dir)
        .fetch_all(&mut *self.conn)
        .await?;
        Ok(shares)
    }

    /// Remove every share of the given objects.
    pub async fn delete_by_source_ids(&mut self, ids: &[i64], is_dir: bool) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new("DELETE FROM shares WHERE is_dir = ");
        query.push_bind(is_dir);
        query.push(" AND source_id IN (");
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let result = query.build().execute(&mut *self.conn).await?;
        Ok(result.rows_affected())
    }
}
