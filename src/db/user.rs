//! User model and repository for Nimbus.
//!
//! A user owns one root folder, is bound to one storage policy, and carries
//! the quota ledger counter (`storage`) next to its `capacity`.

use sqlx::SqliteConnection;

use crate::filesystem::FolderRepository;
use crate::{NimbusError, Result};

/// Name of every user's root folder.
pub const ROOT_FOLDER_NAME: &str = "/";

/// User entity.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    /// Unique user ID.
    pub id: i64,
    /// Login name.
    pub username: String,
    /// Storage policy new uploads go to.
    pub policy_id: i64,
    /// Storage capacity in bytes.
    pub capacity: i64,
    /// Bytes in use (quota ledger).
    pub storage: i64,
    /// When the user was created.
    pub created_at: String,
}

impl User {
    /// Bytes still available under the capacity.
    pub fn remaining_capacity(&self) -> i64 {
        (self.capacity - self.storage).max(0)
    }
}

/// Data for creating a new user.
#[derive(Debug, Clone)]
pub struct NewUser {
    /// Login name.
    pub username: String,
    /// Storage policy ID.
    pub policy_id: i64,
    /// Storage capacity in bytes.
    pub capacity: i64,
}

impl NewUser {
    /// Create a new NewUser.
    pub fn new(username: impl Into<String>, policy_id: i64) -> Self {
        Self {
            username: username.into(),
            policy_id,
            capacity: 1024 * 1024 * 1024,
        }
    }

    /// Set the capacity.
    pub fn with_capacity(mut self, capacity: i64) -> Self {
        self.capacity = capacity;
        self
    }
}

/// Repository for user operations.
pub struct UserRepository<'a> {
    conn: &'a mut SqliteConnection,
}

impl<'a> UserRepository<'a> {
    /// Create a new UserRepository on the given connection.
    pub fn new(conn: &'a mut SqliteConnection) -> Self {
        Self { conn }
    }

    /// Create a user together with its root folder.
    pub async fn create(&mut self, new_user: &NewUser) -> Result<User> {
        if new_user.username.trim().is_empty() {
            return Err(NimbusError::Validation("username is empty".to_string()));
        }

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO users (username, policy_id, capacity) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(&new_user.username)
        .bind(new_user.policy_id)
        .bind(new_user.capacity)
        .fetch_one(&mut *self.conn)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                NimbusError::AlreadyExists(format!("user {}", new_user.username))
            }
            e => NimbusError::Database(e.to_string()),
        })?;

        FolderRepository::new(&mut *self.conn).create_root(id).await?;

        self.get_by_id(id)
            .await?
            .ok_or_else(|| NimbusError::NotExist("user".to_string()))
    }

    /// Get a user by ID.
    pub async fn get_by_id(&mut self, id: i64) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, username, policy_id, capacity, storage, created_at FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&mut *self.conn)
        .await?;
        Ok(user)
    }

    /// Get a user by username.
    pub async fn get_by_username(&mut self, username: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, username, policy_id, capacity, storage, created_at
             FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&mut *self.conn)
        .await?;
        Ok(user)
    }

    /// Change a user's capacity.
    pub async fn set_capacity(&mut self, id: i64, capacity: i64) -> Result<()> {
        let result = sqlx::query("UPDATE users SET capacity = ? WHERE id = ?")
            .bind(capacity)
            .bind(id)
            .execute(&mut *self.conn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(NimbusError::NotExist("user".to_string()));
        }
        Ok(())
    }
}
