//! Quota ledger.
//!
//! The per-user used-storage counter lives in `users.storage`. Every mutation
//! goes through the same connection as the file row change that justifies it,
//! so the counter commits or rolls back together with that change.

use sqlx::SqliteConnection;
use tracing::debug;

use crate::{NimbusError, Result};

/// Ledger operations bound to one unit-of-work connection.
pub struct QuotaLedger<'a> {
    conn: &'a mut SqliteConnection,
}

impl<'a> QuotaLedger<'a> {
    /// Create a ledger handle on the given connection.
    pub fn new(conn: &'a mut SqliteConnection) -> Self {
        Self { conn }
    }

    /// Current used storage of a user.
    pub async fn used(&mut self, user_id: i64) -> Result<i64> {
        sqlx::query_scalar("SELECT storage FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&mut *self.conn)
            .await?
            .ok_or_else(|| NimbusError::NotExist("user".to_string()))
    }

    /// Whether `size` more bytes fit under the user's capacity.
    pub async fn has_room(&mut self, user_id: i64, size: i64) -> Result<bool> {
        let (storage, capacity): (i64, i64) =
            sqlx::query_as("SELECT storage, capacity FROM users WHERE id = ?")
                .bind(user_id)
                .fetch_optional(&mut *self.conn)
                .await?
                .ok_or_else(|| NimbusError::NotExist("user".to_string()))?;
        Ok(storage + size <= capacity)
    }

    /// Add `size` bytes without checking capacity. A negative size deducts.
    pub async fn increase(&mut self, user_id: i64, size: i64) -> Result<()> {
        match size {
            0 => Ok(()),
            s if s > 0 => self.charge(user_id, s).await,
            s => self.release(user_id, -s).await,
        }
    }

    /// Add `size` bytes only if the result stays within capacity.
    ///
    /// The check and the update are one statement, so two concurrent units
    /// cannot both pass against the same remaining space.
    pub async fn increase_checked(&mut self, user_id: i64, size: i64) -> Result<()> {
        if size <= 0 {
            return self.increase(user_id, size).await;
        }
        let result = sqlx::query(
            "UPDATE users SET storage = storage + ? WHERE id = ? AND storage + ? <= capacity",
        )
        .bind(size)
        .bind(user_id)
        .bind(size)
        .execute(&mut *self.conn)
        .await?;
        if result.rows_affected() == 0 {
            self.used(user_id).await?;
            return Err(NimbusError::InsufficientCapacity);
        }
        debug!(user_id, size, "quota increased (checked)");
        Ok(())
    }

    /// Remove `size` bytes from the counter.
    ///
    /// The counter never goes below zero; a deduction larger than what is
    /// charged fails with `Inconsistent` and leaves the counter alone.
    pub async fn deduct(&mut self, user_id: i64, size: i64) -> Result<()> {
        self.increase(user_id, -size).await
    }

    async fn charge(&mut self, user_id: i64, size: i64) -> Result<()> {
        let result = sqlx::query("UPDATE users SET storage = storage + ? WHERE id = ?")
            .bind(size)
            .bind(user_id)
            .execute(&mut *self.conn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(NimbusError::NotExist("user".to_string()));
        }
        debug!(user_id, size, "quota increased");
        Ok(())
    }

    async fn release(&mut self, user_id: i64, size: i64) -> Result<()> {
        let result =
            sqlx::query("UPDATE users SET storage = storage - ? WHERE id = ? AND storage >= ?")
                .bind(size)
                .bind(user_id)
                .bind(size)
                .execute(&mut *self.conn)
                .await?;
        if result.rows_affected() == 0 {
            let used = self.used(user_id).await?;
            return Err(NimbusError::Inconsistent(format!(
                "user {user_id} has {used} bytes charged, cannot release {size}"
            )));
        }
        debug!(user_id, size, "quota deducted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, NewUser, UserRepository};

    async fn setup(capacity: i64) -> (Database, i64) {
        let db = Database::open_in_memory().await.unwrap();
        sqlx::query("INSERT INTO policies (name, policy_type) VALUES ('default', 'memory')")
            .execute(db.pool())
            .await
            .unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        let user = UserRepository::new(&mut conn)
            .create(&NewUser::new("quota", 1).with_capacity(capacity))
            .await
            .unwrap();
        (db, user.id)
    }

    #[tokio::test]
    async fn test_increase_and_deduct() {
        let (db, uid) = setup(100).await;
        let mut conn = db.pool().acquire().await.unwrap();
        let mut ledger = QuotaLedger::new(&mut conn);

        ledger.increase(uid, 40).await.unwrap();
        ledger.increase(uid, 10).await.unwrap();
        assert_eq!(ledger.used(uid).await.unwrap(), 50);

        ledger.deduct(uid, 30).await.unwrap();
        assert_eq!(ledger.used(uid).await.unwrap(), 20);

        ledger.increase(uid, -5).await.unwrap();
        assert_eq!(ledger.used(uid).await.unwrap(), 15);
    }

    #[tokio::test]
    async fn test_deduct_never_goes_negative() {
        let (db, uid) = setup(100).await;
        let mut conn = db.pool().acquire().await.unwrap();
        let mut ledger = QuotaLedger::new(&mut conn);

        ledger.increase(uid, 10).await.unwrap();
        let err = ledger.deduct(uid, 11).await.unwrap_err();
        assert!(matches!(err, NimbusError::Inconsistent(_)));
        assert!(matches!(
            ledger.increase(uid, -11).await,
            Err(NimbusError::Inconsistent(_))
        ));
        assert_eq!(ledger.used(uid).await.unwrap(), 10);

        ledger.deduct(uid, 10).await.unwrap();
        assert_eq!(ledger.used(uid).await.unwrap(), 0);
        assert!(matches!(
            ledger.deduct(999, 1).await,
            Err(NimbusError::NotExist(_))
        ));
    }

    #[tokio::test]
    async fn test_increase_checked_respects_capacity() {
        let (db, uid) = setup(100).await;
        let mut conn = db.pool().acquire().await.unwrap();
        let mut ledger = QuotaLedger::new(&mut conn);

        ledger.increase_checked(uid, 100).await.unwrap();
        let err = ledger.increase_checked(uid, 1).await.unwrap_err();
        assert!(matches!(err, NimbusError::InsufficientCapacity));
        assert_eq!(ledger.used(uid).await.unwrap(), 100);
        assert!(!ledger.has_room(uid, 1).await.unwrap());
        assert!(ledger.has_room(uid, 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_user() {
        let (db, _) = setup(100).await;
        let mut conn = db.pool().acquire().await.unwrap();
        let mut ledger = QuotaLedger::new(&mut conn);

        assert!(matches!(
            ledger.increase(999, 1).await,
            Err(NimbusError::NotExist(_))
        ));
        assert!(matches!(
            ledger.increase_checked(999, 1).await,
            Err(NimbusError::NotExist(_))
        ));
    }
}
