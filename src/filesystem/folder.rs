//! Folder records and hierarchy queries.

use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use super::{join_path, split_path};
use crate::db::ROOT_FOLDER_NAME;
use crate::{NimbusError, Result};

/// A folder record.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Folder {
    /// Unique folder ID.
    pub id: i64,
    /// Folder name, unique among siblings.
    pub name: String,
    /// Owner ID.
    pub owner_id: i64,
    /// Parent folder ID (None for the root).
    pub parent_id: Option<i64>,
    /// When the folder was created.
    pub created_at: String,
    /// When the folder was last modified.
    pub updated_at: String,
    /// Virtual path of the parent directory. Filled by listings only.
    #[sqlx(skip)]
    pub position: String,
}

impl Folder {
    /// Whether this is a user's root folder.
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Full virtual path, valid once `position` has been filled.
    pub fn full_path(&self) -> String {
        if self.is_root() {
            "/".to_string()
        } else {
            join_path(&self.position, &self.name)
        }
    }
}

const FOLDER_COLUMNS: &str = "id, name, owner_id, parent_id, created_at, updated_at";

fn unique_violation(e: sqlx::Error, name: &str) -> NimbusError {
    match e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            NimbusError::AlreadyExists(name.to_string())
        }
        e => NimbusError::Database(e.to_string()),
    }
}

/// Repository for folder records.
pub struct FolderRepository<'a> {
    conn: &'a mut SqliteConnection,
}

impl<'a> FolderRepository<'a> {
    /// Create a new FolderRepository on the given connection.
    pub fn new(conn: &'a mut SqliteConnection) -> Self {
        Self { conn }
    }

    /// Create a child folder.
    pub async fn create(&mut self, owner_id: i64, parent_id: i64, name: &str) -> Result<Folder> {
        if self.name_taken(parent_id, name).await? {
            return Err(NimbusError::AlreadyExists(name.to_string()));
        }
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO folders (name, owner_id, parent_id) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(name)
        .bind(owner_id)
        .bind(parent_id)
        .fetch_one(&mut *self.conn)
        .await
        .map_err(|e| unique_violation(e, name))?;

        self.get_by_id(id)
            .await?
            .ok_or_else(|| NimbusError::NotExist("folder".to_string()))
    }

    /// Create the root folder of a user.
    pub async fn create_root(&mut self, owner_id: i64) -> Result<Folder> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO folders (name, owner_id, parent_id) VALUES (?, ?, NULL) RETURNING id",
        )
        .bind(ROOT_FOLDER_NAME)
        .bind(owner_id)
        .fetch_one(&mut *self.conn)
        .await
        .map_err(|e| unique_violation(e, "root folder"))?;

        self.get_by_id(id)
            .await?
            .ok_or_else(|| NimbusError::NotExist("folder".to_string()))
    }

    /// Get a folder by ID.
    pub async fn get_by_id(&mut self, id: i64) -> Result<Option<Folder>> {
        let sql = format!("SELECT {FOLDER_COLUMNS} FROM folders WHERE id = ?");
        let folder = sqlx::query_as::<_, Folder>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.conn)
            .await?;
        Ok(folder)
    }

    /// Get folders by IDs, restricted to one owner unless `owner_id` is 0.
    pub async fn get_by_ids(&mut self, ids: &[i64], owner_id: i64) -> Result<Vec<Folder>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {FOLDER_COLUMNS} FROM folders WHERE id IN ("));
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");
        if owner_id != 0 {
            query.push(" AND owner_id = ").push_bind(owner_id);
        }
        query.push(" ORDER BY id");

        let folders = query
            .build_query_as::<Folder>()
            .fetch_all(&mut *self.conn)
            .await?;
        Ok(folders)
    }

    /// Get the root folder of a user.
    pub async fn root_of(&mut self, owner_id: i64) -> Result<Folder> {
        let sql = format!(
            "SELECT {FOLDER_COLUMNS} FROM folders WHERE owner_id = ? AND parent_id IS NULL"
        );
        let mut root = sqlx::query_as::<_, Folder>(&sql)
            .bind(owner_id)
            .fetch_optional(&mut *self.conn)
            .await?
            .ok_or_else(|| NimbusError::NotExist("root folder".to_string()))?;
        root.position = "/".to_string();
        Ok(root)
    }

    /// Get a child folder by name.
    pub async fn get_child_folder(&mut self, parent_id: i64, name: &str) -> Result<Option<Folder>> {
        let sql = format!("SELECT {FOLDER_COLUMNS} FROM folders WHERE parent_id = ? AND name = ?");
        let folder = sqlx::query_as::<_, Folder>(&sql)
            .bind(parent_id)
            .bind(name)
            .fetch_optional(&mut *self.conn)
            .await?;
        Ok(folder)
    }

    /// List the direct children of a folder.
    pub async fn list_children(&mut self, parent_id: i64) -> Result<Vec<Folder>> {
        let sql = format!("SELECT {FOLDER_COLUMNS} FROM folders WHERE parent_id = ? ORDER BY name");
        let folders = sqlx::query_as::<_, Folder>(&sql)
            .bind(parent_id)
            .fetch_all(&mut *self.conn)
            .await?;
        Ok(folders)
    }

    /// The given folders and all their descendants, restricted to one owner
    /// unless `owner_id` is 0.
    pub async fn recursive_children(&mut self, ids: &[i64], owner_id: i64) -> Result<Vec<Folder>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
            "WITH RECURSIVE tree(id) AS (SELECT id FROM folders WHERE id IN (",
        );
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");
        if owner_id != 0 {
            query.push(" AND owner_id = ").push_bind(owner_id);
        }
        query.push(
            " UNION SELECT f.id FROM folders f JOIN tree t ON f.parent_id = t.id) \
             SELECT f.id, f.name, f.owner_id, f.parent_id, f.created_at, f.updated_at \
             FROM folders f JOIN tree t ON f.id = t.id ORDER BY f.id",
        );

        let folders = query
            .build_query_as::<Folder>()
            .fetch_all(&mut *self.conn)
            .await?;
        Ok(folders)
    }

    /// Resolve a virtual path of a user to its folder.
    pub async fn resolve_path(&mut self, owner_id: i64, path: &str) -> Result<Option<Folder>> {
        let mut current = self.root_of(owner_id).await?;
        let mut position = "/".to_string();
        for segment in split_path(path) {
            match self.get_child_folder(current.id, segment).await? {
                Some(mut child) => {
                    child.position = position.clone();
                    position = join_path(&position, segment);
                    current = child;
                }
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// Virtual path of the directory containing `folder_id`'s contents.
    pub async fn position_of(&mut self, folder_id: i64) -> Result<String> {
        let names: Vec<(String, Option<i64>)> = sqlx::query_as(
            "WITH RECURSIVE up(id, name, parent_id, depth) AS (
                 SELECT id, name, parent_id, 0 FROM folders WHERE id = ?
                 UNION ALL
                 SELECT f.id, f.name, f.parent_id, up.depth + 1
                 FROM folders f JOIN up ON f.id = up.parent_id
             )
             SELECT name, parent_id FROM up ORDER BY depth DESC",
        )
        .bind(folder_id)
        .fetch_all(&mut *self.conn)
        .await?;
        if names.is_empty() {
            return Err(NimbusError::NotExist("folder".to_string()));
        }

        let segments: Vec<&str> = names
            .iter()
            .filter(|(_, parent)| parent.is_some())
            .map(|(name, _)| name.as_str())
            .collect();
        Ok(format!("/{}", segments.join("/")))
    }

    /// Whether `folder_id` is `ancestor_id` or lies beneath it.
    pub async fn is_descendant(&mut self, folder_id: i64, ancestor_id: i64) -> Result<bool> {
        let found: bool = sqlx::query_scalar(
            "WITH RECURSIVE up(id, parent_id) AS (
                 SELECT id, parent_id FROM folders WHERE id = ?
                 UNION ALL
                 SELECT f.id, f.parent_id FROM folders f JOIN up ON f.id = up.parent_id
             )
             SELECT EXISTS(SELECT 1 FROM up WHERE id = ?)",
        )
        .bind(folder_id)
        .bind(ancestor_id)
        .fetch_one(&mut *self.conn)
        .await?;
        Ok(found)
    }

    /// Rename a folder.
    pub async fn rename(&mut self, id: i64, name: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE folders SET name = ?, updated_at = ? WHERE id = ? AND parent_id IS NOT NULL",
        )
        .bind(name)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&mut *self.conn)
        .await
        .map_err(|e| unique_violation(e, name))?;
        if result.rows_affected() == 0 {
            return Err(NimbusError::NotExist("folder".to_string()));
        }
        Ok(())
    }

    /// Reparent folders of one owner. Root folders are never moved.
    pub async fn move_to(&mut self, ids: &[i64], owner_id: i64, parent_id: i64) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE folders SET parent_id = ");
        query.push_bind(parent_id);
        query.push(" WHERE parent_id IS NOT NULL AND owner_id = ").push_bind(owner_id);
        query.push(" AND id IN (");
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let result = query
            .build()
            .execute(&mut *self.conn)
            .await
            .map_err(|e| unique_violation(e, "folder"))?;
        Ok(result.rows_affected())
    }

    /// Delete folders. Root folders are never deleted.
    pub async fn delete_by_ids(&mut self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("DELETE FROM folders WHERE parent_id IS NOT NULL AND id IN (");
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let result = query.build().execute(&mut *self.conn).await?;
        Ok(result.rows_affected())
    }

    /// Whether a file or folder named `name` already lives in `parent_id`.
    pub async fn name_taken(&mut self, parent_id: i64, name: &str) -> Result<bool> {
        let taken: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM folders WHERE parent_id = ? AND name = ?)
                 OR EXISTS(SELECT 1 FROM files WHERE folder_id = ? AND name = ?)",
        )
        .bind(parent_id)
        .bind(name)
        .bind(parent_id)
        .bind(name)
        .fetch_one(&mut *self.conn)
        .await?;
        Ok(taken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, NewUser, UserRepository};

    async fn setup() -> (Database, i64) {
        let db = Database::open_in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        sqlx::query("INSERT INTO policies (name, policy_type) VALUES ('default', 'memory')")
            .execute(&mut *conn)
            .await
            .unwrap();
        let user = UserRepository::new(&mut conn)
            .create(&NewUser::new("folders", 1))
            .await
            .unwrap();
        drop(conn);
        (db, user.id)
    }

    #[tokio::test]
    async fn test_create_and_resolve() {
        let (db, uid) = setup().await;
        let mut conn = db.pool().acquire().await.unwrap();
        let mut repo = FolderRepository::new(&mut conn);

        let root = repo.root_of(uid).await.unwrap();
        assert!(root.is_root());
        assert_eq!(root.full_path(), "/");

        let a = repo.create(uid, root.id, "a").await.unwrap();
        let b = repo.create(uid, a.id, "b").await.unwrap();

        let resolved = repo.resolve_path(uid, "/a/b").await.unwrap().unwrap();
        assert_eq!(resolved.id, b.id);
        assert_eq!(resolved.position, "/a");
        assert_eq!(resolved.full_path(), "/a/b");
        assert!(repo.resolve_path(uid, "/a/missing").await.unwrap().is_none());

        assert_eq!(repo.position_of(b.id).await.unwrap(), "/a/b");
        assert_eq!(repo.position_of(root.id).await.unwrap(), "/");
    }

    #[tokio::test]
    async fn test_create_duplicate() {
        let (db, uid) = setup().await;
        let mut conn = db.pool().acquire().await.unwrap();
        let mut repo = FolderRepository::new(&mut conn);

        let root = repo.root_of(uid).await.unwrap();
        repo.create(uid, root.id, "a").await.unwrap();
        let err = repo.create(uid, root.id, "a").await.unwrap_err();
        assert!(err.is_already_exists());

        let err = repo.create_root(uid).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_recursive_children_and_descendant() {
        let (db, uid) = setup().await;
        let mut conn = db.pool().acquire().await.unwrap();
        let mut repo = FolderRepository::new(&mut conn);

        let root = repo.root_of(uid).await.unwrap();
        let a = repo.create(uid, root.id, "a").await.unwrap();
        let b = repo.create(uid, a.id, "b").await.unwrap();
        let c = repo.create(uid, b.id, "c").await.unwrap();
        let other = repo.create(uid, root.id, "other").await.unwrap();

        let tree: Vec<i64> = repo
            .recursive_children(&[a.id], uid)
            .await
            .unwrap()
            .iter()
            .map(|f| f.id)
            .collect();
        assert_eq!(tree, vec![a.id, b.id, c.id]);
        assert!(repo.recursive_children(&[a.id], uid + 1).await.unwrap().is_empty());

        assert!(repo.is_descendant(c.id, a.id).await.unwrap());
        assert!(repo.is_descendant(a.id, a.id).await.unwrap());
        assert!(!repo.is_descendant(other.id, a.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_root_is_protected() {
        let (db, uid) = setup().await;
        let mut conn = db.pool().acquire().await.unwrap();
        let mut repo = FolderRepository::new(&mut conn);

        let root = repo.root_of(uid).await.unwrap();
        assert!(repo.rename(root.id, "x").await.is_err());
        assert_eq!(repo.delete_by_ids(&[root.id]).await.unwrap(), 0);
        assert_eq!(repo.move_to(&[root.id], uid, root.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_name_taken_covers_files() {
        let (db, uid) = setup().await;
        let mut conn = db.pool().acquire().await.unwrap();
        let root = FolderRepository::new(&mut conn).root_of(uid).await.unwrap();

        sqlx::query(
            "INSERT INTO files (name, user_id, folder_id, source_name, policy_id)
             VALUES ('x.txt', ?, ?, 'k', 1)",
        )
        .bind(uid)
        .bind(root.id)
        .execute(&mut *conn)
        .await
        .unwrap();

        let mut repo = FolderRepository::new(&mut conn);
        assert!(repo.name_taken(root.id, "x.txt").await.unwrap());
        assert!(!repo.name_taken(root.id, "y.txt").await.unwrap());
        assert!(repo.create(uid, root.id, "x.txt").await.unwrap_err().is_already_exists());
    }
}
