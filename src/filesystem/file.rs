//! File records.
//!
//! A file row points at a physical object through `(policy_id, source_name)`.
//! Several rows may point at the same object (copies share storage); the
//! object is only removed once no row references it.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use crate::quota::QuotaLedger;
use crate::{NimbusError, Result};

/// Free-form string metadata attached to a file, stored as a JSON object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata(pub BTreeMap<String, String>);

impl TryFrom<String> for Metadata {
    type Error = serde_json::Error;

    fn try_from(raw: String) -> std::result::Result<Self, Self::Error> {
        if raw.is_empty() {
            return Ok(Metadata::default());
        }
        serde_json::from_str(&raw).map(Metadata)
    }
}

impl Metadata {
    /// Serialize to the stored JSON form.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.0)?)
    }
}

/// A file record.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct File {
    /// Unique file ID.
    pub id: i64,
    /// File name, unique within its folder.
    pub name: String,
    /// Owner ID.
    pub user_id: i64,
    /// Parent folder ID.
    pub folder_id: i64,
    /// Physical key under the policy.
    pub source_name: String,
    /// Size in bytes.
    pub size: i64,
    /// Storage policy ID.
    pub policy_id: i64,
    /// Upload session key while the file is a placeholder.
    pub upload_session_id: Option<String>,
    /// Image dimensions as `width,height`, empty when unknown.
    pub pic_info: String,
    /// Free-form metadata.
    #[sqlx(try_from = "String")]
    pub metadata: Metadata,
    /// When the file was created.
    pub created_at: String,
    /// When the file was last modified.
    pub updated_at: String,
    /// Virtual directory the file was found in. Filled by listings only.
    #[sqlx(skip)]
    pub position: String,
}

impl File {
    /// Whether the file is a placeholder of an unfinished upload.
    pub fn is_placeholder(&self) -> bool {
        self.upload_session_id.is_some()
    }

    /// Image dimensions, if recorded.
    pub fn pic_size(&self) -> Option<(u32, u32)> {
        let (w, h) = self.pic_info.split_once(',')?;
        Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
    }

    /// Get updated_at as DateTime<Utc>.
    pub fn updated_at_datetime(&self) -> DateTime<Utc> {
        parse_timestamp(&self.updated_at)
    }
}

/// Parse a stored timestamp written either by SQLite or by chrono.
pub(crate) fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(&format!("{}Z", raw.replace(' ', "T"))))
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Data for creating a file record.
#[derive(Debug, Clone)]
pub struct NewFile {
    /// File name.
    pub name: String,
    /// Owner ID.
    pub user_id: i64,
    /// Parent folder ID.
    pub folder_id: i64,
    /// Physical key.
    pub source_name: String,
    /// Size in bytes.
    pub size: i64,
    /// Storage policy ID.
    pub policy_id: i64,
    /// Upload session key for placeholders.
    pub upload_session_id: Option<String>,
    /// Image dimensions.
    pub pic_info: String,
    /// Free-form metadata.
    pub metadata: Metadata,
    /// Modification time, defaults to now.
    pub updated_at: Option<DateTime<Utc>>,
}

impl NewFile {
    /// Create a finalized file record description.
    pub fn new(
        name: impl Into<String>,
        user_id: i64,
        folder_id: i64,
        policy_id: i64,
        source_name: impl Into<String>,
        size: i64,
    ) -> Self {
        Self {
            name: name.into(),
            user_id,
            folder_id,
            source_name: source_name.into(),
            size,
            policy_id,
            upload_session_id: None,
            pic_info: String::new(),
            metadata: Metadata::default(),
            updated_at: None,
        }
    }

    /// Mark the record as a placeholder of an upload session.
    pub fn with_upload_session(mut self, key: impl Into<String>) -> Self {
        self.upload_session_id = Some(key.into());
        self
    }

    /// Set the modification time.
    pub fn with_updated_at(mut self, updated_at: Option<DateTime<Utc>>) -> Self {
        self.updated_at = updated_at;
        self
    }
}

const FILE_COLUMNS: &str = "id, name, user_id, folder_id, source_name, size, policy_id, \
     upload_session_id, pic_info, metadata, created_at, updated_at";

fn unique_violation(e: sqlx::Error, name: &str) -> NimbusError {
    match e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            NimbusError::AlreadyExists(name.to_string())
        }
        e => NimbusError::Database(e.to_string()),
    }
}

fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Repository for file records.
///
/// Every statement runs on the unit-of-work connection it was created with.
pub struct FileRepository<'a> {
    conn: &'a mut SqliteConnection,
}

impl<'a> FileRepository<'a> {
    /// Create a new FileRepository on the given connection.
    pub fn new(conn: &'a mut SqliteConnection) -> Self {
        Self { conn }
    }

    /// Insert a file record and charge its size to the owner's ledger.
    pub async fn create(&mut self, file: &NewFile) -> Result<File> {
        let updated_at = file.updated_at.unwrap_or_else(Utc::now).to_rfc3339();
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO files (name, user_id, folder_id, source_name, size, policy_id,
                                upload_session_id, pic_info, metadata, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(&file.name)
        .bind(file.user_id)
        .bind(file.folder_id)
        .bind(&file.source_name)
        .bind(file.size)
        .bind(file.policy_id)
        .bind(&file.upload_session_id)
        .bind(&file.pic_info)
        .bind(file.metadata.to_json()?)
        .bind(updated_at)
        .fetch_one(&mut *self.conn)
        .await
        .map_err(|e| unique_violation(e, &file.name))?;

        QuotaLedger::new(&mut *self.conn)
            .increase(file.user_id, file.size)
            .await?;

        self.get_by_id(id)
            .await?
            .ok_or_else(|| NimbusError::NotExist("file".to_string()))
    }

    /// Get a file by ID.
    pub async fn get_by_id(&mut self, id: i64) -> Result<Option<File>> {
        let sql = format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?");
        let file = sqlx::query_as::<_, File>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.conn)
            .await?;
        Ok(file)
    }

    /// Get files by IDs, restricted to one owner unless `user_id` is 0.
    pub async fn get_by_ids(&mut self, ids: &[i64], user_id: i64) -> Result<Vec<File>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {FILE_COLUMNS} FROM files WHERE id IN ("));
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");
        if user_id != 0 {
            query.push(" AND user_id = ").push_bind(user_id);
        }
        query.push(" ORDER BY id");

        let files = query
            .build_query_as::<File>()
            .fetch_all(&mut *self.conn)
            .await?;
        Ok(files)
    }

    /// Get a file by name inside a folder.
    pub async fn get_child_file(&mut self, folder_id: i64, name: &str) -> Result<Option<File>> {
        let sql = format!("SELECT {FILE_COLUMNS} FROM files WHERE folder_id = ? AND name = ?");
        let file = sqlx::query_as::<_, File>(&sql)
            .bind(folder_id)
            .bind(name)
            .fetch_optional(&mut *self.conn)
            .await?;
        Ok(file)
    }

    /// List the files of one folder, placeholders included.
    pub async fn list_by_folder(&mut self, folder_id: i64) -> Result<Vec<File>> {
        self.list_by_folders(&[folder_id]).await
    }

    /// List the files of several folders.
    pub async fn list_by_folders(&mut self, folder_ids: &[i64]) -> Result<Vec<File>> {
        if folder_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE folder_id IN ("
        ));
        let mut separated = query.separated(", ");
        for id in folder_ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(") ORDER BY name");

        let files = query
            .build_query_as::<File>()
            .fetch_all(&mut *self.conn)
            .await?;
        Ok(files)
    }

    /// Find the placeholder of an upload session.
    pub async fn get_by_upload_session(&mut self, user_id: i64, key: &str) -> Result<Option<File>> {
        let sql = format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE upload_session_id = ? AND user_id = ?"
        );
        let file = sqlx::query_as::<_, File>(&sql)
            .bind(key)
            .bind(user_id)
            .fetch_optional(&mut *self.conn)
            .await?;
        Ok(file)
    }

    /// List placeholder records of a user, or of every user when `user_id` is 0.
    pub async fn list_placeholders(&mut self, user_id: i64) -> Result<Vec<File>> {
        let sql = format!(
            "SELECT {FILE_COLUMNS} FROM files
             WHERE upload_session_id IS NOT NULL AND (? = 0 OR user_id = ?)
             ORDER BY id"
        );
        let files = sqlx::query_as::<_, File>(&sql)
            .bind(user_id)
            .bind(user_id)
            .fetch_all(&mut *self.conn)
            .await?;
        Ok(files)
    }

    /// Rename a file.
    pub async fn rename(&mut self, id: i64, name: &str) -> Result<()> {
        let result = sqlx::query("UPDATE files SET name = ?, updated_at = ? WHERE id = ?")
            .bind(name)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&mut *self.conn)
            .await
            .map_err(|e| unique_violation(e, name))?;
        if result.rows_affected() == 0 {
            return Err(NimbusError::NotExist("file".to_string()));
        }
        Ok(())
    }

    /// Record image dimensions.
    pub async fn update_pic_info(&mut self, id: i64, pic_info: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE files SET pic_info = ? WHERE id = ?")
            .bind(pic_info)
            .bind(id)
            .execute(&mut *self.conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Point a record at a different physical object. Image dimensions of
    /// the old object no longer apply and are cleared.
    pub async fn update_source_name(
        &mut self,
        id: i64,
        policy_id: i64,
        source_name: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE files SET source_name = ?, policy_id = ?, pic_info = '' WHERE id = ?",
        )
        .bind(source_name)
        .bind(policy_id)
        .bind(id)
        .execute(&mut *self.conn)
        .await?;
        if result.rows_affected() == 0 {
            return Err(NimbusError::NotExist("file".to_string()));
        }
        Ok(())
    }

    /// Change a file's size and move the difference through the ledger.
    ///
    /// The row is only updated while its size still equals `file.size`; a
    /// concurrent change makes this fail with `Inconsistent`.
    pub async fn update_size(&mut self, file: &File, new_size: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE files SET size = ?, updated_at = ? WHERE id = ? AND size = ?",
        )
        .bind(new_size)
        .bind(Utc::now().to_rfc3339())
        .bind(file.id)
        .bind(file.size)
        .execute(&mut *self.conn)
        .await?;
        if result.rows_affected() == 0 {
            return Err(NimbusError::Inconsistent(format!(
                "size of file {} changed concurrently",
                file.id
            )));
        }

        QuotaLedger::new(&mut *self.conn)
            .increase(file.user_id, new_size - file.size)
            .await
    }

    /// Turn a placeholder into a finalized record.
    pub async fn finalize_upload(
        &mut self,
        id: i64,
        updated_at: Option<DateTime<Utc>>,
        pic_info: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE files SET upload_session_id = NULL, updated_at = ?, pic_info = ?
             WHERE id = ? AND upload_session_id IS NOT NULL",
        )
        .bind(updated_at.unwrap_or_else(Utc::now).to_rfc3339())
        .bind(pic_info)
        .bind(id)
        .execute(&mut *self.conn)
        .await?;
        if result.rows_affected() == 0 {
            return Err(NimbusError::NotExist("upload placeholder".to_string()));
        }
        Ok(())
    }

    /// Attach an upload session to an existing record (overwrite sessions).
    pub async fn set_upload_session(&mut self, id: i64, key: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE files SET upload_session_id = ? WHERE id = ?")
            .bind(key)
            .bind(id)
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }

    /// Delete records and credit their sizes back to the owners' ledgers.
    ///
    /// Each row must still have the size it was read with; otherwise the call
    /// fails with `Inconsistent` and the unit of work should be abandoned.
    /// Returns the freed bytes per owner.
    pub async fn delete_batch(&mut self, files: &[File]) -> Result<HashMap<i64, i64>> {
        let mut freed: HashMap<i64, i64> = HashMap::new();
        for file in files {
            let result = sqlx::query("DELETE FROM files WHERE id = ? AND size = ?")
                .bind(file.id)
                .bind(file.size)
                .execute(&mut *self.conn)
                .await?;
            if result.rows_affected() == 0 {
                return Err(NimbusError::Inconsistent(format!(
                    "file {} is dirty",
                    file.id
                )));
            }
            *freed.entry(file.user_id).or_default() += file.size;
        }

        for (user_id, size) in &freed {
            QuotaLedger::new(&mut *self.conn)
                .deduct(*user_id, *size)
                .await?;
        }
        Ok(freed)
    }

    /// Physical objects referenced by rows outside `candidates`.
    ///
    /// One grouped lookup over the `(policy_id, source_name)` index answers
    /// the question for the whole candidate set.
    pub async fn find_shared_sources(
        &mut self,
        candidates: &[File],
    ) -> Result<HashSet<(i64, String)>> {
        if candidates.is_empty() {
            return Ok(HashSet::new());
        }
        let keys: Vec<(i64, &str)> = candidates
            .iter()
            .map(|f| (f.policy_id, f.source_name.as_str()))
            .collect();
        let ids: Vec<i64> = candidates.iter().map(|f| f.id).collect();

        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT DISTINCT f.policy_id, f.source_name
             FROM json_each(?) AS c
             JOIN files AS f
               ON f.policy_id = json_extract(c.value, '$[0]')
              AND f.source_name = json_extract(c.value, '$[1]')
             WHERE f.id NOT IN (SELECT value FROM json_each(?))",
        )
        .bind(serde_json::to_string(&keys)?)
        .bind(serde_json::to_string(&ids)?)
        .fetch_all(&mut *self.conn)
        .await?;

        Ok(rows.into_iter().collect())
    }

    /// Whether any other row references the same physical object as `file`.
    pub async fn is_source_shared(&mut self, file: &File) -> Result<bool> {
        let shared: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM files WHERE policy_id = ? AND source_name = ? AND id != ?)",
        )
        .bind(file.policy_id)
        .bind(&file.source_name)
        .bind(file.id)
        .fetch_one(&mut *self.conn)
        .await?;
        Ok(shared)
    }

    /// Finished files of one owner whose name contains any of `keywords`.
    ///
    /// A non-empty `parents` limits the search to those folders. Keywords are
    /// matched literally; `%` and `_` carry no wildcard meaning.
    pub async fn search(
        &mut self,
        user_id: i64,
        parents: &[i64],
        keywords: &[&str],
    ) -> Result<Vec<File>> {
        let keywords: Vec<&str> = keywords.iter().copied().filter(|k| !k.is_empty()).collect();
        if keywords.is_empty() {
            return Ok(Vec::new());
        }
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE upload_session_id IS NULL AND user_id = "
        ));
        query.push_bind(user_id);
        if !parents.is_empty() {
            query.push(" AND folder_id IN (");
            let mut separated = query.separated(", ");
            for id in parents {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");
        }
        query.push(" AND (");
        for (i, keyword) in keywords.iter().enumerate() {
            if i > 0 {
                query.push(" OR ");
            }
            query
                .push("name LIKE ")
                .push_bind(format!("%{}%", escape_like(keyword)))
                .push(" ESCAPE '\\'");
        }
        query.push(") ORDER BY name, id");

        let files = query
            .build_query_as::<File>()
            .fetch_all(&mut *self.conn)
            .await?;
        Ok(files)
    }

    /// Reparent files of one owner.
    pub async fn move_to(&mut self, ids: &[i64], user_id: i64, folder_id: i64) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE files SET folder_id = ");
        query.push_bind(folder_id);
        query.push(" WHERE user_id = ").push_bind(user_id);
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
            .map_err(|e| unique_violation(e, "file"))?;
        Ok(result.rows_affected())
    }

    /// Copy a record into another folder. The copy shares the physical object.
    ///
    /// The ledger is charged without a capacity check; callers check first.
    pub async fn copy_to(&mut self, file: &File, folder_id: i64, user_id: i64) -> Result<File> {
        let mut copy = NewFile::new(
            &file.name,
            user_id,
            folder_id,
            file.policy_id,
            &file.source_name,
            file.size,
        );
        copy.pic_info = file.pic_info.clone();
        copy.metadata = file.metadata.clone();
        self.create(&copy).await
    }
}
