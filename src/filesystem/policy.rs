//! Storage policies.
//!
//! A policy selects a backend type and the rules that turn a virtual path and
//! file name into a physical key. Rules are templates with placeholders:
//!
//! | Placeholder | Value |
//! |---|---|
//! | `{uid}` | owner ID |
//! | `{path}` | virtual directory, without leading slash |
//! | `{originname}` | uploaded file name |
//! | `{ext}` | extension including the dot |
//! | `{randomkey8}` / `{randomkey16}` | random alphanumerics |
//! | `{timestamp}` | unix seconds |
//! | `{date}` | `YYYYMMDD` |
//! | `{uuid}` | random UUID |

use chrono::Utc;
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use uuid::Uuid;

use super::{extension_of, split_path};
use crate::{NimbusError, Result};

/// A storage policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Policy {
    /// Unique policy ID.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Backend type (`local`, `memory`).
    pub policy_type: String,
    /// Backend-specific base location.
    pub base_path: String,
    /// Template for the directory part of physical keys.
    pub dir_name_rule: String,
    /// Template for the file part of physical keys.
    pub file_name_rule: String,
    /// Maximum file size in bytes (0 = unlimited).
    pub max_size: i64,
    /// Comma separated allowed extensions (empty = any).
    pub allowed_extensions: String,
    /// Preferred upload chunk size.
    pub chunk_size: i64,
    /// Whether files may be served through direct origin links.
    pub origin_link: bool,
    /// Whether the backend can be listed for imports.
    pub listable: bool,
    /// Whether thumbnails are generated for uploads.
    pub thumb_needed: bool,
    /// Whether placeholders record the declared size.
    pub placeholder_with_size: bool,
    /// Thumbnail box width override.
    pub thumb_width: Option<i64>,
    /// Thumbnail box height override.
    pub thumb_height: Option<i64>,
}

fn random_key(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

impl Policy {
    fn replace(rule: &str, uid: i64, path: &str, origin_name: &str) -> String {
        let now = Utc::now();
        let ext = match extension_of(origin_name) {
            e if e.is_empty() => String::new(),
            e => format!(".{e}"),
        };
        rule.replace("{uid}", &uid.to_string())
            .replace("{path}", path)
            .replace("{originname}", origin_name)
            .replace("{ext}", &ext)
            .replace("{randomkey16}", &random_key(16))
            .replace("{randomkey8}", &random_key(8))
            .replace("{timestamp}", &now.timestamp().to_string())
            .replace("{date}", &now.format("%Y%m%d").to_string())
            .replace("{uuid}", &Uuid::new_v4().to_string())
    }

    /// Directory part of a physical key.
    pub fn generate_path(&self, uid: i64, virtual_path: &str) -> String {
        let path = split_path(virtual_path).join("/");
        let generated = Self::replace(&self.dir_name_rule, uid, &path, "");
        split_path(&generated).join("/")
    }

    /// File part of a physical key.
    pub fn generate_file_name(&self, uid: i64, origin_name: &str) -> String {
        if self.file_name_rule.is_empty() {
            return origin_name.to_string();
        }
        Self::replace(&self.file_name_rule, uid, "", origin_name)
    }

    /// Complete physical key for a new file.
    pub fn generate_save_path(&self, uid: i64, virtual_path: &str, origin_name: &str) -> String {
        let dir = self.generate_path(uid, virtual_path);
        let name = self.generate_file_name(uid, origin_name);
        if dir.is_empty() {
            name
        } else {
            format!("{dir}/{name}")
        }
    }

    /// Allowed extensions, lowercased.
    pub fn allowed_extensions(&self) -> Vec<String> {
        self.allowed_extensions
            .split(',')
            .map(|e| e.trim().trim_start_matches('.').to_lowercase())
            .filter(|e| !e.is_empty())
            .collect()
    }

    /// Whether `name` has an allowed extension.
    pub fn is_extension_allowed(&self, name: &str) -> bool {
        let allowed = self.allowed_extensions();
        allowed.is_empty() || allowed.contains(&extension_of(name))
    }

    /// Whether `size` is within the policy limit.
    pub fn is_size_allowed(&self, size: i64) -> bool {
        self.max_size == 0 || size <= self.max_size
    }

    /// Thumbnail bounding box, falling back to the given defaults.
    pub fn thumb_size(&self, default_width: u32, default_height: u32) -> (u32, u32) {
        let pick = |v: Option<i64>, d: u32| match v {
            Some(v) if v > 0 => v as u32,
            _ => d,
        };
        (
            pick(self.thumb_width, default_width),
            pick(self.thumb_height, default_height),
        )
    }
}

/// Data for creating a new policy.
#[derive(Debug, Clone)]
pub struct NewPolicy {
    /// Display name.
    pub name: String,
    /// Backend type.
    pub policy_type: String,
    /// Backend base location.
    pub base_path: String,
    /// Directory rule.
    pub dir_name_rule: String,
    /// File name rule.
    pub file_name_rule: String,
    /// Maximum file size (0 = unlimited).
    pub max_size: i64,
    /// Allowed extensions.
    pub allowed_extensions: Vec<String>,
    /// Upload chunk size.
    pub chunk_size: i64,
    /// Listable flag.
    pub listable: bool,
    /// Thumbnail flag.
    pub thumb_needed: bool,
    /// Placeholder-with-size flag.
    pub placeholder_with_size: bool,
}

impl NewPolicy {
    /// Create a policy description with default rules.
    pub fn new(name: impl Into<String>, policy_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            policy_type: policy_type.into(),
            base_path: String::new(),
            dir_name_rule: "uploads/{uid}/{path}".to_string(),
            file_name_rule: "{randomkey8}_{originname}".to_string(),
            max_size: 0,
            allowed_extensions: Vec::new(),
            chunk_size: 0,
            listable: false,
            thumb_needed: true,
            placeholder_with_size: false,
        }
    }

    /// Set the base path.
    pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = base_path.into();
        self
    }

    /// Set the naming rules.
    pub fn with_rules(mut self, dir_rule: impl Into<String>, file_rule: impl Into<String>) -> Self {
        self.dir_name_rule = dir_rule.into();
        self.file_name_rule = file_rule.into();
        self
    }

    /// Set the size limit.
    pub fn with_max_size(mut self, max_size: i64) -> Self {
        self.max_size = max_size;
        self
    }

    /// Set the allowed extensions.
    pub fn with_extensions(mut self, extensions: &[&str]) -> Self {
        self.allowed_extensions = extensions.iter().map(|e| e.to_string()).collect();
        self
    }

    /// Set the listable flag.
    pub fn with_listable(mut self, listable: bool) -> Self {
        self.listable = listable;
        self
    }

    /// Set the thumbnail flag.
    pub fn with_thumb_needed(mut self, thumb_needed: bool) -> Self {
        self.thumb_needed = thumb_needed;
        self
    }

    /// Set the placeholder-with-size flag.
    pub fn with_placeholder_size(mut self, placeholder_with_size: bool) -> Self {
        self.placeholder_with_size = placeholder_with_size;
        self
    }
}

const POLICY_COLUMNS: &str = "id, name, policy_type, base_path, dir_name_rule, file_name_rule, \
     max_size, allowed_extensions, chunk_size, origin_link, listable, thumb_needed, \
     placeholder_with_size, thumb_width, thumb_height";

/// Repository for policy operations.
pub struct PolicyRepository<'a> {
    conn: &'a mut SqliteConnection,
}

impl<'a> PolicyRepository<'a> {
    /// Create a new PolicyRepository on the given connection.
    pub fn new(conn: &'a mut SqliteConnection) -> Self {
        Self { conn }
    }

    /// Create a new policy.
    pub async fn create(&mut self, policy: &NewPolicy) -> Result<Policy> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO policies (name, policy_type, base_path, dir_name_rule, file_name_rule,
                                   max_size, allowed_extensions, chunk_size, listable,
                                   thumb_needed, placeholder_with_size)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(&policy.name)
        .bind(&policy.policy_type)
        .bind(&policy.base_path)
        .bind(&policy.dir_name_rule)
        .bind(&policy.file_name_rule)
        .bind(policy.max_size)
        .bind(policy.allowed_extensions.join(","))
        .bind(policy.chunk_size)
        .bind(policy.listable)
        .bind(policy.thumb_needed)
        .bind(policy.placeholder_with_size)
        .fetch_one(&mut *self.conn)
        .await?;

        self.get_by_id(id)
            .await?
            .ok_or_else(|| NimbusError::NotExist("policy".to_string()))
    }

    /// Get a policy by ID.
    pub async fn get_by_id(&mut self, id: i64) -> Result<Option<Policy>> {
        let sql = format!("SELECT {POLICY_COLUMNS} FROM policies WHERE id = ?");
        let policy = sqlx::query_as::<_, Policy>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.conn)
            .await?;
        Ok(policy)
    }

    /// Set the thumbnail box override.
    pub async fn set_thumb_size(&mut self, id: i64, width: i64, height: i64) -> Result<()> {
        sqlx::query("UPDATE policies SET thumb_width = ?, thumb_height = ? WHERE id = ?")
            .bind(width)
            .bind(height)
            .bind(id)
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn policy(dir_rule: &str, file_rule: &str) -> Policy {
        Policy {
            dir_name_rule: dir_rule.to_string(),
            file_name_rule: file_rule.to_string(),
            ..Policy::default()
        }
    }

    #[test]
    fn test_generate_path() {
        let p = policy("uploads/{uid}/{path}", "{originname}");
        assert_eq!(p.generate_path(7, "/photos/2024"), "uploads/7/photos/2024");
        assert_eq!(p.generate_path(7, "/"), "uploads/7");
    }

    #[test]
    fn test_generate_file_name() {
        let p = policy("", "{randomkey8}_{originname}");
        let name = p.generate_file_name(1, "cat.png");
        assert_eq!(name.len(), 8 + 1 + "cat.png".len());
        assert!(name.ends_with("_cat.png"));

        let p = policy("", "{uuid}{ext}");
        let name = p.generate_file_name(1, "a.JPG");
        assert!(name.ends_with(".jpg"));
        assert_eq!(name.len(), 36 + 4);
    }

    #[test]
    fn test_generate_save_path() {
        let p = policy("{uid}", "{originname}");
        assert_eq!(p.generate_save_path(3, "/", "a.txt"), "3/a.txt");

        let p = policy("", "");
        assert_eq!(p.generate_save_path(3, "/x", "a.txt"), "a.txt");
    }

    #[test]
    fn test_extension_and_size_limits() {
        let p = Policy {
            allowed_extensions: "jpg, .PNG".to_string(),
            max_size: 100,
            ..Policy::default()
        };
        assert!(p.is_extension_allowed("a.png"));
        assert!(p.is_extension_allowed("a.JPG"));
        assert!(!p.is_extension_allowed("a.gif"));
        assert!(!p.is_extension_allowed("noext"));
        assert!(p.is_size_allowed(100));
        assert!(!p.is_size_allowed(101));

        let open = Policy::default();
        assert!(open.is_extension_allowed("anything.bin"));
        assert!(open.is_size_allowed(i64::MAX));
    }

    #[test]
    fn test_thumb_size() {
        let mut p = Policy::default();
        assert_eq!(p.thumb_size(400, 300), (400, 300));
        p.thumb_width = Some(64);
        p.thumb_height = Some(0);
        assert_eq!(p.thumb_size(400, 300), (64, 300));
    }

    #[tokio::test]
    async fn test_repository_roundtrip() {
        let db = Database::open_in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        let mut repo = PolicyRepository::new(&mut conn);

        let created = repo
            .create(
                &NewPolicy::new("local", "local")
                    .with_extensions(&["png", "jpg"])
                    .with_max_size(1024)
                    .with_listable(true),
            )
            .await
            .unwrap();
        assert_eq!(created.policy_type, "local");
        assert_eq!(created.allowed_extensions, "png,jpg");
        assert!(created.listable);
        assert!(created.thumb_needed);
        assert_eq!(created.thumb_width, None);

        repo.set_thumb_size(created.id, 32, 24).await.unwrap();
        let loaded = repo.get_by_id(created.id).await.unwrap().unwrap();
        assert_eq!(loaded.thumb_size(400, 300), (32, 24));
        assert!(repo.get_by_id(999).await.unwrap().is_none());
    }
}
