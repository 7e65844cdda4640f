//! Configuration module for Nimbus.

use serde::Deserialize;
use std::path::Path;

use crate::{NimbusError, Result};

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Maximum number of pooled connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_db_path() -> String {
    "data/nimbus.db".to_string()
}

fn default_max_connections() -> u32 {
    8
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            max_connections: default_max_connections(),
        }
    }
}

/// Physical storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory of the `local` storage policy type.
    #[serde(default = "default_local_root")]
    pub local_root: String,
}

fn default_local_root() -> String {
    "data/uploads".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            local_root: default_local_root(),
        }
    }
}

/// Upload session configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Lifetime of an upload session in seconds.
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,
}

fn default_session_timeout() -> u64 {
    86400 // 1 day
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            session_timeout_secs: default_session_timeout(),
        }
    }
}

/// Thumbnail generation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ThumbnailConfig {
    /// Maximum concurrent generations (0 = available parallelism).
    #[serde(default)]
    pub max_task_count: usize,
    /// Default bounding box width.
    #[serde(default = "default_thumb_width")]
    pub width: u32,
    /// Default bounding box height.
    #[serde(default = "default_thumb_height")]
    pub height: u32,
    /// Suffix appended to the source key to store the thumbnail.
    #[serde(default = "default_thumb_suffix")]
    pub file_suffix: String,
    /// Release decode buffers right after each generation.
    #[serde(default)]
    pub gc_after_generate: bool,
    /// Extensions the generator handles.
    #[serde(default = "default_thumb_extensions")]
    pub extensions: Vec<String>,
    /// Output encoding (jpg or png).
    #[serde(default = "default_thumb_format")]
    pub encode_format: String,
    /// JPEG quality (1-100).
    #[serde(default = "default_thumb_quality")]
    pub quality: u8,
}

fn default_thumb_width() -> u32 {
    400
}

fn default_thumb_height() -> u32 {
    300
}

fn default_thumb_suffix() -> String {
    "._thumb".to_string()
}

fn default_thumb_extensions() -> Vec<String> {
    ["jpg", "jpeg", "png", "gif"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_thumb_format() -> String {
    "jpg".to_string()
}

fn default_thumb_quality() -> u8 {
    85
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            max_task_count: 0,
            width: default_thumb_width(),
            height: default_thumb_height(),
            file_suffix: default_thumb_suffix(),
            gc_after_generate: false,
            extensions: default_thumb_extensions(),
            encode_format: default_thumb_format(),
            quality: default_thumb_quality(),
        }
    }
}

impl ThumbnailConfig {
    /// Resolve the worker pool capacity.
    pub fn worker_count(&self) -> usize {
        if self.max_task_count > 0 {
            return self.max_task_count;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    /// Whether the given file name has a handled extension.
    pub fn handles(&self, name: &str) -> bool {
        match name.rsplit_once('.') {
            Some((_, ext)) => self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)),
            None => false,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Path to the log file.
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "logs/nimbus.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Upload session configuration.
    #[serde(default)]
    pub upload: UploadConfig,
    /// Thumbnail configuration.
    #[serde(default)]
    pub thumbnail: ThumbnailConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(NimbusError::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML file and apply environment variable overrides.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| NimbusError::Config(format!("config parse error: {e}")))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `NIMBUS_DATABASE_PATH`: Override the database file path
    /// - `NIMBUS_LOCAL_ROOT`: Override the local storage root
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("NIMBUS_DATABASE_PATH") {
            if !path.is_empty() {
                self.database.path = path;
            }
        }
        if let Ok(root) = std::env::var("NIMBUS_LOCAL_ROOT") {
            if !root.is_empty() {
                self.storage.local_root = root;
            }
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.upload.session_timeout_secs == 0 {
            return Err(NimbusError::Config(
                "upload.session_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.thumbnail.width == 0 || self.thumbnail.height == 0 {
            return Err(NimbusError::Config(
                "thumbnail width and height must be greater than 0".to_string(),
            ));
        }
        if !matches!(
            self.thumbnail.encode_format.as_str(),
            "jpg" | "jpeg" | "png"
        ) {
            return Err(NimbusError::Config(format!(
                "unsupported thumbnail encode_format: {}",
                self.thumbnail.encode_format
            )));
        }
        if self.thumbnail.quality == 0 || self.thumbnail.quality > 100 {
            return Err(NimbusError::Config(
                "thumbnail quality must be within 1..=100".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.database.path, "data/nimbus.db");
        assert_eq!(config.database.max_connections, 8);

        assert_eq!(config.storage.local_root, "data/uploads");

        assert_eq!(config.upload.session_timeout_secs, 86400);

        assert_eq!(config.thumbnail.max_task_count, 0);
        assert_eq!(config.thumbnail.width, 400);
        assert_eq!(config.thumbnail.height, 300);
        assert_eq!(config.thumbnail.file_suffix, "._thumb");
        assert!(!config.thumbnail.gc_after_generate);
        assert_eq!(config.thumbnail.extensions, vec!["jpg", "jpeg", "png", "gif"]);
        assert_eq!(config.thumbnail.encode_format, "jpg");

        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.file, "logs/nimbus.log");

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[database]
path = "custom/db.sqlite"
max_connections = 2

[storage]
local_root = "/srv/blobs"

[upload]
session_timeout_secs = 600

[thumbnail]
max_task_count = 3
width = 128
height = 96
file_suffix = ".thumb"
gc_after_generate = true
extensions = ["png"]
encode_format = "png"

[logging]
level = "debug"
file = "custom/logs/app.log"
"#;

        let config = Config::parse(toml).unwrap();

        assert_eq!(config.database.path, "custom/db.sqlite");
        assert_eq!(config.database.max_connections, 2);
        assert_eq!(config.storage.local_root, "/srv/blobs");
        assert_eq!(config.upload.session_timeout_secs, 600);
        assert_eq!(config.thumbnail.worker_count(), 3);
        assert_eq!(config.thumbnail.width, 128);
        assert_eq!(config.thumbnail.height, 96);
        assert_eq!(config.thumbnail.file_suffix, ".thumb");
        assert!(config.thumbnail.gc_after_generate);
        assert!(config.thumbnail.handles("a.PNG"));
        assert!(!config.thumbnail.handles("a.jpg"));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_parse_empty_config() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.upload.session_timeout_secs, 86400);
        assert!(config.thumbnail.worker_count() >= 1);
    }

    #[test]
    fn test_parse_invalid_config() {
        let result = Config::parse("[upload]\nsession_timeout_secs = \"soon\"");
        assert!(matches!(result, Err(NimbusError::Config(_))));
    }

    #[test]
    fn test_handles_extension() {
        let config = ThumbnailConfig::default();
        assert!(config.handles("photo.JPG"));
        assert!(config.handles("a.b.gif"));
        assert!(!config.handles("notes.txt"));
        assert!(!config.handles("noext"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.upload.session_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.thumbnail.encode_format = "webp".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.thumbnail.quality = 0;
        assert!(config.validate().is_err());
    }
}
