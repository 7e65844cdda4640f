//! Error types for Nimbus.

use thiserror::Error;

/// Common error type for Nimbus.
#[derive(Error, Debug)]
pub enum NimbusError {
    /// Database error.
    ///
    /// Errors from sqlx are automatically converted.
    #[error("database error: {0}")]
    Database(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Path, record or physical object is absent.
    #[error("{0} not found")]
    NotExist(String),

    /// Name collision on create, rename or move.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Invalid or disallowed name or extension.
    #[error("illegal name: {0}")]
    IllegalName(String),

    /// The root folder cannot be renamed, moved or deleted.
    #[error("root folder cannot be modified")]
    RootProtected,

    /// Quota pre-check failed.
    #[error("insufficient capacity")]
    InsufficientCapacity,

    /// A batch operation finished with some elements failing.
    #[error("failed to delete {failed} file(s)")]
    PartialFailure {
        /// Number of items that were not removed.
        failed: usize,
    },

    /// Storage handler I/O failure.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// An optimistic size check matched no rows; the caller should retry.
    #[error("inconsistent state: {0}")]
    Inconsistent(String),

    /// The operation was canceled by the client.
    #[error("operation canceled")]
    Canceled,

    /// The storage policy names a backend type with no handler.
    #[error("unknown policy type: {0}")]
    UnknownPolicyType(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Image decoding or encoding error.
    #[error("image error: {0}")]
    Image(String),

    /// Validation error for caller input.
    #[error("validation error: {0}")]
    Validation(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl NimbusError {
    /// Whether this error is a name collision.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, NimbusError::AlreadyExists(_))
    }

    /// Whether this error reports a partial batch failure.
    pub fn is_partial_failure(&self) -> bool {
        matches!(self, NimbusError::PartialFailure { .. })
    }
}

// Conversion from sqlx errors
impl From<sqlx::Error> for NimbusError {
    fn from(e: sqlx::Error) -> Self {
        NimbusError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for NimbusError {
    fn from(e: serde_json::Error) -> Self {
        NimbusError::Serialization(e.to_string())
    }
}

impl From<image::ImageError> for NimbusError {
    fn from(e: image::ImageError) -> Self {
        NimbusError::Image(e.to_string())
    }
}

/// Result type alias for Nimbus operations.
pub type Result<T> = std::result::Result<T, NimbusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_failure_display() {
        let err = NimbusError::PartialFailure { failed: 3 };
        assert_eq!(err.to_string(), "failed to delete 3 file(s)");
        assert!(err.is_partial_failure());
    }

    #[test]
    fn test_not_exist_display() {
        let err = NimbusError::NotExist("folder".to_string());
        assert_eq!(err.to_string(), "folder not found");
    }

    #[test]
    fn test_already_exists_display() {
        let err = NimbusError::AlreadyExists("a.png".to_string());
        assert_eq!(err.to_string(), "a.png already exists");
        assert!(err.is_already_exists());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: NimbusError = io_err.into();
        assert!(matches!(err, NimbusError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<i32>("nope").unwrap_err();
        let err: NimbusError = json_err.into();
        assert!(matches!(err, NimbusError::Serialization(_)));
    }

    #[test]
    fn test_result_alias() {
        fn sample_ok() -> Result<i32> {
            Ok(42)
        }

        fn sample_err() -> Result<i32> {
            Err(NimbusError::InsufficientCapacity)
        }

        assert_eq!(sample_ok().unwrap(), 42);
        assert!(sample_err().is_err());
    }
}
