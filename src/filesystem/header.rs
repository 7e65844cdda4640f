//! Upload headers and streams.

use chrono::{DateTime, Utc};

use super::{join_path, File};
use crate::storage::ByteReader;

/// How the engine treats the bytes of an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UploadMode {
    /// Bytes are written through the storage handler.
    #[default]
    Normal,
    /// No bytes are transferred; only hooks and metadata run.
    Nop,
}

/// Describes one file being uploaded or added.
#[derive(Debug, Clone, Default)]
pub struct FileHeader {
    /// File name.
    pub name: String,
    /// Declared size in bytes.
    pub size: i64,
    /// Virtual directory the file goes into.
    pub virtual_path: String,
    /// Physical key. Generated from the policy rules when empty.
    pub save_path: String,
    /// Client-supplied modification time.
    pub last_modified: Option<DateTime<Utc>>,
    /// Upload session key for placeholders.
    pub upload_session_id: Option<String>,
    /// Byte transfer mode.
    pub mode: UploadMode,
    /// Replace an existing file with the same name.
    pub overwrite: bool,
    /// Existing record being overwritten.
    pub origin: Option<File>,
    /// Record created or updated by the after-upload hooks.
    pub record: Option<File>,
}

impl FileHeader {
    /// Create a header for `name` in `virtual_path`.
    pub fn new(virtual_path: impl Into<String>, name: impl Into<String>, size: i64) -> Self {
        Self {
            name: name.into(),
            size,
            virtual_path: virtual_path.into(),
            ..Self::default()
        }
    }

    /// Set the physical key.
    pub fn with_save_path(mut self, save_path: impl Into<String>) -> Self {
        self.save_path = save_path.into();
        self
    }

    /// Set the overwrite flag.
    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Set the modification time hint.
    pub fn with_last_modified(mut self, last_modified: DateTime<Utc>) -> Self {
        self.last_modified = Some(last_modified);
        self
    }

    /// Full virtual path of the file.
    pub fn full_path(&self) -> String {
        join_path(&self.virtual_path, &self.name)
    }
}

/// A header plus the bytes to store.
pub struct FileStream {
    /// File description.
    pub header: FileHeader,
    /// Content.
    pub reader: ByteReader,
}

impl FileStream {
    /// Create a stream.
    pub fn new(header: FileHeader, reader: ByteReader) -> Self {
        Self { header, reader }
    }

    /// A stream over an in-memory buffer.
    pub fn from_bytes(
        virtual_path: impl Into<String>,
        name: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        let header = FileHeader::new(virtual_path, name, bytes.len() as i64);
        Self::new(header, Box::new(std::io::Cursor::new(bytes)))
    }
}

impl std::fmt::Debug for FileStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStream")
            .field("header", &self.header)
            .finish()
    }
}
