//! Virtual filesystem for Nimbus.
//!
//! This module provides the per-user file tree and its orchestration:
//! - Metadata accessors for files, folders, policies and shares
//! - The hook pipeline fired around uploads and imports
//! - [`Engine`], which composes metadata, physical storage and the quota
//!   ledger into upload, delete, move, copy, rename and listing operations
//! - Upload sessions and the thumbnail worker pool

mod delete;
mod engine;
mod file;
mod folder;
mod header;
mod hooks;
mod import;
mod manage;
mod policy;
mod session;
mod share;
mod thumbnail;
mod upload;
mod validate;

pub use delete::{DeleteOutcome, Targets};
pub use engine::{Engine, ObjectKind, ObjectView};
pub use file::{File, FileRepository, Metadata, NewFile};
pub use folder::{Folder, FolderRepository};
pub use header::{FileHeader, FileStream, UploadMode};
pub use hooks::{
    ClearFileSize, CreateFileRecord, DeleteTempFile, FinalizeSession, FnHook, GenerateThumb,
    Hook, HookContext, HookEvent, HookPayload, HookPreset, HookRegistry, RemovePlaceholder,
};
pub use import::ImportReport;
pub use policy::{NewPolicy, Policy, PolicyRepository};
pub use session::{SessionUpload, UploadSession, UPLOAD_SESSION_PREFIX};
pub use share::{Share, ShareRepository};
pub use thumbnail::ThumbnailPool;
pub use validate::{validate_name, ValidateCapacity, ValidateFile, ValidateThumbnailExtension};

/// Split a virtual path into its components.
///
/// Empty segments are dropped, so `/a//b/` yields `["a", "b"]`.
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Normalize a virtual path to `/a/b` form.
pub fn clean_path(path: &str) -> String {
    format!("/{}", split_path(path).join("/"))
}

/// Join a virtual directory path and a child name.
pub fn join_path(base: &str, name: &str) -> String {
    let base = clean_path(base);
    let name = name.trim_matches('/');
    if name.is_empty() {
        base
    } else if base == "/" {
        format!("/{name}")
    } else {
        format!("{base}/{name}")
    }
}

/// Split a virtual path into its parent directory and base name.
pub fn split_parent(path: &str) -> (String, String) {
    let mut parts = split_path(path);
    match parts.pop() {
        Some(name) => (format!("/{}", parts.join("/")), name.to_string()),
        None => ("/".to_string(), String::new()),
    }
}

/// Extension of a file name, lowercased, without the dot.
pub fn extension_of(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.to_lowercase(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_and_clean() {
        assert_eq!(split_path("/a//b/"), vec!["a", "b"]);
        assert!(split_path("/").is_empty());
        assert_eq!(clean_path("a/b/"), "/a/b");
        assert_eq!(clean_path(""), "/");
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/", "a"), "/a");
        assert_eq!(join_path("/a/", "b"), "/a/b");
        assert_eq!(join_path("/a", ""), "/a");
    }

    #[test]
    fn test_split_parent() {
        assert_eq!(
            split_parent("/a/b/c.txt"),
            ("/a/b".to_string(), "c.txt".to_string())
        );
        assert_eq!(split_parent("/c.txt"), ("/".to_string(), "c.txt".to_string()));
        assert_eq!(split_parent("/"), ("/".to_string(), String::new()));
    }

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of("a.PNG"), "png");
        assert_eq!(extension_of("archive.tar.gz"), "gz");
        assert_eq!(extension_of(".bashrc"), "");
        assert_eq!(extension_of("README"), "");
    }
}
