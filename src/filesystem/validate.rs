//! Name, extension and capacity checks run as hooks.

use async_trait::async_trait;

use super::{Engine, FileHeader, Hook, HookContext};
use crate::db::UnitOfWork;
use crate::quota::QuotaLedger;
use crate::{NimbusError, Result};

const RESERVED_CHARS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];
const MAX_NAME_LEN: usize = 255;

/// Check that `name` is usable as a file or folder name.
pub fn validate_name(name: &str) -> Result<()> {
    let illegal = name.is_empty()
        || name == "."
        || name == ".."
        || name.len() > MAX_NAME_LEN
        || name.ends_with(' ')
        || name.contains(RESERVED_CHARS)
        || name.chars().any(char::is_control);
    if illegal {
        return Err(NimbusError::IllegalName(name.to_string()));
    }
    Ok(())
}

/// Reject illegal names, disallowed extensions and oversized files.
pub struct ValidateFile;

#[async_trait]
impl Hook for ValidateFile {
    fn name(&self) -> &str {
        "validate_file"
    }

    async fn call(&self, ctx: &mut HookContext<'_, '_>) -> Result<()> {
        let header = ctx.payload.header();
        let policy = ctx.engine.policy();

        validate_name(&header.name)?;
        if !policy.is_extension_allowed(&header.name) {
            return Err(NimbusError::IllegalName(header.name.clone()));
        }
        if !policy.is_size_allowed(header.size) {
            return Err(NimbusError::Validation(format!(
                "{} exceeds the size limit of {} bytes",
                header.name, policy.max_size
            )));
        }
        Ok(())
    }
}

/// Reject files the user has no room for.
///
/// When overwriting, only the growth over the existing record counts.
pub struct ValidateCapacity;

#[async_trait]
impl Hook for ValidateCapacity {
    fn name(&self) -> &str {
        "validate_capacity"
    }

    async fn call(&self, ctx: &mut HookContext<'_, '_>) -> Result<()> {
        check_capacity(ctx.engine, ctx.uow, ctx.payload.header()).await
    }
}

/// Fail with `InsufficientCapacity` unless the user has room for `header`.
///
/// When overwriting, only the growth over the existing record counts.
pub(crate) async fn check_capacity(
    engine: &Engine,
    uow: &mut UnitOfWork<'_>,
    header: &FileHeader,
) -> Result<()> {
    let needed = header.size - header.origin.as_ref().map_or(0, |f| f.size);
    if needed <= 0 {
        return Ok(());
    }
    if !QuotaLedger::new(uow.conn()).has_room(engine.user().id, needed).await? {
        return Err(NimbusError::InsufficientCapacity);
    }
    Ok(())
}

/// Check the size actually written against the policy limit and the capacity.
pub(crate) async fn check_written_size(
    engine: &Engine,
    uow: &mut UnitOfWork<'_>,
    header: &FileHeader,
) -> Result<()> {
    let policy = engine.policy();
    if !policy.is_size_allowed(header.size) {
        return Err(NimbusError::Validation(format!(
            "{} exceeds the size limit of {} bytes",
            header.name, policy.max_size
        )));
    }
    check_capacity(engine, uow, header).await
}

/// Reject objects that look like generated thumbnails.
pub struct ValidateThumbnailExtension;

#[async_trait]
impl Hook for ValidateThumbnailExtension {
    fn name(&self) -> &str {
        "validate_thumbnail_extension"
    }

    async fn call(&self, ctx: &mut HookContext<'_, '_>) -> Result<()> {
        let suffix = &ctx.engine.context().config.thumbnail.file_suffix;
        let name = &ctx.payload.header().name;
        if !suffix.is_empty() && name.ends_with(suffix.as_str()) {
            return Err(NimbusError::IllegalName(name.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("report.pdf").is_ok());
        assert!(validate_name("with space.txt").is_ok());
        assert!(validate_name("目录").is_ok());

        for bad in ["", ".", "..", "a/b", "a\\b", "what?", "trailing ", "tab\t"] {
            assert!(
                matches!(validate_name(bad), Err(NimbusError::IllegalName(_))),
                "{bad:?} should be rejected"
            );
        }
        assert!(validate_name(&"x".repeat(256)).is_err());
    }
}
