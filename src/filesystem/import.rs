//! Import of physical objects that already exist in storage.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{join_path, split_parent, Engine, FileHeader, HookPreset};
use crate::db::UnitOfWork;
use crate::{NimbusError, Result};

/// What an import recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Directories created or found along the way.
    pub folders_created: usize,
    /// File records added.
    pub files_added: usize,
    /// Physical keys that were not recorded.
    pub skipped: Vec<String>,
}

impl Engine {
    /// Record the objects under the physical directory `src` below the
    /// virtual directory `dst`.
    ///
    /// Runs the `BeforeAddFile` hooks for every file. Running out of capacity
    /// stops the import with `InsufficientCapacity`; other per-file failures
    /// are logged and the file is skipped. Thumbnails of added records start
    /// after [`Engine::commit`].
    pub async fn import(
        &self,
        uow: &mut UnitOfWork<'_>,
        cancel: &CancellationToken,
        src: &str,
        dst: &str,
        recursive: bool,
    ) -> Result<ImportReport> {
        self.install_preset(HookPreset::Import);
        let objects = self.handler().list(cancel, src, recursive).await?;
        let dst = self.ensure_directory(uow, dst).await?.full_path();

        let mut report = ImportReport::default();
        let (dirs, files): (Vec<_>, Vec<_>) = objects.into_iter().partition(|o| o.is_dir);

        for dir in dirs {
            let path = join_path(&dst, &dir.relative_path);
            match self.ensure_directory(uow, &path).await {
                Ok(_) => report.folders_created += 1,
                Err(e) => {
                    warn!(path = %path, error = %e, "could not create directory, skipped");
                    report.skipped.push(dir.source);
                }
            }
        }

        for object in files {
            if cancel.is_cancelled() {
                return Err(NimbusError::Canceled);
            }
            let (parent_path, _) = split_parent(&join_path(&dst, &object.relative_path));
            let parent = match self.ensure_directory(uow, &parent_path).await {
                Ok(parent) => parent,
                Err(e) => {
                    warn!(key = %object.source, error = %e, "no parent directory, skipped");
                    report.skipped.push(object.source);
                    continue;
                }
            };

            let mut header = FileHeader::new(&parent_path, &object.name, object.size)
                .with_save_path(&object.source);
            match self.add_file(uow, &parent, &mut header).await {
                Ok(_) => report.files_added += 1,
                Err(NimbusError::InsufficientCapacity) => {
                    warn!(key = %object.source, "import stopped, capacity exhausted");
                    return Err(NimbusError::InsufficientCapacity);
                }
                Err(e) => {
                    warn!(key = %object.source, error = %e, "could not add file, skipped");
                    report.skipped.push(object.source);
                }
            }
        }

        info!(
            user_id = self.user().id,
            from = %src,
            to = %dst,
            folders = report.folders_created,
            files = report.files_added,
            skipped = report.skipped.len(),
            "import finished"
        );
        Ok(report)
    }
}

