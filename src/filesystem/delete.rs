//! Recursive deletion.
//!
//! Physical objects go first, grouped by policy, then the metadata of every
//! file whose object is gone is removed in the caller's unit of work together
//! with its ledger deduction. Folders only go when all of their files did.

use std::collections::{BTreeMap, HashSet};

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Engine, File, FileRepository, Folder, FolderRepository, ShareRepository};
use crate::db::UnitOfWork;
use crate::{NimbusError, Result};

/// Folders and files an operation works on.
#[derive(Debug, Clone, Default)]
pub struct Targets {
    /// Folders, descendants included.
    pub folders: Vec<Folder>,
    /// Files, including those inside `folders`.
    pub files: Vec<File>,
}

impl Targets {
    /// Whether there is nothing to work on.
    pub fn is_empty(&self) -> bool {
        self.folders.is_empty() && self.files.is_empty()
    }

    fn push_folders(&mut self, folders: Vec<Folder>) {
        let known: HashSet<i64> = self.folders.iter().map(|f| f.id).collect();
        self.folders
            .extend(folders.into_iter().filter(|f| !known.contains(&f.id)));
    }

    fn push_files(&mut self, files: Vec<File>) {
        let known: HashSet<i64> = self.files.iter().map(|f| f.id).collect();
        self.files
            .extend(files.into_iter().filter(|f| !known.contains(&f.id)));
    }
}

/// What a delete removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteOutcome {
    /// IDs of removed file records.
    pub deleted_files: Vec<i64>,
    /// IDs of removed folders.
    pub deleted_folders: Vec<i64>,
    /// Number of files kept because their object could not be removed.
    pub failed: usize,
}

impl DeleteOutcome {
    /// Whether every target was removed.
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }

    /// Turn a partial outcome into `PartialFailure`.
    pub fn into_result(self) -> Result<Self> {
        if self.failed > 0 {
            return Err(NimbusError::PartialFailure {
                failed: self.failed,
            });
        }
        Ok(self)
    }
}

impl Engine {
    /// Add folders of the acting user, their descendants and every file
    /// inside them to `targets`. The root folder is skipped with its contents.
    pub async fn list_delete_dirs(
        &self,
        uow: &mut UnitOfWork<'_>,
        ids: &[i64],
        targets: &mut Targets,
    ) -> Result<()> {
        let mut repo = FolderRepository::new(uow.conn());
        let root = repo.root_of(self.user().id).await?;
        let ids: Vec<i64> = ids.iter().copied().filter(|id| *id != root.id).collect();
        if ids.is_empty() {
            return Ok(());
        }
        let folders = repo.recursive_children(&ids, self.user().id).await?;

        let folder_ids: Vec<i64> = folders.iter().map(|f| f.id).collect();
        let files = FileRepository::new(uow.conn())
            .list_by_folders(&folder_ids)
            .await?;

        targets.push_folders(folders);
        targets.push_files(files);
        Ok(())
    }

    /// Add files of the acting user to `targets`.
    pub async fn list_delete_files(
        &self,
        uow: &mut UnitOfWork<'_>,
        ids: &[i64],
        targets: &mut Targets,
    ) -> Result<()> {
        let files = FileRepository::new(uow.conn())
            .get_by_ids(ids, self.user().id)
            .await?;
        targets.push_files(files);
        Ok(())
    }

    /// Delete folders (recursively) and files.
    ///
    /// With `force`, records are removed even when their objects could not
    /// be. The returned outcome counts the files that were kept;
    /// [`DeleteOutcome::into_result`] reports them as `PartialFailure` once
    /// the caller has committed `uow`.
    pub async fn delete(
        &self,
        uow: &mut UnitOfWork<'_>,
        cancel: &CancellationToken,
        dirs: &[i64],
        files: &[i64],
        force: bool,
    ) -> Result<DeleteOutcome> {
        let mut targets = Targets::default();
        if !dirs.is_empty() {
            self.list_delete_dirs(uow, dirs, &mut targets).await?;
        }
        if !files.is_empty() {
            self.list_delete_files(uow, files, &mut targets).await?;
        }
        self.delete_targets(uow, cancel, targets, force).await
    }

    /// Delete a prepared target set.
    pub async fn delete_targets(
        &self,
        uow: &mut UnitOfWork<'_>,
        cancel: &CancellationToken,
        targets: Targets,
        force: bool,
    ) -> Result<DeleteOutcome> {
        let Targets { folders, files } = targets;

        let shared = FileRepository::new(uow.conn())
            .find_shared_sources(&files)
            .await?;

        let mut groups: BTreeMap<i64, Vec<String>> = BTreeMap::new();
        for file in &files {
            let source = (file.policy_id, file.source_name.clone());
            if shared.contains(&source) {
                debug!(file_id = file.id, "object still referenced, kept");
                continue;
            }
            let keys = groups.entry(file.policy_id).or_default();
            if !keys.contains(&file.source_name) {
                keys.push(file.source_name.clone());
            }
        }

        let failed_sources = self.delete_grouped(uow, cancel, groups).await?;

        let (removed, kept): (Vec<File>, Vec<File>) = files.into_iter().partition(|f| {
            force || !failed_sources.contains(&(f.policy_id, f.source_name.clone()))
        });

        let removed_ids: Vec<i64> = removed.iter().map(|f| f.id).collect();
        FileRepository::new(uow.conn())
            .delete_batch(&removed)
            .await?;
        ShareRepository::new(uow.conn())
            .delete_by_source_ids(&removed_ids, false)
            .await?;

        let mut outcome = DeleteOutcome {
            deleted_files: removed_ids,
            deleted_folders: Vec::new(),
            failed: kept.len(),
        };

        if kept.is_empty() {
            let folder_ids: Vec<i64> = folders.iter().map(|f| f.id).collect();
            FolderRepository::new(uow.conn())
                .delete_by_ids(&folder_ids)
                .await?;
            ShareRepository::new(uow.conn())
                .delete_by_source_ids(&folder_ids, true)
                .await?;
            outcome.deleted_folders = folder_ids;
        } else {
            warn!(
                user_id = self.user().id,
                failed = kept.len(),
                "some files could not be deleted, their folders are kept"
            );
        }

        debug!(
            files = outcome.deleted_files.len(),
            folders = outcome.deleted_folders.len(),
            failed = outcome.failed,
            "delete finished"
        );
        Ok(outcome)
    }

    /// Delete objects, one batch per policy, all policies at once. Returns
    /// the `(policy, key)` pairs that could not be removed.
    ///
    /// Thumbnails go along with their sources; failing to remove one does not
    /// count against the source.
    async fn delete_grouped(
        &self,
        uow: &mut UnitOfWork<'_>,
        cancel: &CancellationToken,
        groups: BTreeMap<i64, Vec<String>>,
    ) -> Result<HashSet<(i64, String)>> {
        let suffix = self.context().config.thumbnail.file_suffix.as_str();
        let mut failed_sources = HashSet::new();

        let mut jobs = Vec::with_capacity(groups.len());
        for (policy_id, keys) in groups {
            match self.handler_for(uow, policy_id).await {
                Ok((_, handler)) => jobs.push((policy_id, keys, handler)),
                Err(e) => {
                    warn!(policy_id, error = %e, "no handler for policy, objects kept");
                    failed_sources.extend(keys.into_iter().map(|k| (policy_id, k)));
                }
            }
        }

        let results = join_all(jobs.iter().map(|(_, keys, handler)| {
            let mut batch = keys.clone();
            if !suffix.is_empty() {
                batch.extend(keys.iter().map(|k| format!("{k}{suffix}")));
            }
            async move { handler.delete(cancel, &batch).await }
        }))
        .await;

        for ((policy_id, keys, _), result) in jobs.into_iter().zip(results) {
            match result {
                Ok(failed) => {
                    let failed: HashSet<String> = failed.into_iter().collect();
                    failed_sources.extend(
                        keys.into_iter()
                            .filter(|k| failed.contains(k))
                            .map(|k| (policy_id, k)),
                    );
                }
                Err(e) => {
                    warn!(policy_id, error = %e, "batch delete failed");
                    failed_sources.extend(keys.into_iter().map(|k| (policy_id, k)));
                }
            }
        }
        Ok(failed_sources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_into_result() {
        let complete = DeleteOutcome {
            deleted_files: vec![1],
            deleted_folders: vec![2],
            failed: 0,
        };
        assert!(complete.is_complete());
        assert!(complete.into_result().is_ok());

        let partial = DeleteOutcome {
            failed: 1,
            ..DeleteOutcome::default()
        };
        let err = partial.into_result().unwrap_err();
        assert!(err.is_partial_failure());
        assert_eq!(err.to_string(), "failed to delete 1 file(s)");
    }

    #[test]
    fn test_targets_deduplicate() {
        let folder = Folder {
            id: 1,
            name: "a".to_string(),
            owner_id: 1,
            parent_id: Some(0),
            created_at: String::new(),
            updated_at: String::new(),
            position: String::new(),
        };
        let mut targets = Targets::default();
        assert!(targets.is_empty());
        targets.push_folders(vec![folder.clone()]);
        targets.push_folders(vec![folder]);
        assert_eq!(targets.folders.len(), 1);
    }
}
