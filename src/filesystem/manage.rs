//! Rename, move, copy and resize.

use std::collections::{HashSet, VecDeque};

use tracing::{debug, info};

use super::{
    validate_name, Engine, File, FileRepository, Folder, FolderRepository, ShareRepository,
};
use crate::db::UnitOfWork;
use crate::quota::QuotaLedger;
use crate::{NimbusError, Result};

impl Engine {
    /// Rename the first of `files`, or else the first of `dirs`.
    pub async fn rename(
        &self,
        uow: &mut UnitOfWork<'_>,
        dirs: &[i64],
        files: &[i64],
        new_name: &str,
    ) -> Result<()> {
        validate_name(new_name)?;
        let user_id = self.user().id;

        if let Some(&id) = files.first() {
            if !self.policy().is_extension_allowed(new_name) {
                return Err(NimbusError::IllegalName(new_name.to_string()));
            }
            let file = FileRepository::new(uow.conn())
                .get_by_ids(&[id], user_id)
                .await?
                .pop()
                .ok_or_else(|| NimbusError::NotExist(format!("file {id}")))?;
            if file.name == new_name {
                return Ok(());
            }
            if FolderRepository::new(uow.conn())
                .name_taken(file.folder_id, new_name)
                .await?
            {
                return Err(NimbusError::AlreadyExists(new_name.to_string()));
            }
            return FileRepository::new(uow.conn()).rename(id, new_name).await;
        }

        if let Some(&id) = dirs.first() {
            let folder = FolderRepository::new(uow.conn())
                .get_by_ids(&[id], user_id)
                .await?
                .pop()
                .ok_or_else(|| NimbusError::NotExist(format!("folder {id}")))?;
            let Some(parent_id) = folder.parent_id else {
                return Err(NimbusError::RootProtected);
            };
            if folder.name == new_name {
                return Ok(());
            }
            let mut folders = FolderRepository::new(uow.conn());
            if folders.name_taken(parent_id, new_name).await? {
                return Err(NimbusError::AlreadyExists(new_name.to_string()));
            }
            return folders.rename(id, new_name).await;
        }

        Err(NimbusError::NotExist("object".to_string()))
    }

    /// Move folders and files from `src` into `dst`.
    ///
    /// Every check runs before the first row changes, so a rejected move
    /// leaves the tree untouched.
    pub async fn move_objects(
        &self,
        uow: &mut UnitOfWork<'_>,
        dirs: &[i64],
        files: &[i64],
        src: &str,
        dst: &str,
    ) -> Result<()> {
        let src_folder = self.resolve_directory(uow, src).await?;
        let dst_folder = self.resolve_directory(uow, dst).await?;
        let (folders, files) = self.children_of(uow, &src_folder, dirs, files).await?;

        if src_folder.id == dst_folder.id {
            return Ok(());
        }
        for folder in &folders {
            if FolderRepository::new(uow.conn())
                .is_descendant(dst_folder.id, folder.id)
                .await?
            {
                return Err(NimbusError::Validation(format!(
                    "cannot move {} into itself",
                    folder.name
                )));
            }
        }
        self.check_collisions(uow, &dst_folder, &folders, &files)
            .await?;

        let user_id = self.user().id;
        let folder_ids: Vec<i64> = folders.iter().map(|f| f.id).collect();
        let file_ids: Vec<i64> = files.iter().map(|f| f.id).collect();
        FolderRepository::new(uow.conn())
            .move_to(&folder_ids, user_id, dst_folder.id)
            .await?;
        FileRepository::new(uow.conn())
            .move_to(&file_ids, user_id, dst_folder.id)
            .await?;

        debug!(
            user_id,
            folders = folder_ids.len(),
            files = file_ids.len(),
            to = %dst_folder.full_path(),
            "objects moved"
        );
        Ok(())
    }

    /// Copy folders and files from `src` into `dst`.
    ///
    /// Copies share the physical objects of their originals. The copied size
    /// is checked against the capacity once, up front, and then charged to the
    /// acting user without a further check.
    pub async fn copy(
        &self,
        uow: &mut UnitOfWork<'_>,
        dirs: &[i64],
        files: &[i64],
        src: &str,
        dst: &str,
    ) -> Result<()> {
        let src_folder = self.resolve_directory(uow, src).await?;
        let dst_folder = self.resolve_directory(uow, dst).await?;
        let (folders, files) = self.children_of(uow, &src_folder, dirs, files).await?;
        let user_id = self.user().id;

        for folder in &folders {
            if FolderRepository::new(uow.conn())
                .is_descendant(dst_folder.id, folder.id)
                .await?
            {
                return Err(NimbusError::Validation(format!(
                    "cannot copy {} into itself",
                    folder.name
                )));
            }
        }
        self.check_collisions(uow, &dst_folder, &folders, &files)
            .await?;

        let folder_ids: Vec<i64> = folders.iter().map(|f| f.id).collect();
        let tree = FolderRepository::new(uow.conn())
            .recursive_children(&folder_ids, user_id)
            .await?;
        let tree_ids: Vec<i64> = tree.iter().map(|f| f.id).collect();
        let nested = FileRepository::new(uow.conn())
            .list_by_folders(&tree_ids)
            .await?;
        let total: i64 = nested
            .iter()
            .chain(files.iter())
            .filter(|f| !f.is_placeholder())
            .map(|f| f.size)
            .sum();
        if !QuotaLedger::new(uow.conn()).has_room(user_id, total).await? {
            return Err(NimbusError::InsufficientCapacity);
        }

        for folder in &folders {
            self.copy_tree(uow, folder, dst_folder.id).await?;
        }
        let mut repo = FileRepository::new(uow.conn());
        for file in files.iter().filter(|f| !f.is_placeholder()) {
            repo.copy_to(file, dst_folder.id, user_id).await?;
        }

        info!(user_id, size = total, to = %dst_folder.full_path(), "objects copied");
        Ok(())
    }

    /// Copy what a share points at into the acting user's `dst`.
    ///
    /// Like [`Engine::copy`] the copies share physical objects, but the size
    /// is charged to the acting user without a capacity check.
    pub async fn save_to(&self, uow: &mut UnitOfWork<'_>, share_id: i64, dst: &str) -> Result<()> {
        let share = ShareRepository::new(uow.conn())
            .get_by_id(share_id)
            .await?
            .ok_or_else(|| NimbusError::NotExist(format!("share {share_id}")))?;
        let dst_folder = self.resolve_directory(uow, dst).await?;

        if share.is_dir {
            let folder = FolderRepository::new(uow.conn())
                .get_by_id(share.source_id)
                .await?
                .ok_or_else(|| NimbusError::NotExist(format!("folder {}", share.source_id)))?;
            if folder.is_root() {
                return Err(NimbusError::RootProtected);
            }
            if FolderRepository::new(uow.conn())
                .is_descendant(dst_folder.id, folder.id)
                .await?
            {
                return Err(NimbusError::Validation(format!(
                    "cannot save {} into itself",
                    folder.name
                )));
            }
            self.check_collisions(uow, &dst_folder, std::slice::from_ref(&folder), &[])
                .await?;
            self.copy_tree(uow, &folder, dst_folder.id).await?;
        } else {
            let file = FileRepository::new(uow.conn())
                .get_by_id(share.source_id)
                .await?
                .filter(|f| !f.is_placeholder())
                .ok_or_else(|| NimbusError::NotExist(format!("file {}", share.source_id)))?;
            self.check_collisions(uow, &dst_folder, &[], std::slice::from_ref(&file))
                .await?;
            FileRepository::new(uow.conn())
                .copy_to(&file, dst_folder.id, self.user().id)
                .await?;
        }

        info!(
            user_id = self.user().id,
            share = share_id,
            to = %dst_folder.full_path(),
            "shared objects saved"
        );
        Ok(())
    }

    /// Change the size of a file, moving the difference through the ledger.
    ///
    /// Fails with `Inconsistent` if the size changed since it was read.
    pub async fn resize_file(
        &self,
        uow: &mut UnitOfWork<'_>,
        file_id: i64,
        new_size: i64,
    ) -> Result<File> {
        if new_size < 0 {
            return Err(NimbusError::Validation("size must not be negative".to_string()));
        }
        let user_id = self.user().id;
        let mut files = FileRepository::new(uow.conn());
        let file = files
            .get_by_ids(&[file_id], user_id)
            .await?
            .pop()
            .ok_or_else(|| NimbusError::NotExist(format!("file {file_id}")))?;

        let delta = new_size - file.size;
        if delta > 0 && !QuotaLedger::new(uow.conn()).has_room(user_id, delta).await? {
            return Err(NimbusError::InsufficientCapacity);
        }

        let mut files = FileRepository::new(uow.conn());
        files.update_size(&file, new_size).await?;
        files
            .get_by_id(file_id)
            .await?
            .ok_or_else(|| NimbusError::NotExist(format!("file {file_id}")))
    }

    /// Load the requested folders and files, all of which must sit directly in `parent`.
    async fn children_of(
        &self,
        uow: &mut UnitOfWork<'_>,
        parent: &Folder,
        dirs: &[i64],
        files: &[i64],
    ) -> Result<(Vec<Folder>, Vec<File>)> {
        let user_id = self.user().id;
        let folders: Vec<Folder> = FolderRepository::new(uow.conn())
            .get_by_ids(dirs, user_id)
            .await?
            .into_iter()
            .filter(|f| f.parent_id == Some(parent.id))
            .collect();
        if folders.len() != dedup_len(dirs) {
            return Err(NimbusError::NotExist("folder".to_string()));
        }

        let wanted = dedup_len(files);
        let files: Vec<File> = FileRepository::new(uow.conn())
            .get_by_ids(files, user_id)
            .await?
            .into_iter()
            .filter(|f| f.folder_id == parent.id)
            .collect();
        if files.len() != wanted {
            return Err(NimbusError::NotExist("file".to_string()));
        }
        Ok((folders, files))
    }

    /// Fail with `AlreadyExists` if any name is taken in `dst`.
    async fn check_collisions(
        &self,
        uow: &mut UnitOfWork<'_>,
        dst: &Folder,
        folders: &[Folder],
        files: &[File],
    ) -> Result<()> {
        let mut names = HashSet::new();
        let all = folders
            .iter()
            .map(|f| f.name.as_str())
            .chain(files.iter().map(|f| f.name.as_str()));
        let mut repo = FolderRepository::new(uow.conn());
        for name in all {
            if !names.insert(name) || repo.name_taken(dst.id, name).await? {
                return Err(NimbusError::AlreadyExists(name.to_string()));
            }
        }
        Ok(())
    }

    /// Copy one folder with everything below it under `parent_id`.
    async fn copy_tree(&self, uow: &mut UnitOfWork<'_>, root: &Folder, parent_id: i64) -> Result<()> {
        let user_id = self.user().id;
        let mut queue = VecDeque::from([(root.id, root.name.clone(), parent_id)]);

        while let Some((source_id, name, target_parent)) = queue.pop_front() {
            let copy = FolderRepository::new(uow.conn())
                .create(user_id, target_parent, &name)
                .await?;

            let children = FolderRepository::new(uow.conn())
                .list_children(source_id)
                .await?;
            queue.extend(children.into_iter().map(|c| (c.id, c.name, copy.id)));

            let mut files = FileRepository::new(uow.conn());
            for file in files.list_by_folder(source_id).await? {
                if !file.is_placeholder() {
                    files.copy_to(&file, copy.id, user_id).await?;
                }
            }
        }
        Ok(())
    }
}

fn dedup_len(ids: &[i64]) -> usize {
    ids.iter().collect::<HashSet<_>>().len()
}
