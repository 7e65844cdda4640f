//! Streamed uploads and recording of existing objects.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::validate::check_written_size;
use super::{
    Engine, File, FileHeader, FileRepository, FileStream, Folder, FolderRepository, HookEvent,
    HookPayload, HookPreset, NewFile, UploadMode,
};
use crate::db::UnitOfWork;
use crate::storage::ByteReader;
use crate::{NimbusError, Result};

impl Engine {
    /// Upload a stream with the built-in stream hooks.
    pub async fn upload_from_stream(
        &self,
        uow: &mut UnitOfWork<'_>,
        request: &CancellationToken,
        stream: FileStream,
    ) -> Result<File> {
        self.install_preset(HookPreset::Stream);
        self.upload(uow, request, stream).await
    }

    /// Upload a stream through the registered hooks.
    ///
    /// `request` is the caller's token. If it fires while bytes are being
    /// written the write is stopped, `AfterUploadCanceled` runs and the call
    /// fails with `Canceled`.
    pub async fn upload(
        &self,
        uow: &mut UnitOfWork<'_>,
        request: &CancellationToken,
        stream: FileStream,
    ) -> Result<File> {
        let FileStream { mut header, reader } = stream;
        header.virtual_path = super::clean_path(&header.virtual_path);
        self.resolve_origin(uow, &mut header).await?;

        if let Err(e) = self
            .trigger(uow, HookEvent::BeforeUpload, HookPayload::File(&mut header))
            .await
        {
            self.compensate(uow, HookEvent::AfterUploadFailed, HookPayload::File(&mut header))
                .await;
            return Err(e);
        }

        if header.save_path.is_empty() {
            header.save_path = self.save_path_for(&header);
        }

        if header.mode == UploadMode::Normal {
            match self.put_watched(request, reader, &header).await {
                Ok(written) if written != header.size => {
                    // The stream was declared with an unknown size.
                    header.size = written;
                    if let Err(e) = check_written_size(self, uow, &header).await {
                        self.compensate(
                            uow,
                            HookEvent::AfterUploadFailed,
                            HookPayload::File(&mut header),
                        )
                        .await;
                        return Err(e);
                    }
                }
                Ok(_) => {}
                Err(NimbusError::Canceled) => {
                    debug!(key = %header.save_path, "client canceled the upload");
                    self.compensate(
                        uow,
                        HookEvent::AfterUploadCanceled,
                        HookPayload::File(&mut header),
                    )
                    .await;
                    return Err(NimbusError::Canceled);
                }
                Err(e) => {
                    self.compensate(
                        uow,
                        HookEvent::AfterUploadFailed,
                        HookPayload::File(&mut header),
                    )
                    .await;
                    return Err(e);
                }
            }
        }

        if let Err(e) = self
            .trigger(uow, HookEvent::AfterUpload, HookPayload::File(&mut header))
            .await
        {
            self.compensate(
                uow,
                HookEvent::AfterValidateFailed,
                HookPayload::File(&mut header),
            )
            .await;
            return Err(e);
        }

        let record = header.record.ok_or_else(|| {
            NimbusError::Inconsistent(format!("no record created for {}", header.name))
        })?;
        info!(
            user_id = self.user().id,
            name = %record.name,
            size = record.size,
            "file uploaded"
        );
        Ok(record)
    }

    /// Record an object that already exists in storage at `header.save_path`.
    pub async fn add_file(
        &self,
        uow: &mut UnitOfWork<'_>,
        parent: &Folder,
        header: &mut FileHeader,
    ) -> Result<File> {
        self.trigger(
            uow,
            HookEvent::BeforeAddFile,
            HookPayload::AddFile {
                header: &mut *header,
                parent,
            },
        )
        .await?;

        if FolderRepository::new(uow.conn())
            .name_taken(parent.id, &header.name)
            .await?
        {
            return Err(NimbusError::AlreadyExists(header.full_path()));
        }

        let new_file = NewFile::new(
            &header.name,
            self.user().id,
            parent.id,
            self.policy().id,
            &header.save_path,
            header.size,
        )
        .with_updated_at(header.last_modified);
        let mut record = FileRepository::new(uow.conn()).create(&new_file).await?;
        record.position = parent.full_path();

        if self.policy().thumb_needed {
            self.queue_thumbnail(record.clone());
        }
        header.record = Some(record.clone());
        Ok(record)
    }

    /// Find the record an overwriting upload replaces.
    pub(crate) async fn resolve_origin(&self, uow: &mut UnitOfWork<'_>, header: &mut FileHeader) -> Result<()> {
        if !header.overwrite || header.origin.is_some() {
            return Ok(());
        }
        let Some(folder) = FolderRepository::new(uow.conn())
            .resolve_path(self.user().id, &header.virtual_path)
            .await?
        else {
            return Ok(());
        };
        let origin = FileRepository::new(uow.conn())
            .get_child_file(folder.id, &header.name)
            .await?;
        if let Some(origin) = &origin {
            if origin.is_placeholder() {
                return Err(NimbusError::AlreadyExists(format!(
                    "{} (upload in progress)",
                    header.full_path()
                )));
            }
        }
        header.origin = origin;
        Ok(())
    }

    /// Physical key for a new upload.
    ///
    /// Overwrites get a fresh key too; the record is switched to it only once
    /// the bytes are in place, so a failed overwrite leaves the old object alone.
    fn save_path_for(&self, header: &FileHeader) -> String {
        self.policy()
            .generate_save_path(self.user().id, &header.virtual_path, &header.name)
    }

    /// Write the bytes while watching the caller's token.
    ///
    /// The handler runs under its own token, canceled only when the caller's
    /// fires first. A write that completes is never reported as canceled.
    async fn put_watched(
        &self,
        request: &CancellationToken,
        reader: ByteReader,
        header: &FileHeader,
    ) -> Result<i64> {
        let operation = CancellationToken::new();
        let put = self
            .handler()
            .put(&operation, reader, &header.save_path, header.size);
        tokio::pin!(put);

        tokio::select! {
            biased;
            result = &mut put => result,
            _ = request.cancelled() => {
                operation.cancel();
                // Let the handler clean up its partial write.
                let _ = put.await;
                Err(NimbusError::Canceled)
            }
        }
    }
}
