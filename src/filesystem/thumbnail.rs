//! Thumbnail generation.
//!
//! Generation runs on a [`ThumbnailPool`]: a semaphore bounds how many
//! images are decoded at once and a task tracker lets callers wait for the
//! queue to drain. The pool lives in the service context; there is no global.

use std::future::Future;
use std::io::Cursor;
use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use image::{GenericImageView, ImageFormat};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use super::{Engine, File, FileRepository};
use crate::context::ServiceContext;
use crate::db::UnitOfWork;
use crate::storage::{read_all, StorageHandler, ThumbContent};
use crate::{NimbusError, Result};

/// Bounded pool of thumbnail workers.
pub struct ThumbnailPool {
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
    capacity: usize,
}

impl ThumbnailPool {
    /// Create a pool running at most `capacity` generations at once.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        debug!(capacity, "thumbnail pool initialized");
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            tracker: TaskTracker::new(),
            capacity,
        }
    }

    /// Maximum concurrent generations.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free worker slots right now.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Run `task` in the background once a slot is free.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        self.tracker.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            task.await;
        });
    }

    /// Run `task` on the caller's task once a slot is free.
    pub async fn run<F: Future>(&self, task: F) -> Result<F::Output> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| NimbusError::Canceled)?;
        Ok(task.await)
    }

    /// Wait until every spawned generation has finished.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

impl std::fmt::Debug for ThumbnailPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThumbnailPool")
            .field("capacity", &self.capacity)
            .field("running", &self.tracker.len())
            .finish()
    }
}

/// Everything one generation needs, detached from the engine.
struct ThumbJob {
    ctx: Arc<ServiceContext>,
    handler: Arc<dyn StorageHandler>,
    size: (u32, u32),
}

impl ThumbJob {
    /// Generate and store the thumbnail of `file`, then record its dimensions.
    ///
    /// Returns `None` for files the generator does not handle. On failure
    /// the derived object is removed and the record keeps its old metadata.
    async fn run(&self, file: &File) -> Result<Option<(u32, u32)>> {
        let config = &self.ctx.config.thumbnail;
        if !config.handles(&file.name) {
            return Ok(None);
        }

        let cancel = CancellationToken::new();
        let source = read_all(self.handler.as_ref(), &cancel, &file.source_name).await?;

        let size = self.size;
        let format = config.encode_format.clone();
        let quality = config.quality;
        let release_early = config.gc_after_generate;
        let (dims, encoded) = tokio::task::spawn_blocking(move || {
            render(source, size, &format, quality, release_early)
        })
        .await
        .map_err(|e| NimbusError::Image(e.to_string()))??;

        let thumb_key = format!("{}{}", file.source_name, config.file_suffix);
        let len = encoded.len() as i64;
        if let Err(e) = self
            .handler
            .put(&cancel, Box::new(Cursor::new(encoded)), &thumb_key, len)
            .await
        {
            self.discard(&thumb_key).await;
            return Err(e);
        }

        let pic_info = format!("{},{}", dims.0, dims.1);
        let updated = match self.ctx.db.pool().acquire().await {
            Ok(mut conn) => {
                FileRepository::new(&mut conn)
                    .update_pic_info(file.id, &pic_info)
                    .await
            }
            Err(e) => Err(e.into()),
        };
        match updated {
            Ok(true) => {
                debug!(file_id = file.id, pic_info = %pic_info, "thumbnail generated");
                Ok(Some(dims))
            }
            Ok(false) => {
                self.discard(&thumb_key).await;
                Err(NimbusError::NotExist(format!("file {}", file.id)))
            }
            Err(e) => {
                self.discard(&thumb_key).await;
                Err(e)
            }
        }
    }

    async fn discard(&self, key: &str) {
        let keys = [key.to_string()];
        if let Err(e) = self.handler.delete(&CancellationToken::new(), &keys).await {
            warn!(key, error = %e, "could not remove thumbnail");
        }
    }
}

/// Decode, shrink into the `(width, height)` box and encode.
///
/// Returns the original dimensions and the encoded thumbnail.
fn render(
    source: Vec<u8>,
    (width, height): (u32, u32),
    format: &str,
    quality: u8,
    release_early: bool,
) -> Result<((u32, u32), Vec<u8>)> {
    let image = image::load_from_memory(&source)?;
    if release_early {
        drop(source);
    }
    let dims = image.dimensions();
    let thumb = image.thumbnail(width, height);
    if release_early {
        drop(image);
    }

    let mut encoded = Vec::new();
    match format {
        "png" => thumb.write_to(&mut Cursor::new(&mut encoded), ImageFormat::Png)?,
        _ => {
            let rgb = thumb.to_rgb8();
            JpegEncoder::new_with_quality(&mut encoded, quality).encode_image(&rgb)?;
        }
    }
    Ok((dims, encoded))
}

impl Engine {
    fn thumb_job(&self, handler: Arc<dyn StorageHandler>, policy: &super::Policy) -> ThumbJob {
        let config = &self.context().config.thumbnail;
        ThumbJob {
            ctx: Arc::clone(self.context()),
            handler,
            size: policy.thumb_size(config.width, config.height),
        }
    }

    /// Generate thumbnails in the background for records of the active policy.
    pub fn schedule_thumbnails(&self, files: Vec<File>) {
        let config = &self.context().config.thumbnail;
        for file in files {
            if file.policy_id != self.policy().id || !config.handles(&file.name) {
                continue;
            }
            let job = self.thumb_job(Arc::clone(self.handler()), self.policy());
            self.context().thumbnails.spawn(async move {
                if let Err(e) = job.run(&file).await {
                    warn!(file_id = file.id, error = %e, "thumbnail generation failed");
                }
            });
        }
    }

    /// Generate the thumbnail of a record of the active policy and wait for it.
    pub async fn generate_thumbnail(&self, file: &File) -> Result<Option<(u32, u32)>> {
        let job = self.thumb_job(Arc::clone(self.handler()), self.policy());
        self.context().thumbnails.run(job.run(file)).await?
    }

    /// Fetch the thumbnail of a file.
    ///
    /// For `local` policies a missing thumbnail is generated again on demand.
    pub async fn get_thumb(&self, cancel: &CancellationToken, file_id: i64) -> Result<ThumbContent> {
        let file = {
            let mut conn = self.context().db.pool().acquire().await?;
            FileRepository::new(&mut conn)
                .get_by_ids(&[file_id], self.user().id)
                .await?
                .pop()
                .ok_or_else(|| NimbusError::NotExist(format!("file {file_id}")))?
        };
        if file.pic_info.is_empty() {
            return Err(NimbusError::NotExist(format!("thumbnail of file {file_id}")));
        }

        let (policy, handler) = if file.policy_id == self.policy().id {
            (self.policy().clone(), Arc::clone(self.handler()))
        } else {
            let mut uow = UnitOfWork::begin(&self.context().db).await?;
            let resolved = self.handler_for(&mut uow, file.policy_id).await?;
            uow.rollback().await?;
            resolved
        };

        match handler.thumb(cancel, &file.source_name).await {
            Ok(content) => Ok(content),
            Err(e) if policy.policy_type == "local" => {
                debug!(file_id, error = %e, "thumbnail missing, regenerating");
                let job = self.thumb_job(Arc::clone(&handler), &policy);
                self.context().thumbnails.run(job.run(&file)).await??;
                handler.thumb(cancel, &file.source_name).await
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let image = image::DynamicImage::ImageRgb8(image::RgbImage::new(width, height));
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn test_render_fits_box() {
        let (dims, encoded) = render(png(800, 400), (400, 300), "jpg", 80, false).unwrap();
        assert_eq!(dims, (800, 400));
        let thumb = image::load_from_memory(&encoded).unwrap();
        assert_eq!(thumb.dimensions(), (400, 200));

        let (_, encoded) = render(png(10, 10), (4, 4), "png", 80, true).unwrap();
        assert_eq!(
            image::guess_format(&encoded).unwrap(),
            ImageFormat::Png
        );
    }

    #[test]
    fn test_render_rejects_garbage() {
        let result = render(b"not an image".to_vec(), (4, 4), "jpg", 80, false);
        assert!(matches!(result, Err(NimbusError::Image(_))));
    }

    #[tokio::test]
    async fn test_pool_bounds_concurrency() {
        let pool = ThumbnailPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            pool.spawn(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }
        pool.wait_idle().await;

        assert_eq!(running.load(Ordering::SeqCst), 0);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_pool_releases_slot_on_run() {
        let pool = ThumbnailPool::new(0);
        assert_eq!(pool.capacity(), 1);
        let value = pool.run(async { 7 }).await.unwrap();
        assert_eq!(value, 7);
        assert_eq!(pool.available(), 1);
    }
}
