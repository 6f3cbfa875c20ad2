use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{ProcessingConfig, StoragePaths};
use crate::db::Catalog;
use crate::error::VideoError;
use crate::extract::{FrameExtractor, TolerancePolicy};
use crate::models::{ThumbnailStatus, Video};

/// Cover thumbnails are scaled so their longer edge is this many pixels.
const COVER_EDGE: u32 = 480;
/// Cover frame is taken at this fraction of the duration.
const COVER_POSITION: f64 = 0.10;
/// Inflight bound for batch processing.
const MIN_INFLIGHT: usize = 2;
const MAX_INFLIGHT: usize = 16;

pub type ProcessProgressFn = Arc<dyn Fn(usize, &str) + Send + Sync>;

type SharedProcess = Shared<BoxFuture<'static, Result<Video, VideoError>>>;

/// Outcome of a batch run. Videos are sorted by title; failures carry the
/// url they belong to.
#[derive(Debug, Default)]
pub struct ProcessBatch {
    pub videos: Vec<Video>,
    pub failures: Vec<(String, VideoError)>,
}

/// Loads per-video metadata and registers videos in the catalog, optionally
/// kicking a background cover-thumbnail task. Repeat requests for a url in
/// the same run share one task and one resulting `Video`.
#[derive(Clone)]
pub struct VideoProcessor {
    inner: Arc<ProcessorInner>,
}

struct ProcessorInner {
    catalog: Catalog,
    config: ProcessingConfig,
    storage: StoragePaths,
    extractor: Arc<FrameExtractor>,
    generate_thumbnails: AtomicBool,
    active: Mutex<HashMap<String, SharedProcess>>,
}

impl VideoProcessor {
    pub fn new(
        catalog: Catalog,
        config: ProcessingConfig,
        storage: StoragePaths,
        extractor: Arc<FrameExtractor>,
        generate_thumbnails: bool,
    ) -> Self {
        Self {
            inner: Arc::new(ProcessorInner {
                catalog,
                config,
                storage,
                extractor,
                generate_thumbnails: AtomicBool::new(generate_thumbnails),
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Runs toggle this to honor their own thumbnail option.
    pub fn set_generate_thumbnails(&self, enabled: bool) {
        self.inner.generate_thumbnails.store(enabled, Ordering::SeqCst);
    }

    /// Drops per-url task handles accumulated during a run.
    pub async fn clear_cache(&self) {
        self.inner.active.lock().await.clear();
    }

    /// Loads metadata for one video. Deduplicated per url: calling this
    /// twice in a run yields the same `Video`.
    pub async fn process(
        &self,
        url: String,
        library_root: Option<PathBuf>,
        cancel: CancellationToken,
    ) -> Result<Video, VideoError> {
        let shared = {
            let mut active = self.inner.active.lock().await;
            if let Some(existing) = active.get(&url) {
                debug!("Joining in-flight processing for {}", url);
                existing.clone()
            } else {
                let inner = self.inner.clone();
                let key = url.clone();
                let task = async move { inner.process_one(url, library_root, cancel).await }
                    .boxed()
                    .shared();
                active.insert(key, task.clone());
                task
            }
        };
        shared.await
    }

    /// Processes a batch under the global concurrency policy, reporting
    /// `(completed_count, current_title)` as units finish. The returned
    /// videos are sorted by title ascending.
    pub async fn process_many(
        &self,
        urls: &[String],
        min_concurrent: usize,
        max_concurrent: usize,
        library_root: Option<&Path>,
        progress: Option<ProcessProgressFn>,
        cancel: &CancellationToken,
    ) -> ProcessBatch {
        let floor = min_concurrent.clamp(MIN_INFLIGHT, MAX_INFLIGHT);
        let inflight = max_concurrent.clamp(floor, MAX_INFLIGHT);
        let slots = Arc::new(Semaphore::new(inflight));
        let completed = Arc::new(AtomicUsize::new(0));

        let tasks = urls.iter().map(|url| {
            let this = self.clone();
            let url = url.clone();
            let root = library_root.map(Path::to_path_buf);
            let slots = slots.clone();
            let cancel = cancel.clone();
            let progress = progress.clone();
            let completed = completed.clone();
            async move {
                let _permit = match slots.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return (url.clone(), Err(VideoError::Cancelled { url }));
                    }
                };
                if cancel.is_cancelled() {
                    return (url.clone(), Err(VideoError::Cancelled { url }));
                }
                let result = this.process(url.clone(), root, cancel).await;
                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(ref progress) = progress {
                    let title = match &result {
                        Ok(video) => video.title.clone(),
                        Err(e) => e.url().to_string(),
                    };
                    progress(done, &title);
                }
                (url, result)
            }
        });

        let results = futures::future::join_all(tasks).await;

        let mut batch = ProcessBatch::default();
        for (url, result) in results {
            match result {
                Ok(video) => batch.videos.push(video),
                Err(e) => batch.failures.push((url, e)),
            }
        }
        batch.videos.sort_by(|a, b| a.title.cmp(&b.title));
        batch
    }

    /// Single cover frame at 10% of the duration, longer edge bounded.
    pub async fn generate_cover(
        &self,
        video: &Video,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, VideoError> {
        self.inner.generate_cover(video, cancel).await
    }

    /// Videos under `root` whose cover is absent, failed, or whose file no
    /// longer exists on disk.
    pub async fn thumbnails_needing_regeneration(
        &self,
        root: &Path,
    ) -> anyhow::Result<Vec<Video>> {
        let videos = self
            .inner
            .catalog
            .fetch_videos_under(&root.to_string_lossy())
            .await?;
        Ok(videos
            .into_iter()
            .filter(|v| match v.thumbnail_status {
                ThumbnailStatus::Completed => v
                    .thumbnail_url
                    .as_ref()
                    .map(|t| !Path::new(t).exists())
                    .unwrap_or(true),
                ThumbnailStatus::InProgress | ThumbnailStatus::Pending => false,
                ThumbnailStatus::Absent | ThumbnailStatus::Error => true,
            })
            .collect())
    }
}

impl ProcessorInner {
    async fn process_one(
        self: Arc<Self>,
        url: String,
        library_root: Option<PathBuf>,
        cancel: CancellationToken,
    ) -> Result<Video, VideoError> {
        if cancel.is_cancelled() {
            return Err(VideoError::Cancelled { url });
        }

        let path = PathBuf::from(&url);

        // Reuse the existing registration so ids stay stable across rescans.
        let existing = self
            .catalog
            .fetch_video(&url)
            .await
            .map_err(|e| VideoError::ProcessingFailed {
                url: url.clone(),
                cause: e.to_string(),
            })?;

        let mut video = existing.unwrap_or_else(|| Video::new(url.clone()));

        let (fs_meta, probed) =
            tokio::join!(tokio::fs::metadata(&path), crate::extract::probe(&path));

        let fs_meta = fs_meta.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => VideoError::FileNotFound { url: url.clone() },
            std::io::ErrorKind::PermissionDenied => VideoError::AccessDenied { url: url.clone() },
            _ => VideoError::ProcessingFailed {
                url: url.clone(),
                cause: e.to_string(),
            },
        })?;

        video.file_size = Some(fs_meta.len() as i64);
        if let Ok(modified) = fs_meta.modified() {
            video.date_modified = DateTime::<Utc>::from(modified);
        }

        // A failed probe leaves media fields unset; the video is still
        // registered.
        match probed {
            Ok(probe) => {
                video.duration = probe.duration;
                video.width = probe.width;
                video.height = probe.height;
                video.frame_rate = probe.frame_rate;
                video.codec_tag = probe.codec_tag;
                video.bitrate = probe.bit_rate;
            }
            Err(e) => {
                warn!("Metadata load failed for {}: {}", url, e);
            }
        }

        if let Some(root) = library_root {
            if let Ok(relative) = path.strip_prefix(&root) {
                video.relative_path = relative.to_string_lossy().to_string();
            }
        }

        if cancel.is_cancelled() {
            return Err(VideoError::Cancelled { url });
        }

        if self.generate_thumbnails.load(Ordering::SeqCst) && video.duration > 0.0 {
            video.thumbnail_status = ThumbnailStatus::Pending;
            let inner = self.clone();
            let spawned = video.clone();
            tokio::spawn(async move {
                inner.run_thumbnail_task(spawned, cancel).await;
            });
        }

        Ok(video)
    }

    /// Background cover generation: `pending -> in_progress ->
    /// completed | error`, persisted to the catalog at each edge.
    async fn run_thumbnail_task(&self, video: Video, cancel: CancellationToken) {
        let _ = self
            .catalog
            .update_thumbnail(video.id, None, ThumbnailStatus::InProgress)
            .await;

        match self.generate_cover(&video, &cancel).await {
            Ok(path) => {
                let path_str = path.to_string_lossy().to_string();
                if let Err(e) = self
                    .catalog
                    .update_thumbnail(video.id, Some(&path_str), ThumbnailStatus::Completed)
                    .await
                {
                    warn!("Failed to record thumbnail for {}: {}", video.url, e);
                }
            }
            Err(e) => {
                warn!("Thumbnail generation failed for {}: {}", video.url, e);
                let _ = self
                    .catalog
                    .update_thumbnail(video.id, None, ThumbnailStatus::Error)
                    .await;
            }
        }
    }

    async fn generate_cover(
        &self,
        video: &Video,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, VideoError> {
        if cancel.is_cancelled() {
            return Err(VideoError::Cancelled {
                url: video.url.clone(),
            });
        }

        let policy = if self.config.use_accurate_timestamps {
            TolerancePolicy::Accurate
        } else {
            TolerancePolicy::Fast
        };
        let timestamp = video.duration * COVER_POSITION;
        let frame = self
            .extractor
            .extract_at(video.path(), timestamp, policy, Some(COVER_EDGE))
            .await?;

        let (bytes, format) = crate::mosaic::compose::encode(
            &frame.image.to_rgba8(),
            self.config.format,
            self.config.compression_quality,
        )
        .map_err(|e| VideoError::ThumbnailGenerationFailed {
            url: video.url.clone(),
            cause: e.to_string(),
        })?;

        let dir = self.storage.thumbnails_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| VideoError::ThumbnailGenerationFailed {
                url: video.url.clone(),
                cause: e.to_string(),
            })?;
        let destination = dir.join(format!("{}_thumb.{}", video.id, format.extension()));
        tokio::fs::write(&destination, bytes).await.map_err(|e| {
            VideoError::ThumbnailGenerationFailed {
                url: video.url.clone(),
                cause: e.to_string(),
            }
        })?;

        Ok(destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutputFormat;

    async fn processor(generate_thumbnails: bool) -> VideoProcessor {
        let catalog = Catalog::in_memory().await.unwrap();
        let extractor = Arc::new(FrameExtractor::create(false).await);
        VideoProcessor::new(
            catalog,
            ProcessingConfig {
                format: OutputFormat::Jpeg,
                ..ProcessingConfig::default()
            },
            StoragePaths::default(),
            extractor,
            generate_thumbnails,
        )
    }

    fn write_stub(dir: &Path, name: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, b"stub-video-bytes").unwrap();
        path.to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn missing_files_are_rejected() {
        let processor = processor(false).await;
        let err = processor
            .process(
                "/nonexistent/clip.mp4".to_string(),
                None,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VideoError::FileNotFound { .. }));
    }

    #[tokio::test]
    async fn repeat_processing_returns_the_same_video() {
        let dir = tempfile::tempdir().unwrap();
        let url = write_stub(dir.path(), "clip.mp4");
        let processor = processor(false).await;

        let first = processor
            .process(url.clone(), None, CancellationToken::new())
            .await
            .unwrap();
        let second = processor
            .process(url, None, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn unprobeable_files_are_still_registered() {
        let dir = tempfile::tempdir().unwrap();
        let url = write_stub(dir.path(), "broken.mp4");
        let processor = processor(false).await;

        let video = processor
            .process(
                url.clone(),
                Some(dir.path().to_path_buf()),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(video.url, url);
        assert_eq!(video.title, "broken");
        assert_eq!(video.file_size, Some(16));
        assert_eq!(video.relative_path, "broken.mp4");
        // Probe fields stay unset for a stub file.
        assert!(video.width.is_none());
    }

    #[tokio::test]
    async fn batch_results_are_sorted_by_title() {
        let dir = tempfile::tempdir().unwrap();
        let urls = vec![
            write_stub(dir.path(), "zebra.mp4"),
            write_stub(dir.path(), "alpha.mp4"),
            write_stub(dir.path(), "mid.mp4"),
        ];
        let processor = processor(false).await;
        let cancel = CancellationToken::new();
        let batch = processor
            .process_many(&urls, 2, 8, Some(dir.path()), None, &cancel)
            .await;

        assert!(batch.failures.is_empty());
        let titles: Vec<&str> = batch.videos.iter().map(|v| v.title.as_str()).collect();
        assert_eq!(titles, vec!["alpha", "mid", "zebra"]);
    }

    #[tokio::test]
    async fn batch_captures_failures_without_aborting() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_stub(dir.path(), "good.mp4");
        let missing = dir
            .path()
            .join("missing.mp4")
            .to_string_lossy()
            .to_string();
        let processor = processor(false).await;
        let cancel = CancellationToken::new();
        let batch = processor
            .process_many(&[good, missing.clone()], 2, 4, None, None, &cancel)
            .await;

        assert_eq!(batch.videos.len(), 1);
        assert_eq!(batch.failures.len(), 1);
        assert_eq!(batch.failures[0].0, missing);
    }

    #[tokio::test]
    async fn cancelled_batch_reports_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let url = write_stub(dir.path(), "clip.mp4");
        let processor = processor(false).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let batch = processor
            .process_many(&[url], 2, 4, None, None, &cancel)
            .await;
        assert!(batch.videos.is_empty());
        assert!(matches!(
            batch.failures[0].1,
            VideoError::Cancelled { .. }
        ));
    }
}
