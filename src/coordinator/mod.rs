use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{MosaicConfiguration, PreviewConfiguration};
use crate::db::Catalog;
use crate::error::{DiscoveryError, MosaicError, PreviewError, VideoFinderError};
use crate::library::LibraryArena;
use crate::models::{
    DiscoveryFailure, DiscoveryResult, ProgressEvent, SmartCriteria, ThumbnailStatus, Video,
};
use crate::mosaic::MosaicEngine;
use crate::preview::PreviewEngine;
use crate::processor::{ProcessBatch, ProcessProgressFn, VideoProcessor};
use crate::scanner::{ContentType, VideoFinder};
use crate::smart::SmartFolderEvaluator;

/// Catalog saves happen at these batch boundaries.
const BATCH_SIZE: usize = 100;
/// Transient per-url task caches are dropped every this many batches.
const CACHE_CLEAR_INTERVAL: usize = 5;
/// `concurrent_operations` is clamped to this range on construction.
const MIN_OPERATIONS: usize = 1;
const MAX_OPERATIONS: usize = 12;

/// Options for one discovery run.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub recursive: bool,
    pub concurrent_operations: usize,
    pub is_update: bool,
    pub generate_thumbnails: bool,
}

impl DiscoveryOptions {
    pub fn new(
        recursive: bool,
        concurrent_operations: usize,
        is_update: bool,
        generate_thumbnails: bool,
    ) -> Self {
        Self {
            recursive,
            concurrent_operations: concurrent_operations.clamp(MIN_OPERATIONS, MAX_OPERATIONS),
            is_update,
            generate_thumbnails,
        }
    }
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self::new(true, 8, false, true)
    }
}

/// Callbacks for a discovery run. Invocations are serialized through a
/// single reporter task.
pub trait DiscoveryListener: Send + Sync {
    fn on_progress(&self, _event: &ProgressEvent) {}
    fn on_cancelled(&self) {}
    fn on_complete(&self, _result: &DiscoveryResult) {}
}

enum ReporterMessage {
    Progress(ProgressEvent),
    Cancelled,
    Complete(DiscoveryResult),
}

/// Funnels events from concurrent workers into one task so the listener
/// never observes interleaved calls.
struct ProgressReporter {
    tx: mpsc::UnboundedSender<ReporterMessage>,
    handle: JoinHandle<()>,
}

impl ProgressReporter {
    fn new(listener: Option<Arc<dyn DiscoveryListener>>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let Some(ref listener) = listener else {
                    continue;
                };
                match message {
                    ReporterMessage::Progress(event) => listener.on_progress(&event),
                    ReporterMessage::Cancelled => listener.on_cancelled(),
                    ReporterMessage::Complete(result) => listener.on_complete(&result),
                }
            }
        });
        Self { tx, handle }
    }

    fn cancelled(&self) {
        let _ = self.tx.send(ReporterMessage::Cancelled);
    }

    fn complete(&self, result: DiscoveryResult) {
        let _ = self.tx.send(ReporterMessage::Complete(result));
    }

    async fn finish(self) {
        drop(self.tx);
        let _ = self.handle.await;
    }
}

/// Top-level engine driving scan, registration, and artifact work under a
/// bounded-concurrency policy with cooperative cancellation.
pub struct LibraryCoordinator {
    catalog: Catalog,
    processor: VideoProcessor,
    evaluator: SmartFolderEvaluator,
    mosaic_engine: Option<MosaicEngine>,
    preview_engine: Option<PreviewEngine>,
    cancel: std::sync::Mutex<CancellationToken>,
}

impl LibraryCoordinator {
    pub fn new(catalog: Catalog, processor: VideoProcessor) -> Self {
        let evaluator = SmartFolderEvaluator::new(catalog.clone());
        Self {
            catalog,
            processor,
            evaluator,
            mosaic_engine: None,
            preview_engine: None,
            cancel: std::sync::Mutex::new(CancellationToken::new()),
        }
    }

    pub fn with_mosaic_engine(mut self, engine: MosaicEngine) -> Self {
        self.mosaic_engine = Some(engine);
        self
    }

    pub fn with_preview_engine(mut self, engine: PreviewEngine) -> Self {
        self.preview_engine = Some(engine);
        self
    }

    /// Requests cooperative cancellation of the current run. In-flight
    /// tasks observe the flag at their next suspension point.
    pub fn cancel(&self) {
        self.cancel.lock().expect("cancel lock").cancel();
    }

    fn reset_cancellation(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancel.lock().expect("cancel lock") = token.clone();
        token
    }

    /// Scans `root`, registers unknown videos in the catalog (with folder
    /// chains), and reports progress per completed unit.
    pub async fn discover_folder(
        &self,
        root: &Path,
        options: &DiscoveryOptions,
        listener: Option<Arc<dyn DiscoveryListener>>,
    ) -> Result<DiscoveryResult, DiscoveryError> {
        let cancel = self.reset_cancellation();
        let started = Instant::now();
        let reporter = ProgressReporter::new(listener);

        let outcome = self
            .run_discovery(root, options, &reporter, &cancel, started)
            .await;

        match &outcome {
            Ok(result) => {
                if cancel.is_cancelled() {
                    reporter.cancelled();
                }
                reporter.complete(result.clone());
            }
            Err(DiscoveryError::Cancelled) => reporter.cancelled(),
            Err(_) => {}
        }
        reporter.finish().await;
        outcome
    }

    async fn run_discovery(
        &self,
        root: &Path,
        options: &DiscoveryOptions,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<DiscoveryResult, DiscoveryError> {
        let root_url = root.to_string_lossy().to_string();
        let run_id = self
            .catalog
            .create_discovery_run(&root_url)
            .await
            .map_err(|e| DiscoveryError::ProcessingFailed(e.to_string()))?;

        info!(
            "Discovery run #{} over {} (recursive: {})",
            run_id,
            root.display(),
            options.recursive
        );

        self.processor
            .set_generate_thumbnails(options.generate_thumbnails);

        let scan = VideoFinder::scan(root, options.recursive, ContentType::all(), None)
            .await
            .map_err(map_finder_error)?;
        let scanned_urls: Vec<String> = scan
            .urls
            .iter()
            .map(|p| p.to_string_lossy().to_string())
            .collect();
        let total_videos = scanned_urls.len();

        let known = self
            .catalog
            .existing_urls(&scanned_urls)
            .await
            .map_err(|e| DiscoveryError::ProcessingFailed(e.to_string()))?;

        // Update runs re-process known urls; fresh runs skip them.
        let candidates: Vec<String> = if options.is_update {
            scanned_urls.clone()
        } else {
            scanned_urls
                .iter()
                .filter(|u| !known.contains(*u))
                .cloned()
                .collect()
        };
        let skipped_files = total_videos - candidates.len();

        // Group by parent directory; each folder chain is created exactly
        // once, before any of its videos are saved.
        let mut by_folder: BTreeMap<PathBuf, Vec<String>> = BTreeMap::new();
        for url in &candidates {
            let parent = Path::new(url)
                .parent()
                .unwrap_or(root)
                .to_path_buf();
            by_folder.entry(parent).or_default().push(url.clone());
        }
        let total_folders = by_folder.len();

        let mut result = DiscoveryResult::default();
        let mut arena = LibraryArena::new();
        for folder in by_folder.keys() {
            if cancel.is_cancelled() {
                break;
            }
            let (_, created) = arena
                .ensure_folder_chain(root, folder)
                .map_err(|e| DiscoveryError::ProcessingFailed(e.to_string()))?;
            for item in created {
                self.catalog
                    .upsert_folder(&item)
                    .await
                    .map_err(|e| DiscoveryError::ProcessingFailed(e.to_string()))?;
                result.created_folders += 1;
            }
        }

        // Cumulative candidate counts per folder, for processed_folders.
        let mut folder_prefix: Vec<(String, usize)> = Vec::with_capacity(by_folder.len());
        let mut running = 0usize;
        for (folder, urls) in &by_folder {
            running += urls.len();
            folder_prefix.push((folder.to_string_lossy().to_string(), running));
        }
        let ordered: Vec<String> = by_folder.into_values().flatten().collect();

        let mut processed = 0usize;
        let error_count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        for (batch_index, batch) in ordered.chunks(BATCH_SIZE).enumerate() {
            if cancel.is_cancelled() {
                break;
            }

            let batch_folder = batch
                .first()
                .and_then(|u| Path::new(u).parent())
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default();

            let base = processed;
            let progress_cb: ProcessProgressFn = {
                let reporter_tx = reporter.tx.clone();
                let folder_prefix = folder_prefix.clone();
                let total_candidates = ordered.len();
                let batch_folder = batch_folder.clone();
                let error_count = error_count.clone();
                Arc::new(move |done_in_batch: usize, title: &str| {
                    let done = base + done_in_batch;
                    let elapsed = started.elapsed().as_secs_f64().max(1e-6);
                    let rate = done as f64 / elapsed;
                    let remaining = total_candidates.saturating_sub(done);
                    let processed_folders = folder_prefix
                        .iter()
                        .filter(|(_, prefix)| *prefix <= done)
                        .count();
                    let event = ProgressEvent {
                        total_folders,
                        processed_folders,
                        current_folder: batch_folder.clone(),
                        total_videos,
                        processed_videos: done,
                        current_video: title.to_string(),
                        skipped_files,
                        error_files: error_count.load(std::sync::atomic::Ordering::SeqCst),
                        processing_rate: rate,
                        estimated_time_remaining: (rate > 0.0)
                            .then(|| remaining as f64 / rate),
                    };
                    let _ = reporter_tx.send(ReporterMessage::Progress(event));
                })
            };

            let batch_result: ProcessBatch = self
                .processor
                .process_many(
                    batch,
                    2,
                    options.concurrent_operations,
                    Some(root),
                    Some(progress_cb),
                    cancel,
                )
                .await;

            processed += batch.len();

            for video in &batch_result.videos {
                if known.contains(&video.url) {
                    result.updated += 1;
                } else {
                    result.added += 1;
                }
            }
            for (url, error) in batch_result.failures {
                if matches!(error, crate::error::VideoError::Cancelled { .. }) {
                    continue;
                }
                result.errors.push(DiscoveryFailure {
                    url,
                    error: error.to_string(),
                });
            }
            error_count.store(result.errors.len(), std::sync::atomic::Ordering::SeqCst);

            // A failed batch commit aborts the run.
            self.catalog
                .upsert_videos(&batch_result.videos)
                .await
                .map_err(|e| DiscoveryError::ProcessingFailed(e.to_string()))?;

            if (batch_index + 1) % CACHE_CLEAR_INTERVAL == 0 {
                self.processor.clear_cache().await;
            }
        }

        if options.is_update && !cancel.is_cancelled() {
            result.removed = self
                .remove_orphans(&root_url, &scanned_urls)
                .await
                .map_err(|e| DiscoveryError::ProcessingFailed(e.to_string()))?;
        }

        let elapsed = started.elapsed().as_secs_f64();
        result.statistics = crate::models::DiscoveryStatistics {
            total_videos,
            processed_videos: processed,
            skipped_files,
            elapsed_seconds: elapsed,
            processing_rate: if elapsed > 0.0 {
                processed as f64 / elapsed
            } else {
                0.0
            },
        };

        let status = if cancel.is_cancelled() {
            "cancelled"
        } else {
            "completed"
        };
        if let Err(e) = self
            .catalog
            .complete_discovery_run(run_id, &result, status)
            .await
        {
            warn!("Failed to record discovery run #{}: {}", run_id, e);
        }

        info!(
            "Discovery run #{} {}: {} added, {} updated, {} removed, {} errors in {:.1}s",
            run_id,
            status,
            result.added,
            result.updated,
            result.removed,
            result.errors.len(),
            elapsed
        );
        Ok(result)
    }

    /// Catalog rows under the root whose files vanished from disk.
    async fn remove_orphans(
        &self,
        root_url: &str,
        scanned_urls: &[String],
    ) -> anyhow::Result<usize> {
        let on_disk: HashSet<&str> = scanned_urls.iter().map(String::as_str).collect();
        let cataloged = self.catalog.fetch_videos_under(root_url).await?;
        let mut removed = 0;
        for video in cataloged {
            if !on_disk.contains(video.url.as_str()) {
                if self.catalog.delete_video_by_url(&video.url).await? {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Evaluates smart-folder criteria against the catalog, reporting the
    /// diff against the previous evaluation as added/removed.
    pub async fn discover_smart_folder(
        &self,
        criteria: &SmartCriteria,
        listener: Option<Arc<dyn DiscoveryListener>>,
    ) -> Result<DiscoveryResult, DiscoveryError> {
        let cancel = self.reset_cancellation();
        let started = Instant::now();
        if cancel.is_cancelled() {
            return Err(DiscoveryError::Cancelled);
        }

        let reporter = ProgressReporter::new(listener);
        let diff = self
            .evaluator
            .update(criteria)
            .await
            .map_err(|e| DiscoveryError::ProcessingFailed(e.to_string()))?;

        let result = DiscoveryResult {
            added: diff.added.len(),
            updated: 0,
            removed: diff.removed.len(),
            created_folders: 0,
            errors: Vec::new(),
            statistics: crate::models::DiscoveryStatistics {
                total_videos: diff.matched.len(),
                processed_videos: diff.matched.len(),
                skipped_files: 0,
                elapsed_seconds: started.elapsed().as_secs_f64(),
                processing_rate: 0.0,
            },
        };
        reporter.complete(result.clone());
        reporter.finish().await;
        Ok(result)
    }

    /// Videos under `root` whose covers need regeneration.
    pub async fn check_thumbnails(&self, root: &Path) -> Result<Vec<Video>, DiscoveryError> {
        self.processor
            .thumbnails_needing_regeneration(root)
            .await
            .map_err(|e| DiscoveryError::ProcessingFailed(e.to_string()))
    }

    /// Regenerates covers for the given videos under the current
    /// concurrency policy, updating the catalog as each completes.
    pub async fn regenerate_thumbnails(
        &self,
        videos: &[Video],
        options: &DiscoveryOptions,
        listener: Option<Arc<dyn DiscoveryListener>>,
    ) -> Result<DiscoveryResult, DiscoveryError> {
        let cancel = self.reset_cancellation();
        let started = Instant::now();
        let reporter = ProgressReporter::new(listener);
        let slots = Arc::new(tokio::sync::Semaphore::new(options.concurrent_operations));

        let tasks = videos.iter().enumerate().map(|(index, video)| {
            let processor = self.processor.clone();
            let catalog = self.catalog.clone();
            let slots = slots.clone();
            let cancel = cancel.clone();
            let video = video.clone();
            async move {
                let _permit = slots.acquire().await.ok()?;
                if cancel.is_cancelled() {
                    return None;
                }
                let outcome = processor.generate_cover(&video, &cancel).await;
                match outcome {
                    Ok(path) => {
                        let path = path.to_string_lossy().to_string();
                        let _ = catalog
                            .update_thumbnail(video.id, Some(&path), ThumbnailStatus::Completed)
                            .await;
                        Some((index, Ok(())))
                    }
                    Err(e) => {
                        let _ = catalog
                            .update_thumbnail(video.id, None, ThumbnailStatus::Error)
                            .await;
                        Some((index, Err(DiscoveryFailure {
                            url: video.url.clone(),
                            error: e.to_string(),
                        })))
                    }
                }
            }
        });

        let outcomes = futures::future::join_all(tasks).await;

        let mut result = DiscoveryResult::default();
        for outcome in outcomes.into_iter().flatten() {
            match outcome.1 {
                Ok(()) => result.updated += 1,
                Err(failure) => result.errors.push(failure),
            }
        }
        result.statistics.total_videos = videos.len();
        result.statistics.processed_videos = result.updated + result.errors.len();
        result.statistics.elapsed_seconds = started.elapsed().as_secs_f64();

        if cancel.is_cancelled() {
            reporter.cancelled();
        }
        reporter.complete(result.clone());
        reporter.finish().await;
        Ok(result)
    }

    /// Generates mosaics for the given videos, bounded by the run's
    /// concurrency ceiling, recording each artifact path in the catalog.
    pub async fn generate_mosaics(
        &self,
        videos: &[Video],
        config: &MosaicConfiguration,
        library_root: Option<&Path>,
        options: &DiscoveryOptions,
        listener: Option<Arc<dyn DiscoveryListener>>,
    ) -> Result<DiscoveryResult, DiscoveryError> {
        let engine = self.mosaic_engine.as_ref().ok_or_else(|| {
            DiscoveryError::ProcessingFailed("no mosaic engine configured".to_string())
        })?;
        let cancel = self.reset_cancellation();
        let started = Instant::now();
        let reporter = ProgressReporter::new(listener);
        let slots = Arc::new(tokio::sync::Semaphore::new(options.concurrent_operations));
        let completed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let total = videos.len();

        let tasks = videos.iter().map(|video| {
            let catalog = self.catalog.clone();
            let slots = slots.clone();
            let cancel = cancel.clone();
            let reporter_tx = reporter.tx.clone();
            let completed = completed.clone();
            let config = config.clone();
            let root = library_root.map(Path::to_path_buf);
            async move {
                let _permit = slots.acquire().await.ok()?;
                if cancel.is_cancelled() {
                    return None;
                }
                let outcome = engine
                    .generate(video, &config, root.as_deref(), None, &cancel)
                    .await;
                let done = completed.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                let elapsed = started.elapsed().as_secs_f64().max(1e-6);
                let _ = reporter_tx.send(ReporterMessage::Progress(ProgressEvent {
                    total_videos: total,
                    processed_videos: done,
                    current_video: video.title.clone(),
                    processing_rate: done as f64 / elapsed,
                    ..ProgressEvent::default()
                }));
                match outcome {
                    Ok(path) => {
                        let path = path.to_string_lossy().to_string();
                        let _ = catalog.update_mosaic_url(video.id, &path).await;
                        Some(Ok(()))
                    }
                    Err(MosaicError::Cancelled) => None,
                    Err(e) => Some(Err(DiscoveryFailure {
                        url: video.url.clone(),
                        error: e.to_string(),
                    })),
                }
            }
        });

        let outcomes = futures::future::join_all(tasks).await;
        let result = artifact_result(outcomes, total, started);

        if cancel.is_cancelled() {
            reporter.cancelled();
        }
        reporter.complete(result.clone());
        reporter.finish().await;
        Ok(result)
    }

    /// Generates preview clips for the given videos, bounded by the run's
    /// concurrency ceiling, recording each artifact path in the catalog.
    pub async fn generate_previews(
        &self,
        videos: &[Video],
        config: &PreviewConfiguration,
        options: &DiscoveryOptions,
        listener: Option<Arc<dyn DiscoveryListener>>,
    ) -> Result<DiscoveryResult, DiscoveryError> {
        let engine = self.preview_engine.as_ref().ok_or_else(|| {
            DiscoveryError::ProcessingFailed("no preview engine configured".to_string())
        })?;
        let cancel = self.reset_cancellation();
        let started = Instant::now();
        let reporter = ProgressReporter::new(listener);
        let slots = Arc::new(tokio::sync::Semaphore::new(options.concurrent_operations));
        let completed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let total = videos.len();

        let tasks = videos.iter().map(|video| {
            let catalog = self.catalog.clone();
            let slots = slots.clone();
            let cancel = cancel.clone();
            let reporter_tx = reporter.tx.clone();
            let completed = completed.clone();
            let config = config.clone();
            async move {
                let _permit = slots.acquire().await.ok()?;
                if cancel.is_cancelled() {
                    return None;
                }
                let outcome = engine.generate(video, &config, None, &cancel).await;
                let done = completed.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                let elapsed = started.elapsed().as_secs_f64().max(1e-6);
                let _ = reporter_tx.send(ReporterMessage::Progress(ProgressEvent {
                    total_videos: total,
                    processed_videos: done,
                    current_video: video.title.clone(),
                    processing_rate: done as f64 / elapsed,
                    ..ProgressEvent::default()
                }));
                match outcome {
                    Ok(path) => {
                        let path = path.to_string_lossy().to_string();
                        let _ = catalog.update_preview_url(video.id, &path).await;
                        Some(Ok(()))
                    }
                    Err(PreviewError::Cancelled) => None,
                    Err(e) => Some(Err(DiscoveryFailure {
                        url: video.url.clone(),
                        error: e.to_string(),
                    })),
                }
            }
        });

        let outcomes = futures::future::join_all(tasks).await;
        let result = artifact_result(outcomes, total, started);

        if cancel.is_cancelled() {
            reporter.cancelled();
        }
        reporter.complete(result.clone());
        reporter.finish().await;
        Ok(result)
    }
}

fn artifact_result(
    outcomes: Vec<Option<Result<(), DiscoveryFailure>>>,
    total: usize,
    started: Instant,
) -> DiscoveryResult {
    let mut result = DiscoveryResult::default();
    for outcome in outcomes.into_iter().flatten() {
        match outcome {
            Ok(()) => result.updated += 1,
            Err(failure) => result.errors.push(failure),
        }
    }
    result.statistics.total_videos = total;
    result.statistics.processed_videos = result.updated + result.errors.len();
    result.statistics.elapsed_seconds = started.elapsed().as_secs_f64();
    result
}

fn map_finder_error(error: VideoFinderError) -> DiscoveryError {
    match error {
        VideoFinderError::NotADirectory(path) => DiscoveryError::InvalidFolder(path),
        VideoFinderError::AccessDenied(path) => DiscoveryError::AccessDenied(path),
        VideoFinderError::EnumerationFailed(e) | VideoFinderError::QueryFailed(e) => {
            DiscoveryError::ProcessingFailed(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrent_operations_are_clamped() {
        assert_eq!(DiscoveryOptions::new(true, 0, false, false).concurrent_operations, 1);
        assert_eq!(DiscoveryOptions::new(true, 8, false, false).concurrent_operations, 8);
        assert_eq!(DiscoveryOptions::new(true, 64, false, false).concurrent_operations, 12);
    }
}
