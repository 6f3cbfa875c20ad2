pub mod compose;
pub mod layout;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{MosaicConfiguration, OutputFormat};
use crate::error::MosaicError;
use crate::extract::{mosaic_timestamps, FrameExtractor, TolerancePolicy};
use crate::models::Video;

pub use compose::{format_timestamp, pixel_digest, MetadataOverlay, Tile};
pub use layout::{layout, thumbnail_count};

/// Staged progress breakpoints for one mosaic generation.
const PROGRESS_QUEUED: f64 = 0.1;
const PROGRESS_FRAMES: f64 = 0.5;
const PROGRESS_COMPOSE: f64 = 0.8;
const PROGRESS_WRITE: f64 = 1.0;

pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

/// Per-video generation state. Terminal states are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl GenerationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            GenerationState::Completed | GenerationState::Failed | GenerationState::Cancelled
        )
    }

    /// Applies a transition, refusing to leave a terminal state. Returns
    /// whether the transition took effect.
    pub fn advance(&mut self, next: GenerationState) -> bool {
        if self.is_terminal() {
            return false;
        }
        *self = next;
        true
    }
}

type SharedGeneration = Shared<BoxFuture<'static, Result<PathBuf, MosaicError>>>;

/// Orchestrates mosaic generation per video: layout, extraction,
/// composition, encode and atomic write. Concurrent requests for the same
/// video id share one task.
pub struct MosaicEngine {
    extractor: Arc<FrameExtractor>,
    active: Mutex<HashMap<Uuid, SharedGeneration>>,
    states: Arc<std::sync::Mutex<HashMap<Uuid, GenerationState>>>,
}

impl MosaicEngine {
    /// Builds an engine over the preferred extractor variant; acceleration
    /// falls back to software when unavailable.
    pub async fn create(use_acceleration: bool) -> Self {
        let extractor = Arc::new(FrameExtractor::create(use_acceleration).await);
        Self::with_extractor(extractor)
    }

    pub fn with_extractor(extractor: Arc<FrameExtractor>) -> Self {
        Self {
            extractor,
            active: Mutex::new(HashMap::new()),
            states: Arc::new(std::sync::Mutex::new(HashMap::new())),
        }
    }

    pub fn state(&self, video_id: Uuid) -> Option<GenerationState> {
        self.states.lock().expect("state lock").get(&video_id).copied()
    }

    /// Drops finished task handles; the next request for the same video
    /// starts fresh.
    pub async fn clear_finished(&self) {
        let states = self.states.lock().expect("state lock").clone();
        let mut active = self.active.lock().await;
        active.retain(|id, _| !states.get(id).copied().is_some_and(|s| s.is_terminal()));
    }

    /// Generates (or joins the in-flight generation of) the mosaic for
    /// `video`, returning the artifact path.
    pub async fn generate(
        &self,
        video: &Video,
        config: &MosaicConfiguration,
        library_root: Option<&Path>,
        progress: Option<ProgressFn>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, MosaicError> {
        let shared = {
            let mut active = self.active.lock().await;
            if let Some(existing) = active.get(&video.id) {
                debug!("Joining in-flight mosaic generation for {}", video.id);
                existing.clone()
            } else {
                let task = generate_inner(
                    self.extractor.clone(),
                    self.states.clone(),
                    video.clone(),
                    config.clone(),
                    library_root.map(Path::to_path_buf),
                    progress,
                    cancel.clone(),
                )
                .boxed()
                .shared();
                active.insert(video.id, task.clone());
                self.states
                    .lock()
                    .expect("state lock")
                    .insert(video.id, GenerationState::Queued);
                task
            }
        };

        shared.await
    }
}

async fn generate_inner(
    extractor: Arc<FrameExtractor>,
    states: Arc<std::sync::Mutex<HashMap<Uuid, GenerationState>>>,
    video: Video,
    config: MosaicConfiguration,
    library_root: Option<PathBuf>,
    progress: Option<ProgressFn>,
    cancel: CancellationToken,
) -> Result<PathBuf, MosaicError> {
    let set_state = |next: GenerationState| {
        if let Some(state) = states.lock().expect("state lock").get_mut(&video.id) {
            state.advance(next);
        }
    };
    let report = |value: f64| {
        if let Some(ref f) = progress {
            f(value);
        }
    };

    report(PROGRESS_QUEUED);
    set_state(GenerationState::InProgress);

    let result = generate_stages(
        &extractor,
        &video,
        &config,
        library_root.as_deref(),
        &report,
        &cancel,
    )
    .await;

    match &result {
        Ok(path) => {
            set_state(GenerationState::Completed);
            info!("Mosaic for {} written to {}", video.title, path.display());
        }
        Err(MosaicError::Cancelled) => set_state(GenerationState::Cancelled),
        Err(e) => {
            set_state(GenerationState::Failed);
            warn!("Mosaic generation for {} failed: {}", video.title, e);
        }
    }

    result
}

async fn generate_stages(
    extractor: &FrameExtractor,
    video: &Video,
    config: &MosaicConfiguration,
    library_root: Option<&Path>,
    report: &(dyn Fn(f64) + Send + Sync),
    cancel: &CancellationToken,
) -> Result<PathBuf, MosaicError> {
    if cancel.is_cancelled() {
        return Err(MosaicError::Cancelled);
    }

    let source = video.path().to_path_buf();
    let duration = if video.duration > 0.0 {
        video.duration
    } else {
        crate::extract::probe(&source)
            .await
            .map_err(|e| MosaicError::GenerationFailed(e.to_string()))?
            .duration
    };

    let count = layout::thumbnail_count(duration, config.density, config.layout.auto_layout);
    let grid = layout::layout(
        config.layout.aspect_ratio,
        count,
        config.width,
        config.layout.spacing,
        config.layout.custom_layout,
    )?;

    let destination = mosaic_output_path(&source, library_root, config, effective_format(config));
    if destination.exists() && !config.output.overwrite {
        return Err(MosaicError::FileExists(destination));
    }

    let timestamps = mosaic_timestamps(duration, count as usize);
    let policy = if config.use_accurate_timestamps {
        TolerancePolicy::Accurate
    } else {
        TolerancePolicy::Fast
    };
    let max_tile_edge = grid
        .thumbnail_sizes
        .iter()
        .map(|&(w, h)| w.max(h))
        .max()
        .unwrap_or(grid.thumbnail_size.0);

    let extracted = extractor
        .extract_many(&source, &timestamps, policy, Some(max_tile_edge), cancel)
        .await;

    if cancel.is_cancelled() {
        return Err(MosaicError::Cancelled);
    }

    let failures = extracted.iter().filter(|(_, r)| r.is_err()).count();
    if failures == extracted.len() {
        return Err(MosaicError::GenerationFailed(format!(
            "all {} frame extractions failed for {}",
            extracted.len(),
            video.url
        )));
    }
    if failures > 0 {
        warn!(
            "{} of {} frames failed for {}, substituting blanks",
            failures,
            extracted.len(),
            video.url
        );
    }
    report(PROGRESS_FRAMES);

    let tiles: Vec<Tile> = extracted
        .into_iter()
        .map(|(requested, result)| Tile {
            frame: result.ok().map(|f| f.image),
            label: format_timestamp(requested),
        })
        .collect();

    let overlay = config.include_metadata.then(|| {
        let mut fields = Vec::new();
        if let Some(ref codec) = video.codec_tag {
            fields.push(codec.clone());
        }
        if let Some(bitrate) = video.human_bitrate() {
            fields.push(bitrate);
        }
        for (key, value) in &video.custom_metadata {
            fields.push(format!("{}: {}", key, value));
        }
        MetadataOverlay { fields }
    });

    let visual = config.layout.visual.clone();
    let format = config.format;
    let quality = config.compression_quality;
    let encoded = tokio::task::spawn_blocking(move || {
        let canvas = compose::compose(&tiles, &grid, &visual, overlay.as_ref())?;
        compose::encode(&canvas, format, quality)
    })
    .await
    .map_err(|e| MosaicError::ImageGenerationFailed(e.to_string()))??;
    let (bytes, _actual_format) = encoded;
    report(PROGRESS_COMPOSE);

    if cancel.is_cancelled() {
        return Err(MosaicError::Cancelled);
    }

    write_atomically(&destination, &bytes, config.output.overwrite, cancel).await?;
    report(PROGRESS_WRITE);

    Ok(destination)
}

fn effective_format(config: &MosaicConfiguration) -> OutputFormat {
    match config.format {
        OutputFormat::Heif => OutputFormat::Jpeg,
        other => other,
    }
}

/// Temp-file-then-rename write in the destination directory. The temp file
/// is synced before the rename and removed on every failure path.
async fn write_atomically(
    destination: &Path,
    bytes: &[u8],
    overwrite: bool,
    cancel: &CancellationToken,
) -> Result<(), MosaicError> {
    if destination.exists() && !overwrite {
        return Err(MosaicError::FileExists(destination.to_path_buf()));
    }
    let parent = destination
        .parent()
        .ok_or_else(|| MosaicError::SaveFailed("destination has no parent".to_string()))?;
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| MosaicError::SaveFailed(e.to_string()))?;

    let temp = crate::extract::temp_sibling(destination, &Uuid::new_v4().simple().to_string());
    let result = write_and_rename(&temp, destination, bytes, cancel).await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(&temp).await;
    }
    result
}

async fn write_and_rename(
    temp: &Path,
    destination: &Path,
    bytes: &[u8],
    cancel: &CancellationToken,
) -> Result<(), MosaicError> {
    use tokio::io::AsyncWriteExt;

    let mut file = tokio::fs::File::create(temp)
        .await
        .map_err(|e| MosaicError::SaveFailed(e.to_string()))?;
    file.write_all(bytes)
        .await
        .map_err(|e| MosaicError::SaveFailed(e.to_string()))?;
    file.sync_all()
        .await
        .map_err(|e| MosaicError::SaveFailed(e.to_string()))?;
    drop(file);

    if cancel.is_cancelled() {
        return Err(MosaicError::Cancelled);
    }

    tokio::fs::rename(temp, destination)
        .await
        .map_err(|e| MosaicError::SaveFailed(e.to_string()))
}

/// Output path for a mosaic, honoring the naming scheme:
/// `<dir>/_Th<width>_<density>_<ar>/<name>_<width>_<density>_<ar>.<ext>`.
/// With `save_at_root` the artifact directory sits under the library root
/// instead of the video's parent; with `add_full_path` the file name is the
/// flattened full path, suffix-truncated to fit.
pub fn mosaic_output_path(
    video_path: &Path,
    library_root: Option<&Path>,
    config: &MosaicConfiguration,
    format: OutputFormat,
) -> PathBuf {
    let suffix = format!(
        "_{}_{}_{}",
        config.width,
        config.density.as_str(),
        config.layout.aspect_ratio.as_token()
    );

    let parent = video_path.parent().unwrap_or_else(|| Path::new("."));
    let base = match (config.output.save_at_root, library_root) {
        (true, Some(root)) => root,
        _ => parent,
    };
    let dir = if config.output.separate_folders {
        base.join(format!("_Th{}", &suffix[1..]))
    } else {
        base.to_path_buf()
    };

    let name = if config.output.add_full_path {
        let flattened: String = video_path
            .to_string_lossy()
            .chars()
            .map(|c| if c == '/' || c == '\\' || c == ' ' { '_' } else { c })
            .collect();
        let budget = 200usize.saturating_sub(suffix.len() + format.extension().len() + 1);
        let chars: Vec<char> = flattened.chars().collect();
        let kept: String = if chars.len() > budget {
            chars[chars.len() - budget..].iter().collect()
        } else {
            flattened
        };
        kept
    } else {
        video_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("video")
            .to_string()
    };

    dir.join(format!("{}{}.{}", name, suffix, format.extension()))
}
