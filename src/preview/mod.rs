pub mod plan;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{PreviewConfiguration, StoragePaths};
use crate::error::PreviewError;
use crate::models::Video;

pub use plan::{segment_plan, SegmentPlan};

pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

/// Segment extraction maps to the first 70% of reported progress; the final
/// concat export covers the rest.
const EXPORT_PROGRESS_START: f64 = 0.7;

/// Assembles short sped-up preview videos by splicing retimed segments of
/// the source into one MP4.
pub struct PreviewEngine {
    storage: StoragePaths,
}

impl PreviewEngine {
    pub fn new(storage: StoragePaths) -> Self {
        Self { storage }
    }

    /// Where the preview for `video` lands: beside the original (or in the
    /// configured folder) as `<stem>-preview.mp4`, or in the cache keyed by
    /// video id.
    pub fn output_path(&self, video: &Video, config: &PreviewConfiguration) -> PathBuf {
        if config.save_in_custom_location {
            let dir = config
                .custom_save_location
                .clone()
                .unwrap_or_else(|| {
                    video
                        .path()
                        .parent()
                        .unwrap_or_else(|| Path::new("."))
                        .to_path_buf()
                });
            dir.join(format!("{}-preview.mp4", video.file_stem()))
        } else {
            self.storage
                .previews_dir()
                .join(format!("{}.mp4", video.id))
        }
    }

    /// Builds the preview and returns its path.
    pub async fn generate(
        &self,
        video: &Video,
        config: &PreviewConfiguration,
        progress: Option<ProgressFn>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, PreviewError> {
        let report = |value: f64| {
            if let Some(ref f) = progress {
                f(value);
            }
        };

        let source = video.path().to_path_buf();
        let duration = if video.duration > 0.0 {
            video.duration
        } else {
            crate::extract::probe(&source)
                .await
                .map_err(|e| PreviewError::UnableToCreateCompositionTracks {
                    url: video.url.clone(),
                    cause: e.to_string(),
                })?
                .duration
        };

        let plan = segment_plan(
            duration,
            config.density,
            config.duration,
            config.max_speed_multiplier,
        );
        debug!(
            "Preview plan for {}: {} segments of {:.2}s at {:.2}x",
            video.title, plan.extract_count, plan.per_segment_duration, plan.speed_multiplier
        );

        let work_dir = tempfile::tempdir()
            .map_err(|e| PreviewError::UnableToCreateExportSession(e.to_string()))?;

        let mut parts = Vec::with_capacity(plan.extract_count);
        for (index, &start) in plan.starts.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(PreviewError::Cancelled);
            }
            let part = work_dir.path().join(format!("segment-{:03}.mp4", index));
            extract_segment(
                &source,
                start,
                plan.per_segment_duration,
                plan.speed_multiplier,
                &part,
            )
            .await
            .map_err(|cause| PreviewError::SegmentInsertionFailed {
                index,
                start,
                cause,
            })?;
            parts.push(part);
            report(EXPORT_PROGRESS_START * (index + 1) as f64 / plan.extract_count as f64);
        }

        if cancel.is_cancelled() {
            return Err(PreviewError::Cancelled);
        }

        let destination = self.output_path(video, config);
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PreviewError::UnableToCreateExportSession(e.to_string()))?;
        }

        export_concat(&parts, work_dir.path(), &destination).await?;
        report(1.0);

        info!(
            "Preview for {} written to {}",
            video.title,
            destination.display()
        );
        Ok(destination)
    }
}

/// Extracts one source range, retimed by the speed multiplier. Video is
/// re-encoded so the concat step can stream-copy uniform parts.
async fn extract_segment(
    source: &Path,
    start: f64,
    duration: f64,
    speed: f64,
    output: &Path,
) -> Result<(), String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-ss".to_string(),
        format!("{:.3}", start),
        "-t".to_string(),
        format!("{:.3}", duration),
        "-i".to_string(),
        source.to_string_lossy().to_string(),
        "-map".to_string(),
        "0:v:0".to_string(),
        "-map".to_string(),
        "0:a:0?".to_string(),
    ];

    if (speed - 1.0).abs() > 1e-6 {
        args.push("-vf".to_string());
        args.push(format!("setpts=PTS/{:.6}", speed));
        args.push("-af".to_string());
        args.push(format!("atempo={:.6}", speed));
    }

    args.extend(
        [
            "-c:v", "libx264", "-preset", "veryfast", "-crf", "18", "-c:a", "aac", "-b:a",
            "192k", "-movflags", "+faststart", "-y",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    args.push(output.to_string_lossy().to_string());

    let result = tokio::process::Command::new("ffmpeg")
        .args(&args)
        .output()
        .await
        .map_err(|e| format!("failed to run ffmpeg: {}", e))?;

    if !result.status.success() {
        return Err(String::from_utf8_lossy(&result.stderr).trim().to_string());
    }
    Ok(())
}

/// Splices the uniform parts into the destination with the concat demuxer.
async fn export_concat(
    parts: &[PathBuf],
    work_dir: &Path,
    destination: &Path,
) -> Result<(), PreviewError> {
    let list_path = work_dir.join("segments.txt");
    let listing: String = parts
        .iter()
        .map(|p| format!("file '{}'\n", p.display()))
        .collect();
    tokio::fs::write(&list_path, listing)
        .await
        .map_err(|e| PreviewError::UnableToCreateExportSession(e.to_string()))?;

    let temp = crate::extract::temp_sibling(destination, "preview");
    let result = tokio::process::Command::new("ffmpeg")
        .args([
            "-hide_banner",
            "-loglevel",
            "error",
            "-f",
            "concat",
            "-safe",
            "0",
            "-i",
        ])
        .arg(&list_path)
        .args(["-c", "copy", "-movflags", "+faststart", "-y"])
        .arg(&temp)
        .output()
        .await
        .map_err(|e| PreviewError::ExportFailed(e.to_string()))?;

    if !result.status.success() {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(PreviewError::ExportFailed(
            String::from_utf8_lossy(&result.stderr).trim().to_string(),
        ));
    }

    tokio::fs::rename(&temp, destination).await.map_err(|e| {
        PreviewError::ExportFailed(format!("failed to move preview into place: {}", e))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Density;

    fn engine() -> PreviewEngine {
        PreviewEngine::new(StoragePaths {
            app_support: PathBuf::from("/tmp/vidmosaic-test/support"),
            app_cache: PathBuf::from("/tmp/vidmosaic-test/cache"),
        })
    }

    #[test]
    fn cache_path_is_keyed_by_video_id() {
        let video = Video::new("/library/clip.mp4".to_string());
        let path = engine().output_path(&video, &PreviewConfiguration::default());
        assert_eq!(
            path,
            PathBuf::from(format!(
                "/tmp/vidmosaic-test/cache/Previews/{}.mp4",
                video.id
            ))
        );
    }

    #[test]
    fn custom_location_uses_preview_suffix() {
        let video = Video::new("/library/clip.mp4".to_string());
        let config = PreviewConfiguration {
            save_in_custom_location: true,
            custom_save_location: Some(PathBuf::from("/exports")),
            ..Default::default()
        };
        let path = engine().output_path(&video, &config);
        assert_eq!(path, PathBuf::from("/exports/clip-preview.mp4"));
    }

    #[test]
    fn beside_original_when_no_custom_directory_given() {
        let video = Video::new("/library/clip.mp4".to_string());
        let config = PreviewConfiguration {
            save_in_custom_location: true,
            ..Default::default()
        };
        let path = engine().output_path(&video, &config);
        assert_eq!(path, PathBuf::from("/library/clip-preview.mp4"));
    }

    #[tokio::test]
    async fn cancelled_generation_stops_before_extraction() {
        let video = {
            let mut v = Video::new("/nonexistent/clip.mp4".to_string());
            v.duration = 300.0;
            v
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let config = PreviewConfiguration {
            density: Density::Xs,
            ..Default::default()
        };
        let err = engine()
            .generate(&video, &config, None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PreviewError::Cancelled));
    }
}
