pub mod probe;
pub mod timestamps;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use image::DynamicImage;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::VideoError;

pub use probe::{probe, VideoProbe};
pub use timestamps::mosaic_timestamps;

/// Concurrent decodes allowed per extractor, independent of the
/// coordinator's own ceiling.
const DEFAULT_DECODE_SLOTS: usize = 8;

/// Pre-seek margin for accurate extraction; the decoder seeks to the
/// nearest earlier keyframe and decodes forward from there.
const ACCURATE_SEEK_MARGIN: f64 = 2.0;

/// A decoded frame at (or near) a requested timestamp.
#[derive(Debug, Clone)]
pub struct Frame {
    pub timestamp: f64,
    pub image: DynamicImage,
}

/// How close a returned frame must be to the requested timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TolerancePolicy {
    /// Exact frame at the timestamp.
    Accurate,
    /// Nearest keyframe within roughly 0.5-2.0 seconds.
    Fast,
}

/// Frame extraction primitive over an ffmpeg child process. Variants are
/// selected by [`FrameExtractor::create`]; the accelerated one asks ffmpeg
/// for hardware decode and otherwise behaves identically.
pub enum FrameExtractor {
    Software(SoftwareVariant),
    Accelerated(AcceleratedVariant),
}

pub struct SoftwareVariant {
    slots: Arc<Semaphore>,
}

pub struct AcceleratedVariant {
    slots: Arc<Semaphore>,
}

impl FrameExtractor {
    /// Picks the extractor variant. When acceleration is requested but the
    /// local ffmpeg reports no hardware decoders, falls back to software.
    pub async fn create(use_acceleration: bool) -> Self {
        if use_acceleration {
            match hardware_decoders_available().await {
                Ok(true) => {
                    return FrameExtractor::Accelerated(AcceleratedVariant {
                        slots: Arc::new(Semaphore::new(DEFAULT_DECODE_SLOTS)),
                    });
                }
                Ok(false) => {
                    warn!("No hardware decoders reported, using software extraction");
                }
                Err(e) => {
                    warn!("Failed to query hardware decoders ({}), using software extraction", e);
                }
            }
        }
        FrameExtractor::Software(SoftwareVariant {
            slots: Arc::new(Semaphore::new(DEFAULT_DECODE_SLOTS)),
        })
    }

    fn slots(&self) -> &Arc<Semaphore> {
        match self {
            FrameExtractor::Software(v) => &v.slots,
            FrameExtractor::Accelerated(v) => &v.slots,
        }
    }

    fn accelerated(&self) -> bool {
        matches!(self, FrameExtractor::Accelerated(_))
    }

    /// Decodes one frame. Bounded by the extractor's internal semaphore.
    pub async fn extract_at(
        &self,
        source: &Path,
        timestamp: f64,
        policy: TolerancePolicy,
        max_size: Option<u32>,
    ) -> Result<Frame, VideoError> {
        let url = source.to_string_lossy().to_string();
        let _permit = self
            .slots()
            .acquire()
            .await
            .map_err(|_| VideoError::FrameExtractionFailed {
                url: url.clone(),
                timestamp,
                cause: "extractor shut down".to_string(),
            })?;

        decode_frame(source, timestamp, policy, max_size, self.accelerated()).await
    }

    /// Decodes frames for every timestamp, preserving request order in the
    /// result. Cancellation is observed before each dispatch and after each
    /// receipt; frames decoded before the cancel are kept.
    pub async fn extract_many(
        &self,
        source: &Path,
        timestamps: &[f64],
        policy: TolerancePolicy,
        max_size: Option<u32>,
        cancel: &CancellationToken,
    ) -> Vec<(f64, Result<Frame, VideoError>)> {
        let url = source.to_string_lossy().to_string();
        let tasks = timestamps.iter().map(|&ts| {
            let url = url.clone();
            let cancel = cancel.clone();
            async move {
                if cancel.is_cancelled() {
                    return (ts, Err(VideoError::Cancelled { url }));
                }
                let result = self.extract_at(source, ts, policy, max_size).await;
                if cancel.is_cancelled() && result.is_err() {
                    return (ts, Err(VideoError::Cancelled { url }));
                }
                (ts, result)
            }
        });
        join_all(tasks).await
    }
}

async fn hardware_decoders_available() -> Result<bool, std::io::Error> {
    let output = tokio::process::Command::new("ffmpeg")
        .args(["-hide_banner", "-hwaccels"])
        .output()
        .await?;
    let listing = String::from_utf8_lossy(&output.stdout);
    let count = listing
        .lines()
        .skip(1)
        .filter(|l| !l.trim().is_empty())
        .count();
    Ok(output.status.success() && count > 0)
}

/// Runs ffmpeg for a single frame and decodes the PNG it writes to stdout.
///
/// Accurate mode seeks coarsely before the input and precisely after it;
/// fast mode seeks only before the input, landing on the nearest keyframe.
async fn decode_frame(
    source: &Path,
    timestamp: f64,
    policy: TolerancePolicy,
    max_size: Option<u32>,
    accelerated: bool,
) -> Result<Frame, VideoError> {
    let url = source.to_string_lossy().to_string();
    let mut args: Vec<String> = vec![
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
    ];

    if accelerated {
        args.push("-hwaccel".to_string());
        args.push("auto".to_string());
    }

    match policy {
        TolerancePolicy::Accurate => {
            let coarse = (timestamp - ACCURATE_SEEK_MARGIN).max(0.0);
            let fine = timestamp - coarse;
            if coarse > 0.0 {
                args.push("-ss".to_string());
                args.push(format!("{:.3}", coarse));
            }
            args.push("-i".to_string());
            args.push(url.clone());
            if fine > 0.0 {
                args.push("-ss".to_string());
                args.push(format!("{:.3}", fine));
            }
        }
        TolerancePolicy::Fast => {
            if timestamp > 0.0 {
                args.push("-ss".to_string());
                args.push(format!("{:.3}", timestamp));
            }
            args.push("-i".to_string());
            args.push(url.clone());
        }
    }

    if let Some(max) = max_size {
        args.push("-vf".to_string());
        args.push(format!(
            "scale='min({m},iw)':'min({m},ih)':force_original_aspect_ratio=decrease",
            m = max
        ));
    }

    args.extend(
        [
            "-frames:v", "1", "-an", "-sn", "-dn", "-f", "image2pipe", "-c:v", "png", "pipe:1",
        ]
        .iter()
        .map(|s| s.to_string()),
    );

    let output = tokio::process::Command::new("ffmpeg")
        .args(&args)
        .output()
        .await
        .map_err(|e| VideoError::FrameExtractionFailed {
            url: url.clone(),
            timestamp,
            cause: format!("failed to run ffmpeg: {}", e),
        })?;

    if !output.status.success() || output.stdout.is_empty() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(VideoError::FrameExtractionFailed {
            url,
            timestamp,
            cause: stderr.trim().to_string(),
        });
    }

    let image = image::load_from_memory(&output.stdout).map_err(|e| {
        VideoError::FrameExtractionFailed {
            url,
            timestamp,
            cause: format!("undecodable frame data: {}", e),
        }
    })?;

    Ok(Frame { timestamp, image })
}

/// Absolute path of a temp artifact used while a decoder-backed operation
/// is in flight; removed on all exits.
pub(crate) fn temp_sibling(path: &Path, tag: &str) -> PathBuf {
    let stem = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("artifact");
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    parent.join(format!(".{}.{}.tmp", stem, tag))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_token_short_circuits_extraction() {
        let extractor = FrameExtractor::create(false).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let results = extractor
            .extract_many(
                Path::new("/nonexistent.mp4"),
                &[1.0, 2.0],
                TolerancePolicy::Fast,
                None,
                &cancel,
            )
            .await;
        assert_eq!(results.len(), 2);
        for (_, result) in results {
            assert!(matches!(result, Err(VideoError::Cancelled { .. })));
        }
    }

    #[test]
    fn temp_sibling_stays_in_same_directory() {
        let temp = temp_sibling(Path::new("/library/out/clip.jpg"), "write");
        assert_eq!(temp.parent().unwrap(), Path::new("/library/out"));
        assert!(temp.file_name().unwrap().to_str().unwrap().ends_with(".tmp"));
    }
}
