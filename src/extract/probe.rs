use std::path::Path;

use serde::Deserialize;

use crate::error::VideoError;

/// Media properties reported by the probing primitive.
#[derive(Debug, Clone, Default)]
pub struct VideoProbe {
    pub duration: f64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<f64>,
    pub codec_tag: Option<String>,
    pub bit_rate: Option<i64>,
}

#[derive(Deserialize)]
struct FfprobeOutput {
    format: Option<FormatInfo>,
    streams: Option<Vec<StreamInfo>>,
}

#[derive(Deserialize)]
struct FormatInfo {
    duration: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Deserialize)]
struct StreamInfo {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    duration: Option<String>,
    bit_rate: Option<String>,
}

/// Probes a source with ffprobe and parses the JSON report.
pub async fn probe(path: &Path) -> Result<VideoProbe, VideoError> {
    let url = path.to_string_lossy().to_string();

    if !path.exists() {
        return Err(VideoError::FileNotFound { url });
    }

    let output = tokio::process::Command::new("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .output()
        .await
        .map_err(|e| VideoError::MetadataExtractionFailed {
            url: url.clone(),
            cause: format!("failed to run ffprobe: {}", e),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(VideoError::InvalidFormat {
            url,
            detail: stderr.trim().to_string(),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let report: FfprobeOutput =
        serde_json::from_str(&stdout).map_err(|e| VideoError::MetadataExtractionFailed {
            url: url.clone(),
            cause: format!("unparseable ffprobe output: {}", e),
        })?;

    let video_stream = report
        .streams
        .as_ref()
        .and_then(|streams| {
            streams
                .iter()
                .find(|s| s.codec_type.as_deref() == Some("video"))
        })
        .ok_or(VideoError::TrackNotFound { url: url.clone() })?;

    let duration = report
        .format
        .as_ref()
        .and_then(|f| f.duration.as_ref())
        .or(video_stream.duration.as_ref())
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    let bit_rate = report
        .format
        .as_ref()
        .and_then(|f| f.bit_rate.as_ref())
        .or(video_stream.bit_rate.as_ref())
        .and_then(|b| b.parse::<i64>().ok());

    let frame_rate = video_stream
        .r_frame_rate
        .as_ref()
        .and_then(|r| parse_frame_rate(r));

    Ok(VideoProbe {
        duration,
        width: video_stream.width,
        height: video_stream.height,
        frame_rate,
        codec_tag: video_stream.codec_name.clone(),
        bit_rate,
    })
}

/// Parses rates like "30/1" or "30000/1001".
fn parse_frame_rate(rate: &str) -> Option<f64> {
    if let Some((num_str, den_str)) = rate.split_once('/') {
        let num: f64 = num_str.parse().ok()?;
        let den: f64 = den_str.parse().ok()?;
        if den > 0.0 {
            return Some(num / den);
        }
        return None;
    }
    rate.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rate_fractions_parse() {
        assert!((parse_frame_rate("30/1").unwrap() - 30.0).abs() < 0.01);
        assert!((parse_frame_rate("30000/1001").unwrap() - 29.97).abs() < 0.01);
        assert!((parse_frame_rate("29.97").unwrap() - 29.97).abs() < 0.01);
        assert!(parse_frame_rate("30/0").is_none());
        assert!(parse_frame_rate("garbage").is_none());
    }

    #[tokio::test]
    async fn missing_file_is_reported() {
        let err = probe(Path::new("/nonexistent/clip.mp4")).await.unwrap_err();
        assert!(matches!(err, VideoError::FileNotFound { .. }));
    }
}
