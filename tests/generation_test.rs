//! Mosaic and preview generation against a synthesized test clip. These
//! tests need ffmpeg/ffprobe on PATH and print a skip notice when the
//! tools are unavailable.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use vidmosaic::config::{
    Density, MosaicConfiguration, OutputFormat, PreviewConfiguration, ProcessingConfig,
    StoragePaths,
};
use vidmosaic::extract::{probe, FrameExtractor, TolerancePolicy};
use vidmosaic::models::Video;
use vidmosaic::mosaic::MosaicEngine;
use vidmosaic::preview::PreviewEngine;

fn ffmpeg_available() -> bool {
    Command::new("ffmpeg")
        .arg("-version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// 12-second 320x180 synthetic clip.
fn make_test_video(dir: &Path) -> Option<PathBuf> {
    let path = dir.join("testsrc.mp4");
    let status = Command::new("ffmpeg")
        .args([
            "-hide_banner",
            "-loglevel",
            "error",
            "-f",
            "lavfi",
            "-i",
            "testsrc=duration=12:size=320x180:rate=10",
            "-pix_fmt",
            "yuv420p",
            "-y",
        ])
        .arg(&path)
        .status()
        .ok()?;
    status.success().then_some(path)
}

fn small_mosaic_config() -> MosaicConfiguration {
    let mut config = MosaicConfiguration::default();
    config.width = 640;
    config.format = OutputFormat::Jpeg;
    config.include_metadata = false;
    config.output.overwrite = true;
    config
}

#[tokio::test]
async fn probe_reads_synthesized_clip_metadata() {
    if !ffmpeg_available() {
        println!("skipping: ffmpeg not available");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let Some(clip) = make_test_video(dir.path()) else {
        println!("skipping: could not synthesize test clip");
        return;
    };

    let info = probe(&clip).await.unwrap();
    assert!((info.duration - 12.0).abs() < 0.5);
    assert_eq!(info.width, Some(320));
    assert_eq!(info.height, Some(180));
    assert!(info.codec_tag.is_some());
}

#[tokio::test]
async fn frames_are_extracted_near_requested_timestamps() {
    if !ffmpeg_available() {
        println!("skipping: ffmpeg not available");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let Some(clip) = make_test_video(dir.path()) else {
        println!("skipping: could not synthesize test clip");
        return;
    };

    let extractor = FrameExtractor::create(false).await;
    let cancel = CancellationToken::new();
    let results = extractor
        .extract_many(
            &clip,
            &[1.0, 6.0, 11.0],
            TolerancePolicy::Accurate,
            Some(160),
            &cancel,
        )
        .await;

    assert_eq!(results.len(), 3);
    for (_, result) in &results {
        let frame = result.as_ref().unwrap();
        assert!(frame.image.width() <= 160);
        assert!(frame.image.height() <= 160);
    }
}

#[tokio::test]
async fn mosaic_generation_writes_the_named_artifact() {
    if !ffmpeg_available() {
        println!("skipping: ffmpeg not available");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let Some(clip) = make_test_video(dir.path()) else {
        println!("skipping: could not synthesize test clip");
        return;
    };

    let info = probe(&clip).await.unwrap();
    let mut video = Video::new(clip.to_string_lossy().to_string());
    video.duration = info.duration;
    video.width = info.width;
    video.height = info.height;

    let engine = MosaicEngine::create(false).await;
    let config = small_mosaic_config();
    let stages: Arc<Mutex<Vec<f64>>> = Arc::new(Mutex::new(Vec::new()));
    let progress: vidmosaic::mosaic::ProgressFn = {
        let stages = stages.clone();
        Arc::new(move |value: f64| stages.lock().unwrap().push(value))
    };

    let cancel = CancellationToken::new();
    let path = engine
        .generate(&video, &config, None, Some(progress), &cancel)
        .await
        .unwrap();

    assert!(path.exists());
    let parent = path.parent().unwrap().file_name().unwrap().to_str().unwrap();
    assert_eq!(parent, "_Th640_m_16x9");
    assert!(path
        .file_name()
        .unwrap()
        .to_str()
        .unwrap()
        .ends_with("_640_m_16x9.jpg"));

    let recorded = stages.lock().unwrap().clone();
    assert_eq!(recorded.first(), Some(&0.1));
    assert_eq!(recorded.last(), Some(&1.0));

    // A fresh engine regenerates in place when overwrite is set.
    let fresh = MosaicEngine::create(false).await;
    let again = fresh
        .generate(&video, &config, None, None, &cancel)
        .await
        .unwrap();
    assert_eq!(again, path);
}

#[tokio::test]
async fn preview_generation_splices_segments_into_one_clip() {
    if !ffmpeg_available() {
        println!("skipping: ffmpeg not available");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let Some(clip) = make_test_video(dir.path()) else {
        println!("skipping: could not synthesize test clip");
        return;
    };

    let info = probe(&clip).await.unwrap();
    let mut video = Video::new(clip.to_string_lossy().to_string());
    video.duration = info.duration;

    let out_dir = tempfile::tempdir().unwrap();
    let engine = PreviewEngine::new(StoragePaths {
        app_support: out_dir.path().join("support"),
        app_cache: out_dir.path().join("cache"),
    });
    let config = PreviewConfiguration {
        duration: 6.0,
        density: Density::M,
        ..Default::default()
    };

    let cancel = CancellationToken::new();
    let path = engine
        .generate(&video, &config, None, &cancel)
        .await
        .unwrap();

    assert!(path.exists());
    assert!(path.starts_with(out_dir.path().join("cache/Previews")));

    let produced = probe(&path).await.unwrap();
    // Four 1.5s segments at 1.0x.
    assert!((produced.duration - 6.0).abs() < 1.0);
}

#[tokio::test]
async fn cover_thumbnails_land_in_the_support_directory() {
    if !ffmpeg_available() {
        println!("skipping: ffmpeg not available");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let Some(clip) = make_test_video(dir.path()) else {
        println!("skipping: could not synthesize test clip");
        return;
    };

    let out_dir = tempfile::tempdir().unwrap();
    let catalog = vidmosaic::db::Catalog::in_memory().await.unwrap();
    let extractor = Arc::new(FrameExtractor::create(false).await);
    let processor = vidmosaic::processor::VideoProcessor::new(
        catalog,
        ProcessingConfig {
            format: OutputFormat::Jpeg,
            ..ProcessingConfig::default()
        },
        StoragePaths {
            app_support: out_dir.path().join("support"),
            app_cache: out_dir.path().join("cache"),
        },
        extractor,
        false,
    );

    let info = probe(&clip).await.unwrap();
    let mut video = Video::new(clip.to_string_lossy().to_string());
    video.duration = info.duration;

    let cancel = CancellationToken::new();
    let path = processor.generate_cover(&video, &cancel).await.unwrap();
    assert!(path.exists());
    assert_eq!(
        path.file_name().unwrap().to_str().unwrap(),
        format!("{}_thumb.jpg", video.id)
    );
    assert!(path.starts_with(out_dir.path().join("support/Thumbnails")));
}
