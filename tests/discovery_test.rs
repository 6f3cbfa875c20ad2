//! End-to-end discovery runs over scratch directories, backed by an
//! in-memory catalog. Decoder-dependent behavior (frame extraction) is
//! covered separately; these runs register stub files whose probe fails
//! gracefully.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use vidmosaic::coordinator::{DiscoveryListener, DiscoveryOptions, LibraryCoordinator};
use vidmosaic::db::Catalog;
use vidmosaic::extract::FrameExtractor;
use vidmosaic::models::{ProgressEvent, SmartCriteria, Video};
use vidmosaic::processor::VideoProcessor;
use vidmosaic::scanner::{ContentType, VideoFinder};
use vidmosaic::config::{ProcessingConfig, StoragePaths};

fn write_stub(dir: &Path, name: &str) {
    std::fs::write(dir.join(name), b"\x00\x00\x00\x18ftypmp42stub").unwrap();
}

async fn build_coordinator(catalog: Catalog) -> Arc<LibraryCoordinator> {
    let extractor = Arc::new(FrameExtractor::create(false).await);
    let processor = VideoProcessor::new(
        catalog.clone(),
        ProcessingConfig::default(),
        StoragePaths::default(),
        extractor,
        false,
    );
    Arc::new(LibraryCoordinator::new(catalog, processor))
}

#[derive(Default)]
struct RecordingListener {
    events: Mutex<Vec<ProgressEvent>>,
    cancelled: AtomicUsize,
    completed: AtomicUsize,
}

impl DiscoveryListener for RecordingListener {
    fn on_progress(&self, event: &ProgressEvent) {
        self.events.lock().unwrap().push(event.clone());
    }

    fn on_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
    }

    fn on_complete(&self, _result: &vidmosaic::models::DiscoveryResult) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn small_library_registers_originals_and_pairs_previews() {
    let root = tempfile::tempdir().unwrap();
    write_stub(root.path(), "first.mp4");
    write_stub(root.path(), "second.mp4");
    write_stub(root.path(), "first-preview.mp4");

    // The scanner keeps the preview out of the result set but maps it to
    // its original.
    let outcome = VideoFinder::scan(root.path(), true, ContentType::all(), None)
        .await
        .unwrap();
    assert_eq!(outcome.urls.len(), 2);
    let first_url = root.path().join("first.mp4").to_string_lossy().to_string();
    assert_eq!(
        outcome.preview_siblings.get(&first_url).unwrap(),
        &root.path().join("first-preview.mp4")
    );

    let catalog = Catalog::in_memory().await.unwrap();
    let coordinator = build_coordinator(catalog.clone()).await;
    let listener = Arc::new(RecordingListener::default());

    let result = coordinator
        .discover_folder(
            root.path(),
            &DiscoveryOptions::new(true, 4, false, false),
            Some(listener.clone()),
        )
        .await
        .unwrap();

    assert_eq!(result.added, 2);
    assert_eq!(result.updated, 0);
    assert!(result.errors.is_empty());
    assert_eq!(result.statistics.processed_videos, 2);
    assert_eq!(catalog.fetch_all_videos().await.unwrap().len(), 2);
    assert_eq!(listener.completed.load(Ordering::SeqCst), 1);
    assert_eq!(listener.cancelled.load(Ordering::SeqCst), 0);

    let events = listener.events.lock().unwrap();
    assert!(!events.is_empty());
    assert!(events.iter().all(|e| e.total_videos == 2));
}

#[tokio::test]
async fn second_run_over_unchanged_root_adds_nothing() {
    let root = tempfile::tempdir().unwrap();
    write_stub(root.path(), "a.mp4");
    write_stub(root.path(), "b.mp4");
    write_stub(root.path(), "c.mp4");

    let catalog = Catalog::in_memory().await.unwrap();
    let coordinator = build_coordinator(catalog.clone()).await;
    let options = DiscoveryOptions::new(true, 4, false, false);

    let first = coordinator
        .discover_folder(root.path(), &options, None)
        .await
        .unwrap();
    assert_eq!(first.added, 3);

    let second = coordinator
        .discover_folder(root.path(), &options, None)
        .await
        .unwrap();
    assert_eq!(second.added, 0);
    assert_eq!(second.statistics.skipped_files, 3);
    assert_eq!(catalog.fetch_all_videos().await.unwrap().len(), 3);
}

#[tokio::test]
async fn update_run_refreshes_known_videos_and_drops_orphans() {
    let root = tempfile::tempdir().unwrap();
    write_stub(root.path(), "keep.mp4");
    write_stub(root.path(), "gone.mp4");

    let catalog = Catalog::in_memory().await.unwrap();
    let coordinator = build_coordinator(catalog.clone()).await;
    let update = DiscoveryOptions::new(true, 4, true, false);

    coordinator
        .discover_folder(root.path(), &update, None)
        .await
        .unwrap();

    std::fs::remove_file(root.path().join("gone.mp4")).unwrap();
    write_stub(root.path(), "fresh.mp4");

    let result = coordinator
        .discover_folder(root.path(), &update, None)
        .await
        .unwrap();

    assert_eq!(result.added, 1);
    assert_eq!(result.updated, 1);
    assert_eq!(result.removed, 1);

    let remaining = catalog.fetch_all_videos().await.unwrap();
    let urls: Vec<&str> = remaining.iter().map(|v| v.url.as_str()).collect();
    assert_eq!(urls.len(), 2);
    assert!(!urls.iter().any(|u| u.ends_with("gone.mp4")));
}

#[tokio::test]
async fn folder_chains_are_created_once_per_directory() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(root.path().join("2024/summer")).unwrap();
    std::fs::create_dir_all(root.path().join("2024/winter")).unwrap();
    write_stub(&root.path().join("2024/summer"), "surf.mp4");
    write_stub(&root.path().join("2024/summer"), "dive.mp4");
    write_stub(&root.path().join("2024/winter"), "ski.mp4");

    let catalog = Catalog::in_memory().await.unwrap();
    let coordinator = build_coordinator(catalog.clone()).await;

    let result = coordinator
        .discover_folder(
            root.path(),
            &DiscoveryOptions::new(true, 4, false, false),
            None,
        )
        .await
        .unwrap();

    // root + 2024 + summer + winter
    assert_eq!(result.created_folders, 4);
    let folder = catalog
        .fetch_folder(
            &root.path().join("2024").to_string_lossy(),
            vidmosaic::models::LibraryItemKind::Folder,
        )
        .await
        .unwrap();
    assert!(folder.is_some());
}

struct CancellingListener {
    coordinator: Arc<LibraryCoordinator>,
    after: usize,
    seen: AtomicUsize,
    cancelled: AtomicUsize,
}

impl DiscoveryListener for CancellingListener {
    fn on_progress(&self, _event: &ProgressEvent) {
        if self.seen.fetch_add(1, Ordering::SeqCst) + 1 == self.after {
            self.coordinator.cancel();
        }
    }

    fn on_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn cancellation_terminates_the_run_and_notifies_the_listener() {
    let root = tempfile::tempdir().unwrap();
    for index in 0..60 {
        write_stub(root.path(), &format!("clip-{:03}.mp4", index));
    }

    let catalog = Catalog::in_memory().await.unwrap();
    let coordinator = build_coordinator(catalog.clone()).await;
    let listener = Arc::new(CancellingListener {
        coordinator: coordinator.clone(),
        after: 5,
        seen: AtomicUsize::new(0),
        cancelled: AtomicUsize::new(0),
    });

    let result = coordinator
        .discover_folder(
            root.path(),
            &DiscoveryOptions::new(true, 2, false, false),
            Some(listener.clone()),
        )
        .await
        .unwrap();

    // The run returns a result rather than an error; whatever finished
    // before the flag was observed is registered, the rest is not.
    assert!(result.added <= 60);
    assert_eq!(listener.cancelled.load(Ordering::SeqCst), 1);
    assert!(catalog.fetch_all_videos().await.unwrap().len() <= 60);

    // No stray temp files in the library root.
    let leftovers: Vec<_> = std::fs::read_dir(root.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn reconciliation_reports_missing_and_orphaned_counts() {
    let root = tempfile::tempdir().unwrap();
    let mut cataloged = Vec::new();
    for index in 0..10 {
        let name = format!("old-{:02}.mp4", index);
        write_stub(root.path(), &name);
        cataloged.push(Video::new(
            root.path().join(&name).to_string_lossy().to_string(),
        ));
    }
    // Two cataloged files vanish, three new ones appear.
    std::fs::remove_file(root.path().join("old-00.mp4")).unwrap();
    std::fs::remove_file(root.path().join("old-01.mp4")).unwrap();
    for index in 0..3 {
        write_stub(root.path(), &format!("new-{:02}.mp4", index));
    }

    let reconciliation = VideoFinder::compare(&cataloged, root.path(), true)
        .await
        .unwrap();
    assert_eq!(reconciliation.missing.len(), 3);
    assert_eq!(reconciliation.orphaned.len(), 2);
}

#[tokio::test]
async fn smart_folder_discovery_diffs_successive_runs() {
    let catalog = Catalog::in_memory().await.unwrap();
    for index in 0..4 {
        let mut video = Video::new(format!("/library/big-{}.mp4", index));
        video.file_size = Some(2_000_000_000);
        catalog.upsert_video(&video).await.unwrap();
    }
    let mut small = Video::new("/library/small.mp4".to_string());
    small.file_size = Some(10_000);
    catalog.upsert_video(&small).await.unwrap();

    let coordinator = build_coordinator(catalog.clone()).await;
    let criteria = SmartCriteria {
        min_size: Some(1_073_741_824),
        ..Default::default()
    };

    let first = coordinator
        .discover_smart_folder(&criteria, None)
        .await
        .unwrap();
    assert_eq!(first.statistics.total_videos, 4);
    assert_eq!(first.added, 4);

    let mut newcomer = Video::new("/library/big-new.mp4".to_string());
    newcomer.file_size = Some(3_000_000_000);
    catalog.upsert_video(&newcomer).await.unwrap();

    let second = coordinator
        .discover_smart_folder(&criteria, None)
        .await
        .unwrap();
    assert_eq!(second.added, 1);
    assert_eq!(second.removed, 0);
    assert_eq!(second.statistics.total_videos, 5);
}

#[tokio::test]
async fn discovery_counts_are_consistent() {
    let root = tempfile::tempdir().unwrap();
    for index in 0..7 {
        write_stub(root.path(), &format!("clip-{}.mp4", index));
    }

    let catalog = Catalog::in_memory().await.unwrap();
    let coordinator = build_coordinator(catalog).await;
    let result = coordinator
        .discover_folder(
            root.path(),
            &DiscoveryOptions::new(true, 4, false, false),
            None,
        )
        .await
        .unwrap();

    assert_eq!(
        result.added + result.updated + result.errors.len(),
        result.statistics.processed_videos
    );
}
