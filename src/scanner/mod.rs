use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::VideoFinderError;
use crate::models::{Reconciliation, Video};

/// Filename marker for generated preview clips living beside originals.
const PREVIEW_SUFFIX: &str = "-preview";

/// Directory extensions treated as opaque packages; their descendants are
/// never enumerated.
const PACKAGE_EXTENSIONS: &[&str] = &[
    "app",
    "bundle",
    "framework",
    "photoslibrary",
    "fcpbundle",
    "imovielibrary",
    "tvlibrary",
];

pub type PathProgressFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Discovery content-type filter, matched against the guessed MIME type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Mpeg4,
    QuickTime,
    Avi,
    Mpeg,
    /// Any other `video/*` type.
    Movie,
}

impl ContentType {
    pub fn all() -> &'static [ContentType] {
        &[
            ContentType::Mpeg4,
            ContentType::QuickTime,
            ContentType::Avi,
            ContentType::Mpeg,
            ContentType::Movie,
        ]
    }

    fn matches(self, mime: &mime_guess::Mime) -> bool {
        if mime.type_() != mime_guess::mime::VIDEO {
            return false;
        }
        match self {
            ContentType::Mpeg4 => mime.subtype() == "mp4",
            ContentType::QuickTime => mime.subtype() == "quicktime",
            ContentType::Avi => mime.subtype() == "x-msvideo",
            ContentType::Mpeg => mime.subtype() == "mpeg",
            ContentType::Movie => true,
        }
    }
}

/// Result of one scan: playable originals plus the preview siblings found
/// beside them, keyed by the original's url.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub urls: Vec<PathBuf>,
    pub preview_siblings: HashMap<String, PathBuf>,
}

/// Enumerates filesystem roots for video content. Stateless; every scan is
/// a fresh traversal.
pub struct VideoFinder;

impl VideoFinder {
    /// Walks `root` (recursively or one level deep) and returns matching
    /// video files, deduplicated by file identity, with hidden files and
    /// package contents excluded. Emits each visited directory through
    /// `progress`.
    pub async fn scan(
        root: &Path,
        recursive: bool,
        content_types: &[ContentType],
        progress: Option<PathProgressFn>,
    ) -> Result<ScanOutcome, VideoFinderError> {
        if !root.exists() {
            return Err(VideoFinderError::NotADirectory(root.to_path_buf()));
        }
        if !root.is_dir() {
            return Err(VideoFinderError::NotADirectory(root.to_path_buf()));
        }

        let root = root.to_path_buf();
        let types = content_types.to_vec();
        let walker: JoinHandle<Result<ScanOutcome, VideoFinderError>> =
            tokio::task::spawn_blocking(move || scan_blocking(&root, recursive, &types, progress));

        walker
            .await
            .map_err(|e| VideoFinderError::EnumerationFailed(e.to_string()))?
    }

    /// Diffs catalog state under `root` against the filesystem: `missing`
    /// are on disk but not cataloged, `orphaned` are cataloged but gone.
    pub async fn compare(
        catalog_videos: &[Video],
        root: &Path,
        recursive: bool,
    ) -> Result<Reconciliation, VideoFinderError> {
        let outcome = Self::scan(root, recursive, ContentType::all(), None).await?;
        let on_disk: HashSet<String> = outcome
            .urls
            .iter()
            .map(|p| p.to_string_lossy().to_string())
            .collect();

        let root_prefix = root.to_string_lossy().to_string();
        let cataloged: HashSet<&str> = catalog_videos
            .iter()
            .filter(|v| v.url.starts_with(&root_prefix))
            .map(|v| v.url.as_str())
            .collect();

        let missing = outcome
            .urls
            .iter()
            .filter(|p| !cataloged.contains(p.to_string_lossy().as_ref()))
            .cloned()
            .collect();

        let orphaned = catalog_videos
            .iter()
            .filter(|v| v.url.starts_with(&root_prefix) && !on_disk.contains(&v.url))
            .cloned()
            .collect();

        Ok(Reconciliation { missing, orphaned })
    }
}

fn scan_blocking(
    root: &Path,
    recursive: bool,
    content_types: &[ContentType],
    progress: Option<PathProgressFn>,
) -> Result<ScanOutcome, VideoFinderError> {
    let mut outcome = ScanOutcome::default();
    let mut seen = IdentitySet::default();
    let mut previews: Vec<PathBuf> = Vec::new();

    let mut visit = |path: &Path| {
        if !matches_content_type(path, content_types) {
            return;
        }
        if !seen.insert(path) {
            debug!("Skipping duplicate file identity: {}", path.display());
            return;
        }
        if is_preview_file(path) {
            previews.push(path.to_path_buf());
        } else {
            outcome.urls.push(path.to_path_buf());
        }
    };

    if recursive {
        let walk = WalkDir::new(root)
            .follow_links(true)
            .into_iter()
            .filter_entry(|e| {
                e.depth() == 0
                    || (!is_hidden(e.path())
                        && !(e.file_type().is_dir() && is_package(e.path())))
            });
        for entry in walk {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    if e.io_error()
                        .is_some_and(|io| io.kind() == std::io::ErrorKind::PermissionDenied)
                    {
                        return Err(VideoFinderError::AccessDenied(
                            e.path().unwrap_or(root).to_path_buf(),
                        ));
                    }
                    debug!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if entry.file_type().is_dir() {
                if let Some(ref progress) = progress {
                    progress(&entry.path().to_string_lossy());
                }
            } else if entry.file_type().is_file() {
                visit(entry.path());
            }
        }
    } else {
        if let Some(ref progress) = progress {
            progress(&root.to_string_lossy());
        }
        let entries = std::fs::read_dir(root).map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => {
                VideoFinderError::AccessDenied(root.to_path_buf())
            }
            _ => VideoFinderError::EnumerationFailed(e.to_string()),
        })?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() && !is_hidden(&path) {
                visit(&path);
            }
        }
    }

    outcome.urls.sort();

    for preview in previews {
        if let Some(original) = original_for_preview(&preview) {
            outcome
                .preview_siblings
                .insert(original.to_string_lossy().to_string(), preview);
        }
    }

    info!(
        "Scan of {} found {} videos ({} preview siblings)",
        root.display(),
        outcome.urls.len(),
        outcome.preview_siblings.len()
    );
    Ok(outcome)
}

fn matches_content_type(path: &Path, content_types: &[ContentType]) -> bool {
    let Some(mime) = mime_guess::from_path(path).first() else {
        return false;
    };
    content_types.iter().any(|t| t.matches(&mime))
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}

fn is_package(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| PACKAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

fn is_preview_file(path: &Path) -> bool {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.ends_with(PREVIEW_SUFFIX))
        .unwrap_or(false)
}

/// `/dir/clip-preview.mp4` pairs with `/dir/clip.mp4`.
fn original_for_preview(preview: &Path) -> Option<PathBuf> {
    let stem = preview.file_stem()?.to_str()?;
    let original_stem = stem.strip_suffix(PREVIEW_SUFFIX)?;
    if original_stem.is_empty() {
        return None;
    }
    let extension = preview.extension()?.to_str()?;
    Some(preview.with_file_name(format!("{}.{}", original_stem, extension)))
}

/// Dedup by OS-level file identity where available, absolute path otherwise.
#[derive(Default)]
struct IdentitySet {
    #[cfg(unix)]
    inner: HashSet<(u64, u64)>,
    #[cfg(not(unix))]
    inner: HashSet<PathBuf>,
}

impl IdentitySet {
    #[cfg(unix)]
    fn insert(&mut self, path: &Path) -> bool {
        use std::os::unix::fs::MetadataExt;
        match std::fs::metadata(path) {
            Ok(meta) => self.inner.insert((meta.dev(), meta.ino())),
            Err(_) => true,
        }
    }

    #[cfg(not(unix))]
    fn insert(&mut self, path: &Path) -> bool {
        let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        self.inner.insert(key)
    }
}
