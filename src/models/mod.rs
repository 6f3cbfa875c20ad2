use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generation state of a video's cover thumbnail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThumbnailStatus {
    Absent,
    Pending,
    InProgress,
    Completed,
    Error,
}

impl ThumbnailStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ThumbnailStatus::Absent => "absent",
            ThumbnailStatus::Pending => "pending",
            ThumbnailStatus::InProgress => "in_progress",
            ThumbnailStatus::Completed => "completed",
            ThumbnailStatus::Error => "error",
        }
    }
}

impl TryFrom<&str> for ThumbnailStatus {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, String> {
        match value {
            "absent" => Ok(ThumbnailStatus::Absent),
            "pending" => Ok(ThumbnailStatus::Pending),
            "in_progress" => Ok(ThumbnailStatus::InProgress),
            "completed" => Ok(ThumbnailStatus::Completed),
            "error" => Ok(ThumbnailStatus::Error),
            _ => Err(format!("Invalid thumbnail status: {}", value)),
        }
    }
}

/// A video known to the catalog. `url` is the absolute path and unique key;
/// `id` stays stable across rescans of the same path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Video {
    pub id: Uuid,
    pub url: String,
    pub title: String,
    pub duration: f64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<f64>,
    pub codec_tag: Option<String>,
    pub bitrate: Option<i64>,
    pub file_size: Option<i64>,
    pub custom_metadata: BTreeMap<String, String>,
    pub date_added: DateTime<Utc>,
    pub date_modified: DateTime<Utc>,
    pub thumbnail_url: Option<String>,
    pub mosaic_url: Option<String>,
    pub preview_url: Option<String>,
    pub thumbnail_status: ThumbnailStatus,
    pub relative_path: String,
}

impl Video {
    pub fn new(url: String) -> Self {
        let title = Path::new(&url)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("Untitled")
            .to_string();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            url,
            title,
            duration: 0.0,
            width: None,
            height: None,
            frame_rate: None,
            codec_tag: None,
            bitrate: None,
            file_size: None,
            custom_metadata: BTreeMap::new(),
            date_added: now,
            date_modified: now,
            thumbnail_url: None,
            mosaic_url: None,
            preview_url: None,
            thumbnail_status: ThumbnailStatus::Absent,
            relative_path: String::new(),
        }
    }

    pub fn path(&self) -> &Path {
        Path::new(&self.url)
    }

    pub fn file_stem(&self) -> &str {
        self.path()
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("video")
    }

    pub fn aspect_ratio(&self) -> Option<f64> {
        match (self.width, self.height) {
            (Some(w), Some(h)) if h > 0 => Some(w as f64 / h as f64),
            _ => None,
        }
    }

    /// Bitrate formatted for display, e.g. "5.0 Mbps".
    pub fn human_bitrate(&self) -> Option<String> {
        let bits = self.bitrate? as f64;
        let formatted = if bits >= 1_000_000.0 {
            format!("{:.1} Mbps", bits / 1_000_000.0)
        } else if bits >= 1_000.0 {
            format!("{:.0} kbps", bits / 1_000.0)
        } else {
            format!("{:.0} bps", bits)
        };
        Some(formatted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LibraryItemKind {
    Folder,
    SmartFolder,
    Playlist,
}

impl LibraryItemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LibraryItemKind::Folder => "folder",
            LibraryItemKind::SmartFolder => "smart_folder",
            LibraryItemKind::Playlist => "playlist",
        }
    }
}

impl TryFrom<&str> for LibraryItemKind {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, String> {
        match value {
            "folder" => Ok(LibraryItemKind::Folder),
            "smart_folder" => Ok(LibraryItemKind::SmartFolder),
            "playlist" => Ok(LibraryItemKind::Playlist),
            _ => Err(format!("Invalid library item type: {}", value)),
        }
    }
}

/// Persisted form of a folder-tree node. Parent/child links are stored as a
/// parent pointer; the in-memory tree lives in `library::LibraryArena`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryItem {
    pub id: Uuid,
    pub name: String,
    pub kind: LibraryItemKind,
    pub url: Option<String>,
    pub parent_id: Option<Uuid>,
    pub smart_criteria: Option<SmartCriteria>,
    pub date_created: DateTime<Utc>,
    pub date_modified: DateTime<Utc>,
    pub last_refresh: Option<DateTime<Utc>>,
}

impl LibraryItem {
    pub fn folder(name: String, url: String, parent_id: Option<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name,
            kind: LibraryItemKind::Folder,
            url: Some(url),
            parent_id,
            smart_criteria: None,
            date_created: now,
            date_modified: now,
            last_refresh: None,
        }
    }

    pub fn smart_folder(name: String, criteria: SmartCriteria) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name,
            kind: LibraryItemKind::SmartFolder,
            url: None,
            parent_id: None,
            smart_criteria: Some(criteria),
            date_created: now,
            date_modified: now,
            last_refresh: None,
        }
    }
}

/// Predicate over catalog videos. A video matches when every present field
/// is satisfied; empty criteria match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SmartCriteria {
    pub name_filters: Option<Vec<String>>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub min_duration: Option<f64>,
    pub max_duration: Option<f64>,
    pub min_size: Option<i64>,
    pub max_size: Option<i64>,
    pub keywords: Option<Vec<String>>,
    pub path_patterns: Option<Vec<String>>,
}

impl SmartCriteria {
    pub fn matches(&self, video: &Video) -> bool {
        if let Some(ref names) = self.name_filters {
            let title = video.title.to_lowercase();
            if !names.iter().any(|n| title.contains(&n.to_lowercase())) {
                return false;
            }
        }

        if let Some(start) = self.start_date {
            if video.date_added < start {
                return false;
            }
        }
        if let Some(end) = self.end_date {
            if video.date_added > end {
                return false;
            }
        }

        if let Some(min) = self.min_duration {
            if video.duration < min {
                return false;
            }
        }
        if let Some(max) = self.max_duration {
            if video.duration > max {
                return false;
            }
        }

        if let Some(min) = self.min_size {
            match video.file_size {
                Some(size) if size >= min => {}
                _ => return false,
            }
        }
        if let Some(max) = self.max_size {
            match video.file_size {
                Some(size) if size <= max => {}
                _ => return false,
            }
        }

        if let Some(ref keywords) = self.keywords {
            let title = video.title.to_lowercase();
            let matched = keywords.iter().any(|k| {
                let k = k.to_lowercase();
                title.contains(&k)
                    || video
                        .custom_metadata
                        .values()
                        .any(|v| v.to_lowercase().contains(&k))
            });
            if !matched {
                return false;
            }
        }

        if let Some(ref patterns) = self.path_patterns {
            let url = video.url.to_lowercase();
            if !patterns.iter().any(|p| url.contains(&p.to_lowercase())) {
                return false;
            }
        }

        true
    }

    pub fn has_date_range(&self) -> bool {
        self.start_date.is_some() || self.end_date.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.canonical_string().is_empty()
    }

    /// Canonical pipe-joined `key:value` form of the set fields, used as the
    /// smart-folder cache key.
    pub fn canonical_string(&self) -> String {
        let mut parts = Vec::new();
        if let Some(ref names) = self.name_filters {
            parts.push(format!("name:{}", names.join(",")));
        }
        if let Some(start) = self.start_date {
            parts.push(format!("start:{}", start.to_rfc3339()));
        }
        if let Some(end) = self.end_date {
            parts.push(format!("end:{}", end.to_rfc3339()));
        }
        if let Some(min) = self.min_duration {
            parts.push(format!("minDuration:{}", min));
        }
        if let Some(max) = self.max_duration {
            parts.push(format!("maxDuration:{}", max));
        }
        if let Some(min) = self.min_size {
            parts.push(format!("minSize:{}", min));
        }
        if let Some(max) = self.max_size {
            parts.push(format!("maxSize:{}", max));
        }
        if let Some(ref keywords) = self.keywords {
            parts.push(format!("keywords:{}", keywords.join(",")));
        }
        if let Some(ref patterns) = self.path_patterns {
            parts.push(format!("path:{}", patterns.join(",")));
        }
        parts.join("|")
    }
}

/// Computed mosaic geometry. Positions and per-tile sizes always have the
/// same length; no tile extends past `mosaic_size`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MosaicLayout {
    pub rows: u32,
    pub cols: u32,
    pub thumbnail_size: (u32, u32),
    pub positions: Vec<(i32, i32)>,
    pub thumbnail_sizes: Vec<(u32, u32)>,
    pub mosaic_size: (u32, u32),
}

impl MosaicLayout {
    pub fn thumb_count(&self) -> usize {
        self.positions.len()
    }
}

/// One failed video in a discovery run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryFailure {
    pub url: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryStatistics {
    pub total_videos: usize,
    pub processed_videos: usize,
    pub skipped_files: usize,
    pub elapsed_seconds: f64,
    pub processing_rate: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryResult {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub created_folders: usize,
    pub errors: Vec<DiscoveryFailure>,
    pub statistics: DiscoveryStatistics,
}

/// Progress snapshot emitted after each completed unit of a discovery run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub total_folders: usize,
    pub processed_folders: usize,
    pub current_folder: String,
    pub total_videos: usize,
    pub processed_videos: usize,
    pub current_video: String,
    pub skipped_files: usize,
    pub error_files: usize,
    pub processing_rate: f64,
    pub estimated_time_remaining: Option<f64>,
}

/// Filesystem-vs-catalog reconciliation outcome.
#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    pub missing: Vec<PathBuf>,
    pub orphaned: Vec<Video>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video(title: &str, size: i64, duration: f64) -> Video {
        let mut v = Video::new(format!("/library/{}.mp4", title));
        v.file_size = Some(size);
        v.duration = duration;
        v
    }

    #[test]
    fn empty_criteria_matches_everything() {
        let criteria = SmartCriteria::default();
        assert!(criteria.is_empty());
        assert!(criteria.matches(&video("anything", 1, 0.0)));
    }

    #[test]
    fn all_present_fields_must_match() {
        let criteria = SmartCriteria {
            name_filters: Some(vec!["trip".to_string()]),
            min_size: Some(1000),
            ..Default::default()
        };
        assert!(criteria.matches(&video("Trip to Oslo", 2000, 10.0)));
        assert!(!criteria.matches(&video("Trip to Oslo", 500, 10.0)));
        assert!(!criteria.matches(&video("Birthday", 2000, 10.0)));
    }

    #[test]
    fn name_filters_are_any_match() {
        let criteria = SmartCriteria {
            name_filters: Some(vec!["foo".to_string(), "bar".to_string()]),
            ..Default::default()
        };
        assert!(criteria.matches(&video("FOOTAGE", 1, 0.0)));
        assert!(criteria.matches(&video("rebar", 1, 0.0)));
        assert!(!criteria.matches(&video("baz", 1, 0.0)));
    }

    #[test]
    fn canonical_string_lists_set_fields_in_order() {
        let criteria = SmartCriteria {
            name_filters: Some(vec!["foo".to_string()]),
            min_size: Some(1_048_576),
            ..Default::default()
        };
        assert_eq!(criteria.canonical_string(), "name:foo|minSize:1048576");
    }

    #[test]
    fn criteria_round_trips_through_serde() {
        let criteria = SmartCriteria {
            name_filters: Some(vec!["a".to_string()]),
            min_duration: Some(30.0),
            max_size: Some(1 << 30),
            ..Default::default()
        };
        let json = serde_json::to_string(&criteria).unwrap();
        let back: SmartCriteria = serde_json::from_str(&json).unwrap();
        assert_eq!(criteria, back);
        let sample = video("a clip", 1 << 20, 45.0);
        assert_eq!(criteria.matches(&sample), back.matches(&sample));
    }

    #[test]
    fn title_derived_from_filename_stem() {
        let v = Video::new("/library/holiday/Day One.mp4".to_string());
        assert_eq!(v.title, "Day One");
        assert_eq!(v.file_stem(), "Day One");
    }

    #[test]
    fn human_bitrate_formats_by_magnitude() {
        let mut v = video("x", 1, 0.0);
        v.bitrate = Some(5_000_000);
        assert_eq!(v.human_bitrate().unwrap(), "5.0 Mbps");
        v.bitrate = Some(320_000);
        assert_eq!(v.human_bitrate().unwrap(), "320 kbps");
    }
}
