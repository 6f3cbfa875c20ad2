use std::path::PathBuf;

use thiserror::Error;

/// Failures tied to a single video file. Each variant carries the file url
/// so batch error reports stay actionable; causes are captured as strings
/// because these values are cloned across deduplicated task futures.
#[derive(Debug, Clone, Error)]
pub enum VideoError {
    #[error("no video track found in {url}")]
    TrackNotFound { url: String },

    #[error("file not found: {url}")]
    FileNotFound { url: String },

    #[error("access denied: {url}")]
    AccessDenied { url: String },

    #[error("invalid format for {url}: {detail}")]
    InvalidFormat { url: String, detail: String },

    #[error("processing failed for {url}: {cause}")]
    ProcessingFailed { url: String, cause: String },

    #[error("metadata extraction failed for {url}: {cause}")]
    MetadataExtractionFailed { url: String, cause: String },

    #[error("thumbnail generation failed for {url}: {cause}")]
    ThumbnailGenerationFailed { url: String, cause: String },

    #[error("frame extraction failed for {url} at {timestamp:.3}s: {cause}")]
    FrameExtractionFailed {
        url: String,
        timestamp: f64,
        cause: String,
    },

    #[error("cancelled: {url}")]
    Cancelled { url: String },
}

impl VideoError {
    pub fn url(&self) -> &str {
        match self {
            Self::TrackNotFound { url }
            | Self::FileNotFound { url }
            | Self::AccessDenied { url }
            | Self::InvalidFormat { url, .. }
            | Self::ProcessingFailed { url, .. }
            | Self::MetadataExtractionFailed { url, .. }
            | Self::ThumbnailGenerationFailed { url, .. }
            | Self::FrameExtractionFailed { url, .. }
            | Self::Cancelled { url } => url,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum MosaicError {
    #[error("invalid mosaic configuration: {0}")]
    InvalidConfiguration(String),

    #[error("mosaic generation failed: {0}")]
    GenerationFailed(String),

    #[error("image generation failed: {0}")]
    ImageGenerationFailed(String),

    #[error("failed to save mosaic: {0}")]
    SaveFailed(String),

    #[error("output file already exists: {0}")]
    FileExists(PathBuf),

    #[error("mosaic generation cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Error)]
pub enum PreviewError {
    #[error("unable to create composition tracks for {url}: {cause}")]
    UnableToCreateCompositionTracks { url: String, cause: String },

    #[error("unable to create export session: {0}")]
    UnableToCreateExportSession(String),

    #[error("failed to insert segment {index} at {start:.3}s: {cause}")]
    SegmentInsertionFailed {
        index: usize,
        start: f64,
        cause: String,
    },

    #[error("preview export failed: {0}")]
    ExportFailed(String),

    #[error("preview generation cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Error)]
pub enum DiscoveryError {
    #[error("discovery cancelled")]
    Cancelled,

    #[error("not a valid folder: {0}")]
    InvalidFolder(PathBuf),

    #[error("access denied: {0}")]
    AccessDenied(PathBuf),

    #[error("discovery processing failed: {0}")]
    ProcessingFailed(String),
}

#[derive(Debug, Clone, Error)]
pub enum LibraryError {
    #[error("operation not supported for {item_type} items")]
    OperationNotSupported { item_type: String },

    #[error("library item not found: {0}")]
    NotFound(String),

    #[error("conflicting library item: {0}")]
    Conflict(String),
}

#[derive(Debug, Clone, Error)]
pub enum VideoFinderError {
    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("access denied: {0}")]
    AccessDenied(PathBuf),

    #[error("enumeration failed: {0}")]
    EnumerationFailed(String),

    #[error("metadata query failed: {0}")]
    QueryFailed(String),
}
