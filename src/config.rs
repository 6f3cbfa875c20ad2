use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Tile density preset. The factor divides the computed thumbnail count and
/// the extract multiplier divides the preview segment rate, so smaller
/// presets yield sparser artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Density {
    Xxs,
    Xs,
    S,
    M,
    L,
    Xl,
    Xxl,
}

impl Density {
    pub fn factor(self) -> f64 {
        match self {
            Density::Xxs => 4.0,
            Density::Xs => 2.0,
            Density::S => 1.5,
            Density::M => 1.0,
            Density::L => 0.75,
            Density::Xl => 0.5,
            Density::Xxl => 0.25,
        }
    }

    pub fn extract_multiplier(self) -> f64 {
        match self {
            Density::Xxs => 4.0,
            Density::Xs => 2.0,
            Density::S => 1.5,
            Density::M => 1.0,
            Density::L => 0.75,
            Density::Xl => 0.5,
            Density::Xxl => 0.25,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Density::Xxs => "xxs",
            Density::Xs => "xs",
            Density::S => "s",
            Density::M => "m",
            Density::L => "l",
            Density::Xl => "xl",
            Density::Xxl => "xxl",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AspectRatio {
    #[serde(rename = "16:9")]
    Widescreen,
    #[serde(rename = "4:3")]
    Standard,
    #[serde(rename = "1:1")]
    Square,
    #[serde(rename = "21:9")]
    Ultrawide,
}

impl AspectRatio {
    pub fn ratio(self) -> f64 {
        match self {
            AspectRatio::Widescreen => 16.0 / 9.0,
            AspectRatio::Standard => 4.0 / 3.0,
            AspectRatio::Square => 1.0,
            AspectRatio::Ultrawide => 21.0 / 9.0,
        }
    }

    /// Filesystem-safe token used in artifact names.
    pub fn as_token(self) -> &'static str {
        match self {
            AspectRatio::Widescreen => "16x9",
            AspectRatio::Standard => "4x3",
            AspectRatio::Square => "1x1",
            AspectRatio::Ultrawide => "21x9",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Jpeg,
    Png,
    Heif,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Png => "png",
            OutputFormat::Heif => "heic",
        }
    }
}

/// Border and shadow treatment for mosaic tiles. The border luminance is a
/// grayscale value in [0,1]; 1.0 is white.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualSettings {
    pub border: bool,
    pub border_luminance: f64,
    pub border_width: u32,
    pub shadow: bool,
    pub shadow_opacity: f64,
    pub shadow_radius: u32,
    pub shadow_offset: (i32, i32),
}

impl Default for VisualSettings {
    fn default() -> Self {
        Self {
            border: true,
            border_luminance: 1.0,
            border_width: 1,
            shadow: true,
            shadow_opacity: 0.5,
            shadow_radius: 4,
            shadow_offset: (0, -2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutConfig {
    pub aspect_ratio: AspectRatio,
    pub spacing: u32,
    pub auto_layout: bool,
    pub custom_layout: bool,
    pub visual: VisualSettings,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            aspect_ratio: AspectRatio::Widescreen,
            spacing: 4,
            auto_layout: true,
            custom_layout: false,
            visual: VisualSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub overwrite: bool,
    pub save_at_root: bool,
    pub separate_folders: bool,
    pub add_full_path: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            overwrite: false,
            save_at_root: false,
            separate_folders: true,
            add_full_path: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MosaicConfiguration {
    pub width: u32,
    pub density: Density,
    pub format: OutputFormat,
    pub layout: LayoutConfig,
    pub include_metadata: bool,
    pub use_accurate_timestamps: bool,
    pub compression_quality: f64,
    pub output: OutputConfig,
}

impl Default for MosaicConfiguration {
    fn default() -> Self {
        Self {
            width: 5120,
            density: Density::M,
            format: OutputFormat::Heif,
            layout: LayoutConfig::default(),
            include_metadata: true,
            use_accurate_timestamps: true,
            compression_quality: 0.4,
            output: OutputConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewConfiguration {
    pub duration: f64,
    pub density: Density,
    pub save_in_custom_location: bool,
    pub custom_save_location: Option<PathBuf>,
    pub max_speed_multiplier: f64,
}

impl Default for PreviewConfiguration {
    fn default() -> Self {
        Self {
            duration: 30.0,
            density: Density::Xs,
            save_in_custom_location: false,
            custom_save_location: None,
            max_speed_multiplier: 1.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Longer-edge bound for decoded frames.
    pub thumbnail_width: u32,
    pub format: OutputFormat,
    pub compression_quality: f64,
    pub use_accurate_timestamps: bool,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            thumbnail_width: 1920,
            format: OutputFormat::Heif,
            compression_quality: 0.8,
            use_accurate_timestamps: true,
        }
    }
}

/// Where generated artifacts live when they are not saved beside the
/// source video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoragePaths {
    pub app_support: PathBuf,
    pub app_cache: PathBuf,
}

impl Default for StoragePaths {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Self {
            app_support: PathBuf::from(&home).join(".local/share/vidmosaic"),
            app_cache: PathBuf::from(&home).join(".cache/vidmosaic"),
        }
    }
}

impl StoragePaths {
    pub fn thumbnails_dir(&self) -> PathBuf {
        self.app_support.join("Thumbnails")
    }

    pub fn previews_dir(&self) -> PathBuf {
        self.app_cache.join("Previews")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub library_roots: Vec<PathBuf>,
    pub storage: StoragePaths,
    pub processing: ProcessingConfig,
    pub mosaic: MosaicConfiguration,
    pub preview: PreviewConfiguration,
    pub concurrent_operations: usize,
    pub generate_thumbnails: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite://vidmosaic.db".to_string(),
            library_roots: vec![],
            storage: StoragePaths::default(),
            processing: ProcessingConfig::default(),
            mosaic: MosaicConfiguration::default(),
            preview: PreviewConfiguration::default(),
            concurrent_operations: 8,
            generate_thumbnails: true,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Ok(db_url) = std::env::var("DATABASE_URL") {
            config.database_url = db_url;
        }

        if let Ok(roots) = std::env::var("LIBRARY_ROOTS") {
            config.library_roots = roots
                .split(',')
                .map(|p| PathBuf::from(p.trim()))
                .collect();
        }

        if let Ok(dir) = std::env::var("APP_SUPPORT_DIR") {
            config.storage.app_support = PathBuf::from(dir);
        }

        if let Ok(dir) = std::env::var("APP_CACHE_DIR") {
            config.storage.app_cache = PathBuf::from(dir);
        }

        if let Ok(ops) = std::env::var("CONCURRENT_OPERATIONS") {
            config.concurrent_operations = ops.parse()?;
        }

        if let Ok(flag) = std::env::var("GENERATE_THUMBNAILS") {
            config.generate_thumbnails = flag != "false";
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn density_presets_are_monotonic() {
        let order = [
            Density::Xxs,
            Density::Xs,
            Density::S,
            Density::M,
            Density::L,
            Density::Xl,
            Density::Xxl,
        ];
        for pair in order.windows(2) {
            assert!(pair[0].factor() > pair[1].factor());
            assert!(pair[0].extract_multiplier() > pair[1].extract_multiplier());
        }
        assert_eq!(Density::M.factor(), 1.0);
        assert_eq!(Density::Xs.extract_multiplier(), 2.0);
    }

    #[test]
    fn defaults_match_factory_settings() {
        let mosaic = MosaicConfiguration::default();
        assert_eq!(mosaic.width, 5120);
        assert_eq!(mosaic.density, Density::M);
        assert_eq!(mosaic.format, OutputFormat::Heif);
        assert_eq!(mosaic.layout.spacing, 4);
        assert!((mosaic.compression_quality - 0.4).abs() < f64::EPSILON);

        let preview = PreviewConfiguration::default();
        assert_eq!(preview.duration, 30.0);
        assert_eq!(preview.density, Density::Xs);
        assert_eq!(preview.max_speed_multiplier, 1.5);
    }
}
