use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::Cursor;
use std::sync::OnceLock;

use ab_glyph::{FontVec, PxScale};
use image::{imageops, DynamicImage, ImageFormat, Rgba, RgbaImage};
use imageproc::drawing::draw_text_mut;
use tracing::warn;

use crate::config::{OutputFormat, VisualSettings};
use crate::error::MosaicError;
use crate::models::MosaicLayout;

const BACKGROUND: Rgba<u8> = Rgba([40, 40, 40, 255]);
const BLANK_TILE: Rgba<u8> = Rgba([56, 56, 56, 255]);
const TEXT_WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);
const TEXT_SHADOW: Rgba<u8> = Rgba([0, 0, 0, 255]);

/// Fraction of the mosaic height used by the metadata strip.
const METADATA_STRIP_RATIO: f64 = 0.10;

/// One tile to draw: a decoded frame (or None for a blank substitute) and
/// its timestamp label.
pub struct Tile {
    pub frame: Option<DynamicImage>,
    pub label: String,
}

/// Text block drawn across the bottom strip when metadata overlay is on.
#[derive(Debug, Clone, Default)]
pub struct MetadataOverlay {
    pub fields: Vec<String>,
}

impl MetadataOverlay {
    pub fn line(&self) -> String {
        self.fields.join(" | ")
    }
}

/// Draws a populated layout into a single opaque image.
pub fn compose(
    tiles: &[Tile],
    layout: &MosaicLayout,
    visual: &VisualSettings,
    metadata: Option<&MetadataOverlay>,
) -> Result<RgbaImage, MosaicError> {
    if tiles.len() != layout.thumb_count() {
        return Err(MosaicError::ImageGenerationFailed(format!(
            "{} tiles supplied for a {}-tile layout",
            tiles.len(),
            layout.thumb_count()
        )));
    }

    let (width, mut height) = layout.mosaic_size;
    let strip_height = if metadata.is_some() {
        (height as f64 * METADATA_STRIP_RATIO).round() as u32
    } else {
        0
    };
    height += strip_height;

    let mut canvas = RgbaImage::from_pixel(width, height, BACKGROUND);

    for (index, tile) in tiles.iter().enumerate() {
        let (x, y) = layout.positions[index];
        let (w, h) = layout.thumbnail_sizes[index];

        if visual.shadow {
            draw_shadow(
                &mut canvas,
                x + visual.shadow_offset.0,
                y - visual.shadow_offset.1,
                w,
                h,
                visual.shadow_opacity as f32,
                visual.shadow_radius,
            );
        }

        match tile.frame {
            Some(ref frame) => {
                let scaled = frame.resize_exact(w, h, imageops::FilterType::Lanczos3);
                imageops::overlay(&mut canvas, &scaled.to_rgba8(), x as i64, y as i64);
            }
            None => {
                fill_rect(&mut canvas, x, y, w, h, BLANK_TILE);
            }
        }

        if visual.border && visual.border_width > 0 {
            let level = (visual.border_luminance.clamp(0.0, 1.0) * 255.0) as u8;
            draw_border(
                &mut canvas,
                x,
                y,
                w,
                h,
                visual.border_width,
                Rgba([level, level, level, 255]),
            );
        }

        if !tile.label.is_empty() {
            let label_scale = (h as f32 * 0.09).max(10.0);
            draw_labeled_text(
                &mut canvas,
                &tile.label,
                x + 6,
                (y + h as i32) - label_scale as i32 - 6,
                label_scale,
            );
        }
    }

    if let Some(overlay) = metadata {
        let line = overlay.line();
        if !line.is_empty() {
            let text_scale = (strip_height as f32 * 0.4).max(12.0);
            let text_y = (height - strip_height) as i32
                + ((strip_height as f32 - text_scale) / 2.0) as i32;
            draw_labeled_text(&mut canvas, &line, 16, text_y, text_scale);
        }
    }

    Ok(canvas)
}

/// Encodes the composed image. HEIF output is not supported by the image
/// stack, so it degrades to JPEG; callers use the returned format for the
/// file extension.
pub fn encode(
    image: &RgbaImage,
    format: OutputFormat,
    compression_quality: f64,
) -> Result<(Vec<u8>, OutputFormat), MosaicError> {
    let format = match format {
        OutputFormat::Heif => {
            warn!("HEIF encoding unavailable, falling back to JPEG");
            OutputFormat::Jpeg
        }
        other => other,
    };

    let mut buffer = Cursor::new(Vec::new());
    match format {
        OutputFormat::Jpeg => {
            let quality = (compression_quality.clamp(0.0, 1.0) * 100.0).round().max(1.0) as u8;
            let rgb = DynamicImage::ImageRgba8(image.clone()).to_rgb8();
            let encoder =
                image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buffer, quality);
            rgb.write_with_encoder(encoder)
                .map_err(|e| MosaicError::ImageGenerationFailed(e.to_string()))?;
        }
        OutputFormat::Png => {
            image
                .write_to(&mut buffer, ImageFormat::Png)
                .map_err(|e| MosaicError::ImageGenerationFailed(e.to_string()))?;
        }
        OutputFormat::Heif => unreachable!(),
    }

    Ok((buffer.into_inner(), format))
}

/// Stable digest of the raw pixel data, independent of the encoder.
pub fn pixel_digest(image: &RgbaImage) -> u64 {
    let mut hasher = DefaultHasher::new();
    image.dimensions().hash(&mut hasher);
    image.as_raw().hash(&mut hasher);
    hasher.finish()
}

/// "M:SS" below an hour, "H:MM:SS" above.
pub fn format_timestamp(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{}:{:02}", m, s)
    }
}

fn fill_rect(canvas: &mut RgbaImage, x: i32, y: i32, w: u32, h: u32, color: Rgba<u8>) {
    let (cw, ch) = canvas.dimensions();
    for py in y.max(0)..(y + h as i32).min(ch as i32) {
        for px in x.max(0)..(x + w as i32).min(cw as i32) {
            canvas.put_pixel(px as u32, py as u32, color);
        }
    }
}

fn blend_rect(canvas: &mut RgbaImage, x: i32, y: i32, w: i32, h: i32, alpha: f32) {
    let (cw, ch) = canvas.dimensions();
    let alpha = alpha.clamp(0.0, 1.0);
    for py in y.max(0)..(y + h).min(ch as i32) {
        for px in x.max(0)..(x + w).min(cw as i32) {
            let pixel = canvas.get_pixel_mut(px as u32, py as u32);
            for channel in 0..3 {
                pixel[channel] = (pixel[channel] as f32 * (1.0 - alpha)) as u8;
            }
        }
    }
}

/// Soft shadow: a full-opacity core under the tile plus fading one-pixel
/// rings out to `radius`.
fn draw_shadow(canvas: &mut RgbaImage, x: i32, y: i32, w: u32, h: u32, opacity: f32, radius: u32) {
    blend_rect(canvas, x, y, w as i32, h as i32, opacity);
    for ring in 1..=radius as i32 {
        let fade = opacity * (1.0 - ring as f32 / (radius as f32 + 1.0));
        let (rx, ry) = (x - ring, y - ring);
        let (rw, rh) = (w as i32 + 2 * ring, h as i32 + 2 * ring);
        blend_rect(canvas, rx, ry, rw, 1, fade);
        blend_rect(canvas, rx, ry + rh - 1, rw, 1, fade);
        blend_rect(canvas, rx, ry + 1, 1, rh - 2, fade);
        blend_rect(canvas, rx + rw - 1, ry + 1, 1, rh - 2, fade);
    }
}

/// Border frame drawn inside the tile rect.
fn draw_border(canvas: &mut RgbaImage, x: i32, y: i32, w: u32, h: u32, width: u32, color: Rgba<u8>) {
    let width = width.min(w / 2).min(h / 2).max(1);
    fill_rect(canvas, x, y, w, width, color);
    fill_rect(canvas, x, y + (h - width) as i32, w, width, color);
    fill_rect(canvas, x, y, width, h, color);
    fill_rect(canvas, x + (w - width) as i32, y, width, h, color);
}

fn draw_labeled_text(canvas: &mut RgbaImage, text: &str, x: i32, y: i32, size: f32) {
    let Some(font) = overlay_font() else {
        return;
    };
    let scale = PxScale::from(size);
    draw_text_mut(canvas, TEXT_SHADOW, x + 1, y + 1, scale, font, text);
    draw_text_mut(canvas, TEXT_WHITE, x, y, scale, font, text);
}

/// First system font that parses; text overlays are skipped when none is
/// available.
fn overlay_font() -> Option<&'static FontVec> {
    static FONT: OnceLock<Option<FontVec>> = OnceLock::new();
    FONT.get_or_init(|| {
        let candidates = [
            "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
            "/usr/share/fonts/TTF/DejaVuSans.ttf",
            "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
            "/usr/share/fonts/liberation/LiberationSans-Regular.ttf",
            "/Library/Fonts/Arial.ttf",
            "C:\\Windows\\Fonts\\arial.ttf",
        ];
        for path in candidates {
            if let Ok(data) = std::fs::read(path) {
                if let Ok(font) = FontVec::try_from_vec(data) {
                    return Some(font);
                }
            }
        }
        warn!("No usable system font found, text overlays disabled");
        None
    })
    .as_ref()
}
