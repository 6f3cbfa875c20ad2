use crate::config::{AspectRatio, Density};
use crate::error::MosaicError;
use crate::models::MosaicLayout;

/// Minimum tile count, used for clips shorter than five seconds.
const MIN_TILES: u32 = 4;
/// Hard ceiling on tiles per mosaic.
const MAX_TILES: u32 = 100;
/// Logarithmic growth parameters: `raw = BASE + K * ln(duration)`.
const BASE: f64 = 320.0 / 200.0;
const K: f64 = 10.0;

/// Number of tiles for a video of `duration` seconds at the given density.
/// With `auto_layout` the count is rounded up to the next multiple of the
/// grid's column count so the grid is rectangular.
pub fn thumbnail_count(duration: f64, density: Density, auto_layout: bool) -> u32 {
    if duration < 5.0 {
        return MIN_TILES;
    }
    let raw = BASE + K * duration.ln();
    let count = ((raw / density.factor()).floor() as u32).clamp(1, MAX_TILES);
    if auto_layout {
        let cols = grid_cols(count);
        count.div_ceil(cols) * cols
    } else {
        count
    }
}

/// Column count targeting a mosaic aspect close to the tile aspect, which
/// resolves to the square-ish grid `⌊√count⌋`.
fn grid_cols(count: u32) -> u32 {
    ((count as f64).sqrt().floor() as u32).max(1)
}

/// Computes the full mosaic geometry. In custom mode the first tile is
/// reserved at 2x size in the top-left corner and the remaining tiles are
/// renumbered around it; ties go to the lower row index.
pub fn layout(
    aspect_ratio: AspectRatio,
    thumb_count: u32,
    mosaic_width: u32,
    spacing: u32,
    custom: bool,
) -> Result<MosaicLayout, MosaicError> {
    if mosaic_width == 0 {
        return Err(MosaicError::InvalidConfiguration(
            "mosaic width must be positive".to_string(),
        ));
    }
    if thumb_count == 0 {
        return Err(MosaicError::InvalidConfiguration(
            "thumbnail count must be positive".to_string(),
        ));
    }

    let ratio = aspect_ratio.ratio();
    let cols = if custom {
        grid_cols(thumb_count).max(2)
    } else {
        grid_cols(thumb_count)
    };
    let rows = if custom {
        // The 2x2 corner tile displaces three grid cells.
        (thumb_count + 3).div_ceil(cols).max(2)
    } else {
        thumb_count.div_ceil(cols)
    };

    let gutters = (cols + 1) * spacing;
    if gutters >= mosaic_width {
        return Err(MosaicError::InvalidConfiguration(format!(
            "spacing {} leaves no room for tiles at width {}",
            spacing, mosaic_width
        )));
    }
    let thumb_w = (mosaic_width - gutters) / cols;
    let thumb_h = (thumb_w as f64 / ratio).round() as u32;
    if thumb_w == 0 || thumb_h == 0 {
        return Err(MosaicError::InvalidConfiguration(
            "computed tile size is empty".to_string(),
        ));
    }

    let mosaic_height = rows * thumb_h + (rows + 1) * spacing;

    let cell_origin = |row: u32, col: u32| -> (i32, i32) {
        (
            (spacing + col * (thumb_w + spacing)) as i32,
            (spacing + row * (thumb_h + spacing)) as i32,
        )
    };

    let mut positions = Vec::with_capacity(thumb_count as usize);
    let mut sizes = Vec::with_capacity(thumb_count as usize);

    if custom {
        positions.push(cell_origin(0, 0));
        sizes.push((2 * thumb_w + spacing, 2 * thumb_h + spacing));

        let mut placed = 1;
        'grid: for row in 0..rows {
            for col in 0..cols {
                if row < 2 && col < 2 {
                    continue;
                }
                if placed == thumb_count {
                    break 'grid;
                }
                positions.push(cell_origin(row, col));
                sizes.push((thumb_w, thumb_h));
                placed += 1;
            }
        }
        if placed < thumb_count {
            return Err(MosaicError::InvalidConfiguration(format!(
                "custom grid {}x{} cannot hold {} tiles",
                rows, cols, thumb_count
            )));
        }
    } else {
        for index in 0..thumb_count {
            let row = index / cols;
            let col = index % cols;
            positions.push(cell_origin(row, col));
            sizes.push((thumb_w, thumb_h));
        }
    }

    Ok(MosaicLayout {
        rows,
        cols,
        thumbnail_size: (thumb_w, thumb_h),
        positions,
        thumbnail_sizes: sizes,
        mosaic_size: (mosaic_width, mosaic_height),
    })
}
