//! Tile grid math and per-scheme tile URLs
//!
//! Pure helpers shared by the assembly engine: pyramid level dimensions,
//! grid sizing, tile addressing for each [`TileKind`], and the overlap-aware
//! blit used during stitching.

use crate::types::{TileKind, TiledPyramid};
use image::{DynamicImage, RgbImage};

/// Column/row extent of one pyramid level
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileGrid {
    /// Number of tile columns
    pub columns: u32,
    /// Number of tile rows
    pub rows: u32,
}

impl TileGrid {
    /// Total tiles in the grid
    pub fn tile_count(&self) -> u32 {
        self.columns * self.rows
    }
}

/// Pixel dimensions of a pyramid level.
///
/// Level N of a pyramid with top level T has dimensions
/// `ceil(full / 2^(T - N))`; the top level is the full image.
pub fn level_dimensions(pyramid: &TiledPyramid, level: u32) -> (u32, u32) {
    let top = pyramid.full_resolution_level();
    let shift = top.saturating_sub(level).min(31);
    let scale = 1u32 << shift;
    (
        pyramid.full_width.div_ceil(scale).max(1),
        pyramid.full_height.div_ceil(scale).max(1),
    )
}

/// Tile grid covering the given pyramid level
pub fn grid_for(pyramid: &TiledPyramid, level: u32) -> TileGrid {
    let (width, height) = level_dimensions(pyramid, level);
    TileGrid {
        columns: width.div_ceil(pyramid.tile_size),
        rows: height.div_ceil(pyramid.tile_size),
    }
}

/// URL of one tile under the pyramid's addressing scheme
pub fn tile_url(pyramid: &TiledPyramid, level: u32, col: u32, row: u32) -> String {
    let base = pyramid.base_url.trim_end_matches('/');
    let format = &pyramid.format;
    match pyramid.kind {
        TileKind::Dzi => format!("{base}_files/{level}/{col}_{row}.{format}"),
        TileKind::Zif => format!("{base}/TileGroup0/{level}-{col}-{row}.{format}"),
        TileKind::Generic => format!("{base}/{level}/{col}_{row}.{format}"),
    }
}

/// Copy one decoded tile onto the canvas.
///
/// Tiles in columns/rows after the first carry an `overlap` border that
/// duplicates pixels of the previous tile; that border is cropped before
/// placement so tiles abut without seams. The copied region is clamped to
/// both the tile and the canvas, so edge tiles of any size are handled.
pub(crate) fn blit_tile(
    canvas: &mut RgbImage,
    tile: &DynamicImage,
    pyramid: &TiledPyramid,
    col: u32,
    row: u32,
) -> Result<(), String> {
    let src_x = if col > 0 { pyramid.overlap } else { 0 };
    let src_y = if row > 0 { pyramid.overlap } else { 0 };
    let dest_x = col * pyramid.tile_size;
    let dest_y = row * pyramid.tile_size;

    let tile_rgb = tile.to_rgb8();
    if tile_rgb.width() <= src_x || tile_rgb.height() <= src_y {
        return Err(format!(
            "tile ({col}, {row}) is {}x{}, smaller than its overlap border",
            tile_rgb.width(),
            tile_rgb.height()
        ));
    }
    if dest_x >= canvas.width() || dest_y >= canvas.height() {
        return Err(format!(
            "tile ({col}, {row}) falls outside the {}x{} canvas",
            canvas.width(),
            canvas.height()
        ));
    }

    let copy_w = (tile_rgb.width() - src_x).min(canvas.width() - dest_x);
    let copy_h = (tile_rgb.height() - src_y).min(canvas.height() - dest_y);

    let cropped = image::imageops::crop_imm(&tile_rgb, src_x, src_y, copy_w, copy_h).to_image();
    image::imageops::replace(canvas, &cropped, i64::from(dest_x), i64::from(dest_y));
    Ok(())
}
