// Regular tile grid over a slide, filtered by tissue content.

use geo::geometry::{Coord, Rect};
use log::{debug, info, trace};
use ndarray::Array2;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Instant;

use crate::errors::{FollicleError, Result};
use crate::tables::{find_column, open_csv_reader, parse_field};

/// Tile identity: slide plus pixel origin. Rendered as `slide:x:y`; parsed
/// from the right so slide ids may themselves contain ':'.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileId {
    pub slide_id: String,
    pub x: u32,
    pub y: u32,
}

impl TileId {
    pub fn new(slide_id: &str, x: u32, y: u32) -> Self {
        TileId {
            slide_id: slide_id.to_string(),
            x,
            y,
        }
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.slide_id, self.x, self.y)
    }
}

impl FromStr for TileId {
    type Err = FollicleError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || FollicleError::InvalidTileId(s.to_string());
        let mut parts = s.trim().rsplitn(3, ':');
        let y = parts.next().ok_or_else(invalid)?;
        let x = parts.next().ok_or_else(invalid)?;
        let slide_id = parts.next().ok_or_else(invalid)?;
        if slide_id.is_empty() {
            return Err(invalid());
        }
        Ok(TileId {
            slide_id: slide_id.to_string(),
            x: x.parse().map_err(|_| invalid())?,
            y: y.parse().map_err(|_| invalid())?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Tile {
    pub slide_id: String,
    pub species: String,
    pub x: u32,
    pub y: u32,
    pub size: u32,
}

impl Tile {
    pub fn id(&self) -> TileId {
        TileId::new(&self.slide_id, self.x, self.y)
    }

    pub fn rect(&self) -> Rect<f64> {
        Rect::new(
            Coord {
                x: self.x as f64,
                y: self.y as f64,
            },
            Coord {
                x: self.x as f64 + self.size as f64,
                y: self.y as f64 + self.size as f64,
            },
        )
    }

    pub fn area(&self) -> f64 {
        self.size as f64 * self.size as f64
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SlideExtent {
    pub width: u32,
    pub height: u32,
}

/// Source of per-tile tissue content, in [0, 1].
pub trait TissueMask: Sync {
    fn tissue_fraction(&self, tile: &Tile) -> f64;
}

/// Every tile has the same tissue fraction.
#[derive(Copy, Clone, Debug)]
pub struct UniformTissue(pub f64);

impl TissueMask for UniformTissue {
    fn tissue_fraction(&self, _tile: &Tile) -> f64 {
        self.0
    }
}

/// Binary tissue raster at reduced resolution: mask pixel `[row, col]`
/// covers slide pixels `[col * d, (col + 1) * d) x [row * d, (row + 1) * d)`.
/// Slide area outside the raster counts as no tissue.
#[derive(Clone, Debug)]
pub struct BinaryTissueMask {
    mask: Array2<bool>,
    downsample: f64,
}

impl BinaryTissueMask {
    pub fn new(mask: Array2<bool>, downsample: f64) -> Result<Self> {
        if !(downsample > 0.0 && downsample.is_finite()) {
            return Err(FollicleError::InvalidTileGrid(format!(
                "tissue mask downsample factor must be positive, got {}",
                downsample
            )));
        }
        Ok(BinaryTissueMask { mask, downsample })
    }
}

impl TissueMask for BinaryTissueMask {
    fn tissue_fraction(&self, tile: &Tile) -> f64 {
        let d = self.downsample;
        let (nrows, ncols) = self.mask.dim();
        let rect = tile.rect();
        let (x0, y0, x1, y1) = (rect.min().x, rect.min().y, rect.max().x, rect.max().y);

        let col_range = (x0 / d).floor() as usize..((x1 / d).ceil() as usize).min(ncols);
        let row_range = (y0 / d).floor() as usize..((y1 / d).ceil() as usize).min(nrows);

        let mut covered = 0.0;
        for row in row_range {
            let overlap_y = (y1.min((row + 1) as f64 * d) - y0.max(row as f64 * d)).max(0.0);
            if overlap_y == 0.0 {
                continue;
            }
            for col in col_range.clone() {
                if self.mask[[row, col]] {
                    let overlap_x = (x1.min((col + 1) as f64 * d) - x0.max(col as f64 * d)).max(0.0);
                    covered += overlap_x * overlap_y;
                }
            }
        }
        (covered / tile.area()).clamp(0.0, 1.0)
    }
}

/// Precomputed tissue ratios keyed by tile origin. Tiles missing from the
/// table count as no tissue.
#[derive(Clone, Debug, Default)]
pub struct TissueRatioTable {
    ratios: HashMap<(u32, u32), f64>,
}

impl TissueRatioTable {
    pub fn new() -> Self {
        TissueRatioTable::default()
    }

    pub fn insert(&mut self, x: u32, y: u32, ratio: f64) {
        self.ratios.insert((x, y), ratio);
    }

    pub fn len(&self) -> usize {
        self.ratios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ratios.is_empty()
    }
}

impl TissueMask for TissueRatioTable {
    fn tissue_fraction(&self, tile: &Tile) -> f64 {
        self.ratios
            .get(&(tile.x, tile.y))
            .copied()
            .unwrap_or(0.0)
            .clamp(0.0, 1.0)
    }
}

/// Read a `x,y,tissue_ratio` table (optionally gzipped).
pub fn read_tissue_ratios(path: &Path) -> Result<TissueRatioTable> {
    let mut rdr = open_csv_reader(path)?;
    let headers = rdr.headers()?.clone();
    let x_col = find_column(&headers, "x", path)?;
    let y_col = find_column(&headers, "y", path)?;
    let ratio_col = find_column(&headers, "tissue_ratio", path)?;

    let mut table = TissueRatioTable::new();
    for result in rdr.records() {
        let row = result?;
        let x: u32 = parse_field(&row, x_col, "x", path)?;
        let y: u32 = parse_field(&row, y_col, "y", path)?;
        let ratio: f64 = parse_field(&row, ratio_col, "tissue_ratio", path)?;
        if !ratio.is_finite() {
            return Err(FollicleError::InvalidTable {
                path: path.display().to_string(),
                reason: format!("non-finite tissue_ratio for tile {},{}", x, y),
            });
        }
        table.insert(x, y, ratio);
    }
    debug!("Read {} tissue ratios from {}", table.len(), path.display());
    Ok(table)
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct GridParams {
    pub tile_size: u32,
    pub stride: u32,
    /// Tiles need strictly more tissue than this.
    pub min_tissue_ratio: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TileGrid {
    pub slide_id: String,
    pub species: String,
    pub tile_size: u32,
    pub stride: u32,
    /// Retained tiles in row-major order.
    pub tiles: Vec<Tile>,
}

impl TileGrid {
    /// (column, row) of a tile on the stride lattice.
    pub fn grid_position(&self, tile: &Tile) -> (u32, u32) {
        (tile.x / self.stride, tile.y / self.stride)
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Tile index by origin.
    pub fn index(&self) -> HashMap<(u32, u32), usize> {
        self.tiles
            .iter()
            .enumerate()
            .map(|(i, tile)| ((tile.x, tile.y), i))
            .collect()
    }
}

/// Lay tiles on a raster from the slide origin, stepping by the stride, and
/// keep those that fit entirely inside the slide and carry enough tissue.
pub fn generate(
    slide_id: &str,
    species: &str,
    extent: SlideExtent,
    params: &GridParams,
    mask: &dyn TissueMask,
) -> Result<TileGrid> {
    if params.tile_size == 0 {
        return Err(FollicleError::InvalidTileGrid("tile size must be positive".to_string()));
    }
    if params.stride == 0 {
        return Err(FollicleError::InvalidTileGrid("stride must be positive".to_string()));
    }
    if !(0.0..=1.0).contains(&params.min_tissue_ratio) {
        return Err(FollicleError::InvalidTileGrid(format!(
            "minimum tissue ratio must be in [0, 1], got {}",
            params.min_tissue_ratio
        )));
    }

    let t0 = Instant::now();
    let size = params.tile_size as u64;
    let stride = params.stride as u64;
    let (width, height) = (extent.width as u64, extent.height as u64);

    let mut tiles = Vec::new();
    let mut candidates = 0;
    let mut y = 0;
    while y + size <= height {
        let mut x = 0;
        while x + size <= width {
            candidates += 1;
            let tile = Tile {
                slide_id: slide_id.to_string(),
                species: species.to_string(),
                x: x as u32,
                y: y as u32,
                size: params.tile_size,
            };
            if mask.tissue_fraction(&tile) > params.min_tissue_ratio {
                tiles.push(tile);
            }
            x += stride;
        }
        y += stride;
    }

    if candidates == 0 {
        debug!(
            "Slide {} ({}x{}) is smaller than one {}px tile",
            slide_id, extent.width, extent.height, params.tile_size
        );
    }
    info!(
        "Slide {}: kept {} of {} tiles with tissue ratio > {}",
        slide_id,
        tiles.len(),
        candidates,
        params.min_tissue_ratio
    );
    trace!("tile grid for {}: {:?}", slide_id, t0.elapsed());

    Ok(TileGrid {
        slide_id: slide_id.to_string(),
        species: species.to_string(),
        tile_size: params.tile_size,
        stride: params.stride,
        tiles,
    })
}
