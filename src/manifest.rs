// The labelled tile manifest handed to the classifier, and its review sample.

use itertools::Itertools;
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::path::Path;

use crate::annotation::{SourceId, ID_LIST_SEPARATOR};
use crate::errors::{FollicleError, Result};
use crate::mapper::{Contribution, LabeledTile};
use crate::species::BACKGROUND_LABEL;
use crate::tables::{create_csv_writer, find_column, open_csv_reader, parse_field};
use crate::tiles::{Tile, TileGrid};

pub const DEFAULT_REVIEW_SEED: u64 = 42;

const MANIFEST_COLUMNS: [&str; 11] = [
    "slide_id",
    "species",
    "x",
    "y",
    "tile_size",
    "stride",
    "label",
    "confidence",
    "downgraded",
    "annotation_ids",
    "overlap_fractions",
];

/// Labelled tiles of one slide plus the grid parameters they were cut with.
#[derive(Clone, Debug, PartialEq)]
pub struct SlideManifest {
    pub slide_id: String,
    pub species: String,
    pub tile_size: u32,
    pub stride: u32,
    pub tiles: Vec<LabeledTile>,
}

impl SlideManifest {
    pub fn new(grid: &TileGrid, tiles: Vec<LabeledTile>) -> Self {
        SlideManifest {
            slide_id: grid.slide_id.clone(),
            species: grid.species.clone(),
            tile_size: grid.tile_size,
            stride: grid.stride,
            tiles,
        }
    }

    pub fn grid(&self) -> TileGrid {
        TileGrid {
            slide_id: self.slide_id.clone(),
            species: self.species.clone(),
            tile_size: self.tile_size,
            stride: self.stride,
            tiles: self.tiles.iter().map(|t| t.tile.clone()).collect(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TileManifest {
    pub slides: Vec<SlideManifest>,
}

impl TileManifest {
    pub fn new() -> Self {
        TileManifest::default()
    }

    pub fn push(&mut self, slide: SlideManifest) {
        self.slides.push(slide);
    }

    pub fn tiles(&self) -> impl Iterator<Item = &LabeledTile> {
        self.slides.iter().flat_map(|s| s.tiles.iter())
    }

    pub fn len(&self) -> usize {
        self.slides.iter().map(|s| s.tiles.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn label_counts(&self) -> BTreeMap<String, usize> {
        self.tiles()
            .map(|t| t.label.clone())
            .counts()
            .into_iter()
            .collect()
    }

    /// Up to `n` tiles drawn without replacement with a fixed seed, least
    /// confident first. Background tiles are not sampled.
    pub fn review_sample(&self, n: usize, seed: u64) -> Vec<&LabeledTile> {
        let positives: Vec<&LabeledTile> = self.tiles().filter(|t| !t.is_background()).collect();
        let n = n.min(positives.len());

        let mut rng = StdRng::seed_from_u64(seed);
        let mut sample: Vec<&LabeledTile> = rand::seq::index::sample(&mut rng, positives.len(), n)
            .into_iter()
            .map(|i| positives[i])
            .collect();
        sample.sort_by(|a, b| {
            a.confidence
                .total_cmp(&b.confidence)
                .then_with(|| a.tile.id().cmp(&b.tile.id()))
        });
        sample
    }

    pub fn log_summary(&self) {
        info!(
            "Manifest: {} tiles over {} slides",
            self.len(),
            self.slides.len()
        );
        for (label, count) in self.label_counts() {
            info!("  {}: {}", label, count);
        }
    }
}

fn write_rows<'a>(path: &Path, slide_tiles: impl Iterator<Item = (&'a SlideManifest, &'a LabeledTile)>) -> Result<()> {
    let mut writer = create_csv_writer(path)?;
    writer.write_record(MANIFEST_COLUMNS)?;
    for (slide, labeled) in slide_tiles {
        let tile = &labeled.tile;
        if let Some(c) = labeled
            .contributors
            .iter()
            .find(|c| c.source.annotation_id.contains(ID_LIST_SEPARATOR))
        {
            return Err(FollicleError::InvalidTable {
                path: path.display().to_string(),
                reason: format!("annotation id '{}' contains '{}'", c.source, ID_LIST_SEPARATOR),
            });
        }
        let separator = ID_LIST_SEPARATOR.to_string();
        let annotation_ids = labeled
            .contributors
            .iter()
            .map(|c| c.source.annotation_id.as_str())
            .join(&separator);
        let overlaps = labeled.contributors.iter().map(|c| c.overlap).join(&separator);
        writer.write_record([
            tile.slide_id.as_str(),
            tile.species.as_str(),
            &tile.x.to_string(),
            &tile.y.to_string(),
            &tile.size.to_string(),
            &slide.stride.to_string(),
            labeled.label.as_str(),
            &labeled.confidence.to_string(),
            &labeled.downgraded.to_string(),
            &annotation_ids,
            &overlaps,
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Write the manifest as CSV, gzipped when the path ends in `.gz`.
pub fn write_manifest(path: &Path, manifest: &TileManifest) -> Result<()> {
    write_rows(
        path,
        manifest
            .slides
            .iter()
            .flat_map(|slide| slide.tiles.iter().map(move |t| (slide, t))),
    )?;
    info!("Wrote {} manifest rows to {}", manifest.len(), path.display());
    Ok(())
}

/// Write a review sample in the manifest's format.
pub fn write_review_sample(path: &Path, manifest: &TileManifest, n: usize, seed: u64) -> Result<()> {
    let sample = manifest.review_sample(n, seed);
    let slide_of = |tile: &LabeledTile| {
        manifest
            .slides
            .iter()
            .find(|s| s.slide_id == tile.tile.slide_id)
    };
    let rows: Vec<(&SlideManifest, &LabeledTile)> = sample
        .into_iter()
        .filter_map(|t| slide_of(t).map(|s| (s, t)))
        .collect();
    write_rows(path, rows.into_iter())?;
    info!("Wrote review sample to {}", path.display());
    Ok(())
}

fn split_list(field: &str) -> Vec<&str> {
    if field.is_empty() {
        Vec::new()
    } else {
        field.split(ID_LIST_SEPARATOR).collect()
    }
}

/// Read a manifest back, grouping rows by slide in order of first appearance.
pub fn read_manifest(path: &Path) -> Result<TileManifest> {
    let mut rdr = open_csv_reader(path)?;
    let headers = rdr.headers()?.clone();
    let cols: Vec<usize> = MANIFEST_COLUMNS
        .iter()
        .map(|column| find_column(&headers, column, path))
        .collect::<Result<_>>()?;
    let invalid = |reason: String| FollicleError::InvalidTable {
        path: path.display().to_string(),
        reason,
    };

    let mut manifest = TileManifest::new();
    for result in rdr.records() {
        let row = result?;
        let field = |i: usize| row.get(cols[i]).unwrap_or("");

        let slide_id = field(0).to_string();
        let species = field(1).to_string();
        let x: u32 = parse_field(&row, cols[2], "x", path)?;
        let y: u32 = parse_field(&row, cols[3], "y", path)?;
        let tile_size: u32 = parse_field(&row, cols[4], "tile_size", path)?;
        let stride: u32 = parse_field(&row, cols[5], "stride", path)?;
        let label = field(6).to_string();
        let confidence: f64 = parse_field(&row, cols[7], "confidence", path)?;
        let downgraded: bool = parse_field(&row, cols[8], "downgraded", path)?;

        let ids = split_list(field(9));
        let overlaps = split_list(field(10))
            .into_iter()
            .map(|v| v.parse::<f64>().map_err(|_| invalid(format!("invalid overlap fraction '{}'", v))))
            .collect::<Result<Vec<f64>>>()?;
        if ids.len() != overlaps.len() {
            return Err(invalid(format!(
                "tile {}:{}:{} lists {} annotations but {} overlap fractions",
                slide_id,
                x,
                y,
                ids.len(),
                overlaps.len()
            )));
        }

        let slide = match manifest.slides.iter_mut().position(|s| s.slide_id == slide_id) {
            Some(i) => &mut manifest.slides[i],
            None => {
                manifest.slides.push(SlideManifest {
                    slide_id: slide_id.clone(),
                    species: species.clone(),
                    tile_size,
                    stride,
                    tiles: Vec::new(),
                });
                let last = manifest.slides.len() - 1;
                &mut manifest.slides[last]
            }
        };
        if slide.tile_size != tile_size || slide.stride != stride {
            return Err(invalid(format!(
                "slide {} mixes tile sizes or strides",
                slide_id
            )));
        }

        // contributor classes are not part of the manifest
        let contributors = ids
            .into_iter()
            .zip(overlaps)
            .map(|(id, overlap)| Contribution {
                source: SourceId::new(&slide_id, id),
                label: String::new(),
                overlap,
            })
            .collect();

        slide.tiles.push(LabeledTile {
            tile: Tile {
                slide_id,
                species,
                x,
                y,
                size: tile_size,
            },
            label: if label.is_empty() { BACKGROUND_LABEL.to_string() } else { label },
            confidence,
            contributors,
            downgraded,
        });
    }

    Ok(manifest)
}

/// Tile grids recorded in a manifest, for mapping predictions back.
pub fn read_tile_grids(path: &Path) -> Result<Vec<TileGrid>> {
    let manifest = read_manifest(path)?;
    let grids: Vec<TileGrid> = manifest.slides.iter().map(|s| s.grid()).collect();
    info!(
        "Read {} tile grids ({} tiles) from {}",
        grids.len(),
        manifest.len(),
        path.display()
    );
    Ok(grids)
}
