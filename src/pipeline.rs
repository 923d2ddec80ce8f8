// Per-slide processing: import, validate, tile and label. Slides are
// independent and are processed in parallel.

use indicatif::{ProgressBar, ProgressStyle};
use log::{info, trace};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::annotation::{read_annotations, Annotation};
use crate::diagnostics::Diagnostics;
use crate::errors::{FollicleError, Result};
use crate::manifest::{SlideManifest, TileManifest};
use crate::mapper::OverlapMapper;
use crate::species::{SpeciesRegistry, ThresholdOverrides};
use crate::tables::{find_column, find_optional_column, open_csv_reader, parse_field};
use crate::tiles::{generate, read_tissue_ratios, GridParams, SlideExtent, TissueMask, UniformTissue};
use crate::validate::{screen_annotations, write_annotations_geojson, PixelScale};

/// One row of the slide sheet.
#[derive(Clone, Debug, PartialEq)]
pub struct SlideEntry {
    pub slide_id: String,
    pub species: String,
    pub extent: SlideExtent,
    pub annotations: PathBuf,
    /// Per-tile tissue ratios; every tile counts as tissue when absent.
    pub tissue_ratios: Option<PathBuf>,
    pub microns_per_pixel: Option<f64>,
}

/// Run-wide settings layered over each species profile.
#[derive(Clone, Debug, Default)]
pub struct RunSettings {
    pub tile_size: Option<u32>,
    pub stride: Option<u32>,
    pub thresholds: ThresholdOverrides,
    pub scale: Option<PixelScale>,
    /// Directory for validated annotation GeoJSON, one file per slide.
    pub validated_dir: Option<PathBuf>,
}

pub struct SlideOutcome {
    pub manifest: SlideManifest,
    pub diagnostics: Diagnostics,
}

fn resolve_path(base: &Path, value: &str) -> PathBuf {
    let path = PathBuf::from(value);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Read the slide sheet: `slide_id, species, width, height, annotations`
/// plus optional `tissue_ratios` and `microns_per_pixel` columns. Relative
/// paths are taken relative to the sheet. Species names are resolved through
/// the registry, so aliases are accepted.
pub fn read_slide_sheet(path: &Path, registry: &SpeciesRegistry) -> Result<Vec<SlideEntry>> {
    let mut rdr = open_csv_reader(path)?;
    let headers = rdr.headers()?.clone();
    let slide_col = find_column(&headers, "slide_id", path)?;
    let species_col = find_column(&headers, "species", path)?;
    let width_col = find_column(&headers, "width", path)?;
    let height_col = find_column(&headers, "height", path)?;
    let annotations_col = find_column(&headers, "annotations", path)?;
    let tissue_col = find_optional_column(&headers, "tissue_ratios");
    let mpp_col = find_optional_column(&headers, "microns_per_pixel");

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let mut slides: Vec<SlideEntry> = Vec::new();
    for result in rdr.records() {
        let row = result?;
        let slide_id = row.get(slide_col).unwrap_or("").to_string();
        if slide_id.is_empty() {
            return Err(FollicleError::InvalidTable {
                path: path.display().to_string(),
                reason: "empty slide_id".to_string(),
            });
        }
        if slides.iter().any(|s| s.slide_id == slide_id) {
            return Err(FollicleError::InvalidTable {
                path: path.display().to_string(),
                reason: format!("slide '{}' is listed twice", slide_id),
            });
        }

        let species_name = row.get(species_col).unwrap_or("");
        let species = registry
            .resolve(species_name)
            .ok_or_else(|| FollicleError::UnknownSpecies(species_name.to_string()))?
            .to_string();

        let optional = |col: Option<usize>| {
            col.and_then(|c| row.get(c))
                .filter(|v| !v.is_empty())
        };

        let microns_per_pixel: Option<f64> = match mpp_col {
            Some(col) if optional(Some(col)).is_some() => {
                Some(parse_field(&row, col, "microns_per_pixel", path)?)
            }
            _ => None,
        };
        if let Some(per_pixel) = microns_per_pixel {
            if PixelScale::microns(per_pixel).validate().is_err() {
                return Err(FollicleError::InvalidTable {
                    path: path.display().to_string(),
                    reason: format!("slide '{}' has invalid microns_per_pixel {}", slide_id, per_pixel),
                });
            }
        }

        slides.push(SlideEntry {
            slide_id,
            species,
            extent: SlideExtent {
                width: parse_field(&row, width_col, "width", path)?,
                height: parse_field(&row, height_col, "height", path)?,
            },
            annotations: resolve_path(base, row.get(annotations_col).unwrap_or("")),
            tissue_ratios: optional(tissue_col).map(|v| resolve_path(base, v)),
            microns_per_pixel,
        });
    }

    info!("Read {} slides from {}", slides.len(), path.display());
    Ok(slides)
}

/// Validate, tile and label one slide from annotations already in memory.
pub fn process_slide(
    slide: &SlideEntry,
    annotations: Vec<Annotation>,
    mask: &dyn TissueMask,
    registry: &SpeciesRegistry,
    settings: &RunSettings,
) -> Result<SlideOutcome> {
    let t0 = Instant::now();
    let profile = registry.get(&slide.species)?;
    let thresholds = profile.thresholds.with_overrides(&settings.thresholds);
    thresholds.validate(&profile.code)?;

    let scale = match (slide.microns_per_pixel, settings.scale) {
        (Some(per_pixel), _) => PixelScale::microns(per_pixel),
        (None, Some(scale)) => scale,
        (None, None) => PixelScale {
            unit: profile.size_units,
            per_pixel: 1.0,
        },
    };
    scale.validate()?;

    let mut diagnostics = Diagnostics::new();
    let screened = screen_annotations(annotations, registry, &scale, &mut diagnostics)?;
    if let Some(dir) = &settings.validated_dir {
        let path = dir.join(format!("{}.geojson", slide.slide_id));
        write_annotations_geojson(&path, &screened)?;
    }
    let kept: Vec<Annotation> = screened
        .into_iter()
        .filter(|v| !v.is_rejected())
        .map(|v| v.annotation)
        .collect();
    trace!("validation {}: {:?}", slide.slide_id, t0.elapsed());

    let tile_size = settings.tile_size.unwrap_or(profile.tile_size);
    let params = GridParams {
        tile_size,
        stride: settings.stride.unwrap_or(tile_size),
        min_tissue_ratio: thresholds.min_tissue_ratio,
    };
    let grid = generate(&slide.slide_id, &profile.code, slide.extent, &params, mask)?;

    let tiles = OverlapMapper::new(registry)
        .with_overrides(settings.thresholds)
        .map_grid(&grid, &kept, &mut diagnostics);

    trace!("slide {}: {:?}", slide.slide_id, t0.elapsed());
    Ok(SlideOutcome {
        manifest: SlideManifest::new(&grid, tiles),
        diagnostics,
    })
}

/// Read one slide's inputs from disk and process it.
pub fn run_slide(slide: &SlideEntry, registry: &SpeciesRegistry, settings: &RunSettings) -> Result<SlideOutcome> {
    let mut diagnostics = Diagnostics::new();
    let annotations = read_annotations(&slide.annotations, &slide.slide_id, &slide.species, &mut diagnostics)?;
    let mut outcome = match &slide.tissue_ratios {
        Some(path) => {
            let table = read_tissue_ratios(path)?;
            process_slide(slide, annotations, &table, registry, settings)?
        }
        None => process_slide(slide, annotations, &UniformTissue(1.0), registry, settings)?,
    };
    diagnostics.extend(outcome.diagnostics);
    outcome.diagnostics = diagnostics;
    Ok(outcome)
}

/// Process every slide in parallel. Outputs and diagnostics come back in
/// slide sheet order; the first failing slide aborts the run.
pub fn run(
    slides: &[SlideEntry],
    registry: &SpeciesRegistry,
    settings: &RunSettings,
) -> Result<(TileManifest, Diagnostics)> {
    let progress = ProgressBar::new(slides.len() as u64);
    progress.set_style(
        ProgressStyle::with_template("{prefix:>12} {bar:40} {pos}/{len} slides {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    progress.set_prefix("Labelling");

    let outcomes: Vec<Result<SlideOutcome>> = slides
        .par_iter()
        .map(|slide| {
            let outcome = run_slide(slide, registry, settings);
            progress.inc(1);
            outcome
        })
        .collect();
    progress.finish_and_clear();

    let mut manifest = TileManifest::new();
    let mut diagnostics = Diagnostics::new();
    for outcome in outcomes {
        let outcome = outcome?;
        manifest.push(outcome.manifest);
        diagnostics.extend(outcome.diagnostics);
    }
    Ok((manifest, diagnostics))
}
