// Annotation-to-tile overlap mapping and per-tile label resolution.

use geo::geometry::{Coord, Rect};
use itertools::Itertools;
use log::{info, trace};
use rayon::prelude::*;
use rstar::{RTree, RTreeObject, AABB};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::time::Instant;
use thread_local::ThreadLocal;

use crate::annotation::{Annotation, SourceId};
use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
use crate::polygon_area::{bounding_rect, open_ring, rects_overlap, ClipBuffers};
use crate::species::{SpeciesProfile, SpeciesRegistry, ThresholdOverrides, BACKGROUND_LABEL};
use crate::tiles::{Tile, TileGrid};

/// Class totals closer than this are treated as tied.
pub const TIE_TOLERANCE: f64 = 1e-9;

#[derive(Clone, Debug, PartialEq)]
pub struct Contribution {
    pub source: SourceId,
    pub label: String,
    /// Intersection area divided by tile area.
    pub overlap: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LabeledTile {
    pub tile: Tile,
    pub label: String,
    pub confidence: f64,
    pub contributors: Vec<Contribution>,
    /// Relabelled background by the minimum-confidence rule.
    pub downgraded: bool,
}

impl LabeledTile {
    fn background(tile: Tile) -> Self {
        LabeledTile {
            tile,
            label: BACKGROUND_LABEL.to_string(),
            confidence: 0.0,
            contributors: Vec::new(),
            downgraded: false,
        }
    }

    pub fn is_background(&self) -> bool {
        self.label == BACKGROUND_LABEL
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Resolution {
    pub label: String,
    pub confidence: f64,
    /// Winning class and confidence when they were demoted to background.
    pub demoted: Option<(String, f64)>,
}

/// Resolve a tile's label from its contributors.
///
/// One class: the highest single overlap among its contributors. Several
/// classes: the class with the largest summed overlap, with confidence equal
/// to its share of the summed overlap of all classes. Equal totals go to the
/// class ranked first in the profile's priority order. A winner below
/// `min_confidence` becomes background.
pub fn resolve_label(contributors: &[Contribution], profile: &SpeciesProfile, min_confidence: f64) -> Resolution {
    if contributors.is_empty() {
        return Resolution {
            label: BACKGROUND_LABEL.to_string(),
            confidence: 0.0,
            demoted: None,
        };
    }

    // (label, total overlap, max overlap) in order of first appearance
    let mut classes: Vec<(&str, f64, f64)> = Vec::new();
    for contribution in contributors {
        match classes.iter_mut().find(|class| class.0 == contribution.label) {
            Some(class) => {
                class.1 += contribution.overlap;
                class.2 = class.2.max(contribution.overlap);
            }
            None => classes.push((contribution.label.as_str(), contribution.overlap, contribution.overlap)),
        }
    }

    let (label, confidence) = if classes.len() == 1 {
        (classes[0].0, classes[0].2)
    } else {
        let total: f64 = classes.iter().map(|(_, class_total, _)| class_total).sum();
        let best = classes
            .iter()
            .map(|(_, class_total, _)| *class_total)
            .fold(f64::NEG_INFINITY, f64::max);
        let (label, class_total, _) = classes
            .iter()
            .filter(|(_, class_total, _)| best - class_total <= TIE_TOLERANCE)
            .min_by(|a, b| profile.compare_priority(a.0, b.0))
            .copied()
            .unwrap_or(classes[0]);
        (label, if total > 0.0 { class_total / total } else { 0.0 })
    };
    let confidence = confidence.clamp(0.0, 1.0);

    if confidence < min_confidence {
        Resolution {
            label: BACKGROUND_LABEL.to_string(),
            confidence: 0.0,
            demoted: Some((label.to_string(), confidence)),
        }
    } else {
        Resolution {
            label: label.to_string(),
            confidence,
            demoted: None,
        }
    }
}

// Polygon rings prepared once per slide for repeated clipping.
struct PreparedAnnotation<'a> {
    source: &'a SourceId,
    species: &'a str,
    label: &'a str,
    exterior: Vec<Coord<f64>>,
    holes: Vec<Vec<Coord<f64>>>,
    bbox: Rect<f64>,
}

// Annotation bounding box stored in the R-tree.
struct IndexedBox {
    aabb: AABB<[f64; 2]>,
    index: usize,
}

impl RTreeObject for IndexedBox {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.aabb
    }
}

fn rect_aabb(rect: &Rect<f64>) -> AABB<[f64; 2]> {
    AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y])
}

// R-tree over annotation bounding boxes.
struct AnnotationIndex {
    tree: RTree<IndexedBox>,
}

impl AnnotationIndex {
    fn new(annotations: &[PreparedAnnotation]) -> Self {
        let boxes = annotations
            .iter()
            .enumerate()
            .map(|(index, annotation)| IndexedBox {
                aabb: rect_aabb(&annotation.bbox),
                index,
            })
            .collect();
        AnnotationIndex {
            tree: RTree::bulk_load(boxes),
        }
    }

    // Candidate annotation indices in import order.
    fn query(&self, rect: &Rect<f64>, out: &mut Vec<usize>) {
        out.clear();
        out.extend(
            self.tree
                .locate_in_envelope_intersecting(&rect_aabb(rect))
                .map(|b| b.index),
        );
        out.sort_unstable();
    }
}

#[derive(Default)]
struct MapperScratch {
    clip: ClipBuffers,
    candidates: Vec<usize>,
}

pub struct OverlapMapper<'a> {
    registry: &'a SpeciesRegistry,
    overrides: ThresholdOverrides,
}

impl<'a> OverlapMapper<'a> {
    pub fn new(registry: &'a SpeciesRegistry) -> Self {
        OverlapMapper {
            registry,
            overrides: ThresholdOverrides::default(),
        }
    }

    pub fn with_overrides(mut self, overrides: ThresholdOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Label every tile of `grid`. Only annotations from the grid's slide are
    /// considered; they are expected to have passed validation. Output order
    /// follows tile order.
    pub fn map_grid(
        &self,
        grid: &TileGrid,
        annotations: &[Annotation],
        diagnostics: &mut Diagnostics,
    ) -> Vec<LabeledTile> {
        let t0 = Instant::now();

        let prepared: Vec<PreparedAnnotation> = annotations
            .iter()
            .filter(|a| a.source.slide_id == grid.slide_id)
            .filter_map(|annotation| {
                let polygon = annotation.polygon()?;
                let label = annotation.label.as_deref()?;
                let exterior = open_ring(polygon.exterior());
                let bbox = bounding_rect(&exterior)?;
                Some(PreparedAnnotation {
                    source: &annotation.source,
                    species: &annotation.species,
                    label,
                    exterior,
                    holes: polygon.interiors().iter().map(open_ring).collect(),
                    bbox,
                })
            })
            .collect();

        let index = AnnotationIndex::new(&prepared);

        let scratch = ThreadLocal::new();
        let labeled: Vec<(LabeledTile, Vec<Diagnostic>)> = grid
            .tiles
            .par_iter()
            .map(|tile| {
                let mut scratch = scratch
                    .get_or(|| RefCell::new(MapperScratch::default()))
                    .borrow_mut();
                self.map_tile(tile, &prepared, &index, &mut scratch)
            })
            .collect();

        // report each mismatched annotation once per tile species
        let mut reported: HashSet<(String, String)> = HashSet::new();
        let mut tiles = Vec::with_capacity(labeled.len());
        for (tile, tile_diagnostics) in labeled {
            for diagnostic in tile_diagnostics {
                if diagnostic.kind == DiagnosticKind::SpeciesMismatch {
                    let key = (
                        diagnostic.source_id.clone().unwrap_or_default(),
                        tile.tile.species.clone(),
                    );
                    if !reported.insert(key) {
                        continue;
                    }
                }
                diagnostics.record(diagnostic);
            }
            tiles.push(tile);
        }

        let counts = label_distribution(&tiles);
        info!(
            "Slide {}: labelled {} tiles from {} annotations: {:?}",
            grid.slide_id,
            tiles.len(),
            prepared.len(),
            counts
        );
        trace!("mapping {}: {:?}", grid.slide_id, t0.elapsed());

        tiles
    }

    fn map_tile(
        &self,
        tile: &Tile,
        annotations: &[PreparedAnnotation],
        index: &AnnotationIndex,
        scratch: &mut MapperScratch,
    ) -> (LabeledTile, Vec<Diagnostic>) {
        let mut diagnostics = Vec::new();
        let tile_id = tile.id();

        let profile = match self.registry.get(&tile.species) {
            Ok(profile) => profile,
            Err(err) => {
                diagnostics.push(
                    Diagnostic::new(DiagnosticKind::UnknownSpecies, &tile.slide_id, err.to_string())
                        .with_tile(&tile_id),
                );
                return (LabeledTile::background(tile.clone()), diagnostics);
            }
        };
        let thresholds = profile.thresholds.with_overrides(&self.overrides);

        let rect = tile.rect();
        let tile_area = tile.area();
        let mut contributors = Vec::new();

        let MapperScratch { clip, candidates } = scratch;
        index.query(&rect, candidates);
        for &i in candidates.iter() {
            let candidate = &annotations[i];
            if !rects_overlap(&candidate.bbox, &rect) {
                continue;
            }

            if candidate.species != tile.species {
                diagnostics.push(
                    Diagnostic::new(
                        DiagnosticKind::SpeciesMismatch,
                        &tile.slide_id,
                        format!(
                            "annotation species '{}' does not match tile species '{}'",
                            candidate.species, tile.species
                        ),
                    )
                    .with_source(candidate.source)
                    .with_tile(&tile_id),
                );
                continue;
            }

            let area = clip.clipped_polygon_area(&candidate.exterior, &candidate.holes, &rect);
            let overlap = (area / tile_area).min(1.0);
            if overlap > 0.0 && overlap >= thresholds.min_overlap {
                contributors.push(Contribution {
                    source: candidate.source.clone(),
                    label: candidate.label.to_string(),
                    overlap,
                });
            }
        }

        let resolution = resolve_label(&contributors, profile, thresholds.min_confidence);
        let downgraded = match &resolution.demoted {
            Some((label, confidence)) => {
                diagnostics.push(
                    Diagnostic::new(
                        DiagnosticKind::LowConfidenceDowngrade,
                        &tile.slide_id,
                        format!(
                            "'{}' at confidence {:.4} is below {}; relabelled {}",
                            label, confidence, thresholds.min_confidence, BACKGROUND_LABEL
                        ),
                    )
                    .with_tile(&tile_id),
                );
                true
            }
            None => false,
        };

        (
            LabeledTile {
                tile: tile.clone(),
                label: resolution.label,
                confidence: resolution.confidence,
                contributors,
                downgraded,
            },
            diagnostics,
        )
    }
}

pub fn label_distribution(tiles: &[LabeledTile]) -> BTreeMap<String, usize> {
    tiles
        .iter()
        .map(|t| t.label.clone())
        .counts()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::species::testing::{mouse_profile, registry_with};
    use crate::species::Thresholds;
    use crate::tiles::{generate, GridParams, SlideExtent, UniformTissue};
    use geo::geometry::{LineString, Polygon};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn rect_annotation(id: &str, label: &str, x0: f64, y0: f64, x1: f64, y1: f64) -> Annotation {
        Annotation::new(
            SourceId::new("slide", id),
            "mouse",
            label,
            Polygon::new(
                LineString::from(vec![(x0, y0), (x1, y0), (x1, y1), (x0, y1)]),
                vec![],
            ),
        )
    }

    fn grid(width: u32, height: u32) -> TileGrid {
        generate(
            "slide",
            "mouse",
            SlideExtent { width, height },
            &GridParams {
                tile_size: 100,
                stride: 100,
                min_tissue_ratio: 0.0,
            },
            &UniformTissue(1.0),
        )
        .unwrap()
    }

    fn contribution(id: &str, label: &str, overlap: f64) -> Contribution {
        Contribution {
            source: SourceId::new("slide", id),
            label: label.to_string(),
            overlap,
        }
    }

    fn map(annotations: &[Annotation], grid: &TileGrid) -> (Vec<LabeledTile>, Diagnostics) {
        let registry = registry_with(vec![mouse_profile()]);
        let mut diagnostics = Diagnostics::new();
        let tiles = OverlapMapper::new(&registry).map_grid(grid, annotations, &mut diagnostics);
        (tiles, diagnostics)
    }

    #[test]
    fn test_empty_tiles_are_background_with_zero_confidence() {
        let (tiles, diagnostics) = map(&[rect_annotation("a", "primary", 0.0, 0.0, 100.0, 100.0)], &grid(300, 100));
        assert_eq!(tiles.len(), 3);
        for tile in &tiles[1..] {
            assert_eq!(tile.label, BACKGROUND_LABEL);
            assert_eq!(tile.confidence, 0.0);
            assert!(tile.contributors.is_empty());
        }
        assert!(diagnostics.is_empty());
    }

    #[test]
    fn test_full_containment_gives_full_confidence() {
        let (tiles, _) = map(&[rect_annotation("a", "antral", -50.0, -50.0, 150.0, 150.0)], &grid(100, 100));
        assert_eq!(tiles[0].label, "antral");
        assert_eq!(tiles[0].confidence, 1.0);
        assert_eq!(tiles[0].contributors[0].overlap, 1.0);
    }

    #[test]
    fn test_overlap_is_relative_to_tile_area() {
        // huge annotation that clips a quarter of the tile
        let (tiles, _) = map(
            &[rect_annotation("a", "antral", -10000.0, -10000.0, 50.0, 50.0)],
            &grid(100, 100),
        );
        assert_eq!(tiles[0].contributors[0].overlap, 0.25);
        assert_eq!(tiles[0].confidence, 0.25);
    }

    #[test]
    fn test_min_overlap_boundary_is_inclusive() {
        // 5 x 100 strip is exactly 5% of a 100 x 100 tile
        let (tiles, _) = map(&[rect_annotation("a", "primary", 0.0, 0.0, 5.0, 100.0)], &grid(100, 100));
        assert_eq!(tiles[0].label, "primary");
        assert_eq!(tiles[0].contributors.len(), 1);
        assert_eq!(tiles[0].contributors[0].overlap, 0.05);

        let (tiles, _) = map(&[rect_annotation("a", "primary", 0.0, 0.0, 4.99, 100.0)], &grid(100, 100));
        assert_eq!(tiles[0].label, BACKGROUND_LABEL);
        assert!(tiles[0].contributors.is_empty());
    }

    #[test]
    fn test_edge_touch_does_not_contribute() {
        let (tiles, _) = map(&[rect_annotation("a", "primary", 100.0, 0.0, 200.0, 100.0)], &grid(100, 100));
        assert!(tiles[0].contributors.is_empty());
    }

    #[test]
    fn test_same_class_uses_max_overlap() {
        let profile = mouse_profile();
        let resolution = resolve_label(
            &[contribution("a", "secondary", 0.3), contribution("b", "secondary", 0.4)],
            &profile,
            0.05,
        );
        assert_eq!(resolution.label, "secondary");
        assert_eq!(resolution.confidence, 0.4);
    }

    #[test]
    fn test_multi_class_uses_total_share() {
        let profile = mouse_profile();
        let resolution = resolve_label(
            &[
                contribution("a", "primary", 0.2),
                contribution("b", "primary", 0.3),
                contribution("c", "antral", 0.25),
            ],
            &profile,
            0.05,
        );
        assert_eq!(resolution.label, "primary");
        assert!((resolution.confidence - 0.5 / 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_tie_goes_to_higher_priority() {
        let profile = mouse_profile();
        for contributors in [
            vec![contribution("a", "primary", 0.3), contribution("b", "antral", 0.3)],
            vec![contribution("b", "antral", 0.3), contribution("a", "primary", 0.3)],
        ] {
            let resolution = resolve_label(&contributors, &profile, 0.05);
            assert_eq!(resolution.label, "antral");
            assert_eq!(resolution.confidence, 0.5);
        }

        // same tie through the full mapper, in both import orders
        let a = rect_annotation("a", "primordial", 0.0, 0.0, 50.0, 100.0);
        let b = rect_annotation("b", "secondary", 50.0, 0.0, 100.0, 100.0);
        for annotations in [vec![a.clone(), b.clone()], vec![b, a]] {
            let (tiles, _) = map(&annotations, &grid(100, 100));
            assert_eq!(tiles[0].label, "secondary");
            assert_eq!(tiles[0].confidence, 0.5);
        }
    }

    #[test]
    fn test_low_confidence_is_downgraded() {
        let mut profile = mouse_profile();
        profile.thresholds = Thresholds {
            min_confidence: 0.6,
            ..Thresholds::default()
        };
        let registry = registry_with(vec![profile]);
        let annotations = [rect_annotation("a", "primary", 0.0, 0.0, 50.0, 100.0)];
        let mut diagnostics = Diagnostics::new();
        let tiles = OverlapMapper::new(&registry).map_grid(&grid(100, 100), &annotations, &mut diagnostics);

        assert_eq!(tiles[0].label, BACKGROUND_LABEL);
        assert_eq!(tiles[0].confidence, 0.0);
        assert!(tiles[0].downgraded);
        assert_eq!(tiles[0].contributors.len(), 1);
        assert_eq!(diagnostics.count(DiagnosticKind::LowConfidenceDowngrade), 1);

        // a run-level override restores the positive
        let mut diagnostics = Diagnostics::new();
        let tiles = OverlapMapper::new(&registry)
            .with_overrides(ThresholdOverrides {
                min_confidence: Some(0.5),
                ..Default::default()
            })
            .map_grid(&grid(100, 100), &annotations, &mut diagnostics);
        assert_eq!(tiles[0].label, "primary");
        assert!(!tiles[0].downgraded);
    }

    #[test]
    fn test_species_mismatch_excluded_and_reported_once() {
        let mut rat = rect_annotation("rat", "primary", 0.0, 0.0, 200.0, 100.0);
        rat.species = "rat".to_string();
        let (tiles, diagnostics) = map(&[rat], &grid(200, 100));

        assert!(tiles.iter().all(|t| t.contributors.is_empty()));
        assert!(tiles.iter().all(|t| t.label == BACKGROUND_LABEL));
        assert_eq!(diagnostics.count(DiagnosticKind::SpeciesMismatch), 1);
    }

    #[test]
    fn test_other_slides_are_ignored() {
        let mut other = rect_annotation("a", "primary", 0.0, 0.0, 100.0, 100.0);
        other.source.slide_id = "other".to_string();
        let (tiles, diagnostics) = map(&[other], &grid(100, 100));
        assert_eq!(tiles[0].label, BACKGROUND_LABEL);
        assert!(diagnostics.is_empty());
    }

    #[test]
    fn test_unknown_tile_species() {
        let mut grid = grid(100, 100);
        grid.tiles[0].species = "axolotl".to_string();
        let (tiles, diagnostics) = map(&[rect_annotation("a", "primary", 0.0, 0.0, 100.0, 100.0)], &grid);
        assert_eq!(tiles[0].label, BACKGROUND_LABEL);
        assert_eq!(diagnostics.count(DiagnosticKind::UnknownSpecies), 1);
    }

    #[test]
    fn test_hole_reduces_overlap() {
        let annotation = Annotation::new(
            SourceId::new("slide", "ring"),
            "mouse",
            "antral",
            Polygon::new(
                LineString::from(vec![(0.0, 0.0), (100.0, 0.0), (100.0, 100.0), (0.0, 100.0)]),
                vec![LineString::from(vec![(25.0, 25.0), (75.0, 25.0), (75.0, 75.0), (25.0, 75.0)])],
            ),
        );
        let (tiles, _) = map(&[annotation], &grid(100, 100));
        assert_eq!(tiles[0].contributors[0].overlap, 0.75);
    }

    #[test]
    fn test_distant_vertex_stays_cheap() {
        // one vertex far off the slide stretches the bounding box enormously
        let annotation = Annotation::new(
            SourceId::new("slide", "spike"),
            "mouse",
            "antral",
            Polygon::new(
                LineString::from(vec![(0.0, 0.0), (100.0, 0.0), (1e12, 1e12), (0.0, 100.0)]),
                vec![],
            ),
        );
        let (tiles, diagnostics) = map(&[annotation], &grid(200, 200));

        assert_eq!(tiles[0].label, "antral");
        assert!((tiles[0].contributors[0].overlap - 1.0).abs() < 1e-6);
        assert_eq!(tiles[3].label, "antral");
        assert!(diagnostics.is_empty());
    }

    // The R-tree prefilter must give the same answer as testing every pair.
    #[test]
    fn test_index_matches_pairwise() {
        let mut rng = StdRng::seed_from_u64(7);
        let labels = ["primordial", "primary", "secondary", "antral"];
        let annotations: Vec<Annotation> = (0..60)
            .map(|i| {
                let x0 = rng.random_range(-50.0..450.0);
                let y0 = rng.random_range(-50.0..450.0);
                let w = rng.random_range(1.0..250.0);
                let h = rng.random_range(1.0..250.0);
                let label = labels[rng.random_range(0..labels.len())];
                rect_annotation(&format!("a{}", i), label, x0, y0, x0 + w, y0 + h)
            })
            .collect();

        let grid = grid(400, 400);
        let (tiles, _) = map(&annotations, &grid);
        let profile = mouse_profile();
        let mut clip = ClipBuffers::new();

        for labeled in &tiles {
            let rect = labeled.tile.rect();
            let mut expected = Vec::new();
            for annotation in &annotations {
                let exterior = open_ring(annotation.polygon().unwrap().exterior());
                let overlap = clip.clipped_polygon_area(&exterior, &[], &rect) / labeled.tile.area();
                if overlap > 0.0 && overlap >= 0.05 {
                    expected.push(contribution(
                        &annotation.source.annotation_id,
                        annotation.label.as_deref().unwrap(),
                        overlap.min(1.0),
                    ));
                }
            }
            assert_eq!(labeled.contributors, expected);
            let resolution = resolve_label(&expected, &profile, 0.05);
            assert_eq!(labeled.label, resolution.label);
            assert_eq!(labeled.confidence, resolution.confidence);
        }
    }
}
