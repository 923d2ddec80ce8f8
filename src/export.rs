// Inverse mapping: tile predictions back to annotation-tool polygons.

use geo::geometry::{MultiPolygon, Rect};
use json::object::Object;
use json::JsonValue;
use log::{debug, info, warn};
use petgraph::unionfind::UnionFind;
use rayon::prelude::*;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use thread_local::ThreadLocal;

use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
use crate::errors::Result;
use crate::geojson::{classification, feature, feature_collection, multipolygon_to_json, write_json};
use crate::polygons::PolygonBuilder;
use crate::species::{normalize_name, BACKGROUND_LABEL};
use crate::tables::{find_column, open_csv_reader};
use crate::tiles::{Tile, TileGrid, TileId};

#[derive(Clone, Debug, PartialEq)]
pub struct PredictionRecord {
    pub tile_id: TileId,
    pub label: String,
    pub confidence: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExportGeometry {
    pub slide_id: String,
    pub label: String,
    pub geometry: MultiPolygon<f64>,
    /// Area-weighted mean of the member tiles' confidences.
    pub confidence: f64,
    /// Member tiles in grid order.
    pub tile_ids: Vec<TileId>,
}

impl ExportGeometry {
    pub fn to_feature(&self, id: &str) -> JsonValue {
        let mut properties = Object::new();
        properties.insert("objectType", "annotation".into());
        properties.insert("classification", classification(&self.label));
        properties.insert("confidence", self.confidence.into());
        properties.insert("tile_count", self.tile_ids.len().into());
        feature(
            Some(id),
            multipolygon_to_json(&self.geometry),
            JsonValue::Object(properties),
        )
    }
}

/// Read a `tile_id,label,confidence` table. Rows that cannot be used are
/// recorded and skipped; confidences outside [0, 1] are clamped.
pub fn read_predictions(path: &Path, diagnostics: &mut Diagnostics) -> Result<Vec<PredictionRecord>> {
    let mut rdr = open_csv_reader(path)?;
    let headers = rdr.headers()?.clone();
    let tile_col = find_column(&headers, "tile_id", path)?;
    let label_col = find_column(&headers, "label", path)?;
    let confidence_col = find_column(&headers, "confidence", path)?;

    let mut predictions = Vec::new();
    for result in rdr.records() {
        let row = result?;
        let line = row.position().map_or(0, |p| p.line());
        let raw_tile = row.get(tile_col).unwrap_or("");

        let tile_id: TileId = match raw_tile.parse() {
            Ok(tile_id) => tile_id,
            Err(err) => {
                diagnostics.record(Diagnostic::new(
                    DiagnosticKind::InvalidPrediction,
                    "",
                    format!("line {}: {}", line, err),
                ));
                continue;
            }
        };

        let raw_confidence = row.get(confidence_col).unwrap_or("");
        let confidence = match raw_confidence.parse::<f64>() {
            Ok(confidence) if confidence.is_finite() => confidence,
            _ => {
                diagnostics.record(
                    Diagnostic::new(
                        DiagnosticKind::InvalidPrediction,
                        &tile_id.slide_id,
                        format!("line {}: invalid confidence '{}'", line, raw_confidence),
                    )
                    .with_tile(&tile_id),
                );
                continue;
            }
        };
        if !(0.0..=1.0).contains(&confidence) {
            warn!(
                "Prediction for {} has confidence {} outside [0, 1]; clamping",
                tile_id, confidence
            );
        }

        predictions.push(PredictionRecord {
            tile_id,
            label: normalize_name(row.get(label_col).unwrap_or("")),
            confidence: confidence.clamp(0.0, 1.0),
        });
    }

    info!("Read {} predictions from {}", predictions.len(), path.display());
    Ok(predictions)
}

// Tile indices of one class, grouped into 8-connected components on the grid.
// Closed tile squares share at least an edge point or a corner.
fn tiles_touch(a: &Tile, b: &Tile) -> bool {
    let (ax, ay, asize) = (a.x as u64, a.y as u64, a.size as u64);
    let (bx, by, bsize) = (b.x as u64, b.y as u64, b.size as u64);
    ax <= bx + bsize && bx <= ax + asize && ay <= by + bsize && by <= ay + asize
}

fn connected_groups(grid: &TileGrid, mut members: Vec<usize>) -> Vec<Vec<usize>> {
    members.sort_unstable();
    let positions: HashMap<(i64, i64), usize> = members
        .iter()
        .enumerate()
        .map(|(m, &i)| {
            let (col, row) = grid.grid_position(&grid.tiles[i]);
            ((col as i64, row as i64), m)
        })
        .collect();

    // Lattice neighbours within this reach may overlap when the stride is
    // smaller than the tile; beyond it tiles can never touch.
    let reach = grid.tile_size.div_ceil(grid.stride).max(1) as i64;
    let mut components = UnionFind::<usize>::new(members.len());
    for (&(col, row), &m) in &positions {
        for dc in -reach..=reach {
            for dr in -reach..=reach {
                let Some(&n) = positions.get(&(col + dc, row + dr)) else {
                    continue;
                };
                if n != m && tiles_touch(&grid.tiles[members[m]], &grid.tiles[members[n]]) {
                    components.union(m, n);
                }
            }
        }
    }

    let roots = components.into_labeling();
    let mut group_of_root: HashMap<usize, usize> = HashMap::new();
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for (m, &i) in members.iter().enumerate() {
        let g = *group_of_root.entry(roots[m]).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[g].push(i);
    }
    groups
}

/// Merge same-class predictions on touching tiles (overlapping, or sharing an
/// edge or a corner) into one geometry each. Tiles that are lattice
/// neighbours but separated by a gap stay apart. Predictions for other slides are ignored.
pub fn export(
    predictions: &[PredictionRecord],
    grid: &TileGrid,
    diagnostics: &mut Diagnostics,
) -> Vec<ExportGeometry> {
    let index = grid.index();
    let mut seen: HashSet<(u32, u32)> = HashSet::new();
    let mut confidences: HashMap<usize, f64> = HashMap::new();
    let mut by_label: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    let mut nbackground = 0;

    for prediction in predictions {
        let tile_id = &prediction.tile_id;
        if tile_id.slide_id != grid.slide_id {
            continue;
        }

        let Some(&i) = index.get(&(tile_id.x, tile_id.y)) else {
            diagnostics.record(
                Diagnostic::new(
                    DiagnosticKind::UnknownTile,
                    &grid.slide_id,
                    "prediction for a tile that is not in the grid".to_string(),
                )
                .with_tile(tile_id),
            );
            continue;
        };

        if !seen.insert((tile_id.x, tile_id.y)) {
            diagnostics.record(
                Diagnostic::new(
                    DiagnosticKind::DuplicatePrediction,
                    &grid.slide_id,
                    format!("ignoring repeated prediction '{}'", prediction.label),
                )
                .with_tile(tile_id),
            );
            continue;
        }

        if prediction.label == BACKGROUND_LABEL || prediction.label.is_empty() {
            nbackground += 1;
            continue;
        }

        confidences.insert(i, prediction.confidence.clamp(0.0, 1.0));
        by_label.entry(prediction.label.as_str()).or_default().push(i);
    }
    debug!("Slide {}: skipped {} background predictions", grid.slide_id, nbackground);

    let groups: Vec<(&str, Vec<usize>)> = by_label
        .into_iter()
        .flat_map(|(label, members)| {
            connected_groups(grid, members)
                .into_iter()
                .map(move |group| (label, group))
        })
        .collect();

    let polygon_builder = ThreadLocal::new();
    let geometries: Vec<ExportGeometry> = groups
        .par_iter()
        .map(|(label, group)| {
            let mut polygon_builder = polygon_builder
                .get_or(|| RefCell::new(PolygonBuilder::new()))
                .borrow_mut();

            let rects: Vec<Rect<f64>> = group.iter().map(|&i| grid.tiles[i].rect()).collect();
            let (weighted, area) = group.iter().fold((0.0, 0.0), |(weighted, area), &i| {
                let tile_area = grid.tiles[i].area();
                let confidence = confidences.get(&i).copied().unwrap_or(0.0);
                (weighted + confidence * tile_area, area + tile_area)
            });

            ExportGeometry {
                slide_id: grid.slide_id.clone(),
                label: label.to_string(),
                geometry: polygon_builder.rects_to_multipolygon(&rects),
                confidence: if area > 0.0 { weighted / area } else { 0.0 },
                tile_ids: group.iter().map(|&i| grid.tiles[i].id()).collect(),
            }
        })
        .collect();

    info!(
        "Slide {}: merged {} predicted tiles into {} regions",
        grid.slide_id,
        confidences.len(),
        geometries.len()
    );
    geometries
}

pub fn to_feature_collection(geometries: &[ExportGeometry]) -> JsonValue {
    feature_collection(
        geometries
            .iter()
            .enumerate()
            .map(|(k, geometry)| {
                geometry.to_feature(&format!("{}-{}-{}", geometry.slide_id, geometry.label, k))
            })
            .collect(),
    )
}

pub fn write_geojson(path: &Path, geometries: &[ExportGeometry]) -> Result<()> {
    write_json(path, &to_feature_collection(geometries))?;
    info!("Wrote {} regions to {}", geometries.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::polygon_area::{open_ring, polygon_area};
    use crate::tiles::{generate, GridParams, SlideExtent, UniformTissue};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn grid(width: u32, height: u32) -> TileGrid {
        generate(
            "s",
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

    fn prediction(x: u32, y: u32, label: &str, confidence: f64) -> PredictionRecord {
        PredictionRecord {
            tile_id: TileId::new("s", x, y),
            label: label.to_string(),
            confidence,
        }
    }

    #[test]
    fn test_two_adjacent_tiles_merge() {
        let grid = grid(200, 200);
        let predictions = vec![
            prediction(0, 0, "antral", 1.0),
            prediction(100, 0, "antral", 1.0),
            prediction(0, 100, BACKGROUND_LABEL, 0.9),
        ];
        let mut diagnostics = Diagnostics::new();
        let geometries = export(&predictions, &grid, &mut diagnostics);

        assert_eq!(geometries.len(), 1);
        let geometry = &geometries[0];
        assert_eq!(geometry.label, "antral");
        assert_eq!(geometry.confidence, 1.0);
        assert_eq!(geometry.geometry.0.len(), 1);
        assert_eq!(open_ring(geometry.geometry.0[0].exterior()).len(), 4);
        assert_eq!(polygon_area(&geometry.geometry.0[0]), 20000.0);
        assert_eq!(
            geometry.tile_ids,
            vec![TileId::new("s", 0, 0), TileId::new("s", 100, 0)]
        );
        assert!(diagnostics.is_empty());
    }

    fn strided_grid(width: u32, tile_size: u32, stride: u32) -> TileGrid {
        generate(
            "s",
            "mouse",
            SlideExtent { width, height: tile_size },
            &GridParams {
                tile_size,
                stride,
                min_tissue_ratio: 0.0,
            },
            &UniformTissue(1.0),
        )
        .unwrap()
    }

    #[test]
    fn test_gapped_lattice_neighbours_stay_apart() {
        let grid = strided_grid(300, 100, 200);
        assert_eq!(grid.len(), 2);
        assert_eq!(grid.grid_position(&grid.tiles[1]), (1, 0));

        let predictions = vec![prediction(0, 0, "antral", 1.0), prediction(200, 0, "antral", 1.0)];
        let geometries = export(&predictions, &grid, &mut Diagnostics::new());
        assert_eq!(geometries.len(), 2);
        assert!(geometries.iter().all(|g| g.tile_ids.len() == 1));
    }

    #[test]
    fn test_overlapping_tiles_beyond_one_stride_merge() {
        let grid = strided_grid(225, 100, 25);
        let predictions = vec![prediction(0, 0, "antral", 1.0), prediction(75, 0, "antral", 1.0)];
        let geometries = export(&predictions, &grid, &mut Diagnostics::new());
        assert_eq!(geometries.len(), 1);
        assert_eq!(
            geometries[0].tile_ids,
            vec![TileId::new("s", 0, 0), TileId::new("s", 75, 0)]
        );
        assert_eq!(geometries[0].geometry.0.len(), 1);
        assert_eq!(polygon_area(&geometries[0].geometry.0[0]), 17500.0);

        let predictions = vec![prediction(0, 0, "antral", 1.0), prediction(100, 0, "antral", 1.0)];
        assert_eq!(export(&predictions, &grid, &mut Diagnostics::new()).len(), 1);

        let predictions = vec![prediction(0, 0, "antral", 1.0), prediction(125, 0, "antral", 1.0)];
        assert_eq!(export(&predictions, &grid, &mut Diagnostics::new()).len(), 2);
    }

    #[test]
    fn test_confidence_is_area_weighted() {
        let grid = grid(200, 100);
        let predictions = vec![prediction(0, 0, "primary", 0.5), prediction(100, 0, "primary", 1.0)];
        let geometries = export(&predictions, &grid, &mut Diagnostics::new());
        assert_eq!(geometries[0].confidence, 0.75);
    }

    #[test]
    fn test_corner_neighbours_share_a_region() {
        let grid = grid(200, 200);
        let predictions = vec![prediction(0, 0, "primary", 1.0), prediction(100, 100, "primary", 1.0)];
        let geometries = export(&predictions, &grid, &mut Diagnostics::new());
        assert_eq!(geometries.len(), 1);
        assert_eq!(geometries[0].geometry.0.len(), 2);
        assert_eq!(geometries[0].tile_ids.len(), 2);
    }

    #[test]
    fn test_classes_and_distant_tiles_stay_apart() {
        let grid = grid(400, 100);
        let predictions = vec![
            prediction(0, 0, "primary", 1.0),
            prediction(100, 0, "secondary", 1.0),
            prediction(300, 0, "primary", 1.0),
        ];
        let geometries = export(&predictions, &grid, &mut Diagnostics::new());
        let labels: Vec<&str> = geometries.iter().map(|g| g.label.as_str()).collect();
        assert_eq!(labels, vec!["primary", "primary", "secondary"]);
        assert_eq!(geometries[0].tile_ids, vec![TileId::new("s", 0, 0)]);
        assert_eq!(geometries[1].tile_ids, vec![TileId::new("s", 300, 0)]);
    }

    #[test]
    fn test_unknown_and_duplicate_tiles() {
        let grid = grid(100, 100);
        let predictions = vec![
            prediction(0, 0, "primary", 0.8),
            prediction(0, 0, "antral", 0.9),
            prediction(500, 0, "primary", 0.9),
            PredictionRecord {
                tile_id: TileId::new("other", 0, 0),
                label: "primary".to_string(),
                confidence: 1.0,
            },
        ];
        let mut diagnostics = Diagnostics::new();
        let geometries = export(&predictions, &grid, &mut diagnostics);

        assert_eq!(geometries.len(), 1);
        assert_eq!(geometries[0].label, "primary");
        assert_eq!(geometries[0].confidence, 0.8);
        assert_eq!(diagnostics.count(DiagnosticKind::DuplicatePrediction), 1);
        assert_eq!(diagnostics.count(DiagnosticKind::UnknownTile), 1);
        assert_eq!(diagnostics.len(), 2);
    }

    #[test]
    fn test_inputs_are_not_modified() {
        let grid = grid(200, 100);
        let predictions = vec![prediction(0, 0, "primary", 1.0)];
        let (grid_before, predictions_before) = (grid.clone(), predictions.clone());
        export(&predictions, &grid, &mut Diagnostics::new());
        assert_eq!(grid, grid_before);
        assert_eq!(predictions, predictions_before);
    }

    #[test]
    fn test_read_predictions() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "tile_id,label,confidence").unwrap();
        writeln!(file, "s:0:0,Antral,0.9").unwrap();
        writeln!(file, "s:100:0,primary,1.7").unwrap();
        writeln!(file, "garbage,primary,0.5").unwrap();
        writeln!(file, "s:200:0,primary,NaN").unwrap();
        file.flush().unwrap();

        let mut diagnostics = Diagnostics::new();
        let predictions = read_predictions(file.path(), &mut diagnostics).unwrap();
        assert_eq!(predictions.len(), 2);
        assert_eq!(predictions[0].label, "antral");
        assert_eq!(predictions[1].confidence, 1.0);
        assert_eq!(diagnostics.count(DiagnosticKind::InvalidPrediction), 2);
    }

    #[test]
    fn test_feature_collection() {
        let grid = grid(100, 100);
        let geometries = export(&[prediction(0, 0, "primary", 0.5)], &grid, &mut Diagnostics::new());
        let data = to_feature_collection(&geometries);
        let feature = &data["features"][0];
        assert_eq!(feature["geometry"]["type"], "Polygon");
        assert_eq!(feature["properties"]["objectType"], "annotation");
        assert_eq!(feature["properties"]["classification"]["name"], "primary");
        assert_eq!(feature["properties"]["confidence"], 0.5);
        assert_eq!(feature["properties"]["tile_count"], 1);
    }
}
