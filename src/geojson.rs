// GeoJSON reading and writing for the annotation tool's geometry exchange
// format. Coordinates are slide pixels.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use geo::geometry::{Coord, LineString, MultiPolygon, Polygon};
use json::object::Object;
use json::JsonValue;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use crate::errors::{FollicleError, Result};
use crate::polygon_area::{open_ring, polygon_area};

fn is_gzipped(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == "gz")
}

pub fn read_json(path: &Path) -> Result<JsonValue> {
    let input = File::open(path)?;
    let mut content = String::new();
    if is_gzipped(path) {
        GzDecoder::new(input).read_to_string(&mut content)?;
    } else {
        let mut input = input;
        input.read_to_string(&mut content)?;
    }
    Ok(json::parse(&content)?)
}

pub fn write_json(path: &Path, data: &JsonValue) -> Result<()> {
    let output = File::create(path)?;
    if is_gzipped(path) {
        let mut encoder = GzEncoder::new(output, Compression::default());
        encoder.write_all(data.dump().as_bytes())?;
        encoder.finish()?;
    } else {
        let mut output = output;
        output.write_all(data.pretty(2).as_bytes())?;
    }
    Ok(())
}

/// Features of a FeatureCollection, a bare feature array, or a single Feature.
pub fn features_of(data: &JsonValue) -> Result<Vec<&JsonValue>> {
    if data.is_array() {
        return Ok(data.members().collect());
    }

    match data["type"].as_str() {
        Some("FeatureCollection") => {
            if !data["features"].is_array() {
                return Err(FollicleError::InvalidGeoJson(
                    "FeatureCollection has no 'features' array".to_string(),
                ));
            }
            Ok(data["features"].members().collect())
        }
        Some("Feature") => Ok(vec![data]),
        Some(other) => Err(FollicleError::InvalidGeoJson(format!(
            "expected FeatureCollection or Feature, got '{}'",
            other
        ))),
        None => Err(FollicleError::InvalidGeoJson("missing 'type' field".to_string())),
    }
}

fn parse_ring(ring: &JsonValue) -> std::result::Result<LineString<f64>, String> {
    if !ring.is_array() {
        return Err("ring is not a coordinate array".to_string());
    }

    let mut coords = Vec::with_capacity(ring.len());
    for xy in ring.members() {
        match (xy[0].as_f64(), xy[1].as_f64()) {
            (Some(x), Some(y)) => coords.push(Coord { x, y }),
            _ => return Err(format!("malformed coordinate {}", xy.dump())),
        }
    }
    Ok(LineString::new(coords))
}

fn parse_polygon_coordinates(coordinates: &JsonValue) -> std::result::Result<Polygon<f64>, String> {
    let mut rings = coordinates.members();
    let exterior = match rings.next() {
        Some(ring) => parse_ring(ring)?,
        None => return Err("polygon has no rings".to_string()),
    };
    let interiors = rings.map(parse_ring).collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(Polygon::new(exterior, interiors))
}

/// Parse a Polygon or MultiPolygon geometry. Multi-polygons are reduced to
/// their largest member.
pub fn parse_polygon_geometry(geometry: &JsonValue) -> std::result::Result<Polygon<f64>, String> {
    match geometry["type"].as_str() {
        Some("Polygon") => parse_polygon_coordinates(&geometry["coordinates"]),
        Some("MultiPolygon") => {
            let mut largest: Option<(f64, Polygon<f64>)> = None;
            for coordinates in geometry["coordinates"].members() {
                let polygon = parse_polygon_coordinates(coordinates)?;
                let area = polygon_area(&polygon);
                if largest.as_ref().map_or(true, |(largest_area, _)| area > *largest_area) {
                    largest = Some((area, polygon));
                }
            }
            largest
                .map(|(_, polygon)| polygon)
                .ok_or_else(|| "multipolygon has no members".to_string())
        }
        Some(other) => Err(format!("unsupported geometry type '{}'", other)),
        None => Err("missing geometry".to_string()),
    }
}

fn ring_to_json(ring: &LineString<f64>) -> JsonValue {
    let mut vertices = open_ring(ring);
    if let Some(&first) = vertices.first() {
        vertices.push(first);
    }
    JsonValue::Array(
        vertices
            .iter()
            .map(|c| JsonValue::Array(vec![c.x.into(), c.y.into()]))
            .collect(),
    )
}

fn polygon_coordinates(polygon: &Polygon<f64>) -> JsonValue {
    let mut rings = vec![ring_to_json(polygon.exterior())];
    rings.extend(polygon.interiors().iter().map(ring_to_json));
    JsonValue::Array(rings)
}

pub fn polygon_to_json(polygon: &Polygon<f64>) -> JsonValue {
    let mut geometry = Object::new();
    geometry.insert("type", "Polygon".into());
    geometry.insert("coordinates", polygon_coordinates(polygon));
    JsonValue::Object(geometry)
}

/// Single-member multi-polygons are written as plain polygons.
pub fn multipolygon_to_json(multipolygon: &MultiPolygon<f64>) -> JsonValue {
    if multipolygon.0.len() == 1 {
        return polygon_to_json(&multipolygon.0[0]);
    }

    let mut geometry = Object::new();
    geometry.insert("type", "MultiPolygon".into());
    geometry.insert(
        "coordinates",
        JsonValue::Array(multipolygon.0.iter().map(polygon_coordinates).collect()),
    );
    JsonValue::Object(geometry)
}

pub fn feature(id: Option<&str>, geometry: JsonValue, properties: JsonValue) -> JsonValue {
    let mut feature = Object::new();
    feature.insert("type", "Feature".into());
    if let Some(id) = id {
        feature.insert("id", id.into());
    }
    feature.insert("geometry", geometry);
    feature.insert("properties", properties);
    JsonValue::Object(feature)
}

pub fn feature_collection(features: Vec<JsonValue>) -> JsonValue {
    let mut collection = Object::new();
    collection.insert("type", "FeatureCollection".into());
    collection.insert("features", JsonValue::Array(features));
    JsonValue::Object(collection)
}

/// QuPath-style `classification` property.
pub fn classification(name: &str) -> JsonValue {
    let mut classification = Object::new();
    classification.insert("name", name.into());
    JsonValue::Object(classification)
}
