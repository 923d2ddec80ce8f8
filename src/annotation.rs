// Externally authored follicle annotations and their import from the
// annotation tool's GeoJSON export.

use geo::geometry::Polygon;
use json::object::Object;
use json::JsonValue;
use log::{debug, info};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;

use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
use crate::errors::Result;
use crate::geojson::{classification, feature, features_of, parse_polygon_geometry, polygon_to_json, read_json};
use crate::species::normalize_name;

/// Separates annotation ids in list-valued table fields, so it never appears
/// inside an imported id.
pub const ID_LIST_SEPARATOR: char = ';';

/// Slide plus annotation id, used to trace every tile label back to its source.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId {
    pub slide_id: String,
    pub annotation_id: String,
}

impl SourceId {
    pub fn new(slide_id: &str, annotation_id: &str) -> Self {
        SourceId {
            slide_id: slide_id.to_string(),
            annotation_id: annotation_id.to_string(),
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.slide_id, self.annotation_id)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum AnnotationShape {
    Polygon(Polygon<f64>),
    /// The source geometry could not be read as a polygon.
    Unusable(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Annotation {
    pub source: SourceId,
    pub species: String,
    /// Normalised class label; `None` when the source carried no classification.
    pub label: Option<String>,
    pub shape: AnnotationShape,
    /// Source properties other than the classification, kept for re-export.
    pub properties: JsonValue,
}

impl Annotation {
    pub fn new(source: SourceId, species: &str, label: &str, polygon: Polygon<f64>) -> Self {
        Annotation {
            source,
            species: species.to_string(),
            label: Some(normalize_name(label)),
            shape: AnnotationShape::Polygon(polygon),
            properties: JsonValue::new_object(),
        }
    }

    pub fn polygon(&self) -> Option<&Polygon<f64>> {
        match &self.shape {
            AnnotationShape::Polygon(polygon) => Some(polygon),
            AnnotationShape::Unusable(_) => None,
        }
    }

    /// GeoJSON feature carrying the passthrough properties plus `extra`.
    pub fn to_feature(&self, extra: Vec<(&str, JsonValue)>) -> JsonValue {
        let mut properties = Object::new();
        for (key, value) in self.properties.entries() {
            properties.insert(key, value.clone());
        }
        if let Some(label) = &self.label {
            properties.insert("classification", classification(label));
        }
        for (key, value) in extra {
            properties.insert(key, value);
        }

        let geometry = match &self.shape {
            AnnotationShape::Polygon(polygon) => polygon_to_json(polygon),
            AnnotationShape::Unusable(_) => JsonValue::Null,
        };
        feature(
            Some(&self.source.annotation_id),
            geometry,
            JsonValue::Object(properties),
        )
    }
}

fn parse_classification(properties: &JsonValue) -> Option<String> {
    let classification = &properties["classification"];
    let name = if classification.is_object() {
        classification["name"].as_str()
    } else if classification.is_string() {
        classification.as_str()
    } else if properties["objectType"].as_str() == Some("annotation") {
        properties["name"].as_str()
    } else {
        None
    };

    name.map(normalize_name).filter(|name| !name.is_empty())
}

fn json_id(value: &JsonValue) -> Option<String> {
    if let Some(s) = value.as_str() {
        Some(s.to_string())
    } else if value.is_number() {
        Some(value.dump())
    } else {
        None
    }
}

// Replace the list separator and suffix repeats until the id is unused.
fn unique_id(raw: &str, used: &mut HashSet<String>) -> String {
    let base = raw.replace(ID_LIST_SEPARATOR, "_");
    let mut id = base.clone();
    let mut n = 2;
    while used.contains(&id) {
        id = format!("{}-{}", base, n);
        n += 1;
    }
    used.insert(id.clone());
    id
}

/// Convert GeoJSON features into annotations for one slide. Features keep
/// their own id when present; otherwise one is synthesised from their position.
/// Ids are made unique within the slide, and every rewrite is recorded.
pub fn import_annotations(
    data: &JsonValue,
    slide_id: &str,
    species: &str,
    diagnostics: &mut Diagnostics,
) -> Result<Vec<Annotation>> {
    let features = features_of(data)?;
    let mut annotations = Vec::with_capacity(features.len());
    let mut used = HashSet::with_capacity(features.len());

    for (i, feature) in features.into_iter().enumerate() {
        let properties = &feature["properties"];

        let raw_id = json_id(&feature["id"])
            .or_else(|| json_id(&properties["id"]))
            .unwrap_or_else(|| format!("feature-{}", i));
        let annotation_id = unique_id(&raw_id, &mut used);
        if annotation_id != raw_id {
            diagnostics.record(
                Diagnostic::new(
                    DiagnosticKind::RenamedAnnotationId,
                    slide_id,
                    format!("annotation id '{}' renamed to '{}'", raw_id, annotation_id),
                )
                .with_source(&SourceId::new(slide_id, &annotation_id)),
            );
        }

        let shape = match parse_polygon_geometry(&feature["geometry"]) {
            Ok(polygon) => AnnotationShape::Polygon(polygon),
            Err(reason) => AnnotationShape::Unusable(reason),
        };

        if feature["geometry"]["type"] == "MultiPolygon" {
            debug!("{}/{}: kept largest polygon of a multipolygon", slide_id, annotation_id);
        }

        let annotation_species = properties["species"]
            .as_str()
            .map(normalize_name)
            .unwrap_or_else(|| species.to_string());

        let mut passthrough = Object::new();
        for (key, value) in properties.entries() {
            if key != "classification" {
                passthrough.insert(key, value.clone());
            }
        }

        annotations.push(Annotation {
            source: SourceId::new(slide_id, &annotation_id),
            species: annotation_species,
            label: parse_classification(properties),
            shape,
            properties: JsonValue::Object(passthrough),
        });
    }

    Ok(annotations)
}

pub fn read_annotations(
    path: &Path,
    slide_id: &str,
    species: &str,
    diagnostics: &mut Diagnostics,
) -> Result<Vec<Annotation>> {
    let data = read_json(path)?;
    let annotations = import_annotations(&data, slide_id, species, diagnostics)?;

    let mut classifications: BTreeMap<&str, usize> = BTreeMap::new();
    for annotation in &annotations {
        *classifications
            .entry(annotation.label.as_deref().unwrap_or("<unclassified>"))
            .or_default() += 1;
    }
    info!(
        "Read {} annotations for slide {} from {}: {:?}",
        annotations.len(),
        slide_id,
        path.display(),
        classifications
    );

    Ok(annotations)
}
