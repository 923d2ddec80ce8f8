// Annotation checks against the species profile: degenerate geometry and
// missing classifications reject an annotation, class and size mismatches
// only flag it.

use geo::geometry::Coord;
use json::JsonValue;
use log::info;
use std::path::Path;

use crate::annotation::{Annotation, AnnotationShape};
use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics, Severity};
use crate::errors::{FollicleError, Result};
use crate::geojson::{feature_collection, write_json};
use crate::polygon_area::{equivalent_diameter, open_ring, polygon_area, ring_self_intersects};
use crate::species::{LengthUnit, SizeRange, SpeciesProfile, SpeciesRegistry};

/// Polygons smaller than this (in square pixels) are treated as empty.
pub const MIN_POLYGON_AREA: f64 = 1e-6;

/// Physical length of one slide pixel.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PixelScale {
    pub unit: LengthUnit,
    pub per_pixel: f64,
}

impl PixelScale {
    pub fn microns(per_pixel: f64) -> Self {
        PixelScale {
            unit: LengthUnit::Micrometer,
            per_pixel,
        }
    }

    pub fn pixels() -> Self {
        PixelScale {
            unit: LengthUnit::Pixel,
            per_pixel: 1.0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.per_pixel.is_finite() && self.per_pixel > 0.0 {
            Ok(())
        } else {
            Err(FollicleError::InvalidPixelScale(self.per_pixel))
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ValidationIssue {
    MissingClassification,
    DegenerateGeometry(String),
    UnknownSpecies(String),
    ClassMismatch { label: String },
    SizeOutOfRange { label: String, diameter: f64, range: SizeRange },
}

impl ValidationIssue {
    pub fn kind(&self) -> DiagnosticKind {
        match self {
            ValidationIssue::MissingClassification => DiagnosticKind::MissingClassification,
            ValidationIssue::DegenerateGeometry(_) => DiagnosticKind::DegenerateGeometry,
            ValidationIssue::UnknownSpecies(_) => DiagnosticKind::UnknownSpecies,
            ValidationIssue::ClassMismatch { .. } => DiagnosticKind::ClassMismatchWarning,
            ValidationIssue::SizeOutOfRange { .. } => DiagnosticKind::SizeRangeWarning,
        }
    }

    pub fn severity(&self) -> Severity {
        self.kind().severity()
    }

    pub fn message(&self) -> String {
        match self {
            ValidationIssue::MissingClassification => "annotation has no classification".to_string(),
            ValidationIssue::DegenerateGeometry(reason) => reason.clone(),
            ValidationIssue::UnknownSpecies(code) => format!("unknown species '{}'", code),
            ValidationIssue::ClassMismatch { label } => {
                format!("class '{}' is not declared for this species", label)
            }
            ValidationIssue::SizeOutOfRange {
                label,
                diameter,
                range,
            } => format!(
                "equivalent diameter {:.2} outside [{}, {}] for class '{}'",
                diameter, range.min, range.max, label
            ),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ValidationResult {
    pub issues: Vec<ValidationIssue>,
    /// Polygon area in square pixels, when the geometry was measurable.
    pub area: Option<f64>,
    /// Equivalent-circle diameter in the profile's size units.
    pub equivalent_diameter: Option<f64>,
}

impl ValidationResult {
    /// Worst severity among the issues; `None` for a clean annotation.
    pub fn severity(&self) -> Option<Severity> {
        self.issues.iter().map(|issue| issue.severity()).max()
    }

    pub fn is_rejected(&self) -> bool {
        self.severity() == Some(Severity::Hard)
    }

    pub fn status(&self) -> &'static str {
        match self.severity() {
            None | Some(Severity::Info) => "ok",
            Some(Severity::Soft) => "flagged",
            Some(Severity::Hard) => "rejected",
        }
    }
}

fn check_ring(vertices: &[Coord<f64>]) -> std::result::Result<(), String> {
    if vertices.iter().any(|c| !c.x.is_finite() || !c.y.is_finite()) {
        return Err("non-finite vertex coordinates".to_string());
    }

    let mut distinct: Vec<Coord<f64>> = Vec::with_capacity(vertices.len());
    for &c in vertices {
        if !distinct.contains(&c) {
            distinct.push(c);
        }
    }
    if distinct.len() < 3 {
        return Err(format!("polygon has {} distinct vertices", distinct.len()));
    }

    if ring_self_intersects(vertices) {
        return Err("self-intersecting exterior ring".to_string());
    }
    Ok(())
}

/// Check one annotation against `profile`. The only error is a units
/// mismatch between the pixel scale and the profile, which is a
/// configuration problem rather than a property of the annotation.
pub fn validate(
    annotation: &Annotation,
    profile: &SpeciesProfile,
    scale: &PixelScale,
) -> Result<ValidationResult> {
    if scale.unit != profile.size_units {
        return Err(FollicleError::UnitsMismatch {
            species: profile.code.clone(),
            expected: profile.size_units,
            found: scale.unit,
        });
    }

    let mut result = ValidationResult::default();

    if annotation.label.is_none() {
        result.issues.push(ValidationIssue::MissingClassification);
    }

    let polygon = match &annotation.shape {
        AnnotationShape::Polygon(polygon) => polygon,
        AnnotationShape::Unusable(reason) => {
            result.issues.push(ValidationIssue::DegenerateGeometry(reason.clone()));
            return Ok(result);
        }
    };

    let exterior = open_ring(polygon.exterior());
    if let Err(reason) = check_ring(&exterior) {
        result.issues.push(ValidationIssue::DegenerateGeometry(reason));
        return Ok(result);
    }

    let area = polygon_area(polygon);
    if !area.is_finite() || area < MIN_POLYGON_AREA {
        result
            .issues
            .push(ValidationIssue::DegenerateGeometry(format!("polygon area {} is empty", area)));
        return Ok(result);
    }
    result.area = Some(area);

    let diameter = equivalent_diameter(area) * scale.per_pixel;
    result.equivalent_diameter = Some(diameter);

    if let Some(label) = &annotation.label {
        match profile.size_range(label) {
            None => result.issues.push(ValidationIssue::ClassMismatch {
                label: label.clone(),
            }),
            Some(range) => {
                if !range.contains(diameter) {
                    result.issues.push(ValidationIssue::SizeOutOfRange {
                        label: label.clone(),
                        diameter,
                        range,
                    });
                }
            }
        }
    }

    Ok(result)
}

#[derive(Clone, Debug, PartialEq)]
pub struct ValidatedAnnotation {
    pub annotation: Annotation,
    pub result: ValidationResult,
}

impl ValidatedAnnotation {
    pub fn is_rejected(&self) -> bool {
        self.result.is_rejected()
    }

    fn to_feature(&self) -> JsonValue {
        let issues: Vec<JsonValue> = self
            .result
            .issues
            .iter()
            .map(|issue| issue.kind().as_str().into())
            .collect();
        let mut extra = vec![
            ("validation", self.result.status().into()),
            ("validation_issues", JsonValue::Array(issues)),
        ];
        if let Some(diameter) = self.result.equivalent_diameter {
            extra.push(("equivalent_diameter", diameter.into()));
        }
        self.annotation.to_feature(extra)
    }
}

/// Validate every annotation against its own species' profile and record each
/// issue. Species names are resolved to registry codes. Annotations are
/// returned in input order, rejected ones included.
pub fn screen_annotations(
    annotations: Vec<Annotation>,
    registry: &SpeciesRegistry,
    scale: &PixelScale,
    diagnostics: &mut Diagnostics,
) -> Result<Vec<ValidatedAnnotation>> {
    let mut screened = Vec::with_capacity(annotations.len());
    for mut annotation in annotations {
        if let Some(code) = registry.resolve(&annotation.species) {
            annotation.species = code.to_string();
        }
        let result = match registry.get(&annotation.species) {
            Ok(profile) => validate(&annotation, profile, scale)?,
            Err(_) => ValidationResult {
                issues: vec![ValidationIssue::UnknownSpecies(annotation.species.clone())],
                ..Default::default()
            },
        };

        for issue in &result.issues {
            diagnostics.record(
                Diagnostic::new(issue.kind(), &annotation.source.slide_id, issue.message())
                    .with_source(&annotation.source),
            );
        }
        screened.push(ValidatedAnnotation { annotation, result });
    }

    let rejected = screened.iter().filter(|v| v.is_rejected()).count();
    let flagged = screened
        .iter()
        .filter(|v| v.result.severity() == Some(Severity::Soft))
        .count();
    info!(
        "Validated {} annotations: {} rejected, {} flagged",
        screened.len(),
        rejected,
        flagged
    );

    Ok(screened)
}

/// Write validated annotations back out as GeoJSON, tagged with their status.
pub fn write_annotations_geojson(path: &Path, annotations: &[ValidatedAnnotation]) -> Result<()> {
    let features = annotations.iter().map(|v| v.to_feature()).collect();
    write_json(path, &feature_collection(features))
}
