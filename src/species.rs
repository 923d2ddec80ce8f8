// Species parameter registry: per-species follicle labels, size ranges, tile
// sizes and overlap thresholds, loaded once at startup and passed by reference.

use log::{debug, info};
use serde::Deserialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::errors::{FollicleError, Result};

/// Reserved label for tiles that carry no follicle.
pub const BACKGROUND_LABEL: &str = "background";

pub const DEFAULT_MIN_OVERLAP: f64 = 0.05;
pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.05;
pub const DEFAULT_MIN_TISSUE_RATIO: f64 = 0.25;

const BUILTIN_SPECIES_TOML: &str = include_str!("../data/species.toml");

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum LengthUnit {
    Micrometer,
    Pixel,
}

impl fmt::Display for LengthUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LengthUnit::Micrometer => write!(f, "um"),
            LengthUnit::Pixel => write!(f, "px"),
        }
    }
}

impl FromStr for LengthUnit {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "um" | "µm" | "micron" | "microns" | "micrometer" | "micrometre" => {
                Ok(LengthUnit::Micrometer)
            }
            "px" | "pixel" | "pixels" => Ok(LengthUnit::Pixel),
            other => Err(format!("unknown length unit '{}'", other)),
        }
    }
}

/// Inclusive range of equivalent diameters for one follicle class.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SizeRange {
    pub min: f64,
    pub max: f64,
}

impl SizeRange {
    pub fn new(min: f64, max: f64) -> Self {
        SizeRange { min, max }
    }

    pub fn contains(&self, diameter: f64) -> bool {
        diameter >= self.min && diameter <= self.max
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Thresholds {
    /// Minimum overlap fraction (inclusive) for an annotation to contribute to a tile.
    pub min_overlap: f64,
    /// Resolved labels below this confidence are demoted to background.
    pub min_confidence: f64,
    /// Tiles need strictly more tissue than this to be kept.
    pub min_tissue_ratio: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            min_overlap: DEFAULT_MIN_OVERLAP,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            min_tissue_ratio: DEFAULT_MIN_TISSUE_RATIO,
        }
    }
}

/// Partial threshold settings, used for the `[defaults]` table and for
/// command line overrides.
#[derive(Copy, Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThresholdOverrides {
    pub min_overlap: Option<f64>,
    pub min_confidence: Option<f64>,
    pub min_tissue_ratio: Option<f64>,
}

impl ThresholdOverrides {
    pub fn is_empty(&self) -> bool {
        self.min_overlap.is_none() && self.min_confidence.is_none() && self.min_tissue_ratio.is_none()
    }
}

impl Thresholds {
    pub fn with_overrides(self, overrides: &ThresholdOverrides) -> Thresholds {
        Thresholds {
            min_overlap: overrides.min_overlap.unwrap_or(self.min_overlap),
            min_confidence: overrides.min_confidence.unwrap_or(self.min_confidence),
            min_tissue_ratio: overrides.min_tissue_ratio.unwrap_or(self.min_tissue_ratio),
        }
    }

    pub fn validate(&self, code: &str) -> Result<()> {
        let invalid = |field: &str, reason: String| FollicleError::InvalidSpeciesProfile {
            code: code.to_string(),
            field: field.to_string(),
            reason,
        };

        if !(self.min_overlap > 0.0 && self.min_overlap <= 1.0) {
            return Err(invalid(
                "min_overlap",
                format!("must be in (0, 1], got {}", self.min_overlap),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(invalid(
                "min_confidence",
                format!("must be in [0, 1], got {}", self.min_confidence),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_tissue_ratio) {
            return Err(invalid(
                "min_tissue_ratio",
                format!("must be in [0, 1], got {}", self.min_tissue_ratio),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SpeciesProfile {
    pub code: String,
    pub scientific_name: String,
    pub common_name: Option<String>,
    /// Follicle classes in developmental order.
    pub labels: Vec<String>,
    pub size_ranges: BTreeMap<String, SizeRange>,
    pub size_units: LengthUnit,
    /// Recommended tile edge length in pixels.
    pub tile_size: u32,
    /// Tie-break order, highest priority first.
    pub priority: Vec<String>,
    pub aliases: Vec<String>,
    pub thresholds: Thresholds,
}

impl SpeciesProfile {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    pub fn size_range(&self, label: &str) -> Option<SizeRange> {
        self.size_ranges.get(label).copied()
    }

    /// Position in the tie-break order; labels the species does not declare
    /// rank after every declared one.
    pub fn priority_rank(&self, label: &str) -> usize {
        self.priority
            .iter()
            .position(|l| l == label)
            .unwrap_or(self.priority.len())
    }

    /// `Less` when `a` wins a tie against `b`.
    pub fn compare_priority(&self, a: &str, b: &str) -> Ordering {
        self.priority_rank(a)
            .cmp(&self.priority_rank(b))
            .then_with(|| a.cmp(b))
    }

    pub fn validate(&self) -> Result<()> {
        let code = if self.code.is_empty() { "<unnamed>" } else { &self.code };
        let invalid = |field: &str, reason: &str| FollicleError::InvalidSpeciesProfile {
            code: code.to_string(),
            field: field.to_string(),
            reason: reason.to_string(),
        };

        if self.code.trim().is_empty() {
            return Err(invalid("code", "must not be empty"));
        }
        if self.scientific_name.trim().is_empty() {
            return Err(invalid("scientific_name", "must not be empty"));
        }
        if self.labels.is_empty() {
            return Err(invalid("labels", "must declare at least one follicle class"));
        }
        if self.tile_size == 0 {
            return Err(invalid("tile_size", "must be positive"));
        }

        let mut seen = Vec::with_capacity(self.labels.len());
        for label in &self.labels {
            if label.is_empty() {
                return Err(invalid("labels", "contains an empty label"));
            }
            if label == BACKGROUND_LABEL {
                return Err(invalid("labels", "must not contain the reserved 'background' class"));
            }
            if seen.contains(&label) {
                return Err(invalid("labels", &format!("declares '{}' twice", label)));
            }
            seen.push(label);

            let field = format!("size_ranges.{}", label);
            match self.size_ranges.get(label) {
                None => return Err(invalid(&field, "is missing")),
                Some(range) => {
                    if !range.min.is_finite() || !range.max.is_finite() {
                        return Err(invalid(&field, "must have finite bounds"));
                    }
                    if range.min < 0.0 {
                        return Err(invalid(&field, "must not be negative"));
                    }
                    if range.min >= range.max {
                        return Err(invalid(
                            &field,
                            &format!("has min {} not below max {}", range.min, range.max),
                        ));
                    }
                }
            }
        }

        if let Some(extra) = self.size_ranges.keys().find(|k| !self.has_label(k)) {
            return Err(invalid(
                &format!("size_ranges.{}", extra),
                "refers to an undeclared label",
            ));
        }

        let mut sorted_priority = self.priority.clone();
        sorted_priority.sort();
        let mut sorted_labels = self.labels.clone();
        sorted_labels.sort();
        if sorted_priority != sorted_labels {
            return Err(invalid("priority", "must list every label exactly once"));
        }

        self.thresholds.validate(code)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSpeciesFile {
    defaults: Option<ThresholdOverrides>,
    #[serde(default)]
    species: Vec<RawSpeciesProfile>,
}

// Everything optional so that a missing field can be reported by name.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSpeciesProfile {
    code: Option<String>,
    scientific_name: Option<String>,
    common_name: Option<String>,
    size_units: Option<String>,
    tile_size: Option<i64>,
    labels: Option<Vec<String>>,
    priority: Option<Vec<String>>,
    aliases: Option<Vec<String>>,
    size_ranges: Option<BTreeMap<String, Vec<f64>>>,
    min_overlap: Option<f64>,
    min_confidence: Option<f64>,
    min_tissue_ratio: Option<f64>,
}

impl RawSpeciesProfile {
    fn into_profile(self, defaults: Thresholds, position: usize) -> Result<SpeciesProfile> {
        let code = self
            .code
            .map(|c| c.trim().to_lowercase())
            .ok_or_else(|| FollicleError::InvalidSpeciesProfile {
                code: format!("<entry {}>", position),
                field: "code".to_string(),
                reason: "is missing".to_string(),
            })?;

        let missing = |field: &str| FollicleError::InvalidSpeciesProfile {
            code: code.clone(),
            field: field.to_string(),
            reason: "is missing".to_string(),
        };

        let scientific_name = self.scientific_name.ok_or_else(|| missing("scientific_name"))?;
        let labels: Vec<String> = self
            .labels
            .ok_or_else(|| missing("labels"))?
            .iter()
            .map(|l| normalize_name(l))
            .collect();
        let raw_ranges = self.size_ranges.ok_or_else(|| missing("size_ranges"))?;
        let tile_size = self.tile_size.ok_or_else(|| missing("tile_size"))?;

        let tile_size = u32::try_from(tile_size).map_err(|_| FollicleError::InvalidSpeciesProfile {
            code: code.clone(),
            field: "tile_size".to_string(),
            reason: format!("must be a positive pixel count, got {}", tile_size),
        })?;

        let size_units = match self.size_units {
            None => LengthUnit::Micrometer,
            Some(s) => s.parse().map_err(|reason| FollicleError::InvalidSpeciesProfile {
                code: code.clone(),
                field: "size_units".to_string(),
                reason,
            })?,
        };

        let mut size_ranges = BTreeMap::new();
        for (label, bounds) in raw_ranges {
            if bounds.len() != 2 {
                return Err(FollicleError::InvalidSpeciesProfile {
                    code: code.clone(),
                    field: format!("size_ranges.{}", label),
                    reason: format!("must be a [min, max] pair, got {} values", bounds.len()),
                });
            }
            size_ranges.insert(normalize_name(&label), SizeRange::new(bounds[0], bounds[1]));
        }

        // most developed stage is declared last and wins ties by default
        let priority = match self.priority {
            Some(priority) => priority.iter().map(|l| normalize_name(l)).collect(),
            None => labels.iter().rev().cloned().collect(),
        };

        let thresholds = defaults.with_overrides(&ThresholdOverrides {
            min_overlap: self.min_overlap,
            min_confidence: self.min_confidence,
            min_tissue_ratio: self.min_tissue_ratio,
        });

        let profile = SpeciesProfile {
            code,
            scientific_name,
            common_name: self.common_name,
            labels,
            size_ranges,
            size_units,
            tile_size,
            priority,
            aliases: self
                .aliases
                .unwrap_or_default()
                .iter()
                .map(|a| normalize_name(a))
                .collect(),
            thresholds,
        };
        profile.validate()?;
        Ok(profile)
    }
}

/// Lowercase, with spaces and hyphens folded to underscores.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase().replace([' ', '-'], "_")
}

#[derive(Clone, Debug, Default)]
pub struct SpeciesRegistry {
    profiles: Vec<SpeciesProfile>,
    index: HashMap<String, usize>,
}

impl SpeciesRegistry {
    pub fn new() -> Self {
        SpeciesRegistry::default()
    }

    /// The built-in rodent table.
    pub fn builtin() -> Result<Self> {
        Self::from_toml_str(BUILTIN_SPECIES_TOML)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let registry = Self::from_toml_str(&content)?;
        info!(
            "Loaded {} species from {}: {}",
            registry.len(),
            path.display(),
            registry.list().join(", ")
        );
        Ok(registry)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let raw: RawSpeciesFile = toml::from_str(content)?;

        let defaults = Thresholds::default().with_overrides(&raw.defaults.unwrap_or_default());
        defaults.validate("defaults")?;

        let mut registry = SpeciesRegistry::new();
        for (position, entry) in raw.species.into_iter().enumerate() {
            let profile = entry.into_profile(defaults, position)?;
            registry.register(profile, false)?;
        }
        Ok(registry)
    }

    pub fn get(&self, code: &str) -> Result<&SpeciesProfile> {
        self.index
            .get(code)
            .or_else(|| self.index.get(&code.to_lowercase()))
            .map(|&i| &self.profiles[i])
            .ok_or_else(|| FollicleError::UnknownSpecies(code.to_string()))
    }

    pub fn register(&mut self, profile: SpeciesProfile, allow_override: bool) -> Result<()> {
        profile.validate()?;

        match self.index.get(&profile.code) {
            Some(&i) => {
                if !allow_override {
                    return Err(FollicleError::DuplicateSpecies(profile.code));
                }
                info!("Overriding species profile '{}'", profile.code);
                self.profiles[i] = profile;
            }
            None => {
                debug!("Registered species profile '{}'", profile.code);
                self.index.insert(profile.code.clone(), self.profiles.len());
                self.profiles.push(profile);
            }
        }
        Ok(())
    }

    /// Layer another registry over this one; its profiles replace ones with
    /// the same code.
    pub fn extend(&mut self, other: SpeciesRegistry) -> Result<()> {
        for profile in other.profiles {
            self.register(profile, true)?;
        }
        Ok(())
    }

    /// Species codes in registration order.
    pub fn list(&self) -> Vec<&str> {
        self.profiles.iter().map(|p| p.code.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Resolve a code, alias, scientific or common name to a species code.
    pub fn resolve(&self, name: &str) -> Option<&str> {
        let name = normalize_name(name);
        self.profiles
            .iter()
            .find(|p| {
                p.code == name
                    || p.aliases.iter().any(|a| *a == name)
                    || normalize_name(&p.scientific_name) == name
                    || p.common_name.as_deref().map(normalize_name).as_deref() == Some(name.as_str())
            })
            .map(|p| p.code.as_str())
    }

    /// Class index map used by the classifier: 0 is background, then the
    /// species labels in declared order.
    pub fn labelmap(&self, code: &str) -> Result<Vec<(u32, String)>> {
        let profile = self.get(code)?;
        let mut labelmap = vec![(0, BACKGROUND_LABEL.to_string())];
        for (i, label) in profile.labels.iter().enumerate() {
            labelmap.push((i as u32 + 1, label.clone()));
        }
        Ok(labelmap)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::mouse_profile;
    use super::*;

    fn field_of(err: FollicleError) -> String {
        match err {
            FollicleError::InvalidSpeciesProfile { field, .. } => field,
            other => panic!("expected InvalidSpeciesProfile, got {:?}", other),
        }
    }

    #[test]
    fn test_builtin_registry() {
        let registry = SpeciesRegistry::builtin().unwrap();
        assert_eq!(registry.list(), vec!["mouse", "rat", "nmr", "guinea_pig", "hamster"]);

        let mouse = registry.get("mouse").unwrap();
        assert_eq!(mouse.size_range("primordial"), Some(SizeRange::new(15.0, 25.0)));
        assert_eq!(mouse.tile_size, 256);
        assert_eq!(mouse.priority[0], "antral");
        assert_eq!(mouse.thresholds, Thresholds::default());

        assert_eq!(registry.get("rat").unwrap().tile_size, 512);
        assert_eq!(registry.get("nmr").unwrap().labels.len(), 6);
    }

    #[test]
    fn test_unknown_species() {
        let registry = SpeciesRegistry::builtin().unwrap();
        assert!(matches!(
            registry.get("axolotl"),
            Err(FollicleError::UnknownSpecies(code)) if code == "axolotl"
        ));
    }

    #[test]
    fn test_get_is_case_insensitive() {
        let registry = SpeciesRegistry::builtin().unwrap();
        assert_eq!(registry.get("Mouse").unwrap().code, "mouse");
    }

    #[test]
    fn test_register_duplicate() {
        let mut registry = SpeciesRegistry::new();
        registry.register(mouse_profile(), false).unwrap();
        assert!(matches!(
            registry.register(mouse_profile(), false),
            Err(FollicleError::DuplicateSpecies(_))
        ));

        let mut replacement = mouse_profile();
        replacement.tile_size = 512;
        registry.register(replacement, true).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("mouse").unwrap().tile_size, 512);
    }

    #[test]
    fn test_extend_overrides_builtin() {
        let mut registry = SpeciesRegistry::builtin().unwrap();
        let mut mouse = mouse_profile();
        mouse.tile_size = 128;
        let mut user = SpeciesRegistry::new();
        user.register(mouse, false).unwrap();

        registry.extend(user).unwrap();
        assert_eq!(registry.len(), 5);
        assert_eq!(registry.get("mouse").unwrap().tile_size, 128);
        assert_eq!(registry.list()[0], "mouse");
    }

    #[test]
    fn test_resolve_names() {
        let registry = SpeciesRegistry::builtin().unwrap();
        assert_eq!(registry.resolve("Mus musculus"), Some("mouse"));
        assert_eq!(registry.resolve("naked-mole-rat"), Some("nmr"));
        assert_eq!(registry.resolve("Syrian Hamster"), Some("hamster"));
        assert_eq!(registry.resolve("GUINEA_PIG"), Some("guinea_pig"));
        assert_eq!(registry.resolve("c_porcellus"), Some("guinea_pig"));
        assert_eq!(registry.resolve("zebrafish"), None);
    }

    #[test]
    fn test_labelmap() {
        let registry = SpeciesRegistry::builtin().unwrap();
        let labelmap = registry.labelmap("mouse").unwrap();
        assert_eq!(labelmap[0], (0, "background".to_string()));
        assert_eq!(labelmap[4], (4, "antral".to_string()));
        assert_eq!(labelmap.len(), 5);
    }

    #[test]
    fn test_priority_rank() {
        let profile = mouse_profile();
        assert_eq!(profile.priority_rank("antral"), 0);
        assert_eq!(profile.priority_rank("primordial"), 3);
        assert_eq!(profile.priority_rank("atretic"), 4);
        assert_eq!(profile.compare_priority("antral", "primary"), Ordering::Less);
        assert_eq!(profile.compare_priority("atretic", "primordial"), Ordering::Greater);
        assert_eq!(profile.compare_priority("atretic", "cyst"), Ordering::Less);
    }

    #[test]
    fn test_inverted_range_rejected() {
        let toml = r#"
            [[species]]
            code = "vole"
            scientific_name = "Microtus arvalis"
            tile_size = 256
            labels = ["primordial"]
            [species.size_ranges]
            primordial = [30, 10]
        "#;
        let err = SpeciesRegistry::from_toml_str(toml).unwrap_err();
        assert_eq!(field_of(err), "size_ranges.primordial");
    }

    #[test]
    fn test_equal_bounds_rejected() {
        let mut profile = mouse_profile();
        profile.size_ranges.insert("primary".to_string(), SizeRange::new(30.0, 30.0));
        assert_eq!(field_of(profile.validate().unwrap_err()), "size_ranges.primary");
    }

    #[test]
    fn test_missing_field_named() {
        let toml = r#"
            [[species]]
            code = "vole"
            tile_size = 256
            labels = ["primordial"]
            [species.size_ranges]
            primordial = [10, 30]
        "#;
        let err = SpeciesRegistry::from_toml_str(toml).unwrap_err();
        assert_eq!(field_of(err), "scientific_name");
    }

    #[test]
    fn test_empty_labels_rejected() {
        let toml = r#"
            [[species]]
            code = "vole"
            scientific_name = "Microtus arvalis"
            tile_size = 256
            labels = []
            [species.size_ranges]
        "#;
        let err = SpeciesRegistry::from_toml_str(toml).unwrap_err();
        assert_eq!(field_of(err), "labels");
    }

    #[test]
    fn test_missing_size_range_rejected() {
        let mut profile = mouse_profile();
        profile.size_ranges.remove("antral");
        assert_eq!(field_of(profile.validate().unwrap_err()), "size_ranges.antral");
    }

    #[test]
    fn test_bad_priority_rejected() {
        let mut profile = mouse_profile();
        profile.priority.pop();
        assert_eq!(field_of(profile.validate().unwrap_err()), "priority");
    }

    #[test]
    fn test_background_label_reserved() {
        let mut profile = mouse_profile();
        profile.labels.push(BACKGROUND_LABEL.to_string());
        profile
            .size_ranges
            .insert(BACKGROUND_LABEL.to_string(), SizeRange::new(0.0, 1.0));
        profile.priority.push(BACKGROUND_LABEL.to_string());
        assert_eq!(field_of(profile.validate().unwrap_err()), "labels");
    }

    #[test]
    fn test_threshold_overrides() {
        let toml = r#"
            [defaults]
            min_overlap = 0.1
            min_tissue_ratio = 0.5

            [[species]]
            code = "vole"
            scientific_name = "Microtus arvalis"
            size_units = "px"
            tile_size = 128
            labels = ["primordial", "primary"]
            priority = ["primordial", "primary"]
            min_confidence = 0.3
            [species.size_ranges]
            primordial = [10, 30]
            primary = [30, 60]
        "#;
        let registry = SpeciesRegistry::from_toml_str(toml).unwrap();
        let vole = registry.get("vole").unwrap();
        assert_eq!(
            vole.thresholds,
            Thresholds {
                min_overlap: 0.1,
                min_confidence: 0.3,
                min_tissue_ratio: 0.5,
            }
        );
        assert_eq!(vole.size_units, LengthUnit::Pixel);
        assert_eq!(vole.priority_rank("primordial"), 0);
    }

    #[test]
    fn test_zero_min_overlap_rejected() {
        let mut profile = mouse_profile();
        profile.thresholds.min_overlap = 0.0;
        assert_eq!(field_of(profile.validate().unwrap_err()), "min_overlap");
    }

    #[test]
    fn test_unknown_units_rejected() {
        let toml = r#"
            [[species]]
            code = "vole"
            scientific_name = "Microtus arvalis"
            size_units = "furlong"
            tile_size = 128
            labels = ["primordial"]
            [species.size_ranges]
            primordial = [10, 30]
        "#;
        let err = SpeciesRegistry::from_toml_str(toml).unwrap_err();
        assert_eq!(field_of(err), "size_units");
    }
}
