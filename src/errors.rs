// Error type shared by the library and both binaries.

use thiserror::Error;

use crate::species::LengthUnit;

#[derive(Debug, Error)]
pub enum FollicleError {
    #[error("unknown species '{0}'")]
    UnknownSpecies(String),

    #[error("species '{0}' is already registered")]
    DuplicateSpecies(String),

    #[error("invalid species profile '{code}': field '{field}' {reason}")]
    InvalidSpeciesProfile {
        code: String,
        field: String,
        reason: String,
    },

    #[error("species '{species}' declares sizes in {expected} but coordinates are scaled to {found}")]
    UnitsMismatch {
        species: String,
        expected: LengthUnit,
        found: LengthUnit,
    },

    #[error("pixel size must be a positive finite number, got {0}")]
    InvalidPixelScale(f64),

    #[error("invalid GeoJSON: {0}")]
    InvalidGeoJson(String),

    #[error("invalid tile grid: {0}")]
    InvalidTileGrid(String),

    #[error("invalid table '{path}': {reason}")]
    InvalidTable { path: String, reason: String },

    #[error("invalid tile id '{0}', expected slide:x:y")]
    InvalidTileId(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, FollicleError>;
