pub mod annotation;
pub mod diagnostics;
pub mod errors;
pub mod export;
pub mod geojson;
pub mod manifest;
pub mod mapper;
pub mod pipeline;
pub mod polygon_area;
pub mod polygons;
pub mod species;
pub mod tables;
pub mod tiles;
pub mod validate;

pub use errors::{FollicleError, Result};
