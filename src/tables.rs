// CSV table plumbing shared by the manifest, prediction and diagnostics
// readers/writers. Files ending in `.gz` are transparently (de)compressed.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use crate::errors::{FollicleError, Result};

fn is_gzipped(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == "gz")
}

pub fn open_csv_reader(path: &Path) -> Result<csv::Reader<Box<dyn Read>>> {
    let input = File::open(path)?;
    let input: Box<dyn Read> = if is_gzipped(path) {
        Box::new(GzDecoder::new(input))
    } else {
        Box::new(input)
    };
    Ok(csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(input))
}

pub fn create_csv_writer(path: &Path) -> Result<csv::Writer<Box<dyn Write>>> {
    let output = File::create(path)?;
    let output: Box<dyn Write> = if is_gzipped(path) {
        Box::new(GzEncoder::new(output, Compression::default()))
    } else {
        Box::new(output)
    };
    Ok(csv::Writer::from_writer(output))
}

pub fn find_column(headers: &csv::StringRecord, column: &str, path: &Path) -> Result<usize> {
    headers
        .iter()
        .position(|x| x == column)
        .ok_or_else(|| FollicleError::InvalidTable {
            path: path.display().to_string(),
            reason: format!("column '{}' not found", column),
        })
}

pub fn find_optional_column(headers: &csv::StringRecord, column: &str) -> Option<usize> {
    headers.iter().position(|x| x == column)
}

/// Parse field `col` of a row, naming the column and line on failure.
pub fn parse_field<T: std::str::FromStr>(
    row: &csv::StringRecord,
    col: usize,
    column: &str,
    path: &Path,
) -> Result<T> {
    let value = row.get(col).unwrap_or("");
    value.parse().map_err(|_| FollicleError::InvalidTable {
        path: path.display().to_string(),
        reason: format!(
            "invalid {} '{}' on line {}",
            column,
            value,
            row.position().map_or(0, |p| p.line())
        ),
    })
}
