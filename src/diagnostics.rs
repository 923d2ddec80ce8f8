// Accumulated report of every dropped, flagged or demoted item. Nothing is
// discarded silently: per-item problems land here instead of aborting a batch.

use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use crate::annotation::SourceId;
use crate::errors::Result;
use crate::tables::create_csv_writer;
use crate::tiles::TileId;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Soft,
    Hard,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Soft => write!(f, "soft"),
            Severity::Hard => write!(f, "hard"),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DiagnosticKind {
    DegenerateGeometry,
    MissingClassification,
    SizeRangeWarning,
    ClassMismatchWarning,
    SpeciesMismatch,
    UnknownSpecies,
    LowConfidenceDowngrade,
    UnknownTile,
    DuplicatePrediction,
    InvalidPrediction,
    RenamedAnnotationId,
}

impl DiagnosticKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiagnosticKind::DegenerateGeometry => "DegenerateGeometry",
            DiagnosticKind::MissingClassification => "MissingClassification",
            DiagnosticKind::SizeRangeWarning => "SizeRangeWarning",
            DiagnosticKind::ClassMismatchWarning => "ClassMismatchWarning",
            DiagnosticKind::SpeciesMismatch => "SpeciesMismatch",
            DiagnosticKind::UnknownSpecies => "UnknownSpecies",
            DiagnosticKind::LowConfidenceDowngrade => "LowConfidenceDowngrade",
            DiagnosticKind::UnknownTile => "UnknownTile",
            DiagnosticKind::DuplicatePrediction => "DuplicatePrediction",
            DiagnosticKind::InvalidPrediction => "InvalidPrediction",
            DiagnosticKind::RenamedAnnotationId => "RenamedAnnotationId",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            DiagnosticKind::DegenerateGeometry
            | DiagnosticKind::MissingClassification
            | DiagnosticKind::SpeciesMismatch
            | DiagnosticKind::UnknownSpecies
            | DiagnosticKind::UnknownTile
            | DiagnosticKind::InvalidPrediction => Severity::Hard,
            DiagnosticKind::SizeRangeWarning
            | DiagnosticKind::ClassMismatchWarning
            | DiagnosticKind::DuplicatePrediction
            | DiagnosticKind::RenamedAnnotationId => Severity::Soft,
            DiagnosticKind::LowConfidenceDowngrade => Severity::Info,
        }
    }
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub slide_id: String,
    pub source_id: Option<String>,
    pub tile_id: Option<String>,
    pub message: String,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, slide_id: &str, message: String) -> Self {
        Diagnostic {
            kind,
            slide_id: slide_id.to_string(),
            source_id: None,
            tile_id: None,
            message,
        }
    }

    pub fn with_source(mut self, source: &SourceId) -> Self {
        self.source_id = Some(source.to_string());
        self
    }

    pub fn with_tile(mut self, tile: &TileId) -> Self {
        self.tile_id = Some(tile.to_string());
        self
    }

    pub fn severity(&self) -> Severity {
        self.kind.severity()
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.kind, self.slide_id)?;
        if let Some(source_id) = &self.source_id {
            write!(f, " annotation {}", source_id)?;
        }
        if let Some(tile_id) = &self.tile_id {
            write!(f, " tile {}", tile_id)?;
        }
        write!(f, ": {}", self.message)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Diagnostics::default()
    }

    pub fn record(&mut self, diagnostic: Diagnostic) {
        match diagnostic.severity() {
            Severity::Hard => warn!("{}", diagnostic),
            Severity::Soft => info!("{}", diagnostic),
            Severity::Info => debug!("{}", diagnostic),
        }
        self.entries.push(diagnostic);
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.entries.extend(other.entries);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.entries.iter().filter(|d| d.kind == kind).count()
    }

    pub fn counts(&self) -> BTreeMap<DiagnosticKind, usize> {
        let mut counts = BTreeMap::new();
        for diagnostic in &self.entries {
            *counts.entry(diagnostic.kind).or_insert(0) += 1;
        }
        counts
    }

    pub fn log_summary(&self) {
        if self.entries.is_empty() {
            info!("No diagnostics recorded");
            return;
        }
        for (kind, count) in self.counts() {
            info!("  {} ({}): {}", kind, kind.severity(), count);
        }
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut writer = create_csv_writer(path)?;
        writer.write_record(["kind", "severity", "slide_id", "annotation_id", "tile_id", "message"])?;
        for d in &self.entries {
            writer.write_record([
                d.kind.as_str(),
                &d.severity().to_string(),
                &d.slide_id,
                d.source_id.as_deref().unwrap_or(""),
                d.tile_id.as_deref().unwrap_or(""),
                &d.message,
            ])?;
        }
        writer.flush()?;
        Ok(())
    }
}
