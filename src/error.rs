//! Error taxonomy for the block pipeline.
//!
//! Every failure is fatal for the run. Variants carry the unit (region code)
//! they were raised for whenever one is known, so a failed run says which
//! state to look at and which invariant broke.

use std::path::PathBuf;

use thiserror::Error;

use crate::common::RegionCode;
use crate::key::KeyError;

/// Coarse classification of a [`PipelineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or malformed input files, unknown schema columns.
    SourceIntegrity,
    /// A raw identifier could not be turned into a canonical key.
    KeyNormalization,
    /// Uniqueness, row-count parity or partition ordering was violated.
    Consistency,
    /// Nothing (or not enough) to process.
    Coverage,
}

impl ErrorKind {
    /// Process exit code used by the binary for this kind of failure.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::SourceIntegrity => 2,
            ErrorKind::KeyNormalization => 3,
            ErrorKind::Consistency => 4,
            ErrorKind::Coverage => 5,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::SourceIntegrity => "source integrity",
            ErrorKind::KeyNormalization => "key normalization",
            ErrorKind::Consistency => "consistency",
            ErrorKind::Coverage => "coverage",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Source integrity ────────────────────────────────────────────────
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        unit: Option<RegionCode>,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", .path.display())]
    Arrow {
        unit: Option<RegionCode>,
        path: PathBuf,
        #[source]
        source: arrow::error::ArrowError,
    },

    #[error("parquet error on {}: {source}", .path.display())]
    Parquet {
        unit: Option<RegionCode>,
        path: PathBuf,
        #[source]
        source: parquet::errors::ParquetError,
    },

    #[error("unit {unit}: failed to read geometry from {}: {message}", .path.display())]
    Geometry {
        unit: RegionCode,
        path: PathBuf,
        message: String,
    },

    #[error("failed to read field schema from {}: {message}", .path.display())]
    FieldSchema { path: PathBuf, message: String },

    #[error("unit {}: column '{column}' missing from {source_name}", MaybeUnit(.unit))]
    MissingColumn {
        unit: Option<RegionCode>,
        column: String,
        source_name: String,
    },

    #[error("unit {unit}: column '{column}' has malformed value '{value}'")]
    MalformedValue {
        unit: RegionCode,
        column: String,
        value: String,
    },

    #[error("cannot parse a region code from file name {}", .path.display())]
    UnparseableFileName { path: PathBuf },

    #[error("unit {unit}: region code is not in the lookup table")]
    UnknownRegion { unit: RegionCode },

    #[error("invalid glob pattern '{pattern}': {message}")]
    Pattern { pattern: String, message: String },

    #[error("failed to build worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    // ── Key normalization ───────────────────────────────────────────────
    #[error("unit {unit}: {source}")]
    Key {
        unit: RegionCode,
        #[source]
        source: KeyError,
    },

    // ── Consistency ─────────────────────────────────────────────────────
    #[error("unit {unit}: {what} '{key}' is not unique")]
    NonUniqueKey {
        unit: RegionCode,
        what: &'static str,
        key: String,
    },

    #[error(
        "unit {unit}: geometry/population join lost rows \
         (geometry {geometry_rows}, population {population_rows}, joined {joined_rows})"
    )]
    RowCountMismatch {
        unit: RegionCode,
        geometry_rows: usize,
        population_rows: usize,
        joined_rows: usize,
    },

    #[error("{dataset}: partition for unit {unit} is not sorted ('{previous}' before '{next}')")]
    UnsortedPartition {
        dataset: String,
        unit: RegionCode,
        previous: String,
        next: String,
    },

    #[error(
        "{dataset}: partitions overlap (unit {left} ends at '{left_last}', \
         unit {right} starts at '{right_first}')"
    )]
    OverlappingPartitions {
        dataset: String,
        left: RegionCode,
        left_last: String,
        right: RegionCode,
        right_first: String,
    },

    #[error("{dataset}: partition for unit {unit} is empty")]
    EmptyPartition { dataset: String, unit: RegionCode },

    #[error("{dataset}: key '{key}' in unit {unit} lies outside that unit's region")]
    ForeignKeyInUnit {
        dataset: String,
        unit: RegionCode,
        key: String,
    },

    #[error("{dataset}: schema of unit {unit} differs from unit {expected_from}")]
    SchemaMismatch {
        dataset: String,
        unit: RegionCode,
        expected_from: RegionCode,
    },

    #[error("{dataset}: persisted output disagrees with its manifest: {message}")]
    ManifestMismatch { dataset: String, message: String },

    #[error("unit {unit} appears more than once in {}", .dir.display())]
    DuplicateUnit { unit: RegionCode, dir: PathBuf },

    // ── Coverage ────────────────────────────────────────────────────────
    #[error("no {what} units found under {}", .dir.display())]
    NoUnits { what: &'static str, dir: PathBuf },
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Io { .. }
            | PipelineError::Arrow { .. }
            | PipelineError::Parquet { .. }
            | PipelineError::Geometry { .. }
            | PipelineError::FieldSchema { .. }
            | PipelineError::MissingColumn { .. }
            | PipelineError::MalformedValue { .. }
            | PipelineError::UnparseableFileName { .. }
            | PipelineError::UnknownRegion { .. }
            | PipelineError::Pattern { .. }
            | PipelineError::WorkerPool(_) => ErrorKind::SourceIntegrity,
            PipelineError::Key { .. } => ErrorKind::KeyNormalization,
            PipelineError::NonUniqueKey { .. }
            | PipelineError::RowCountMismatch { .. }
            | PipelineError::UnsortedPartition { .. }
            | PipelineError::OverlappingPartitions { .. }
            | PipelineError::EmptyPartition { .. }
            | PipelineError::ForeignKeyInUnit { .. }
            | PipelineError::SchemaMismatch { .. }
            | PipelineError::ManifestMismatch { .. }
            | PipelineError::DuplicateUnit { .. } => ErrorKind::Consistency,
            PipelineError::NoUnits { .. } => ErrorKind::Coverage,
        }
    }

    /// The unit this error was raised for, if any.
    pub fn unit(&self) -> Option<&RegionCode> {
        match self {
            PipelineError::Io { unit, .. }
            | PipelineError::Arrow { unit, .. }
            | PipelineError::Parquet { unit, .. }
            | PipelineError::MissingColumn { unit, .. } => unit.as_ref(),
            PipelineError::Geometry { unit, .. }
            | PipelineError::MalformedValue { unit, .. }
            | PipelineError::UnknownRegion { unit }
            | PipelineError::Key { unit, .. }
            | PipelineError::NonUniqueKey { unit, .. }
            | PipelineError::RowCountMismatch { unit, .. }
            | PipelineError::UnsortedPartition { unit, .. }
            | PipelineError::EmptyPartition { unit, .. }
            | PipelineError::ForeignKeyInUnit { unit, .. }
            | PipelineError::SchemaMismatch { unit, .. }
            | PipelineError::DuplicateUnit { unit, .. } => Some(unit),
            PipelineError::OverlappingPartitions { right, .. } => Some(right),
            PipelineError::FieldSchema { .. }
            | PipelineError::UnparseableFileName { .. }
            | PipelineError::Pattern { .. }
            | PipelineError::WorkerPool(_)
            | PipelineError::ManifestMismatch { .. }
            | PipelineError::NoUnits { .. } => None,
        }
    }
}

/// Render an optional unit for error messages.
pub(crate) struct MaybeUnit<'a>(pub &'a Option<RegionCode>);

impl std::fmt::Display for MaybeUnit<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(unit) => write!(f, "{unit}"),
            None => f.write_str("-"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_and_exit_codes() {
        let unit = RegionCode::parse("06").unwrap();
        let key = PipelineError::Key {
            unit: unit.clone(),
            source: KeyError::Malformed {
                key: "06".to_string(),
                expected_len: 15,
            },
        };
        assert_eq!(key.kind().exit_code(), 3);
        assert_eq!(key.unit(), Some(&unit));

        let coverage = PipelineError::NoUnits {
            what: "geometry",
            dir: PathBuf::from("TABBLOCK20"),
        };
        assert_eq!(coverage.kind(), ErrorKind::Coverage);
        assert_eq!(coverage.kind().exit_code(), 5);
        assert_eq!(coverage.unit(), None);
    }

    #[test]
    fn test_missing_column_message_without_unit() {
        let err = PipelineError::MissingColumn {
            unit: None,
            column: "GEOID".to_string(),
            source_name: "geo-header".to_string(),
        };
        assert_eq!(err.to_string(), "unit -: column 'GEOID' missing from geo-header");
        assert_eq!(err.kind().exit_code(), 2);
    }
}
