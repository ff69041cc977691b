//! Common types and constants used throughout the pipeline.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, StringArray};
use arrow::compute::{SortOptions, sort_to_indices, take};
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Name of the canonical key column in every normalized dataset.
pub const KEY_COLUMN: &str = "GEOID";

/// Name of the WKB geometry column in normalized geometry datasets.
pub const GEOMETRY_COLUMN: &str = "geometry";

// ============================================================================
// Region codes
// ============================================================================

/// Two-digit FIPS code identifying one source unit (a state or territory).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegionCode(String);

impl RegionCode {
    /// Parse a region code. Only two ASCII digits are accepted.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() == 2 && s.bytes().all(|b| b.is_ascii_digit()) {
            Some(Self(s.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RegionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Mapping from region code to USPS abbreviation.
///
/// Units whose code is absent have geometry but no population coverage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionLookup {
    entries: BTreeMap<RegionCode, String>,
}

impl RegionLookup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) one mapping. Returns `None` for an invalid code.
    pub fn with(mut self, code: &str, abbreviation: &str) -> Option<Self> {
        let code = RegionCode::parse(code)?;
        self.entries.insert(code, abbreviation.to_string());
        Some(self)
    }

    /// Population coverage for the 2020 blocks: the 50 states and DC.
    ///
    /// Puerto Rico and the island areas are geometry-only.
    pub fn census_2020() -> Self {
        const TABLE: [(&str, &str); 51] = [
            ("01", "AL"),
            ("02", "AK"),
            ("04", "AZ"),
            ("05", "AR"),
            ("06", "CA"),
            ("08", "CO"),
            ("09", "CT"),
            ("10", "DE"),
            ("11", "DC"),
            ("12", "FL"),
            ("13", "GA"),
            ("15", "HI"),
            ("16", "ID"),
            ("17", "IL"),
            ("18", "IN"),
            ("19", "IA"),
            ("20", "KS"),
            ("21", "KY"),
            ("22", "LA"),
            ("23", "ME"),
            ("24", "MD"),
            ("25", "MA"),
            ("26", "MI"),
            ("27", "MN"),
            ("28", "MS"),
            ("29", "MO"),
            ("30", "MT"),
            ("31", "NE"),
            ("32", "NV"),
            ("33", "NH"),
            ("34", "NJ"),
            ("35", "NM"),
            ("36", "NY"),
            ("37", "NC"),
            ("38", "ND"),
            ("39", "OH"),
            ("40", "OK"),
            ("41", "OR"),
            ("42", "PA"),
            ("44", "RI"),
            ("45", "SC"),
            ("46", "SD"),
            ("47", "TN"),
            ("48", "TX"),
            ("49", "UT"),
            ("50", "VT"),
            ("51", "VA"),
            ("53", "WA"),
            ("54", "WV"),
            ("55", "WI"),
            ("56", "WY"),
        ];
        let entries = TABLE
            .iter()
            .filter_map(|(code, abbr)| RegionCode::parse(code).map(|c| (c, abbr.to_string())))
            .collect();
        Self { entries }
    }

    pub fn abbreviation(&self, code: &RegionCode) -> Option<&str> {
        self.entries.get(code).map(String::as_str)
    }

    pub fn contains(&self, code: &RegionCode) -> bool {
        self.entries.contains_key(code)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Key ranges
// ============================================================================

/// Inclusive key range `[first, last]` covered by one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub first: String,
    pub last: String,
}

/// A normalized unit dataset written to scratch storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitOutput {
    pub unit: RegionCode,
    pub path: PathBuf,
    pub rows: usize,
}

// ============================================================================
// Arrow helpers
// ============================================================================

/// Look up a Utf8 column by name.
pub fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Option<&'a StringArray> {
    batch
        .column_by_name(name)?
        .as_any()
        .downcast_ref::<StringArray>()
}

/// Sort a normalized unit dataset by its key column and reject duplicate keys.
///
/// `what` names the dataset in the error ("population key", "geometry key").
pub fn sort_unique_by_key(
    batch: &RecordBatch,
    unit: &RegionCode,
    what: &'static str,
) -> Result<RecordBatch, PipelineError> {
    let missing = || PipelineError::MissingColumn {
        unit: Some(unit.clone()),
        column: KEY_COLUMN.to_string(),
        source_name: what.to_string(),
    };
    let keys = batch.column_by_name(KEY_COLUMN).ok_or_else(missing)?;
    let arrow_err = |source: arrow::error::ArrowError| PipelineError::Arrow {
        unit: Some(unit.clone()),
        path: what.into(),
        source,
    };

    let indices = sort_to_indices(keys.as_ref(), Some(SortOptions::default()), None)
        .map_err(arrow_err)?;
    let columns: Vec<ArrayRef> = batch
        .columns()
        .iter()
        .map(|c| take(c.as_ref(), &indices, None))
        .collect::<Result<_, _>>()
        .map_err(arrow_err)?;
    let sorted = RecordBatch::try_new(batch.schema(), columns).map_err(arrow_err)?;

    let sorted_keys = string_column(&sorted, KEY_COLUMN).ok_or_else(missing)?;
    if sorted_keys.null_count() > 0 {
        return Err(PipelineError::MalformedValue {
            unit: unit.clone(),
            column: KEY_COLUMN.to_string(),
            value: "<null>".to_string(),
        });
    }
    for i in 1..sorted_keys.len() {
        if sorted_keys.value(i - 1) == sorted_keys.value(i) {
            return Err(PipelineError::NonUniqueKey {
                unit: unit.clone(),
                what,
                key: sorted_keys.value(i).to_string(),
            });
        }
    }
    Ok(sorted)
}

/// Build a batch from `(name, array)` pairs, all nullable except the key.
pub(crate) fn batch_from_columns(
    columns: Vec<(String, ArrayRef)>,
) -> Result<RecordBatch, arrow::error::ArrowError> {
    use arrow::datatypes::{Field, Schema};

    let fields: Vec<Field> = columns
        .iter()
        .map(|(name, array)| Field::new(name, array.data_type().clone(), name != KEY_COLUMN))
        .collect();
    let arrays = columns.into_iter().map(|(_, a)| a).collect();
    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_code_parse() {
        assert_eq!(RegionCode::parse("06").unwrap().as_str(), "06");
        assert!(RegionCode::parse("6").is_none());
        assert!(RegionCode::parse("CA").is_none());
        assert!(RegionCode::parse("060").is_none());
    }

    #[test]
    fn test_census_lookup() {
        let lookup = RegionLookup::census_2020();
        assert_eq!(lookup.len(), 51);
        assert_eq!(
            lookup.abbreviation(&RegionCode::parse("06").unwrap()),
            Some("CA")
        );
        // Territories are geometry-only.
        assert!(!lookup.contains(&RegionCode::parse("72").unwrap()));
        assert!(!lookup.contains(&RegionCode::parse("78").unwrap()));
    }

    #[test]
    fn test_sort_unique_by_key() {
        let unit = RegionCode::parse("06").unwrap();
        let batch = batch_from_columns(vec![
            (
                KEY_COLUMN.to_string(),
                Arc::new(StringArray::from(vec!["060000000000003", "060000000000001"])) as ArrayRef,
            ),
            (
                "P0010001".to_string(),
                Arc::new(arrow::array::Int64Array::from(vec![Some(3), None])) as ArrayRef,
            ),
        ])
        .unwrap();
        let sorted = sort_unique_by_key(&batch, &unit, "population key").unwrap();
        let keys = string_column(&sorted, KEY_COLUMN).unwrap();
        assert_eq!(keys.value(0), "060000000000001");
        assert_eq!(keys.value(1), "060000000000003");
        let counts = sorted
            .column(1)
            .as_any()
            .downcast_ref::<arrow::array::Int64Array>()
            .unwrap();
        assert!(counts.is_null(0));
        assert_eq!(counts.value(1), 3);
    }

    #[test]
    fn test_sort_unique_by_key_rejects_duplicates() {
        let unit = RegionCode::parse("06").unwrap();
        let batch = batch_from_columns(vec![(
            KEY_COLUMN.to_string(),
            Arc::new(StringArray::from(vec![
                "060000000000002",
                "060000000000001",
                "060000000000002",
            ])) as ArrayRef,
        )])
        .unwrap();
        let err = sort_unique_by_key(&batch, &unit, "population key").unwrap_err();
        match err {
            PipelineError::NonUniqueKey { key, .. } => assert_eq!(key, "060000000000002"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
