//! Per-unit join parity between geometry and population.

use std::collections::HashSet;
use std::path::Path;

use arrow::record_batch::RecordBatch;
use tracing::debug;

use crate::common::{KEY_COLUMN, RegionCode, string_column};
use crate::error::PipelineError;
use crate::storage::read_column;

/// Inner-join a unit's geometry and population on the key and require the
/// joined row count to equal both input row counts: every block has a
/// population row and every population row has a block.
pub fn validate_unit(
    unit: &RegionCode,
    geometry: &RecordBatch,
    population: &RecordBatch,
) -> Result<usize, PipelineError> {
    let missing = |source_name: &str| PipelineError::MissingColumn {
        unit: Some(unit.clone()),
        column: KEY_COLUMN.to_string(),
        source_name: source_name.to_string(),
    };
    let geometry_keys = string_column(geometry, KEY_COLUMN).ok_or_else(|| missing("geometry"))?;
    let population_keys =
        string_column(population, KEY_COLUMN).ok_or_else(|| missing("population"))?;
    check_parity(
        unit,
        geometry_keys.iter().flatten(),
        population_keys.iter().flatten(),
    )
}

/// Same check as [`validate_unit`], reading only the key columns of two
/// scratch Parquet files.
pub fn validate_unit_files(
    unit: &RegionCode,
    geometry: &Path,
    population: &Path,
) -> Result<usize, PipelineError> {
    let read_keys = |path: &Path| -> Result<RecordBatch, PipelineError> {
        let column = read_column(path, KEY_COLUMN, Some(unit))?.ok_or_else(|| {
            PipelineError::MissingColumn {
                unit: Some(unit.clone()),
                column: KEY_COLUMN.to_string(),
                source_name: path.display().to_string(),
            }
        })?;
        RecordBatch::try_from_iter([(KEY_COLUMN, column)]).map_err(|source| PipelineError::Arrow {
            unit: Some(unit.clone()),
            path: path.to_path_buf(),
            source,
        })
    };
    validate_unit(unit, &read_keys(geometry)?, &read_keys(population)?)
}

fn check_parity<'a>(
    unit: &RegionCode,
    geometry: impl Iterator<Item = &'a str>,
    population: impl Iterator<Item = &'a str>,
) -> Result<usize, PipelineError> {
    let population: HashSet<&str> = population.collect();
    let mut geometry_rows = 0;
    let mut joined_rows = 0;
    for key in geometry {
        geometry_rows += 1;
        if population.contains(key) {
            joined_rows += 1;
        }
    }
    debug!(
        "Unit {unit}: {joined_rows} joined of {geometry_rows} geometry and {} population rows",
        population.len()
    );
    if joined_rows != geometry_rows || joined_rows != population.len() {
        return Err(PipelineError::RowCountMismatch {
            unit: unit.clone(),
            geometry_rows,
            population_rows: population.len(),
            joined_rows,
        });
    }
    Ok(joined_rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use arrow::array::{ArrayRef, StringArray};

    use crate::common::batch_from_columns;
    use crate::storage::write_parquet;

    fn keys(values: &[&str]) -> RecordBatch {
        batch_from_columns(vec![(
            KEY_COLUMN.to_string(),
            Arc::new(StringArray::from(values.to_vec())) as ArrayRef,
        )])
        .unwrap()
    }

    fn ca() -> RegionCode {
        RegionCode::parse("06").unwrap()
    }

    #[test]
    fn test_full_coverage() {
        let geo = keys(&["060000000000001", "060000000000002", "060000000000003"]);
        let pop = keys(&["060000000000003", "060000000000001", "060000000000002"]);
        assert_eq!(validate_unit(&ca(), &geo, &pop).unwrap(), 3);
    }

    #[test]
    fn test_population_key_without_geometry() {
        let geo = keys(&["060014001001000", "060014001001001"]);
        let pop = keys(&["060014001001000", "060014001001001", "060014001001002"]);
        match validate_unit(&ca(), &geo, &pop).unwrap_err() {
            PipelineError::RowCountMismatch {
                geometry_rows,
                population_rows,
                joined_rows,
                ..
            } => {
                assert_eq!(geometry_rows, 2);
                assert_eq!(population_rows, 3);
                assert_eq!(joined_rows, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_population_row() {
        let geo = keys(&["060000000000001", "060000000000002", "060000000000003"]);
        let pop = keys(&["060000000000001", "060000000000003"]);
        match validate_unit(&ca(), &geo, &pop).unwrap_err() {
            PipelineError::RowCountMismatch {
                geometry_rows,
                population_rows,
                joined_rows,
                ..
            } => {
                assert_eq!(geometry_rows, 3);
                assert_eq!(population_rows, 2);
                assert_eq!(joined_rows, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_validate_files() {
        let dir = tempfile::tempdir().unwrap();
        let geo = dir.path().join("geo/06.parquet");
        let pop = dir.path().join("pop/06.parquet");
        write_parquet(&geo, &keys(&["060000000000001", "060000000000002"]), None).unwrap();
        write_parquet(&pop, &keys(&["060000000000002"]), None).unwrap();
        let err = validate_unit_files(&ca(), &geo, &pop).unwrap_err();
        assert!(matches!(err, PipelineError::RowCountMismatch { .. }));
    }
}
