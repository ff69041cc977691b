//! Per-unit population extraction from the P.L. 94-171 files.
//!
//! Each state ships a headerless, pipe-delimited, Latin-1 geo-header file and
//! a segment-1 attribute file, linked by logical record number. Block rows
//! are picked from the geo-header by summary level, their attributes are
//! attached with a left join (geo-header driven: attribute records without a
//! block row are dropped, block rows without attributes are kept with nulls),
//! and the result is keyed by canonical GEOID.

use std::collections::HashMap;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Int64Array, StringArray, UInt32Array};
use arrow::compute::{concat_batches, take};
use arrow::csv::ReaderBuilder;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use tracing::debug;

use crate::common::{
    KEY_COLUMN, RegionCode, RegionLookup, UnitOutput, batch_from_columns, sort_unique_by_key,
    string_column,
};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::key::KeyNormalizer;
use crate::schema::{FieldSchema, RECORD_NUMBER, STATE_ABBREVIATION, SUMMARY_LEVEL};
use crate::storage::write_parquet;

const CSV_BATCH_SIZE: usize = 256 * 1024;

pub struct PopulationExtractor<'a> {
    config: &'a PipelineConfig,
    fields: &'a FieldSchema,
    lookup: &'a RegionLookup,
    keys: KeyNormalizer,
}

impl<'a> PopulationExtractor<'a> {
    pub fn new(config: &'a PipelineConfig, fields: &'a FieldSchema, lookup: &'a RegionLookup) -> Self {
        Self {
            config,
            fields,
            lookup,
            keys: KeyNormalizer::new(config.key_prefix.clone()),
        }
    }

    /// Extract one unit and write it to `<scratch>/pop/<code>.parquet`.
    pub fn run(&self, unit: &RegionCode) -> Result<UnitOutput, PipelineError> {
        let batch = self.extract(unit)?;
        let path = self
            .config
            .scratch_population_dir()
            .join(format!("{unit}.parquet"));
        write_parquet(&path, &batch, Some(unit))?;
        Ok(UnitOutput {
            unit: unit.clone(),
            path,
            rows: batch.num_rows(),
        })
    }

    /// Build the normalized population table for one unit, sorted by key.
    pub fn extract(&self, unit: &RegionCode) -> Result<RecordBatch, PipelineError> {
        let abbreviation = self
            .lookup
            .abbreviation(unit)
            .ok_or_else(|| PipelineError::UnknownRegion { unit: unit.clone() })?;
        let (segment_path, geo_path) = self.config.population_files(abbreviation);

        let geo = read_pipe_delimited(&geo_path, self.geoheader_schema(), unit)?;
        let segment = read_pipe_delimited(&segment_path, self.segment_schema(), unit)?;
        debug!(
            "Unit {unit}: {} geo-header rows, {} segment rows",
            geo.num_rows(),
            segment.num_rows()
        );
        self.join(unit, abbreviation, &geo, &segment)
    }

    /// Geo-header columns are kept as text except the record number.
    fn geoheader_schema(&self) -> SchemaRef {
        let fields: Vec<Field> = self
            .fields
            .geoheader
            .iter()
            .map(|name| {
                let data_type = if name == RECORD_NUMBER {
                    DataType::Int64
                } else {
                    DataType::Utf8
                };
                Field::new(name, data_type, true)
            })
            .collect();
        Arc::new(Schema::new(fields))
    }

    /// Segment columns are counts, except the administrative ones.
    fn segment_schema(&self) -> SchemaRef {
        let fields: Vec<Field> = self
            .fields
            .segment
            .iter()
            .map(|name| {
                let is_admin = self.config.population_drop_columns.iter().any(|c| c == name);
                let data_type = if name == RECORD_NUMBER || !is_admin {
                    DataType::Int64
                } else {
                    DataType::Utf8
                };
                Field::new(name, data_type, true)
            })
            .collect();
        Arc::new(Schema::new(fields))
    }

    fn join(
        &self,
        unit: &RegionCode,
        abbreviation: &str,
        geo: &RecordBatch,
        segment: &RecordBatch,
    ) -> Result<RecordBatch, PipelineError> {
        let geo_name = "geo-header";
        let summary_levels = require_string(geo, SUMMARY_LEVEL, unit, geo_name)?;
        let geoids = require_string(geo, KEY_COLUMN, unit, geo_name)?;
        let abbreviations = require_string(geo, STATE_ABBREVIATION, unit, geo_name)?;
        let geo_records = require_int64(geo, RECORD_NUMBER, unit, geo_name)?;
        let segment_records = require_int64(segment, RECORD_NUMBER, unit, "segment")?;

        // record number -> row in the segment table
        let mut by_record: HashMap<i64, u32> = HashMap::with_capacity(segment.num_rows());
        for i in 0..segment_records.len() {
            let record = record_number(segment_records, i, unit)?;
            if by_record.insert(record, i as u32).is_some() {
                return Err(PipelineError::NonUniqueKey {
                    unit: unit.clone(),
                    what: "segment record number",
                    key: record.to_string(),
                });
            }
        }

        let mut keys: Vec<&str> = Vec::new();
        let mut attribute_rows: Vec<Option<u32>> = Vec::new();
        for i in 0..geo.num_rows() {
            if summary_levels.is_null(i) || summary_levels.value(i).trim() != self.config.summary_level {
                continue;
            }
            if abbreviations.is_null(i)
                || !abbreviations.value(i).trim().eq_ignore_ascii_case(abbreviation)
            {
                return Err(PipelineError::MalformedValue {
                    unit: unit.clone(),
                    column: STATE_ABBREVIATION.to_string(),
                    value: abbreviations.value(i).to_string(),
                });
            }
            let record = record_number(geo_records, i, unit)?;
            let raw = if geoids.is_null(i) { "" } else { geoids.value(i) };
            let key = self
                .keys
                .strip_prefix(raw)
                .map_err(|source| PipelineError::Key {
                    unit: unit.clone(),
                    source,
                })?;
            keys.push(key);
            attribute_rows.push(by_record.get(&record).copied());
        }

        let unmatched = attribute_rows.iter().filter(|r| r.is_none()).count();
        if unmatched > 0 {
            debug!("Unit {unit}: {unmatched} block rows have no segment record");
        }

        let indices = UInt32Array::from(attribute_rows);
        let mut columns: Vec<(String, ArrayRef)> =
            vec![(KEY_COLUMN.to_string(), Arc::new(StringArray::from(keys)) as ArrayRef)];
        for (field, column) in segment.schema().fields().iter().zip(segment.columns()) {
            let name = field.name();
            if name == KEY_COLUMN || self.config.population_drop_columns.iter().any(|c| c == name) {
                continue;
            }
            let taken = take(column.as_ref(), &indices, None).map_err(|source| PipelineError::Arrow {
                unit: Some(unit.clone()),
                path: PathBuf::from(name),
                source,
            })?;
            columns.push((name.clone(), taken));
        }

        let batch = batch_from_columns(columns).map_err(|source| PipelineError::Arrow {
            unit: Some(unit.clone()),
            path: PathBuf::from("population"),
            source,
        })?;
        sort_unique_by_key(&batch, unit, "population key")
    }
}

/// Read a headerless pipe-delimited Latin-1 file with the given column layout.
pub fn read_pipe_delimited(
    path: &Path,
    schema: SchemaRef,
    unit: &RegionCode,
) -> Result<RecordBatch, PipelineError> {
    let bytes = fs::read(path).map_err(|source| PipelineError::Io {
        unit: Some(unit.clone()),
        path: path.to_path_buf(),
        source,
    })?;
    let text = decode_latin1(&bytes);
    let arrow_err = |source: arrow::error::ArrowError| PipelineError::Arrow {
        unit: Some(unit.clone()),
        path: path.to_path_buf(),
        source,
    };

    let reader = ReaderBuilder::new(Arc::clone(&schema))
        .with_header(false)
        .with_delimiter(b'|')
        .with_batch_size(CSV_BATCH_SIZE)
        .build(Cursor::new(text.into_bytes()))
        .map_err(arrow_err)?;
    let batches = reader.collect::<Result<Vec<_>, _>>().map_err(arrow_err)?;
    concat_batches(&schema, &batches).map_err(arrow_err)
}

/// ISO-8859-1 maps every byte to the code point of the same value.
fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn require_string<'b>(
    batch: &'b RecordBatch,
    column: &str,
    unit: &RegionCode,
    source_name: &str,
) -> Result<&'b StringArray, PipelineError> {
    string_column(batch, column).ok_or_else(|| PipelineError::MissingColumn {
        unit: Some(unit.clone()),
        column: column.to_string(),
        source_name: source_name.to_string(),
    })
}

fn require_int64<'b>(
    batch: &'b RecordBatch,
    column: &str,
    unit: &RegionCode,
    source_name: &str,
) -> Result<&'b Int64Array, PipelineError> {
    batch
        .column_by_name(column)
        .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
        .ok_or_else(|| PipelineError::MissingColumn {
            unit: Some(unit.clone()),
            column: column.to_string(),
            source_name: source_name.to_string(),
        })
}

fn record_number(records: &Int64Array, i: usize, unit: &RegionCode) -> Result<i64, PipelineError> {
    if records.is_null(i) {
        return Err(PipelineError::MalformedValue {
            unit: unit.clone(),
            column: RECORD_NUMBER.to_string(),
            value: String::new(),
        });
    }
    Ok(records.value(i))
}
