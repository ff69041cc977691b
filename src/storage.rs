//! Parquet persistence for normalized datasets.

use std::fs::{self, File};
use std::path::Path;

use arrow::array::ArrayRef;
use arrow::compute::concat_batches;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::{RecordBatch, RecordBatchReader};
use parquet::arrow::ArrowWriter;
use parquet::arrow::ProjectionMask;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::Compression;
use parquet::file::metadata::KeyValue;
use parquet::file::properties::WriterProperties;

use crate::common::RegionCode;
use crate::error::PipelineError;

const READ_BATCH_SIZE: usize = 1_000_000;

fn io_err(unit: Option<&RegionCode>, path: &Path) -> impl FnOnce(std::io::Error) -> PipelineError {
    let unit = unit.cloned();
    let path = path.to_path_buf();
    move |source| PipelineError::Io { unit, path, source }
}

fn parquet_err(
    unit: Option<&RegionCode>,
    path: &Path,
) -> impl FnOnce(parquet::errors::ParquetError) -> PipelineError {
    let unit = unit.cloned();
    let path = path.to_path_buf();
    move |source| PipelineError::Parquet { unit, path, source }
}

fn arrow_err(
    unit: Option<&RegionCode>,
    path: &Path,
) -> impl FnOnce(arrow::error::ArrowError) -> PipelineError {
    let unit = unit.cloned();
    let path = path.to_path_buf();
    move |source| PipelineError::Arrow { unit, path, source }
}

/// Write one batch as a single-row-group Parquet file, creating parent directories.
pub fn write_parquet(
    path: &Path,
    batch: &RecordBatch,
    unit: Option<&RegionCode>,
) -> Result<(), PipelineError> {
    write_parquet_with_metadata(path, batch, unit, Vec::new())
}

/// Like [`write_parquet`], with extra file-level key/value metadata.
pub fn write_parquet_with_metadata(
    path: &Path,
    batch: &RecordBatch,
    unit: Option<&RegionCode>,
    key_values: Vec<KeyValue>,
) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err(unit, parent))?;
    }
    let file = File::create(path).map_err(io_err(unit, path))?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_max_row_group_size(batch.num_rows().max(1))
        .set_key_value_metadata((!key_values.is_empty()).then_some(key_values))
        .build();
    let mut writer =
        ArrowWriter::try_new(file, batch.schema(), Some(props)).map_err(parquet_err(unit, path))?;
    writer.write(batch).map_err(parquet_err(unit, path))?;
    writer.close().map_err(parquet_err(unit, path))?;
    Ok(())
}

/// Read a whole Parquet file into one batch.
pub fn read_parquet(path: &Path, unit: Option<&RegionCode>) -> Result<RecordBatch, PipelineError> {
    let file = File::open(path).map_err(io_err(unit, path))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(parquet_err(unit, path))?
        .with_batch_size(READ_BATCH_SIZE)
        .build()
        .map_err(parquet_err(unit, path))?;
    let schema = reader.schema();
    let batches: Vec<RecordBatch> = reader
        .collect::<Result<Vec<_>, _>>()
        .map_err(arrow_err(unit, path))?;
    collect_batches(schema, batches).map_err(arrow_err(unit, path))
}

/// Read the schema of a Parquet file without touching its data pages.
pub fn read_schema(path: &Path, unit: Option<&RegionCode>) -> Result<SchemaRef, PipelineError> {
    let file = File::open(path).map_err(io_err(unit, path))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file).map_err(parquet_err(unit, path))?;
    Ok(builder.schema().clone())
}

/// Read a single top-level column. Returns `Ok(None)` if the file lacks it.
pub fn read_column(
    path: &Path,
    column: &str,
    unit: Option<&RegionCode>,
) -> Result<Option<ArrayRef>, PipelineError> {
    let file = File::open(path).map_err(io_err(unit, path))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file).map_err(parquet_err(unit, path))?;
    let Ok(index) = builder.schema().index_of(column) else {
        return Ok(None);
    };
    let mask = ProjectionMask::roots(builder.parquet_schema(), [index]);
    let reader = builder
        .with_projection(mask)
        .with_batch_size(READ_BATCH_SIZE)
        .build()
        .map_err(parquet_err(unit, path))?;
    let schema = reader.schema();
    let batches: Vec<RecordBatch> = reader
        .collect::<Result<Vec<_>, _>>()
        .map_err(arrow_err(unit, path))?;
    let batch = collect_batches(schema, batches).map_err(arrow_err(unit, path))?;
    Ok(Some(batch.column(0).clone()))
}

/// Value of one file-level key/value metadata entry, if present.
pub fn read_key_value(
    path: &Path,
    key: &str,
    unit: Option<&RegionCode>,
) -> Result<Option<String>, PipelineError> {
    let file = File::open(path).map_err(io_err(unit, path))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file).map_err(parquet_err(unit, path))?;
    let value = builder
        .metadata()
        .file_metadata()
        .key_value_metadata()
        .and_then(|entries| entries.iter().find(|kv| kv.key == key))
        .and_then(|kv| kv.value.clone());
    Ok(value)
}

fn collect_batches(
    schema: SchemaRef,
    mut batches: Vec<RecordBatch>,
) -> Result<RecordBatch, arrow::error::ArrowError> {
    if batches.len() > 1 {
        return concat_batches(&schema, &batches);
    }
    Ok(batches.pop().unwrap_or_else(|| RecordBatch::new_empty(schema)))
}
