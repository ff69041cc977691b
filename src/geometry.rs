//! Per-unit geometry extraction from TIGER/Line block shapefiles.
//!
//! Every unit is geometry-extracted, including territories without
//! population coverage. Column names lose their vintage suffix
//! (`GEOID20` → `GEOID`), bookkeeping columns are dropped, codes are coerced
//! to categorical/integer types, internal points to floats, and polygons are
//! stored as WKB. Column types come from the dbf field descriptors, so every
//! unit writes the same schema whatever values it happens to hold.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{Cursor, Read, Seek};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{
    ArrayRef, BinaryArray, Float64Array, Int64Array, StringArray, StringDictionaryBuilder,
};
use arrow::datatypes::Int32Type;
use arrow::record_batch::RecordBatch;
use geo::BoundingRect;
use geo_types::{MultiPolygon, Rect};
use indexmap::IndexMap;
use shapefile::dbase;
use tracing::debug;

use crate::common::{
    GEOMETRY_COLUMN, KEY_COLUMN, RegionCode, UnitOutput, batch_from_columns, sort_unique_by_key,
};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::geoparquet::{GeoMetadata, encode_wkb, union_all};
use crate::key::KeyNormalizer;
use crate::storage::write_parquet_with_metadata;

// ============================================================================
// Raw records
// ============================================================================

/// One attribute value as decoded from the source table.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(Option<String>),
    Number(Option<f64>),
}

/// Storage type of a source column, fixed by the table definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
    Float,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceField {
    pub name: String,
    pub kind: FieldKind,
}

impl SourceField {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// One block as read from a geometry collection, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawBlock {
    /// Attributes keyed by source column name.
    pub attributes: IndexMap<String, FieldValue>,
    pub geometry: MultiPolygon<f64>,
}

/// A unit's decoded geometry collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeometryTable {
    /// Source columns in table order.
    pub fields: Vec<SourceField>,
    pub blocks: Vec<RawBlock>,
}

impl GeometryTable {
    /// Envelope of all block geometries.
    pub fn envelope(&self) -> Option<Rect<f64>> {
        let rects: Vec<Rect<f64>> = self
            .blocks
            .iter()
            .filter_map(|b| b.geometry.bounding_rect())
            .collect();
        union_all(&rects)
    }
}

/// Decodes a unit's geometry collection.
pub trait GeometryReader: Send + Sync {
    fn read(&self, unit: &RegionCode, path: &Path) -> Result<GeometryTable, PipelineError>;
}

/// Reads the `.shp`/`.dbf` pair out of a zipped TIGER/Line shapefile.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShapefileArchiveReader;

impl GeometryReader for ShapefileArchiveReader {
    fn read(&self, unit: &RegionCode, path: &Path) -> Result<GeometryTable, PipelineError> {
        let geometry_err = |message: String| PipelineError::Geometry {
            unit: unit.clone(),
            path: path.to_path_buf(),
            message,
        };
        let file = File::open(path).map_err(|source| PipelineError::Io {
            unit: Some(unit.clone()),
            path: path.to_path_buf(),
            source,
        })?;
        let mut archive = zip::ZipArchive::new(file).map_err(|e| geometry_err(e.to_string()))?;
        let shp = archive_member(&mut archive, "shp").map_err(geometry_err)?;
        let dbf = archive_member(&mut archive, "dbf").map_err(geometry_err)?;
        read_shapefile(shp, dbf).map_err(geometry_err)
    }
}

fn archive_member<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
    extension: &str,
) -> Result<Vec<u8>, String> {
    let suffix = format!(".{extension}");
    for i in 0..archive.len() {
        let mut member = archive.by_index(i).map_err(|e| e.to_string())?;
        if member.name().to_ascii_lowercase().ends_with(&suffix) {
            let mut bytes = Vec::with_capacity(member.size() as usize);
            member.read_to_end(&mut bytes).map_err(|e| e.to_string())?;
            return Ok(bytes);
        }
    }
    Err(format!("archive has no {suffix} member"))
}

fn read_shapefile(shp: Vec<u8>, dbf: Vec<u8>) -> Result<GeometryTable, String> {
    let decimals = dbf_decimal_counts(&dbf);
    let shape_reader = shapefile::ShapeReader::new(Cursor::new(shp)).map_err(|e| e.to_string())?;
    let dbase_reader = dbase::Reader::new(Cursor::new(dbf)).map_err(|e| e.to_string())?;
    let fields: Vec<SourceField> = dbase_reader
        .fields()
        .iter()
        .filter(|f| f.name() != "DeletionFlag")
        .map(|f| {
            let decimals = decimals.get(f.name()).copied().unwrap_or(0);
            SourceField::new(f.name(), field_kind(f.field_type(), decimals))
        })
        .collect();

    let mut reader = shapefile::Reader::new(shape_reader, dbase_reader);
    let mut blocks = Vec::new();
    for result in reader.iter_shapes_and_records() {
        let (shape, record) = result.map_err(|e| e.to_string())?;
        // Outer rings start a polygon, inner rings are holes of the one before.
        let geometry = match shape {
            shapefile::Shape::Polygon(polygon) => MultiPolygon::from(polygon),
            shapefile::Shape::NullShape => MultiPolygon(Vec::new()),
            other => return Err(format!("unexpected shape type {:?}", other.shapetype())),
        };
        let attributes = fields
            .iter()
            .map(|field| {
                let value = match record.get(&field.name) {
                    Some(dbase::FieldValue::Character(s)) => FieldValue::Text(s.clone()),
                    Some(dbase::FieldValue::Numeric(n)) => FieldValue::Number(*n),
                    Some(dbase::FieldValue::Float(n)) => FieldValue::Number(n.map(f64::from)),
                    Some(dbase::FieldValue::Integer(n)) => FieldValue::Number(Some(f64::from(*n))),
                    Some(dbase::FieldValue::Double(n)) => FieldValue::Number(Some(*n)),
                    Some(dbase::FieldValue::Currency(n)) => FieldValue::Number(Some(*n)),
                    Some(dbase::FieldValue::Memo(s)) => FieldValue::Text(Some(s.clone())),
                    Some(other) => FieldValue::Text(Some(format!("{other:?}"))),
                    None => FieldValue::Text(None),
                };
                (field.name.clone(), value)
            })
            .collect();
        blocks.push(RawBlock {
            attributes,
            geometry,
        });
    }
    Ok(GeometryTable { fields, blocks })
}

fn field_kind(field_type: dbase::FieldType, decimals: u8) -> FieldKind {
    use shapefile::dbase::FieldType;
    match field_type {
        FieldType::Integer => FieldKind::Integer,
        FieldType::Float | FieldType::Double | FieldType::Currency => FieldKind::Float,
        FieldType::Numeric if decimals == 0 => FieldKind::Integer,
        FieldType::Numeric => FieldKind::Float,
        FieldType::Character
        | FieldType::Date
        | FieldType::Logical
        | FieldType::DateTime
        | FieldType::Memo => FieldKind::Text,
    }
}

const DBF_HEADER_SIZE: usize = 32;
const DBF_DESCRIPTOR_SIZE: usize = 32;
const DBF_DESCRIPTOR_END: u8 = 0x0D;

/// Decimal count of each dbf field, read from the raw field descriptors
/// (name in bytes 0..11, decimal count at byte 17).
fn dbf_decimal_counts(dbf: &[u8]) -> HashMap<String, u8> {
    let mut counts = HashMap::new();
    let mut offset = DBF_HEADER_SIZE;
    while let Some(descriptor) = dbf.get(offset..offset + DBF_DESCRIPTOR_SIZE) {
        if descriptor[0] == DBF_DESCRIPTOR_END {
            break;
        }
        let name = &descriptor[..11];
        let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
        let name = String::from_utf8_lossy(&name[..end]).trim().to_string();
        counts.insert(name, descriptor[17]);
        offset += DBF_DESCRIPTOR_SIZE;
    }
    counts
}

// ============================================================================
// Normalization
// ============================================================================

pub struct GeometryExtractor<'a> {
    config: &'a PipelineConfig,
    reader: &'a dyn GeometryReader,
    keys: KeyNormalizer,
}

impl<'a> GeometryExtractor<'a> {
    pub fn new(config: &'a PipelineConfig, reader: &'a dyn GeometryReader) -> Self {
        Self {
            config,
            reader,
            keys: KeyNormalizer::new(config.key_prefix.clone()),
        }
    }

    /// Extract one unit and write it to `<scratch>/geo/<code>.parquet`,
    /// tagged with GeoParquet metadata covering the unit's envelope.
    pub fn run(&self, unit: &RegionCode, source: &Path) -> Result<UnitOutput, PipelineError> {
        let table = self.read(unit, source)?;
        let batch = self.normalize(unit, &table)?;
        let path = self
            .config
            .scratch_geometry_dir()
            .join(format!("{unit}.parquet"));
        let geo = GeoMetadata::blocks(GEOMETRY_COLUMN, table.envelope())
            .to_key_value()
            .map_err(|e| PipelineError::Geometry {
                unit: unit.clone(),
                path: path.clone(),
                message: e.to_string(),
            })?;
        write_parquet_with_metadata(&path, &batch, Some(unit), vec![geo])?;
        Ok(UnitOutput {
            unit: unit.clone(),
            path,
            rows: batch.num_rows(),
        })
    }

    pub fn extract(&self, unit: &RegionCode, source: &Path) -> Result<RecordBatch, PipelineError> {
        let table = self.read(unit, source)?;
        self.normalize(unit, &table)
    }

    fn read(&self, unit: &RegionCode, source: &Path) -> Result<GeometryTable, PipelineError> {
        let table = self.reader.read(unit, source)?;
        debug!(
            "Unit {unit}: {} geometry records, {} fields",
            table.blocks.len(),
            table.fields.len()
        );
        Ok(table)
    }

    /// Turn a decoded table into the normalized geometry batch, sorted by key.
    pub fn normalize(
        &self,
        unit: &RegionCode,
        table: &GeometryTable,
    ) -> Result<RecordBatch, PipelineError> {
        let mut kept: Vec<(&SourceField, String)> = Vec::new();
        let mut seen = HashSet::new();
        for field in &table.fields {
            let name = field
                .name
                .strip_suffix(self.config.year_suffix.as_str())
                .filter(|n| !n.is_empty())
                .unwrap_or(field.name.as_str())
                .to_string();
            if self.config.geometry_drop_columns.contains(&name) {
                continue;
            }
            if !seen.insert(name.clone()) {
                return Err(PipelineError::NonUniqueKey {
                    unit: unit.clone(),
                    what: "geometry column name",
                    key: name,
                });
            }
            kept.push((field, name));
        }

        let key_source = kept
            .iter()
            .find(|(_, name)| name == KEY_COLUMN)
            .map(|(field, _)| field.name.as_str())
            .ok_or_else(|| PipelineError::MissingColumn {
                unit: Some(unit.clone()),
                column: KEY_COLUMN.to_string(),
                source_name: "geometry".to_string(),
            })?;

        let blocks = &table.blocks;
        let mut columns: Vec<(String, ArrayRef)> = Vec::with_capacity(kept.len() + 1);
        columns.push((KEY_COLUMN.to_string(), self.key_array(unit, blocks, key_source)?));
        for (field, name) in &kept {
            if name == KEY_COLUMN {
                continue;
            }
            let values: Vec<Option<&FieldValue>> =
                blocks.iter().map(|b| b.attributes.get(&field.name)).collect();
            columns.push((name.clone(), self.coerce(unit, name, field.kind, &values)?));
        }

        let wkb = blocks
            .iter()
            .map(|b| {
                encode_wkb(&b.geometry).map_err(|message| PipelineError::MalformedValue {
                    unit: unit.clone(),
                    column: GEOMETRY_COLUMN.to_string(),
                    value: message,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let wkb = BinaryArray::from_iter_values(wkb.iter());
        columns.push((GEOMETRY_COLUMN.to_string(), Arc::new(wkb)));

        let batch = batch_from_columns(columns).map_err(|source| PipelineError::Arrow {
            unit: Some(unit.clone()),
            path: PathBuf::from("geometry"),
            source,
        })?;
        sort_unique_by_key(&batch, unit, "geometry key")
    }

    fn key_array(
        &self,
        unit: &RegionCode,
        blocks: &[RawBlock],
        key_source: &str,
    ) -> Result<ArrayRef, PipelineError> {
        let mut keys = Vec::with_capacity(blocks.len());
        for block in blocks {
            let raw = text_value(block.attributes.get(key_source)).unwrap_or_default();
            let key = self
                .keys
                .canonical(&raw)
                .map_err(|source| PipelineError::Key {
                    unit: unit.clone(),
                    source,
                })?;
            keys.push(key.to_string());
        }
        Ok(Arc::new(StringArray::from(keys)))
    }

    /// Configured coercions win; other columns keep their declared kind.
    fn coerce(
        &self,
        unit: &RegionCode,
        name: &str,
        declared: FieldKind,
        values: &[Option<&FieldValue>],
    ) -> Result<ArrayRef, PipelineError> {
        let is = |list: &[String]| list.iter().any(|c| c == name);

        if is(&self.config.categorical_columns) {
            let mut builder = StringDictionaryBuilder::<Int32Type>::new();
            for value in values {
                builder.append_option(text_value(*value));
            }
            return Ok(Arc::new(builder.finish()));
        }
        let kind = if is(&self.config.integer_columns) {
            FieldKind::Integer
        } else if is(&self.config.float_columns) {
            FieldKind::Float
        } else {
            declared
        };

        match kind {
            FieldKind::Integer => {
                let ints = values
                    .iter()
                    .map(|v| integer_value(unit, name, *v))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Arc::new(Int64Array::from(ints)))
            }
            FieldKind::Float => {
                let floats = values
                    .iter()
                    .map(|v| number_value(unit, name, *v))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Arc::new(Float64Array::from(floats)))
            }
            FieldKind::Text => {
                let texts: Vec<Option<String>> = values.iter().map(|v| text_value(*v)).collect();
                Ok(Arc::new(StringArray::from(texts)))
            }
        }
    }
}

fn text_value(value: Option<&FieldValue>) -> Option<String> {
    match value? {
        FieldValue::Text(Some(s)) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        FieldValue::Text(None) => None,
        FieldValue::Number(n) => n.map(|n| n.to_string()),
    }
}

fn number_value(
    unit: &RegionCode,
    column: &str,
    value: Option<&FieldValue>,
) -> Result<Option<f64>, PipelineError> {
    match value {
        Some(FieldValue::Number(n)) => Ok(*n),
        other => match text_value(other) {
            None => Ok(None),
            Some(s) => s.parse::<f64>().map(Some).map_err(|_| PipelineError::MalformedValue {
                unit: unit.clone(),
                column: column.to_string(),
                value: s,
            }),
        },
    }
}

fn integer_value(
    unit: &RegionCode,
    column: &str,
    value: Option<&FieldValue>,
) -> Result<Option<i64>, PipelineError> {
    match number_value(unit, column, value)? {
        None => Ok(None),
        Some(n) if n.fract() == 0.0 && n.abs() < i64::MAX as f64 => Ok(Some(n as i64)),
        Some(n) => Err(PipelineError::MalformedValue {
            unit: unit.clone(),
            column: column.to_string(),
            value: n.to_string(),
        }),
    }
}
