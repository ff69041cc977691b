use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::Array;
use geo_types::{LineString, MultiPolygon, Polygon};
use indexmap::IndexMap;

use census_blocks::common::{KEY_COLUMN, string_column};
use census_blocks::geometry::{
    FieldKind, FieldValue, GeometryReader, GeometryTable, RawBlock, SourceField,
};
use census_blocks::geoparquet::{GEO_METADATA_KEY, GeoMetadata};
use census_blocks::merge::read_persisted;
use census_blocks::schema::FieldSchema;
use census_blocks::storage::{read_key_value, read_parquet};
use census_blocks::{
    ErrorKind, Pipeline, PipelineConfig, PipelineError, RegionCode, RegionLookup,
};

// ============================================================================
// Fixtures
// ============================================================================

/// Serves in-memory blocks keyed by region code instead of reading archives.
struct FakeReader {
    blocks: HashMap<String, Vec<RawBlock>>,
}

impl GeometryReader for FakeReader {
    fn read(&self, unit: &RegionCode, path: &Path) -> Result<GeometryTable, PipelineError> {
        let blocks = self
            .blocks
            .get(unit.as_str())
            .cloned()
            .ok_or_else(|| PipelineError::Geometry {
                unit: unit.clone(),
                path: path.to_path_buf(),
                message: "no fixture".to_string(),
            })?;
        Ok(GeometryTable {
            fields: block_fields(),
            blocks,
        })
    }
}

fn block_fields() -> Vec<SourceField> {
    [
        ("STATEFP20", FieldKind::Text),
        ("COUNTYFP20", FieldKind::Text),
        ("TRACTCE20", FieldKind::Text),
        ("BLOCKCE20", FieldKind::Text),
        ("GEOID20", FieldKind::Text),
        ("NAME20", FieldKind::Text),
        ("ALAND20", FieldKind::Integer),
        ("INTPTLAT20", FieldKind::Text),
        ("INTPTLON20", FieldKind::Text),
    ]
    .into_iter()
    .map(|(name, kind)| SourceField::new(name, kind))
    .collect()
}

fn text(s: &str) -> FieldValue {
    FieldValue::Text(Some(s.to_string()))
}

fn block(geoid: &str, x: f64, y: f64) -> RawBlock {
    let mut attributes = IndexMap::new();
    attributes.insert("STATEFP20".to_string(), text(&geoid[..2]));
    attributes.insert("COUNTYFP20".to_string(), text(&geoid[2..5]));
    attributes.insert("TRACTCE20".to_string(), text(&geoid[5..11]));
    attributes.insert("BLOCKCE20".to_string(), text(&geoid[11..]));
    attributes.insert("GEOID20".to_string(), text(geoid));
    attributes.insert("NAME20".to_string(), text(&format!("Block {}", &geoid[11..])));
    attributes.insert("ALAND20".to_string(), FieldValue::Number(Some(1000.0)));
    attributes.insert("INTPTLAT20".to_string(), text(&format!("{:+}", y + 0.005)));
    attributes.insert("INTPTLON20".to_string(), text(&format!("{:+}", x + 0.005)));
    let exterior = LineString::from(vec![
        (x, y),
        (x + 0.01, y),
        (x + 0.01, y + 0.01),
        (x, y + 0.01),
        (x, y),
    ]);
    RawBlock {
        attributes,
        geometry: MultiPolygon(vec![Polygon::new(exterior, vec![])]),
    }
}

const GEO_FIELDS: [&str; 7] = ["FILEID", "STUSAB", "SUMLEV", "LOGRECNO", "GEOID", "NAME", "POP100"];
const SEGMENT_FIELDS: [&str; 6] = ["FILEID", "STUSAB", "CHARITER", "CIFSN", "LOGRECNO", "P0010001"];

const CA_GEO: &str = "\
PLST|CA|040|0000001|0400000US06|California|39538223\n\
PLST|CA|750|0000003|7500000US060014001001002|Block 1002|9\n\
PLST|CA|750|0000002|7500000US060014001001001|Block 1001|5\n\
PLST|CA|750|0000004|7500000US060014001001000|Block 1000|0\n";

const CA_SEGMENT: &str = "\
PLST|CA|000|01|0000001|39538223\n\
PLST|CA|000|01|0000002|5\n\
PLST|CA|000|01|0000003|9\n\
PLST|CA|000|01|0000004|0\n";

struct Workspace {
    _dir: tempfile::TempDir,
    config: PipelineConfig,
}

fn workspace(geometry_units: &[&str]) -> Workspace {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let geometry_dir = root.join("TABBLOCK20");
    let population_dir = root.join("population_stats");
    fs::create_dir_all(&geometry_dir).unwrap();
    fs::create_dir_all(&population_dir).unwrap();
    for unit in geometry_units {
        fs::write(geometry_dir.join(format!("tl_2020_{unit}_tabblock20.zip")), b"").unwrap();
    }
    fs::write(population_dir.join("cageo2020.pl"), CA_GEO).unwrap();
    fs::write(population_dir.join("ca000012020.pl"), CA_SEGMENT).unwrap();

    let config = PipelineConfig {
        geometry_dir,
        population_dir,
        scratch_dir: root.join("tmp"),
        output_dir: root.join("outputs"),
        threads: Some(2),
        show_progress: false,
        ..PipelineConfig::default()
    };
    Workspace { _dir: dir, config }
}

fn fields() -> FieldSchema {
    FieldSchema {
        segment: SEGMENT_FIELDS.iter().map(|s| s.to_string()).collect(),
        geoheader: GEO_FIELDS.iter().map(|s| s.to_string()).collect(),
    }
}

fn california() -> Vec<RawBlock> {
    vec![
        block("060014001001001", -122.27, 37.87),
        block("060014001001000", -122.28, 37.86),
        block("060014001001002", -122.26, 37.88),
    ]
}

fn puerto_rico() -> Vec<RawBlock> {
    vec![
        block("720019501001001", -66.61, 18.21),
        block("720019501001000", -66.62, 18.20),
    ]
}

fn pipeline(config: PipelineConfig, blocks: HashMap<String, Vec<RawBlock>>) -> Pipeline {
    Pipeline::with_parts(
        config,
        RegionLookup::census_2020(),
        fields(),
        Arc::new(FakeReader { blocks }),
    )
}

fn keys_of(path: &PathBuf) -> Vec<String> {
    let batch = read_parquet(path, None).unwrap();
    let keys = string_column(&batch, KEY_COLUMN).unwrap();
    (0..keys.len()).map(|i| keys.value(i).to_string()).collect()
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_state_and_territory_end_to_end() {
    let ws = workspace(&["72", "06"]);
    let blocks = HashMap::from([
        ("06".to_string(), california()),
        ("72".to_string(), puerto_rico()),
    ]);
    let report = pipeline(ws.config.clone(), blocks).run().unwrap();

    // Geometry covers both units, population only the state.
    let geo_units: Vec<&str> = report
        .geometry
        .partitions
        .iter()
        .map(|p| p.unit.as_str())
        .collect();
    assert_eq!(geo_units, vec!["06", "72"]);
    assert_eq!(report.geometry.rows, 5);
    let pop_units: Vec<&str> = report
        .population
        .partitions
        .iter()
        .map(|p| p.unit.as_str())
        .collect();
    assert_eq!(pop_units, vec!["06"]);
    assert_eq!(report.population.rows, 3);

    let spatial = report.geometry.spatial_partitions.as_ref().unwrap();
    assert_eq!(spatial.partitions.len(), 2);
    let pr = spatial.partitions[1].unwrap();
    assert!(pr.min().y > 18.0 && pr.max().y < 19.0);
    assert!(pr.min().x > -67.0 && pr.max().x < -66.0);

    // Re-reading the persisted outputs preserves partitions and key order.
    let geo_dir = ws.config.geometry_output();
    let (geometry, _) = read_persisted(&geo_dir).unwrap();
    assert_eq!(geometry.partitions.len(), 2);
    assert_eq!(
        geometry.divisions(),
        vec!["060014001001000", "720019501001000", "720019501001001"]
    );
    assert_eq!(
        keys_of(&geo_dir.join("part.0.parquet")),
        vec!["060014001001000", "060014001001001", "060014001001002"]
    );

    // Each geometry partition is a GeoParquet file covering its unit.
    let json = read_key_value(&geo_dir.join("part.1.parquet"), GEO_METADATA_KEY, None)
        .unwrap()
        .unwrap();
    let meta = GeoMetadata::from_json(&json).unwrap();
    let column = &meta.columns[&meta.primary_column];
    assert_eq!(meta.primary_column, "geometry");
    assert_eq!(column.crs["name"], "NAD83");
    let [xmin, ymin, xmax, ymax] = column.bbox.unwrap();
    assert!((xmin - -66.62).abs() < 1e-9 && (ymin - 18.20).abs() < 1e-9);
    assert!((xmax - -66.60).abs() < 1e-9 && (ymax - 18.22).abs() < 1e-9);

    let pop_dir = ws.config.population_output();
    let (population, _) = read_persisted(&pop_dir).unwrap();
    assert_eq!(population.partitions.len(), 1);
    let batch = read_parquet(&pop_dir.join("part.0.parquet"), None).unwrap();
    let names: Vec<String> = batch
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect();
    assert_eq!(names, vec!["GEOID", "P0010001"]);
    assert_eq!(
        keys_of(&pop_dir.join("part.0.parquet")),
        vec!["060014001001000", "060014001001001", "060014001001002"]
    );
}

#[test]
fn test_rerun_replaces_outputs() {
    let ws = workspace(&["06"]);
    let blocks = HashMap::from([("06".to_string(), california())]);
    let pipeline = pipeline(ws.config.clone(), blocks);
    pipeline.run().unwrap();
    let report = pipeline.run().unwrap();
    assert_eq!(report.geometry.partitions.len(), 1);
    assert!(read_persisted(&ws.config.geometry_output()).is_ok());
}

#[test]
fn test_block_without_population_fails_the_run() {
    let ws = workspace(&["06"]);
    let mut ca = california();
    ca.push(block("060014001001003", -122.25, 37.89));
    let blocks = HashMap::from([("06".to_string(), ca)]);

    let err = pipeline(ws.config.clone(), blocks).run().unwrap_err();
    match &err {
        PipelineError::RowCountMismatch {
            unit,
            geometry_rows,
            joined_rows,
            ..
        } => {
            assert_eq!(unit.as_str(), "06");
            assert_eq!(*geometry_rows, 4);
            assert_eq!(*joined_rows, 3);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.kind(), ErrorKind::Consistency);
    assert_eq!(err.kind().exit_code(), 4);
    assert!(!ws.config.geometry_output().exists());
}

#[test]
fn test_population_block_without_geometry_fails_the_run() {
    let ws = workspace(&["06"]);
    let ca: Vec<RawBlock> = california()
        .into_iter()
        .filter(|b| b.attributes["GEOID20"] != FieldValue::Text(Some("060014001001002".into())))
        .collect();
    let blocks = HashMap::from([("06".to_string(), ca)]);

    let err = pipeline(ws.config.clone(), blocks).run().unwrap_err();
    match &err {
        PipelineError::RowCountMismatch {
            geometry_rows,
            population_rows,
            joined_rows,
            ..
        } => {
            assert_eq!(*geometry_rows, 2);
            assert_eq!(*population_rows, 3);
            assert_eq!(*joined_rows, 2);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!ws.config.population_output().exists());
    assert!(!ws.config.geometry_output().exists());
}

#[test]
fn test_merge_failure_writes_neither_output() {
    let ws = workspace(&["06", "72"]);
    let mut pr = puerto_rico();
    pr.push(block("060014001009999", -66.63, 18.19));
    let blocks = HashMap::from([
        ("06".to_string(), california()),
        ("72".to_string(), pr),
    ]);

    let err = pipeline(ws.config.clone(), blocks).run().unwrap_err();
    assert!(matches!(err, PipelineError::ForeignKeyInUnit { .. }));
    assert_eq!(err.unit().map(RegionCode::as_str), Some("72"));
    assert!(!ws.config.population_output().exists());
    assert!(!ws.config.geometry_output().exists());
}

#[test]
fn test_failed_rerun_keeps_previous_outputs() {
    let ws = workspace(&["06", "72"]);
    let good = HashMap::from([
        ("06".to_string(), california()),
        ("72".to_string(), puerto_rico()),
    ]);
    let first = pipeline(ws.config.clone(), good).run().unwrap();

    let mut pr = puerto_rico();
    pr.push(block("060014001009999", -66.63, 18.19));
    let bad = HashMap::from([
        ("06".to_string(), california()),
        ("72".to_string(), pr),
    ]);
    pipeline(ws.config.clone(), bad).run().unwrap_err();

    let (_, population) = read_persisted(&ws.config.population_output()).unwrap();
    let (_, geometry) = read_persisted(&ws.config.geometry_output()).unwrap();
    assert_eq!(population, first.population);
    assert_eq!(geometry, first.geometry);
}

#[test]
fn test_no_geometry_units() {
    let ws = workspace(&[]);
    let err = pipeline(ws.config.clone(), HashMap::new()).run().unwrap_err();
    assert!(matches!(err, PipelineError::NoUnits { what: "geometry", .. }));
    assert_eq!(err.kind(), ErrorKind::Coverage);
}

#[test]
fn test_territories_only() {
    let ws = workspace(&["72"]);
    let blocks = HashMap::from([("72".to_string(), puerto_rico())]);
    let err = pipeline(ws.config.clone(), blocks).run().unwrap_err();
    assert!(matches!(err, PipelineError::NoUnits { what: "population", .. }));
}

#[test]
fn test_geometry_failure_names_the_unit() {
    let ws = workspace(&["06", "72"]);
    let blocks = HashMap::from([("06".to_string(), california())]);
    let err = pipeline(ws.config.clone(), blocks).run().unwrap_err();
    assert_eq!(err.unit().map(RegionCode::as_str), Some("72"));
    assert_eq!(err.kind(), ErrorKind::SourceIntegrity);
}
