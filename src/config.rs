//! Pipeline configuration.

use std::path::PathBuf;

use crate::key::DEFAULT_KEY_PREFIX;

/// Summary level of census blocks in the P.L. 94-171 geo-header.
pub const BLOCK_SUMMARY_LEVEL: &str = "750";

/// Paths, naming conventions and column rules for one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Directory holding one zipped block shapefile per unit.
    pub geometry_dir: PathBuf,
    /// Glob (relative to `geometry_dir`) selecting the geometry archives.
    pub geometry_pattern: String,
    /// Index of the `_`-separated file-stem token holding the region code
    /// (`tl_2020_06_tabblock20` → token 2).
    pub region_token_index: usize,

    /// Directory holding the P.L. 94-171 pipe-delimited files.
    pub population_dir: PathBuf,
    /// Field-name reference (`.xlsx` workbook or `.json`).
    pub field_schema_path: PathBuf,
    /// Segment-1 file name after the lowercase state abbreviation.
    pub segment_suffix: String,
    /// Geo-header file name after the lowercase state abbreviation.
    pub geoheader_suffix: String,

    /// Per-unit intermediate outputs go to `<scratch_dir>/{geo,pop}/<code>.parquet`.
    pub scratch_dir: PathBuf,
    /// Final global datasets are written here.
    pub output_dir: PathBuf,

    /// Only geo-header rows with this `SUMLEV` are kept.
    pub summary_level: String,
    /// Carrier prefix on geo-header GEOIDs.
    pub key_prefix: String,
    /// Suffix stripped from shapefile column names (`GEOID20` → `GEOID`).
    pub year_suffix: String,
    /// Bookkeeping columns dropped from the joined population table.
    pub population_drop_columns: Vec<String>,
    /// Descriptive shapefile columns (after suffix removal) not kept downstream.
    pub geometry_drop_columns: Vec<String>,
    /// Shapefile columns stored as dictionary-encoded categoricals.
    pub categorical_columns: Vec<String>,
    /// Shapefile columns coerced to Int64.
    pub integer_columns: Vec<String>,
    /// Shapefile columns coerced to Float64 (internal point lon/lat).
    pub float_columns: Vec<String>,

    /// Worker threads for per-unit extraction; `None` uses all cores.
    pub threads: Option<usize>,
    /// Draw progress bars on stderr.
    pub show_progress: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let strings = |items: &[&str]| -> Vec<String> { items.iter().map(|s| s.to_string()).collect() };
        Self {
            geometry_dir: PathBuf::from("TABBLOCK20"),
            geometry_pattern: "*.zip".to_string(),
            region_token_index: 2,
            population_dir: PathBuf::from("population_stats"),
            field_schema_path: PathBuf::from(
                "population_stats/2020_PLSummaryFile_FieldNames.xlsx",
            ),
            segment_suffix: "000012020.pl".to_string(),
            geoheader_suffix: "geo2020.pl".to_string(),
            scratch_dir: PathBuf::from("tmp"),
            output_dir: PathBuf::from("outputs"),
            summary_level: BLOCK_SUMMARY_LEVEL.to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            year_suffix: "20".to_string(),
            population_drop_columns: strings(&["LOGRECNO", "CHARITER", "STUSAB", "FILEID", "CIFSN"]),
            geometry_drop_columns: strings(&["MTFCC", "UR", "UACE", "UATYPE", "FUNCSTAT", "NAME"]),
            categorical_columns: strings(&["STATEFP", "COUNTYFP"]),
            integer_columns: strings(&["TRACTCE", "BLOCKCE"]),
            float_columns: strings(&["INTPTLON", "INTPTLAT"]),
            threads: None,
            show_progress: true,
        }
    }
}

impl PipelineConfig {
    pub fn scratch_geometry_dir(&self) -> PathBuf {
        self.scratch_dir.join("geo")
    }

    pub fn scratch_population_dir(&self) -> PathBuf {
        self.scratch_dir.join("pop")
    }

    pub fn population_output(&self) -> PathBuf {
        self.output_dir.join("census_blocks_population.parquet")
    }

    pub fn geometry_output(&self) -> PathBuf {
        self.output_dir.join("census_blocks_geo.parquet")
    }

    /// Segment-1 and geo-header paths for a state abbreviation.
    pub fn population_files(&self, abbreviation: &str) -> (PathBuf, PathBuf) {
        let abbr = abbreviation.to_lowercase();
        (
            self.population_dir
                .join(format!("{abbr}{}", self.segment_suffix)),
            self.population_dir
                .join(format!("{abbr}{}", self.geoheader_suffix)),
        )
    }
}
