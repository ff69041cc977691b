//! Pipeline driver: discover units, extract them in parallel, then merge,
//! partition and persist the two global datasets.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use indicatif::{HumanCount, ProgressBar, ProgressStyle};
use rayon::prelude::*;
use tracing::{debug, info};

use crate::common::{RegionCode, RegionLookup, UnitOutput};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::geometry::{GeometryExtractor, GeometryReader, ShapefileArchiveReader};
use crate::merge::{Manifest, merge_units, read_persisted, stage};
use crate::population::PopulationExtractor;
use crate::schema::FieldSchema;
use crate::spatial::calculate_spatial_partitions;
use crate::validate::validate_unit_files;

// ============================================================================
// Discovery
// ============================================================================

/// One source unit found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUnit {
    pub unit: RegionCode,
    pub geometry_path: PathBuf,
    /// Whether the unit is in the lookup table and so gets population data.
    pub has_population: bool,
}

/// Region code from a geometry file name such as `tl_2020_06_tabblock20.zip`:
/// the `token_index`-th `_`-separated token of the file stem.
pub fn region_from_file_name(path: &Path, token_index: usize) -> Option<RegionCode> {
    let stem = path.file_stem()?.to_str()?;
    RegionCode::parse(stem.split('_').nth(token_index)?)
}

/// Enumerate geometry archives, sorted by region code.
pub fn discover_units(
    config: &PipelineConfig,
    lookup: &RegionLookup,
) -> Result<Vec<SourceUnit>, PipelineError> {
    let pattern = config.geometry_dir.join(&config.geometry_pattern);
    let pattern = pattern.to_string_lossy().into_owned();
    let paths = glob::glob(&pattern).map_err(|e| PipelineError::Pattern {
        pattern: pattern.clone(),
        message: e.to_string(),
    })?;

    let mut units: BTreeMap<RegionCode, PathBuf> = BTreeMap::new();
    for entry in paths {
        let path = entry.map_err(|e| {
            let path = e.path().to_path_buf();
            PipelineError::Io {
                unit: None,
                path,
                source: std::io::Error::from(e),
            }
        })?;
        let unit = region_from_file_name(&path, config.region_token_index)
            .ok_or_else(|| PipelineError::UnparseableFileName { path: path.clone() })?;
        if units.insert(unit.clone(), path).is_some() {
            return Err(PipelineError::DuplicateUnit {
                unit,
                dir: config.geometry_dir.clone(),
            });
        }
    }

    let units: Vec<SourceUnit> = units
        .into_iter()
        .map(|(unit, geometry_path)| SourceUnit {
            has_population: lookup.contains(&unit),
            unit,
            geometry_path,
        })
        .collect();

    if units.is_empty() {
        return Err(PipelineError::NoUnits {
            what: "geometry",
            dir: config.geometry_dir.clone(),
        });
    }
    if !units.iter().any(|u| u.has_population) {
        return Err(PipelineError::NoUnits {
            what: "population",
            dir: config.population_dir.clone(),
        });
    }
    Ok(units)
}

// ============================================================================
// Driver
// ============================================================================

/// Scratch outputs of one unit's extraction task.
#[derive(Debug, Clone)]
pub struct UnitResult {
    pub geometry: UnitOutput,
    pub population: Option<UnitOutput>,
}

/// What a successful run produced.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub units: Vec<UnitResult>,
    pub geometry: Manifest,
    pub population: Manifest,
}

pub struct Pipeline {
    config: PipelineConfig,
    lookup: RegionLookup,
    fields: FieldSchema,
    reader: Arc<dyn GeometryReader>,
}

impl Pipeline {
    /// Build a pipeline reading geometry from zipped shapefiles and the field
    /// schema from `config.field_schema_path`.
    pub fn new(config: PipelineConfig, lookup: RegionLookup) -> Result<Self, PipelineError> {
        let fields = FieldSchema::load(&config.field_schema_path)?;
        Ok(Self::with_parts(
            config,
            lookup,
            fields,
            Arc::new(ShapefileArchiveReader),
        ))
    }

    pub fn with_parts(
        config: PipelineConfig,
        lookup: RegionLookup,
        fields: FieldSchema,
        reader: Arc<dyn GeometryReader>,
    ) -> Self {
        Self {
            config,
            lookup,
            fields,
            reader,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn run(&self) -> Result<PipelineReport, PipelineError> {
        let start = Instant::now();
        info!("Geometry: {}", self.config.geometry_dir.display());
        info!("Population: {}", self.config.population_dir.display());
        info!("Output: {}", self.config.output_dir.display());

        // ── Step 1: Discover units ───────────────────────────────────────
        info!("Step 1: Discovering units...");
        let units = discover_units(&self.config, &self.lookup)?;
        let with_population = units.iter().filter(|u| u.has_population).count();
        info!(
            "  Found {} units ({} with population, {} geometry-only)",
            units.len(),
            with_population,
            units.len() - with_population
        );

        // ── Step 2: Extract every unit in parallel ───────────────────────
        info!("Step 2: Extracting units...");
        let mut results = self.extract_all(&units)?;
        results.sort_by(|a, b| a.geometry.unit.cmp(&b.geometry.unit));
        let geometry_rows: usize = results.iter().map(|r| r.geometry.rows).sum();
        info!(
            "  Extracted {} geometry rows in {:.1}s",
            HumanCount(geometry_rows as u64),
            start.elapsed().as_secs_f64()
        );

        // ── Step 3: Merge and partition ──────────────────────────────────
        info!("Step 3: Merging units...");
        let population_outputs: Vec<UnitOutput> =
            results.iter().filter_map(|r| r.population.clone()).collect();
        let population_dir = self.config.population_output();
        let population = merge_units(&dataset_name(&population_dir), &population_outputs)?;

        let geometry_outputs: Vec<UnitOutput> =
            results.iter().map(|r| r.geometry.clone()).collect();
        let geometry_dir = self.config.geometry_output();
        let geometry = merge_units(&dataset_name(&geometry_dir), &geometry_outputs)?;
        let spatial = calculate_spatial_partitions(&geometry)?;
        if let Some(total) = &spatial.total {
            debug!("  Geometry envelope {:?}", total);
        }

        // ── Step 4: Persist both datasets or neither ─────────────────────
        info!("Step 4: Persisting outputs...");
        let staged_population = stage(&population, &population_dir, None)?;
        let staged_geometry = stage(&geometry, &geometry_dir, Some(&spatial))?;
        staged_population.commit()?;
        staged_geometry.commit()?;

        // ── Step 5: Re-read and validate persisted outputs ───────────────
        info!("Step 5: Validating persisted outputs...");
        let (population_back, population_manifest) = read_persisted(&population_dir)?;
        let (geometry_back, geometry_manifest) = read_persisted(&geometry_dir)?;
        info!(
            "  {}: {} partitions, {} rows",
            population_back.name,
            population_back.partitions.len(),
            HumanCount(population_back.num_rows() as u64)
        );
        info!(
            "  {}: {} partitions, {} rows",
            geometry_back.name,
            geometry_back.partitions.len(),
            HumanCount(geometry_back.num_rows() as u64)
        );

        info!("Done in {:.1}s", start.elapsed().as_secs_f64());
        Ok(PipelineReport {
            units: results,
            geometry: geometry_manifest,
            population: population_manifest,
        })
    }

    fn extract_all(&self, units: &[SourceUnit]) -> Result<Vec<UnitResult>, PipelineError> {
        let mut builder = rayon::ThreadPoolBuilder::new();
        if let Some(threads) = self.config.threads {
            builder = builder.num_threads(threads);
        }
        let pool = builder.build()?;

        let pb = if self.config.show_progress {
            ProgressBar::new(units.len() as u64)
        } else {
            ProgressBar::hidden()
        };
        pb.set_style(
            ProgressStyle::with_template(
                "  Extracting {bar:40.cyan/blue} {pos}/{len} units [{elapsed_precise}]",
            )
            .map(|style| style.progress_chars("##-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        let geometry = GeometryExtractor::new(&self.config, self.reader.as_ref());
        let population = PopulationExtractor::new(&self.config, &self.fields, &self.lookup);
        let results = pool.install(|| {
            units
                .par_iter()
                .map(|unit| {
                    let result = self.process_unit(unit, &geometry, &population);
                    pb.inc(1);
                    result
                })
                .collect::<Result<Vec<_>, _>>()
        });
        pb.finish_and_clear();
        results
    }

    fn process_unit(
        &self,
        source: &SourceUnit,
        geometry: &GeometryExtractor<'_>,
        population: &PopulationExtractor<'_>,
    ) -> Result<UnitResult, PipelineError> {
        let unit = &source.unit;
        let geometry_output = geometry.run(unit, &source.geometry_path)?;
        debug!("Unit {unit}: {} geometry rows", geometry_output.rows);

        let population_output = if source.has_population {
            let output = population.run(unit)?;
            validate_unit_files(unit, &geometry_output.path, &output.path)?;
            debug!("Unit {unit}: {} population rows", output.rows);
            Some(output)
        } else {
            debug!("Unit {unit}: geometry only");
            None
        };

        Ok(UnitResult {
            geometry: geometry_output,
            population: population_output,
        })
    }
}

fn dataset_name(dir: &Path) -> String {
    dir.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| dir.display().to_string())
}
