//! Builds the block-level population and geometry datasets.
//!
//! ## Input
//!
//! - `<geometry-dir>/tl_2020_<code>_tabblock20.zip`: one zipped TIGER/Line
//!   block shapefile per state or territory
//! - `<population-dir>/<abbr>geo2020.pl`, `<abbr>000012020.pl`: P.L. 94-171
//!   geo-header and segment-1 files per state
//! - the P.L. field-name workbook (or an equivalent JSON file)
//!
//! ## Output
//!
//! Under the output directory:
//! - `census_blocks_population.parquet/`: population, one partition per state
//! - `census_blocks_geo.parquet/`: geometry, one partition per state or territory,
//!   with spatial partitions in its manifest
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin census-blocks -- --geometry-dir TABBLOCK20 --output-dir outputs
//! ```

use std::path::PathBuf;

use census_blocks::{Pipeline, PipelineConfig, RegionLookup};
use clap::Parser;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(about = "Join census block geometry with population counts and partition by state")]
struct Args {
    /// Directory holding the zipped block shapefiles.
    #[arg(long, default_value = "TABBLOCK20")]
    geometry_dir: PathBuf,

    /// Glob pattern for geometry archives, relative to `--geometry-dir`.
    #[arg(long, default_value = "*.zip")]
    geometry_pattern: String,

    /// Directory holding the P.L. 94-171 `.pl` files.
    #[arg(long, default_value = "population_stats")]
    population_dir: PathBuf,

    /// Field-name workbook (`.xlsx`) or JSON file naming the `.pl` columns.
    /// Defaults to `<population-dir>/2020_PLSummaryFile_FieldNames.xlsx`.
    #[arg(long)]
    field_schema: Option<PathBuf>,

    /// Directory for per-unit intermediate files.
    #[arg(long, default_value = "tmp")]
    scratch_dir: PathBuf,

    /// Directory the two global datasets are written to.
    #[arg(long, default_value = "outputs")]
    output_dir: PathBuf,

    /// Worker threads for per-unit extraction (default: number of CPUs).
    #[arg(long)]
    threads: Option<usize>,

    /// Disable the progress bar.
    #[arg(long, default_value_t = false)]
    no_progress: bool,
}

impl Args {
    fn into_config(self) -> PipelineConfig {
        let field_schema_path = self
            .field_schema
            .unwrap_or_else(|| self.population_dir.join("2020_PLSummaryFile_FieldNames.xlsx"));
        PipelineConfig {
            geometry_dir: self.geometry_dir,
            geometry_pattern: self.geometry_pattern,
            population_dir: self.population_dir,
            field_schema_path,
            scratch_dir: self.scratch_dir,
            output_dir: self.output_dir,
            threads: self.threads,
            show_progress: !self.no_progress,
            ..PipelineConfig::default()
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Args::parse().into_config();
    let result = Pipeline::new(config, RegionLookup::census_2020()).and_then(|p| p.run());

    match result {
        Ok(report) => info!(
            "Wrote {} geometry and {} population rows",
            report.geometry.rows, report.population.rows
        ),
        Err(e) => {
            let kind = e.kind();
            match e.unit() {
                Some(unit) => error!(unit = %unit, kind = %kind, "{e}"),
                None => error!(kind = %kind, "{e}"),
            }
            std::process::exit(kind.exit_code());
        }
    }
}
