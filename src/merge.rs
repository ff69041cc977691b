//! Global merge: concatenate per-unit datasets into one partitioned dataset.
//!
//! Each unit becomes exactly one partition, in region-code order. Because
//! every key begins with its unit's region code and each unit is sorted,
//! the concatenation is globally sorted and the partition boundaries are
//! "known divisions": downstream readers can locate any key by comparing it
//! with the first key of each partition.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use arrow::array::{Array, StringArray};
use arrow::datatypes::SchemaRef;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::common::{KEY_COLUMN, KeyRange, RegionCode, UnitOutput};
use crate::error::PipelineError;
use crate::spatial::SpatialPartitions;
use crate::storage::{read_column, read_schema};

pub const MANIFEST_FILE: &str = "_manifest.json";

// ============================================================================
// In-memory dataset
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub unit: RegionCode,
    pub source: PathBuf,
    pub rows: usize,
    pub range: KeyRange,
}

/// An ordered set of partitions sharing one schema.
#[derive(Debug, Clone)]
pub struct MergedDataset {
    pub name: String,
    pub schema: SchemaRef,
    pub partitions: Vec<Partition>,
}

impl MergedDataset {
    /// First key of every partition followed by the last key of the final one.
    pub fn divisions(&self) -> Vec<String> {
        let mut divisions: Vec<String> = self
            .partitions
            .iter()
            .map(|p| p.range.first.clone())
            .collect();
        if let Some(last) = self.partitions.last() {
            divisions.push(last.range.last.clone());
        }
        divisions
    }

    pub fn num_rows(&self) -> usize {
        self.partitions.iter().map(|p| p.rows).sum()
    }

    /// Index of the partition that would hold `key`, if any.
    pub fn locate(&self, key: &str) -> Option<usize> {
        let idx = self
            .partitions
            .partition_point(|p| p.range.first.as_str() <= key);
        let candidate = idx.checked_sub(1)?;
        (key <= self.partitions[candidate].range.last.as_str()).then_some(candidate)
    }
}

// ============================================================================
// Manifest
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestPartition {
    pub unit: RegionCode,
    pub file: String,
    pub rows: usize,
    #[serde(flatten)]
    pub range: KeyRange,
}

/// Sidecar written next to the partition files of a persisted dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub rows: usize,
    pub partitions: Vec<ManifestPartition>,
    pub divisions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spatial_partitions: Option<SpatialPartitions>,
}

// ============================================================================
// Merge
// ============================================================================

/// Order unit outputs by region code and check that they form a dataset with
/// known divisions and a single schema.
pub fn merge_units(name: &str, outputs: &[UnitOutput]) -> Result<MergedDataset, PipelineError> {
    let mut outputs: Vec<&UnitOutput> = outputs.iter().collect();
    outputs.sort_by(|a, b| a.unit.cmp(&b.unit));

    let Some(first) = outputs.first() else {
        return Err(PipelineError::NoUnits {
            what: "merge input",
            dir: PathBuf::from(name),
        });
    };
    for pair in outputs.windows(2) {
        if pair[0].unit == pair[1].unit {
            return Err(PipelineError::DuplicateUnit {
                unit: pair[1].unit.clone(),
                dir: pair[1].path.parent().map(Path::to_path_buf).unwrap_or_default(),
            });
        }
    }

    let schema = read_schema(&first.path, Some(&first.unit))?;
    let mut partitions = Vec::with_capacity(outputs.len());
    for output in &outputs {
        let unit_schema = read_schema(&output.path, Some(&output.unit))?;
        if unit_schema.fields() != schema.fields() {
            return Err(PipelineError::SchemaMismatch {
                dataset: name.to_string(),
                unit: output.unit.clone(),
                expected_from: first.unit.clone(),
            });
        }
        let partition = scan_partition(name, &output.unit, &output.path)?;
        debug!(
            "{name}: unit {} has {} rows [{}, {}]",
            partition.unit, partition.rows, partition.range.first, partition.range.last
        );
        partitions.push(partition);
    }
    check_known_divisions(name, &partitions)?;

    Ok(MergedDataset {
        name: name.to_string(),
        schema,
        partitions,
    })
}

/// Read a partition's key column and check it is non-empty, strictly sorted
/// and confined to the unit's region.
fn scan_partition(
    dataset: &str,
    unit: &RegionCode,
    path: &Path,
) -> Result<Partition, PipelineError> {
    let column = read_column(path, KEY_COLUMN, Some(unit))?.ok_or_else(|| {
        PipelineError::MissingColumn {
            unit: Some(unit.clone()),
            column: KEY_COLUMN.to_string(),
            source_name: path.display().to_string(),
        }
    })?;
    let keys = column
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| PipelineError::MalformedValue {
            unit: unit.clone(),
            column: KEY_COLUMN.to_string(),
            value: format!("{:?}", column.data_type()),
        })?;

    if keys.is_empty() {
        return Err(PipelineError::EmptyPartition {
            dataset: dataset.to_string(),
            unit: unit.clone(),
        });
    }
    if keys.null_count() > 0 {
        return Err(PipelineError::MalformedValue {
            unit: unit.clone(),
            column: KEY_COLUMN.to_string(),
            value: "<null>".to_string(),
        });
    }

    for i in 0..keys.len() {
        let key = keys.value(i);
        if !key.starts_with(unit.as_str()) {
            return Err(PipelineError::ForeignKeyInUnit {
                dataset: dataset.to_string(),
                unit: unit.clone(),
                key: key.to_string(),
            });
        }
        if i > 0 && keys.value(i - 1) >= key {
            return Err(PipelineError::UnsortedPartition {
                dataset: dataset.to_string(),
                unit: unit.clone(),
                previous: keys.value(i - 1).to_string(),
                next: key.to_string(),
            });
        }
    }

    Ok(Partition {
        unit: unit.clone(),
        source: path.to_path_buf(),
        rows: keys.len(),
        range: KeyRange {
            first: keys.value(0).to_string(),
            last: keys.value(keys.len() - 1).to_string(),
        },
    })
}

/// Each partition's last key must sort strictly before the next one's first key.
pub fn check_known_divisions(dataset: &str, partitions: &[Partition]) -> Result<(), PipelineError> {
    for pair in partitions.windows(2) {
        let (left, right) = (&pair[0], &pair[1]);
        if left.range.last >= right.range.first {
            return Err(PipelineError::OverlappingPartitions {
                dataset: dataset.to_string(),
                left: left.unit.clone(),
                left_last: left.range.last.clone(),
                right: right.unit.clone(),
                right_first: right.range.first.clone(),
            });
        }
    }
    Ok(())
}

// ============================================================================
// Persistence
// ============================================================================

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> PipelineError {
    let path = path.to_path_buf();
    move |source| PipelineError::Io {
        unit: None,
        path,
        source,
    }
}

fn partition_file(index: usize) -> String {
    format!("part.{index}.parquet")
}

/// Write `dataset` to `dir` as `part.<i>.parquet` files plus a manifest.
///
/// Shorthand for [`stage`] followed by [`StagedDataset::commit`].
pub fn persist(
    dataset: &MergedDataset,
    dir: &Path,
    spatial: Option<&SpatialPartitions>,
) -> Result<Manifest, PipelineError> {
    stage(dataset, dir, spatial)?.commit()
}

/// A dataset written in full to a hidden sibling of its target directory,
/// not yet visible at the target. Dropping it without committing removes
/// the staging directory.
#[derive(Debug)]
pub struct StagedDataset {
    staging: PathBuf,
    target: PathBuf,
    manifest: Manifest,
    committed: bool,
}

/// Write `dataset` next to `dir` without touching `dir`.
///
/// An existing `dir` may later be replaced only if it is itself a persisted
/// dataset (has a manifest) or is empty; anything else is refused here.
/// A staging directory left behind by an interrupted run is discarded.
pub fn stage(
    dataset: &MergedDataset,
    dir: &Path,
    spatial: Option<&SpatialPartitions>,
) -> Result<StagedDataset, PipelineError> {
    check_replaceable(dir)?;
    let staging = sibling(dir, "staging")?;
    if staging.exists() {
        debug!("Removing stale staging directory {}", staging.display());
        fs::remove_dir_all(&staging).map_err(io_err(&staging))?;
    }
    fs::create_dir_all(&staging).map_err(io_err(&staging))?;

    match write_dataset(dataset, &staging, spatial) {
        Ok(manifest) => Ok(StagedDataset {
            staging,
            target: dir.to_path_buf(),
            manifest,
            committed: false,
        }),
        Err(e) => {
            let _ = fs::remove_dir_all(&staging);
            Err(e)
        }
    }
}

impl StagedDataset {
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Move the staged dataset into place, replacing any previous output.
    pub fn commit(mut self) -> Result<Manifest, PipelineError> {
        let previous = sibling(&self.target, "previous")?;
        if previous.exists() {
            fs::remove_dir_all(&previous).map_err(io_err(&previous))?;
        }
        let replacing = self.target.exists();
        if replacing {
            fs::rename(&self.target, &previous).map_err(io_err(&self.target))?;
        }
        if let Err(source) = fs::rename(&self.staging, &self.target) {
            if replacing {
                let _ = fs::rename(&previous, &self.target);
            }
            return Err(io_err(&self.target)(source));
        }
        self.committed = true;
        if replacing {
            fs::remove_dir_all(&previous).map_err(io_err(&previous))?;
        }

        info!(
            "  Wrote {} ({} partitions, {} rows) to {}",
            self.manifest.name,
            self.manifest.partitions.len(),
            self.manifest.rows,
            self.target.display()
        );
        Ok(self.manifest.clone())
    }
}

impl Drop for StagedDataset {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_dir_all(&self.staging);
        }
    }
}

fn check_replaceable(dir: &Path) -> Result<(), PipelineError> {
    if !dir.exists() {
        return Ok(());
    }
    let is_dataset = dir.join(MANIFEST_FILE).is_file();
    let is_empty = fs::read_dir(dir).map_err(io_err(dir))?.next().is_none();
    if is_dataset || is_empty {
        return Ok(());
    }
    Err(PipelineError::Io {
        unit: None,
        path: dir.to_path_buf(),
        source: std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "refusing to replace a directory that is not a persisted dataset",
        ),
    })
}

/// `<parent>/.<name>.<tag>`, on the same filesystem as `dir` so renames
/// between the two stay atomic.
fn sibling(dir: &Path, tag: &str) -> Result<PathBuf, PipelineError> {
    let name = dir.file_name().ok_or_else(|| PipelineError::Io {
        unit: None,
        path: dir.to_path_buf(),
        source: std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "dataset directory has no file name",
        ),
    })?;
    let mut hidden = std::ffi::OsString::from(".");
    hidden.push(name);
    hidden.push(format!(".{tag}"));
    Ok(dir.with_file_name(hidden))
}

fn write_dataset(
    dataset: &MergedDataset,
    dir: &Path,
    spatial: Option<&SpatialPartitions>,
) -> Result<Manifest, PipelineError> {
    let mut partitions = Vec::with_capacity(dataset.partitions.len());
    for (i, partition) in dataset.partitions.iter().enumerate() {
        let file = partition_file(i);
        let target = dir.join(&file);
        fs::copy(&partition.source, &target).map_err(|source| PipelineError::Io {
            unit: Some(partition.unit.clone()),
            path: partition.source.clone(),
            source,
        })?;
        partitions.push(ManifestPartition {
            unit: partition.unit.clone(),
            file,
            rows: partition.rows,
            range: partition.range.clone(),
        });
    }

    let manifest = Manifest {
        name: dataset.name.clone(),
        rows: dataset.num_rows(),
        partitions,
        divisions: dataset.divisions(),
        spatial_partitions: spatial.cloned(),
    };
    let manifest_path = dir.join(MANIFEST_FILE);
    let writer = BufWriter::new(File::create(&manifest_path).map_err(io_err(&manifest_path))?);
    serde_json::to_writer_pretty(writer, &manifest)
        .map_err(std::io::Error::from)
        .map_err(io_err(&manifest_path))?;
    Ok(manifest)
}

/// Re-open a persisted dataset, re-checking every partition against the
/// manifest and the known-divisions invariant.
pub fn read_persisted(dir: &Path) -> Result<(MergedDataset, Manifest), PipelineError> {
    let manifest_path = dir.join(MANIFEST_FILE);
    let reader = BufReader::new(File::open(&manifest_path).map_err(io_err(&manifest_path))?);
    let manifest: Manifest =
        serde_json::from_reader(reader).map_err(|e| PipelineError::ManifestMismatch {
            dataset: dir.display().to_string(),
            message: format!("unreadable manifest: {e}"),
        })?;
    let name = manifest.name.as_str();
    let mismatch = |message: String| PipelineError::ManifestMismatch {
        dataset: name.to_string(),
        message,
    };

    let on_disk = fs::read_dir(dir)
        .map_err(io_err(dir))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            file_name.starts_with("part.") && file_name.ends_with(".parquet")
        })
        .count();
    if on_disk != manifest.partitions.len() {
        return Err(mismatch(format!(
            "{} partition files on disk, {} in manifest",
            on_disk,
            manifest.partitions.len()
        )));
    }

    let Some(first) = manifest.partitions.first() else {
        return Err(mismatch("manifest lists no partitions".to_string()));
    };
    let schema = read_schema(&dir.join(&first.file), Some(&first.unit))?;

    let mut partitions = Vec::with_capacity(manifest.partitions.len());
    for entry in &manifest.partitions {
        let path = dir.join(&entry.file);
        let unit_schema = read_schema(&path, Some(&entry.unit))?;
        if unit_schema.fields() != schema.fields() {
            return Err(PipelineError::SchemaMismatch {
                dataset: name.to_string(),
                unit: entry.unit.clone(),
                expected_from: first.unit.clone(),
            });
        }
        let partition = scan_partition(name, &entry.unit, &path)?;
        if partition.rows != entry.rows || partition.range != entry.range {
            return Err(mismatch(format!(
                "{} holds {} rows [{}, {}], manifest says {} rows [{}, {}]",
                entry.file,
                partition.rows,
                partition.range.first,
                partition.range.last,
                entry.rows,
                entry.range.first,
                entry.range.last
            )));
        }
        partitions.push(partition);
    }
    check_known_divisions(name, &partitions)?;

    let dataset = MergedDataset {
        name: name.to_string(),
        schema,
        partitions,
    };
    if dataset.divisions() != manifest.divisions {
        return Err(mismatch("divisions differ from partition key ranges".to_string()));
    }
    if dataset.num_rows() != manifest.rows {
        return Err(mismatch(format!(
            "{} rows on disk, manifest says {}",
            dataset.num_rows(),
            manifest.rows
        )));
    }
    debug!("{name}: re-read {} partitions", dataset.partitions.len());
    Ok((dataset, manifest))
}
