//! Spatial partitions: one envelope per geometry partition.
//!
//! Together with the key divisions this lets downstream readers prune whole
//! partitions for bounding-box queries without opening them.

use arrow::array::{Array, BinaryArray, LargeBinaryArray};
use geo::Intersects;
use geo_types::Rect;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::common::GEOMETRY_COLUMN;
use crate::error::PipelineError;
use crate::geoparquet::{union_all, union_rect, wkb_envelope};
use crate::merge::MergedDataset;
use crate::storage::read_column;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatialPartitions {
    /// Envelope of each partition, in partition order. `None` if a partition
    /// holds no coordinates at all.
    pub partitions: Vec<Option<Rect<f64>>>,
    /// Envelope of the whole dataset.
    pub total: Option<Rect<f64>>,
}

impl SpatialPartitions {
    /// Indices of partitions whose envelope intersects `query`.
    pub fn candidates(&self, query: &Rect<f64>) -> Vec<usize> {
        self.partitions
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.filter(|r| r.intersects(query)).map(|_| i))
            .collect()
    }
}

/// Compute partition envelopes from the WKB geometry column.
pub fn calculate_spatial_partitions(
    dataset: &MergedDataset,
) -> Result<SpatialPartitions, PipelineError> {
    let mut partitions = Vec::with_capacity(dataset.partitions.len());
    for partition in &dataset.partitions {
        let unit = &partition.unit;
        let column = read_column(&partition.source, GEOMETRY_COLUMN, Some(unit))?.ok_or_else(|| {
            PipelineError::MissingColumn {
                unit: Some(unit.clone()),
                column: GEOMETRY_COLUMN.to_string(),
                source_name: partition.source.display().to_string(),
            }
        })?;

        let mut envelope: Option<Rect<f64>> = None;
        let mut visit = |value: &[u8]| -> Result<(), PipelineError> {
            let rect = wkb_envelope(value).map_err(|message| PipelineError::MalformedValue {
                unit: unit.clone(),
                column: GEOMETRY_COLUMN.to_string(),
                value: message,
            })?;
            if let Some(rect) = rect {
                envelope = Some(match envelope {
                    Some(e) => union_rect(e, rect),
                    None => rect,
                });
            }
            Ok(())
        };

        if let Some(values) = column.as_any().downcast_ref::<BinaryArray>() {
            for value in values.iter().flatten() {
                visit(value)?;
            }
        } else if let Some(values) = column.as_any().downcast_ref::<LargeBinaryArray>() {
            for value in values.iter().flatten() {
                visit(value)?;
            }
        } else {
            return Err(PipelineError::MalformedValue {
                unit: unit.clone(),
                column: GEOMETRY_COLUMN.to_string(),
                value: format!("{:?}", column.data_type()),
            });
        }
        debug!("Unit {unit}: spatial partition {:?}", envelope);
        partitions.push(envelope);
    }

    let total = union_all(partitions.iter().flatten());
    Ok(SpatialPartitions { partitions, total })
}
