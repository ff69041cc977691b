//! Column names for the headerless P.L. 94-171 files.
//!
//! The Census Bureau publishes the field names as a workbook with one sheet
//! per file type; the header row of each sheet lists the columns in file
//! order. A JSON rendition of the same lists is accepted as well.

use std::path::Path;

use calamine::{Reader, open_workbook_auto};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PipelineError;

pub const SEGMENT_SHEET: &str = "2020 P.L. Segment 1 Fields";
pub const GEOHEADER_SHEET: &str = "2020 P.L. Geoheader Fields";

/// Logical record number shared by every P.L. file of a state.
pub const RECORD_NUMBER: &str = "LOGRECNO";
pub const SUMMARY_LEVEL: &str = "SUMLEV";
pub const STATE_ABBREVIATION: &str = "STUSAB";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    /// Segment-1 (attribute) columns, in file order.
    pub segment: Vec<String>,
    /// Geo-header columns, in file order.
    pub geoheader: Vec<String>,
}

impl FieldSchema {
    /// Load from a `.json` file or a spreadsheet (`.xlsx`, `.xls`, `.ods`).
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let schema = if is_json {
            Self::from_json(path)?
        } else {
            Self::from_workbook(path)?
        };
        schema.check(path)?;
        debug!(
            "Field schema {}: {} segment columns, {} geo-header columns",
            path.display(),
            schema.segment.len(),
            schema.geoheader.len()
        );
        Ok(schema)
    }

    fn from_json(path: &Path) -> Result<Self, PipelineError> {
        let text = std::fs::read_to_string(path).map_err(|source| PipelineError::Io {
            unit: None,
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|e| PipelineError::FieldSchema {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    fn from_workbook(path: &Path) -> Result<Self, PipelineError> {
        let schema_err = |message: String| PipelineError::FieldSchema {
            path: path.to_path_buf(),
            message,
        };
        let mut workbook = open_workbook_auto(path).map_err(|e| schema_err(e.to_string()))?;

        let mut header_row = |sheet: &str| -> Result<Vec<String>, PipelineError> {
            let range = workbook
                .worksheet_range(sheet)
                .map_err(|e| schema_err(format!("sheet '{sheet}': {e}")))?;
            let row = range
                .rows()
                .next()
                .ok_or_else(|| schema_err(format!("sheet '{sheet}' is empty")))?;
            Ok(row
                .iter()
                .map(|cell| cell.to_string().trim().to_string())
                .filter(|name| !name.is_empty())
                .collect())
        };

        let segment = header_row(SEGMENT_SHEET)?;
        let geoheader = header_row(GEOHEADER_SHEET)?;
        Ok(Self { segment, geoheader })
    }

    /// The join and filter columns must be present.
    fn check(&self, path: &Path) -> Result<(), PipelineError> {
        let source_name = path.display().to_string();
        let require = |columns: &[String], name: &str| {
            if columns.iter().any(|c| c == name) {
                Ok(())
            } else {
                Err(PipelineError::MissingColumn {
                    unit: None,
                    column: name.to_string(),
                    source_name: source_name.clone(),
                })
            }
        };
        require(&self.segment, RECORD_NUMBER)?;
        require(&self.geoheader, RECORD_NUMBER)?;
        require(&self.geoheader, SUMMARY_LEVEL)?;
        require(&self.geoheader, STATE_ABBREVIATION)?;
        require(&self.geoheader, crate::common::KEY_COLUMN)?;
        Ok(())
    }
}
