//! WKB geometry columns and GeoParquet file metadata.
//!
//! Block geometries are `geo_types` multipolygons encoded as 2D WKB. Every
//! Parquet file holding a geometry column carries the GeoParquet `geo`
//! key/value entry naming that column, its encoding and CRS (TIGER/Line is
//! NAD83, EPSG:4269), so GeoParquet readers pick the column up as geometry.

use std::collections::BTreeMap;

use geo::BoundingRect;
use geo_types::{Geometry, MultiPolygon, Rect, coord};
use geozero::wkb::Wkb;
use geozero::{CoordDimensions, ToGeo, ToWkb};
use parquet::file::metadata::KeyValue;
use serde::{Deserialize, Serialize};

/// Parquet key/value metadata key defined by GeoParquet.
pub const GEO_METADATA_KEY: &str = "geo";

pub const GEOPARQUET_VERSION: &str = "1.1.0";

/// Encode a block's geometry as WKB: a `Polygon` for a single part,
/// a `MultiPolygon` otherwise.
pub fn encode_wkb(geometry: &MultiPolygon<f64>) -> Result<Vec<u8>, String> {
    let geometry = match geometry.0.as_slice() {
        [single] => Geometry::Polygon(single.clone()),
        _ => Geometry::MultiPolygon(geometry.clone()),
    };
    geometry
        .to_wkb(CoordDimensions::xy())
        .map_err(|e| e.to_string())
}

/// Decode a WKB value.
pub fn decode_wkb(value: &[u8]) -> Result<Geometry<f64>, String> {
    Wkb(value.to_vec()).to_geo().map_err(|e| e.to_string())
}

/// Envelope of a WKB value; `None` for an empty geometry.
pub fn wkb_envelope(value: &[u8]) -> Result<Option<Rect<f64>>, String> {
    Ok(decode_wkb(value)?.bounding_rect())
}

/// Smallest rectangle covering both.
pub fn union_rect(a: Rect<f64>, b: Rect<f64>) -> Rect<f64> {
    Rect::new(
        coord! { x: a.min().x.min(b.min().x), y: a.min().y.min(b.min().y) },
        coord! { x: a.max().x.max(b.max().x), y: a.max().y.max(b.max().y) },
    )
}

/// Union of all rectangles, `None` if there are none.
pub fn union_all<'a>(rects: impl IntoIterator<Item = &'a Rect<f64>>) -> Option<Rect<f64>> {
    rects.into_iter().fold(None, |acc, r| {
        Some(match acc {
            Some(a) => union_rect(a, *r),
            None => *r,
        })
    })
}

// ============================================================================
// File metadata
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoColumn {
    pub encoding: String,
    pub geometry_types: Vec<String>,
    /// PROJJSON description of the coordinate reference system.
    pub crs: serde_json::Value,
    /// `[xmin, ymin, xmax, ymax]` of the column's values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[f64; 4]>,
}

/// The GeoParquet `geo` metadata document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoMetadata {
    pub version: String,
    pub primary_column: String,
    pub columns: BTreeMap<String, GeoColumn>,
}

impl GeoMetadata {
    /// Metadata for a WKB block polygon column in NAD83 longitude/latitude.
    pub fn blocks(column: &str, bbox: Option<Rect<f64>>) -> Self {
        let column_meta = GeoColumn {
            encoding: "WKB".to_string(),
            geometry_types: vec!["Polygon".to_string(), "MultiPolygon".to_string()],
            crs: nad83_projjson(),
            bbox: bbox.map(|r| [r.min().x, r.min().y, r.max().x, r.max().y]),
        };
        Self {
            version: GEOPARQUET_VERSION.to_string(),
            primary_column: column.to_string(),
            columns: BTreeMap::from([(column.to_string(), column_meta)]),
        }
    }

    pub fn to_key_value(&self) -> Result<KeyValue, serde_json::Error> {
        Ok(KeyValue::new(
            GEO_METADATA_KEY.to_string(),
            serde_json::to_string(self)?,
        ))
    }

    pub fn from_json(value: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(value)
    }
}

fn nad83_projjson() -> serde_json::Value {
    serde_json::json!({
        "$schema": "https://proj.org/schemas/v0.7/projjson.schema.json",
        "type": "GeographicCRS",
        "name": "NAD83",
        "datum": {
            "type": "GeodeticReferenceFrame",
            "name": "North American Datum 1983",
            "ellipsoid": {
                "name": "GRS 1980",
                "semi_major_axis": 6378137,
                "inverse_flattening": 298.257222101
            }
        },
        "coordinate_system": {
            "subtype": "ellipsoidal",
            "axis": [
                {"name": "Geodetic latitude", "abbreviation": "Lat", "direction": "north", "unit": "degree"},
                {"name": "Geodetic longitude", "abbreviation": "Lon", "direction": "east", "unit": "degree"}
            ]
        },
        "id": {"authority": "EPSG", "code": 4269}
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo_types::{LineString, Polygon};

    fn square(x0: f64, y0: f64, size: f64) -> LineString<f64> {
        LineString::from(vec![
            (x0, y0),
            (x0 + size, y0),
            (x0 + size, y0 + size),
            (x0, y0 + size),
            (x0, y0),
        ])
    }

    #[test]
    fn test_single_part_is_polygon() {
        let mp = MultiPolygon(vec![Polygon::new(square(0.0, 0.0, 1.0), vec![])]);
        let wkb = encode_wkb(&mp).unwrap();
        assert!(matches!(decode_wkb(&wkb).unwrap(), Geometry::Polygon(_)));
    }

    #[test]
    fn test_multipart_envelope() {
        let mp = MultiPolygon(vec![
            Polygon::new(square(-122.5, 37.5, 1.0), vec![square(-122.3, 37.7, 0.1)]),
            Polygon::new(square(-120.0, 36.0, 0.5), vec![]),
        ]);
        let wkb = encode_wkb(&mp).unwrap();
        assert!(matches!(decode_wkb(&wkb).unwrap(), Geometry::MultiPolygon(_)));
        let rect = wkb_envelope(&wkb).unwrap().unwrap();
        assert_eq!(rect.min(), coord! { x: -122.5, y: 36.0 });
        assert_eq!(rect.max(), coord! { x: -119.5, y: 38.5 });
    }

    #[test]
    fn test_empty_geometry_has_no_envelope() {
        let wkb = encode_wkb(&MultiPolygon(vec![])).unwrap();
        assert_eq!(wkb_envelope(&wkb).unwrap(), None);
    }

    #[test]
    fn test_metadata_document() {
        let rect = Rect::new(coord! { x: -124.5, y: 32.5 }, coord! { x: -114.25, y: 42.0 });
        let meta = GeoMetadata::blocks("geometry", Some(rect));
        let kv = meta.to_key_value().unwrap();
        assert_eq!(kv.key, GEO_METADATA_KEY);

        let back = GeoMetadata::from_json(kv.value.as_deref().unwrap()).unwrap();
        let column = &back.columns["geometry"];
        assert_eq!(back.primary_column, "geometry");
        assert_eq!(column.encoding, "WKB");
        assert_eq!(column.crs["id"]["code"], 4269);
        assert_eq!(column.bbox, Some([-124.5, 32.5, -114.25, 42.0]));
    }

    #[test]
    fn test_union_all() {
        let a = Rect::new(coord! { x: 0.0, y: 0.0 }, coord! { x: 1.0, y: 1.0 });
        let b = Rect::new(coord! { x: 2.0, y: -1.0 }, coord! { x: 3.0, y: 0.5 });
        let u = union_all([&a, &b]).unwrap();
        assert_eq!(u.min(), coord! { x: 0.0, y: -1.0 });
        assert_eq!(u.max(), coord! { x: 3.0, y: 1.0 });
        assert_eq!(union_all(std::iter::empty::<&Rect<f64>>()), None);
    }
}
