// SPDX-License-Identifier: Apache-2.0

use crate::geometry::{polygon_from_geojson, validate_polygon};
use crate::ModelError;
use geo::Centroid;
use geo_types::Polygon;
use predtile_core::tilemath;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One stored per-tile inference result.
///
/// `predictions` is write-once; `validity` is the mutable human-review
/// overlay and always holds a subset of the prediction keys.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionTile {
    pub id: i64,
    pub prediction_id: i64,
    pub quadkey: Option<String>,
    pub geom: Polygon<f64>,
    pub predictions: BTreeMap<String, f64>,
    pub validity: Option<BTreeMap<String, bool>>,
}

/// Validity patch body: `{ "id": tile_id, "validity": { name: bool } }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidityPatch {
    pub id: i64,
    pub validity: BTreeMap<String, bool>,
}

/// Wire shape of one ingested tile row. The geometry arrives as GeoJSON;
/// tiled sources carry a quadkey, list/vector sources do not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TileInput {
    #[serde(default)]
    pub quadkey: Option<String>,
    pub geom: Value,
    pub predictions: BTreeMap<String, f64>,
}

impl TileInput {
    /// Parses and validates the geometry, and checks quadkey consistency:
    /// a present quadkey must address the tile containing the geometry
    /// centroid at the quadkey's own zoom.
    pub fn decode(&self) -> Result<(Option<String>, Polygon<f64>), ModelError> {
        let polygon = polygon_from_geojson(&self.geom)?;
        validate_polygon(&polygon)?;
        if let Some(quadkey) = &self.quadkey {
            let (qx, qy, qz) = tilemath::quadkey_to_tile(quadkey)
                .map_err(|e| ModelError::InvalidFormat(e.to_string()))?;
            let centroid = polygon
                .centroid()
                .ok_or_else(|| ModelError::Geometry("polygon has no centroid".to_string()))?;
            let (cx, cy) = tilemath::lon_lat_to_tile(centroid.x(), centroid.y(), qz)
                .map_err(|e| ModelError::InvalidFormat(e.to_string()))?;
            if (cx, cy) != (qx, qy) {
                return Err(ModelError::InvalidFormat(format!(
                    "quadkey {quadkey} does not contain the geometry centroid"
                )));
            }
        }
        if self.predictions.is_empty() {
            return Err(ModelError::Empty("predictions"));
        }
        Ok((self.quadkey.clone(), polygon))
    }
}
