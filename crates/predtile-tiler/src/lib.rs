// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

pub mod clip;

use clip::{clip_ring, orient_exterior, quantize_ring, world_to_tile_coords, TILE_BUFFER, TILE_EXTENT};
use mvt::{GeomEncoder, GeomType, Tile};
use predtile_core::tilemath::TileMathError;
use predtile_store::{Store, StoreError};
use std::fmt::{Display, Formatter};
use tracing::debug;

pub const CRATE_NAME: &str = "predtile-tiler";

/// The single layer every rendered tile carries.
pub const LAYER_NAME: &str = "data";

/// Validity flags are merged into feature properties under this prefix so
/// they never collide with inference score keys.
pub const VALIDITY_PREFIX: &str = "v_";

#[derive(Debug)]
#[non_exhaustive]
pub enum TilerError {
    PredictionsNotFound(i64),
    TileMath(TileMathError),
    Store(StoreError),
    Encode(String),
}

impl Display for TilerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PredictionsNotFound(id) => write!(f, "no predictions found: {id}"),
            Self::TileMath(e) => write!(f, "bad tile address: {e}"),
            Self::Store(e) => write!(f, "store failure: {e}"),
            Self::Encode(msg) => write!(f, "mvt encode failure: {msg}"),
        }
    }
}

impl std::error::Error for TilerError {}

impl From<TileMathError> for TilerError {
    fn from(e: TileMathError) -> Self {
        Self::TileMath(e)
    }
}

impl From<mvt::Error> for TilerError {
    fn from(e: mvt::Error) -> Self {
        Self::Encode(e.to_string())
    }
}

/// Renders one prediction's tiles addressed by `(z, x, y)` into MVT bytes.
///
/// Features carry the tile row id, one double tag per inference score, and
/// one `v_`-prefixed bool tag per validity flag. Rows whose geometry
/// collapses after clipping and quantization are dropped. A tile with no
/// intersecting rows encodes as a valid empty tile rather than an error.
pub fn render_tile(
    store: &Store,
    prediction_id: i64,
    z: u8,
    x: u32,
    y: u32,
) -> Result<Vec<u8>, TilerError> {
    let bounds = predtile_core::tilemath::tile_bounds(x, y, z)?;
    let rows = store
        .tiles_intersecting(prediction_id, bounds)
        .map_err(|e| match e {
            StoreError::NotFound(_) => TilerError::PredictionsNotFound(prediction_id),
            other => TilerError::Store(other),
        })?;

    let mut tile = Tile::new(TILE_EXTENT);
    if rows.is_empty() {
        debug!(prediction_id, z, x, y, "empty tile");
        return Ok(tile.to_bytes()?);
    }

    let extent = f64::from(TILE_EXTENT);
    let mut layer = tile.create_layer(LAYER_NAME);
    let mut features = 0_usize;
    for row in &rows {
        let ring: Result<Vec<(f64, f64)>, TileMathError> = row
            .geom
            .exterior()
            .coords()
            .map(|c| world_to_tile_coords(c.x, c.y, x, y, z))
            .collect();
        let clipped = clip_ring(&ring?, extent, TILE_BUFFER);
        let Some(mut quantized) = quantize_ring(&clipped) else {
            continue;
        };
        orient_exterior(&mut quantized);

        let mut encoder = GeomEncoder::new(GeomType::Polygon);
        for (px, py) in &quantized {
            encoder = encoder.point(f64::from(*px), f64::from(*py))?;
        }
        encoder = encoder.complete()?;
        let geom_data = encoder.encode()?;

        let mut feature = layer.into_feature(geom_data);
        feature.set_id(row.id.unsigned_abs());
        for (name, score) in &row.predictions {
            feature.add_tag_double(name, *score);
        }
        if let Some(validity) = &row.validity {
            for (name, value) in validity {
                feature.add_tag_bool(&format!("{VALIDITY_PREFIX}{name}"), *value);
            }
        }
        layer = feature.into_layer();
        features += 1;
    }
    if features > 0 {
        tile.add_layer(layer)?;
    }
    debug!(prediction_id, z, x, y, features, "rendered tile");
    Ok(tile.to_bytes()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use predtile_core::tilemath;
    use predtile_model::{Hint, PredictionDraft, ProjectDraft, TileInput, ValidityPatch};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn seeded_store() -> (Store, i64) {
        let mut store = Store::open_in_memory().unwrap();
        let project = store
            .create_project(&ProjectDraft {
                name: "roof-finder".to_string(),
                source: String::new(),
                tags: vec![],
            })
            .unwrap();
        let prediction = store
            .create_prediction(
                project.id,
                &PredictionDraft {
                    hint: Hint::Prediction,
                    version: "2.0".to_string(),
                    tile_zoom: 16,
                    inf_list: vec!["building".to_string()],
                    inf_type: "classification".to_string(),
                    inf_binary: false,
                    inf_supertile: false,
                    imagery_id: None,
                },
            )
            .unwrap();
        let (min_lon, min_lat, max_lon, max_lat) =
            tilemath::tile_bounds(35210, 21493, 16).unwrap();
        let ids = store
            .create_tile_batch(
                prediction.id,
                &[TileInput {
                    quadkey: Some(tilemath::tile_to_quadkey(35210, 21493, 16).unwrap()),
                    geom: json!({
                        "type": "Polygon",
                        "coordinates": [[
                            [min_lon, min_lat], [max_lon, min_lat], [max_lon, max_lat],
                            [min_lon, max_lat], [min_lon, min_lat]
                        ]]
                    }),
                    predictions: BTreeMap::from([("building".to_string(), 0.87)]),
                }],
            )
            .unwrap();
        store
            .update_validity(
                prediction.id,
                &ValidityPatch {
                    id: ids[0],
                    validity: BTreeMap::from([("building".to_string(), true)]),
                },
            )
            .unwrap();
        (store, prediction.id)
    }

    #[test]
    fn renders_feature_bytes_for_covered_tile() {
        let (store, prediction_id) = seeded_store();
        let full = render_tile(&store, prediction_id, 16, 35210, 21493).unwrap();
        let empty = render_tile(&store, prediction_id, 16, 0, 0).unwrap();
        assert!(full.len() > empty.len());
    }

    #[test]
    fn empty_region_yields_a_valid_empty_tile() {
        let (store, prediction_id) = seeded_store();
        let bytes = render_tile(&store, prediction_id, 5, 0, 0).unwrap();
        assert!(bytes.len() < 16);
    }

    #[test]
    fn unknown_prediction_is_reported_as_missing() {
        let (store, _) = seeded_store();
        let err = render_tile(&store, 404, 16, 35210, 21493).unwrap_err();
        assert!(matches!(err, TilerError::PredictionsNotFound(404)));
    }

    #[test]
    fn out_of_range_address_is_a_tile_math_error() {
        let (store, prediction_id) = seeded_store();
        let err = render_tile(&store, prediction_id, 2, 9, 0).unwrap_err();
        assert!(matches!(err, TilerError::TileMath(_)));
    }

    #[test]
    fn clockwise_source_rings_still_render_a_feature() {
        let mut cw_store = Store::open_in_memory().unwrap();
        let project = cw_store
            .create_project(&ProjectDraft {
                name: "roof-finder".to_string(),
                source: String::new(),
                tags: vec![],
            })
            .unwrap();
        let prediction = cw_store
            .create_prediction(
                project.id,
                &PredictionDraft {
                    hint: Hint::Prediction,
                    version: "2.0".to_string(),
                    tile_zoom: 16,
                    inf_list: vec!["building".to_string()],
                    inf_type: "classification".to_string(),
                    inf_binary: false,
                    inf_supertile: false,
                    imagery_id: None,
                },
            )
            .unwrap();
        let (min_lon, min_lat, max_lon, max_lat) =
            tilemath::tile_bounds(35210, 21493, 16).unwrap();
        // Same square as seeded_store, wound the other way.
        let ids = cw_store
            .create_tile_batch(
                prediction.id,
                &[TileInput {
                    quadkey: Some(tilemath::tile_to_quadkey(35210, 21493, 16).unwrap()),
                    geom: json!({
                        "type": "Polygon",
                        "coordinates": [[
                            [min_lon, min_lat], [min_lon, max_lat], [max_lon, max_lat],
                            [max_lon, min_lat], [min_lon, min_lat]
                        ]]
                    }),
                    predictions: BTreeMap::from([("building".to_string(), 0.87)]),
                }],
            )
            .unwrap();
        cw_store
            .update_validity(
                prediction.id,
                &ValidityPatch {
                    id: ids[0],
                    validity: BTreeMap::from([("building".to_string(), true)]),
                },
            )
            .unwrap();
        let full = render_tile(&cw_store, prediction.id, 16, 35210, 21493).unwrap();
        let empty = render_tile(&cw_store, prediction.id, 16, 0, 0).unwrap();
        assert!(full.len() > empty.len());
    }

    #[test]
    fn parent_tile_still_contains_the_feature() {
        let (store, prediction_id) = seeded_store();
        let parent = render_tile(&store, prediction_id, 15, 17605, 10746).unwrap();
        let empty = render_tile(&store, prediction_id, 15, 0, 0).unwrap();
        assert!(parent.len() > empty.len());
    }
}
