// SPDX-License-Identifier: Apache-2.0

use crate::ModelError;
use geo::Area;
use geo_types::{Coord, LineString, Polygon};
use serde_json::{json, Value};

/// Parses a GeoJSON `Polygon` value into a single-ring polygon.
///
/// Only simple polygons are accepted: exactly one (exterior) ring, closed,
/// with every vertex inside geographic bounds.
pub fn polygon_from_geojson(value: &Value) -> Result<Polygon<f64>, ModelError> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ModelError::Geometry("missing geometry type".to_string()))?;
    if kind != "Polygon" {
        return Err(ModelError::Geometry(format!(
            "expected Polygon geometry, got {kind}"
        )));
    }
    let rings = value
        .get("coordinates")
        .and_then(Value::as_array)
        .ok_or_else(|| ModelError::Geometry("missing coordinates".to_string()))?;
    if rings.len() != 1 {
        return Err(ModelError::Geometry(format!(
            "polygon must have exactly one ring, got {}",
            rings.len()
        )));
    }
    let ring = rings[0]
        .as_array()
        .ok_or_else(|| ModelError::Geometry("ring must be an array".to_string()))?;
    let mut coords = Vec::with_capacity(ring.len());
    for position in ring {
        let pair = position
            .as_array()
            .ok_or_else(|| ModelError::Geometry("position must be an array".to_string()))?;
        if pair.len() < 2 {
            return Err(ModelError::Geometry(
                "position must carry lon and lat".to_string(),
            ));
        }
        let lon = pair[0]
            .as_f64()
            .ok_or_else(|| ModelError::Geometry("longitude must be numeric".to_string()))?;
        let lat = pair[1]
            .as_f64()
            .ok_or_else(|| ModelError::Geometry("latitude must be numeric".to_string()))?;
        coords.push(Coord { x: lon, y: lat });
    }
    if coords.len() < 4 {
        return Err(ModelError::Geometry(
            "ring must have at least four positions".to_string(),
        ));
    }
    if coords.first() != coords.last() {
        return Err(ModelError::Geometry("ring is not closed".to_string()));
    }
    let polygon = Polygon::new(LineString::from(coords), vec![]);
    validate_polygon(&polygon)?;
    Ok(polygon)
}

/// Validates geographic bounds and non-degeneracy of a stored polygon.
pub fn validate_polygon(polygon: &Polygon<f64>) -> Result<(), ModelError> {
    if !polygon.interiors().is_empty() {
        return Err(ModelError::Geometry(
            "interior rings are not supported".to_string(),
        ));
    }
    for coord in polygon.exterior().coords() {
        if !coord.x.is_finite() || !coord.y.is_finite() {
            return Err(ModelError::Geometry("non-finite coordinate".to_string()));
        }
        if !(-180.0..=180.0).contains(&coord.x) || !(-90.0..=90.0).contains(&coord.y) {
            return Err(ModelError::Geometry(format!(
                "coordinate ({},{}) outside geographic bounds",
                coord.x, coord.y
            )));
        }
    }
    if polygon.unsigned_area() == 0.0 {
        return Err(ModelError::Geometry("polygon has zero area".to_string()));
    }
    Ok(())
}

/// Serializes a polygon back to a GeoJSON `Polygon` value with a closed
/// exterior ring.
#[must_use]
pub fn polygon_to_geojson(polygon: &Polygon<f64>) -> Value {
    let ring: Vec<Value> = polygon
        .exterior()
        .coords()
        .map(|c| json!([c.x, c.y]))
        .collect();
    json!({ "type": "Polygon", "coordinates": [ring] })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Value {
        json!({
            "type": "Polygon",
            "coordinates": [[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0], [0.0, 0.0]]]
        })
    }

    #[test]
    fn geojson_round_trip_preserves_ring() {
        let polygon = polygon_from_geojson(&square()).unwrap();
        let back = polygon_to_geojson(&polygon);
        assert_eq!(back, square());
    }

    #[test]
    fn rejects_open_ring() {
        let open = json!({
            "type": "Polygon",
            "coordinates": [[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]]]
        });
        assert!(polygon_from_geojson(&open).is_err());
    }

    #[test]
    fn rejects_degenerate_ring() {
        let line = json!({
            "type": "Polygon",
            "coordinates": [[[0.0, 0.0], [1.0, 0.0], [1.0, 0.0], [0.0, 0.0], [0.0, 0.0]]]
        });
        assert!(polygon_from_geojson(&line).is_err());
    }

    #[test]
    fn rejects_out_of_bounds_coordinates() {
        let bad = json!({
            "type": "Polygon",
            "coordinates": [[[190.0, 0.0], [191.0, 0.0], [191.0, 1.0], [190.0, 1.0], [190.0, 0.0]]]
        });
        assert!(polygon_from_geojson(&bad).is_err());
    }

    #[test]
    fn rejects_multi_ring_polygons() {
        let holed = json!({
            "type": "Polygon",
            "coordinates": [
                [[0.0, 0.0], [4.0, 0.0], [4.0, 4.0], [0.0, 4.0], [0.0, 0.0]],
                [[1.0, 1.0], [2.0, 1.0], [2.0, 2.0], [1.0, 2.0], [1.0, 1.0]]
            ]
        });
        assert!(polygon_from_geojson(&holed).is_err());
    }
}
