// SPDX-License-Identifier: Apache-2.0

use crate::{Store, StoreError};
use rusqlite::params;
use std::collections::BTreeMap;

impl Store {
    /// Mean score per inference field over the tiles under each quadkey
    /// prefix. Only rows whose quadkey sits exactly at the prediction's
    /// native `tile_zoom` contribute; quadkey-less rows never do. A field
    /// missing from a row is left out of that row's contribution rather
    /// than counted as zero. Prefixes with no matching rows are omitted
    /// from the result.
    pub fn aggregate_by_quadkey_prefix(
        &self,
        prediction_id: i64,
        zoom: u8,
        prefixes: &[String],
    ) -> Result<BTreeMap<String, BTreeMap<String, f64>>, StoreError> {
        let prediction = self.get_prediction(prediction_id)?;
        if zoom > prediction.tile_zoom {
            return Err(StoreError::InvalidRequest(format!(
                "aggregation zoom {zoom} is deeper than tile zoom {}",
                prediction.tile_zoom
            )));
        }
        for prefix in prefixes {
            if prefix.len() != usize::from(zoom)
                || !prefix.chars().all(|c| ('0'..='3').contains(&c))
            {
                return Err(StoreError::InvalidRequest(format!(
                    "quadkey {prefix:?} is not a zoom-{zoom} quadkey"
                )));
            }
        }

        let mut out = BTreeMap::new();
        let mut stmt = self.conn.prepare(
            "SELECT predictions FROM prediction_tiles
             WHERE prediction_id = ?1
               AND quadkey IS NOT NULL
               AND LENGTH(quadkey) = ?2
               AND SUBSTR(quadkey, 1, ?3) = ?4",
        )?;
        for prefix in prefixes {
            let raw = stmt.query_map(
                params![
                    prediction_id,
                    i64::from(prediction.tile_zoom),
                    i64::from(zoom),
                    prefix
                ],
                |row| row.get::<_, String>(0),
            )?;
            let mut sums: BTreeMap<String, (f64, u64)> = BTreeMap::new();
            for row in raw {
                let scores: BTreeMap<String, f64> = serde_json::from_str(&row?)
                    .map_err(|e| StoreError::Decode(e.to_string()))?;
                for (name, score) in scores {
                    let entry = sums.entry(name).or_insert((0.0, 0));
                    entry.0 += score;
                    entry.1 += 1;
                }
            }
            if sums.is_empty() {
                continue;
            }
            let means = sums
                .into_iter()
                .map(|(name, (sum, count))| (name, sum / count as f64))
                .collect();
            out.insert(prefix.clone(), means);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use crate::tests::{fixture_store, tile_input_for};
    use crate::StoreError;
    use predtile_core::tilemath;

    #[test]
    fn means_group_under_quadkey_prefixes() {
        let (mut store, prediction_id) = fixture_store();
        // Two sibling tiles under one z15 parent, one far away.
        store
            .create_tile_batch(
                prediction_id,
                &[
                    tile_input_for(35210, 21492, 16, 0.2),
                    tile_input_for(35211, 21492, 16, 0.6),
                    tile_input_for(40000, 25000, 16, 1.0),
                ],
            )
            .unwrap();
        let parent = tilemath::tile_to_quadkey(17605, 10746, 15).unwrap();
        let got = store
            .aggregate_by_quadkey_prefix(prediction_id, 15, &[parent.clone()])
            .unwrap();
        let means = got.get(&parent).unwrap();
        assert!((means["building"] - 0.4).abs() < 1e-12);
    }

    #[test]
    fn sparse_fields_average_over_their_own_rows() {
        let (mut store, prediction_id) = fixture_store();
        let mut with_road = tile_input_for(35211, 21492, 16, 0.6);
        with_road.predictions.insert("road".to_string(), 0.5);
        store
            .create_tile_batch(
                prediction_id,
                &[tile_input_for(35210, 21492, 16, 0.2), with_road],
            )
            .unwrap();
        let parent = tilemath::tile_to_quadkey(17605, 10746, 15).unwrap();
        let got = store
            .aggregate_by_quadkey_prefix(prediction_id, 15, &[parent.clone()])
            .unwrap();
        let means = got.get(&parent).unwrap();
        // "road" appears on one of the two rows; its mean divides by one,
        // not by the row count.
        assert!((means["building"] - 0.4).abs() < 1e-12);
        assert!((means["road"] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn prefixes_without_rows_are_omitted() {
        let (mut store, prediction_id) = fixture_store();
        store
            .create_tile_batch(prediction_id, &[tile_input_for(35210, 21492, 16, 0.2)])
            .unwrap();
        let empty = tilemath::tile_to_quadkey(0, 0, 15).unwrap();
        let got = store
            .aggregate_by_quadkey_prefix(prediction_id, 15, &[empty])
            .unwrap();
        assert!(got.is_empty());
    }

    #[test]
    fn rejects_malformed_prefixes_and_deep_zooms() {
        let (store, prediction_id) = fixture_store();
        let err = store
            .aggregate_by_quadkey_prefix(prediction_id, 2, &["07".to_string()])
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidRequest(_)));
        let err = store
            .aggregate_by_quadkey_prefix(prediction_id, 17, &[])
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidRequest(_)));
    }
}
