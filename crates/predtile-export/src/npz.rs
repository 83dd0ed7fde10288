// SPDX-License-Identifier: Apache-2.0

//! Label archives for model (re)training: a zip of one `.npy` array per
//! tile key, each a little-endian `i64` vector of 0/1 class labels with
//! human review folded back in.

use crate::{row_passes, ExportError, ExportFormat, ExportRequest};
use geo::{Centroid, Intersects};
use predtile_core::tilemath;
use predtile_model::{Chip, Hint, Prediction, PredictionTile};
use predtile_store::Store;
use std::collections::BTreeMap;
use std::io::Write;
use tracing::info;

/// Builds the whole npz archive in memory. Unlike the row-streaming
/// formats the label map must be complete before the container can be
/// written, so there is no chunked variant.
///
/// `chips` carries the scene manifest for list-format imagery; when
/// present, rows are keyed by the names of intersecting chips instead of
/// by `x-y-z` tile address.
pub fn export_npz(
    store: &Store,
    prediction_id: i64,
    request: &ExportRequest,
    chips: Option<&[Chip]>,
) -> Result<Vec<u8>, ExportError> {
    request.validate()?;
    if request.format != ExportFormat::Npz {
        return Err(ExportError::InvalidRequest(
            "export_npz requires format=npz".to_string(),
        ));
    }
    let prediction = store.get_prediction(prediction_id)?;
    if prediction.inf_binary && prediction.inf_list.len() != 2 {
        return Err(ExportError::InvalidRequest(
            "binary models must have exactly two categories".to_string(),
        ));
    }

    let mut labels: BTreeMap<String, Vec<i64>> = BTreeMap::new();
    let mut cursor = store.cursor(prediction_id)?;
    loop {
        let batch = cursor.next_batch()?;
        if batch.is_empty() {
            break;
        }
        for row in &batch {
            if !row_passes(row, request) {
                continue;
            }
            let row_labels = row_labels(&prediction, row, request);
            for key in row_keys(&prediction, row, chips)? {
                labels.insert(key, row_labels.clone());
            }
        }
    }
    if labels.is_empty() {
        return Err(ExportError::NoValidData);
    }
    info!(prediction_id, entries = labels.len(), "built npz label archive");
    write_npz(&labels)
}

/// Thresholded labels with validity folded in. Training runs keep the raw
/// labels; reviewed inference runs get the binary pair swap or per-bit
/// flips.
fn row_labels(prediction: &Prediction, row: &PredictionTile, request: &ExportRequest) -> Vec<i64> {
    let threshold = request.label_threshold();
    let mut labels: Vec<i64> = prediction
        .inf_list
        .iter()
        .map(|name| row.predictions.get(name).copied().unwrap_or(0.0))
        .map(|score| i64::from(score >= threshold))
        .collect();
    if prediction.hint == Hint::Training {
        return labels;
    }
    let Some(validity) = &row.validity else {
        return labels;
    };
    if prediction.inf_binary {
        // Two-class case: a falsified top-ranked class swaps the pair.
        let top = prediction
            .inf_list
            .iter()
            .max_by(|a, b| {
                let sa = row.predictions.get(*a).copied().unwrap_or(0.0);
                let sb = row.predictions.get(*b).copied().unwrap_or(0.0);
                sa.total_cmp(&sb)
            })
            .cloned();
        if let Some(top) = top {
            if validity.get(&top) == Some(&false) {
                labels = if labels == [1, 0] {
                    vec![0, 1]
                } else {
                    vec![1, 0]
                };
            }
        }
    } else {
        for (name, valid) in validity {
            if *valid {
                continue;
            }
            if let Some(i) = prediction.inf_list.iter().position(|n| n == name) {
                labels[i] = 1 - labels[i];
            }
        }
    }
    labels
}

/// Tile keys a row contributes under: intersecting chip names for
/// list-format imagery, otherwise a single `x-y-z` slippy address from the
/// quadkey or, failing that, from the centroid at the prediction's native
/// zoom. A chip-keyed row overlapping nothing contributes nothing.
fn row_keys(
    prediction: &Prediction,
    row: &PredictionTile,
    chips: Option<&[Chip]>,
) -> Result<Vec<String>, ExportError> {
    if let Some(chips) = chips {
        return Ok(chips
            .iter()
            .filter(|chip| chip.bounds.intersects(&row.geom))
            .map(|chip| chip.name.clone())
            .collect());
    }
    let (x, y, z) = match &row.quadkey {
        Some(quadkey) => tilemath::quadkey_to_tile(quadkey)
            .map_err(|e| ExportError::Encode(e.to_string()))?,
        None => {
            let centroid = row.geom.centroid().ok_or_else(|| {
                ExportError::Encode(format!("tile {} has no centroid", row.id))
            })?;
            let (x, y) =
                tilemath::lon_lat_to_tile(centroid.x(), centroid.y(), prediction.tile_zoom)
                    .map_err(|e| ExportError::Encode(e.to_string()))?;
            (x, y, prediction.tile_zoom)
        }
    };
    Ok(vec![format!("{x}-{y}-{z}")])
}

/// Serializes the label map as an uncompressed zip of npy 1.0 entries,
/// the layout `numpy.savez` produces.
fn write_npz(labels: &BTreeMap<String, Vec<i64>>) -> Result<Vec<u8>, ExportError> {
    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Stored);
    for (key, values) in labels {
        zip.start_file(format!("{key}.npy"), options)
            .map_err(|e| ExportError::Encode(e.to_string()))?;
        zip.write_all(&npy_bytes(values))
            .map_err(|e| ExportError::Encode(e.to_string()))?;
    }
    let cursor = zip
        .finish()
        .map_err(|e| ExportError::Encode(e.to_string()))?;
    Ok(cursor.into_inner())
}

/// npy format 1.0: magic, little-endian u16 header length, then a python
/// dict literal padded with spaces so the data section starts on a 64-byte
/// boundary.
fn npy_bytes(values: &[i64]) -> Vec<u8> {
    let mut header = format!(
        "{{'descr': '<i8', 'fortran_order': False, 'shape': ({},), }}",
        values.len()
    );
    let unpadded = 6 + 2 + 2 + header.len() + 1;
    let padding = (64 - unpadded % 64) % 64;
    header.push_str(&" ".repeat(padding));
    header.push('\n');

    let mut out = Vec::with_capacity(unpadded + padding + values.len() * 8);
    out.extend_from_slice(b"\x93NUMPY");
    out.extend_from_slice(&[0x01, 0x00]);
    out.extend_from_slice(&(header.len() as u16).to_le_bytes());
    out.extend_from_slice(header.as_bytes());
    for value in values {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}
