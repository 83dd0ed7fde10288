// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

mod npz;

pub use npz::export_npz;

use predtile_model::PredictionTile;
use predtile_store::{Store, StoreError, TileCursor};
use serde_json::json;
use std::fmt::{Display, Formatter};

pub const CRATE_NAME: &str = "predtile-export";

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ExportError {
    InvalidRequest(String),
    /// Label archive would be empty after filtering.
    NoValidData,
    Store(StoreError),
    Encode(String),
}

impl Display for ExportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidRequest(msg) => write!(f, "invalid export request: {msg}"),
            Self::NoValidData => f.write_str("no rows pass the export filters"),
            Self::Store(e) => write!(f, "store failure: {e}"),
            Self::Encode(msg) => write!(f, "encode failure: {msg}"),
        }
    }
}

impl std::error::Error for ExportError {}

impl From<StoreError> for ExportError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ExportFormat {
    GeoJson,
    GeoJsonSeq,
    Csv,
    Npz,
}

impl ExportFormat {
    pub fn parse(raw: &str) -> Result<Self, ExportError> {
        match raw {
            "geojson" => Ok(Self::GeoJson),
            "geojsonseq" => Ok(Self::GeoJsonSeq),
            "csv" => Ok(Self::Csv),
            "npz" => Ok(Self::Npz),
            _ => Err(ExportError::InvalidRequest(format!(
                "format must be one of geojson, geojsonseq, csv, npz; got {raw:?}"
            ))),
        }
    }

    #[must_use]
    pub const fn mime(self) -> &'static str {
        match self {
            Self::GeoJson => "application/geo+json",
            Self::GeoJsonSeq => "application/geo+json-seq",
            Self::Csv => "text/csv",
            Self::Npz => "application/npz",
        }
    }

    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::GeoJson => "geojson",
            Self::GeoJsonSeq => "geojsonseq",
            Self::Csv => "csv",
            Self::Npz => "npz",
        }
    }
}

/// Which inference columns an export covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InferenceSelect {
    All,
    One(String),
}

impl InferenceSelect {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        if raw == "all" {
            Self::All
        } else {
            Self::One(raw.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidityFilter {
    Both,
    Validated,
    Unvalidated,
}

impl ValidityFilter {
    pub fn parse(raw: &str) -> Result<Self, ExportError> {
        match raw {
            "both" => Ok(Self::Both),
            "validated" => Ok(Self::Validated),
            "unvalidated" => Ok(Self::Unvalidated),
            _ => Err(ExportError::InvalidRequest(format!(
                "validity must be both, validated, or unvalidated; got {raw:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportRequest {
    pub format: ExportFormat,
    pub inferences: InferenceSelect,
    pub validity: ValidityFilter,
    pub threshold: Option<f64>,
}

impl ExportRequest {
    pub fn validate(&self) -> Result<(), ExportError> {
        if self.validity != ValidityFilter::Both && self.inferences == InferenceSelect::All {
            return Err(ExportError::InvalidRequest(
                "validity filter requires a single inference".to_string(),
            ));
        }
        if let Some(threshold) = self.threshold {
            if !(0.0..=1.0).contains(&threshold) || !threshold.is_finite() {
                return Err(ExportError::InvalidRequest(format!(
                    "threshold {threshold} outside [0, 1]"
                )));
            }
        }
        Ok(())
    }

    /// Score cutoff applied when filtering rows (single inference only).
    #[must_use]
    pub fn filter_threshold(&self) -> f64 {
        self.threshold.unwrap_or(0.0)
    }

    /// Cutoff used when collapsing scores to 0/1 labels. Historically the
    /// default differs from the filter cutoff: 0.5, and only when exporting
    /// every inference.
    #[must_use]
    pub fn label_threshold(&self) -> f64 {
        match (&self.inferences, self.threshold) {
            (_, Some(t)) => t,
            (InferenceSelect::All, None) => 0.5,
            (InferenceSelect::One(_), None) => 0.0,
        }
    }
}

/// Filter pipeline shared by every export format, applied in a fixed
/// order: inference presence, then validity, then score threshold.
pub(crate) fn row_passes(row: &PredictionTile, request: &ExportRequest) -> bool {
    if let InferenceSelect::One(name) = &request.inferences {
        let Some(score) = row.predictions.get(name) else {
            return false;
        };
        let reviewed = row
            .validity
            .as_ref()
            .is_some_and(|v| v.contains_key(name));
        match request.validity {
            ValidityFilter::Both => {}
            ValidityFilter::Validated if !reviewed => return false,
            ValidityFilter::Unvalidated if reviewed => return false,
            _ => {}
        }
        if *score <= request.filter_threshold() {
            return false;
        }
    }
    true
}

/// Chunked writer for the row-streaming formats. `next_chunk` returns
/// `None` once the envelope is closed; each call pulls at most one cursor
/// batch, so memory stays bounded on arbitrarily large predictions.
#[derive(Debug)]
pub struct ExportStream<'a> {
    cursor: TileCursor<'a>,
    request: ExportRequest,
    /// CSV score columns: names observed across stored rows, or just the
    /// selected one.
    columns: Vec<String>,
    started: bool,
    wrote_feature: bool,
    finished: bool,
}

impl<'a> ExportStream<'a> {
    pub fn new(
        store: &'a Store,
        prediction_id: i64,
        request: ExportRequest,
    ) -> Result<Self, ExportError> {
        request.validate()?;
        if request.format == ExportFormat::Npz {
            return Err(ExportError::InvalidRequest(
                "npz exports are built whole, not streamed".to_string(),
            ));
        }
        let columns = match &request.inferences {
            InferenceSelect::All => store.inference_names(prediction_id)?,
            InferenceSelect::One(name) => vec![name.clone()],
        };
        let cursor = store.cursor(prediction_id)?;
        Ok(Self {
            cursor,
            request,
            columns,
            started: false,
            wrote_feature: false,
            finished: false,
        })
    }

    pub fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, ExportError> {
        if self.finished {
            return Ok(None);
        }
        if !self.started {
            self.started = true;
            match self.request.format {
                ExportFormat::GeoJson => {
                    return Ok(Some(
                        b"{ \"type\": \"FeatureCollection\", \"features\": [".to_vec(),
                    ));
                }
                ExportFormat::Csv => {
                    let mut header = vec![
                        "ID".to_string(),
                        "QuadKey".to_string(),
                        "QuadKeyGeom".to_string(),
                    ];
                    header.extend(self.columns.iter().cloned());
                    return Ok(Some(csv_record_bytes(&header)?));
                }
                ExportFormat::GeoJsonSeq => {}
                ExportFormat::Npz => unreachable!("rejected in new()"),
            }
        }
        loop {
            let batch = self.cursor.next_batch()?;
            if batch.is_empty() {
                self.finished = true;
                if self.request.format == ExportFormat::GeoJson {
                    return Ok(Some(b"]}".to_vec()));
                }
                return Ok(None);
            }
            let mut chunk = Vec::new();
            for row in &batch {
                if !row_passes(row, &self.request) {
                    continue;
                }
                match self.request.format {
                    ExportFormat::GeoJson => {
                        let prefix: &[u8] = if self.wrote_feature { b",\n" } else { b"\n" };
                        chunk.extend_from_slice(prefix);
                        chunk.extend_from_slice(feature_json(row).to_string().as_bytes());
                        self.wrote_feature = true;
                    }
                    ExportFormat::GeoJsonSeq => {
                        chunk.extend_from_slice(feature_json(row).to_string().as_bytes());
                        chunk.push(b'\n');
                    }
                    ExportFormat::Csv => {
                        chunk.extend_from_slice(&self.csv_row(row)?);
                    }
                    ExportFormat::Npz => unreachable!("rejected in new()"),
                }
            }
            if !chunk.is_empty() {
                return Ok(Some(chunk));
            }
        }
    }

    fn csv_row(&self, row: &PredictionTile) -> Result<Vec<u8>, ExportError> {
        let mut writer = csv::WriterBuilder::new()
            .quote_style(csv::QuoteStyle::NonNumeric)
            .from_writer(Vec::new());
        let geom = predtile_model::polygon_to_geojson(&row.geom).to_string();
        let mut record = vec![
            row.id.to_string(),
            row.quadkey.clone().unwrap_or_default(),
            geom,
        ];
        for name in &self.columns {
            let score = row.predictions.get(name).copied().unwrap_or(0.0);
            record.push(score.to_string());
        }
        writer
            .write_record(&record)
            .map_err(|e| ExportError::Encode(e.to_string()))?;
        writer
            .into_inner()
            .map_err(|e| ExportError::Encode(e.to_string()))
    }
}

fn csv_record_bytes(fields: &[String]) -> Result<Vec<u8>, ExportError> {
    let mut writer = csv::WriterBuilder::new()
        .quote_style(csv::QuoteStyle::NonNumeric)
        .from_writer(Vec::new());
    writer
        .write_record(fields)
        .map_err(|e| ExportError::Encode(e.to_string()))?;
    writer
        .into_inner()
        .map_err(|e| ExportError::Encode(e.to_string()))
}

fn feature_json(row: &PredictionTile) -> serde_json::Value {
    let mut properties = serde_json::Map::new();
    for (name, score) in &row.predictions {
        properties.insert(name.clone(), json!(score));
    }
    if let Some(validity) = &row.validity {
        properties.insert("validity".to_string(), json!(validity));
    }
    json!({
        "id": row.id,
        "quadkey": row.quadkey,
        "type": "Feature",
        "properties": properties,
        "geometry": predtile_model::polygon_to_geojson(&row.geom),
    })
}
