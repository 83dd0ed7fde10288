use crate::{
    error_response, export_error_response, store_error_response, tiler_error_response, AppState,
    CRATE_NAME,
};
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use predtile_core::sha256_hex;
use predtile_export::{
    export_npz, ExportFormat, ExportRequest, ExportStream, InferenceSelect, ValidityFilter,
};
use predtile_model::{
    ImageryDraft, ImageryFormat, Prediction, PredictionDraft, ProjectDraft, TileInput,
    ValidityPatch,
};
use predtile_store::{Store, StoreError};
use predtile_tiler::{render_tile, TilerError};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

fn make_request_id(state: &AppState) -> String {
    let id = state.request_id_seed.fetch_add(1, Ordering::Relaxed);
    format!("req-{id:016x}")
}

fn propagated_request_id(headers: &HeaderMap, state: &AppState) -> String {
    if let Some(raw) = headers.get("x-request-id").and_then(|v| v.to_str().ok()) {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    make_request_id(state)
}

fn with_request_id(mut response: Response, request_id: &str) -> Response {
    if let Ok(v) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert("x-request-id", v);
    }
    response
}

/// Fetches a prediction and checks it sits under the project in the path,
/// so a valid prediction id cannot be read through another project's URL.
fn owned_prediction(
    store: &Store,
    project_id: i64,
    prediction_id: i64,
) -> Result<Prediction, StoreError> {
    let prediction = store.get_prediction(prediction_id)?;
    if prediction.project_id != project_id {
        return Err(StoreError::NotFound(format!(
            "prediction {prediction_id} in project {project_id}"
        )));
    }
    Ok(prediction)
}

async fn with_store<T, F>(state: &AppState, f: F) -> Result<T, StoreError>
where
    F: FnOnce(&mut Store) -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    let db = state.config.db_path.clone();
    match tokio::task::spawn_blocking(move || {
        let mut store = Store::open(&db)?;
        f(&mut store)
    })
    .await
    {
        Ok(result) => result,
        Err(e) => Err(StoreError::Sql(format!("blocking task failed: {e}"))),
    }
}

pub(crate) async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub(crate) async fn version_handler() -> impl IntoResponse {
    Json(json!({
        "name": CRATE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub(crate) async fn create_project_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(draft): Json<ProjectDraft>,
) -> Response {
    let request_id = propagated_request_id(&headers, &state);
    let result = with_store(&state, move |store| store.create_project(&draft)).await;
    let response = match result {
        Ok(project) => Json(project).into_response(),
        Err(e) => store_error_response(&e),
    };
    with_request_id(response, &request_id)
}

pub(crate) async fn create_imagery_handler(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
    headers: HeaderMap,
    Json(draft): Json<ImageryDraft>,
) -> Response {
    let request_id = propagated_request_id(&headers, &state);
    let result = with_store(&state, move |store| {
        store.create_imagery(project_id, &draft)
    })
    .await;
    let response = match result {
        Ok(imagery) => Json(imagery).into_response(),
        Err(e) => store_error_response(&e),
    };
    with_request_id(response, &request_id)
}

pub(crate) async fn list_imagery_handler(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
    headers: HeaderMap,
) -> Response {
    let request_id = propagated_request_id(&headers, &state);
    let result = with_store(&state, move |store| store.list_imagery(project_id)).await;
    let response = match result {
        Ok(imagery) => Json(imagery).into_response(),
        Err(e) => store_error_response(&e),
    };
    with_request_id(response, &request_id)
}

pub(crate) async fn create_prediction_handler(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
    headers: HeaderMap,
    Json(draft): Json<PredictionDraft>,
) -> Response {
    let request_id = propagated_request_id(&headers, &state);
    let result = with_store(&state, move |store| {
        store.create_prediction(project_id, &draft)
    })
    .await;
    let response = match result {
        Ok(prediction) => Json(prediction).into_response(),
        Err(e) => store_error_response(&e),
    };
    with_request_id(response, &request_id)
}

pub(crate) async fn list_predictions_handler(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
    headers: HeaderMap,
) -> Response {
    let request_id = propagated_request_id(&headers, &state);
    let result = with_store(&state, move |store| store.list_predictions(project_id)).await;
    let response = match result {
        Ok(predictions) => Json(predictions).into_response(),
        Err(e) => store_error_response(&e),
    };
    with_request_id(response, &request_id)
}

pub(crate) async fn get_prediction_handler(
    State(state): State<AppState>,
    Path((project_id, prediction_id)): Path<(i64, i64)>,
    headers: HeaderMap,
) -> Response {
    let request_id = propagated_request_id(&headers, &state);
    let result = with_store(&state, move |store| {
        owned_prediction(store, project_id, prediction_id)
    })
    .await;
    let response = match result {
        Ok(prediction) => Json(prediction).into_response(),
        Err(e) => store_error_response(&e),
    };
    with_request_id(response, &request_id)
}

pub(crate) async fn ingest_tiles_handler(
    State(state): State<AppState>,
    Path((project_id, prediction_id)): Path<(i64, i64)>,
    headers: HeaderMap,
    Json(rows): Json<Vec<TileInput>>,
) -> Response {
    let request_id = propagated_request_id(&headers, &state);
    let result = with_store(&state, move |store| {
        owned_prediction(store, project_id, prediction_id)?;
        store.create_tile_batch(prediction_id, &rows)
    })
    .await;
    let response = match result {
        Ok(ids) => Json(json!({"count": ids.len(), "ids": ids})).into_response(),
        Err(e) => store_error_response(&e),
    };
    with_request_id(response, &request_id)
}

pub(crate) async fn validity_handler(
    State(state): State<AppState>,
    Path((project_id, prediction_id)): Path<(i64, i64)>,
    headers: HeaderMap,
    Json(patch): Json<ValidityPatch>,
) -> Response {
    let request_id = propagated_request_id(&headers, &state);
    let result = with_store(&state, move |store| {
        owned_prediction(store, project_id, prediction_id)?;
        store.update_validity(prediction_id, &patch)
    })
    .await;
    let response = match result {
        Ok(merged) => Json(json!({"validity": merged})).into_response(),
        Err(e) => store_error_response(&e),
    };
    with_request_id(response, &request_id)
}

pub(crate) async fn tile_handler(
    State(state): State<AppState>,
    Path((project_id, prediction_id, z, x, y)): Path<(i64, i64, u8, u32, u32)>,
    headers: HeaderMap,
) -> Response {
    let request_id = propagated_request_id(&headers, &state);
    let db = state.config.db_path.clone();
    let result = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, TilerError> {
        let store = Store::open(&db).map_err(TilerError::Store)?;
        owned_prediction(&store, project_id, prediction_id).map_err(|e| match e {
            StoreError::NotFound(_) => TilerError::PredictionsNotFound(prediction_id),
            other => TilerError::Store(other),
        })?;
        render_tile(&store, prediction_id, z, x, y)
    })
    .await;
    let result = match result {
        Ok(r) => r,
        Err(e) => Err(TilerError::Encode(format!("blocking task failed: {e}"))),
    };
    let response = match result {
        Ok(bytes) => {
            let etag = format!("\"{}\"", sha256_hex(&bytes));
            if headers
                .get("if-none-match")
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v == etag)
            {
                let mut response = StatusCode::NOT_MODIFIED.into_response();
                if let Ok(v) = HeaderValue::from_str(&etag) {
                    response.headers_mut().insert(header::ETAG, v);
                }
                response
            } else {
                let mut response = (StatusCode::OK, bytes).into_response();
                let headers = response.headers_mut();
                headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/x-protobuf"),
                );
                if let Ok(v) = HeaderValue::from_str(&etag) {
                    headers.insert(header::ETAG, v);
                }
                let ttl = state.config.tile_ttl.as_secs();
                if let Ok(v) = HeaderValue::from_str(&format!("public, max-age={ttl}")) {
                    headers.insert(header::CACHE_CONTROL, v);
                }
                response
            }
        }
        Err(e) => tiler_error_response(&e),
    };
    with_request_id(response, &request_id)
}

pub(crate) async fn tilejson_handler(
    State(state): State<AppState>,
    Path((project_id, prediction_id)): Path<(i64, i64)>,
    headers: HeaderMap,
) -> Response {
    let request_id = propagated_request_id(&headers, &state);
    let result = with_store(&state, move |store| {
        let prediction = owned_prediction(store, project_id, prediction_id)?;
        let (minzoom, maxzoom) = store.quadkey_zoom_range(prediction_id)?;
        let (min_lon, min_lat, max_lon, max_lat) = store.tile_extent(prediction_id)?;
        Ok(json!({
            "tilejson": "2.2.0",
            "name": format!("prediction-{prediction_id}"),
            "version": prediction.version,
            "scheme": "xyz",
            "tiles": [format!(
                "/v1/projects/{project_id}/predictions/{prediction_id}/tiles/{{z}}/{{x}}/{{y}}"
            )],
            "minzoom": minzoom,
            "maxzoom": maxzoom,
            "bounds": [min_lon, min_lat, max_lon, max_lat],
            "center": [
                (min_lon + max_lon) / 2.0,
                (min_lat + max_lat) / 2.0,
                maxzoom
            ],
        }))
    })
    .await;
    let response = match result {
        Ok(doc) => Json(doc).into_response(),
        Err(e) => store_error_response(&e),
    };
    with_request_id(response, &request_id)
}

#[derive(Debug, Deserialize)]
pub(crate) struct AggregateParams {
    zoom: u8,
    quadkeys: String,
}

pub(crate) async fn aggregate_handler(
    State(state): State<AppState>,
    Path((project_id, prediction_id)): Path<(i64, i64)>,
    Query(params): Query<AggregateParams>,
    headers: HeaderMap,
) -> Response {
    let request_id = propagated_request_id(&headers, &state);
    let prefixes: Vec<String> = params
        .quadkeys
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if prefixes.is_empty() {
        let response = error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "quadkeys parameter must list at least one quadkey",
        );
        return with_request_id(response, &request_id);
    }
    let zoom = params.zoom;
    let result = with_store(&state, move |store| {
        owned_prediction(store, project_id, prediction_id)?;
        store.aggregate_by_quadkey_prefix(prediction_id, zoom, &prefixes)
    })
    .await;
    let response = match result {
        Ok(means) => Json(means).into_response(),
        Err(e) => store_error_response(&e),
    };
    with_request_id(response, &request_id)
}

fn default_format() -> String {
    "geojson".to_string()
}

fn default_inferences() -> String {
    "all".to_string()
}

fn default_validity() -> String {
    "both".to_string()
}

#[derive(Debug, Deserialize)]
pub(crate) struct ExportParams {
    #[serde(default = "default_format")]
    format: String,
    #[serde(default = "default_inferences")]
    inferences: String,
    #[serde(default = "default_validity")]
    validity: String,
    #[serde(default)]
    threshold: Option<f64>,
}

pub(crate) async fn export_handler(
    State(state): State<AppState>,
    Path((project_id, prediction_id)): Path<(i64, i64)>,
    Query(params): Query<ExportParams>,
    headers: HeaderMap,
) -> Response {
    let request_id = propagated_request_id(&headers, &state);
    let request = match parse_export_params(&params) {
        Ok(request) => request,
        Err(e) => return with_request_id(export_error_response(&e), &request_id),
    };
    let response = if request.format == ExportFormat::Npz {
        npz_response(&state, project_id, prediction_id, request).await
    } else {
        stream_response(&state, project_id, prediction_id, request).await
    };
    with_request_id(response, &request_id)
}

fn parse_export_params(
    params: &ExportParams,
) -> Result<ExportRequest, predtile_export::ExportError> {
    let request = ExportRequest {
        format: ExportFormat::parse(&params.format)?,
        inferences: InferenceSelect::parse(&params.inferences),
        validity: ValidityFilter::parse(&params.validity)?,
        threshold: params.threshold,
    };
    request.validate()?;
    Ok(request)
}

async fn npz_response(
    state: &AppState,
    project_id: i64,
    prediction_id: i64,
    request: ExportRequest,
) -> Response {
    let db = state.config.db_path.clone();
    let result = tokio::task::spawn_blocking(
        move || -> Result<Vec<u8>, predtile_export::ExportError> {
            let store = Store::open(&db)?;
            let prediction = owned_prediction(&store, project_id, prediction_id)?;
            let chips = match prediction.imagery_id {
                Some(imagery_id) => {
                    let imagery = store.get_imagery(imagery_id)?;
                    if imagery.fmt == ImageryFormat::List {
                        store.imagery_chips(imagery_id)?
                    } else {
                        None
                    }
                }
                None => None,
            };
            export_npz(&store, prediction_id, &request, chips.as_deref())
        },
    )
    .await;
    let result = match result {
        Ok(r) => r,
        Err(e) => Err(predtile_export::ExportError::Encode(format!(
            "blocking task failed: {e}"
        ))),
    };
    match result {
        Ok(bytes) => {
            let mut response = (StatusCode::OK, bytes).into_response();
            let headers = response.headers_mut();
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/npz"),
            );
            headers.insert(
                header::CONTENT_DISPOSITION,
                HeaderValue::from_static("attachment; filename=\"export.npz\""),
            );
            response
        }
        Err(e) => export_error_response(&e),
    }
}

async fn stream_response(
    state: &AppState,
    project_id: i64,
    prediction_id: i64,
    request: ExportRequest,
) -> Response {
    // Pre-flight on its own connection so setup failures map to a proper
    // status instead of a truncated stream.
    let preflight = with_store(state, move |store| {
        owned_prediction(store, project_id, prediction_id)?;
        Ok(())
    })
    .await;
    if let Err(e) = preflight {
        return store_error_response(&e);
    }

    let format = request.format;
    let db = state.config.db_path.clone();
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(8);
    tokio::task::spawn_blocking(move || {
        let fail = |e: predtile_export::ExportError| std::io::Error::other(e.to_string());
        let store = match Store::open(&db) {
            Ok(store) => store,
            Err(e) => {
                let _ = tx.blocking_send(Err(fail(e.into())));
                return;
            }
        };
        let mut stream = match ExportStream::new(&store, prediction_id, request) {
            Ok(stream) => stream,
            Err(e) => {
                let _ = tx.blocking_send(Err(fail(e)));
                return;
            }
        };
        loop {
            match stream.next_chunk() {
                Ok(Some(chunk)) => {
                    if tx.blocking_send(Ok(Bytes::from(chunk))).is_err() {
                        return;
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    let _ = tx.blocking_send(Err(fail(e)));
                    return;
                }
            }
        }
    });
    info!(prediction_id, format = format.extension(), "streaming export");

    let body = Body::from_stream(ReceiverStream::new(rx));
    let mut response = (StatusCode::OK, body).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(format.mime()));
    if let Ok(v) = HeaderValue::from_str(&format!(
        "attachment; filename=\"export.{}\"",
        format.extension()
    )) {
        headers.insert(header::CONTENT_DISPOSITION, v);
    }
    response
}

pub(crate) async fn import_handler(
    State(state): State<AppState>,
    Path((project_id, prediction_id)): Path<(i64, i64)>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let request_id = propagated_request_id(&headers, &state);
    let mut rows = Vec::new();
    for (lineno, line) in body.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match feature_to_tile_input(line) {
            Ok(input) => rows.push(input),
            Err(message) => {
                let response = error_response(
                    StatusCode::BAD_REQUEST,
                    "invalid_request",
                    &format!("line {}: {message}", lineno + 1),
                );
                return with_request_id(response, &request_id);
            }
        }
    }
    let result = with_store(&state, move |store| {
        owned_prediction(store, project_id, prediction_id)?;
        store.create_tile_batch(prediction_id, &rows)
    })
    .await;
    let response = match result {
        Ok(ids) => Json(json!({"count": ids.len(), "ids": ids})).into_response(),
        Err(e) => store_error_response(&e),
    };
    with_request_id(response, &request_id)
}

/// One line of a GeoJSON feature sequence becomes one quadkey-less tile
/// row; numeric properties become inference scores.
fn feature_to_tile_input(line: &str) -> Result<TileInput, String> {
    let value: Value =
        serde_json::from_str(line).map_err(|e| format!("feature is not valid json: {e}"))?;
    let geometry = value
        .get("geometry")
        .cloned()
        .ok_or_else(|| "feature has no geometry".to_string())?;
    let mut predictions = BTreeMap::new();
    if let Some(props) = value.get("properties").and_then(Value::as_object) {
        for (name, raw) in props {
            if let Some(score) = raw.as_f64() {
                predictions.insert(name.clone(), score);
            }
        }
    }
    if predictions.is_empty() {
        return Err("feature has no numeric properties".to_string());
    }
    Ok(TileInput {
        quadkey: None,
        geom: geometry,
        predictions,
    })
}
