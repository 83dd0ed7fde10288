#![forbid(unsafe_code)]

mod api_config;
mod http_handlers;

pub use api_config::ApiConfig;

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use predtile_export::ExportError;
use predtile_store::StoreError;
use predtile_tiler::TilerError;
use serde_json::json;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tracing::error;

pub const CRATE_NAME: &str = "predtile-server";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ApiConfig>,
    pub request_id_seed: Arc<AtomicU64>,
}

impl AppState {
    #[must_use]
    pub fn new(config: ApiConfig) -> Self {
        Self {
            config: Arc::new(config),
            request_id_seed: Arc::new(AtomicU64::new(1)),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let max_body = state.config.max_body_bytes;
    Router::new()
        .route("/healthz", get(http_handlers::healthz_handler))
        .route("/v1/version", get(http_handlers::version_handler))
        .route("/v1/projects", post(http_handlers::create_project_handler))
        .route(
            "/v1/projects/:project/imagery",
            post(http_handlers::create_imagery_handler).get(http_handlers::list_imagery_handler),
        )
        .route(
            "/v1/projects/:project/predictions",
            post(http_handlers::create_prediction_handler)
                .get(http_handlers::list_predictions_handler),
        )
        .route(
            "/v1/projects/:project/predictions/:prediction",
            get(http_handlers::get_prediction_handler),
        )
        .route(
            "/v1/projects/:project/predictions/:prediction/tiles",
            post(http_handlers::ingest_tiles_handler).get(http_handlers::tilejson_handler),
        )
        .route(
            "/v1/projects/:project/predictions/:prediction/tiles/validity",
            post(http_handlers::validity_handler),
        )
        .route(
            "/v1/projects/:project/predictions/:prediction/tiles/aggregate",
            get(http_handlers::aggregate_handler),
        )
        .route(
            "/v1/projects/:project/predictions/:prediction/tiles/:z/:x/:y",
            get(http_handlers::tile_handler),
        )
        .route(
            "/v1/projects/:project/predictions/:prediction/export",
            get(http_handlers::export_handler),
        )
        .route(
            "/v1/projects/:project/predictions/:prediction/import",
            post(http_handlers::import_handler),
        )
        .layer(DefaultBodyLimit::max(max_body))
        .with_state(state)
}

pub(crate) fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    let body = Json(json!({"error": {"code": code, "message": message}}));
    (status, body).into_response()
}

pub(crate) fn store_error_response(err: &StoreError) -> Response {
    match err {
        StoreError::NotFound(_) => {
            error_response(StatusCode::NOT_FOUND, "not_found", &err.to_string())
        }
        StoreError::EmptyResult(_) => {
            error_response(StatusCode::NOT_FOUND, "empty_result", &err.to_string())
        }
        StoreError::SchemaMismatch(_) => {
            error_response(StatusCode::BAD_REQUEST, "schema_mismatch", &err.to_string())
        }
        StoreError::InvalidRequest(_) => {
            error_response(StatusCode::BAD_REQUEST, "invalid_request", &err.to_string())
        }
        StoreError::Decode(_) | StoreError::Sql(_) => {
            error!(error = %err, "storage failure");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                "storage failure",
            )
        }
        _ => {
            error!(error = %err, "storage failure");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                "storage failure",
            )
        }
    }
}

pub(crate) fn tiler_error_response(err: &TilerError) -> Response {
    match err {
        TilerError::PredictionsNotFound(_) => {
            error_response(StatusCode::NOT_FOUND, "not_found", &err.to_string())
        }
        TilerError::TileMath(_) => {
            error_response(StatusCode::BAD_REQUEST, "invalid_request", &err.to_string())
        }
        TilerError::Store(inner) => store_error_response(inner),
        _ => {
            error!(error = %err, "tile render failure");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                "tile render failure",
            )
        }
    }
}

pub(crate) fn export_error_response(err: &ExportError) -> Response {
    match err {
        ExportError::InvalidRequest(_) => {
            error_response(StatusCode::BAD_REQUEST, "invalid_request", &err.to_string())
        }
        ExportError::NoValidData => {
            error_response(StatusCode::BAD_REQUEST, "no_valid_data", &err.to_string())
        }
        ExportError::Store(inner) => store_error_response(inner),
        _ => {
            error!(error = %err, "export failure");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                "export failure",
            )
        }
    }
}
