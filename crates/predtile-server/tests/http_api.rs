use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use predtile_core::tilemath;
use predtile_server::{build_router, ApiConfig, AppState};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

fn test_app() -> (Router, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = ApiConfig {
        db_path: dir.path().join("predtile.db"),
        ..ApiConfig::default()
    };
    (build_router(AppState::new(config)), dir)
}

async fn send_json(app: &Router, method: &str, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, bytes.to_vec())
}

fn tile_geom(x: u32, y: u32, z: u8) -> Value {
    let (min_lon, min_lat, max_lon, max_lat) = tilemath::tile_bounds(x, y, z).unwrap();
    json!({
        "type": "Polygon",
        "coordinates": [[
            [min_lon, min_lat], [max_lon, min_lat], [max_lon, max_lat],
            [min_lon, max_lat], [min_lon, min_lat]
        ]]
    })
}

/// Creates a project with one prediction and two ingested tiles; returns
/// `(project_id, prediction_id, tile_ids)`.
async fn seed(app: &Router) -> (i64, i64, Vec<i64>) {
    let (status, project) = send_json(
        app,
        "POST",
        "/v1/projects",
        json!({"name": "building-detector", "source": "s3://m", "tags": ["osm"]}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let project_id = project["id"].as_i64().unwrap();

    let (status, prediction) = send_json(
        app,
        "POST",
        &format!("/v1/projects/{project_id}/predictions"),
        json!({
            "hint": "prediction",
            "version": "1.0.0",
            "tile_zoom": 16,
            "inf_list": ["building", "not_building"],
            "inf_type": "classification",
            "inf_binary": true,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let prediction_id = prediction["id"].as_i64().unwrap();

    let quadkey_a = tilemath::tile_to_quadkey(35210, 21493, 16).unwrap();
    let quadkey_b = tilemath::tile_to_quadkey(35211, 21493, 16).unwrap();
    let (status, ingested) = send_json(
        app,
        "POST",
        &format!("/v1/projects/{project_id}/predictions/{prediction_id}/tiles"),
        json!([
            {
                "quadkey": quadkey_a,
                "geom": tile_geom(35210, 21493, 16),
                "predictions": {"building": 0.9, "not_building": 0.1}
            },
            {
                "quadkey": quadkey_b,
                "geom": tile_geom(35211, 21493, 16),
                "predictions": {"building": 0.2, "not_building": 0.8}
            }
        ]),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let ids = ingested["ids"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_i64().unwrap())
        .collect();
    (project_id, prediction_id, ids)
}

#[tokio::test]
async fn health_and_version_respond() {
    let (app, _dir) = test_app();
    let (status, body) = get(&app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"ok");
    let (status, body) = get(&app, "/v1/version").await;
    assert_eq!(status, StatusCode::OK);
    let version: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(version["name"], "predtile-server");
}

#[tokio::test]
async fn ingest_then_fetch_prediction() {
    let (app, _dir) = test_app();
    let (project_id, prediction_id, ids) = seed(&app).await;
    assert_eq!(ids.len(), 2);
    let (status, body) = get(
        &app,
        &format!("/v1/projects/{project_id}/predictions/{prediction_id}"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let prediction: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(prediction["tile_zoom"], 16);
    assert_eq!(prediction["inf_list"][0], "building");
}

#[tokio::test]
async fn prediction_is_scoped_to_its_project() {
    let (app, _dir) = test_app();
    let (_, prediction_id, _) = seed(&app).await;
    let (status, other_project) = send_json(
        &app,
        "POST",
        "/v1/projects",
        json!({"name": "other"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let other_id = other_project["id"].as_i64().unwrap();
    let (status, _) = get(
        &app,
        &format!("/v1/projects/{other_id}/predictions/{prediction_id}"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn schema_mismatch_rejects_batch_with_400() {
    let (app, _dir) = test_app();
    let (project_id, prediction_id, _) = seed(&app).await;
    let (status, body) = send_json(
        &app,
        "POST",
        &format!("/v1/projects/{project_id}/predictions/{prediction_id}/tiles"),
        json!([{
            "quadkey": null,
            "geom": tile_geom(100, 200, 10),
            "predictions": {"water": 0.5}
        }]),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "schema_mismatch");
}

#[tokio::test]
async fn mvt_tile_carries_etag_and_honors_if_none_match() {
    let (app, _dir) = test_app();
    let (project_id, prediction_id, _) = seed(&app).await;
    let uri = format!(
        "/v1/projects/{project_id}/predictions/{prediction_id}/tiles/16/35210/21493"
    );
    let response = app
        .clone()
        .oneshot(Request::builder().uri(&uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/x-protobuf"
    );
    let etag = response.headers().get("etag").unwrap().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert!(!bytes.is_empty());

    let cached = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(&uri)
                .header("if-none-match", etag)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(cached.status(), StatusCode::NOT_MODIFIED);
}

#[tokio::test]
async fn tilejson_reports_zoom_and_bounds() {
    let (app, _dir) = test_app();
    let (project_id, prediction_id, _) = seed(&app).await;
    let (status, body) = get(
        &app,
        &format!("/v1/projects/{project_id}/predictions/{prediction_id}/tiles"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let doc: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(doc["minzoom"], 16);
    assert_eq!(doc["maxzoom"], 16);
    assert_eq!(doc["bounds"].as_array().unwrap().len(), 4);
    assert!(doc["tiles"][0]
        .as_str()
        .unwrap()
        .ends_with("/tiles/{z}/{x}/{y}"));
}

#[tokio::test]
async fn validity_patch_returns_merged_map() {
    let (app, _dir) = test_app();
    let (project_id, prediction_id, ids) = seed(&app).await;
    let (status, body) = send_json(
        &app,
        "POST",
        &format!("/v1/projects/{project_id}/predictions/{prediction_id}/tiles/validity"),
        json!({"id": ids[0], "validity": {"building": false, "bogus": true}}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["validity"], json!({"building": false}));
}

#[tokio::test]
async fn aggregate_returns_means_per_prefix() {
    let (app, _dir) = test_app();
    let (project_id, prediction_id, _) = seed(&app).await;
    let parent = tilemath::tile_to_quadkey(17605, 10746, 15).unwrap();
    let (status, body) = get(
        &app,
        &format!(
            "/v1/projects/{project_id}/predictions/{prediction_id}/tiles/aggregate?zoom=15&quadkeys={parent}"
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let means: Value = serde_json::from_slice(&body).unwrap();
    let building = means[parent.as_str()]["building"].as_f64().unwrap();
    assert!((building - 0.55).abs() < 1e-9);
}

#[tokio::test]
async fn geojson_export_streams_a_feature_collection() {
    let (app, _dir) = test_app();
    let (project_id, prediction_id, _) = seed(&app).await;
    let (status, body) = get(
        &app,
        &format!("/v1/projects/{project_id}/predictions/{prediction_id}/export?format=geojson"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let collection: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(collection["type"], "FeatureCollection");
    assert_eq!(collection["features"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn csv_export_has_header_row() {
    let (app, _dir) = test_app();
    let (project_id, prediction_id, _) = seed(&app).await;
    let (status, body) = get(
        &app,
        &format!("/v1/projects/{project_id}/predictions/{prediction_id}/export?format=csv"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.starts_with("\"ID\",\"QuadKey\",\"QuadKeyGeom\""));
    assert_eq!(text.lines().count(), 3);
}

#[tokio::test]
async fn npz_export_returns_archive_bytes() {
    let (app, _dir) = test_app();
    let (project_id, prediction_id, _) = seed(&app).await;
    let (status, body) = get(
        &app,
        &format!("/v1/projects/{project_id}/predictions/{prediction_id}/export?format=npz"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    // zip local file header magic
    assert_eq!(&body[..2], b"PK");
}

#[tokio::test]
async fn export_rejects_validity_filter_over_all_inferences() {
    let (app, _dir) = test_app();
    let (project_id, prediction_id, _) = seed(&app).await;
    let (status, body) = get(
        &app,
        &format!(
            "/v1/projects/{project_id}/predictions/{prediction_id}/export?validity=validated"
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let error: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(error["error"]["code"], "invalid_request");
}

#[tokio::test]
async fn import_accepts_line_delimited_features() {
    let (app, _dir) = test_app();
    let (project_id, prediction_id, _) = seed(&app).await;
    let feature = json!({
        "type": "Feature",
        "properties": {"building": 0.7, "name": "ignored"},
        "geometry": tile_geom(35212, 21493, 16)
    });
    let body = format!("{feature}\n{feature}\n");
    let request = Request::builder()
        .method("POST")
        .uri(format!(
            "/v1/projects/{project_id}/predictions/{prediction_id}/import"
        ))
        .header("content-type", "text/plain")
        .body(Body::from(body))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let result: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(result["count"], 2);
}

#[tokio::test]
async fn request_id_is_propagated_back() {
    let (app, _dir) = test_app();
    let request = Request::builder()
        .method("POST")
        .uri("/v1/projects")
        .header("content-type", "application/json")
        .header("x-request-id", "req-abc-123")
        .body(Body::from(
            serde_json::to_vec(&json!({"name": "traced"})).unwrap(),
        ))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(
        response.headers().get("x-request-id").unwrap(),
        "req-abc-123"
    );
}

#[tokio::test]
async fn unknown_prediction_is_404_everywhere() {
    let (app, _dir) = test_app();
    let (project_id, _, _) = seed(&app).await;
    for uri in [
        format!("/v1/projects/{project_id}/predictions/999"),
        format!("/v1/projects/{project_id}/predictions/999/tiles/16/0/0"),
        format!("/v1/projects/{project_id}/predictions/999/export"),
    ] {
        let (status, _) = get(&app, &uri).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
    }
}
