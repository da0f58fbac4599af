use crate::storage::list_recordings;
use crate::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use camgate_supervisor::{parse_stream_path, CameraId, GatewayError, RegistryError};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/api/camera-status/{name}", get(handle_camera_status))
        .route("/api/cameras", get(handle_list_cameras))
        .route("/api/cleanup", post(handle_cleanup))
        .route("/api/save/{camera}", post(handle_save))
        .route("/api/salvar/{filename}", put(handle_retain))
        .route("/api/importantes", get(handle_list_retained))
        .route("/api/files", get(handle_list_files))
        .route("/ingest/connect", post(handle_ingest_connect))
        .route("/ingest/publish", post(handle_ingest_publish))
        .route("/ingest/unpublish", post(handle_ingest_unpublish))
        .route("/healthz", get(handle_healthz))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn failure(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (
        status,
        Json(json!({ "success": false, "error": message.to_string() })),
    )
        .into_response()
}

fn camera_not_found(name: &str) -> Response {
    failure(StatusCode::NOT_FOUND, format!("Camera {} not found", name))
}

fn gateway_failure(e: GatewayError) -> Response {
    match e {
        GatewayError::Registry(RegistryError::UnknownCamera(camera)) => {
            camera_not_found(camera.as_str())
        }
        other => failure(StatusCode::INTERNAL_SERVER_ERROR, other),
    }
}

/// Parse a path segment into a camera id, rejecting anything that could not
/// be a configured camera name.
fn camera_from_path(name: &str) -> Option<CameraId> {
    CameraId::is_valid_name(name).then(|| CameraId::from(name))
}

async fn handle_camera_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    let Some(camera) = camera_from_path(&name) else {
        return camera_not_found(&name);
    };
    match state.gateway.camera_status(&camera).await {
        Some(view) => Json(json!({
            "success": true,
            "status": view.status,
            "metrics": view.metrics,
            "hasProcess": view.has_process,
            "hlsFiles": view.hls_files,
        }))
        .into_response(),
        None => {
            debug!("Status requested for unknown camera {}", name);
            camera_not_found(&name)
        }
    }
}

async fn handle_list_cameras(State(state): State<AppState>) -> Response {
    Json(json!({ "success": true, "cameras": state.gateway.cameras() })).into_response()
}

async fn handle_cleanup(State(state): State<AppState>) -> Response {
    info!("📡 Received POST /api/cleanup request");
    match state.gateway.cleanup().await {
        Ok(report) => Json(json!({
            "success": true,
            "stopped": report.stopped,
            "removedFiles": report.removed_files,
        }))
        .into_response(),
        Err(e) => {
            error!("❌ Cleanup failed: {}", e);
            gateway_failure(e)
        }
    }
}

async fn handle_save(State(state): State<AppState>, Path(camera): Path<String>) -> Response {
    let Some(camera) = camera_from_path(&camera) else {
        return camera_not_found(&camera);
    };
    info!("📡 Manual capture requested for {}", camera);
    match state.gateway.save_now(&camera).await {
        Ok(filename) => {
            info!("✅ Manual capture for {} saved as {}", camera, filename);
            Json(json!({ "success": true, "file": format!("/recordings/{}", filename) }))
                .into_response()
        }
        Err(e) => {
            error!("❌ Manual capture for {} failed: {}", camera, e);
            gateway_failure(e)
        }
    }
}

async fn handle_retain(State(state): State<AppState>, Path(filename): Path<String>) -> Response {
    match state.catalog.mark_retained(&filename).await {
        Ok(true) => {
            info!("📌 {} marked as retained", filename);
            Json(json!({
                "success": true,
                "message": format!("{} will be kept", filename),
            }))
            .into_response()
        }
        Ok(false) => failure(StatusCode::NOT_FOUND, format!("File {} not found", filename)),
        Err(e) => {
            error!("Failed to mark {} as retained: {}", filename, e);
            failure(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

async fn handle_list_retained(State(state): State<AppState>) -> Response {
    match state.catalog.retained().await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => {
            error!("Failed to list retained segments: {}", e);
            failure(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

async fn handle_list_files(State(state): State<AppState>) -> Response {
    match list_recordings(&state.recordings_dir).await {
        Ok(files) => Json(files).into_response(),
        Err(e) => {
            error!("Failed to list recordings: {}", e);
            failure(StatusCode::INTERNAL_SERVER_ERROR, "Failed to list recordings")
        }
    }
}

async fn handle_healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Lifecycle callback from the RTMP server.
#[derive(Debug, Deserialize)]
pub struct IngestEvent {
    /// Ingest session id
    pub id: String,
    pub app: Option<String>,
    pub stream_path: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl IngestEvent {
    /// The camera this event refers to, if it names one.
    fn camera(&self, default_app: &str) -> Option<CameraId> {
        let app = self.app.as_deref().unwrap_or(default_app);
        if let Some(path) = self.stream_path.as_deref() {
            return parse_stream_path(path, app);
        }
        self.name.as_deref().and_then(camera_from_path)
    }
}

fn ingest_rejected(event: &IngestEvent, e: GatewayError) -> Response {
    match e {
        GatewayError::Registry(RegistryError::UnknownCamera(camera)) => {
            warn!("🚫 Rejecting session {} for unconfigured camera {}", event.id, camera);
            failure(StatusCode::FORBIDDEN, format!("Camera {} is not configured", camera))
        }
        other => failure(StatusCode::INTERNAL_SERVER_ERROR, other),
    }
}

async fn handle_ingest_connect(
    State(state): State<AppState>,
    Json(event): Json<IngestEvent>,
) -> Response {
    let camera = event.camera(&state.rtmp_app);
    match state.gateway.on_client_connect(&event.id, camera.as_ref()) {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(e) => ingest_rejected(&event, e),
    }
}

async fn handle_ingest_publish(
    State(state): State<AppState>,
    Json(event): Json<IngestEvent>,
) -> Response {
    let Some(camera) = event.camera(&state.rtmp_app) else {
        warn!("🚫 Publish on session {} without a camera name", event.id);
        return failure(StatusCode::FORBIDDEN, "No camera in stream path");
    };
    debug!("Publish args for {}: {}", camera, event.args);
    match state.gateway.on_publish_start(&event.id, &camera).await {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        // Ingest is accepted and recording runs; only the preview is down
        Err(GatewayError::Hls(e)) => {
            error!("❌ Live preview for {} failed to start: {}", camera, e);
            Json(json!({ "success": false, "error": e.to_string() })).into_response()
        }
        Err(e) => ingest_rejected(&event, e),
    }
}

async fn handle_ingest_unpublish(
    State(state): State<AppState>,
    Json(event): Json<IngestEvent>,
) -> Response {
    let Some(camera) = event.camera(&state.rtmp_app) else {
        return failure(StatusCode::BAD_REQUEST, "No camera in stream path");
    };
    match state.gateway.on_publish_end(&event.id, &camera).await {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(e) => ingest_rejected(&event, e),
    }
}
