//! HTTP surface: the stateless analyze endpoint, a health probe and the
//! record lifecycle routes.

use std::net::SocketAddr;
use std::path::Path;

use axum::extract::{DefaultBodyLimit, Multipart, Path as UrlPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::ai::payload::{mime_for_path, ImagePayload};
use crate::scan::{
    DetectedRegion, EngineError, LogLine, ScanEngine, ScanRecord, ScanSummary, TransitionError,
};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match &err {
            EngineError::NotFound(_) => ApiError::NotFound(err.to_string()),
            EngineError::EmptyUpload(_)
            | EngineError::Transition(TransitionError::InvalidManifestCount(_)) => {
                ApiError::BadRequest(err.to_string())
            }
            EngineError::Transition(_) => ApiError::Conflict(err.to_string()),
            EngineError::Prescan(_) | EngineError::Interrupted { .. } => {
                ApiError::Internal(err.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(json!({ "success": false, "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthInfo {
    pub backend: String,
    pub mode: String,
    pub configured: bool,
}

#[derive(Clone)]
pub struct AppState {
    pub engine: ScanEngine,
    pub health: HealthInfo,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<DetectedRegion>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub logs: Vec<LogLine>,
}

impl AnalyzeResponse {
    fn failure(status: StatusCode, error: impl Into<String>, logs: Vec<LogLine>) -> Response {
        let body = AnalyzeResponse {
            success: false,
            data: None,
            error: Some(error.into()),
            logs,
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub count: u32,
}

#[derive(Debug, Deserialize)]
pub struct RetryRequest {
    pub ids: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryResult {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<ScanSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Default)]
struct UploadForm {
    file: Option<ImagePayload>,
    filename: Option<String>,
    file_id: Option<String>,
    expected_count: Option<String>,
}

async fn read_form(mut multipart: Multipart) -> Result<UploadForm, ApiError> {
    let mut form = UploadForm::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Multipart error: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let filename = field.file_name().map(str::to_string);
                let declared = field.content_type().map(str::to_string);
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Failed to read file: {e}")))?;
                let mime = declared
                    .filter(|mime| mime.starts_with("image/"))
                    .or_else(|| {
                        filename
                            .as_deref()
                            .and_then(|name| mime_for_path(Path::new(name)))
                            .map(str::to_string)
                    })
                    .unwrap_or_default();
                form.file = Some(ImagePayload::new(mime, data.to_vec()));
                form.filename = filename;
            }
            "fileId" | "expectedCount" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Failed to read {name}: {e}")))?;
                let value = value.trim().to_string();
                if value.is_empty() {
                    continue;
                }
                if name == "fileId" {
                    form.file_id = Some(value);
                } else {
                    form.expected_count = Some(value);
                }
            }
            _ => {}
        }
    }
    Ok(form)
}

/// POST /api/analyze - one escalated detection run, no record kept.
async fn analyze(State(state): State<AppState>, multipart: Multipart) -> Response {
    let form = match read_form(multipart).await {
        Ok(form) => form,
        Err(err) => return AnalyzeResponse::failure(err.status(), err.to_string(), Vec::new()),
    };
    let Some(image) = form.file.filter(|file| !file.is_empty()) else {
        return AnalyzeResponse::failure(StatusCode::BAD_REQUEST, "Missing file", Vec::new());
    };
    let Some(file_id) = form.file_id else {
        return AnalyzeResponse::failure(StatusCode::BAD_REQUEST, "Missing fileId", Vec::new());
    };
    // same rule as a manifest commit: at least one photo
    let expected = match form.expected_count.map(|raw| raw.parse::<u32>()) {
        None => None,
        Some(Ok(count)) if count >= 1 => Some(count),
        Some(_) => {
            return AnalyzeResponse::failure(
                StatusCode::BAD_REQUEST,
                "expectedCount must be a positive integer",
                Vec::new(),
            )
        }
    };

    let (result, logs) = state.engine.analyze(&file_id, &image, expected).await;
    match result {
        Ok(regions) => Json(AnalyzeResponse {
            success: true,
            data: Some(regions),
            error: None,
            logs,
        })
        .into_response(),
        Err(err) => AnalyzeResponse::failure(StatusCode::INTERNAL_SERVER_ERROR, err.to_string(), logs),
    }
}

async fn health(State(state): State<AppState>) -> Response {
    if !state.health.configured {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Missing Configuration").into_response();
    }
    Json(json!({
        "status": "Alive",
        "backend": state.health.backend,
        "mode": state.health.mode,
    }))
    .into_response()
}

/// POST /api/scans - registers an upload and starts its pre-scan in the background.
async fn upload_scan(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<ScanSummary>), ApiError> {
    let form = read_form(multipart).await?;
    let image = form
        .file
        .ok_or_else(|| ApiError::BadRequest("Missing file".to_string()))?;
    let filename = form
        .filename
        .or(form.file_id)
        .unwrap_or_else(|| "upload".to_string());
    let record = state.engine.upload(filename, image)?;

    let engine = state.engine.clone();
    let id = record.id.clone();
    tokio::spawn(async move {
        if let Err(err) = engine.run_fast_prescan(&id).await {
            tracing::warn!(scan_id = %id, error = %err, "pre-scan failed");
        }
    });

    Ok((StatusCode::CREATED, Json(record.summary())))
}

async fn list_scans(State(state): State<AppState>) -> Json<Vec<ScanSummary>> {
    Json(state.engine.list())
}

async fn get_scan(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<ScanRecord>, ApiError> {
    state
        .engine
        .get(&id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("scan {} not found", id)))
}

async fn verify_scan(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
    Json(request): Json<VerifyRequest>,
) -> Result<Json<ScanSummary>, ApiError> {
    let record = state.engine.verify_manifest(&id, request.count).await?;
    Ok(Json(record.summary()))
}

async fn retry_scans(
    State(state): State<AppState>,
    Json(request): Json<RetryRequest>,
) -> Result<Json<Vec<RetryResult>>, ApiError> {
    if request.ids.is_empty() {
        return Err(ApiError::BadRequest("ids must not be empty".to_string()));
    }
    let results = state
        .engine
        .retry(&request.ids)
        .await
        .into_iter()
        .map(|(id, result)| match result {
            Ok(record) => RetryResult {
                id,
                record: Some(record.summary()),
                error: None,
            },
            Err(err) => RetryResult {
                id,
                record: None,
                error: Some(err.to_string()),
            },
        })
        .collect();
    Ok(Json(results))
}

async fn approve_scan(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<ScanSummary>, ApiError> {
    let record = state.engine.approve_and_restore(&id).await?;
    Ok(Json(record.summary()))
}

async fn delete_scan(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<StatusCode, ApiError> {
    state.engine.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn clear_scans(State(state): State<AppState>) -> Json<serde_json::Value> {
    let removed = state.engine.clear().await;
    Json(json!({ "removed": removed }))
}

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/analyze", post(analyze))
        .route("/api/scans", post(upload_scan).get(list_scans).delete(clear_scans))
        .route("/api/scans/retry", post(retry_scans))
        .route("/api/scans/:id", get(get_scan).delete(delete_scan))
        .route("/api/scans/:id/verify", post(verify_scan))
        .route("/api/scans/:id/approve", post(approve_scan))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state)
}

pub async fn serve(app: Router, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
