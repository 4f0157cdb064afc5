use crate::archive::{entry_name, ArchiveAssembler, ArchiveError, ArchiveStatus};
use crate::batch::{BatchError, BatchOrchestrator, BatchProgress};
use crate::config::ApiConfig;
use crate::image_store::{ImageRecord, ImageStore, UploadedFile};
use crate::status::{StatusKind, TransitionError};
use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ImageStore>,
    pub orchestrator: Arc<BatchOrchestrator>,
    pub archive: Arc<ArchiveAssembler>,
}

/// Image record in API responses
#[derive(Debug, Serialize)]
pub struct ImageResponse {
    pub id: String,
    pub name: String,
    pub media_type: String,
    pub size_bytes: usize,
    pub created_at: DateTime<Utc>,
    pub status: StatusKind,
    /// Failure detail, only in error state
    pub error: Option<String>,
    /// Enhanced payload details, only in success state
    pub enhanced_media_type: Option<String>,
    pub enhanced_size_bytes: Option<usize>,
    /// Download file name for the enhanced image
    pub download_name: String,
}

impl From<&ImageRecord> for ImageResponse {
    fn from(r: &ImageRecord) -> Self {
        Self {
            id: r.id.clone(),
            name: r.name.clone(),
            media_type: r.source.media_type.clone(),
            size_bytes: r.source.data.len(),
            created_at: r.created_at,
            status: r.status.kind(),
            error: r.error_detail().map(String::from),
            enhanced_media_type: r.enhanced().map(|e| e.media_type.clone()),
            enhanced_size_bytes: r.enhanced().map(|e| e.data.len()),
            download_name: entry_name(&r.name, &r.source.media_type),
        }
    }
}

/// Upload response
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    /// Records created, in upload order
    pub images: Vec<ImageResponse>,
    /// Parts ignored because they were not images
    pub skipped: usize,
}

/// Image list response
#[derive(Debug, Serialize)]
pub struct ImageListResponse {
    pub images: Vec<ImageResponse>,
    pub total_count: usize,
}

/// Batch cancellation response
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
}

fn not_found() -> ApiError {
    api_error(StatusCode::NOT_FOUND, "Image not found", "NOT_FOUND")
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/images", post(upload_images).get(list_images))
        .route("/api/v1/images/:id", get(get_image))
        .route("/api/v1/images/:id/original", get(get_original))
        .route("/api/v1/images/:id/enhance", post(enhance_image))
        .route("/api/v1/images/:id/download", get(download_image))
        .route("/api/v1/batch", post(start_batch).get(batch_progress))
        .route("/api/v1/batch/cancel", post(cancel_batch))
        .route("/api/v1/archive", get(download_archive))
        .route("/api/v1/archive/status", get(archive_status))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "enhancer-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if state.orchestrator.is_ready() {
        (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "credential": "configured"
            })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "credential": "missing"
            })),
        )
    }
}

/// Accept a multipart upload of one or more images
#[instrument(skip(state, multipart))]
async fn upload_images(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), ApiError> {
    let mut files = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        warn!(error = %e, "Malformed multipart upload");
        api_error(StatusCode::BAD_REQUEST, e.body_text(), "INVALID_UPLOAD")
    })? {
        let name = field
            .file_name()
            .or_else(|| field.name())
            .unwrap_or("upload")
            .to_string();
        let media_type = field.content_type().map(String::from);
        let data = field.bytes().await.map_err(|e| {
            warn!(error = %e, name = %name, "Failed to read upload part");
            api_error(StatusCode::BAD_REQUEST, e.body_text(), "INVALID_UPLOAD")
        })?;

        files.push(UploadedFile {
            name,
            media_type,
            data,
        });
    }

    let submitted = files.len();
    let added = state.store.add(files);
    metrics::counter!("enhancer_images_uploaded_total").increment(added.len() as u64);

    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            skipped: submitted - added.len(),
            images: added.iter().map(ImageResponse::from).collect(),
        }),
    ))
}

/// List all images in upload order
async fn list_images(State(state): State<AppState>) -> Json<ImageListResponse> {
    let images: Vec<ImageResponse> = state.store.list().iter().map(ImageResponse::from).collect();
    Json(ImageListResponse {
        total_count: images.len(),
        images,
    })
}

/// Get single image metadata
async fn get_image(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ImageResponse>, ApiError> {
    let record = state.store.get(&id).ok_or_else(not_found)?;
    Ok(Json(ImageResponse::from(&record)))
}

/// Original image bytes, for side-by-side comparison
async fn get_original(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let record = state.store.get(&id).ok_or_else(not_found)?;
    Ok((
        [(header::CONTENT_TYPE, record.source.media_type.clone())],
        record.source.data,
    )
        .into_response())
}

/// Enhance one image and wait for the result
#[instrument(skip(state))]
async fn enhance_image(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ImageResponse>, ApiError> {
    let record = state.orchestrator.enhance_one(&id).await.map_err(|e| match e {
        BatchError::Transition(TransitionError::NotFound(_)) => not_found(),
        BatchError::Transition(TransitionError::Invalid { .. }) => api_error(
            StatusCode::CONFLICT,
            "Image is already being enhanced",
            "ALREADY_ENHANCING",
        ),
        BatchError::AlreadyRunning => api_error(
            StatusCode::CONFLICT,
            "A batch is already running",
            "BATCH_RUNNING",
        ),
    })?;

    Ok(Json(ImageResponse::from(&record)))
}

/// Download one enhanced image
async fn download_image(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let record = state.store.get(&id).ok_or_else(not_found)?;
    let image = record.enhanced().ok_or_else(|| {
        api_error(
            StatusCode::CONFLICT,
            format!("Image is {}, not enhanced", record.status.kind()),
            "NOT_ENHANCED",
        )
    })?;

    let file_name = entry_name(&record.name, &record.source.media_type);
    Ok(attachment(&image.media_type, &file_name, image.data.clone()))
}

/// Start enhancing every idle image in the background
async fn start_batch(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<BatchProgress>), ApiError> {
    let run = state.orchestrator.start().map_err(|e| {
        api_error(StatusCode::CONFLICT, e.to_string(), "BATCH_RUNNING")
    })?;

    info!(total = run.snapshot().len(), "Batch accepted");
    tokio::spawn(run.run());

    Ok((StatusCode::ACCEPTED, Json(state.orchestrator.progress())))
}

/// Current batch progress
async fn batch_progress(State(state): State<AppState>) -> Json<BatchProgress> {
    Json(state.orchestrator.progress())
}

/// Stop the running batch before its next image
async fn cancel_batch(State(state): State<AppState>) -> Json<CancelResponse> {
    Json(CancelResponse {
        cancelled: state.orchestrator.cancel(),
    })
}

/// Build and download the archive of all enhanced images
#[instrument(skip(state))]
async fn download_archive(State(state): State<AppState>) -> Result<Response, ApiError> {
    match state.archive.build(state.store.successful()).await {
        Ok(Some(archive)) => Ok(attachment("application/zip", &archive.file_name, archive.data)),
        Ok(None) => Ok(StatusCode::NO_CONTENT.into_response()),
        Err(ArchiveError::InProgress) => Err(api_error(
            StatusCode::CONFLICT,
            "An archive is already being built",
            "ARCHIVE_IN_PROGRESS",
        )),
        Err(e) => {
            error!(error = %e, "Failed to build archive");
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "ARCHIVE_ERROR",
            ))
        }
    }
}

/// Archive assembler state
async fn archive_status(State(state): State<AppState>) -> Json<ArchiveStatus> {
    Json(state.archive.status())
}

/// Binary response offered as a file download
fn attachment(content_type: &str, file_name: &str, body: bytes::Bytes) -> Response {
    let disposition = format!("attachment; filename=\"{}\"", header_safe(file_name));
    (
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response()
}

/// Replace characters that cannot appear in a quoted header value
fn header_safe(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii() && !c.is_ascii_control() => c,
            _ => '_',
        })
        .collect()
}

/// Start the image API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting image API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
