use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sg_core::metrics;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::error::ArchiveError;
use crate::model::{Archive, ArchiveFilter, Page, SortDirection, SortField};
use crate::service::ArchiveService;
use crate::SERVICE_NAME;

const DEFAULT_PAGE_SIZE: u32 = 20;
const MAX_PAGE_SIZE: u32 = 1000;

#[derive(Clone)]
pub struct AppState {
    pub service: ArchiveService,
}

#[derive(Serialize)]
struct ErrorResponse {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

#[derive(Debug)]
pub(crate) struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<Value>,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
        }
    }

    fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl From<ArchiveError> for ApiError {
    fn from(err: ArchiveError) -> Self {
        match &err {
            ArchiveError::InconsistentSet { expected, actual } => {
                ApiError::new(StatusCode::CONFLICT, "INCONSISTENT_SET", err.to_string())
                    .with_details(json!({ "expected": expected, "actual": actual }))
            }
            ArchiveError::NotFound(_) => {
                ApiError::new(StatusCode::NOT_FOUND, "NOT_FOUND", err.to_string())
            }
            ArchiveError::IndexUpdating {
                last_updated_millis,
            } => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "INDEX_UPDATING",
                err.to_string(),
            )
            .with_details(json!({ "last_updated_millis": last_updated_millis })),
            _ => {
                tracing::error!(error = %err, "archive request failed");
                ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    err.to_string(),
                )
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let payload = ErrorResponse {
            code: self.code,
            message: self.message,
            details: self.details,
        };
        (self.status, Json(payload)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
struct HealthStatus {
    status: String,
}

#[derive(Deserialize, Default)]
pub(crate) struct ListQuery {
    status: Option<String>,
    #[serde(rename = "type")]
    archive_type: Option<String>,
    created_after: Option<i64>,
    created_before: Option<i64>,
    page: Option<u32>,
    size: Option<u32>,
    sort_field: Option<SortField>,
    sort_direction: Option<SortDirection>,
}

impl ListQuery {
    fn into_filter(self) -> ApiResult<ArchiveFilter> {
        let bad_request =
            |message: String| ApiError::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message);
        let status = self
            .status
            .map(|value| value.parse())
            .transpose()
            .map_err(bad_request)?;
        let archive_type = self
            .archive_type
            .map(|value| value.parse())
            .transpose()
            .map_err(bad_request)?;
        Ok(ArchiveFilter {
            status,
            archive_type,
            created_after: self.created_after,
            created_before: self.created_before,
            page: self.page.unwrap_or(0),
            size: self.size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
            sort_field: self.sort_field.unwrap_or_default(),
            sort_direction: self.sort_direction.unwrap_or_default(),
        })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_endpoint))
        .route("/archives", get(list_archives))
        .route("/archives/all", post(request_all_archive))
        .route("/archives/all/latest", get(latest_all_archive))
        .route("/archives/set/:set_id", post(get_or_create_set_archive))
        .route("/archives/:id", get(get_completed_archive))
        .route("/download/archive/:id", get(download_archive))
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    match state.service.check_ready().await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthStatus {
                status: "ok".into(),
            }),
        ),
        Err(err) => {
            tracing::warn!(error = %err, "readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthStatus {
                    status: "unavailable".into(),
                }),
            )
        }
    }
}

async fn metrics_endpoint() -> impl IntoResponse {
    metrics::metrics_response(SERVICE_NAME)
}

async fn list_archives(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Page<Archive>>> {
    let filter = query.into_filter()?;
    Ok(Json(state.service.list_archives(&filter).await?))
}

async fn get_or_create_set_archive(
    State(state): State<AppState>,
    Path(set_id): Path<Uuid>,
) -> ApiResult<Json<Archive>> {
    Ok(Json(state.service.get_or_create_set_archive(set_id).await?))
}

async fn request_all_archive(State(state): State<AppState>) -> ApiResult<Json<Archive>> {
    Ok(Json(state.service.request_all_archive().await?))
}

async fn latest_all_archive(State(state): State<AppState>) -> ApiResult<Json<Archive>> {
    Ok(Json(state.service.latest_all_archive().await?))
}

async fn get_completed_archive(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Archive>> {
    Ok(Json(state.service.get_completed_archive(id).await?))
}

async fn download_archive(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    let (archive, path) = state.service.open_download(id).await?;
    let file = tokio::fs::File::open(&path).await.map_err(|err| {
        tracing::error!(archive_id = %id, error = %err, "failed to open artifact");
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "ARTIFACT_UNREADABLE",
            "archive artifact could not be read",
        )
    })?;
    let filename = archive.object_id.unwrap_or_else(|| crate::model::archive_filename(id));
    let headers = [
        (header::CONTENT_TYPE, "application/octet-stream".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        ),
    ];
    Ok((headers, Body::from_stream(ReaderStream::new(file))).into_response())
}
