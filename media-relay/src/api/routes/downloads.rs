//! Download routes: streamed start/resume, status, pause and delete.

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use media_types::OutputKind;
use serde::Deserialize;

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::download::{DownloadStream, QualitySelector, StartRequest, StatusView};
use crate::utils::filename::content_disposition;

pub const DOWNLOAD_ID_HEADER: HeaderName = HeaderName::from_static("x-download-id");
pub const RESUMED_FROM_HEADER: HeaderName = HeaderName::from_static("x-resumed-from");

/// Query of `GET /api/downloads/stream`.
#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub resource: String,
    /// `audio` (default) or `video`.
    pub kind: Option<String>,
    /// `highest` (default) or a label such as `720p`.
    pub quality: Option<String>,
    /// Id from an earlier response, to resume it.
    pub id: Option<String>,
}

impl StreamQuery {
    fn into_request(self) -> ApiResult<StartRequest> {
        let kind = match self.kind.as_deref() {
            None | Some("") => OutputKind::Audio,
            Some(kind) => kind
                .parse::<OutputKind>()
                .map_err(|e| ApiError::invalid_resource(e.to_string()))?,
        };
        Ok(StartRequest {
            resource_ref: self.resource,
            kind,
            quality: QualitySelector::new(self.quality.unwrap_or_default()),
            existing_id: self.id.filter(|id| !id.is_empty()),
        })
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_recent))
        .route("/stream", get(stream_download))
        .route("/{id}", get(get_status).delete(delete_download))
        .route("/{id}/pause", post(pause_download))
        .route("/{id}/resume", get(resume_download))
}

async fn list_recent(State(state): State<AppState>) -> ApiResult<Json<Vec<StatusView>>> {
    Ok(Json(state.downloads.recent().await?))
}

async fn stream_download(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> ApiResult<Response> {
    let request = query.into_request()?;
    let stream = state.downloads.start_or_resume(request).await?;
    stream_response(stream)
}

async fn get_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<StatusView>> {
    Ok(Json(state.downloads.status(&id).await?))
}

async fn pause_download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<StatusView>> {
    Ok(Json(state.downloads.pause(&id).await?))
}

async fn resume_download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let stream = state.downloads.resume(&id).await?;
    stream_response(stream)
}

async fn delete_download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.downloads.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Turn a download stream into a streamed response.
///
/// Headers go out before the body, so failures after this point terminate
/// the connection instead of producing an error status.
fn stream_response(stream: DownloadStream) -> ApiResult<Response> {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, header_value(&stream.content_type)?);
    headers.insert(
        header::CONTENT_DISPOSITION,
        header_value(&content_disposition(&stream.filename))?,
    );
    headers.insert(DOWNLOAD_ID_HEADER, header_value(&stream.id)?);
    headers.insert(RESUMED_FROM_HEADER, HeaderValue::from(stream.resumed_from));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    if let Some(total) = stream.total_size {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(total));
    }

    Ok((StatusCode::OK, headers, Body::from_stream(stream.body)).into_response())
}

fn header_value(value: &str) -> ApiResult<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| ApiError::internal(format!("Invalid header value: {e}")))
}
