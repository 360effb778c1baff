//! `POST /api/v1/media` and `GET /api/v1/media/{id}`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};

use super::{caller_id, request_id};
use crate::service::{MediaService, ServiceError};
use crate::storage::Media;

pub fn routes<S>(service: Arc<MediaService>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/api/v1/media", post(upload_handler))
        .route("/api/v1/media/{id}", get(media_handler))
        .with_state(service)
}

/// Registers an upload. The file body itself goes to object storage
/// directly; this only records the row and announces it.
pub async fn upload_handler(
    State(media): State<Arc<MediaService>>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<Media>), ServiceError> {
    let owner_id = caller_id(&headers)?;
    let row = media.register_upload(owner_id, request_id(&headers)).await?;
    Ok((StatusCode::CREATED, Json(row)))
}

pub async fn media_handler(
    State(media): State<Arc<MediaService>>,
    Path(id): Path<String>,
) -> Result<Json<Media>, ServiceError> {
    Ok(Json(media.get_media(&id).await?))
}
