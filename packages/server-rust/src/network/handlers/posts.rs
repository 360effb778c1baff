//! `POST /api/v1/posts`.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};

use super::{caller_id, request_id};
use crate::service::domain::CreatePostRequest;
use crate::service::{PostService, ServiceError};
use crate::storage::Post;

pub fn routes<S>(service: Arc<PostService>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/api/v1/posts", post(create_post_handler))
        .with_state(service)
}

pub async fn create_post_handler(
    State(posts): State<Arc<PostService>>,
    headers: HeaderMap,
    Json(request): Json<CreatePostRequest>,
) -> Result<(StatusCode, Json<Post>), ServiceError> {
    let owner_id = caller_id(&headers)?;
    let post = posts
        .create_post(owner_id, request, request_id(&headers))
        .await?;
    Ok((StatusCode::CREATED, Json(post)))
}
