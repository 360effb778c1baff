//! `POST /api/v1/auth/register` and `POST /api/v1/auth/login`.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;

use super::request_id;
use crate::service::domain::{LoginRequest, RegisterRequest};
use crate::service::{AuthService, ServiceError};

pub fn routes<S>(service: Arc<AuthService>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/api/v1/auth/register", post(register_handler))
        .route("/api/v1/auth/login", post(login_handler))
        .with_state(service)
}

/// Returns 201 with the new user id.
pub async fn register_handler(
    State(auth): State<Arc<AuthService>>,
    headers: HeaderMap,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ServiceError> {
    let user_id = auth.register(request, request_id(&headers)).await?;
    Ok((StatusCode::CREATED, Json(json!({ "userId": user_id }))))
}

/// Returns the user id as the response body.
pub async fn login_handler(
    State(auth): State<Arc<AuthService>>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<i64>, ServiceError> {
    Ok(Json(auth.login(request).await?))
}
