//! `GET /api/v1/users/{username}`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};

use crate::service::{ServiceError, UserService};
use crate::storage::UserProfile;

pub fn routes<S>(service: Arc<UserService>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/api/v1/users/{username}", get(profile_handler))
        .with_state(service)
}

pub async fn profile_handler(
    State(users): State<Arc<UserService>>,
    Path(username): Path<String>,
) -> Result<Json<UserProfile>, ServiceError> {
    Ok(Json(users.get_profile(&username).await?))
}
