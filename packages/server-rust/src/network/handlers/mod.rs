//! HTTP handler definitions.
//!
//! This module defines `AppState` (the shared state carried through axum
//! extractors), the mapping from [`ServiceError`] to HTTP responses, and
//! the per-service route sets mounted for the roles hosted by the process.

pub mod auth;
pub mod health;
pub mod media;
pub mod posts;
pub mod users;

pub use health::{health_handler, liveness_handler, readiness_handler};

use std::sync::Arc;
use std::time::Instant;

use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use super::middleware::REQUEST_ID_HEADER;
use super::ShutdownController;
use crate::service::{ConsumerService, DomainServices, ErrorKind, ServiceError};

/// Header naming the authenticated caller for post and media routes.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Seconds a client should wait after a deadline-exceeded response.
const RETRY_AFTER_SECS: &str = "1";

/// Shared application state passed to all axum handlers via `State` extraction.
///
/// Holds `Arc` references to shared resources so cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    /// Domain services hosted by this process.
    pub services: DomainServices,
    /// Event consumers whose state gates readiness.
    pub consumers: Vec<Arc<ConsumerService>>,
    /// Graceful shutdown controller with health state and in-flight tracking.
    pub shutdown: Arc<ShutdownController>,
    /// Server process start time, used for uptime calculation.
    pub start_time: Instant,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let status = match kind {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::DeadlineExceeded => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = if kind == ErrorKind::Internal {
            error!(error = %self, "request failed");
            "internal error".to_string()
        } else {
            self.to_string()
        };

        let body = Json(json!({
            "error": message,
            "kind": kind.as_str(),
            "status": status.as_u16(),
        }));

        let mut response = (status, body).into_response();
        if kind == ErrorKind::DeadlineExceeded {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECS));
        }
        response
    }
}

/// The request id set by the middleware stack, used as event correlation id.
pub(crate) fn request_id(headers: &HeaderMap) -> Option<&str> {
    headers.get(REQUEST_ID_HEADER)?.to_str().ok()
}

/// Parses the caller's user id.
///
/// # Errors
///
/// Returns [`ServiceError::Unauthorized`] if the header is missing or not an integer.
pub(crate) fn caller_id(headers: &HeaderMap) -> Result<i64, ServiceError> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
        .ok_or(ServiceError::Unauthorized)
}
