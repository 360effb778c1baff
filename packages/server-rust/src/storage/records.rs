//! Records persisted by the domain services.

use serde::Serialize;
use socialstream_core::EventMessage;
use uuid::Uuid;

/// Credentials to insert for a newly registered user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCredentials {
    pub username: String,
    pub email: String,
    pub password_hash: String,
}

/// Stored credentials. `user_id` is assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user_id: i64,
    pub username: String,
    pub email: String,
    pub password_hash: String,
}

/// Profile fields materialized from a `user.created` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUserProfile {
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub dob: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub dob: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: String,
    pub owner_id: i64,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_id: Option<String>,
    pub created_at_ms: u64,
}

/// Media status written on upload. Later statuses come from `media.compressed`.
pub const MEDIA_STATUS_UPLOADED: &str = "uploaded";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Media {
    pub id: String,
    pub compressed_id: String,
    pub owner_id: i64,
    pub status: String,
}

/// An event waiting in the transactional outbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEvent {
    /// Same as the message id of `message`.
    pub id: Uuid,
    pub message: EventMessage,
    /// Failed publish attempts so far.
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl OutboxEvent {
    #[must_use]
    pub fn pending(message: EventMessage) -> Self {
        Self {
            id: message.message_id,
            message,
            attempts: 0,
            last_error: None,
        }
    }
}
