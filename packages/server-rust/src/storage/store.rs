//! Store traits, one per service, plus the shared outbox.

use async_trait::async_trait;
use socialstream_core::EventMessage;
use uuid::Uuid;

use super::records::{
    Credentials, Media, NewCredentials, NewUserProfile, OutboxEvent, Post, UserProfile,
};

/// Errors returned by store calls.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A uniqueness constraint was violated. Carries a description of the
    /// conflicting value, e.g. `"username alice"`.
    #[error("{0} already exists")]
    Conflict(String),
    #[error("{0} not found")]
    NotFound(String),
    /// The backend failed (connection loss, query error, ...).
    #[error("store backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Credentials owned by the auth service.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Inserts credentials and queues `events` in the same transaction.
    ///
    /// Fails with [`StoreError::Conflict`] if the username or email is taken.
    async fn insert_credentials(
        &self,
        credentials: NewCredentials,
        events: Vec<EventMessage>,
    ) -> Result<Credentials, StoreError>;

    async fn credentials_by_email(&self, email: &str) -> Result<Option<Credentials>, StoreError>;
}

/// Profiles owned by the user service.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Fails with [`StoreError::Conflict`] if the username already has a profile.
    async fn insert_profile(&self, profile: NewUserProfile) -> Result<UserProfile, StoreError>;

    async fn profile_by_username(&self, username: &str)
        -> Result<Option<UserProfile>, StoreError>;
}

/// Posts owned by the post service.
#[async_trait]
pub trait PostStore: Send + Sync {
    async fn insert_post(&self, post: Post, events: Vec<EventMessage>) -> Result<(), StoreError>;

    async fn post_by_id(&self, id: &str) -> Result<Option<Post>, StoreError>;
}

/// Media rows owned by the media service.
#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn insert_media(&self, media: Media, events: Vec<EventMessage>)
        -> Result<(), StoreError>;

    async fn media_by_id(&self, id: &str) -> Result<Option<Media>, StoreError>;

    /// Sets the compressed id and status of an existing row.
    ///
    /// Fails with [`StoreError::NotFound`] if `id` does not exist.
    async fn update_media_status(
        &self,
        id: &str,
        compressed_id: &str,
        status: &str,
    ) -> Result<Media, StoreError>;
}

/// The transactional outbox read by the relay.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Unpublished events with fewer than `max_attempts` failed attempts,
    /// oldest first.
    async fn pending_events(
        &self,
        limit: usize,
        max_attempts: u32,
    ) -> Result<Vec<OutboxEvent>, StoreError>;

    async fn mark_published(&self, id: Uuid) -> Result<(), StoreError>;

    /// Records a failed publish attempt and returns the new attempt count.
    async fn record_failure(&self, id: Uuid, error: &str) -> Result<u32, StoreError>;
}

/// A backend implementing every store trait.
///
/// Used to hand one backend to several services as separate trait objects.
pub trait Backend:
    CredentialStore + UserStore + PostStore + MediaStore + OutboxStore + 'static
{
}

impl<T> Backend for T where
    T: CredentialStore + UserStore + PostStore + MediaStore + OutboxStore + 'static
{
}
