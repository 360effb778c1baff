//! In-memory store implementing every store trait.
//!
//! All tables live behind one mutex so that a record and its outbox events
//! are written atomically, matching the transaction boundary of the SQL
//! backend. Suitable for development, tests, and the single-process `all`
//! role.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use socialstream_core::EventMessage;
use uuid::Uuid;

use super::records::{
    Credentials, Media, NewCredentials, NewUserProfile, OutboxEvent, Post, UserProfile,
};
use super::store::{CredentialStore, MediaStore, OutboxStore, PostStore, StoreError, UserStore};

#[derive(Default)]
struct Tables {
    next_id: i64,
    credentials: HashMap<i64, Credentials>,
    profiles: HashMap<String, UserProfile>,
    posts: HashMap<String, Post>,
    media: HashMap<String, Media>,
    outbox: VecDeque<OutboxEvent>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn enqueue(&mut self, events: Vec<EventMessage>) {
        self.outbox.extend(events.into_iter().map(OutboxEvent::pending));
    }
}

/// Single-process store. Ids are assigned from one counter per store.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of outbox events not yet published, regardless of attempts.
    #[must_use]
    pub fn outbox_len(&self) -> usize {
        self.tables.lock().outbox.len()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn insert_credentials(
        &self,
        credentials: NewCredentials,
        events: Vec<EventMessage>,
    ) -> Result<Credentials, StoreError> {
        let mut tables = self.tables.lock();
        for existing in tables.credentials.values() {
            if existing.username == credentials.username {
                return Err(StoreError::Conflict(format!(
                    "username {}",
                    credentials.username
                )));
            }
            if existing.email == credentials.email {
                return Err(StoreError::Conflict(format!("email {}", credentials.email)));
            }
        }
        let stored = Credentials {
            user_id: tables.next_id(),
            username: credentials.username,
            email: credentials.email,
            password_hash: credentials.password_hash,
        };
        tables.credentials.insert(stored.user_id, stored.clone());
        tables.enqueue(events);
        Ok(stored)
    }

    async fn credentials_by_email(&self, email: &str) -> Result<Option<Credentials>, StoreError> {
        Ok(self
            .tables
            .lock()
            .credentials
            .values()
            .find(|c| c.email == email)
            .cloned())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn insert_profile(&self, profile: NewUserProfile) -> Result<UserProfile, StoreError> {
        let mut tables = self.tables.lock();
        if tables.profiles.contains_key(&profile.username) {
            return Err(StoreError::Conflict(format!("username {}", profile.username)));
        }
        let stored = UserProfile {
            id: tables.next_id(),
            username: profile.username,
            email: profile.email,
            first_name: profile.first_name,
            last_name: profile.last_name,
            dob: profile.dob,
        };
        tables.profiles.insert(stored.username.clone(), stored.clone());
        Ok(stored)
    }

    async fn profile_by_username(
        &self,
        username: &str,
    ) -> Result<Option<UserProfile>, StoreError> {
        Ok(self.tables.lock().profiles.get(username).cloned())
    }
}

#[async_trait]
impl PostStore for MemoryStore {
    async fn insert_post(&self, post: Post, events: Vec<EventMessage>) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        if tables.posts.contains_key(&post.id) {
            return Err(StoreError::Conflict(format!("post {}", post.id)));
        }
        tables.posts.insert(post.id.clone(), post);
        tables.enqueue(events);
        Ok(())
    }

    async fn post_by_id(&self, id: &str) -> Result<Option<Post>, StoreError> {
        Ok(self.tables.lock().posts.get(id).cloned())
    }
}

#[async_trait]
impl MediaStore for MemoryStore {
    async fn insert_media(
        &self,
        media: Media,
        events: Vec<EventMessage>,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        if tables.media.contains_key(&media.id) {
            return Err(StoreError::Conflict(format!("media {}", media.id)));
        }
        tables.media.insert(media.id.clone(), media);
        tables.enqueue(events);
        Ok(())
    }

    async fn media_by_id(&self, id: &str) -> Result<Option<Media>, StoreError> {
        Ok(self.tables.lock().media.get(id).cloned())
    }

    async fn update_media_status(
        &self,
        id: &str,
        compressed_id: &str,
        status: &str,
    ) -> Result<Media, StoreError> {
        let mut tables = self.tables.lock();
        let media = tables
            .media
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("media {id}")))?;
        media.compressed_id = compressed_id.to_string();
        media.status = status.to_string();
        Ok(media.clone())
    }
}

#[async_trait]
impl OutboxStore for MemoryStore {
    async fn pending_events(
        &self,
        limit: usize,
        max_attempts: u32,
    ) -> Result<Vec<OutboxEvent>, StoreError> {
        Ok(self
            .tables
            .lock()
            .outbox
            .iter()
            .filter(|e| e.attempts < max_attempts)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_published(&self, id: Uuid) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        let position = tables
            .outbox
            .iter()
            .position(|e| e.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("outbox event {id}")))?;
        tables.outbox.remove(position);
        Ok(())
    }

    async fn record_failure(&self, id: Uuid, error: &str) -> Result<u32, StoreError> {
        let mut tables = self.tables.lock();
        let event = tables
            .outbox
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("outbox event {id}")))?;
        event.attempts += 1;
        event.last_error = Some(error.to_string());
        Ok(event.attempts)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use socialstream_core::{ContentType, EventMessage, UserCreated};

    use super::*;

    fn credentials(username: &str, email: &str) -> NewCredentials {
        NewCredentials {
            username: username.to_string(),
            email: email.to_string(),
            password_hash: "hash".to_string(),
        }
    }

    fn user_created(username: &str) -> EventMessage {
        EventMessage::from_payload(
            &UserCreated {
                username: username.to_string(),
                email: format!("{username}@example.com"),
                first_name: "F".to_string(),
                last_name: "L".to_string(),
                dob: "2000-01-01".to_string(),
            },
            ContentType::Json,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn insert_credentials_writes_record_and_outbox_together() {
        let store = MemoryStore::new();
        let stored = store
            .insert_credentials(credentials("alice", "a@x"), vec![user_created("alice")])
            .await
            .unwrap();
        assert_eq!(stored.user_id, 1);
        assert_eq!(store.outbox_len(), 1);

        let found = store.credentials_by_email("a@x").await.unwrap().unwrap();
        assert_eq!(found.username, "alice");
    }

    #[tokio::test]
    async fn conflicting_insert_writes_nothing() {
        let store = MemoryStore::new();
        store
            .insert_credentials(credentials("alice", "a@x"), vec![user_created("alice")])
            .await
            .unwrap();

        let err = store
            .insert_credentials(credentials("alice", "other@x"), vec![user_created("alice")])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(what) if what == "username alice"));

        let err = store
            .insert_credentials(credentials("bob", "a@x"), vec![user_created("bob")])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(what) if what == "email a@x"));

        assert_eq!(store.outbox_len(), 1);
    }

    #[tokio::test]
    async fn outbox_is_fifo_and_skips_exhausted_events() {
        let store = MemoryStore::new();
        let first = user_created("a");
        let second = user_created("b");
        let (first_id, second_id) = (first.message_id, second.message_id);
        store
            .insert_credentials(credentials("a", "a@x"), vec![first, second])
            .await
            .unwrap();

        let pending = store.pending_events(10, 3).await.unwrap();
        assert_eq!(
            pending.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![first_id, second_id]
        );

        for _ in 0..3 {
            store.record_failure(first_id, "broker down").await.unwrap();
        }
        let pending = store.pending_events(10, 3).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second_id);

        store.mark_published(second_id).await.unwrap();
        assert!(store.pending_events(10, 3).await.unwrap().is_empty());
        assert!(matches!(
            store.mark_published(second_id).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_profile_is_a_conflict() {
        let store = MemoryStore::new();
        let profile = NewUserProfile {
            username: "alice".to_string(),
            email: "a@x".to_string(),
            first_name: "A".to_string(),
            last_name: "L".to_string(),
            dob: "1990-01-01".to_string(),
        };
        store.insert_profile(profile.clone()).await.unwrap();
        assert!(matches!(
            store.insert_profile(profile).await,
            Err(StoreError::Conflict(_))
        ));
        assert!(store.profile_by_username("alice").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn update_media_status_requires_existing_row() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.update_media_status("m1", "c1", "compressed").await,
            Err(StoreError::NotFound(_))
        ));

        store
            .insert_media(
                Media {
                    id: "m1".to_string(),
                    compressed_id: "c1".to_string(),
                    owner_id: 1,
                    status: "uploaded".to_string(),
                },
                Vec::new(),
            )
            .await
            .unwrap();
        let updated = store
            .update_media_status("m1", "c1", "compressed")
            .await
            .unwrap();
        assert_eq!(updated.status, "compressed");
    }
}
