//! Posts.

use std::sync::Arc;

use serde::Deserialize;
use socialstream_core::{now_millis, EventMessage, PostCreated};
use tracing::info;
use uuid::Uuid;

use super::require;
use crate::service::config::ServiceConfig;
use crate::service::executor::BoundedExecutor;
use crate::service::operation::ServiceError;
use crate::storage::{Post, PostStore};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePostRequest {
    pub body: String,
    #[serde(default)]
    pub media_id: Option<String>,
}

pub struct PostService {
    store: Arc<dyn PostStore>,
    executor: BoundedExecutor,
    config: Arc<ServiceConfig>,
}

impl PostService {
    #[must_use]
    pub fn new(
        store: Arc<dyn PostStore>,
        executor: BoundedExecutor,
        config: Arc<ServiceConfig>,
    ) -> Self {
        Self {
            store,
            executor,
            config,
        }
    }

    /// Stores a post and queues `post.created`.
    ///
    /// # Errors
    ///
    /// - [`ServiceError::Validation`] if the body is blank
    /// - [`ServiceError::DeadlineExceeded`] if the insert times out
    pub async fn create_post(
        &self,
        owner_id: i64,
        request: CreatePostRequest,
        correlation_id: Option<&str>,
    ) -> Result<Post, ServiceError> {
        require("body", &request.body)?;

        let post = Post {
            id: Uuid::new_v4().to_string(),
            owner_id,
            body: request.body,
            media_id: request.media_id.filter(|id| !id.trim().is_empty()),
            created_at_ms: now_millis(),
        };
        let event = PostCreated {
            post_id: post.id.clone(),
            owner_id,
            body: post.body.clone(),
            media_id: post.media_id.clone(),
        };
        let mut message =
            EventMessage::from_payload(&event, self.config.content_type)?.with_source("post");
        if let Some(id) = correlation_id {
            message = message.with_correlation_id(id);
        }

        let store = Arc::clone(&self.store);
        let stored = post.clone();
        self.executor
            .execute("post.insert_post", self.config.store_deadline, move |_| async move {
                store.insert_post(stored, vec![message]).await
            })
            .await
            .into_result()?;

        info!(post_id = %post.id, owner_id, "post created");
        Ok(post)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, OutboxStore};

    fn service(store: Arc<MemoryStore>) -> PostService {
        PostService::new(store, BoundedExecutor::new(8), Arc::new(ServiceConfig::default()))
    }

    #[tokio::test]
    async fn create_post_stores_row_and_event() {
        let store = Arc::new(MemoryStore::new());
        let posts = service(store.clone());

        let post = posts
            .create_post(
                7,
                CreatePostRequest {
                    body: "hello".to_string(),
                    media_id: Some("m-1".to_string()),
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(store.post_by_id(&post.id).await.unwrap(), Some(post.clone()));

        let pending = store.pending_events(10, 5).await.unwrap();
        assert_eq!(pending.len(), 1);
        let event: PostCreated = pending[0].message.decode().unwrap();
        assert_eq!(event.post_id, post.id);
        assert_eq!(event.owner_id, 7);
        assert_eq!(event.media_id.as_deref(), Some("m-1"));
        assert_eq!(pending[0].message.source.as_deref(), Some("post"));
    }

    #[tokio::test]
    async fn blank_body_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let err = service(store.clone())
            .create_post(
                7,
                CreatePostRequest {
                    body: " ".to_string(),
                    media_id: None,
                },
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
        assert_eq!(store.outbox_len(), 0);
    }
}
