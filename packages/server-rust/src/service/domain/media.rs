//! Media uploads and their compression status.
//!
//! Compression itself happens outside this process. The service registers an
//! upload, announces it with `media.uploaded`, and records the result when a
//! `media.compressed` event comes back.

use std::sync::Arc;

use socialstream_core::{EventMessage, MediaCompressed, MediaUploaded};
use tracing::info;
use uuid::Uuid;

use crate::broker::{HandlerError, RoutingTable};
use crate::service::config::ServiceConfig;
use crate::service::executor::BoundedExecutor;
use crate::service::operation::ServiceError;
use crate::storage::{Media, MediaStore, MEDIA_STATUS_UPLOADED};

pub struct MediaService {
    store: Arc<dyn MediaStore>,
    executor: BoundedExecutor,
    config: Arc<ServiceConfig>,
}

impl MediaService {
    #[must_use]
    pub fn new(
        store: Arc<dyn MediaStore>,
        executor: BoundedExecutor,
        config: Arc<ServiceConfig>,
    ) -> Self {
        Self {
            store,
            executor,
            config,
        }
    }

    /// Creates a media row with status `uploaded` and queues `media.uploaded`.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::DeadlineExceeded`] if the insert times out.
    pub async fn register_upload(
        &self,
        owner_id: i64,
        correlation_id: Option<&str>,
    ) -> Result<Media, ServiceError> {
        let media = Media {
            id: Uuid::new_v4().to_string(),
            compressed_id: Uuid::new_v4().to_string(),
            owner_id,
            status: MEDIA_STATUS_UPLOADED.to_string(),
        };
        let event = MediaUploaded {
            id: media.id.clone(),
            compressed_id: media.compressed_id.clone(),
        };
        let mut message =
            EventMessage::from_payload(&event, self.config.content_type)?.with_source("media");
        if let Some(id) = correlation_id {
            message = message.with_correlation_id(id);
        }

        let store = Arc::clone(&self.store);
        let stored = media.clone();
        self.executor
            .execute("media.insert_media", self.config.store_deadline, move |_| async move {
                store.insert_media(stored, vec![message]).await
            })
            .await
            .into_result()?;

        info!(media_id = %media.id, owner_id, "upload registered");
        Ok(media)
    }

    /// Records the outcome reported by the compressor.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NotFound`] if the media id is unknown.
    pub async fn mark_compressed(&self, event: MediaCompressed) -> Result<Media, ServiceError> {
        let store = Arc::clone(&self.store);
        let media = self
            .executor
            .execute("media.update_status", self.config.store_deadline, move |_| async move {
                store
                    .update_media_status(&event.id, &event.compressed_id, &event.status)
                    .await
            })
            .await
            .into_result()?;
        info!(media_id = %media.id, status = %media.status, "media status updated");
        Ok(media)
    }

    /// # Errors
    ///
    /// Returns [`ServiceError::NotFound`] if the media id is unknown.
    pub async fn get_media(&self, id: &str) -> Result<Media, ServiceError> {
        let store = Arc::clone(&self.store);
        let key = id.to_string();
        self.executor
            .execute("media.media_by_id", self.config.store_deadline, move |_| async move {
                store.media_by_id(&key).await
            })
            .await
            .into_result()?
            .ok_or_else(|| ServiceError::NotFound(format!("media {id}")))
    }

    /// Handlers for the media consumer. `media.uploaded` is left to the
    /// default handler since this service publishes it.
    #[must_use]
    pub fn routing_table(self: &Arc<Self>) -> RoutingTable {
        let service = Arc::clone(self);
        RoutingTable::builder()
            .on::<MediaCompressed, _, _>(move |event| {
                let service = Arc::clone(&service);
                async move {
                    service
                        .mark_compressed(event)
                        .await
                        .map(|_| ())
                        .map_err(HandlerError::from)
                }
            })
            .build()
    }
}

#[cfg(test)]
mod tests {
    use socialstream_core::ContentType;

    use super::*;
    use crate::storage::{MemoryStore, OutboxStore};

    fn service(store: Arc<MemoryStore>) -> Arc<MediaService> {
        Arc::new(MediaService::new(
            store,
            BoundedExecutor::new(8),
            Arc::new(ServiceConfig::default()),
        ))
    }

    #[tokio::test]
    async fn register_upload_queues_media_uploaded() {
        let store = Arc::new(MemoryStore::new());
        let media = service(store.clone());

        let row = media.register_upload(3, Some("req-9")).await.unwrap();
        assert_eq!(row.status, MEDIA_STATUS_UPLOADED);
        assert_ne!(row.id, row.compressed_id);
        assert_eq!(media.get_media(&row.id).await.unwrap(), row);

        let pending = store.pending_events(10, 5).await.unwrap();
        let event: MediaUploaded = pending[0].message.decode().unwrap();
        assert_eq!(event.id, row.id);
        assert_eq!(event.compressed_id, row.compressed_id);
        assert_eq!(pending[0].message.correlation_id.as_deref(), Some("req-9"));
    }

    #[tokio::test]
    async fn media_compressed_updates_status_through_routing_table() {
        let media = service(Arc::new(MemoryStore::new()));
        let row = media.register_upload(3, None).await.unwrap();

        let compressed = MediaCompressed {
            id: row.id.clone(),
            compressed_id: format!("{}-small", row.id),
            status: "compressed".to_string(),
        };
        let message = EventMessage::from_payload(&compressed, ContentType::Json).unwrap();
        let table = media.routing_table();
        let (handler, matched) = table.resolve(&message.routing_key);
        assert!(matched);
        handler.handle(&message).await.unwrap();

        let updated = media.get_media(&row.id).await.unwrap();
        assert_eq!(updated.status, "compressed");
        assert_eq!(updated.compressed_id, compressed.compressed_id);
    }

    #[tokio::test]
    async fn compressed_event_for_unknown_media_is_rejected() {
        let media = service(Arc::new(MemoryStore::new()));
        let message = EventMessage::from_payload(
            &MediaCompressed {
                id: "missing".to_string(),
                compressed_id: "c".to_string(),
                status: "compressed".to_string(),
            },
            ContentType::Json,
        )
        .unwrap();

        let table = media.routing_table();
        let (handler, _) = table.resolve(&message.routing_key);
        assert!(matches!(
            handler.handle(&message).await,
            Err(HandlerError::Rejected(_))
        ));
    }
}
