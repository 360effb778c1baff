//! Routing table mapping topic patterns to event handlers.
//!
//! Resolution order for a routing key:
//! 1. a handler registered for exactly that key;
//! 2. the first wildcard pattern that matches, in registration order;
//! 3. the default handler.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use socialstream_core::{CodecError, EventMessage, EventPayload, RoutingKey, TopicPattern};
use tracing::debug;

use crate::service::operation::ServiceError;

/// Why a handler did not apply a message.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The payload did not match the handler's schema.
    #[error("malformed payload: {0}")]
    Decode(#[from] CodecError),
    /// A transient failure; the message may succeed if delivered again.
    #[error("transient failure: {0}")]
    Retryable(String),
    /// A permanent failure; redelivery will not help.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl From<ServiceError> for HandlerError {
    fn from(err: ServiceError) -> Self {
        if err.is_retryable() {
            Self::Retryable(err.to_string())
        } else {
            Self::Rejected(err.to_string())
        }
    }
}

/// Applies one event message.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, message: &EventMessage) -> Result<(), HandlerError>;
}

/// Decodes the payload as `E` and passes it to a closure.
pub struct TypedHandler<E, F> {
    apply: F,
    _event: PhantomData<fn() -> E>,
}

/// Wraps `apply` in a handler that decodes `E` first.
pub fn typed<E, F, Fut>(apply: F) -> TypedHandler<E, F>
where
    E: EventPayload,
    F: Fn(E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    TypedHandler {
        apply,
        _event: PhantomData,
    }
}

#[async_trait]
impl<E, F, Fut> EventHandler for TypedHandler<E, F>
where
    E: EventPayload,
    F: Fn(E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: &EventMessage) -> Result<(), HandlerError> {
        let event = message.decode::<E>()?;
        (self.apply)(event).await
    }
}

/// Default handler: logs the unmatched key and consumes the message.
pub struct LogAndDrop;

#[async_trait]
impl EventHandler for LogAndDrop {
    async fn handle(&self, message: &EventMessage) -> Result<(), HandlerError> {
        debug!(
            exchange = %message.exchange,
            routing_key = %message.routing_key,
            message_id = %message.message_id,
            "no handler for routing key, dropping"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RoutingTable
// ---------------------------------------------------------------------------

/// Immutable pattern-to-handler map, built once per adapter.
#[derive(Clone)]
pub struct RoutingTable {
    exact: HashMap<String, Arc<dyn EventHandler>>,
    wildcard: Vec<(TopicPattern, Arc<dyn EventHandler>)>,
    default: Arc<dyn EventHandler>,
}

impl RoutingTable {
    #[must_use]
    pub fn builder() -> RoutingTableBuilder {
        RoutingTableBuilder::default()
    }

    /// A table with no routes: every message goes to [`LogAndDrop`].
    #[must_use]
    pub fn empty() -> Self {
        Self::builder().build()
    }

    /// Returns the handler for `key`, and whether it was matched by a route.
    #[must_use]
    pub fn resolve(&self, key: &RoutingKey) -> (&Arc<dyn EventHandler>, bool) {
        if let Some(handler) = self.exact.get(key.as_str()) {
            return (handler, true);
        }
        self.wildcard
            .iter()
            .find(|(pattern, _)| pattern.matches(key))
            .map_or((&self.default, false), |(_, handler)| (handler, true))
    }

    /// Number of registered routes, excluding the default handler.
    #[must_use]
    pub fn len(&self) -> usize {
        self.exact.len() + self.wildcard.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Builder for [`RoutingTable`].
pub struct RoutingTableBuilder {
    exact: HashMap<String, Arc<dyn EventHandler>>,
    wildcard: Vec<(TopicPattern, Arc<dyn EventHandler>)>,
    default: Arc<dyn EventHandler>,
}

impl Default for RoutingTableBuilder {
    fn default() -> Self {
        Self {
            exact: HashMap::new(),
            wildcard: Vec::new(),
            default: Arc::new(LogAndDrop),
        }
    }
}

impl RoutingTableBuilder {
    /// Routes `pattern` to `handler`. Registering the same exact pattern
    /// twice replaces the earlier handler.
    #[must_use]
    pub fn route(mut self, pattern: TopicPattern, handler: impl EventHandler + 'static) -> Self {
        let handler: Arc<dyn EventHandler> = Arc::new(handler);
        if pattern.is_exact() {
            self.exact.insert(pattern.as_str().to_string(), handler);
        } else {
            self.wildcard.push((pattern, handler));
        }
        self
    }

    /// Routes `E`'s routing key to `apply`, decoding the payload as `E`.
    #[must_use]
    pub fn on<E, F, Fut>(self, apply: F) -> Self
    where
        E: EventPayload,
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let pattern = TopicPattern::exact(&E::routing_key());
        self.route(pattern, typed::<E, _, _>(apply))
    }

    #[must_use]
    pub fn default_handler(mut self, handler: impl EventHandler + 'static) -> Self {
        self.default = Arc::new(handler);
        self
    }

    #[must_use]
    pub fn build(self) -> RoutingTable {
        RoutingTable {
            exact: self.exact,
            wildcard: self.wildcard,
            default: self.default,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use socialstream_core::{ContentType, MediaCompressed, UserCreated};

    use super::*;

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl EventHandler for Counting {
        async fn handle(&self, _message: &EventMessage) -> Result<(), HandlerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn key(raw: &str) -> RoutingKey {
        RoutingKey::new(raw).unwrap()
    }

    fn pattern(raw: &str) -> TopicPattern {
        TopicPattern::new(raw).unwrap()
    }

    fn user_created() -> UserCreated {
        UserCreated {
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
            first_name: "Alice".to_string(),
            last_name: "Liddell".to_string(),
            dob: "1990-01-01".to_string(),
        }
    }

    #[tokio::test]
    async fn user_created_matches_wildcard_and_media_falls_to_default() {
        let user = Arc::new(AtomicUsize::new(0));
        let fallback = Arc::new(AtomicUsize::new(0));
        let table = RoutingTable::builder()
            .route(pattern("user.#"), Counting(Arc::clone(&user)))
            .default_handler(Counting(Arc::clone(&fallback)))
            .build();

        let created = EventMessage::from_payload(&user_created(), ContentType::Json).unwrap();
        let (handler, matched) = table.resolve(&created.routing_key);
        assert!(matched);
        handler.handle(&created).await.unwrap();

        let compressed = EventMessage::from_payload(
            &MediaCompressed {
                id: "m1".to_string(),
                compressed_id: "m1-c".to_string(),
                status: "compressed".to_string(),
            },
            ContentType::Json,
        )
        .unwrap();
        let (handler, matched) = table.resolve(&compressed.routing_key);
        assert!(!matched);
        handler.handle(&compressed).await.unwrap();

        assert_eq!(user.load(Ordering::SeqCst), 1);
        assert_eq!(fallback.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exact_route_wins_over_earlier_wildcard() {
        let wildcard = Arc::new(AtomicUsize::new(0));
        let exact = Arc::new(AtomicUsize::new(0));
        let table = RoutingTable::builder()
            .route(pattern("user.*"), Counting(Arc::clone(&wildcard)))
            .route(pattern("user.created"), Counting(Arc::clone(&exact)))
            .build();

        let message = EventMessage::from_payload(&user_created(), ContentType::Json).unwrap();
        let (handler, _) = table.resolve(&key("user.created"));
        handler.handle(&message).await.unwrap();

        assert_eq!(exact.load(Ordering::SeqCst), 1);
        assert_eq!(wildcard.load(Ordering::SeqCst), 0);
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn first_matching_wildcard_wins() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let table = RoutingTable::builder()
            .route(pattern("media.#"), Counting(Arc::clone(&first)))
            .route(pattern("*.compressed"), Counting(Arc::clone(&second)))
            .build();

        let message = EventMessage::new(
            "media_events",
            key("media.compressed"),
            ContentType::Json,
            b"{}".to_vec(),
        );
        let (handler, _) = table.resolve(&message.routing_key);
        handler.handle(&message).await.unwrap();

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn typed_handler_reports_truncated_json_as_decode_error() {
        let table = RoutingTable::builder()
            .on::<UserCreated, _, _>(|_event| async { Ok(()) })
            .build();

        let mut message = EventMessage::from_payload(&user_created(), ContentType::Json).unwrap();
        message.payload.truncate(message.payload.len() / 2);

        let (handler, matched) = table.resolve(&message.routing_key);
        assert!(matched);
        let err = handler.handle(&message).await.unwrap_err();
        assert!(matches!(err, HandlerError::Decode(_)));
    }

    #[tokio::test]
    async fn typed_handler_passes_decoded_payload() {
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let sink = Arc::clone(&seen);
        let table = RoutingTable::builder()
            .on::<UserCreated, _, _>(move |event| {
                let sink = Arc::clone(&sink);
                async move {
                    *sink.lock() = Some(event);
                    Ok(())
                }
            })
            .build();

        let message = EventMessage::from_payload(&user_created(), ContentType::MsgPack).unwrap();
        let (handler, _) = table.resolve(&message.routing_key);
        handler.handle(&message).await.unwrap();

        assert_eq!(seen.lock().as_ref(), Some(&user_created()));
    }

    #[test]
    fn service_errors_map_to_retry_classes() {
        let timeout: HandlerError = ServiceError::DeadlineExceeded(
            crate::service::operation::DeadlineExceeded {
                operation: "profile.insert",
                deadline: std::time::Duration::from_millis(500),
            },
        )
        .into();
        assert!(matches!(timeout, HandlerError::Retryable(_)));

        let invalid: HandlerError = ServiceError::Validation("username".to_string()).into();
        assert!(matches!(invalid, HandlerError::Rejected(_)));
    }

    #[test]
    fn empty_table_has_no_routes() {
        let table = RoutingTable::empty();
        assert!(table.is_empty());
        assert!(!table.resolve(&key("user.created")).1);
    }
}
