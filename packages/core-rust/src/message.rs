//! The event envelope carried over the broker.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::{CodecError, ContentType};
use crate::events::EventPayload;
use crate::routing::RoutingKey;

/// A published event: routing metadata plus a content-type tagged payload.
///
/// The payload is kept as raw bytes so that consumers can dispatch on the
/// routing key before committing to a schema. Decoding happens in
/// [`EventMessage::decode`] with the schema chosen by the consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMessage {
    /// Unique id assigned at creation; stable across redeliveries.
    pub message_id: Uuid,
    pub exchange: String,
    pub routing_key: RoutingKey,
    pub content_type: ContentType,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    /// Links the event to the request that caused it.
    pub correlation_id: Option<String>,
    /// Name of the publishing service.
    pub source: Option<String>,
    /// Creation time in milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

impl EventMessage {
    /// Builds a message from raw parts with a fresh id and the current time.
    #[must_use]
    pub fn new(
        exchange: impl Into<String>,
        routing_key: RoutingKey,
        content_type: ContentType,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            exchange: exchange.into(),
            routing_key,
            content_type,
            payload,
            correlation_id: None,
            source: None,
            timestamp_ms: now_millis(),
        }
    }

    /// Encodes a typed payload on its own exchange and routing key.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if the payload cannot be serialized.
    pub fn from_payload<E: EventPayload>(
        event: &E,
        content_type: ContentType,
    ) -> Result<Self, CodecError> {
        let payload = content_type.encode(event)?;
        Ok(Self::new(E::EXCHANGE, E::routing_key(), content_type, payload))
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Decodes the payload as `E` using the message's content type.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] if the payload is malformed or does not
    /// match the schema of `E`.
    pub fn decode<E: EventPayload>(&self) -> Result<E, CodecError> {
        self.content_type.decode(&self.payload)
    }
}

/// Milliseconds since the Unix epoch. Returns 0 if the clock is before the epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
