//! Message broker integration.
//!
//! - [`channel`]: the channel/connection traits and wire-level types
//! - [`memory`]: in-process broker
//! - `amqp`: AMQP 0-9-1 backend (feature `amqp`)
//! - [`routing`]: routing table and event handlers
//! - [`adapter`]: consume loop with acknowledgement and dead-lettering
//! - [`publisher`]: serialized publishing

pub mod adapter;
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod channel;
pub mod memory;
pub mod publisher;
pub mod routing;

use std::sync::Arc;

pub use adapter::{dead_letter_exchange, AdapterConfig, AdapterState, EventAdapter};
#[cfg(feature = "amqp")]
pub use amqp::AmqpConnection;
pub use channel::{
    AckMode, BrokerChannel, BrokerConnection, BrokerError, Delivery, DeliveryStream,
    ExchangeKind, ExchangeSpec, QueueSpec,
};
pub use memory::InMemoryBroker;
pub use publisher::EventPublisher;
pub use routing::{typed, EventHandler, HandlerError, LogAndDrop, RoutingTable, TypedHandler};

/// URL selecting the in-process broker.
pub const MEMORY_URL: &str = "memory://";

/// Connects to the broker named by `url`: `memory://` or `amqp://...`.
///
/// # Errors
///
/// Returns [`BrokerError::InvalidUrl`] for an unknown scheme (or `amqp://`
/// without the `amqp` feature), or the connection error.
pub async fn connect(url: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
    if url == MEMORY_URL {
        return Ok(Arc::new(InMemoryBroker::new()));
    }
    #[cfg(feature = "amqp")]
    {
        if url.starts_with("amqp://") {
            return Ok(Arc::new(AmqpConnection::connect(url).await?));
        }
    }
    Err(BrokerError::InvalidUrl(url.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_url_connects_in_process() {
        let connection = connect(MEMORY_URL).await.unwrap();
        assert!(connection.open_channel().await.is_ok());
    }

    #[tokio::test]
    async fn unknown_scheme_is_rejected() {
        assert!(matches!(
            connect("kafka://localhost").await,
            Err(BrokerError::InvalidUrl(_))
        ));
    }
}
