//! Serialized publishing over an exclusively owned channel.

use std::collections::HashSet;

use parking_lot::Mutex;
use socialstream_core::EventMessage;
use tracing::debug;

use super::channel::{BrokerChannel, BrokerConnection, BrokerError, ExchangeSpec};

/// Publishes event messages, declaring each target exchange on first use.
///
/// Publishes are serialized through one channel; callers that need
/// parallelism open more publishers.
pub struct EventPublisher {
    channel: tokio::sync::Mutex<Box<dyn BrokerChannel>>,
    declared: Mutex<HashSet<String>>,
}

impl EventPublisher {
    #[must_use]
    pub fn new(channel: Box<dyn BrokerChannel>) -> Self {
        Self {
            channel: tokio::sync::Mutex::new(channel),
            declared: Mutex::new(HashSet::new()),
        }
    }

    /// Opens a dedicated channel on `connection`.
    ///
    /// # Errors
    ///
    /// Returns the broker error if the channel cannot be opened.
    pub async fn open(connection: &dyn BrokerConnection) -> Result<Self, BrokerError> {
        Ok(Self::new(connection.open_channel().await?))
    }

    /// Publishes `message` to its exchange.
    ///
    /// # Errors
    ///
    /// Returns the broker error of the declaration or the publish.
    pub async fn publish(&self, message: &EventMessage) -> Result<(), BrokerError> {
        let channel = self.channel.lock().await;
        if !self.declared.lock().contains(&message.exchange) {
            channel
                .declare_exchange(&ExchangeSpec::topic(message.exchange.clone()))
                .await?;
            self.declared.lock().insert(message.exchange.clone());
        }

        let result = channel.publish(message).await;
        metrics::counter!(
            "events_published_total",
            "exchange" => message.exchange.clone(),
            "result" => if result.is_ok() { "success" } else { "failure" },
        )
        .increment(1);
        if result.is_ok() {
            debug!(
                exchange = %message.exchange,
                routing_key = %message.routing_key,
                message_id = %message.message_id,
                "event published"
            );
        }
        result
    }

    /// Closes the underlying channel.
    ///
    /// # Errors
    ///
    /// Returns the broker error from closing the channel.
    pub async fn close(&self) -> Result<(), BrokerError> {
        self.channel.lock().await.close().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::StreamExt;
    use socialstream_core::{ContentType, PostCreated, TopicPattern};

    use super::*;
    use crate::broker::channel::{AckMode, QueueSpec};
    use crate::broker::memory::InMemoryBroker;

    #[tokio::test]
    async fn declares_exchange_lazily_and_publishes() {
        let broker = InMemoryBroker::new();
        let publisher = EventPublisher::open(&broker).await.unwrap();
        let message = EventMessage::from_payload(
            &PostCreated {
                post_id: "p1".to_string(),
                owner_id: 7,
                body: "hello".to_string(),
                media_id: None,
            },
            ContentType::Json,
        )
        .unwrap();

        // Exchange does not exist yet; the first publish declares it.
        publisher.publish(&message).await.unwrap();

        let observer = broker.open_channel().await.unwrap();
        observer
            .declare_exchange(&ExchangeSpec::topic("post_events"))
            .await
            .unwrap();
        let queue = observer.declare_queue(&QueueSpec::exclusive()).await.unwrap();
        observer
            .bind_queue(&queue, "post_events", &TopicPattern::new("post.*").unwrap())
            .await
            .unwrap();
        let mut stream = observer.consume(&queue, AckMode::Auto).await.unwrap();

        publisher.publish(&message).await.unwrap();
        let delivery = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.message.message_id, message.message_id);
    }

    #[tokio::test]
    async fn publish_after_close_fails() {
        let broker = InMemoryBroker::new();
        let publisher = EventPublisher::open(&broker).await.unwrap();
        publisher.close().await.unwrap();

        let message = EventMessage::from_payload(
            &PostCreated {
                post_id: "p1".to_string(),
                owner_id: 7,
                body: "hello".to_string(),
                media_id: None,
            },
            ContentType::Json,
        )
        .unwrap();
        assert!(matches!(
            publisher.publish(&message).await,
            Err(BrokerError::ChannelClosed)
        ));
    }
}
