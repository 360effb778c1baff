//! Broker channel abstraction.
//!
//! A [`BrokerChannel`] is the unit of exclusive ownership: an adapter or a
//! publisher opens its own channel from a [`BrokerConnection`] and never
//! shares it.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use socialstream_core::{EventMessage, TopicPattern};

// ---------------------------------------------------------------------------
// Declarations
// ---------------------------------------------------------------------------

/// Exchange routing algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Routes by topic pattern (`*` / `#` wildcards).
    Topic,
    /// Routes when the binding key equals the routing key.
    Direct,
    /// Routes to every bound queue.
    Fanout,
}

impl ExchangeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Topic => "topic",
            Self::Direct => "direct",
            Self::Fanout => "fanout",
        }
    }

    /// Returns `true` if a message with `key` is routed through a binding with `pattern`.
    #[must_use]
    pub fn routes(self, pattern: &TopicPattern, key: &socialstream_core::RoutingKey) -> bool {
        match self {
            Self::Topic => pattern.matches(key),
            Self::Direct => pattern.as_str() == key.as_str(),
            Self::Fanout => true,
        }
    }
}

/// Parameters of an exchange declaration.
///
/// Redeclaring an exchange with different parameters is a configuration error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
}

impl ExchangeSpec {
    /// A durable topic exchange, the kind every service category uses.
    #[must_use]
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Topic,
            durable: true,
            auto_delete: false,
        }
    }
}

/// Parameters of a queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    /// `None` lets the broker generate a name.
    pub name: Option<String>,
    pub durable: bool,
    /// Restricts the queue to the declaring channel and deletes it when that
    /// channel closes.
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueSpec {
    /// A non-durable, exclusive, server-named queue.
    #[must_use]
    pub fn exclusive() -> Self {
        Self {
            name: None,
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }

    /// A durable, shared queue with a fixed name.
    #[must_use]
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Consumption
// ---------------------------------------------------------------------------

/// Acknowledgement mode of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// The broker treats a message as acknowledged once delivered (at-most-once).
    Auto,
    /// The consumer acknowledges or rejects every delivery (at-least-once).
    #[default]
    Manual,
}

/// One message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Channel-scoped tag used to ack or reject this delivery.
    pub delivery_tag: u64,
    /// `true` if the message was requeued after an earlier delivery.
    pub redelivered: bool,
    pub message: EventMessage,
}

/// Stream of deliveries. It ends when the channel or connection is lost and
/// cannot be restarted.
pub type DeliveryStream = BoxStream<'static, Delivery>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("{kind} {name:?} already declared with different parameters: {detail}")]
    ConfigurationMismatch {
        kind: &'static str,
        name: String,
        detail: String,
    },
    #[error("{kind} {name:?} not found")]
    NotFound { kind: &'static str, name: String },
    #[error("queue {0:?} is locked by another channel")]
    ResourceLocked(String),
    #[error("queue {0:?} already has a consumer")]
    ConsumerExists(String),
    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),
    #[error("operation not valid in adapter state {0}")]
    InvalidState(&'static str),
    #[error("channel closed")]
    ChannelClosed,
    #[error("invalid broker url: {0}")]
    InvalidUrl(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl BrokerError {
    /// Returns `true` if the channel or connection is gone, as opposed to
    /// the broker refusing one particular request.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::ChannelClosed | Self::Transport(_))
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// An exclusively owned channel to the broker.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declares an exchange. Idempotent for identical parameters.
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError>;

    /// Declares a queue and returns its (possibly generated) name.
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String, BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &TopicPattern,
    ) -> Result<(), BrokerError>;

    /// Publishes to `message.exchange` with `message.routing_key`.
    async fn publish(&self, message: &EventMessage) -> Result<(), BrokerError>;

    /// Starts consuming `queue`.
    async fn consume(&self, queue: &str, ack_mode: AckMode) -> Result<DeliveryStream, BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Rejects a delivery, returning it to its queue if `requeue` is set.
    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    /// Closes the channel. Exclusive queues declared on it are deleted.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// A connection from which channels are opened.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, BrokerError>;
}

#[async_trait]
impl<C: BrokerConnection + ?Sized> BrokerConnection for Arc<C> {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        (**self).open_channel().await
    }
}

#[cfg(test)]
mod tests {
    use socialstream_core::RoutingKey;

    use super::*;

    #[test]
    fn exchange_kinds_route_by_their_rules() {
        let key = RoutingKey::new("user.created").unwrap();
        let wildcard = TopicPattern::new("user.#").unwrap();
        let exact = TopicPattern::new("user.created").unwrap();

        assert!(ExchangeKind::Topic.routes(&wildcard, &key));
        assert!(!ExchangeKind::Direct.routes(&wildcard, &key));
        assert!(ExchangeKind::Direct.routes(&exact, &key));
        assert!(ExchangeKind::Fanout.routes(&TopicPattern::new("x").unwrap(), &key));
    }

    #[test]
    fn default_specs() {
        let exchange = ExchangeSpec::topic("user_events");
        assert_eq!(exchange.kind, ExchangeKind::Topic);
        assert!(exchange.durable);

        let queue = QueueSpec::exclusive();
        assert!(queue.name.is_none());
        assert!(queue.exclusive);
        assert!(!queue.durable);

        assert_eq!(AckMode::default(), AckMode::Manual);
    }

    #[test]
    fn only_lost_channels_are_transport_errors() {
        assert!(BrokerError::ChannelClosed.is_transport());
        assert!(BrokerError::Transport("reset by peer".to_string()).is_transport());
        assert!(!BrokerError::NotFound {
            kind: "exchange",
            name: "user_events".to_string(),
        }
        .is_transport());
        assert!(!BrokerError::ConfigurationMismatch {
            kind: "exchange",
            name: "user_events".to_string(),
            detail: "durable".to_string(),
        }
        .is_transport());
    }
}
