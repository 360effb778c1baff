//! Event broker adapter: declares a topology and drives the consume loop.
//!
//! State machine: `Uninitialized -> Declared -> Consuming -> Terminated`.
//! There is no transition back; a terminated adapter is replaced by
//! restarting the process.

use std::sync::Arc;

use arc_swap::ArcSwap;
use futures_util::StreamExt;
use socialstream_core::{EventMessage, TopicPattern};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::channel::{
    AckMode, BrokerChannel, BrokerConnection, BrokerError, Delivery, ExchangeSpec, QueueSpec,
};
use super::routing::{HandlerError, RoutingTable};

/// Suffix of the dead-letter exchange paired with each consumed exchange.
pub const DEAD_LETTER_SUFFIX: &str = ".dlx";

/// Returns the dead-letter exchange name for `exchange`.
#[must_use]
pub fn dead_letter_exchange(exchange: &str) -> String {
    format!("{exchange}{DEAD_LETTER_SUFFIX}")
}

// ---------------------------------------------------------------------------
// Configuration and state
// ---------------------------------------------------------------------------

/// What one adapter consumes and how it acknowledges.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Label used in logs and metrics.
    pub name: String,
    pub exchange: String,
    pub binding: TopicPattern,
    pub ack_mode: AckMode,
    /// Republish permanently failed messages to `{exchange}.dlx` (manual mode only).
    pub dead_letter: bool,
}

impl AdapterConfig {
    /// Manual acknowledgement with dead-lettering enabled.
    #[must_use]
    pub fn new(name: impl Into<String>, exchange: impl Into<String>, binding: TopicPattern) -> Self {
        Self {
            name: name.into(),
            exchange: exchange.into(),
            binding,
            ack_mode: AckMode::Manual,
            dead_letter: true,
        }
    }

    #[must_use]
    pub fn with_ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }
}

/// Lifecycle state of an [`EventAdapter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Uninitialized,
    Declared,
    Consuming,
    Terminated,
}

impl AdapterState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Declared => "declared",
            Self::Consuming => "consuming",
            Self::Terminated => "terminated",
        }
    }
}

/// What happens to a delivery after its handler returns (manual mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Ack,
    Requeue,
    DeadLetter,
}

impl Disposition {
    fn for_result(result: &Result<(), HandlerError>, redelivered: bool) -> Self {
        match result {
            Ok(()) => Self::Ack,
            Err(HandlerError::Retryable(_)) if !redelivered => Self::Requeue,
            Err(_) => Self::DeadLetter,
        }
    }
}

fn result_label(result: &Result<(), HandlerError>, matched: bool) -> &'static str {
    match result {
        Ok(()) if matched => "handled",
        Ok(()) => "unrouted",
        Err(HandlerError::Decode(_)) => "decode_error",
        Err(HandlerError::Retryable(_)) => "retryable",
        Err(HandlerError::Rejected(_)) => "rejected",
    }
}

// ---------------------------------------------------------------------------
// EventAdapter
// ---------------------------------------------------------------------------

/// Consumes one exchange through an exclusively owned channel and dispatches
/// every delivery through a [`RoutingTable`] exactly once.
pub struct EventAdapter {
    config: AdapterConfig,
    channel: Box<dyn BrokerChannel>,
    queue: Option<String>,
    state: Arc<ArcSwap<AdapterState>>,
}

impl EventAdapter {
    /// Creates an adapter over a channel no other component uses.
    #[must_use]
    pub fn new(channel: Box<dyn BrokerChannel>, config: AdapterConfig) -> Self {
        Self {
            config,
            channel,
            queue: None,
            state: Arc::new(ArcSwap::from_pointee(AdapterState::Uninitialized)),
        }
    }

    /// Opens a dedicated channel on `connection` and creates an adapter over it.
    ///
    /// # Errors
    ///
    /// Returns the broker error if the channel cannot be opened.
    pub async fn open(
        connection: &dyn BrokerConnection,
        config: AdapterConfig,
    ) -> Result<Self, BrokerError> {
        Ok(Self::new(connection.open_channel().await?, config))
    }

    #[must_use]
    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> AdapterState {
        **self.state.load()
    }

    /// Shared handle to the state, readable after the adapter moves into its task.
    #[must_use]
    pub fn state_handle(&self) -> Arc<ArcSwap<AdapterState>> {
        Arc::clone(&self.state)
    }

    fn set_state(&self, state: AdapterState) {
        self.state.store(Arc::new(state));
    }

    /// Declares the exchange, an exclusive server-named queue and its binding.
    /// In manual mode with dead-lettering, also declares `{exchange}.dlx`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::InvalidState`] unless the adapter is
    /// `Uninitialized`, or the broker error of a failed declaration, which
    /// leaves the adapter `Terminated`.
    pub async fn declare(&mut self) -> Result<(), BrokerError> {
        let state = self.state();
        if state != AdapterState::Uninitialized {
            return Err(BrokerError::InvalidState(state.as_str()));
        }
        match self.declare_topology().await {
            Ok(queue) => {
                info!(
                    adapter = %self.config.name,
                    exchange = %self.config.exchange,
                    binding = %self.config.binding,
                    queue = %queue,
                    "adapter topology declared"
                );
                self.queue = Some(queue);
                self.set_state(AdapterState::Declared);
                Ok(())
            }
            Err(err) => {
                self.set_state(AdapterState::Terminated);
                Err(err)
            }
        }
    }

    async fn declare_topology(&self) -> Result<String, BrokerError> {
        let exchange = &self.config.exchange;
        self.channel
            .declare_exchange(&ExchangeSpec::topic(exchange.clone()))
            .await?;
        if self.dead_letters() {
            self.channel
                .declare_exchange(&ExchangeSpec::topic(dead_letter_exchange(exchange)))
                .await?;
        }
        let queue = self.channel.declare_queue(&QueueSpec::exclusive()).await?;
        self.channel
            .bind_queue(&queue, exchange, &self.config.binding)
            .await?;
        Ok(queue)
    }

    fn dead_letters(&self) -> bool {
        self.config.dead_letter && self.config.ack_mode == AckMode::Manual
    }

    /// Consumes until the shutdown signal fires or the delivery stream ends.
    ///
    /// Handler failures and malformed payloads never end the loop.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::InvalidState`] unless the adapter is `Declared`,
    /// and [`BrokerError::ChannelClosed`] (or the failing broker call's error)
    /// when the channel is lost. The adapter is `Terminated` on return.
    pub async fn run(
        self,
        table: RoutingTable,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), BrokerError> {
        let state = self.state();
        let Some(queue) = self.queue.clone().filter(|_| state == AdapterState::Declared) else {
            return Err(BrokerError::InvalidState(state.as_str()));
        };

        let mut deliveries = match self.channel.consume(&queue, self.config.ack_mode).await {
            Ok(stream) => stream,
            Err(err) => {
                self.set_state(AdapterState::Terminated);
                return Err(err);
            }
        };
        self.set_state(AdapterState::Consuming);
        info!(adapter = %self.config.name, queue = %queue, "adapter consuming");

        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break Ok(());
                    }
                }
                next = deliveries.next() => match next {
                    Some(delivery) => {
                        if let Err(err) = self.dispatch(&table, delivery).await {
                            break Err(err);
                        }
                    }
                    None => break Err(BrokerError::ChannelClosed),
                },
            }
        };

        drop(deliveries);
        self.set_state(AdapterState::Terminated);
        match &result {
            Ok(()) => {
                info!(adapter = %self.config.name, "adapter stopped");
                if let Err(err) = self.channel.close().await {
                    debug!(adapter = %self.config.name, error = %err, "channel close failed");
                }
            }
            Err(err) => {
                error!(adapter = %self.config.name, error = %err, "adapter terminated");
            }
        }
        result
    }

    async fn dispatch(&self, table: &RoutingTable, delivery: Delivery) -> Result<(), BrokerError> {
        let message = &delivery.message;
        let (handler, matched) = table.resolve(&message.routing_key);
        let result = handler.handle(message).await;

        let label = result_label(&result, matched);
        metrics::counter!(
            "events_consumed_total",
            "adapter" => self.config.name.clone(),
            "result" => label,
        )
        .increment(1);

        match &result {
            Ok(()) => debug!(
                adapter = %self.config.name,
                routing_key = %message.routing_key,
                message_id = %message.message_id,
                result = label,
                "event dispatched"
            ),
            Err(err) => warn!(
                adapter = %self.config.name,
                routing_key = %message.routing_key,
                message_id = %message.message_id,
                redelivered = delivery.redelivered,
                error = %err,
                "event handler failed"
            ),
        }

        if self.config.ack_mode == AckMode::Auto {
            return Ok(());
        }

        match Disposition::for_result(&result, delivery.redelivered) {
            Disposition::Ack => self.channel.ack(delivery.delivery_tag).await,
            Disposition::Requeue => self.channel.reject(delivery.delivery_tag, true).await,
            Disposition::DeadLetter if self.config.dead_letter => {
                self.channel.publish(&self.dead_lettered(message)).await?;
                self.channel.ack(delivery.delivery_tag).await
            }
            Disposition::DeadLetter => self.channel.reject(delivery.delivery_tag, false).await,
        }
    }

    fn dead_lettered(&self, message: &EventMessage) -> EventMessage {
        EventMessage {
            exchange: dead_letter_exchange(&self.config.exchange),
            ..message.clone()
        }
    }
}
