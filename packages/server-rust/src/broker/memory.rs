//! In-process broker with topic-exchange semantics.
//!
//! Used by the single-process `all` role and by tests. Exchanges, queues and
//! bindings behave like their AMQP counterparts: declarations are idempotent,
//! exclusive queues belong to the declaring channel and disappear with it,
//! and unacknowledged deliveries are requeued when their channel closes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use socialstream_core::{EventMessage, TopicPattern};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::channel::{
    AckMode, BrokerChannel, BrokerConnection, BrokerError, Delivery, DeliveryStream,
    ExchangeSpec, QueueSpec,
};

type ChannelId = u64;

#[derive(Debug, Clone)]
struct Envelope {
    message: EventMessage,
    redelivered: bool,
}

struct Exchange {
    spec: ExchangeSpec,
    bindings: Vec<(String, TopicPattern)>,
}

struct Queue {
    spec: QueueSpec,
    owner: Option<ChannelId>,
    consumer: Option<ChannelId>,
    tx: mpsc::UnboundedSender<Envelope>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>>,
}

impl Queue {
    fn new(spec: QueueSpec, owner: Option<ChannelId>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            spec,
            owner,
            consumer: None,
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }

    fn check_access(&self, name: &str, channel: ChannelId) -> Result<(), BrokerError> {
        match self.owner {
            Some(owner) if owner != channel => Err(BrokerError::ResourceLocked(name.to_string())),
            _ => Ok(()),
        }
    }
}

#[derive(Default)]
struct Topology {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
}

impl Topology {
    fn requeue(&self, queue: &str, envelope: Envelope) {
        if let Some(queue) = self.queues.get(queue) {
            let _ = queue.tx.send(Envelope {
                redelivered: true,
                ..envelope
            });
        }
    }
}

struct Shared {
    topology: Mutex<Topology>,
    next_channel: AtomicU64,
    connection: CancellationToken,
}

// ---------------------------------------------------------------------------
// InMemoryBroker
// ---------------------------------------------------------------------------

/// An in-process broker connection. Clones share the same topology.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                topology: Mutex::new(Topology::default()),
                next_channel: AtomicU64::new(1),
                connection: CancellationToken::new(),
            }),
        }
    }

    /// Drops the connection: every open delivery stream ends and every
    /// channel operation fails with [`BrokerError::ChannelClosed`].
    pub fn shutdown(&self) {
        self.shared.connection.cancel();
    }

    /// Number of queues currently declared.
    #[must_use]
    pub fn queue_count(&self) -> usize {
        self.shared.topology.lock().queues.len()
    }

    /// Number of messages waiting in `queue`, or `None` if it does not exist.
    #[must_use]
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        let topology = self.shared.topology.lock();
        let queue = topology.queues.get(queue)?;
        // A consumer holding the lock is draining the queue; report it as empty.
        queue.rx.try_lock().map_or(Some(0), |rx| Some(rx.len()))
    }
}

#[async_trait]
impl BrokerConnection for InMemoryBroker {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        if self.shared.connection.is_cancelled() {
            return Err(BrokerError::ChannelClosed);
        }
        let id = self.shared.next_channel.fetch_add(1, Ordering::Relaxed);
        debug!(channel = id, "opened in-memory channel");
        Ok(Box::new(MemoryChannel {
            id,
            shared: Arc::clone(&self.shared),
            state: Arc::new(Mutex::new(ChannelState::default())),
            closed: self.shared.connection.child_token(),
            released: AtomicBool::new(false),
        }))
    }
}

// ---------------------------------------------------------------------------
// MemoryChannel
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ChannelState {
    next_tag: u64,
    unacked: HashMap<u64, (String, Envelope)>,
}

struct MemoryChannel {
    id: ChannelId,
    shared: Arc<Shared>,
    state: Arc<Mutex<ChannelState>>,
    /// Cancelled when this channel closes or the connection drops.
    closed: CancellationToken,
    released: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.is_cancelled() {
            Err(BrokerError::ChannelClosed)
        } else {
            Ok(())
        }
    }

    /// Requeues unacked deliveries and deletes owned queues. Runs once.
    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closed.cancel();
        let mut unacked: Vec<_> = self.state.lock().unacked.drain().collect();
        unacked.sort_by_key(|(tag, _)| *tag);
        let mut topology = self.shared.topology.lock();
        for (_, (queue, envelope)) in unacked {
            topology.requeue(&queue, envelope);
        }

        let owned: Vec<String> = topology
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(self.id))
            .map(|(name, _)| name.clone())
            .collect();
        for queue in &owned {
            topology.queues.remove(queue);
        }
        for exchange in topology.exchanges.values_mut() {
            exchange.bindings.retain(|(queue, _)| !owned.contains(queue));
        }
        for queue in topology.queues.values_mut() {
            if queue.consumer == Some(self.id) {
                queue.consumer = None;
            }
        }
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut topology = self.shared.topology.lock();
        if let Some(existing) = topology.exchanges.get(&spec.name) {
            if existing.spec != *spec {
                return Err(BrokerError::ConfigurationMismatch {
                    kind: "exchange",
                    name: spec.name.clone(),
                    detail: format!(
                        "declared as {} durable={}, requested {} durable={}",
                        existing.spec.kind.as_str(),
                        existing.spec.durable,
                        spec.kind.as_str(),
                        spec.durable,
                    ),
                });
            }
            return Ok(());
        }
        topology.exchanges.insert(
            spec.name.clone(),
            Exchange {
                spec: spec.clone(),
                bindings: Vec::new(),
            },
        );
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String, BrokerError> {
        self.ensure_open()?;
        let name = spec
            .name
            .clone()
            .unwrap_or_else(|| format!("amq.gen-{}", Uuid::new_v4().simple()));
        let mut topology = self.shared.topology.lock();
        if let Some(existing) = topology.queues.get(&name) {
            existing.check_access(&name, self.id)?;
            let requested = QueueSpec {
                name: Some(name.clone()),
                ..spec.clone()
            };
            if existing.spec != requested {
                return Err(BrokerError::ConfigurationMismatch {
                    kind: "queue",
                    name,
                    detail: format!(
                        "declared durable={} exclusive={}, requested durable={} exclusive={}",
                        existing.spec.durable,
                        existing.spec.exclusive,
                        spec.durable,
                        spec.exclusive,
                    ),
                });
            }
            return Ok(name);
        }
        let owner = spec.exclusive.then_some(self.id);
        let spec = QueueSpec {
            name: Some(name.clone()),
            ..spec.clone()
        };
        topology.queues.insert(name.clone(), Queue::new(spec, owner));
        Ok(name)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &TopicPattern,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut topology = self.shared.topology.lock();
        topology
            .queues
            .get(queue)
            .ok_or_else(|| BrokerError::NotFound {
                kind: "queue",
                name: queue.to_string(),
            })?
            .check_access(queue, self.id)?;
        let exchange = topology
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::NotFound {
                kind: "exchange",
                name: exchange.to_string(),
            })?;
        let binding = (queue.to_string(), pattern.clone());
        if !exchange.bindings.contains(&binding) {
            exchange.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(&self, message: &EventMessage) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let topology = self.shared.topology.lock();
        let exchange =
            topology
                .exchanges
                .get(&message.exchange)
                .ok_or_else(|| BrokerError::NotFound {
                    kind: "exchange",
                    name: message.exchange.clone(),
                })?;

        let mut delivered = HashSet::new();
        for (queue, pattern) in &exchange.bindings {
            if !exchange.spec.kind.routes(pattern, &message.routing_key)
                || !delivered.insert(queue.as_str())
            {
                continue;
            }
            if let Some(target) = topology.queues.get(queue) {
                let _ = target.tx.send(Envelope {
                    message: message.clone(),
                    redelivered: false,
                });
            }
        }
        if delivered.is_empty() {
            debug!(
                exchange = %message.exchange,
                routing_key = %message.routing_key,
                "message unroutable, dropped"
            );
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, ack_mode: AckMode) -> Result<DeliveryStream, BrokerError> {
        self.ensure_open()?;
        let rx = {
            let mut topology = self.shared.topology.lock();
            let target = topology
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::NotFound {
                    kind: "queue",
                    name: queue.to_string(),
                })?;
            target.check_access(queue, self.id)?;
            if target.consumer.is_some() {
                return Err(BrokerError::ConsumerExists(queue.to_string()));
            }
            target.consumer = Some(self.id);
            Arc::clone(&target.rx)
        };

        let consumer = Consumer {
            queue: queue.to_string(),
            rx,
            closed: self.closed.clone(),
            state: Arc::clone(&self.state),
            ack_mode,
        };
        Ok(Box::pin(futures_util::stream::unfold(
            consumer,
            |consumer| async move {
                let delivery = consumer.next().await?;
                Some((delivery, consumer))
            },
        )))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.state
            .lock()
            .unacked
            .remove(&delivery_tag)
            .map(|_| ())
            .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag))
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let (queue, envelope) = self
            .state
            .lock()
            .unacked
            .remove(&delivery_tag)
            .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag))?;
        if requeue {
            self.shared.topology.lock().requeue(&queue, envelope);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        debug!(channel = self.id, "closing in-memory channel");
        self.release();
        Ok(())
    }
}

struct Consumer {
    queue: String,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>>,
    closed: CancellationToken,
    state: Arc<Mutex<ChannelState>>,
    ack_mode: AckMode,
}

impl Consumer {
    async fn next(&self) -> Option<Delivery> {
        let envelope = {
            let mut rx = self.rx.lock().await;
            tokio::select! {
                biased;
                () = self.closed.cancelled() => None,
                envelope = rx.recv() => envelope,
            }
        }?;

        let mut state = self.state.lock();
        state.next_tag += 1;
        let delivery_tag = state.next_tag;
        if self.ack_mode == AckMode::Manual {
            state
                .unacked
                .insert(delivery_tag, (self.queue.clone(), envelope.clone()));
        }
        Some(Delivery {
            delivery_tag,
            redelivered: envelope.redelivered,
            message: envelope.message,
        })
    }
}
