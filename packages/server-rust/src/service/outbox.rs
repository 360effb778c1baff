//! Outbox relay: publishes events committed alongside store writes.
//!
//! Events are read in creation order. A failed publish stops the batch so
//! that later events are not published ahead of an earlier one; the failed
//! event is retried on the next pass until it reaches the attempt limit.
//!
//! Losing the publisher channel is not charged to any event. The relay stops,
//! the events stay pending, and the process is told to shut down.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::config::ServiceConfig;
use super::registry::{ManagedService, ServiceContext};
use crate::broker::{BrokerConnection, BrokerError, EventPublisher};
use crate::network::ShutdownController;
use crate::storage::{OutboxStore, StoreError};

/// Why a relay pass stopped early.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The publisher's channel is gone; no event was charged for it.
    #[error("publisher channel lost: {0}")]
    ChannelLost(#[source] BrokerError),
}

// ---------------------------------------------------------------------------
// OutboxRelay
// ---------------------------------------------------------------------------

/// Moves pending outbox events from a store to the broker.
pub struct OutboxRelay {
    name: &'static str,
    store: Arc<dyn OutboxStore>,
    publisher: EventPublisher,
    batch_size: usize,
    max_attempts: u32,
}

impl OutboxRelay {
    #[must_use]
    pub fn new(
        name: &'static str,
        store: Arc<dyn OutboxStore>,
        publisher: EventPublisher,
        config: &ServiceConfig,
    ) -> Self {
        Self {
            name,
            store,
            publisher,
            batch_size: config.outbox_batch_size.max(1),
            max_attempts: config.outbox_max_attempts.max(1),
        }
    }

    /// Publishes up to one batch of pending events and returns how many
    /// were published.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Store`] if reading or updating the outbox fails,
    /// and [`RelayError::ChannelLost`] if the publisher's channel is gone.
    pub async fn relay_batch(&self) -> Result<usize, RelayError> {
        let pending = self
            .store
            .pending_events(self.batch_size, self.max_attempts)
            .await?;
        let mut published = 0;
        for event in pending {
            match self.publisher.publish(&event.message).await {
                Ok(()) => {
                    self.store.mark_published(event.id).await?;
                    published += 1;
                }
                Err(err) if err.is_transport() => return Err(RelayError::ChannelLost(err)),
                Err(err) => {
                    let reason = err.to_string();
                    let attempts = self.store.record_failure(event.id, &reason).await?;
                    if attempts >= self.max_attempts {
                        error!(
                            relay = self.name,
                            event_id = %event.id,
                            routing_key = %event.message.routing_key,
                            attempts,
                            error = %reason,
                            "outbox event exhausted its publish attempts"
                        );
                    } else {
                        warn!(
                            relay = self.name,
                            event_id = %event.id,
                            attempts,
                            error = %reason,
                            "outbox publish failed, will retry"
                        );
                    }
                    break;
                }
            }
        }
        if published > 0 {
            debug!(relay = self.name, published, "outbox batch relayed");
        }
        Ok(published)
    }

    /// Relays batches until the outbox is drained or a publish fails.
    ///
    /// # Errors
    ///
    /// Returns the first [`RelayError`] of any batch.
    pub async fn flush(&self) -> Result<usize, RelayError> {
        let mut total = 0;
        loop {
            let published = self.relay_batch().await?;
            total += published;
            if published < self.batch_size {
                return Ok(total);
            }
        }
    }

    async fn close(&self) {
        if let Err(err) = self.publisher.close().await {
            debug!(relay = self.name, error = %err, "publisher close failed");
        }
    }

    /// Flushes on every tick and on every request until stopped, then
    /// flushes once more. A lost channel ends the loop and fails the process.
    async fn run(
        self,
        poll_interval: Duration,
        mut requests: mpsc::Receiver<FlushRequest>,
        mut stop: watch::Receiver<bool>,
        shutdown: Arc<ShutdownController>,
    ) {
        let mut ticks =
            tokio::time::interval_at(tokio::time::Instant::now() + poll_interval, poll_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let reply = tokio::select! {
                _ = ticks.tick() => None,
                request = requests.recv() => match request {
                    Some(reply) => Some(reply),
                    None => break,
                },
                _ = stop.changed() => break,
            };
            let result = self.flush().await;
            let lost = self.report(&result, &shutdown);
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
            if lost {
                return;
            }
        }

        let result = self.flush().await;
        if !self.report(&result, &shutdown) {
            self.close().await;
        }
        info!(relay = self.name, "outbox relay stopped");
    }

    /// Logs a failed pass; returns `true` if the channel is gone.
    fn report(&self, result: &Result<usize, RelayError>, shutdown: &ShutdownController) -> bool {
        match result {
            Ok(_) => false,
            Err(RelayError::Store(err)) => {
                warn!(relay = self.name, error = %err, "outbox relay pass failed");
                false
            }
            Err(RelayError::ChannelLost(err)) => {
                shutdown.fail(format!("outbox relay {} lost its channel: {err}", self.name));
                true
            }
        }
    }
}

// ---------------------------------------------------------------------------
// OutboxRelayService
// ---------------------------------------------------------------------------

type FlushRequest = oneshot::Sender<Result<usize, RelayError>>;

struct Running {
    requests: mpsc::Sender<FlushRequest>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Runs an [`OutboxRelay`] on its own task for the process lifetime.
pub struct OutboxRelayService {
    name: &'static str,
    store: Arc<dyn OutboxStore>,
    connection: Arc<dyn BrokerConnection>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl OutboxRelayService {
    #[must_use]
    pub fn new(
        name: &'static str,
        store: Arc<dyn OutboxStore>,
        connection: Arc<dyn BrokerConnection>,
    ) -> Self {
        Self {
            name,
            store,
            connection,
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Publishes everything currently pending and returns the number published.
    ///
    /// # Errors
    ///
    /// Returns an error if the relay is not running or the pass failed.
    pub async fn flush(&self) -> anyhow::Result<usize> {
        let requests = self
            .running
            .lock()
            .await
            .as_ref()
            .map(|running| running.requests.clone())
            .ok_or_else(|| anyhow::anyhow!("outbox relay {} not running", self.name))?;
        let (reply, published) = oneshot::channel();
        requests
            .send(reply)
            .await
            .map_err(|_| anyhow::anyhow!("outbox relay {} stopped", self.name))?;
        let published = published
            .await
            .with_context(|| format!("outbox relay {} stopped", self.name))??;
        Ok(published)
    }
}

#[async_trait]
impl ManagedService for OutboxRelayService {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn init(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        let publisher = EventPublisher::open(self.connection.as_ref())
            .await
            .with_context(|| format!("opening channel for {}", self.name))?;
        let relay = OutboxRelay::new(self.name, Arc::clone(&self.store), publisher, &ctx.config);

        let (requests, requested) = mpsc::channel(16);
        let (stop, stopped) = watch::channel(false);
        let task = tokio::spawn(relay.run(
            ctx.config.outbox_poll_interval,
            requested,
            stopped,
            Arc::clone(&ctx.shutdown),
        ));
        *self.running.lock().await = Some(Running {
            requests,
            stop,
            task,
        });
        Ok(())
    }

    async fn shutdown(&self, terminate: bool) -> anyhow::Result<()> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };
        if terminate {
            running.task.abort();
        } else {
            let _ = running.stop.send(true);
        }
        match running.task.await {
            Ok(()) => Ok(()),
            Err(err) if err.is_cancelled() => Ok(()),
            Err(err) => Err(anyhow::anyhow!("outbox relay {} panicked: {err}", self.name)),
        }
    }
}
