//! Managed event consumer: owns one [`EventAdapter`] and its task.

use std::sync::Arc;

use anyhow::Context;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use super::registry::{ManagedService, ServiceContext};
use crate::broker::{AdapterConfig, AdapterState, BrokerConnection, EventAdapter, RoutingTable};

struct Running {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Declares an adapter's topology on init and consumes on a spawned task.
///
/// If the adapter terminates with an error, the process is told to stop
/// through [`ShutdownController::fail`](crate::network::ShutdownController::fail).
pub struct ConsumerService {
    name: &'static str,
    connection: Arc<dyn BrokerConnection>,
    config: AdapterConfig,
    table: RoutingTable,
    state: RwLock<Option<Arc<ArcSwap<AdapterState>>>>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl ConsumerService {
    #[must_use]
    pub fn new(
        name: &'static str,
        connection: Arc<dyn BrokerConnection>,
        config: AdapterConfig,
        table: RoutingTable,
    ) -> Self {
        Self {
            name,
            connection,
            config,
            table,
            state: RwLock::new(None),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Current adapter state; `Uninitialized` before `init`.
    #[must_use]
    pub fn state(&self) -> AdapterState {
        self.state
            .read()
            .as_ref()
            .map_or(AdapterState::Uninitialized, |state| **state.load())
    }
}

#[async_trait]
impl ManagedService for ConsumerService {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn init(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        let mut adapter = EventAdapter::open(self.connection.as_ref(), self.config.clone())
            .await
            .with_context(|| format!("opening channel for {}", self.name))?;
        *self.state.write() = Some(adapter.state_handle());
        adapter
            .declare()
            .await
            .with_context(|| format!("declaring topology for {}", self.name))?;

        let (stop, stopped) = watch::channel(false);
        let table = self.table.clone();
        let shutdown = Arc::clone(&ctx.shutdown);
        let name = self.name;
        let task = tokio::spawn(async move {
            if let Err(err) = adapter.run(table, stopped).await {
                shutdown.fail(format!("consumer {name} terminated: {err}"));
            }
        });
        *self.running.lock().await = Some(Running { stop, task });
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
            Ok(()) => {}
            Err(err) if err.is_cancelled() => {}
            Err(err) => return Err(anyhow::anyhow!("consumer {} panicked: {err}", self.name)),
        }
        info!(consumer = self.name, "consumer stopped");
        Ok(())
    }
}
