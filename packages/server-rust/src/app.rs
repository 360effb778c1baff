//! Process assembly: stores, broker, services and the HTTP surface for a role.

use std::sync::Arc;
use std::time::Instant;

use socialstream_core::{exchanges, TopicPattern};
use tokio::sync::watch;
use tracing::{error, info};

use crate::broker::{self, AdapterConfig, BrokerConnection};
use crate::config::{AppConfig, Role};
use crate::network::{AppState, NetworkModule, ShutdownController};
use crate::service::{
    Argon2Hasher, AuthService, BoundedExecutor, ConsumerService, DomainServices, MediaService,
    OutboxRelayService, PostService, ServiceConfig, ServiceContext, ServiceRegistry, UserService,
};
use crate::storage::{
    Backend, CredentialStore, MediaStore, MemoryStore, OutboxStore, PostStore, UserStore,
};

/// Pool size used for the PostgreSQL backend.
#[cfg(feature = "postgres")]
const PG_MAX_CONNECTIONS: u32 = 16;

/// One backend seen through each service's store trait.
#[derive(Clone)]
pub struct Stores {
    pub credentials: Arc<dyn CredentialStore>,
    pub users: Arc<dyn UserStore>,
    pub posts: Arc<dyn PostStore>,
    pub media: Arc<dyn MediaStore>,
    pub outbox: Arc<dyn OutboxStore>,
}

impl Stores {
    #[must_use]
    pub fn from_backend<B: Backend>(backend: Arc<B>) -> Self {
        Self {
            credentials: backend.clone(),
            users: backend.clone(),
            posts: backend.clone(),
            media: backend.clone(),
            outbox: backend,
        }
    }

    /// Opens the store named by `database_url`, or an in-memory store.
    ///
    /// # Errors
    ///
    /// Returns an error if the database is unreachable, or if a URL is given
    /// and the `postgres` feature is disabled.
    pub async fn open(database_url: Option<&str>) -> anyhow::Result<Self> {
        let Some(url) = database_url else {
            info!("using in-memory store");
            return Ok(Self::from_backend(Arc::new(MemoryStore::new())));
        };
        #[cfg(feature = "postgres")]
        {
            let store = crate::storage::PgStore::connect(url, PG_MAX_CONNECTIONS).await?;
            store.initialize().await?;
            Ok(Self::from_backend(Arc::new(store)))
        }
        #[cfg(not(feature = "postgres"))]
        {
            let _ = url;
            anyhow::bail!("DATABASE_URL is set but the postgres feature is disabled")
        }
    }
}

/// A process hosting the services of one role.
pub struct App {
    config: AppConfig,
    service_config: Arc<ServiceConfig>,
    shutdown: Arc<ShutdownController>,
    registry: ServiceRegistry,
    services: DomainServices,
    consumers: Vec<Arc<ConsumerService>>,
    relay: Arc<OutboxRelayService>,
}

impl App {
    /// Connects the broker and store named by `config` and assembles the app.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker or the store cannot be reached.
    pub async fn build(config: AppConfig) -> anyhow::Result<Self> {
        let broker = broker::connect(&config.broker_url).await?;
        let stores = Stores::open(config.database_url.as_deref()).await?;
        Self::build_with(config, broker, stores)
    }

    /// Assembles the app on an existing broker connection and stores.
    ///
    /// Consumers are registered before the outbox relay, so on shutdown the
    /// relay flushes and stops before consumers detach.
    ///
    /// # Errors
    ///
    /// Returns an error if a consumer binding is not a valid topic pattern.
    pub fn build_with(
        config: AppConfig,
        broker: Arc<dyn BrokerConnection>,
        stores: Stores,
    ) -> anyhow::Result<Self> {
        let service_config = Arc::new(config.service_config());
        let executor = BoundedExecutor::new(service_config.max_in_flight_operations);
        let registry = ServiceRegistry::new();
        let role = config.role;
        let ack_mode = config.ack_mode();
        let mut services = DomainServices::default();
        let mut consumers = Vec::new();

        if role.includes(Role::Auth) {
            services.auth = Some(Arc::new(AuthService::new(
                stores.credentials.clone(),
                Arc::new(Argon2Hasher::default()),
                executor.clone(),
                service_config.clone(),
            )));
        }
        if role.includes(Role::User) {
            let users = Arc::new(UserService::new(
                stores.users.clone(),
                executor.clone(),
                service_config.clone(),
            ));
            consumers.push(Arc::new(ConsumerService::new(
                "user-consumer",
                broker.clone(),
                AdapterConfig::new(
                    "user",
                    exchanges::USER_EVENTS,
                    TopicPattern::new("user.#")?,
                )
                .with_ack_mode(ack_mode),
                users.routing_table(),
            )));
            services.user = Some(users);
        }
        if role.includes(Role::Post) {
            services.post = Some(Arc::new(PostService::new(
                stores.posts.clone(),
                executor.clone(),
                service_config.clone(),
            )));
        }
        if role.includes(Role::Media) {
            let media = Arc::new(MediaService::new(
                stores.media.clone(),
                executor.clone(),
                service_config.clone(),
            ));
            consumers.push(Arc::new(ConsumerService::new(
                "media-consumer",
                broker.clone(),
                AdapterConfig::new(
                    "media",
                    exchanges::MEDIA_EVENTS,
                    TopicPattern::new("media.#")?,
                )
                .with_ack_mode(ack_mode),
                media.routing_table(),
            )));
            services.media = Some(media);
        }

        for consumer in &consumers {
            registry.register_arc(consumer.clone());
        }
        // One relay per process: every service in it shares one outbox.
        let relay = Arc::new(OutboxRelayService::new(
            "outbox-relay",
            stores.outbox.clone(),
            broker,
        ));
        registry.register_arc(relay.clone());

        Ok(Self {
            config,
            service_config,
            shutdown: Arc::new(ShutdownController::new()),
            registry,
            services,
            consumers,
            relay,
        })
    }

    #[must_use]
    pub fn services(&self) -> &DomainServices {
        &self.services
    }

    #[must_use]
    pub fn consumers(&self) -> &[Arc<ConsumerService>] {
        &self.consumers
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Publishes every pending outbox event now.
    ///
    /// # Errors
    ///
    /// Returns an error if the relay is not running.
    pub async fn flush_outbox(&self) -> anyhow::Result<usize> {
        self.relay.flush().await
    }

    /// Initializes every managed service in registration order.
    ///
    /// # Errors
    ///
    /// Returns the first initialization error; services that were already
    /// started are shut down again.
    pub async fn start(&self) -> anyhow::Result<()> {
        let ctx = ServiceContext {
            config: self.service_config.clone(),
            shutdown: self.shutdown.clone(),
        };
        if let Err(err) = self.registry.init_all(&ctx).await {
            if let Err(cleanup) = self.registry.shutdown_all(true).await {
                error!(error = %cleanup, "cleanup after failed start also failed");
            }
            return Err(err);
        }
        info!(role = ?self.config.role, services = ?self.registry.names(), "services started");
        Ok(())
    }

    /// Shuts managed services down in reverse registration order.
    ///
    /// # Errors
    ///
    /// Returns the first shutdown error.
    pub async fn stop(&self, terminate: bool) -> anyhow::Result<()> {
        self.registry.shutdown_all(terminate).await
    }

    /// Runs until interrupted or until a background component fails.
    ///
    /// # Errors
    ///
    /// Returns an error if startup fails, the server fails, or a background
    /// component reported a fatal error.
    pub async fn run(self) -> anyhow::Result<()> {
        if let Some(port) = self.config.metrics_port {
            crate::telemetry::install_metrics_exporter(port)?;
        }

        let mut network = NetworkModule::new(self.config.network_config(), self.shutdown.clone());
        network.start().await?;
        self.start().await?;

        let state = AppState {
            services: self.services.clone(),
            consumers: self.consumers.clone(),
            shutdown: self.shutdown.clone(),
            start_time: Instant::now(),
        };
        let served = network
            .serve(state, shutdown_signal(self.shutdown.shutdown_receiver()))
            .await;
        let stopped = self.stop(false).await;

        if let Some(reason) = self.shutdown.fatal_error() {
            anyhow::bail!("stopped after fatal error: {reason}");
        }
        served?;
        stopped?;
        info!("shutdown complete");
        Ok(())
    }
}

/// Resolves on Ctrl-C, SIGTERM, or when the controller is told to stop.
async fn shutdown_signal(mut stop: watch::Receiver<bool>) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let requested = async move {
        loop {
            if *stop.borrow_and_update() {
                return;
            }
            if stop.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => info!("interrupt received"),
        () = terminate => info!("SIGTERM received"),
        () = requested => info!("shutdown requested"),
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::broker::InMemoryBroker;

    fn app(role: &str) -> App {
        let config = AppConfig::parse_from(["socialstream", "--role", role]);
        App::build_with(
            config,
            Arc::new(InMemoryBroker::new()),
            Stores::from_backend(Arc::new(MemoryStore::new())),
        )
        .unwrap()
    }

    #[test]
    fn role_selects_services_and_consumers() {
        let auth = app("auth");
        assert!(auth.services().auth.is_some());
        assert!(auth.services().user.is_none());
        assert!(auth.consumers().is_empty());
        assert_eq!(auth.registry.names(), vec!["outbox-relay"]);

        let all = app("all");
        assert!(all.services().media.is_some());
        assert_eq!(
            all.registry.names(),
            vec!["user-consumer", "media-consumer", "outbox-relay"]
        );
    }

    #[tokio::test]
    async fn start_and_stop_release_broker_resources() {
        let broker = Arc::new(InMemoryBroker::new());
        let app = App::build_with(
            AppConfig::parse_from(["socialstream", "--role", "user"]),
            broker.clone(),
            Stores::from_backend(Arc::new(MemoryStore::new())),
        )
        .unwrap();
        app.start().await.unwrap();
        assert_eq!(broker.queue_count(), 1);

        app.stop(false).await.unwrap();
        assert_eq!(broker.queue_count(), 0);
        assert!(app.shutdown_controller().fatal_error().is_none());
    }

    #[tokio::test]
    async fn shutdown_signal_follows_controller() {
        let shutdown = ShutdownController::new();
        let signal = tokio::spawn(shutdown_signal(shutdown.shutdown_receiver()));
        shutdown.fail("consumer lost its channel");
        tokio::time::timeout(std::time::Duration::from_secs(1), signal)
            .await
            .unwrap()
            .unwrap();
    }
}
