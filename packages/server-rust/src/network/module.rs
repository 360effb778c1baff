//! Network module with deferred startup lifecycle.
//!
//! Implements the deferred startup pattern: `new()` creates resources,
//! `start()` binds the TCP listener, and `serve()` starts accepting
//! connections. This separation lets the application initialize its
//! managed services between `start()` and `serve()`.

use std::future::Future;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::NetworkConfig;
use super::handlers::{
    auth, health_handler, liveness_handler, media, posts, readiness_handler, users, AppState,
};
use super::middleware::{build_http_layers, track_in_flight};
use super::shutdown::ShutdownController;

/// Manages the HTTP server lifecycle.
///
/// Follows the deferred startup pattern:
/// 1. `new()` -- takes the config and the process-wide shutdown controller
/// 2. `start()` -- binds TCP listener to the configured address
/// 3. `serve()` -- begins accepting requests until shutdown is signalled
pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    shutdown: Arc<ShutdownController>,
}

impl NetworkModule {
    /// Creates a new network module without binding any port.
    #[must_use]
    pub fn new(config: NetworkConfig, shutdown: Arc<ShutdownController>) -> Self {
        Self {
            config,
            listener: None,
            shutdown,
        }
    }

    /// Returns a shared reference to the shutdown controller.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Assembles the axum router with all routes and middleware.
    ///
    /// Routes:
    /// - `GET /health`, `GET /health/live`, `GET /health/ready` -- always
    /// - auth, user, post and media routes -- only for services in `state`
    pub fn build_router(&self, state: AppState) -> Router {
        let layers = build_http_layers(&self.config);
        let services = state.services.clone();

        let mut router = Router::new()
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler));
        if let Some(service) = services.auth {
            router = router.merge(auth::routes(service));
        }
        if let Some(service) = services.user {
            router = router.merge(users::routes(service));
        }
        if let Some(service) = services.post {
            router = router.merge(posts::routes(service));
        }
        if let Some(service) = services.media {
            router = router.merge(media::routes(service));
        }

        router
            .layer(axum::middleware::from_fn_with_state(
                Arc::clone(&self.shutdown),
                track_in_flight,
            ))
            .layer(layers)
            .with_state(state)
    }

    /// Binds the TCP listener to the configured host and port.
    ///
    /// Returns the actual bound port, which may differ from the configured
    /// port when port 0 is used (OS-assigned ephemeral port).
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (e.g., port in use).
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!("TCP listener bound to {}:{}", self.config.host, port);

        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves requests until the `shutdown` future completes.
    ///
    /// After the shutdown signal the health state moves to Draining, then
    /// in-flight requests get up to the configured drain timeout before the
    /// state moves to Stopped.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called first or the server
    /// encounters a fatal I/O error.
    pub async fn serve(
        self,
        state: AppState,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let router = self.build_router(state);
        let listener = self
            .listener
            .ok_or_else(|| anyhow::anyhow!("start() must be called before serve()"))?;

        // Transition to Ready so readiness probes pass.
        self.shutdown.set_ready();
        info!("Serving HTTP connections");

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        self.shutdown.trigger_shutdown();
        if self.shutdown.wait_for_drain(self.config.drain_timeout).await {
            info!("All in-flight requests drained");
        } else {
            warn!("Drain timeout expired with in-flight requests remaining");
        }
        Ok(())
    }
}
