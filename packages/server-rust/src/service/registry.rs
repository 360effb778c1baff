use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::info;

use super::config::ServiceConfig;
use crate::network::ShutdownController;

// ---------------------------------------------------------------------------
// ServiceContext
// ---------------------------------------------------------------------------

/// Context provided to services during initialization.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    pub config: Arc<ServiceConfig>,
    /// Process-wide shutdown controller; background services report fatal
    /// errors through it.
    pub shutdown: Arc<ShutdownController>,
}

// ---------------------------------------------------------------------------
// ManagedService trait
// ---------------------------------------------------------------------------

/// Lifecycle-managed background service (event consumers, outbox relays).
///
/// Services are registered with a `ServiceRegistry`, initialized in
/// registration order, and shut down in reverse registration order.
#[async_trait]
pub trait ManagedService: Send + Sync {
    /// Returns the unique name of this service (e.g., `"user-consumer"`).
    fn name(&self) -> &'static str;

    /// Initialize the service with the given context.
    async fn init(&self, ctx: &ServiceContext) -> anyhow::Result<()>;

    /// Shut down the service. If `terminate` is true, skip graceful cleanup.
    async fn shutdown(&self, terminate: bool) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// ServiceRegistry
// ---------------------------------------------------------------------------

/// Registry for lifecycle-managed services, looked up by name.
pub struct ServiceRegistry {
    by_name: DashMap<&'static str, Arc<dyn ManagedService>>,
    /// Registration order for deterministic init/shutdown sequencing.
    init_order: RwLock<Vec<&'static str>>,
}

impl ServiceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_name: DashMap::new(),
            init_order: RwLock::new(Vec::new()),
        }
    }

    /// Register a service. Registration order determines init/shutdown
    /// sequencing; registering a name twice replaces the earlier service.
    pub fn register<T: ManagedService + 'static>(&self, service: T) {
        self.register_arc(Arc::new(service));
    }

    /// Register an already shared service.
    pub fn register_arc(&self, service: Arc<dyn ManagedService>) {
        let name = service.name();
        if self.by_name.insert(name, service).is_none() {
            self.init_order.write().push(name);
        }
    }

    /// Retrieve a service by its name.
    pub fn get_by_name(&self, name: &str) -> Option<Arc<dyn ManagedService>> {
        self.by_name.get(name).map(|entry| entry.value().clone())
    }

    /// Names of registered services in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.init_order.read().clone()
    }

    /// Initialize all registered services in registration order.
    ///
    /// # Errors
    ///
    /// Returns an error if any service's `init()` call fails; later services
    /// are not initialized.
    pub async fn init_all(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        let order = self.names();
        for name in &order {
            if let Some(service) = self.get_by_name(name) {
                service.init(ctx).await?;
                info!(service = name, "service initialized");
            }
        }
        Ok(())
    }

    /// Shut down all registered services in reverse registration order.
    ///
    /// Every service is shut down even if an earlier one fails.
    ///
    /// # Errors
    ///
    /// Returns the first error from a service's `shutdown()` call.
    pub async fn shutdown_all(&self, terminate: bool) -> anyhow::Result<()> {
        let order = self.names();
        let mut first_error = None;
        for name in order.iter().rev() {
            if let Some(service) = self.get_by_name(name) {
                if let Err(err) = service.shutdown(terminate).await {
                    tracing::error!(service = name, error = %err, "service shutdown failed");
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    /// Test service that tracks lifecycle calls via atomic counters.
    struct TestService {
        svc_name: &'static str,
        init_counter: AtomicU32,
        fail_shutdown: bool,
        /// Tracks global init/shutdown ordering across services.
        order_log: Arc<parking_lot::Mutex<Vec<String>>>,
    }

    impl TestService {
        fn new(name: &'static str, order_log: Arc<parking_lot::Mutex<Vec<String>>>) -> Self {
            Self {
                svc_name: name,
                init_counter: AtomicU32::new(0),
                fail_shutdown: false,
                order_log,
            }
        }
    }

    #[async_trait]
    impl ManagedService for TestService {
        fn name(&self) -> &'static str {
            self.svc_name
        }

        async fn init(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
            self.init_counter.fetch_add(1, Ordering::SeqCst);
            self.order_log
                .lock()
                .push(format!("init:{}", self.svc_name));
            Ok(())
        }

        async fn shutdown(&self, _terminate: bool) -> anyhow::Result<()> {
            self.order_log
                .lock()
                .push(format!("shutdown:{}", self.svc_name));
            if self.fail_shutdown {
                anyhow::bail!("{} failed to stop", self.svc_name);
            }
            Ok(())
        }
    }

    fn make_ctx() -> ServiceContext {
        ServiceContext {
            config: Arc::new(ServiceConfig::default()),
            shutdown: Arc::new(ShutdownController::new()),
        }
    }

    #[test]
    fn register_and_get_by_name() {
        let registry = ServiceRegistry::new();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        registry.register(TestService::new("user-consumer", log));

        let svc = registry.get_by_name("user-consumer");
        assert!(svc.is_some());
        assert_eq!(svc.unwrap().name(), "user-consumer");
        assert!(registry.get_by_name("nonexistent").is_none());
    }

    #[test]
    fn reregistering_a_name_keeps_one_slot() {
        let registry = ServiceRegistry::new();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        registry.register(TestService::new("relay", log.clone()));
        registry.register(TestService::new("relay", log));
        assert_eq!(registry.names(), vec!["relay"]);
    }

    #[tokio::test]
    async fn init_all_calls_in_registration_order() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let registry = ServiceRegistry::new();
        registry.register(TestService::new("first", log.clone()));
        registry.register(TestService::new("second", log.clone()));
        registry.register(TestService::new("third", log.clone()));

        registry.init_all(&make_ctx()).await.unwrap();

        let entries = log.lock().clone();
        assert_eq!(entries, vec!["init:first", "init:second", "init:third"]);
    }

    #[tokio::test]
    async fn shutdown_all_calls_in_reverse_order() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let registry = ServiceRegistry::new();
        registry.register(TestService::new("first", log.clone()));
        registry.register(TestService::new("second", log.clone()));
        registry.register(TestService::new("third", log.clone()));

        registry.shutdown_all(false).await.unwrap();

        let entries = log.lock().clone();
        assert_eq!(
            entries,
            vec!["shutdown:third", "shutdown:second", "shutdown:first"]
        );
    }

    #[tokio::test]
    async fn shutdown_all_continues_past_failures() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let registry = ServiceRegistry::new();
        registry.register(TestService::new("first", log.clone()));
        registry.register(TestService {
            fail_shutdown: true,
            ..TestService::new("second", log.clone())
        });

        let err = registry.shutdown_all(false).await.unwrap_err();
        assert_eq!(err.to_string(), "second failed to stop");
        assert_eq!(
            log.lock().clone(),
            vec!["shutdown:second", "shutdown:first"]
        );
    }
}
