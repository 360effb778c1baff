//! Health, liveness, and readiness endpoint handlers.
//!
//! These handlers expose server health information for orchestrators
//! (Kubernetes, load balancers) and operational monitoring.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use super::AppState;
use crate::broker::AdapterState;
use crate::network::HealthState;
use crate::service::ManagedService;

/// Returns detailed health information as JSON.
///
/// Always returns 200 -- the `state` field in the response body indicates
/// whether the server is actually healthy.
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let health = state.shutdown.health_state();
    let in_flight = state.shutdown.in_flight_count();
    let uptime_secs = state.start_time.elapsed().as_secs();
    let consumers: serde_json::Map<_, _> = state
        .consumers
        .iter()
        .map(|c| (c.name().to_string(), json!(c.state().as_str())))
        .collect();

    Json(json!({
        "state": health.as_str(),
        "in_flight": in_flight,
        "uptime_secs": uptime_secs,
        "consumers": consumers,
    }))
}

/// Kubernetes liveness probe -- always returns 200 OK.
///
/// The liveness probe only checks whether the process is running and
/// responsive, because a failed liveness probe triggers a pod restart.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Kubernetes readiness probe -- returns 200 when ready, 503 otherwise.
///
/// Ready means the server accepts requests and every consumer is consuming.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    let consuming = state
        .consumers
        .iter()
        .all(|c| c.state() == AdapterState::Consuming);
    if state.shutdown.health_state() == HealthState::Ready && consuming {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use socialstream_core::TopicPattern;

    use super::*;
    use crate::broker::{AdapterConfig, InMemoryBroker, RoutingTable};
    use crate::network::ShutdownController;
    use crate::service::{ConsumerService, DomainServices, ServiceConfig, ServiceContext};

    fn test_state(consumers: Vec<Arc<ConsumerService>>) -> AppState {
        AppState {
            services: DomainServices::default(),
            consumers,
            shutdown: Arc::new(ShutdownController::new()),
            start_time: Instant::now(),
        }
    }

    fn consumer(broker: &Arc<InMemoryBroker>) -> Arc<ConsumerService> {
        Arc::new(ConsumerService::new(
            "media-consumer",
            broker.clone(),
            AdapterConfig::new("media", "media_events", TopicPattern::new("media.#").unwrap()),
            RoutingTable::empty(),
        ))
    }

    #[tokio::test]
    async fn health_handler_returns_json_with_all_fields() {
        let broker = Arc::new(InMemoryBroker::new());
        let state = test_state(vec![consumer(&broker)]);
        state.shutdown.set_ready();

        let json = health_handler(State(state)).await.0;
        assert_eq!(json["state"], "ready");
        assert_eq!(json["in_flight"], 0);
        assert!(json["uptime_secs"].is_number());
        assert_eq!(json["consumers"]["media-consumer"], "uninitialized");
    }

    #[tokio::test]
    async fn health_handler_reports_draining_state() {
        let state = test_state(Vec::new());
        state.shutdown.set_ready();
        state.shutdown.trigger_shutdown();

        let response = health_handler(State(state)).await;
        assert_eq!(response.0["state"], "draining");
    }

    #[tokio::test]
    async fn health_handler_reports_in_flight_count() {
        let state = test_state(Vec::new());
        let _guard = state.shutdown.in_flight_guard();

        let response = health_handler(State(state)).await;
        assert_eq!(response.0["in_flight"], 1);
    }

    #[tokio::test]
    async fn liveness_handler_always_returns_200() {
        assert_eq!(liveness_handler().await, StatusCode::OK);
    }

    #[tokio::test]
    async fn readiness_handler_returns_503_when_starting() {
        let status = readiness_handler(State(test_state(Vec::new()))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn readiness_waits_for_consumers() {
        let broker = Arc::new(InMemoryBroker::new());
        let consumer = consumer(&broker);
        let state = test_state(vec![consumer.clone()]);
        state.shutdown.set_ready();
        assert_eq!(
            readiness_handler(State(state.clone())).await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        let ctx = ServiceContext {
            config: Arc::new(ServiceConfig::default()),
            shutdown: state.shutdown.clone(),
        };
        consumer.init(&ctx).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while consumer.state() != AdapterState::Consuming {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(readiness_handler(State(state.clone())).await, StatusCode::OK);

        state.shutdown.trigger_shutdown();
        assert_eq!(
            readiness_handler(State(state)).await,
            StatusCode::SERVICE_UNAVAILABLE
        );
        consumer.shutdown(false).await.unwrap();
    }
}
