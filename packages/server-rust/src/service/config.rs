use std::time::Duration;

use socialstream_core::ContentType;

/// Service-level configuration shared by domain services, consumers and relays.
///
/// Controls operation deadlines, the in-flight operation cap, and outbox relay pacing.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Deadline for a single backing-store call.
    pub store_deadline: Duration,
    /// Deadline for password hashing and verification.
    pub hash_deadline: Duration,
    /// Maximum number of bounded operations running at once, including
    /// operations that were abandoned at their deadline but have not finished.
    pub max_in_flight_operations: usize,
    /// Interval between outbox relay passes.
    pub outbox_poll_interval: Duration,
    /// Maximum number of outbox events published per relay pass.
    pub outbox_batch_size: usize,
    /// Publish attempts after which an outbox event is no longer retried.
    pub outbox_max_attempts: u32,
    /// Content type used when encoding published events.
    pub content_type: ContentType,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            store_deadline: Duration::from_millis(500),
            hash_deadline: Duration::from_millis(5000),
            max_in_flight_operations: 1024,
            outbox_poll_interval: Duration::from_millis(250),
            outbox_batch_size: 100,
            outbox_max_attempts: 5,
            content_type: ContentType::Json,
        }
    }
}
