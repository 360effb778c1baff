//! Deadline-bounded execution of backing-store calls.
//!
//! Every call runs on its own task and is raced against a deadline. The race
//! resolves exactly once: the caller gets the operation's value, its error,
//! or [`DeadlineExceeded`], and a late completion of an abandoned operation
//! is discarded.
//!
//! Concurrency is capped by a semaphore. A started operation holds its permit
//! until it actually finishes, so operations abandoned at their deadline
//! still count against the cap until they return.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::operation::{DeadlineExceeded, Outcome};

// ---------------------------------------------------------------------------
// BoundedExecutor
// ---------------------------------------------------------------------------

/// Runs operations under a hard deadline.
///
/// Async operations are aborted at their next suspension point when the
/// deadline passes, after their cancellation token has been triggered.
/// Blocking operations cannot be pre-empted; they receive the token and are
/// expected to check it, otherwise they run to completion in the background.
///
/// Cloning is cheap and clones share the same permit pool.
#[derive(Debug, Clone)]
pub struct BoundedExecutor {
    permits: Arc<Semaphore>,
    max_in_flight: usize,
    abandoned: Arc<AtomicUsize>,
}

impl BoundedExecutor {
    /// Creates an executor allowing at most `max_in_flight` concurrent
    /// operations. A value of 0 is treated as 1.
    #[must_use]
    pub fn new(max_in_flight: usize) -> Self {
        let max_in_flight = max_in_flight.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            abandoned: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of operations currently holding a permit.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.permits.available_permits()
    }

    /// Number of blocking operations that missed their deadline and are still running.
    #[must_use]
    pub fn abandoned(&self) -> usize {
        self.abandoned.load(Ordering::Acquire)
    }

    /// Runs an async operation under `deadline`.
    ///
    /// `operation` is called with a cancellation token that fires when the
    /// deadline passes. Waiting for a free permit counts against the deadline.
    /// A zero deadline times out without starting the operation.
    ///
    /// # Panics
    ///
    /// Resumes the operation's panic if the operation panicked.
    pub async fn execute<F, Fut, T, E>(
        &self,
        name: &'static str,
        deadline: Duration,
        operation: F,
    ) -> Outcome<T, E>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let started = Instant::now();
        let Some(permit) = self.acquire(deadline).await else {
            return self.timed_out(name, deadline, started);
        };

        let token = CancellationToken::new();
        let future = operation(token.clone());
        let mut handle = tokio::spawn(async move {
            let _permit = permit;
            future.await
        });

        let remaining = deadline.saturating_sub(started.elapsed());
        match tokio::time::timeout(remaining, &mut handle).await {
            Ok(joined) => self.resolve(name, deadline, started, joined),
            Err(_elapsed) => {
                token.cancel();
                handle.abort();
                self.timed_out(name, deadline, started)
            }
        }
    }

    /// Runs a synchronous operation on the blocking pool under `deadline`.
    ///
    /// The operation receives a token that is cancelled when the deadline
    /// passes. If the operation ignores it, the thread keeps running until
    /// the operation returns and its result is dropped.
    ///
    /// # Panics
    ///
    /// Resumes the operation's panic if the operation panicked.
    pub async fn execute_blocking<F, T, E>(
        &self,
        name: &'static str,
        deadline: Duration,
        operation: F,
    ) -> Outcome<T, E>
    where
        F: FnOnce(&CancellationToken) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let started = Instant::now();
        let Some(permit) = self.acquire(deadline).await else {
            return self.timed_out(name, deadline, started);
        };

        let token = CancellationToken::new();
        let child = token.clone();
        let mut handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            operation(&child)
        });

        let remaining = deadline.saturating_sub(started.elapsed());
        match tokio::time::timeout(remaining, &mut handle).await {
            Ok(joined) => self.resolve(name, deadline, started, joined),
            Err(_elapsed) => {
                token.cancel();
                self.track_abandoned(name, handle);
                self.timed_out(name, deadline, started)
            }
        }
    }

    async fn acquire(&self, deadline: Duration) -> Option<OwnedSemaphorePermit> {
        if deadline.is_zero() {
            return None;
        }
        match tokio::time::timeout(deadline, Arc::clone(&self.permits).acquire_owned()).await {
            Ok(Ok(permit)) => Some(permit),
            // Closed semaphore or deadline spent waiting for a permit.
            Ok(Err(_)) | Err(_) => None,
        }
    }

    fn resolve<T, E>(
        &self,
        name: &'static str,
        deadline: Duration,
        started: Instant,
        joined: Result<Result<T, E>, JoinError>,
    ) -> Outcome<T, E> {
        let outcome = match joined {
            Ok(Ok(value)) => Outcome::Success(value),
            Ok(Err(error)) => Outcome::Failure(error),
            Err(join_error) if join_error.is_panic() => {
                std::panic::resume_unwind(join_error.into_panic())
            }
            // Cancelled by runtime shutdown.
            Err(_) => {
                return self.timed_out(name, deadline, started);
            }
        };
        record(name, &outcome, started);
        if outcome.is_success() {
            debug!(operation = name, elapsed_ms = elapsed_ms(started), "operation succeeded");
        } else {
            warn!(operation = name, elapsed_ms = elapsed_ms(started), "operation failed");
        }
        outcome
    }

    fn timed_out<T, E>(
        &self,
        name: &'static str,
        deadline: Duration,
        started: Instant,
    ) -> Outcome<T, E> {
        let outcome = Outcome::TimedOut(DeadlineExceeded {
            operation: name,
            deadline,
        });
        record(name, &outcome, started);
        warn!(
            operation = name,
            deadline_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
            in_flight = self.in_flight(),
            "operation exceeded its deadline"
        );
        outcome
    }

    /// Counts a blocking operation as abandoned until its thread returns.
    fn track_abandoned<T: Send + 'static>(
        &self,
        name: &'static str,
        handle: tokio::task::JoinHandle<T>,
    ) {
        let abandoned = Arc::clone(&self.abandoned);
        set_abandoned_gauge(abandoned.fetch_add(1, Ordering::AcqRel) + 1);
        tokio::spawn(async move {
            let _ = handle.await;
            set_abandoned_gauge(abandoned.fetch_sub(1, Ordering::AcqRel) - 1);
            debug!(operation = name, "abandoned operation finished");
        });
    }
}

impl Default for BoundedExecutor {
    fn default() -> Self {
        Self::new(1024)
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn record<T, E>(name: &'static str, outcome: &Outcome<T, E>, started: Instant) {
    metrics::counter!(
        "bounded_operations_total",
        "operation" => name,
        "outcome" => outcome.label()
    )
    .increment(1);
    metrics::histogram!("bounded_operation_seconds", "operation" => name)
        .record(started.elapsed().as_secs_f64());
}

#[allow(clippy::cast_precision_loss)]
fn set_abandoned_gauge(count: usize) {
    metrics::gauge!("bounded_operations_abandoned").set(count as f64);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
