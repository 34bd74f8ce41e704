//! Batch scheduler: the recurring process that advances requests through
//! donor batches as response windows elapse, and expires overdue requests.
//!
//! One tick is one pass: expire what is overdue, then for each request whose
//! window has elapsed, atomically release the open batch (a conditional flip
//! with exactly one winner, so two overlapping ticks can never advance the
//! same request twice) and hand it to the dispatcher. Cycle-level errors are
//! logged and swallowed; a store outage or one bad request never halts the
//! timer loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use tokio_util::sync::CancellationToken;

use crate::directory::DonorDirectory;
use crate::dispatch::Dispatcher;
use crate::events::{Event, EventSink};
use crate::notify::Messenger;
use crate::store::RequestStore;

/// Configuration for the scheduler loop.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SchedulerConfig {
    /// Interval between scan cycles in milliseconds.
    pub tick_interval_ms: u64,

    /// Delay before the catch-up run shortly after startup (milliseconds).
    /// Covers windows that elapsed while the process was down.
    pub startup_catchup_delay_ms: u64,

    /// Maximum due requests handled per cycle.
    pub scan_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 60_000,
            startup_catchup_delay_ms: 5_000,
            scan_limit: 100,
        }
    }
}

/// Time-driven batch advancement. No external interface beyond `run`.
pub struct Scheduler<S, D, M> {
    store: Arc<S>,
    dispatcher: Arc<Dispatcher<S, D, M>>,
    events: Arc<dyn EventSink>,
    config: SchedulerConfig,
}

impl<S, D, M> Scheduler<S, D, M>
where
    S: RequestStore + 'static,
    D: DonorDirectory + 'static,
    M: Messenger + 'static,
{
    pub fn new(
        store: Arc<S>,
        dispatcher: Arc<Dispatcher<S, D, M>>,
        events: Arc<dyn EventSink>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            events,
            config,
        }
    }

    /// Run the scheduler loop until the token is cancelled.
    pub async fn run(self: Arc<Self>, shutdown_token: CancellationToken) {
        tracing::info!(
            tick_interval_ms = self.config.tick_interval_ms,
            "Scheduler starting"
        );

        // Catch-up run shortly after startup
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(self.config.startup_catchup_delay_ms)) => {
                self.tick(Utc::now()).await;
            }
            _ = shutdown_token.cancelled() => {
                tracing::info!("Shutdown signal received before catch-up run");
                return;
            }
        }

        let mut interval = tokio::time::interval(Duration::from_millis(self.config.tick_interval_ms));
        interval.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(Utc::now()).await;
                }
                _ = shutdown_token.cancelled() => {
                    tracing::info!("Shutdown signal received, stopping scheduler");
                    break;
                }
            }
        }
    }

    /// Run one scan cycle at `now`.
    ///
    /// Public so callers (and tests) can drive cycles with an explicit clock;
    /// the loop in [`run`](Self::run) passes wall time.
    pub async fn tick(&self, now: DateTime<Utc>) {
        // Expire first so an overdue request can never be advanced or re-sent
        let expired = match self.store.expire_overdue(now).await {
            Ok(expired) => expired,
            Err(e) => {
                tracing::warn!(error = %e, "Store unavailable, skipping cycle");
                return;
            }
        };
        for request_id in expired {
            counter!("bloodline_requests_expired_total").increment(1);
            tracing::info!(request_id = %request_id, "Request expired past its deadline");
            self.events.publish(Event::RequestExpired { request_id });
        }

        let due = match self
            .store
            .due_batch_requests(now, self.config.scan_limit)
            .await
        {
            Ok(due) => due,
            Err(e) => {
                tracing::warn!(error = %e, "Store unavailable, skipping cycle");
                return;
            }
        };
        if due.is_empty() {
            tracing::trace!("No elapsed response windows");
            return;
        }

        tracing::debug!(count = due.len(), "Response windows elapsed, advancing batches");
        for request_id in due {
            // Per-request isolation: one failure never blocks the rest
            match self.store.release_elapsed_batch(request_id, now).await {
                Ok(true) => {
                    tracing::debug!(request_id = %request_id, "Released elapsed batch, dispatching next");
                    self.dispatcher.send_next_batch(request_id).await;
                }
                Ok(false) => {
                    tracing::trace!(
                        request_id = %request_id,
                        "Batch no longer due (lost the release race or request closed)"
                    );
                }
                Err(e) => {
                    tracing::error!(request_id = %request_id, error = %e, "Failed to release batch");
                }
            }
        }
    }
}
