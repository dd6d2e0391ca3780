//! Metrics for observability
//!
//! Instrumentation goes through the `metrics` facade; installing a recorder
//! is left to the embedding application.

use metrics::{describe_counter, describe_gauge, describe_histogram, histogram};
use std::time::Instant;

/// Initialize metrics with descriptions
pub fn init_metrics() {
    // Membership metrics
    describe_counter!(
        "membership.handles.opened",
        "Per-group subscription slots opened by the reconciler"
    );
    describe_counter!(
        "membership.handles.closed",
        "Per-group subscription slots closed by the reconciler"
    );
    describe_gauge!(
        "membership.handles.open",
        "Per-group subscription slots currently held"
    );
    describe_histogram!(
        "membership.operation.duration_ms",
        "Duration of membership store transactions in milliseconds"
    );

    // Session metrics
    describe_counter!(
        "session.exchange.success",
        "Magic codes successfully exchanged for a session"
    );
    describe_counter!(
        "session.exchange.failed",
        "Magic code exchanges rejected by the server or the auth service"
    );

    // Store metrics
    describe_counter!("store.transactions", "Transactions applied by the in-memory store");
}

/// Timer for measuring operation duration
pub struct Timer {
    name: &'static str,
    start: Instant,
}

impl Timer {
    /// Create a new timer
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }

    /// Stop the timer and record the duration
    pub fn stop(self) {
        let duration = self.start.elapsed();
        histogram!(self.name).record(duration.as_secs_f64() * 1000.0);
    }
}
