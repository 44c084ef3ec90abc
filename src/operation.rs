//! Waiting for provider operations
//!
//! Inserting or deleting an instance returns a zonal [`Operation`] that
//! finishes asynchronously. [`OperationPoller`] blocks the caller until the
//! operation is done, has failed, or the configured timeout elapses.
//!
//! The wait is a small state machine:
//!
//! ```text
//! Pending --(errors)--> Failed
//!    |  \---(DONE)----> Done
//!    v
//! Polling --(timeout)--> TimedOut
//!    \----(refetch)----> Pending
//! ```
//!
//! `Polling` is the only suspension point, and it sleeps through a [`Clock`]
//! so tests can drive virtual time instead of waiting for real.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::compute::{ComputeService, Operation};
use crate::{Error, Result};

/// Time source for the poller
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current instant
    fn now(&self) -> Instant;

    /// Suspend for the given duration
    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by tokio timers
#[derive(Clone, Debug, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Virtual clock that only moves when slept on
///
/// Sleeping returns immediately and advances the clock by the requested
/// duration. Useful for exercising timeouts without waiting for them.
#[derive(Debug)]
pub struct ManualClock {
    start: Instant,
    elapsed: Mutex<Duration>,
}

impl ManualClock {
    /// Create a clock at virtual time zero
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
        }
    }

    /// Total virtual time slept so far
    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.start + self.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        *self.elapsed.lock().unwrap_or_else(|e| e.into_inner()) += duration;
    }
}

/// States of a single wait
#[derive(Debug)]
enum PollState {
    /// Holding a freshly fetched operation that hasn't been inspected
    Pending(Operation),
    /// Operation still running; next step sleeps then refetches
    Polling(Operation),
    /// Operation finished cleanly
    Done,
    /// Operation did not finish in time
    TimedOut {
        operation_type: String,
        name: String,
        elapsed: Duration,
    },
    /// Operation reported errors
    Failed(String),
}

/// Blocks until provider operations reach a terminal state
pub struct OperationPoller {
    compute: Arc<dyn ComputeService>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    interval: Duration,
}

impl OperationPoller {
    /// Create a poller
    pub fn new(
        compute: Arc<dyn ComputeService>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            compute,
            clock,
            timeout,
            interval,
        }
    }

    /// Wait for `operation` in `project` to finish
    ///
    /// Returns the combined operation errors as [`Error::OperationFailed`],
    /// or [`Error::OperationTimeout`] once the timeout has elapsed. Errors
    /// from refetching the operation are returned as-is.
    pub async fn wait_for_operation(&self, project: &str, operation: Operation) -> Result<()> {
        let operation_type = operation.operation_type.clone();
        let name = operation.name.clone();
        info!(operation_type = %operation_type, operation = %name, "Waiting for operation");

        let start = self.clock.now();
        let mut state = PollState::Pending(operation);

        loop {
            state = match state {
                PollState::Pending(op) => inspect(op),
                PollState::Polling(op) => self.poll(project, op, start).await?,
                PollState::Done => {
                    info!(operation_type = %operation_type, operation = %name, "Operation finished");
                    return Ok(());
                }
                PollState::Failed(message) => {
                    return Err(Error::OperationFailed(message));
                }
                PollState::TimedOut {
                    operation_type,
                    name,
                    elapsed,
                } => {
                    return Err(Error::OperationTimeout {
                        operation_type,
                        name,
                        elapsed,
                    });
                }
            };
        }
    }

    /// Sleep until the next poll (or the deadline) and refetch
    async fn poll(&self, project: &str, op: Operation, start: Instant) -> Result<PollState> {
        debug!(
            operation_type = %op.operation_type,
            operation = %op.name,
            status = %op.status,
            progress = op.progress,
            message = op.status_message.as_deref().unwrap_or_default(),
            "Operation in progress"
        );

        let elapsed = self.clock.now().saturating_duration_since(start);
        if elapsed >= self.timeout {
            return Ok(timed_out(op, elapsed));
        }

        self.clock
            .sleep(self.interval.min(self.timeout - elapsed))
            .await;

        let elapsed = self.clock.now().saturating_duration_since(start);
        if elapsed >= self.timeout {
            return Ok(timed_out(op, elapsed));
        }

        let next = self
            .compute
            .zone_operations_get(project, op.zone_name(), &op.name)
            .await?;
        Ok(PollState::Pending(next))
    }
}

/// Classify a freshly fetched operation
fn inspect(op: Operation) -> PollState {
    if let Some(message) = op.error_message() {
        PollState::Failed(message)
    } else if op.is_done() {
        PollState::Done
    } else {
        PollState::Polling(op)
    }
}

fn timed_out(op: Operation, elapsed: Duration) -> PollState {
    PollState::TimedOut {
        operation_type: op.operation_type,
        name: op.name,
        elapsed,
    }
}
