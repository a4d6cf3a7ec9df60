//! Retry and handler-fallback policy.
//!
//! The policy is pure data and the decision procedure is a pure function, so
//! the whole retry/fallback behavior of an iQuery is testable without
//! executing a single handler. Jitter is applied only at the sleep site.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Attempts made against one handler before falling back to the next.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base of the exponential backoff schedule, in seconds.
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

/// Retry and backoff parameters for one iQuery.
///
/// After a failed attempt the policy either retries the same handler after an
/// exponential delay, advances to the next handler in the fallback list, or
/// gives up. `max_retries` counts retries against the *current* handler: each
/// handler is invoked at most `max_retries + 1` times per execution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries allowed against one handler before advancing to the next.
    pub max_retries: u32,
    /// Base of the exponential backoff schedule, in seconds.
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
        }
    }
}

/// Where an execution currently stands: which handler is active and how many
/// retries it has absorbed since the last handler switch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    /// Index of the active handler in the iQuery's ordered handler list.
    pub handler_index: usize,
    /// Retries against the active handler since the last switch.
    pub retry_count: u32,
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryStep {
    /// Sleep for the given base delay (jitter not included), then retry the
    /// same handler.
    Backoff(Duration),
    /// Advance to the next handler immediately.
    NextHandler,
    /// No retries and no handlers remain; the execution has failed.
    GiveUp,
}

impl RetryPolicy {
    /// Decides the next step after a failed attempt in `state`, for an
    /// iQuery with `handler_count` handlers.
    ///
    /// Returns the successor state alongside the step. The retry count
    /// resets to zero whenever the active handler changes.
    pub fn next_step(&self, state: RetryState, handler_count: usize) -> (RetryState, RetryStep) {
        let retry_count = state.retry_count + 1;
        if retry_count <= self.max_retries {
            let next = RetryState {
                handler_index: state.handler_index,
                retry_count,
            };
            (next, RetryStep::Backoff(self.base_delay(retry_count)))
        } else if state.handler_index + 1 < handler_count {
            let next = RetryState {
                handler_index: state.handler_index + 1,
                retry_count: 0,
            };
            (next, RetryStep::NextHandler)
        } else {
            (state, RetryStep::GiveUp)
        }
    }

    /// The backoff delay before retry number `retry_count`, without jitter.
    pub fn base_delay(&self, retry_count: u32) -> Duration {
        Duration::from_secs_f64(self.backoff_factor.powi(retry_count as i32))
    }
}

/// Uniformly drawn jitter in `[0, 1)` seconds, added to every backoff sleep
/// so concurrent iQueries retrying against one resource spread out.
pub fn backoff_jitter() -> Duration {
    Duration::from_secs_f64(rand::random::<f64>())
}
