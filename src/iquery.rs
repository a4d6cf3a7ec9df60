//! iQueries: named enrichment operations with retry and handler fallback.
//!
//! An iQuery binds a target attribute to a trigger condition and an ordered
//! list of resource handlers. Execution walks the handler list with
//! exponential backoff: the active handler is retried until the policy's
//! retry budget is spent, then the next handler takes over with a fresh
//! budget. Failure never escapes the iQuery - callers observe a result or an
//! absence plus the terminal status.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::condition::Condition;
use crate::engine::GlobalState;
use crate::entity::{Entity, EntitySpec};
use crate::resource::{HandlerError, ResourceHandler, ResourceRequest};
use crate::retry::{RetryPolicy, RetryState, RetryStep, backoff_jitter};

/// Deadline for a single handler invocation; expiry counts as a failed
/// attempt and folds into the retry/fallback policy.
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(15);

//////////////////////////////////////////// QueryStatus //////////////////////////////////////////

/// Where an iQuery stands in its execution state machine.
///
/// `Completed` and `Failed` are terminal for one invocation; an iQuery whose
/// condition evaluates true in a later cycle executes again from the top.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    /// Never executed since construction or the last reset.
    Pending,
    /// A handler invocation is in flight.
    Executing,
    /// The last invocation wrote the target attribute.
    Completed,
    /// The last invocation exhausted every handler.
    Failed,
    /// Waiting out a backoff delay or switching handlers.
    Retrying,
}

impl std::fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy)]
struct QueryCell {
    status: QueryStatus,
    retry: RetryState,
}

///////////////////////////////////////////// QueryOutcome ////////////////////////////////////////

/// What a successful execution produced.
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    /// The value written to the target attribute.
    pub value: Value,
    /// Specifications for entities the response wants spawned; the engine
    /// registers them at the end of the cycle.
    pub new_entities: Vec<EntitySpec>,
}

/////////////////////////////////////////////// IQuery ////////////////////////////////////////////

/// A named enrichment operation.
///
/// Status and retry count live in a synchronized cell so the HTTP surface
/// and persistence can observe an execution in flight; the execution itself
/// drives a pure [`RetryPolicy`] state machine.
pub struct IQuery {
    name: String,
    target_attribute: String,
    condition: Option<Condition>,
    parameters: Value,
    handlers: Vec<Arc<dyn ResourceHandler>>,
    policy: RetryPolicy,
    timeout: Duration,
    cell: Mutex<QueryCell>,
}

impl IQuery {
    /// Creates an iQuery over a non-empty, ordered handler list.
    ///
    /// # Returns
    /// * `Some(IQuery)` - ready to execute, status `Pending`
    /// * `None` - the handler list was empty
    pub fn new(
        name: impl Into<String>,
        target_attribute: impl Into<String>,
        handlers: Vec<Arc<dyn ResourceHandler>>,
    ) -> Option<IQuery> {
        if handlers.is_empty() {
            return None;
        }
        Some(IQuery {
            name: name.into(),
            target_attribute: target_attribute.into(),
            condition: None,
            parameters: Value::Null,
            handlers,
            policy: RetryPolicy::default(),
            timeout: DEFAULT_HANDLER_TIMEOUT,
            cell: Mutex::new(QueryCell {
                status: QueryStatus::Pending,
                retry: RetryState::default(),
            }),
        })
    }

    /// Gates execution on `condition`.
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Attaches free-form parameters (prompt templates, query hints).
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Overrides the retry/backoff policy.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Overrides the per-invocation handler timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The iQuery's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The attribute a successful execution writes.
    pub fn target_attribute(&self) -> &str {
        &self.target_attribute
    }

    /// The trigger condition, if one is set.
    pub fn condition(&self) -> Option<&Condition> {
        self.condition.as_ref()
    }

    /// The ordered handler list.
    pub fn handlers(&self) -> &[Arc<dyn ResourceHandler>] {
        &self.handlers
    }

    /// Current status.
    pub fn status(&self) -> QueryStatus {
        self.cell.lock().unwrap().status
    }

    /// Retries against the active handler since the last handler switch.
    pub fn retry_count(&self) -> u32 {
        self.cell.lock().unwrap().retry.retry_count
    }

    /// Returns the iQuery to `Pending` so the next eligible cycle executes
    /// it again. Used by the authority-boost hook.
    pub fn reset(&self) {
        self.set_state(QueryStatus::Pending, RetryState::default());
    }

    fn set_state(&self, status: QueryStatus, retry: RetryState) {
        let mut cell = self.cell.lock().unwrap();
        cell.status = status;
        cell.retry = retry;
    }

    /// Evaluates the trigger condition; an unset condition is always
    /// eligible. Evaluation errors are logged and read as "not eligible this
    /// cycle" - not an error, not a state transition.
    pub fn check_conditions(&self, entity: &Entity, global_state: &GlobalState) -> bool {
        match &self.condition {
            None => true,
            Some(condition) => match condition.evaluate(entity.attributes(), global_state) {
                Ok(eligible) => eligible,
                Err(error) => {
                    warn!(
                        iquery = %self.name,
                        entity = %entity.id(),
                        %error,
                        "condition evaluation failed; iquery skipped this cycle",
                    );
                    false
                }
            },
        }
    }

    /// Runs the enrichment to completion against `entity`.
    ///
    /// On success the target attribute is written into the entity, the
    /// status becomes `Completed`, and the outcome carries any spawned
    /// entity specifications. On exhaustion of every handler the status
    /// becomes `Failed` and `None` is returned. Errors never propagate past
    /// this boundary.
    pub async fn execute(&self, entity: &mut Entity) -> Option<QueryOutcome> {
        let mut state = RetryState::default();
        loop {
            self.set_state(QueryStatus::Executing, state);
            let handler = &self.handlers[state.handler_index];
            let request = ResourceRequest::new(entity, &self.target_attribute, &self.parameters);
            let attempt = match tokio::time::timeout(self.timeout, handler.execute(&request)).await
            {
                Ok(result) => result,
                Err(_) => Err(HandlerError::Timeout),
            };
            match attempt {
                Ok(response) => {
                    entity.set_attribute(self.target_attribute.clone(), response.value.clone());
                    self.set_state(QueryStatus::Completed, state);
                    debug!(
                        iquery = %self.name,
                        entity = %entity.id(),
                        handler = %handler.name(),
                        "iquery completed",
                    );
                    return Some(QueryOutcome {
                        value: response.value,
                        new_entities: response.new_entities,
                    });
                }
                Err(error) => {
                    warn!(
                        iquery = %self.name,
                        entity = %entity.id(),
                        handler = %handler.name(),
                        %error,
                        "handler attempt failed",
                    );
                    let (next, step) = self.policy.next_step(state, self.handlers.len());
                    state = next;
                    match step {
                        RetryStep::Backoff(base) => {
                            self.set_state(QueryStatus::Retrying, state);
                            tokio::time::sleep(base + backoff_jitter()).await;
                        }
                        RetryStep::NextHandler => {
                            self.set_state(QueryStatus::Retrying, state);
                        }
                        RetryStep::GiveUp => {
                            self.set_state(QueryStatus::Failed, state);
                            return None;
                        }
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for IQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IQuery")
            .field("name", &self.name)
            .field("target_attribute", &self.target_attribute)
            .field("status", &self.status())
            .field(
                "handlers",
                &self
                    .handlers
                    .iter()
                    .map(|h| h.name().to_string())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}
