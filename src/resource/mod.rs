//! The resource-handler boundary.
//!
//! A [`ResourceHandler`] executes one enrichment request against an external
//! resource and returns a response or fails. Handlers are opaque to the
//! update engine: an LLM, a SQL database, and a human operator all sit behind
//! the same `execute(request) -> response` capability. Handler instances are
//! long-lived and shared across iQueries; a handler that needs a connection
//! pool or a rate limiter carries it internally.
//!
//! Every failure mode - timeout, transport error, rejected response - is
//! uniform at this boundary: "this attempt failed". The iQuery retry/fallback
//! machine decides what happens next.

use axum::async_trait;
use serde_json::Value;

use crate::entity::{Attributes, Entity, EntitySpec};

mod database;
mod extract;
mod human;
mod llm;

pub use database::DatabaseHandler;
pub use extract::ResponseExtractor;
pub use human::{OperatorHandler, OperatorPrompt, operator_channel};
pub use llm::{LlmConfig, LlmHandler};

////////////////////////////////////////// ResourceRequest ////////////////////////////////////////

/// One enrichment request, built from the entity under update and the iQuery
/// that wants the enrichment.
#[derive(Debug, Clone)]
pub struct ResourceRequest {
    /// Identifier of the entity being enriched.
    pub entity_id: String,
    /// The attribute a successful response will fill.
    pub target_attribute: String,
    /// Snapshot of the entity's attributes at request-build time.
    pub attributes: Attributes,
    /// Free-form iQuery parameters (prompt templates, query hints).
    pub parameters: Value,
}

impl ResourceRequest {
    /// Builds a request for `target_attribute` from the entity's current state.
    pub fn new(entity: &Entity, target_attribute: &str, parameters: &Value) -> Self {
        Self {
            entity_id: entity.id().to_string(),
            target_attribute: target_attribute.to_string(),
            attributes: entity.attributes().clone(),
            parameters: parameters.clone(),
        }
    }

    /// Renders `template`, substituting `{key}` placeholders.
    ///
    /// `{entity_id}` and `{target_attribute}` come from the request itself;
    /// every other placeholder is looked up in the attribute snapshot.
    /// String attributes substitute bare, other values as JSON. Unknown
    /// placeholders are left in place.
    pub fn render(&self, template: &str) -> String {
        let mut rendered = template.replace("{entity_id}", &self.entity_id);
        rendered = rendered.replace("{target_attribute}", &self.target_attribute);
        for (key, value) in &self.attributes {
            let placeholder = format!("{{{}}}", key);
            if !rendered.contains(&placeholder) {
                continue;
            }
            let substitution = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            rendered = rendered.replace(&placeholder, &substitution);
        }
        rendered
    }
}

///////////////////////////////////////// ResourceResponse ////////////////////////////////////////

/// A successful enrichment response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceResponse {
    /// The value to write into the target attribute.
    pub value: Value,
    /// Specifications for entities the response wants spawned.
    pub new_entities: Vec<EntitySpec>,
}

impl ResourceResponse {
    /// Wraps a bare value with no spawned entities.
    pub fn value(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            new_entities: Vec::new(),
        }
    }
}

/////////////////////////////////////////// HandlerError //////////////////////////////////////////

/// Why a handler attempt failed.
///
/// The distinctions exist for logs; the retry machine treats every variant
/// the same way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The invocation exceeded its deadline.
    Timeout,
    /// The transport failed (connection refused, HTTP error status, broken pipe).
    Transport(String),
    /// The resource answered but the response failed validation.
    Rejected(String),
    /// The resource is not reachable in this deployment (pool closed, no
    /// operator attached).
    Unavailable(String),
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "handler invocation timed out"),
            Self::Transport(msg) => write!(f, "transport error: {}", msg),
            Self::Rejected(msg) => write!(f, "response rejected: {}", msg),
            Self::Unavailable(msg) => write!(f, "resource unavailable: {}", msg),
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<reqwest::Error> for HandlerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            HandlerError::Timeout
        } else {
            HandlerError::Transport(e.to_string())
        }
    }
}

impl From<sqlx::Error> for HandlerError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut => HandlerError::Timeout,
            sqlx::Error::PoolClosed => HandlerError::Unavailable("connection pool closed".to_string()),
            other => HandlerError::Transport(other.to_string()),
        }
    }
}

////////////////////////////////////////// ResourceHandler ////////////////////////////////////////

/// The capability every external resource exposes to the update engine.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// A stable name for logs and persistence records.
    fn name(&self) -> &str;

    /// Executes one enrichment request.
    async fn execute(&self, request: &ResourceRequest) -> Result<ResourceResponse, HandlerError>;
}
