//! # Accrete: Progressive Knowledge-Graph Enrichment
//!
//! Accrete maintains a mutable knowledge graph of *entities* whose
//! attributes are progressively filled in by asynchronous, potentially
//! failing enrichment operations called *iQueries*. An iQuery binds a target
//! attribute to a trigger condition and an ordered list of *resource
//! handlers* - a language model, a SQL database, a human operator - and owns
//! the retry/fallback state machine that keeps one flaky resource from
//! starving an attribute forever.
//!
//! ## Core Concepts
//!
//! ### Entities
//! An entity is an identifier plus a mutable attribute map. Entities
//! reference each other through their `references` attribute; those edges
//! form the graph that authority scoring walks.
//!
//! ### iQueries
//! A named enrichment operation. Each cycle, an eligible iQuery builds a
//! request from its entity, walks its handler list with exponential backoff
//! (retries per handler, then fallback to the next), and on success writes
//! the target attribute and optionally spawns new entities.
//!
//! ### Patterns
//! Reusable bundles of iQueries. Patterns inherit from other patterns by
//! name through a [`PatternLibrary`], which validates that inheritance stays
//! acyclic before a pattern becomes assignable.
//!
//! ### The Update Engine
//! One [`UpdateEngine`] value owns the registry of live entities and drives
//! the periodic cycle: snapshot the registry, update every entity
//! concurrently (iQueries within one entity run sequentially), join, then
//! run the optional refactor, autopoiesis, and authority-smoothing phases.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ HTTP API (axum routes)                      │
//! ├─────────────────────────────────────────────┤
//! │ UpdateEngine (registry, scheduler, HITS)    │
//! ├─────────────────────────────────────────────┤
//! │ Entity / Pattern / IQuery (domain model)    │
//! ├─────────────────────────────────────────────┤
//! │ ResourceHandler (LLM, database, operator)   │
//! ├─────────────────────────────────────────────┤
//! │ GraphStore (in-memory or PostgreSQL)        │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Usage Examples
//!
//! ### Conditions gate enrichment
//!
//! ```rust
//! use std::collections::HashMap;
//!
//! use accrete::Condition;
//! use serde_json::json;
//!
//! // Enrich only while the attribute is still missing.
//! let needs_definition = Condition::has_attribute("definition").negate();
//!
//! let mut attributes = HashMap::new();
//! let global_state = HashMap::new();
//! assert_eq!(needs_definition.evaluate(&attributes, &global_state), Ok(true));
//!
//! attributes.insert("definition".to_string(), json!("a systems language"));
//! assert_eq!(needs_definition.evaluate(&attributes, &global_state), Ok(false));
//! ```
//!
//! ### The registry keeps first writers
//!
//! ```rust
//! use accrete::{EngineConfig, Entity, UpdateEngine};
//! use serde_json::json;
//!
//! let engine = UpdateEngine::new(EngineConfig::default());
//!
//! let mut entity = Entity::new("rust");
//! entity.set_attribute("name", json!("Rust"));
//! assert!(engine.register(entity));
//!
//! // A duplicate id is a warned no-op; the original entity stays.
//! assert!(!engine.register(Entity::new("rust")));
//! assert_eq!(engine.len(), 1);
//! ```
//!
//! ### A whole engine from one document
//!
//! ```rust,no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let document = r#"
//! engine:
//!   update_interval_secs: 30
//!   authority_enabled: true
//! handlers:
//!   - kind: llm
//!     name: primary-llm
//!     model: gpt-4
//!     api_key_env: OPENAI_API_KEY
//! iqueries:
//!   - name: define
//!     target_attribute: definition
//!     handlers: [primary-llm]
//!     prompt: "Define {name} in two sentences."
//! patterns:
//!   - name: concept
//!     iqueries: [define]
//! entities:
//!   - id: rust
//!     attributes: { name: Rust }
//!     patterns: [concept]
//! "#;
//!
//! let bootstrap = accrete::bootstrap(document).await?;
//! let (shutdown, watcher) = tokio::sync::watch::channel(false);
//! bootstrap.engine.run(watcher).await;
//! # Ok(())
//! # }
//! ```

mod api;
mod authority;
mod bootstrap;
mod condition;
mod config;
mod engine;
mod entity;
mod iquery;
mod pattern;
mod resource;
mod retry;
mod store;

pub use api::{
    CreateEntityResponse, EntityView, IQueryView, StatusResponse, create_api_router,
};
pub use bootstrap::{
    Bootstrap, BootstrapDoc, BootstrapError, HandlerDecl, IQueryDecl, PatternDecl, bootstrap,
    bootstrap_with_store,
};
pub use condition::{Comparator, Condition, ConditionError};
pub use config::EngineConfig;
pub use engine::{
    AUTHORITY_ATTRIBUTE, CYCLE_STATE_KEY, EntitySlot, GlobalState, UpdateEngine,
};
pub use entity::{Attributes, Entity, EntitySpec, REFERENCES_ATTRIBUTE, UpdateReport};
pub use iquery::{DEFAULT_HANDLER_TIMEOUT, IQuery, QueryOutcome, QueryStatus};
pub use pattern::{ConsistencyError, Pattern, PatternLibrary};
pub use resource::{
    DatabaseHandler, HandlerError, LlmConfig, LlmHandler, OperatorHandler, OperatorPrompt,
    ResourceHandler, ResourceRequest, ResourceResponse, ResponseExtractor, operator_channel,
};
pub use retry::{
    DEFAULT_BACKOFF_FACTOR, DEFAULT_MAX_RETRIES, RetryPolicy, RetryState, RetryStep,
    backoff_jitter,
};
pub use store::{
    EdgeKind, EntityRecord, GraphStore, HandlerRecord, IQueryRecord, InMemoryGraphStore,
    PatternRecord, PostgresGraphStore, StoreError,
};
