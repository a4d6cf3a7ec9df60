//! Bootstrap documents: declarative seeds for a whole engine.
//!
//! A single YAML document declares the engine configuration, the resource
//! handlers, the iQueries over them, the patterns bundling those iQueries,
//! and the seed entities. [`bootstrap`] materializes the document into a
//! running-ready [`UpdateEngine`], validating every cross-reference on the
//! way in so a typo fails at startup instead of mid-cycle.
//!
//! ```yaml
//! engine:
//!   update_interval_secs: 30
//!   authority_enabled: true
//! handlers:
//!   - kind: llm
//!     name: primary-llm
//!     model: gpt-4
//!     api_key_env: OPENAI_API_KEY
//!   - kind: operator
//!     name: curator
//! iqueries:
//!   - name: define
//!     target_attribute: definition
//!     handlers: [primary-llm, curator]
//!     prompt: "Define {name} in two sentences."
//!     condition:
//!       type: not
//!       condition: { type: attribute, key: definition, comparator: exists }
//! patterns:
//!   - name: concept
//!     iqueries: [define]
//! entities:
//!   - id: rust
//!     attributes: { name: Rust }
//!     patterns: [concept]
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::condition::Condition;
use crate::config::EngineConfig;
use crate::engine::UpdateEngine;
use crate::entity::{Entity, EntitySpec};
use crate::iquery::IQuery;
use crate::pattern::{ConsistencyError, Pattern};
use crate::resource::{
    DatabaseHandler, LlmConfig, LlmHandler, OperatorPrompt, ResourceHandler, operator_channel,
};
use crate::store::{GraphStore, HandlerRecord};

const DEFAULT_OPERATOR_CAPACITY: usize = 16;

fn default_operator_capacity() -> usize {
    DEFAULT_OPERATOR_CAPACITY
}

/////////////////////////////////////////////// Document //////////////////////////////////////////

/// The parsed shape of a bootstrap document.
#[derive(Debug, Deserialize)]
pub struct BootstrapDoc {
    /// Engine configuration; defaults apply for missing fields.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Resource handler declarations.
    #[serde(default)]
    pub handlers: Vec<HandlerDecl>,
    /// iQuery declarations.
    #[serde(default)]
    pub iqueries: Vec<IQueryDecl>,
    /// Pattern declarations.
    #[serde(default)]
    pub patterns: Vec<PatternDecl>,
    /// Seed entities.
    #[serde(default)]
    pub entities: Vec<EntitySpec>,
}

impl BootstrapDoc {
    /// Parses a YAML bootstrap document.
    pub fn parse(document: &str) -> Result<Self, BootstrapError> {
        serde_yml::from_str(document).map_err(|e| BootstrapError::Parse(e.to_string()))
    }
}

/// One resource handler, tagged by kind.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HandlerDecl {
    /// An OpenAI-compatible chat-completions handler.
    Llm {
        /// Handler name, referenced by iQueries.
        name: String,
        /// Connection and sampling parameters.
        #[serde(flatten)]
        config: LlmConfig,
        /// Environment variable holding the API key; overrides any inline key.
        api_key_env: Option<String>,
    },
    /// A PostgreSQL lookup handler.
    Database {
        /// Handler name, referenced by iQueries.
        name: String,
        /// Connection URL; `url_env` takes precedence when both are set.
        url: Option<String>,
        /// Environment variable holding the connection URL.
        url_env: Option<String>,
        /// The lookup query; `$1` binds the entity id.
        query: String,
    },
    /// A human-operator queue handler.
    Operator {
        /// Handler name, referenced by iQueries.
        name: String,
        /// Bound of the pending-prompt queue.
        #[serde(default = "default_operator_capacity")]
        capacity: usize,
    },
}

impl HandlerDecl {
    fn name(&self) -> &str {
        match self {
            Self::Llm { name, .. } | Self::Database { name, .. } | Self::Operator { name, .. } => {
                name
            }
        }
    }
}

/// One iQuery declaration.
#[derive(Debug, Deserialize)]
pub struct IQueryDecl {
    /// The iQuery's name, referenced by patterns.
    pub name: String,
    /// The attribute a successful execution writes.
    pub target_attribute: String,
    /// Handler names, tried in order.
    pub handlers: Vec<String>,
    /// Optional trigger condition.
    #[serde(default)]
    pub condition: Option<Condition>,
    /// Shorthand for `parameters.prompt`.
    #[serde(default)]
    pub prompt: Option<String>,
    /// Free-form parameters passed to handlers.
    #[serde(default)]
    pub parameters: Option<Value>,
}

/// One pattern declaration.
#[derive(Debug, Deserialize)]
pub struct PatternDecl {
    /// The pattern's unique name.
    pub name: String,
    /// Names of iQueries this pattern bundles.
    #[serde(default)]
    pub iqueries: Vec<String>,
    /// Parent pattern names.
    #[serde(default)]
    pub parents: Vec<String>,
    /// Optional backing-entity association.
    #[serde(default)]
    pub backing_entity: Option<String>,
}

///////////////////////////////////////////// BootstrapError //////////////////////////////////////

/// Why a bootstrap document could not be materialized.
#[derive(Debug)]
pub enum BootstrapError {
    /// The document is not valid YAML for the expected shape.
    Parse(String),
    /// An iQuery referenced a handler that was not declared.
    UnknownHandler {
        /// The referencing iQuery.
        iquery: String,
        /// The missing handler name.
        handler: String,
    },
    /// A pattern referenced an iQuery that was not declared.
    UnknownIQuery {
        /// The referencing pattern.
        pattern: String,
        /// The missing iQuery name.
        iquery: String,
    },
    /// An iQuery was declared with no handlers.
    NoHandlers(String),
    /// A declared environment variable is not set.
    MissingCredential(String),
    /// A pattern or entity declaration is inconsistent.
    Consistency(ConsistencyError),
    /// A database-backed handler could not connect.
    Database(String),
}

impl std::fmt::Display for BootstrapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(msg) => write!(f, "unparseable bootstrap document: {}", msg),
            Self::UnknownHandler { iquery, handler } => {
                write!(f, "iquery {:?} references unknown handler {:?}", iquery, handler)
            }
            Self::UnknownIQuery { pattern, iquery } => {
                write!(f, "pattern {:?} references unknown iquery {:?}", pattern, iquery)
            }
            Self::NoHandlers(iquery) => {
                write!(f, "iquery {:?} declares no handlers", iquery)
            }
            Self::MissingCredential(var) => {
                write!(f, "environment variable {:?} is not set", var)
            }
            Self::Consistency(error) => write!(f, "{}", error),
            Self::Database(msg) => write!(f, "database handler: {}", msg),
        }
    }
}

impl std::error::Error for BootstrapError {}

impl From<ConsistencyError> for BootstrapError {
    fn from(e: ConsistencyError) -> Self {
        BootstrapError::Consistency(e)
    }
}

////////////////////////////////////////////// Bootstrap //////////////////////////////////////////

/// A materialized bootstrap document.
pub struct Bootstrap {
    /// The engine, seeded and ready for [`run`](UpdateEngine::run).
    pub engine: Arc<UpdateEngine>,
    /// The receiving ends of every declared operator queue, by handler name.
    pub operator_inboxes: Vec<(String, mpsc::Receiver<OperatorPrompt>)>,
}

/// Materializes a bootstrap document into an engine with no persistence.
pub async fn bootstrap(document: &str) -> Result<Bootstrap, BootstrapError> {
    bootstrap_with_store(document, None).await
}

/// Materializes a bootstrap document, attaching `store` when given.
pub async fn bootstrap_with_store(
    document: &str,
    store: Option<Arc<dyn GraphStore>>,
) -> Result<Bootstrap, BootstrapError> {
    let doc = BootstrapDoc::parse(document)?;
    let mut engine = UpdateEngine::new(doc.engine.clone());
    if let Some(store) = &store {
        engine = engine.with_store(Arc::clone(store));
    }
    let engine = Arc::new(engine);

    let mut handlers: HashMap<String, Arc<dyn ResourceHandler>> = HashMap::new();
    let mut operator_inboxes = Vec::new();
    for decl in &doc.handlers {
        let (handler, record): (Arc<dyn ResourceHandler>, HandlerRecord) = match decl {
            HandlerDecl::Llm {
                name,
                config,
                api_key_env,
            } => {
                let mut config = config.clone();
                if let Some(var) = api_key_env {
                    config.api_key = std::env::var(var)
                        .map_err(|_| BootstrapError::MissingCredential(var.clone()))?;
                }
                let record = HandlerRecord {
                    name: name.clone(),
                    kind: "llm".to_string(),
                    config: json!({"endpoint": config.endpoint, "model": config.model}),
                };
                (Arc::new(LlmHandler::new(name.clone(), config)), record)
            }
            HandlerDecl::Database {
                name,
                url,
                url_env,
                query,
            } => {
                let url = match (url_env, url) {
                    (Some(var), _) => std::env::var(var)
                        .map_err(|_| BootstrapError::MissingCredential(var.clone()))?,
                    (None, Some(url)) => url.clone(),
                    (None, None) => {
                        return Err(BootstrapError::Database(format!(
                            "handler {:?} declares neither url nor url_env",
                            name
                        )));
                    }
                };
                let handler = DatabaseHandler::connect(name.clone(), &url, query.clone())
                    .await
                    .map_err(|e| BootstrapError::Database(e.to_string()))?;
                let record = HandlerRecord {
                    name: name.clone(),
                    kind: "database".to_string(),
                    config: json!({"query": query}),
                };
                (Arc::new(handler), record)
            }
            HandlerDecl::Operator { name, capacity } => {
                let (handler, inbox) = operator_channel(name.clone(), *capacity);
                operator_inboxes.push((name.clone(), inbox));
                let record = HandlerRecord {
                    name: name.clone(),
                    kind: "operator".to_string(),
                    config: json!({"capacity": capacity}),
                };
                (Arc::new(handler), record)
            }
        };
        if let Some(store) = &store {
            if let Err(error) = store.upsert_handler(record).await {
                warn!(handler = %decl.name(), %error, "handler persistence failed");
            }
        }
        handlers.insert(decl.name().to_string(), handler);
    }

    let mut iqueries: HashMap<String, Arc<IQuery>> = HashMap::new();
    for decl in &doc.iqueries {
        let mut resolved = Vec::with_capacity(decl.handlers.len());
        for handler_name in &decl.handlers {
            let handler =
                handlers
                    .get(handler_name)
                    .ok_or_else(|| BootstrapError::UnknownHandler {
                        iquery: decl.name.clone(),
                        handler: handler_name.clone(),
                    })?;
            resolved.push(Arc::clone(handler));
        }
        let mut iquery = IQuery::new(decl.name.clone(), decl.target_attribute.clone(), resolved)
            .ok_or_else(|| BootstrapError::NoHandlers(decl.name.clone()))?
            .with_policy(doc.engine.retry_policy())
            .with_timeout(doc.engine.handler_timeout())
            .with_parameters(merge_parameters(decl));
        if let Some(condition) = &decl.condition {
            iquery = iquery.with_condition(condition.clone());
        }
        iqueries.insert(decl.name.clone(), Arc::new(iquery));
    }

    for decl in &doc.patterns {
        let mut pattern = Pattern::new(decl.name.clone());
        for iquery_name in &decl.iqueries {
            let iquery =
                iqueries
                    .get(iquery_name)
                    .ok_or_else(|| BootstrapError::UnknownIQuery {
                        pattern: decl.name.clone(),
                        iquery: iquery_name.clone(),
                    })?;
            pattern.add_iquery(Arc::clone(iquery));
        }
        for parent in &decl.parents {
            pattern.inherit_from(parent.clone());
        }
        if let Some(backing) = &decl.backing_entity {
            pattern = pattern.with_backing_entity(backing.clone());
        }
        engine.add_pattern(pattern)?;
    }

    let library = engine.pattern_library();
    for spec in doc.entities {
        let entity = Entity::from_spec(spec, &library)?;
        engine.register(entity);
    }

    info!(
        handlers = handlers.len(),
        iqueries = iqueries.len(),
        patterns = doc.patterns.len(),
        entities = engine.len(),
        "bootstrap complete",
    );
    Ok(Bootstrap {
        engine,
        operator_inboxes,
    })
}

fn merge_parameters(decl: &IQueryDecl) -> Value {
    let mut parameters = match &decl.parameters {
        Some(Value::Object(fields)) => fields.clone(),
        Some(other) => {
            warn!(iquery = %decl.name, "non-object parameters replaced with an object");
            let mut fields = Map::new();
            fields.insert("value".to_string(), other.clone());
            fields
        }
        None => Map::new(),
    };
    if let Some(prompt) = &decl.prompt {
        parameters.insert("prompt".to_string(), Value::String(prompt.clone()));
    }
    if parameters.is_empty() {
        Value::Null
    } else {
        Value::Object(parameters)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const DOCUMENT: &str = r#"
engine:
  update_interval_secs: 5
  max_retries: 1
handlers:
  - kind: operator
    name: curator
    capacity: 4
  - kind: llm
    name: primary-llm
    model: test-model
    api_key: inline-key
iqueries:
  - name: define
    target_attribute: definition
    handlers: [curator]
    prompt: "Define {name}."
    condition:
      type: not
      condition: { type: attribute, key: definition, comparator: exists }
patterns:
  - name: concept
    iqueries: [define]
entities:
  - id: rust
    attributes: { name: Rust }
    patterns: [concept]
"#;

    #[tokio::test]
    async fn document_materializes_into_an_engine() {
        let bootstrap = bootstrap(DOCUMENT).await.unwrap();
        let engine = &bootstrap.engine;
        assert_eq!(engine.config().update_interval_secs, 5);
        assert_eq!(engine.pattern_names(), vec!["concept".to_string()]);
        assert_eq!(engine.entity_ids(), vec!["rust".to_string()]);
        assert_eq!(bootstrap.operator_inboxes.len(), 1);

        let slot = engine.get("rust").unwrap();
        let entity = slot.lock().await;
        assert_eq!(entity.get_attribute("name"), Some(&json!("Rust")));
        assert_eq!(entity.iqueries().len(), 1);
        assert_eq!(entity.iqueries()[0].name(), "define");
    }

    #[tokio::test]
    async fn seeded_entity_answers_through_the_operator_queue() {
        let mut bootstrap = bootstrap(DOCUMENT).await.unwrap();
        let (_, mut inbox) = bootstrap.operator_inboxes.pop().unwrap();
        let responder = tokio::spawn(async move {
            let prompt = inbox.recv().await.unwrap();
            assert_eq!(prompt.prompt, "Define Rust.");
            prompt.respond("A systems language.").unwrap();
        });

        bootstrap.engine.run_cycle().await;
        responder.await.unwrap();

        let slot = bootstrap.engine.get("rust").unwrap();
        let entity = slot.lock().await;
        assert_eq!(
            entity.get_attribute("definition"),
            Some(&json!("A systems language."))
        );
    }

    #[tokio::test]
    async fn unknown_handler_reference_fails() {
        let doc = r#"
iqueries:
  - name: define
    target_attribute: definition
    handlers: [nobody]
"#;
        assert!(matches!(
            bootstrap(doc).await,
            Err(BootstrapError::UnknownHandler { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_iquery_reference_fails() {
        let doc = r#"
patterns:
  - name: concept
    iqueries: [define]
"#;
        assert!(matches!(
            bootstrap(doc).await,
            Err(BootstrapError::UnknownIQuery { .. })
        ));
    }

    #[tokio::test]
    async fn cyclic_patterns_fail() {
        let doc = r#"
patterns:
  - name: a
    parents: [b]
  - name: b
    parents: [a]
"#;
        assert!(matches!(
            bootstrap(doc).await,
            Err(BootstrapError::Consistency(ConsistencyError::Cycle { .. }))
        ));
    }

    #[tokio::test]
    async fn entity_with_unknown_pattern_fails() {
        let doc = r#"
entities:
  - id: rust
    patterns: [concept]
"#;
        assert!(matches!(
            bootstrap(doc).await,
            Err(BootstrapError::Consistency(
                ConsistencyError::UnknownPattern { .. }
            ))
        ));
    }

    #[tokio::test]
    async fn garbage_documents_fail_to_parse() {
        assert!(matches!(
            bootstrap(": not yaml : [").await,
            Err(BootstrapError::Parse(_))
        ));
    }
}
