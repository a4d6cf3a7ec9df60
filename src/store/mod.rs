//! The persistence collaborator.
//!
//! The engine treats durability as a boundary concern: after each in-memory
//! mutation it hands the matching write to a [`GraphStore`] and moves on.
//! Store failures are logged, never propagated into the update cycle.
//!
//! Two backends ship with the crate: [`InMemoryGraphStore`] for development
//! and tests, and [`PostgresGraphStore`](crate::store::PostgresGraphStore)
//! for deployments that want the graph to survive a restart.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use axum::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::condition::Condition;
use crate::entity::Attributes;
use crate::iquery::IQuery;
use crate::pattern::Pattern;

mod postgres;

pub use postgres::PostgresGraphStore;

/////////////////////////////////////////////// StoreError ////////////////////////////////////////

/// Errors that can occur during persistence operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The requested record was not found.
    NotFound,
    /// A record with the same identifier already exists.
    AlreadyExists,
    /// JSON serialization or deserialization failed.
    Serialization(String),
    /// The backend could not be reached.
    Connection(String),
    /// An internal storage error occurred.
    Internal(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "record not found"),
            Self::AlreadyExists => write!(f, "record already exists"),
            Self::Serialization(msg) => write!(f, "serialization error: {}", msg),
            Self::Connection(msg) => write!(f, "connection error: {}", msg),
            Self::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                StoreError::AlreadyExists
            }
            sqlx::Error::Io(io_err) => StoreError::Connection(io_err.to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                StoreError::Connection(e.to_string())
            }
            _ => StoreError::Internal(e.to_string()),
        }
    }
}

//////////////////////////////////////////////// Records //////////////////////////////////////////

/// A persisted entity with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// The entity identifier.
    pub id: String,
    /// The entity's attributes at the last write.
    pub attributes: Attributes,
    /// When the entity was created.
    pub created_at: DateTime<Utc>,
    /// When the entity was last updated.
    pub updated_at: DateTime<Utc>,
}

/// A persisted pattern declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRecord {
    /// The pattern's unique name.
    pub name: String,
    /// Parent pattern names, in declaration order.
    pub parents: Vec<String>,
    /// Optional backing-entity association.
    pub backing_entity: Option<String>,
}

impl From<&Pattern> for PatternRecord {
    fn from(pattern: &Pattern) -> Self {
        Self {
            name: pattern.name().to_string(),
            parents: pattern.parents().to_vec(),
            backing_entity: pattern.backing_entity().map(String::from),
        }
    }
}

/// A persisted iQuery declaration plus its last observed status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IQueryRecord {
    /// The iQuery's name.
    pub name: String,
    /// The attribute it fills.
    pub target_attribute: String,
    /// The trigger condition, if any.
    pub condition: Option<Condition>,
    /// Last observed execution status.
    pub status: String,
}

impl From<&IQuery> for IQueryRecord {
    fn from(iquery: &IQuery) -> Self {
        Self {
            name: iquery.name().to_string(),
            target_attribute: iquery.target_attribute().to_string(),
            condition: iquery.condition().cloned(),
            status: iquery.status().to_string(),
        }
    }
}

/// A persisted resource-handler declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerRecord {
    /// The handler's name.
    pub name: String,
    /// What kind of resource it fronts ("llm", "database", "operator").
    pub kind: String,
    /// Backend-specific configuration.
    pub config: Value,
}

/// Which relationship an edge record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// A pattern contains an iQuery.
    PatternIQuery,
    /// An entity is assigned a pattern.
    EntityPattern,
    /// An iQuery uses a handler.
    IQueryHandler,
}

impl EdgeKind {
    /// Stable string form used by persistent backends.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PatternIQuery => "pattern_iquery",
            Self::EntityPattern => "entity_pattern",
            Self::IQueryHandler => "iquery_handler",
        }
    }
}

/////////////////////////////////////////////// GraphStore ////////////////////////////////////////

/// CRUD over the persisted knowledge graph.
///
/// Implementors must be thread-safe; the engine calls these methods from
/// many in-flight update tasks.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Fetches an entity record.
    async fn get_entity(&self, id: &str) -> Result<Option<EntityRecord>, StoreError>;

    /// Creates an entity record.
    ///
    /// # Returns
    /// * `Err(StoreError::AlreadyExists)` - a record with this id exists
    async fn create_entity(
        &self,
        id: &str,
        attributes: Attributes,
    ) -> Result<EntityRecord, StoreError>;

    /// Merges `patch` into an entity's stored attributes and bumps its
    /// `updated_at` timestamp.
    async fn update_attributes(&self, id: &str, patch: Attributes) -> Result<(), StoreError>;

    /// Deletes an entity record and its relationship edges.
    ///
    /// # Returns
    /// * `Ok(true)` - the record existed and was deleted
    /// * `Ok(false)` - no such record
    async fn delete_entity(&self, id: &str) -> Result<bool, StoreError>;

    /// All persisted entity ids.
    async fn list_entities(&self) -> Result<Vec<String>, StoreError>;

    /// Creates or replaces a pattern record.
    async fn upsert_pattern(&self, record: PatternRecord) -> Result<(), StoreError>;

    /// Creates or replaces an iQuery record.
    async fn upsert_iquery(&self, record: IQueryRecord) -> Result<(), StoreError>;

    /// Creates or replaces a handler record.
    async fn upsert_handler(&self, record: HandlerRecord) -> Result<(), StoreError>;

    /// Records that a pattern contains an iQuery. Idempotent.
    async fn link_pattern_iquery(&self, pattern: &str, iquery: &str) -> Result<(), StoreError>;

    /// Records that an entity is assigned a pattern. Idempotent.
    async fn link_entity_pattern(&self, entity: &str, pattern: &str) -> Result<(), StoreError>;

    /// Records that an iQuery uses a handler. Idempotent.
    async fn link_iquery_handler(&self, iquery: &str, handler: &str) -> Result<(), StoreError>;
}

//////////////////////////////////////////// InMemoryGraphStore ///////////////////////////////////

/// Thread-safe in-memory implementation of [`GraphStore`].
///
/// All data lives in `Mutex<HashMap>` collections; suitable for
/// development, tests, and deployments that do not need durability.
#[derive(Default)]
pub struct InMemoryGraphStore {
    entities: Mutex<HashMap<String, EntityRecord>>,
    patterns: Mutex<HashMap<String, PatternRecord>>,
    iqueries: Mutex<HashMap<String, IQueryRecord>>,
    handlers: Mutex<HashMap<String, HandlerRecord>>,
    edges: Mutex<HashSet<(EdgeKind, String, String)>>,
}

impl InMemoryGraphStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded relationship edges; test and inspection hook.
    pub fn edges(&self) -> Vec<(EdgeKind, String, String)> {
        self.edges.lock().unwrap().iter().cloned().collect()
    }

    fn link(&self, kind: EdgeKind, src: &str, dst: &str) {
        self.edges
            .lock()
            .unwrap()
            .insert((kind, src.to_string(), dst.to_string()));
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn get_entity(&self, id: &str) -> Result<Option<EntityRecord>, StoreError> {
        Ok(self.entities.lock().unwrap().get(id).cloned())
    }

    async fn create_entity(
        &self,
        id: &str,
        attributes: Attributes,
    ) -> Result<EntityRecord, StoreError> {
        let mut entities = self.entities.lock().unwrap();
        if entities.contains_key(id) {
            return Err(StoreError::AlreadyExists);
        }
        let now = Utc::now();
        let record = EntityRecord {
            id: id.to_string(),
            attributes,
            created_at: now,
            updated_at: now,
        };
        entities.insert(id.to_string(), record.clone());
        Ok(record)
    }

    async fn update_attributes(&self, id: &str, patch: Attributes) -> Result<(), StoreError> {
        let mut entities = self.entities.lock().unwrap();
        let record = entities.get_mut(id).ok_or(StoreError::NotFound)?;
        record.attributes.extend(patch);
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_entity(&self, id: &str) -> Result<bool, StoreError> {
        let existed = self.entities.lock().unwrap().remove(id).is_some();
        if existed {
            self.edges
                .lock()
                .unwrap()
                .retain(|(kind, src, _)| !(*kind == EdgeKind::EntityPattern && src == id));
        }
        Ok(existed)
    }

    async fn list_entities(&self) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self.entities.lock().unwrap().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn upsert_pattern(&self, record: PatternRecord) -> Result<(), StoreError> {
        self.patterns
            .lock()
            .unwrap()
            .insert(record.name.clone(), record);
        Ok(())
    }

    async fn upsert_iquery(&self, record: IQueryRecord) -> Result<(), StoreError> {
        self.iqueries
            .lock()
            .unwrap()
            .insert(record.name.clone(), record);
        Ok(())
    }

    async fn upsert_handler(&self, record: HandlerRecord) -> Result<(), StoreError> {
        self.handlers
            .lock()
            .unwrap()
            .insert(record.name.clone(), record);
        Ok(())
    }

    async fn link_pattern_iquery(&self, pattern: &str, iquery: &str) -> Result<(), StoreError> {
        self.link(EdgeKind::PatternIQuery, pattern, iquery);
        Ok(())
    }

    async fn link_entity_pattern(&self, entity: &str, pattern: &str) -> Result<(), StoreError> {
        self.link(EdgeKind::EntityPattern, entity, pattern);
        Ok(())
    }

    async fn link_iquery_handler(&self, iquery: &str, handler: &str) -> Result<(), StoreError> {
        self.link(EdgeKind::IQueryHandler, iquery, handler);
        Ok(())
    }
}
