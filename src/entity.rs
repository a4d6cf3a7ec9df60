//! Entities: the nodes of the knowledge graph.
//!
//! An entity is an identifier, a mutable attribute map, a set of assigned
//! patterns contributing iQueries, and - derived from its attributes - a set
//! of references to other entities. Entities do not own their patterns or
//! iQueries; both are shared. The update engine guarantees at most one
//! in-flight update per entity, so nothing here locks: within one entity,
//! iQueries run strictly in sequence and attribute writes are last-write-wins.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::engine::GlobalState;
use crate::iquery::IQuery;
use crate::pattern::{ConsistencyError, Pattern, PatternLibrary};

/// An entity's attribute map. Insertion order is irrelevant.
pub type Attributes = HashMap<String, Value>;

/// Attribute holding the entity's outgoing reference edges.
pub const REFERENCES_ATTRIBUTE: &str = "references";

const REFACTOR_FLAG_ATTRIBUTE: &str = "needs_refactor";
const SPAWN_ATTRIBUTE: &str = "spawn";
const AUTHORITY_BOOSTS_ATTRIBUTE: &str = "authority_boosts";

////////////////////////////////////////////// EntitySpec /////////////////////////////////////////

/// A specification from which the entity factory builds a live entity.
///
/// Resource handlers return these (as JSON) to spawn entities; bootstrap
/// documents declare seed entities with the same shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySpec {
    /// Unique identifier for the new entity.
    pub id: String,
    /// Initial attributes.
    #[serde(default)]
    pub attributes: Attributes,
    /// Names of patterns to assign, in order.
    #[serde(default)]
    pub patterns: Vec<String>,
}

///////////////////////////////////////////// UpdateReport ////////////////////////////////////////

/// What one `local_update` pass did.
#[derive(Debug, Default)]
pub struct UpdateReport {
    /// iQueries whose conditions held and which were executed.
    pub executed: usize,
    /// Executions that reached `Completed`.
    pub completed: usize,
    /// Executions that reached `Failed`.
    pub failed: usize,
    /// Entity specifications produced by successful executions, for the
    /// engine to register.
    pub spawned: Vec<EntitySpec>,
}

//////////////////////////////////////////////// Entity ///////////////////////////////////////////

/// A graph node under progressive enrichment.
#[derive(Debug, Clone)]
pub struct Entity {
    id: String,
    attributes: Attributes,
    own_iqueries: Vec<Arc<IQuery>>,
    patterns: Vec<Arc<Pattern>>,
    iqueries: Vec<Arc<IQuery>>,
}

impl Entity {
    /// Creates a bare entity with no attributes or patterns.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: Attributes::new(),
            own_iqueries: Vec::new(),
            patterns: Vec::new(),
            iqueries: Vec::new(),
        }
    }

    /// The shared factory: builds an entity from a specification, resolving
    /// pattern names through the library.
    ///
    /// # Returns
    /// * `Err(ConsistencyError::UnknownPattern)` - a named pattern is not registered
    /// * `Err(ConsistencyError::UnknownParent)` - a pattern's parent has not arrived
    pub fn from_spec(spec: EntitySpec, library: &PatternLibrary) -> Result<Self, ConsistencyError> {
        let mut entity = Entity::new(spec.id);
        entity.attributes = spec.attributes;
        for name in &spec.patterns {
            let pattern = library
                .get(name)
                .ok_or_else(|| ConsistencyError::UnknownPattern {
                    pattern: name.clone(),
                })?;
            entity.add_pattern(pattern, library)?;
        }
        Ok(entity)
    }

    /// The entity's stable identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The attribute map.
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Sets (or replaces) one attribute.
    pub fn set_attribute(&mut self, key: impl Into<String>, value: Value) {
        self.attributes.insert(key.into(), value);
    }

    /// Reads one attribute.
    pub fn get_attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Removes one attribute, returning its previous value.
    pub fn remove_attribute(&mut self, key: &str) -> Option<Value> {
        self.attributes.remove(key)
    }

    /// Identifiers this entity references, extracted from the
    /// `references` attribute. Non-string elements are ignored; duplicates
    /// collapse, preserving first-seen order.
    pub fn references(&self) -> Vec<String> {
        let Some(Value::Array(items)) = self.attributes.get(REFERENCES_ATTRIBUTE) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        items
            .iter()
            .filter_map(Value::as_str)
            .filter(|r| seen.insert(r.to_string()))
            .map(String::from)
            .collect()
    }

    /// Patterns assigned to this entity, in assignment order.
    pub fn patterns(&self) -> &[Arc<Pattern>] {
        &self.patterns
    }

    /// Names of the assigned patterns, in assignment order.
    pub fn pattern_names(&self) -> Vec<String> {
        self.patterns.iter().map(|p| p.name().to_string()).collect()
    }

    /// The resolved, deduplicated iQuery sequence this entity runs each
    /// cycle: every assigned pattern flattened (parents before self), then
    /// the entity's own iQueries, first occurrence of each name winning.
    pub fn iqueries(&self) -> &[Arc<IQuery>] {
        &self.iqueries
    }

    /// Adds an iQuery directly to this entity and recomputes the resolved
    /// sequence.
    pub fn add_iquery(&mut self, iquery: Arc<IQuery>, library: &PatternLibrary) {
        if self.own_iqueries.iter().any(|q| q.name() == iquery.name()) {
            debug!(entity = %self.id, iquery = %iquery.name(), "duplicate iquery ignored");
            return;
        }
        self.own_iqueries.push(iquery);
        if let Err(error) = self.rebuild_iqueries(library) {
            warn!(entity = %self.id, %error, "iquery rebuild failed; sequence is stale");
        }
    }

    /// Assigns a pattern and recomputes the resolved iQuery sequence.
    ///
    /// The pattern must already be registered in the library; re-assigning
    /// an already-assigned pattern is a no-op.
    pub fn add_pattern(
        &mut self,
        pattern: Arc<Pattern>,
        library: &PatternLibrary,
    ) -> Result<(), ConsistencyError> {
        if library.get(pattern.name()).is_none() {
            return Err(ConsistencyError::UnknownPattern {
                pattern: pattern.name().to_string(),
            });
        }
        if self.patterns.iter().any(|p| p.name() == pattern.name()) {
            debug!(entity = %self.id, pattern = %pattern.name(), "pattern already assigned");
            return Ok(());
        }
        // Resolve before mutating so a broken pattern leaves the entity untouched.
        library.effective_iqueries(&pattern)?;
        self.patterns.push(pattern);
        self.rebuild_iqueries(library)
    }

    /// Unassigns a pattern by name and recomputes the resolved iQuery
    /// sequence. Unknown names are no-ops.
    pub fn remove_pattern(
        &mut self,
        name: &str,
        library: &PatternLibrary,
    ) -> Result<(), ConsistencyError> {
        let before = self.patterns.len();
        self.patterns.retain(|p| p.name() != name);
        if self.patterns.len() == before {
            debug!(entity = %self.id, pattern = %name, "pattern was not assigned");
            return Ok(());
        }
        self.rebuild_iqueries(library)
    }

    /// Fully recomputes the resolved iQuery sequence from the assigned
    /// patterns and own iQueries. No incremental patching: a full rebuild
    /// keeps ordering correct at the cost of revisiting every pattern.
    pub fn rebuild_iqueries(&mut self, library: &PatternLibrary) -> Result<(), ConsistencyError> {
        let mut resolved = Vec::new();
        for pattern in &self.patterns {
            resolved.extend(library.effective_iqueries(pattern)?);
        }
        resolved.extend(self.own_iqueries.iter().cloned());
        let mut seen = HashSet::new();
        self.iqueries = resolved
            .into_iter()
            .filter(|q| seen.insert(q.name().to_string()))
            .collect();
        Ok(())
    }

    /// The per-cycle update entry point: runs each resolved iQuery in
    /// sequence, gated by its condition.
    ///
    /// Successful executions have already written their target attribute;
    /// spawned entity specifications are collected into the report for the
    /// engine to register. A failed iQuery never aborts the remaining ones.
    pub async fn local_update(&mut self, global_state: &GlobalState) -> UpdateReport {
        let mut report = UpdateReport::default();
        let iqueries = self.iqueries.clone();
        for iquery in iqueries {
            if !iquery.check_conditions(self, global_state) {
                continue;
            }
            report.executed += 1;
            match iquery.execute(self).await {
                Some(outcome) => {
                    report.completed += 1;
                    report.spawned.extend(outcome.new_entities);
                }
                None => report.failed += 1,
            }
        }
        report
    }

    /// Whether the dynamic-refactor pass should touch this entity: set the
    /// `needs_refactor` attribute to `true` to request one.
    pub fn requires_refactor(&self) -> bool {
        self.attributes.get(REFACTOR_FLAG_ATTRIBUTE) == Some(&Value::Bool(true))
    }

    /// Recomputes the resolved iQuery sequence and clears the refactor flag.
    pub async fn refactor(
        &mut self,
        _global_state: &GlobalState,
        library: &PatternLibrary,
    ) -> Result<(), ConsistencyError> {
        self.rebuild_iqueries(library)?;
        self.attributes.remove(REFACTOR_FLAG_ATTRIBUTE);
        debug!(entity = %self.id, "entity refactored");
        Ok(())
    }

    /// Whether the autopoiesis pass should ask this entity for offspring:
    /// true when the `spawn` attribute holds a non-empty array.
    pub fn should_self_generate(&self) -> bool {
        matches!(
            self.attributes.get(SPAWN_ATTRIBUTE),
            Some(Value::Array(items)) if !items.is_empty()
        )
    }

    /// Drains the `spawn` attribute into entity specifications. Elements
    /// that do not parse are logged and skipped.
    pub async fn self_generate(&mut self, _global_state: &GlobalState) -> Vec<EntitySpec> {
        let Some(Value::Array(items)) = self.attributes.remove(SPAWN_ATTRIBUTE) else {
            return Vec::new();
        };
        let mut specs = Vec::new();
        for item in items {
            match serde_json::from_value::<EntitySpec>(item) {
                Ok(spec) => specs.push(spec),
                Err(error) => {
                    warn!(entity = %self.id, %error, "unparseable spawn specification skipped");
                }
            }
        }
        specs
    }

    /// The authority-smoothing hook: returns every resolved iQuery to
    /// `Pending` so definitional enrichment re-runs, and counts the boost.
    pub async fn boost_authority(&mut self, _global_state: &GlobalState) {
        for iquery in &self.iqueries {
            iquery.reset();
        }
        let boosts = self
            .attributes
            .get(AUTHORITY_BOOSTS_ATTRIBUTE)
            .and_then(Value::as_u64)
            .unwrap_or(0);
        self.attributes
            .insert(AUTHORITY_BOOSTS_ATTRIBUTE.to_string(), json!(boosts + 1));
        debug!(entity = %self.id, boosts = boosts + 1, "authority boosted");
    }
}
