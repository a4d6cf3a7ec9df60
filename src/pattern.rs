//! Patterns: named, inheritable bundles of iQueries.
//!
//! A pattern groups iQueries so many entities can share one enrichment
//! recipe. Patterns inherit from other patterns by *name*; names resolve
//! through a [`PatternLibrary`], which is what makes a cyclic declaration
//! representable - and therefore detectable - instead of impossible to
//! construct. The library refuses to register a pattern whose parent chain
//! loops back on itself.
//!
//! A pattern is not an entity. A pattern that should itself be enriched
//! carries a `backing_entity` association naming an ordinary graph node.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::iquery::IQuery;

/////////////////////////////////////////// ConsistencyError //////////////////////////////////////

/// A pattern declaration that cannot be honored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyError {
    /// The parent chain revisits a pattern already on the active path.
    Cycle {
        /// The pattern at which the cycle was detected.
        pattern: String,
    },
    /// A parent reference does not resolve in the library.
    UnknownParent {
        /// The pattern whose parent list is broken.
        pattern: String,
        /// The name that did not resolve.
        parent: String,
    },
    /// An entity referenced a pattern that is not in the library.
    UnknownPattern {
        /// The name that did not resolve.
        pattern: String,
    },
}

impl std::fmt::Display for ConsistencyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cycle { pattern } => {
                write!(f, "cyclic inheritance detected at pattern {:?}", pattern)
            }
            Self::UnknownParent { pattern, parent } => write!(
                f,
                "pattern {:?} inherits from unknown pattern {:?}",
                pattern, parent
            ),
            Self::UnknownPattern { pattern } => {
                write!(f, "pattern {:?} is not registered", pattern)
            }
        }
    }
}

impl std::error::Error for ConsistencyError {}

////////////////////////////////////////////// Pattern ////////////////////////////////////////////

/// A named bundle of iQueries with inheritance.
#[derive(Clone)]
pub struct Pattern {
    name: String,
    own_iqueries: Vec<Arc<IQuery>>,
    parents: Vec<String>,
    backing_entity: Option<String>,
}

impl Pattern {
    /// Creates an empty pattern.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            own_iqueries: Vec::new(),
            parents: Vec::new(),
            backing_entity: None,
        }
    }

    /// The pattern's unique name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// iQueries defined directly on this pattern, in declaration order.
    pub fn own_iqueries(&self) -> &[Arc<IQuery>] {
        &self.own_iqueries
    }

    /// Names of the patterns this one inherits from, in declaration order.
    pub fn parents(&self) -> &[String] {
        &self.parents
    }

    /// The entity that represents this pattern in the graph, if any.
    pub fn backing_entity(&self) -> Option<&str> {
        self.backing_entity.as_deref()
    }

    /// Adds an iQuery. Adding a duplicate (by name) is a no-op.
    pub fn add_iquery(&mut self, iquery: Arc<IQuery>) {
        if self.own_iqueries.iter().any(|q| q.name() == iquery.name()) {
            debug!(pattern = %self.name, iquery = %iquery.name(), "duplicate iquery ignored");
            return;
        }
        self.own_iqueries.push(iquery);
    }

    /// Declares inheritance from `parent`. Duplicate declarations are no-ops.
    pub fn inherit_from(&mut self, parent: impl Into<String>) {
        let parent = parent.into();
        if self.parents.contains(&parent) {
            debug!(pattern = %self.name, parent = %parent, "duplicate parent ignored");
            return;
        }
        self.parents.push(parent);
    }

    /// Builder-style [`add_iquery`](Pattern::add_iquery).
    pub fn with_iquery(mut self, iquery: Arc<IQuery>) -> Self {
        self.add_iquery(iquery);
        self
    }

    /// Builder-style [`inherit_from`](Pattern::inherit_from).
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.inherit_from(parent);
        self
    }

    /// Associates the entity that stands for this pattern in the graph.
    pub fn with_backing_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.backing_entity = Some(entity_id.into());
        self
    }
}

impl std::fmt::Debug for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pattern")
            .field("name", &self.name)
            .field(
                "own_iqueries",
                &self
                    .own_iqueries
                    .iter()
                    .map(|q| q.name().to_string())
                    .collect::<Vec<_>>(),
            )
            .field("parents", &self.parents)
            .field("backing_entity", &self.backing_entity)
            .finish()
    }
}

/////////////////////////////////////////// PatternLibrary ////////////////////////////////////////

/// Name-to-pattern resolution for inheritance and entity assignment.
///
/// The library is the consistency boundary: [`insert`](PatternLibrary::insert)
/// validates acyclicity before a pattern becomes visible, so resolution
/// through a populated library cannot loop. Forward references are allowed -
/// a pattern may name a parent that arrives later - and stay inert until the
/// parent resolves.
#[derive(Clone, Default)]
pub struct PatternLibrary {
    patterns: HashMap<String, Arc<Pattern>>,
}

impl PatternLibrary {
    /// Creates an empty library.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates `pattern` and registers it, replacing any previous
    /// definition under the same name.
    ///
    /// # Returns
    /// * `Ok(Arc<Pattern>)` - the registered pattern
    /// * `Err(ConsistencyError::Cycle)` - the declaration would close an
    ///   inheritance cycle; the library is unchanged
    pub fn insert(&mut self, pattern: Pattern) -> Result<Arc<Pattern>, ConsistencyError> {
        self.validate_consistency(&pattern)?;
        let pattern = Arc::new(pattern);
        if self
            .patterns
            .insert(pattern.name().to_string(), Arc::clone(&pattern))
            .is_some()
        {
            debug!(pattern = %pattern.name(), "pattern definition replaced");
        }
        Ok(pattern)
    }

    /// Looks up a pattern by name.
    pub fn get(&self, name: &str) -> Option<Arc<Pattern>> {
        self.patterns.get(name).cloned()
    }

    /// Registered pattern names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.patterns.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered patterns.
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Whether the library is empty.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Checks that registering `candidate` would keep inheritance acyclic.
    ///
    /// The walk is depth-first with an explicit stack, so pathological chain
    /// depths cannot overflow the call stack, and it fails fast on the first
    /// node revisited along the active path. Parents that do not resolve yet
    /// are skipped; they are validated again when they arrive.
    pub fn validate_consistency(&self, candidate: &Pattern) -> Result<(), ConsistencyError> {
        enum Frame<'a> {
            Enter(&'a str),
            Exit(&'a str),
        }

        let mut on_path: HashSet<&str> = HashSet::new();
        let mut done: HashSet<&str> = HashSet::new();
        let mut stack = vec![Frame::Enter(candidate.name())];
        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Enter(name) => {
                    if on_path.contains(name) {
                        return Err(ConsistencyError::Cycle {
                            pattern: name.to_string(),
                        });
                    }
                    if done.contains(name) {
                        continue;
                    }
                    on_path.insert(name);
                    stack.push(Frame::Exit(name));
                    let parents = if name == candidate.name() {
                        candidate.parents()
                    } else {
                        match self.patterns.get(name) {
                            Some(pattern) => pattern.parents(),
                            None => continue,
                        }
                    };
                    for parent in parents {
                        stack.push(Frame::Enter(parent));
                    }
                }
                Frame::Exit(name) => {
                    on_path.remove(name);
                    done.insert(name);
                }
            }
        }
        Ok(())
    }

    /// Flattens `pattern` into its full iQuery sequence: each parent's
    /// effective iQueries (depth-first, in declaration order) followed by the
    /// pattern's own. Nothing is deduplicated here; callers that need
    /// uniqueness enforce it themselves.
    ///
    /// # Returns
    /// * `Err(ConsistencyError::Cycle)` - the chain loops (possible only for
    ///   a pattern that was never validated against this library)
    /// * `Err(ConsistencyError::UnknownParent)` - a parent has not arrived
    pub fn effective_iqueries(
        &self,
        pattern: &Pattern,
    ) -> Result<Vec<Arc<IQuery>>, ConsistencyError> {
        let mut out = Vec::new();
        let mut path = Vec::new();
        self.collect(pattern, &mut path, &mut out)?;
        Ok(out)
    }

    fn collect(
        &self,
        pattern: &Pattern,
        path: &mut Vec<String>,
        out: &mut Vec<Arc<IQuery>>,
    ) -> Result<(), ConsistencyError> {
        if path.iter().any(|name| name == pattern.name()) {
            return Err(ConsistencyError::Cycle {
                pattern: pattern.name().to_string(),
            });
        }
        path.push(pattern.name().to_string());
        for parent in pattern.parents() {
            let parent_pattern =
                self.get(parent)
                    .ok_or_else(|| ConsistencyError::UnknownParent {
                        pattern: pattern.name().to_string(),
                        parent: parent.clone(),
                    })?;
            self.collect(&parent_pattern, path, out)?;
        }
        out.extend(pattern.own_iqueries().iter().cloned());
        path.pop();
        Ok(())
    }
}
