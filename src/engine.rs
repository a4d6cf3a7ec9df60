//! The update engine: entity registry, periodic scheduler, and the
//! authority feedback loop.
//!
//! One [`UpdateEngine`] value owns the live entity set, the pattern library,
//! and the global-state map; every component that needs registration or
//! global-state lookup receives the engine explicitly - there is no hidden
//! singleton. The engine's cycle fans out per-entity update tasks with
//! bounded concurrency, joins on all of them, then runs the optional
//! refactor, autopoiesis, and authority phases.
//!
//! Concurrency model: entities update concurrently with each other, iQueries
//! within one entity run sequentially, and at most one update task per
//! entity is in flight at any time - a second attempt while one is
//! outstanding is skipped, not queued. The registry is the one piece of
//! shared mutable state and sits behind a mutex; entity state sits behind a
//! per-entity async mutex that the cycle acquires with `try_lock`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde_json::{Value, json};
use tokio::sync::{Mutex as AsyncMutex, Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::authority::authority_scores;
use crate::config::EngineConfig;
use crate::entity::{Entity, EntitySpec};
use crate::pattern::{ConsistencyError, Pattern, PatternLibrary};
use crate::store::{GraphStore, IQueryRecord, PatternRecord};

/// The process-wide mapping available read-only to condition evaluation
/// during one cycle; written only by the engine between cycles.
pub type GlobalState = HashMap<String, Value>;

/// Attribute the authority phase writes back into each entity.
pub const AUTHORITY_ATTRIBUTE: &str = "authority";

/// Global-state key holding the number of completed cycles.
pub const CYCLE_STATE_KEY: &str = "cycle";

/// A registered entity slot. The async mutex enforces single-writer-per-entity.
pub type EntitySlot = Arc<AsyncMutex<Entity>>;

/////////////////////////////////////////// UpdateEngine //////////////////////////////////////////

/// Registry plus scheduler plus authority feedback loop.
pub struct UpdateEngine {
    registry: Mutex<HashMap<String, EntitySlot>>,
    patterns: RwLock<PatternLibrary>,
    global_state: RwLock<GlobalState>,
    config: EngineConfig,
    store: Option<Arc<dyn GraphStore>>,
    limiter: Arc<Semaphore>,
    cycles: AtomicU64,
}

impl UpdateEngine {
    /// Creates an engine with an empty registry, library, and global state.
    pub fn new(config: EngineConfig) -> Self {
        let limiter = Arc::new(Semaphore::new(config.max_concurrent_updates.max(1)));
        Self {
            registry: Mutex::new(HashMap::new()),
            patterns: RwLock::new(PatternLibrary::new()),
            global_state: RwLock::new(GlobalState::new()),
            config,
            store: None,
            limiter,
            cycles: AtomicU64::new(0),
        }
    }

    /// Attaches a persistence collaborator. Writes are best-effort: a
    /// failing store is logged and never aborts a cycle.
    pub fn with_store(mut self, store: Arc<dyn GraphStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// The engine's configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Completed global update cycles.
    pub fn cycles_completed(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    //////////////////////////////////////// global state /////////////////////////////////////////

    /// Snapshot of the global-state map.
    pub fn global_state(&self) -> GlobalState {
        self.global_state.read().unwrap().clone()
    }

    /// Writes one global-state entry. Meant for between-cycle use; values
    /// written mid-cycle are not seen until the next cycle's snapshot.
    pub fn set_global(&self, key: impl Into<String>, value: Value) {
        self.global_state.write().unwrap().insert(key.into(), value);
    }

    ///////////////////////////////////////// patterns ////////////////////////////////////////////

    /// Validates and registers a pattern, making it assignable to entities.
    ///
    /// # Returns
    /// * `Err(ConsistencyError::Cycle)` - the declaration would close an
    ///   inheritance cycle; nothing is registered
    pub fn add_pattern(&self, pattern: Pattern) -> Result<Arc<Pattern>, ConsistencyError> {
        let pattern = {
            let mut library = self.patterns.write().unwrap();
            library.insert(pattern)?
        };
        if let Some(store) = &self.store {
            let store = Arc::clone(store);
            let record = PatternRecord::from(pattern.as_ref());
            let iqueries: Vec<IQueryRecord> = pattern
                .own_iqueries()
                .iter()
                .map(|q| IQueryRecord::from(q.as_ref()))
                .collect();
            let handler_links: Vec<(String, String)> = pattern
                .own_iqueries()
                .iter()
                .flat_map(|q| {
                    let iquery = q.name().to_string();
                    q.handlers()
                        .iter()
                        .map(move |h| (iquery.clone(), h.name().to_string()))
                })
                .collect();
            self.spawn_persist(async move {
                let pattern_name = record.name.clone();
                store.upsert_pattern(record).await?;
                for iquery in iqueries {
                    let iquery_name = iquery.name.clone();
                    store.upsert_iquery(iquery).await?;
                    store.link_pattern_iquery(&pattern_name, &iquery_name).await?;
                }
                for (iquery, handler) in handler_links {
                    store.link_iquery_handler(&iquery, &handler).await?;
                }
                Ok(())
            });
        }
        Ok(pattern)
    }

    /// A point-in-time copy of the pattern library.
    pub fn pattern_library(&self) -> PatternLibrary {
        self.patterns.read().unwrap().clone()
    }

    /// Registered pattern names, sorted.
    pub fn pattern_names(&self) -> Vec<String> {
        self.patterns.read().unwrap().names()
    }

    ///////////////////////////////////////// registry ////////////////////////////////////////////

    /// Registers an entity under its id.
    ///
    /// A duplicate id is a no-op that logs a warning and leaves the existing
    /// entity untouched. Safe to call from in-flight update tasks.
    ///
    /// # Returns
    /// * `true` - the entity is now registered
    /// * `false` - an entity with this id already existed
    pub fn register(&self, entity: Entity) -> bool {
        let id = entity.id().to_string();
        let attributes = entity.attributes().clone();
        let pattern_names = entity.pattern_names();
        {
            let mut registry = self.registry.lock().unwrap();
            if registry.contains_key(&id) {
                warn!(entity = %id, "entity already registered; registration skipped");
                return false;
            }
            registry.insert(id.clone(), Arc::new(AsyncMutex::new(entity)));
            debug!(entity = %id, total = registry.len(), "entity registered");
        }
        if let Some(store) = &self.store {
            let store = Arc::clone(store);
            self.spawn_persist(async move {
                store.create_entity(&id, attributes).await?;
                for pattern in &pattern_names {
                    store.link_entity_pattern(&id, pattern).await?;
                }
                Ok(())
            });
        }
        true
    }

    /// Builds an entity from a specification via the shared factory and
    /// registers it. Specifications that do not resolve are logged and
    /// dropped.
    pub fn register_spec(&self, spec: EntitySpec) -> bool {
        let library = self.pattern_library();
        match Entity::from_spec(spec, &library) {
            Ok(entity) => self.register(entity),
            Err(error) => {
                warn!(%error, "entity specification rejected");
                false
            }
        }
    }

    /// Removes an entity from the live set. Unknown ids are no-ops. An
    /// in-flight update task holding the entity's slot finishes unhindered;
    /// the record is simply no longer reachable from the registry.
    pub fn unregister(&self, id: &str) -> bool {
        let removed = self.registry.lock().unwrap().remove(id).is_some();
        if removed {
            debug!(entity = %id, "entity unregistered");
            if let Some(store) = &self.store {
                let store = Arc::clone(store);
                let id = id.to_string();
                self.spawn_persist(async move {
                    store.delete_entity(&id).await?;
                    Ok(())
                });
            }
        }
        removed
    }

    /// Looks up an entity slot by id.
    pub fn get(&self, id: &str) -> Option<EntitySlot> {
        self.registry.lock().unwrap().get(id).cloned()
    }

    /// Registered entity ids, sorted.
    pub fn entity_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.registry.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        self.registry.lock().unwrap().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.registry.lock().unwrap().is_empty()
    }

    /// A stable snapshot of the registry. Entities registered after the
    /// snapshot is taken are picked up by the next one.
    pub fn snapshot(&self) -> Vec<(String, EntitySlot)> {
        self.registry
            .lock()
            .unwrap()
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect()
    }

    ////////////////////////////////////////// the cycle //////////////////////////////////////////

    /// Runs one full cycle: the concurrent update pass, then whichever of
    /// the refactor/autopoiesis/authority phases the configuration enables.
    pub async fn run_cycle(&self) {
        self.run_phases(&|| false).await;
    }

    async fn run_phases(&self, should_stop: &(dyn Fn() -> bool + Sync)) {
        debug!(cycle = self.cycles_completed() + 1, "starting global update cycle");
        self.update_pass().await;
        if should_stop() {
            return;
        }
        if self.config.refactor_enabled {
            self.refactor_pass().await;
            if should_stop() {
                return;
            }
        }
        if self.config.autopoiesis_enabled {
            self.autopoiesis_pass().await;
            if should_stop() {
                return;
            }
        }
        if self.config.authority_enabled {
            self.smooth_authority().await;
        }
        let completed = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_global(CYCLE_STATE_KEY, json!(completed));
        debug!(cycle = completed, "global update cycle completed");
    }

    /// Drives the periodic cycle until `shutdown` observes `true` (or its
    /// sender drops). Cancellation takes effect between phases; an in-flight
    /// per-entity task runs to completion once started.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.update_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_secs = self.config.update_interval_secs,
            "update engine running",
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let stop_rx = shutdown.clone();
                    let should_stop = move || *stop_rx.borrow();
                    self.run_phases(&should_stop).await;
                    if *shutdown.borrow() {
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(cycles = self.cycles_completed(), "update engine stopped");
    }

    /// Fan-out/fan-in: every snapshotted entity receives exactly one
    /// `local_update` before this returns. Entities spawned by responses are
    /// registered afterwards, so they join the next cycle's snapshot.
    async fn update_pass(&self) {
        let snapshot = self.snapshot();
        let global = Arc::new(self.global_state());
        let mut tasks: JoinSet<Vec<EntitySpec>> = JoinSet::new();
        for (id, slot) in snapshot {
            let limiter = Arc::clone(&self.limiter);
            let global = Arc::clone(&global);
            let store = self.store.clone();
            tasks.spawn(async move {
                let _permit = match limiter.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return Vec::new(),
                };
                // The inner task contains panics from misbehaving handlers;
                // the supervisor below logs them with the entity id.
                let task_id = id.clone();
                let inner = tokio::spawn(async move {
                    let Ok(mut entity) = slot.try_lock() else {
                        warn!(
                            entity = %task_id,
                            "previous update still in flight; skipped this cycle",
                        );
                        return Vec::new();
                    };
                    let report = entity.local_update(&global).await;
                    debug!(
                        entity = %task_id,
                        executed = report.executed,
                        completed = report.completed,
                        failed = report.failed,
                        "entity updated",
                    );
                    if report.executed > 0 {
                        if let Some(store) = store {
                            let patch = entity.attributes().clone();
                            if let Err(error) = store.update_attributes(entity.id(), patch).await {
                                warn!(entity = %task_id, %error, "attribute persistence failed");
                            }
                        }
                    }
                    report.spawned
                });
                match inner.await {
                    Ok(spawned) => spawned,
                    Err(error) => {
                        warn!(entity = %id, %error, "entity update aborted unexpectedly");
                        Vec::new()
                    }
                }
            });
        }

        let mut spawned = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(specs) => spawned.extend(specs),
                Err(error) => warn!(%error, "update task failed to join"),
            }
        }
        for spec in spawned {
            self.register_spec(spec);
        }
    }

    /// Invokes `refactor` on every entity whose predicate asks for it.
    async fn refactor_pass(&self) {
        let library = self.pattern_library();
        let global = self.global_state();
        for (id, slot) in self.snapshot() {
            let Ok(mut entity) = slot.try_lock() else {
                continue;
            };
            if entity.requires_refactor() {
                if let Err(error) = entity.refactor(&global, &library).await {
                    warn!(entity = %id, %error, "refactor failed");
                }
            }
        }
    }

    /// Collects self-generated entity specifications and registers them.
    async fn autopoiesis_pass(&self) {
        let global = self.global_state();
        let mut spawned = Vec::new();
        for (_, slot) in self.snapshot() {
            let Ok(mut entity) = slot.try_lock() else {
                continue;
            };
            if entity.should_self_generate() {
                spawned.extend(entity.self_generate(&global).await);
            }
        }
        for spec in spawned {
            self.register_spec(spec);
        }
    }

    //////////////////////////////////////// authority loop ///////////////////////////////////////

    /// Builds the reference graph, runs HITS, and writes each registered
    /// entity's authority score into its attributes. Returns the full score
    /// map, including referenced-but-unregistered ids.
    pub async fn perform_graph_analysis(&self) -> HashMap<String, f64> {
        let snapshot = self.snapshot();
        let mut nodes = Vec::with_capacity(snapshot.len());
        let mut edges = Vec::new();
        for (id, slot) in &snapshot {
            nodes.push(id.clone());
            let entity = slot.lock().await;
            for reference in entity.references() {
                edges.push((id.clone(), reference));
            }
        }
        let scores = authority_scores(nodes, &edges);
        for (id, slot) in &snapshot {
            if let Some(score) = scores.get(id) {
                let mut entity = slot.lock().await;
                entity.set_attribute(AUTHORITY_ATTRIBUTE, json!(score));
            }
        }
        scores
    }

    /// Runs graph analysis, then boosts every entity tied for the minimum
    /// authority. The boosts run inline: this phase blocks the next cycle
    /// rather than racing it.
    pub async fn smooth_authority(&self) {
        let scores = self.perform_graph_analysis().await;
        let snapshot = self.snapshot();
        let minimum = snapshot
            .iter()
            .filter_map(|(id, _)| scores.get(id))
            .cloned()
            .fold(None, |acc: Option<f64>, score| {
                Some(acc.map_or(score, |m| m.min(score)))
            });
        let Some(minimum) = minimum else {
            return;
        };
        let global = self.global_state();
        for (id, slot) in &snapshot {
            let Some(score) = scores.get(id) else {
                continue;
            };
            if (score - minimum).abs() <= f64::EPSILON {
                let mut entity = slot.lock().await;
                entity.boost_authority(&global).await;
                debug!(entity = %id, authority = score, "minimum-authority entity boosted");
            }
        }
    }

    /// Hands a persistence write to the runtime. Outside a runtime (plain
    /// unit tests) the write is skipped; durability is best-effort.
    fn spawn_persist<F>(&self, fut: F)
    where
        F: std::future::Future<Output = Result<(), crate::store::StoreError>> + Send + 'static,
    {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(error) = fut.await {
                        warn!(%error, "persistence write failed");
                    }
                });
            }
            Err(_) => debug!("no runtime available; persistence write skipped"),
        }
    }
}

impl std::fmt::Debug for UpdateEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateEngine")
            .field("entities", &self.len())
            .field("cycles", &self.cycles_completed())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::entity::{Attributes, REFERENCES_ATTRIBUTE};
    use crate::iquery::IQuery;
    use crate::resource::ResourceResponse;
    use crate::test_utils::test_helpers::ScriptedHandler;

    fn engine() -> UpdateEngine {
        UpdateEngine::new(EngineConfig::default())
    }

    fn entity_with_iquery(id: &str, iquery: Arc<IQuery>) -> Entity {
        let mut entity = Entity::new(id);
        entity.add_iquery(iquery, &PatternLibrary::new());
        entity
    }

    #[test]
    fn duplicate_registration_is_a_noop() {
        let engine = engine();
        let mut first = Entity::new("e1");
        first.set_attribute("origin", json!("first"));
        let mut second = Entity::new("e1");
        second.set_attribute("origin", json!("second"));

        assert!(engine.register(first));
        assert!(!engine.register(second));
        assert_eq!(engine.len(), 1);

        let slot = engine.get("e1").unwrap();
        let entity = slot.blocking_lock();
        assert_eq!(entity.get_attribute("origin"), Some(&json!("first")));
    }

    #[test]
    fn unregister_absent_is_a_noop() {
        let engine = engine();
        assert!(!engine.unregister("ghost"));
        engine.register(Entity::new("e1"));
        assert!(engine.unregister("e1"));
        assert!(engine.is_empty());
    }

    #[tokio::test]
    async fn cycle_updates_every_snapshotted_entity() {
        let engine = engine();
        for i in 0..5 {
            let handler = ScriptedHandler::always_succeeds(
                "h",
                ResourceResponse::value(format!("value-{}", i)),
            );
            let iquery = Arc::new(IQuery::new("fill", "slot", vec![handler]).unwrap());
            engine.register(entity_with_iquery(&format!("e{}", i), iquery));
        }

        engine.run_cycle().await;

        for i in 0..5 {
            let slot = engine.get(&format!("e{}", i)).unwrap();
            let entity = slot.lock().await;
            assert_eq!(
                entity.get_attribute("slot"),
                Some(&json!(format!("value-{}", i)))
            );
        }
        assert_eq!(engine.cycles_completed(), 1);
        assert_eq!(engine.global_state().get(CYCLE_STATE_KEY), Some(&json!(1)));
    }

    #[tokio::test]
    async fn spawned_entities_join_the_next_cycle() {
        let engine = engine();
        let response = ResourceResponse {
            value: json!("X"),
            new_entities: vec![EntitySpec {
                id: "spawned".to_string(),
                attributes: Attributes::new(),
                patterns: vec![],
            }],
        };
        let handler = ScriptedHandler::always_succeeds("h", response);
        let iquery = Arc::new(IQuery::new("fill", "slot", vec![handler]).unwrap());
        engine.register(entity_with_iquery("parent", iquery));

        engine.run_cycle().await;
        assert_eq!(engine.entity_ids(), vec!["parent", "spawned"]);
    }

    #[tokio::test]
    async fn in_flight_entity_is_skipped_not_queued() {
        let engine = engine();
        let handler = ScriptedHandler::always_succeeds("h", ResourceResponse::value("X"));
        let iquery = Arc::new(IQuery::new("fill", "slot", vec![handler.clone()]).unwrap());
        engine.register(entity_with_iquery("busy", iquery));

        let slot = engine.get("busy").unwrap();
        let guard = slot.lock().await;
        engine.run_cycle().await;
        assert_eq!(handler.calls(), 0);
        drop(guard);

        engine.run_cycle().await;
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn rejected_spec_does_not_poison_the_cycle() {
        let engine = engine();
        let response = ResourceResponse {
            value: json!("X"),
            new_entities: vec![EntitySpec {
                id: "orphan".to_string(),
                attributes: Attributes::new(),
                patterns: vec!["no-such-pattern".to_string()],
            }],
        };
        let handler = ScriptedHandler::always_succeeds("h", response);
        let iquery = Arc::new(IQuery::new("fill", "slot", vec![handler]).unwrap());
        engine.register(entity_with_iquery("parent", iquery));

        engine.run_cycle().await;
        assert_eq!(engine.entity_ids(), vec!["parent"]);
        assert_eq!(engine.cycles_completed(), 1);
    }

    #[tokio::test]
    async fn graph_analysis_scores_a_reference_cycle_symmetrically() {
        let engine = engine();
        for (id, reference) in [("a", "b"), ("b", "c"), ("c", "a")] {
            let mut entity = Entity::new(id);
            entity.set_attribute(REFERENCES_ATTRIBUTE, json!([reference]));
            engine.register(entity);
        }
        let mut loner = Entity::new("loner");
        loner.set_attribute("name", json!("loner"));
        engine.register(loner);

        let scores = engine.perform_graph_analysis().await;
        let a = scores["a"];
        assert!(a > 0.0);
        assert!((scores["b"] - a).abs() < 1e-9);
        assert!((scores["c"] - a).abs() < 1e-9);
        assert_eq!(scores["loner"], 0.0);

        let slot = engine.get("a").unwrap();
        let entity = slot.lock().await;
        assert_eq!(
            entity.get_attribute(AUTHORITY_ATTRIBUTE),
            Some(&json!(a))
        );
    }

    #[tokio::test]
    async fn smoothing_boosts_only_minimum_authority_entities() {
        let engine = engine();
        for (id, reference) in [("a", "b"), ("b", "c"), ("c", "a")] {
            let mut entity = Entity::new(id);
            entity.set_attribute(REFERENCES_ATTRIBUTE, json!([reference]));
            engine.register(entity);
        }
        engine.register(Entity::new("loner"));

        engine.smooth_authority().await;

        let slot = engine.get("loner").unwrap();
        let entity = slot.lock().await;
        assert_eq!(entity.get_attribute("authority_boosts"), Some(&json!(1)));
        drop(entity);

        for id in ["a", "b", "c"] {
            let slot = engine.get(id).unwrap();
            let entity = slot.lock().await;
            assert_eq!(entity.get_attribute("authority_boosts"), None);
        }
    }

    #[tokio::test]
    async fn autopoiesis_registers_self_generated_entities() {
        let config = EngineConfig {
            autopoiesis_enabled: true,
            ..EngineConfig::default()
        };
        let engine = UpdateEngine::new(config);
        let mut progenitor = Entity::new("progenitor");
        progenitor.set_attribute("spawn", json!([{"id": "offspring"}]));
        engine.register(progenitor);

        engine.run_cycle().await;
        assert_eq!(engine.entity_ids(), vec!["offspring", "progenitor"]);
    }

    #[tokio::test]
    async fn shutdown_stops_the_run_loop() {
        let config = EngineConfig {
            update_interval_secs: 1,
            ..EngineConfig::default()
        };
        let engine = Arc::new(UpdateEngine::new(config));
        let (tx, rx) = watch::channel(false);
        let runner = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.run(rx).await })
        };
        tokio::task::yield_now().await;
        tx.send(true).unwrap();
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn add_pattern_refuses_cycles() {
        let engine = engine();
        engine
            .add_pattern(Pattern::new("a").with_parent("b"))
            .unwrap();
        let err = engine
            .add_pattern(Pattern::new("b").with_parent("a"))
            .unwrap_err();
        assert!(matches!(err, ConsistencyError::Cycle { .. }));
        assert_eq!(engine.pattern_names(), vec!["a".to_string()]);
    }
}
