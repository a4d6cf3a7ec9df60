//! End-to-end cycles through the public API.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::async_trait;
use serde_json::{Value, json};

use accrete::{
    AUTHORITY_ATTRIBUTE, Attributes, Condition, EngineConfig, Entity, EntitySpec, HandlerError,
    IQuery, Pattern, QueryStatus, REFERENCES_ATTRIBUTE, ResourceHandler, ResourceRequest,
    ResourceResponse, UpdateEngine,
};

/// A handler that always answers with a fixed response and counts its calls.
struct CannedHandler {
    name: String,
    response: ResourceResponse,
    calls: AtomicUsize,
}

impl CannedHandler {
    fn new(name: &str, response: ResourceResponse) -> Arc<CannedHandler> {
        Arc::new(CannedHandler {
            name: name.to_string(),
            response,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceHandler for CannedHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _request: &ResourceRequest) -> Result<ResourceResponse, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.response.clone())
    }
}

fn spec(id: &str, patterns: &[&str]) -> EntitySpec {
    EntitySpec {
        id: id.to_string(),
        attributes: Attributes::new(),
        patterns: patterns.iter().map(|p| p.to_string()).collect(),
    }
}

#[tokio::test]
async fn pattern_driven_enrichment_end_to_end() {
    let engine = UpdateEngine::new(EngineConfig::default());
    let handler = CannedHandler::new("canned", ResourceResponse::value("X"));
    let define = Arc::new(
        IQuery::new("define", "definition", vec![handler.clone() as Arc<dyn ResourceHandler>])
            .unwrap(),
    );
    engine
        .add_pattern(Pattern::new("concept").with_iquery(Arc::clone(&define)))
        .unwrap();

    let library = engine.pattern_library();
    let entity = Entity::from_spec(spec("e1", &["concept"]), &library).unwrap();
    engine.register(entity);

    engine.run_cycle().await;

    let slot = engine.get("e1").unwrap();
    let entity = slot.lock().await;
    assert_eq!(entity.get_attribute("definition"), Some(&json!("X")));
    assert_eq!(define.status(), QueryStatus::Completed);
    assert_eq!(handler.calls(), 1);
}

#[tokio::test]
async fn generation_chains_advance_one_cycle_at_a_time() {
    let engine = UpdateEngine::new(EngineConfig::default());
    let response = ResourceResponse {
        value: json!("X"),
        new_entities: vec![spec("child", &["concept"])],
    };
    let handler = CannedHandler::new("spawner", response);
    // Only enrich entities that still lack the attribute, so completed
    // entities go quiet in later cycles.
    let define = Arc::new(
        IQuery::new("define", "definition", vec![handler.clone() as Arc<dyn ResourceHandler>])
            .unwrap()
            .with_condition(Condition::has_attribute("definition").negate()),
    );
    engine
        .add_pattern(Pattern::new("concept").with_iquery(define))
        .unwrap();

    let library = engine.pattern_library();
    engine.register(Entity::from_spec(spec("parent", &["concept"]), &library).unwrap());

    // Cycle 1: the parent is enriched and spawns the child; the child is
    // registered but not updated until the next snapshot.
    engine.run_cycle().await;
    assert_eq!(engine.entity_ids(), vec!["child", "parent"]);
    assert_eq!(handler.calls(), 1);

    // Cycle 2: the child is enriched; its own spawn collides with the
    // existing id and is discarded.
    engine.run_cycle().await;
    assert_eq!(engine.entity_ids(), vec!["child", "parent"]);
    assert_eq!(handler.calls(), 2);

    // Cycle 3: everyone is enriched; nothing is eligible.
    engine.run_cycle().await;
    assert_eq!(handler.calls(), 2);
}

#[tokio::test]
async fn authority_phase_scores_and_boosts() {
    let config = EngineConfig {
        authority_enabled: true,
        ..EngineConfig::default()
    };
    let engine = UpdateEngine::new(config);
    for (id, reference) in [("a", "b"), ("b", "c"), ("c", "a")] {
        let mut entity = Entity::new(id);
        entity.set_attribute(REFERENCES_ATTRIBUTE, json!([reference]));
        engine.register(entity);
    }
    engine.register(Entity::new("loner"));

    engine.run_cycle().await;

    let slot = engine.get("a").unwrap();
    let entity = slot.lock().await;
    let authority = entity
        .get_attribute(AUTHORITY_ATTRIBUTE)
        .and_then(Value::as_f64)
        .unwrap();
    assert!(authority > 0.0);
    drop(entity);

    let slot = engine.get("loner").unwrap();
    let entity = slot.lock().await;
    assert_eq!(
        entity.get_attribute(AUTHORITY_ATTRIBUTE),
        Some(&json!(0.0))
    );
    assert_eq!(entity.get_attribute("authority_boosts"), Some(&json!(1)));
}

#[tokio::test]
async fn unregistered_entities_drop_out_of_the_next_cycle() {
    let engine = UpdateEngine::new(EngineConfig::default());
    let handler = CannedHandler::new("canned", ResourceResponse::value("X"));
    let define = Arc::new(
        IQuery::new("define", "definition", vec![handler.clone() as Arc<dyn ResourceHandler>])
            .unwrap(),
    );
    engine
        .add_pattern(Pattern::new("concept").with_iquery(define))
        .unwrap();
    let library = engine.pattern_library();
    engine.register(Entity::from_spec(spec("e1", &["concept"]), &library).unwrap());
    engine.register(Entity::from_spec(spec("e2", &["concept"]), &library).unwrap());

    engine.run_cycle().await;
    assert_eq!(handler.calls(), 2);

    engine.unregister("e2");
    engine.run_cycle().await;
    // Only e1 re-ran; e2 is gone from the snapshot.
    assert_eq!(handler.calls(), 3);
}
