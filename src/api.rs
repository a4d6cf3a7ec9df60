//! HTTP surface over a running engine.
//!
//! Thin handlers: every route reads or mutates the engine and returns a
//! small JSON shape. The daemon nests this router under `/api/v1`.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};

use crate::engine::UpdateEngine;
use crate::entity::{Attributes, Entity, EntitySpec};
use crate::iquery::QueryStatus;

////////////////////////////////////////////// Shapes /////////////////////////////////////////////

/// Response for entity creation.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateEntityResponse {
    /// The entity id.
    pub id: String,
    /// False when an entity with this id already existed; the registry kept
    /// the original.
    pub created: bool,
}

/// One iQuery's observable state.
#[derive(Debug, Serialize, Deserialize)]
pub struct IQueryView {
    /// The iQuery's name.
    pub name: String,
    /// The attribute it fills.
    pub target_attribute: String,
    /// Current execution status.
    pub status: QueryStatus,
    /// Retries against the active handler.
    pub retry_count: u32,
}

/// One entity's observable state.
#[derive(Debug, Serialize, Deserialize)]
pub struct EntityView {
    /// The entity id.
    pub id: String,
    /// The attribute map.
    pub attributes: Attributes,
    /// Assigned pattern names.
    pub patterns: Vec<String>,
    /// The resolved iQuery sequence.
    pub iqueries: Vec<IQueryView>,
}

/// Engine-level counters.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Live entities.
    pub entities: usize,
    /// Completed global update cycles.
    pub cycles_completed: u64,
    /// Seconds between cycles.
    pub update_interval_secs: u64,
}

////////////////////////////////////////////// Handlers ///////////////////////////////////////////

async fn create_entity(
    State(engine): State<Arc<UpdateEngine>>,
    Json(spec): Json<EntitySpec>,
) -> Result<Json<CreateEntityResponse>, StatusCode> {
    let id = spec.id.clone();
    let library = engine.pattern_library();
    match Entity::from_spec(spec, &library) {
        Ok(entity) => {
            let created = engine.register(entity);
            Ok(Json(CreateEntityResponse { id, created }))
        }
        Err(_) => Err(StatusCode::UNPROCESSABLE_ENTITY),
    }
}

async fn list_entities(State(engine): State<Arc<UpdateEngine>>) -> Json<Vec<String>> {
    Json(engine.entity_ids())
}

async fn get_entity(
    State(engine): State<Arc<UpdateEngine>>,
    Path(id): Path<String>,
) -> Result<Json<EntityView>, StatusCode> {
    let slot = engine.get(&id).ok_or(StatusCode::NOT_FOUND)?;
    let entity = slot.lock().await;
    let iqueries = entity
        .iqueries()
        .iter()
        .map(|q| IQueryView {
            name: q.name().to_string(),
            target_attribute: q.target_attribute().to_string(),
            status: q.status(),
            retry_count: q.retry_count(),
        })
        .collect();
    Ok(Json(EntityView {
        id: entity.id().to_string(),
        attributes: entity.attributes().clone(),
        patterns: entity.pattern_names(),
        iqueries,
    }))
}

async fn delete_entity(
    State(engine): State<Arc<UpdateEngine>>,
    Path(id): Path<String>,
) -> StatusCode {
    engine.unregister(&id);
    StatusCode::NO_CONTENT
}

async fn list_patterns(State(engine): State<Arc<UpdateEngine>>) -> Json<Vec<String>> {
    Json(engine.pattern_names())
}

async fn get_status(State(engine): State<Arc<UpdateEngine>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        entities: engine.len(),
        cycles_completed: engine.cycles_completed(),
        update_interval_secs: engine.config().update_interval_secs,
    })
}

////////////////////////////////////////////// Router /////////////////////////////////////////////

/// Builds the API router over `engine`.
pub fn create_api_router(engine: Arc<UpdateEngine>) -> Router {
    Router::new()
        .route("/entity", post(create_entity).get(list_entities))
        .route("/entity/:id", get(get_entity).delete(delete_entity))
        .route("/pattern", get(list_patterns))
        .route("/status", get(get_status))
        .with_state(engine)
}
