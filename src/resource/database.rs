//! Database-backed resource handler.
//!
//! Fills attributes from a PostgreSQL lookup instead of a model call. The
//! handler owns a connection pool; iQueries share the handler, not
//! connections.

use axum::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use super::{HandlerError, ResourceHandler, ResourceRequest, ResourceResponse};

const MAX_POOL_CONNECTIONS: u32 = 10;

/// Resource handler that answers enrichment requests with a SQL query.
///
/// The query must produce at most one row with a single `jsonb` column and
/// may reference the entity id as `$1`, for example:
///
/// ```sql
/// SELECT payload FROM facts WHERE entity_id = $1
/// ```
///
/// An empty result set is a failed attempt; the iQuery falls back to the
/// next handler in its list.
pub struct DatabaseHandler {
    name: String,
    pool: PgPool,
    query: String,
}

impl DatabaseHandler {
    /// Creates a handler over an existing pool.
    pub fn new(name: impl Into<String>, pool: PgPool, query: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pool,
            query: query.into(),
        }
    }

    /// Connects a new pool and creates a handler over it.
    pub async fn connect(
        name: impl Into<String>,
        url: &str,
        query: impl Into<String>,
    ) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_POOL_CONNECTIONS)
            .connect(url)
            .await?;
        Ok(Self::new(name, pool, query))
    }
}

#[async_trait]
impl ResourceHandler for DatabaseHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, request: &ResourceRequest) -> Result<ResourceResponse, HandlerError> {
        let row: Option<(Value,)> = sqlx::query_as(&self.query)
            .bind(&request.entity_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some((value,)) => Ok(ResourceResponse::value(value)),
            None => Err(HandlerError::Rejected(format!(
                "no row for entity {:?}",
                request.entity_id
            ))),
        }
    }
}
