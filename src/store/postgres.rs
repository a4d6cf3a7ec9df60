//! PostgreSQL-backed graph store.
//!
//! Uses runtime-checked queries over a shared connection pool. The schema is
//! created idempotently at startup; there is no migration history to manage
//! because every statement is `CREATE TABLE IF NOT EXISTS`.

use axum::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use super::{
    EdgeKind, EntityRecord, GraphStore, HandlerRecord, IQueryRecord, PatternRecord, StoreError,
};
use crate::entity::Attributes;

const MAX_POOL_CONNECTIONS: u32 = 10;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS entities (
        id TEXT PRIMARY KEY,
        attributes JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS patterns (
        name TEXT PRIMARY KEY,
        parents JSONB NOT NULL DEFAULT '[]'::jsonb,
        backing_entity TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS iqueries (
        name TEXT PRIMARY KEY,
        target_attribute TEXT NOT NULL,
        condition JSONB,
        status TEXT NOT NULL DEFAULT 'pending'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS handlers (
        name TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        config JSONB NOT NULL DEFAULT '{}'::jsonb
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS edges (
        kind TEXT NOT NULL,
        src TEXT NOT NULL,
        dst TEXT NOT NULL,
        PRIMARY KEY (kind, src, dst)
    )
    "#,
];

/// [`GraphStore`] over PostgreSQL.
pub struct PostgresGraphStore {
    pool: PgPool,
}

impl PostgresGraphStore {
    /// Wraps an existing pool. Call [`ensure_schema`](Self::ensure_schema)
    /// before first use.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects a pool to `url` and creates the schema.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_POOL_CONNECTIONS)
            .connect(url)
            .await?;
        let store = Self::new(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Creates every table the store needs, idempotently.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn insert_edge(&self, kind: EdgeKind, src: &str, dst: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO edges (kind, src, dst)
            VALUES ($1, $2, $3)
            ON CONFLICT (kind, src, dst) DO NOTHING
            "#,
        )
        .bind(kind.as_str())
        .bind(src)
        .bind(dst)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn encode_attributes(attributes: &Attributes) -> Result<Value, StoreError> {
    serde_json::to_value(attributes).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode_attributes(value: Value) -> Result<Attributes, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

#[async_trait]
impl GraphStore for PostgresGraphStore {
    async fn get_entity(&self, id: &str) -> Result<Option<EntityRecord>, StoreError> {
        let row: Option<(String, Value, DateTime<Utc>, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT id, attributes, created_at, updated_at
            FROM entities
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some((id, attributes, created_at, updated_at)) => Ok(Some(EntityRecord {
                id,
                attributes: decode_attributes(attributes)?,
                created_at,
                updated_at,
            })),
            None => Ok(None),
        }
    }

    async fn create_entity(
        &self,
        id: &str,
        attributes: Attributes,
    ) -> Result<EntityRecord, StoreError> {
        let encoded = encode_attributes(&attributes)?;
        let (created_at, updated_at): (DateTime<Utc>, DateTime<Utc>) = sqlx::query_as(
            r#"
            INSERT INTO entities (id, attributes)
            VALUES ($1, $2)
            RETURNING created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(encoded)
        .fetch_one(&self.pool)
        .await?;
        Ok(EntityRecord {
            id: id.to_string(),
            attributes,
            created_at,
            updated_at,
        })
    }

    async fn update_attributes(&self, id: &str, patch: Attributes) -> Result<(), StoreError> {
        let encoded = encode_attributes(&patch)?;
        let result = sqlx::query(
            r#"
            UPDATE entities
            SET attributes = attributes || $2, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(encoded)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn delete_entity(&self, id: &str) -> Result<bool, StoreError> {
        sqlx::query(r#"DELETE FROM edges WHERE kind = $1 AND src = $2"#)
            .bind(EdgeKind::EntityPattern.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        let result = sqlx::query(r#"DELETE FROM entities WHERE id = $1"#)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_entities(&self) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(r#"SELECT id FROM entities ORDER BY id"#)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn upsert_pattern(&self, record: PatternRecord) -> Result<(), StoreError> {
        let parents = serde_json::to_value(&record.parents)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO patterns (name, parents, backing_entity)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE
            SET parents = EXCLUDED.parents, backing_entity = EXCLUDED.backing_entity
            "#,
        )
        .bind(&record.name)
        .bind(parents)
        .bind(&record.backing_entity)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_iquery(&self, record: IQueryRecord) -> Result<(), StoreError> {
        let condition = match &record.condition {
            Some(condition) => Some(
                serde_json::to_value(condition)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?,
            ),
            None => None,
        };
        sqlx::query(
            r#"
            INSERT INTO iqueries (name, target_attribute, condition, status)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name) DO UPDATE
            SET target_attribute = EXCLUDED.target_attribute,
                condition = EXCLUDED.condition,
                status = EXCLUDED.status
            "#,
        )
        .bind(&record.name)
        .bind(&record.target_attribute)
        .bind(condition)
        .bind(&record.status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_handler(&self, record: HandlerRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO handlers (name, kind, config)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE
            SET kind = EXCLUDED.kind, config = EXCLUDED.config
            "#,
        )
        .bind(&record.name)
        .bind(&record.kind)
        .bind(&record.config)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn link_pattern_iquery(&self, pattern: &str, iquery: &str) -> Result<(), StoreError> {
        self.insert_edge(EdgeKind::PatternIQuery, pattern, iquery).await
    }

    async fn link_entity_pattern(&self, entity: &str, pattern: &str) -> Result<(), StoreError> {
        self.insert_edge(EdgeKind::EntityPattern, entity, pattern).await
    }

    async fn link_iquery_handler(&self, iquery: &str, handler: &str) -> Result<(), StoreError> {
        self.insert_edge(EdgeKind::IQueryHandler, iquery, handler).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    async fn test_store() -> PostgresGraphStore {
        let url = std::env::var("TEST_DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/accrete_test".to_string());
        PostgresGraphStore::connect(&url)
            .await
            .expect("TEST_DATABASE_URL must point at a running PostgreSQL")
    }

    #[tokio::test]
    #[ignore = "requires a running PostgreSQL at TEST_DATABASE_URL"]
    async fn entity_crud_round_trip() {
        let store = test_store().await;
        let id = format!("pg-test-{}", std::process::id());
        store.delete_entity(&id).await.unwrap();

        let mut attributes = Attributes::new();
        attributes.insert("name".to_string(), json!("Rust"));
        store.create_entity(&id, attributes).await.unwrap();

        let mut patch = Attributes::new();
        patch.insert("definition".to_string(), json!("X"));
        store.update_attributes(&id, patch).await.unwrap();

        let record = store.get_entity(&id).await.unwrap().unwrap();
        assert_eq!(record.attributes.get("name"), Some(&json!("Rust")));
        assert_eq!(record.attributes.get("definition"), Some(&json!("X")));

        assert!(store.delete_entity(&id).await.unwrap());
        assert!(store.get_entity(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "requires a running PostgreSQL at TEST_DATABASE_URL"]
    async fn edges_are_idempotent() {
        let store = test_store().await;
        store.link_entity_pattern("pg-edge", "concept").await.unwrap();
        store.link_entity_pattern("pg-edge", "concept").await.unwrap();
        sqlx::query(r#"DELETE FROM edges WHERE src = 'pg-edge'"#)
            .execute(&store.pool)
            .await
            .unwrap();
    }
}
