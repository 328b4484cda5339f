//! Read contract against the relational configuration store.
//!
//! The builder is the only consumer. Both queries are cursor-paginated so a
//! refresh walks the configuration in fixed-size batches and never
//! materializes the full result set in memory.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::collections::HashSet;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// A non-deleted configuration row of one type, with its generic envelope
/// fields split out from the type-specific blob.
#[derive(Debug, Clone)]
pub struct ObjectRow {
    pub id: String,
    pub workspace_id: String,
    pub object_type: String,
    pub config: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ObjectPage {
    pub rows: Vec<ObjectRow>,
    /// Keyset cursor (last row id); `None` when the scan is complete.
    pub next_cursor: Option<String>,
}

/// One active push link joined with its stream and destination rows.
#[derive(Debug, Clone)]
pub struct LinkRow {
    pub id: String,
    pub workspace_id: String,
    pub stream_id: String,
    pub destination_id: String,
    pub options: Value,
    pub stream: ObjectRow,
    pub destination: ObjectRow,
}

/// Keyset cursor over the ordered link join. At most one active push link
/// exists per (stream, destination) pair, so the pair is a unique position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkCursor {
    pub stream_id: String,
    pub destination_id: String,
}

#[derive(Debug, Clone)]
pub struct LinkPage {
    pub rows: Vec<LinkRow>,
    pub next_cursor: Option<LinkCursor>,
}

/// Query surface the builder needs from the relational store.
///
/// Implementations must return links ordered by (stream id, destination id);
/// the builder's single-pass join accumulation depends on that ordering.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// One page of non-deleted rows of the given configuration type, ordered
    /// by id, starting strictly after `cursor`.
    async fn fetch_objects_page(
        &self,
        object_type: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<ObjectPage, StoreError>;

    /// One page of the ordered join of active stream → destination push links
    /// with their stream and destination payloads.
    async fn fetch_links_page(
        &self,
        cursor: Option<&LinkCursor>,
        limit: u32,
    ) -> Result<LinkPage, StoreError>;

    /// Ids of workspaces with event backup enabled.
    async fn backup_enabled_workspaces(&self) -> Result<HashSet<String>, StoreError>;
}

/// Postgres implementation over the console schema.
pub struct PgConfigStore {
    pool: PgPool,
}

impl PgConfigStore {
    pub fn new(pool: PgPool) -> Self {
        PgConfigStore { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(PgConfigStore { pool })
    }
}

#[async_trait]
impl ConfigStore for PgConfigStore {
    async fn fetch_objects_page(
        &self,
        object_type: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<ObjectPage, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, workspace_id, object_type, config, created_at, updated_at
            FROM config_object
            WHERE object_type = $1
              AND deleted = false
              AND ($2::text IS NULL OR id > $2)
            ORDER BY id
            LIMIT $3
            "#,
        )
        .bind(object_type)
        .bind(cursor)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let rows: Vec<ObjectRow> = rows
            .into_iter()
            .map(|row| {
                Ok(ObjectRow {
                    id: row.try_get("id")?,
                    workspace_id: row.try_get("workspace_id")?,
                    object_type: row.try_get("object_type")?,
                    config: row.try_get("config")?,
                    created_at: row.try_get("created_at")?,
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect::<Result<_, sqlx::Error>>()?;

        let next_cursor = if rows.len() == limit as usize {
            rows.last().map(|row| row.id.clone())
        } else {
            None
        };

        Ok(ObjectPage { rows, next_cursor })
    }

    async fn fetch_links_page(
        &self,
        cursor: Option<&LinkCursor>,
        limit: u32,
    ) -> Result<LinkPage, StoreError> {
        let (cursor_stream, cursor_destination) = match cursor {
            Some(c) => (Some(c.stream_id.as_str()), Some(c.destination_id.as_str())),
            None => (None, None),
        };

        let rows = sqlx::query(
            r#"
            SELECT l.id            AS link_id,
                   l.workspace_id  AS link_workspace_id,
                   l.from_id,
                   l.to_id,
                   l.data          AS link_data,
                   s.workspace_id  AS stream_workspace_id,
                   s.config        AS stream_config,
                   s.created_at    AS stream_created_at,
                   s.updated_at    AS stream_updated_at,
                   d.workspace_id  AS destination_workspace_id,
                   d.config        AS destination_config,
                   d.created_at    AS destination_created_at,
                   d.updated_at    AS destination_updated_at
            FROM config_link l
            JOIN config_object s
              ON s.id = l.from_id AND s.object_type = 'stream' AND s.deleted = false
            JOIN config_object d
              ON d.id = l.to_id AND d.object_type = 'destination' AND d.deleted = false
            WHERE l.deleted = false
              AND l.link_type = 'push'
              AND ($1::text IS NULL OR (l.from_id, l.to_id) > ($1, $2))
            ORDER BY l.from_id, l.to_id
            LIMIT $3
            "#,
        )
        .bind(cursor_stream)
        .bind(cursor_destination)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let rows: Vec<LinkRow> = rows
            .into_iter()
            .map(|row| {
                let stream_id: String = row.try_get("from_id")?;
                let destination_id: String = row.try_get("to_id")?;
                Ok(LinkRow {
                    id: row.try_get("link_id")?,
                    workspace_id: row.try_get("link_workspace_id")?,
                    stream_id: stream_id.clone(),
                    destination_id: destination_id.clone(),
                    options: row.try_get("link_data")?,
                    stream: ObjectRow {
                        id: stream_id,
                        workspace_id: row.try_get("stream_workspace_id")?,
                        object_type: "stream".into(),
                        config: row.try_get("stream_config")?,
                        created_at: row.try_get("stream_created_at")?,
                        updated_at: row.try_get("stream_updated_at")?,
                    },
                    destination: ObjectRow {
                        id: destination_id,
                        workspace_id: row.try_get("destination_workspace_id")?,
                        object_type: "destination".into(),
                        config: row.try_get("destination_config")?,
                        created_at: row.try_get("destination_created_at")?,
                        updated_at: row.try_get("destination_updated_at")?,
                    },
                })
            })
            .collect::<Result<_, sqlx::Error>>()?;

        let next_cursor = if rows.len() == limit as usize {
            rows.last().map(|row| LinkCursor {
                stream_id: row.stream_id.clone(),
                destination_id: row.destination_id.clone(),
            })
        } else {
            None
        };

        Ok(LinkPage { rows, next_cursor })
    }

    async fn backup_enabled_workspaces(&self) -> Result<HashSet<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT id FROM workspace WHERE deleted = false AND backup_enabled = true",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| Ok(row.try_get("id")?))
            .collect()
    }
}
