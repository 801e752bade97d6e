//! PostgreSQL implementation of the outboxer claim store.
//!
//! This crate provides a production-ready PostgreSQL implementation of the
//! `ClaimStore` trait from outboxer.
//!
//! # Features
//!
//! - Atomic claims: one `UPDATE ... FROM (SELECT ... FOR UPDATE SKIP LOCKED)`
//!   statement, so concurrent relays never claim the same row
//! - Bulk delete / unlock by id, both idempotent
//! - Stale-lock sweep for rows left locked by a crashed relay
//! - Optional cap on rows per claim
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE outbox (
//!     id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
//!     payload BYTEA NOT NULL,
//!
//!     -- Claim tracking
//!     locked BOOLEAN NOT NULL DEFAULT FALSE,
//!     locked_at TIMESTAMPTZ,
//!
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//!
//! CREATE INDEX outbox_unlocked_idx ON outbox (created_at) WHERE locked = FALSE;
//! CREATE INDEX outbox_locked_at_idx ON outbox (locked_at) WHERE locked = TRUE;
//! ```
//!
//! Writers insert into this table in the same transaction as their business
//! change; the relay does the rest.
//!
//! # Usage
//!
//! ```rust,ignore
//! use outboxer_postgres::PgClaimStore;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/mydb").await?;
//! let store = PgClaimStore::new(pool).with_table("events_outbox")?;
//!
//! let relay = Relay::builder(store, sink).build()?;
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outboxer::{ClaimStore, Message, MessageBatch, MessageId};
use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_TABLE: &str = "outbox";

#[derive(Debug, Error)]
pub enum PgStoreError {
    #[error("invalid outbox table name {0:?}")]
    InvalidTableName(String),

    #[error("failed to connect to PostgreSQL")]
    Connect(#[source] sqlx::Error),
}

/// Connection settings for [`PgClaimStore::connect`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PgStoreConfig {
    pub url: String,
    pub table: String,
    pub max_connections: u32,
    pub connect_timeout_ms: u64,
    /// Maximum rows per claim. Unset claims every unlocked row.
    pub claim_limit: Option<i64>,
    /// Create the outbox table and its indexes on startup if missing.
    pub ensure_schema: bool,
}

impl Default for PgStoreConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/postgres".to_string(),
            table: DEFAULT_TABLE.to_string(),
            max_connections: 4,
            connect_timeout_ms: 5_000,
            claim_limit: None,
            ensure_schema: false,
        }
    }
}

/// Row returned by a claim.
#[derive(Debug, FromRow)]
struct ClaimedRow {
    id: Uuid,
    payload: Vec<u8>,
    created_at: DateTime<Utc>,
}

impl From<ClaimedRow> for Message {
    fn from(row: ClaimedRow) -> Self {
        Message::new(row.id, row.payload)
    }
}

/// Outbox health snapshot.
#[derive(Debug, Clone, Copy, FromRow)]
pub struct OutboxStats {
    pub unlocked: i64,
    pub locked: i64,
    pub oldest_unlocked: Option<DateTime<Utc>>,
}

/// SQL rendered once for a given table name.
#[derive(Debug, Clone)]
struct Queries {
    claim: String,
    delete: String,
    unlock: String,
    unlock_stale: String,
    stats: String,
    schema: Vec<String>,
}

impl Queries {
    fn for_table(table: &str) -> Self {
        let index_prefix = table.rsplit('.').next().unwrap_or(table);

        Self {
            claim: format!(
                r#"
                WITH claimable AS (
                    SELECT id
                    FROM {table}
                    WHERE locked = FALSE
                    ORDER BY created_at ASC
                    LIMIT $1
                    FOR UPDATE SKIP LOCKED
                )
                UPDATE {table} AS o
                SET locked = TRUE,
                    locked_at = NOW()
                FROM claimable
                WHERE o.id = claimable.id
                RETURNING o.id, o.payload, o.created_at
                "#
            ),
            delete: format!("DELETE FROM {table} WHERE id = ANY($1)"),
            unlock: format!(
                "UPDATE {table} SET locked = FALSE, locked_at = NULL WHERE id = ANY($1)"
            ),
            unlock_stale: format!(
                r#"
                UPDATE {table}
                SET locked = FALSE,
                    locked_at = NULL
                WHERE locked = TRUE
                  AND locked_at < $1
                "#
            ),
            stats: format!(
                r#"
                SELECT
                    COUNT(*) FILTER (WHERE locked = FALSE) AS unlocked,
                    COUNT(*) FILTER (WHERE locked = TRUE) AS locked,
                    MIN(created_at) FILTER (WHERE locked = FALSE) AS oldest_unlocked
                FROM {table}
                "#
            ),
            schema: vec![
                format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {table} (
                        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                        payload BYTEA NOT NULL,
                        locked BOOLEAN NOT NULL DEFAULT FALSE,
                        locked_at TIMESTAMPTZ,
                        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    )
                    "#
                ),
                format!(
                    "CREATE INDEX IF NOT EXISTS {index_prefix}_unlocked_idx \
                     ON {table} (created_at) WHERE locked = FALSE"
                ),
                format!(
                    "CREATE INDEX IF NOT EXISTS {index_prefix}_locked_at_idx \
                     ON {table} (locked_at) WHERE locked = TRUE"
                ),
            ],
        }
    }
}

/// Accept `name` or `schema.name`, each part a plain SQL identifier.
fn is_valid_table_name(table: &str) -> bool {
    let parts: Vec<&str> = table.split('.').collect();
    parts.len() <= 2
        && parts.iter().all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
                && part.len() <= 63
        })
}

/// Ids are UUIDs in this store; anything else cannot name a row.
fn parse_ids(ids: &[MessageId]) -> Vec<Uuid> {
    ids.iter()
        .filter_map(|id| match Uuid::parse_str(id.as_str()) {
            Ok(uuid) => Some(uuid),
            Err(_) => {
                warn!(message_id = %id, "ignoring message id that is not a UUID");
                None
            }
        })
        .collect()
}

/// PostgreSQL claim store.
#[derive(Clone)]
pub struct PgClaimStore {
    pool: PgPool,
    table: String,
    claim_limit: Option<i64>,
    queries: Queries,
}

impl PgClaimStore {
    /// Create a store over the default `outbox` table.
    ///
    /// # Default Settings
    ///
    /// - Table: `outbox`
    /// - Claim limit: none, every unlocked row is claimed
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            table: DEFAULT_TABLE.to_string(),
            claim_limit: None,
            queries: Queries::for_table(DEFAULT_TABLE),
        }
    }

    /// Connect a pool and build a store from `config`.
    pub async fn connect(config: &PgStoreConfig) -> Result<Self, PgStoreError> {
        info!(table = %config.table, "connecting to PostgreSQL");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_millis(config.connect_timeout_ms))
            .connect(&config.url)
            .await
            .map_err(PgStoreError::Connect)?;

        let mut store = Self::new(pool).with_table(&config.table)?;
        if let Some(limit) = config.claim_limit {
            store = store.with_claim_limit(limit);
        }

        info!("connected to PostgreSQL");
        Ok(store)
    }

    /// Use a different outbox table, optionally schema-qualified.
    pub fn with_table(mut self, table: &str) -> Result<Self, PgStoreError> {
        if !is_valid_table_name(table) {
            return Err(PgStoreError::InvalidTableName(table.to_string()));
        }
        self.table = table.to_string();
        self.queries = Queries::for_table(table);
        Ok(self)
    }

    /// Claim at most `limit` rows per call.
    pub fn with_claim_limit(mut self, limit: i64) -> Self {
        self.claim_limit = Some(limit);
        self
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the outbox table and its indexes if they do not exist.
    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in &self.queries.schema {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .with_context(|| format!("failed to prepare outbox table {}", self.table))?;
        }
        debug!(table = %self.table, "outbox schema ready");
        Ok(())
    }

    /// Get statistics about outbox health.
    pub async fn stats(&self) -> Result<OutboxStats> {
        let stats = sqlx::query_as::<_, OutboxStats>(&self.queries.stats)
            .fetch_one(&self.pool)
            .await
            .context("failed to read outbox statistics")?;
        Ok(stats)
    }
}

#[async_trait]
impl ClaimStore for PgClaimStore {
    /// Claim unlocked rows.
    ///
    /// Uses `FOR UPDATE SKIP LOCKED` so that a concurrent claim skips rows
    /// this one is locking instead of waiting for them.
    async fn claim_batch(&self) -> Result<MessageBatch> {
        let mut rows = sqlx::query_as::<_, ClaimedRow>(&self.queries.claim)
            .bind(self.claim_limit)
            .fetch_all(&self.pool)
            .await
            .context("failed to claim outbox rows")?;

        // RETURNING does not preserve the CTE's ordering.
        rows.sort_by_key(|row| row.created_at);
        Ok(rows.into_iter().map(Message::from).collect())
    }

    async fn delete(&self, ids: &[MessageId]) -> Result<()> {
        let ids = parse_ids(ids);
        if ids.is_empty() {
            return Ok(());
        }

        let result = sqlx::query(&self.queries.delete)
            .bind(&ids)
            .execute(&self.pool)
            .await
            .context("failed to delete outbox rows")?;

        debug!(
            requested = ids.len(),
            deleted = result.rows_affected(),
            "deleted outbox rows"
        );
        Ok(())
    }

    async fn unlock(&self, ids: &[MessageId]) -> Result<()> {
        let ids = parse_ids(ids);
        if ids.is_empty() {
            return Ok(());
        }

        sqlx::query(&self.queries.unlock)
            .bind(&ids)
            .execute(&self.pool)
            .await
            .context("failed to unlock outbox rows")?;
        Ok(())
    }

    /// Unlock abandoned rows (lock older than `older_than`).
    async fn unlock_stale(&self, older_than: Duration) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).context("stale lock threshold too large")?;

        let result = sqlx::query(&self.queries.unlock_stale)
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("failed to unlock stale outbox rows")?;

        Ok(result.rows_affected())
    }

    async fn close(&self) -> Result<()> {
        info!("closing PostgreSQL pool");
        self.pool.close().await;
        Ok(())
    }
}
