//! PostgreSQL position journal.
//!
//! Stores the latest snapshot of each position as JSONB in one table. The
//! upsert only overwrites a row with a strictly higher version, so racing
//! writers and replays never regress durable state.
//!
//! This module uses dynamic queries (sqlx::query) instead of compile-time
//! checked macros (sqlx::query!) to allow compilation without DATABASE_URL.

use crate::error::{StoreError, StoreResult};
use crate::journal::PositionJournal;
use async_trait::async_trait;
use perpguard_domain::Position;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tracing::debug;

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS position_journal (
    position_id  UUID PRIMARY KEY,
    version      BIGINT NOT NULL,
    symbol       TEXT NOT NULL,
    status       TEXT NOT NULL,
    archived     BOOLEAN NOT NULL DEFAULT FALSE,
    snapshot     JSONB NOT NULL,
    updated_at   TIMESTAMPTZ NOT NULL
)
"#;

const UPSERT: &str = r#"
INSERT INTO position_journal (position_id, version, symbol, status, archived, snapshot, updated_at)
VALUES ($1, $2, $3, $4, $5, $6, $7)
ON CONFLICT (position_id) DO UPDATE SET
    version    = EXCLUDED.version,
    symbol     = EXCLUDED.symbol,
    status     = EXCLUDED.status,
    archived   = EXCLUDED.archived,
    snapshot   = EXCLUDED.snapshot,
    updated_at = EXCLUDED.updated_at
WHERE position_journal.version < EXCLUDED.version
  AND NOT position_journal.archived
"#;

/// PostgreSQL adapter for [`PositionJournal`]
pub struct PgJournal {
    /// PostgreSQL connection pool
    pool: Arc<PgPool>,
}

impl PgJournal {
    /// Create a new journal on an existing pool
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` and ensure the table exists
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPool::connect(database_url).await?;
        let journal = Self::new(Arc::new(pool));
        journal.migrate().await?;
        Ok(journal)
    }

    /// Create the journal table if missing
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::query(CREATE_TABLE).execute(self.pool.as_ref()).await?;
        Ok(())
    }

    /// Get a reference to the underlying pool (for testing).
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn upsert(&self, position: &Position, archived: bool) -> StoreResult<()> {
        let snapshot = serde_json::to_value(position)?;
        let version = i64::try_from(position.version)
            .map_err(|_| StoreError::Serialization(format!("version {} overflows BIGINT", position.version)))?;

        let result = sqlx::query(UPSERT)
            .bind(position.id)
            .bind(version)
            .bind(position.symbol.as_pair())
            .bind(position.status.name())
            .bind(archived)
            .bind(snapshot)
            .bind(position.last_updated_at)
            .execute(self.pool.as_ref())
            .await?;

        if result.rows_affected() == 0 {
            debug!(position_id = %position.id, version = position.version, "Journal row already newer, skipped");
        }
        Ok(())
    }
}

#[async_trait]
impl PositionJournal for PgJournal {
    async fn record(&self, position: &Position) -> StoreResult<()> {
        self.upsert(position, false).await
    }

    async fn archive(&self, position: &Position) -> StoreResult<()> {
        self.upsert(position, true).await
    }

    async fn load_live(&self) -> StoreResult<Vec<Position>> {
        let rows = sqlx::query(
            "SELECT snapshot FROM position_journal WHERE archived = FALSE ORDER BY position_id",
        )
        .fetch_all(self.pool.as_ref())
        .await?;

        rows.into_iter()
            .map(|row| -> StoreResult<Position> {
                let snapshot: serde_json::Value = row.try_get("snapshot")?;
                Ok(serde_json::from_value::<Position>(snapshot)?)
            })
            .collect()
    }
}
