//! PostgreSQL-backed primary store and ledger
//!
//! Schema lives in `migrations/`. Each archive date is a logical collection
//! inside the `events` table, so inserting into a new date needs no DDL.

use crate::config::DatabaseConfig;
use crate::error::{InsertError, Result, StoreError};
use crate::store::{Ledger, PrimaryStore, RecordId, UnitClaim};
use crate::unit::Unit;
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// SQLSTATE raised when a value exceeds an internal limit (e.g. jsonb size)
const PROGRAM_LIMIT_EXCEEDED: &str = "54000";

/// Open the connection pool, applying CLI credential overrides
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool> {
    let mut options = PgConnectOptions::from_str(&config.url)?;
    if let Some(user) = &config.user {
        options = options.username(user);
    }
    if let Some(password) = &config.password {
        options = options.password(password);
    }

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .connect_with(options)
        .await?;

    info!(max_connections = config.max_connections, "Database pool ready");
    Ok(pool)
}

/// Apply the bundled migrations
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}

/// `events` table, one logical collection per date
#[derive(Clone)]
pub struct PgPrimaryStore {
    pool: PgPool,
    max_document_bytes: usize,
}

impl PgPrimaryStore {
    pub fn new(pool: PgPool, max_document_bytes: usize) -> Self {
        Self {
            pool,
            max_document_bytes,
        }
    }

    /// Number of records stored in a collection
    pub async fn count(&self, collection: &str) -> std::result::Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE collection = $1")
            .bind(collection)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

/// Map a driver error onto the per-record classification
fn classify(error: sqlx::Error, size: usize, limit: usize) -> InsertError {
    if let sqlx::Error::Database(db) = &error {
        if let Some(code) = db.code() {
            if code == PROGRAM_LIMIT_EXCEEDED {
                return InsertError::TooLarge { size, limit };
            }
            // class 22: data exception, class 23: integrity constraint violation
            if code.starts_with("22") || code.starts_with("23") {
                return InsertError::WriteRejected(format!("{}: {}", code, db.message()));
            }
        }
    }
    InsertError::Other(error.to_string())
}

#[async_trait]
impl PrimaryStore for PgPrimaryStore {
    async fn insert(
        &self,
        unit: &Unit,
        record: &serde_json::Value,
    ) -> std::result::Result<RecordId, InsertError> {
        let payload =
            serde_json::to_string(record).map_err(|e| InsertError::Other(e.to_string()))?;
        let size = payload.len();
        if size > self.max_document_bytes {
            return Err(InsertError::TooLarge {
                size,
                limit: self.max_document_bytes,
            });
        }

        let id: Option<i64> = sqlx::query_scalar(
            "INSERT INTO events (collection, hour, payload) VALUES ($1, $2, $3::jsonb) RETURNING id",
        )
        .bind(unit.collection())
        .bind(i16::from(unit.hour()))
        .bind(&payload)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| classify(e, size, self.max_document_bytes))?;

        id.map(RecordId).ok_or(InsertError::Unacknowledged)
    }

    async fn delete(&self, collection: &str, id: RecordId) -> std::result::Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM events WHERE collection = $1 AND id = $2")
            .bind(collection)
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn purge_unit(&self, unit: &Unit) -> std::result::Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM events WHERE collection = $1 AND hour = $2")
            .bind(unit.collection())
            .bind(i16::from(unit.hour()))
            .execute(&self.pool)
            .await?;
        debug!(unit = %unit, removed = result.rows_affected(), "Purged primary records");
        Ok(result.rows_affected())
    }
}

/// `ingest_ledger` table keyed by unit key
///
/// Claims are session-level advisory locks on the hashed unit key. The
/// session is pinned inside the returned [`UnitClaim`] and closed when the
/// claim drops, which also frees the lock if the process dies mid-attempt.
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Ledger for PgLedger {
    async fn has(&self, unit: &Unit) -> std::result::Result<bool, StoreError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM ingest_ledger WHERE unit_key = $1)")
                .bind(unit.key())
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn claim(&self, unit: &Unit) -> std::result::Result<Option<UnitClaim>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        // the lock belongs to the session; it must never go back to the pool
        conn.close_on_drop();

        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock(hashtext($1)::bigint)")
            .bind(unit.key())
            .fetch_one(&mut *conn)
            .await?;

        if !locked {
            debug!(unit = %unit, "Unit is claimed by another attempt");
            return Ok(None);
        }
        Ok(Some(UnitClaim::new(conn)))
    }

    async fn commit(&self, unit: &Unit) -> std::result::Result<bool, StoreError> {
        let result =
            sqlx::query("INSERT INTO ingest_ledger (unit_key) VALUES ($1) ON CONFLICT DO NOTHING")
                .bind(unit.key())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }
}
