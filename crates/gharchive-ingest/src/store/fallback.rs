//! Fallback store: raw lines in object storage, indexed in PostgreSQL
//!
//! A blob is indexed under its unit before its bytes are uploaded, so every
//! object an attempt may have written is reachable from the index. An index
//! row without an object is an interrupted upload. Deleting always removes
//! both sides.

use crate::error::StoreError;
use crate::store::{BlobId, BlobStorage, FallbackStore, StoredBlob};
use crate::unit::Unit;
use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, instrument};
use uuid::Uuid;

#[derive(Clone)]
pub struct ObjectFallbackStore {
    blobs: BlobStorage,
    pool: PgPool,
}

impl ObjectFallbackStore {
    pub fn new(blobs: BlobStorage, pool: PgPool) -> Self {
        Self { blobs, pool }
    }

    /// Fetch a parked line back, byte for byte
    pub async fn get(&self, id: BlobId) -> Result<Vec<u8>, StoreError> {
        self.blobs.download(&BlobStorage::key_for(id)).await
    }

    /// Blobs indexed under a unit
    pub async fn list_unit(&self, unit: &Unit) -> Result<Vec<BlobId>, StoreError> {
        let ids: Vec<Uuid> =
            sqlx::query_scalar("SELECT blob_id FROM fallback_index WHERE date = $1 AND hour = $2")
                .bind(unit.date_str())
                .bind(i16::from(unit.hour()))
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().map(BlobId).collect())
    }
}

#[async_trait]
impl FallbackStore for ObjectFallbackStore {
    async fn index(&self, blob: &StoredBlob, unit: &Unit) -> Result<bool, StoreError> {
        let size = i64::try_from(blob.size)
            .map_err(|_| StoreError::Other(format!("blob {} is too large to index", blob.id)))?;

        let result = sqlx::query(
            r#"
            INSERT INTO fallback_index (blob_id, date, hour, size, sha256)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (blob_id) DO NOTHING
            "#,
        )
        .bind(blob.id.0)
        .bind(unit.date_str())
        .bind(i16::from(unit.hour()))
        .bind(size)
        .bind(&blob.sha256)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, blob, raw), fields(blob = %blob.id, size = raw.len()))]
    async fn put(&self, blob: &StoredBlob, raw: &[u8]) -> Result<(), StoreError> {
        self.blobs
            .upload(&BlobStorage::key_for(blob.id), raw.to_vec())
            .await
    }

    async fn delete(&self, id: BlobId) -> Result<bool, StoreError> {
        sqlx::query("DELETE FROM fallback_index WHERE blob_id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        // S3 deletes are idempotent, so an unindexed blob is removed as well
        self.blobs.delete(&BlobStorage::key_for(id)).await?;
        Ok(true)
    }

    async fn purge_unit(&self, unit: &Unit) -> Result<u64, StoreError> {
        let ids = self.list_unit(unit).await?;
        let mut removed = 0;
        for id in ids {
            if self.delete(id).await? {
                removed += 1;
            }
        }
        debug!(unit = %unit, removed, "Purged fallback blobs");
        Ok(removed)
    }
}
