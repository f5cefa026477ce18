//! SQLite storage implementation
//!
//! Embedded file-backed collection. Vectors are fixed-width little-endian
//! f32 blobs; search is a full scan scoring every row, which is fine for
//! the collection sizes this targets (thousands of faces, not millions).
//! Dimension and metric are pinned in a meta table at creation and
//! verified on reopen.

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{debug, info};

use crate::error::StoreError;

use super::traits::{
    check_dimension, check_record_bounds, new_record_id, rank_matches, FaceResult, SearchParams,
    SimilarityType, VectorRecord, VectorStore,
};

/// SQLite-backed vector storage
#[derive(Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
    dimension: usize,
    similarity: SimilarityType,
}

impl SqliteStore {
    /// Open (or create) a collection at `db_path`.
    pub async fn open(
        db_path: &str,
        dimension: usize,
        similarity: SimilarityType,
    ) -> Result<Self, StoreError> {
        if let Some(parent) = Path::new(db_path).parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::BackendUnavailable(e.to_string()))?;
        }

        let database_url = format!("sqlite:{}?mode=rwc", db_path);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&database_url)
            .await?;

        let store = Self {
            pool,
            dimension,
            similarity,
        };
        store.initialize().await?;

        Ok(store)
    }

    async fn initialize(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vectors (
                id TEXT PRIMARY KEY,
                vector BLOB NOT NULL,
                metadata TEXT NOT NULL DEFAULT ''
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS collection_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        self.verify_meta("dimension", &self.dimension.to_string())
            .await?;
        self.verify_meta("similarity", self.similarity.as_str())
            .await?;

        info!(
            dimension = self.dimension,
            similarity = self.similarity.as_str(),
            "sqlite collection initialized"
        );
        Ok(())
    }

    /// Pin a meta value on first open; reject reopening with a different one.
    async fn verify_meta(&self, key: &str, expected: &str) -> Result<(), StoreError> {
        let row = sqlx::query("SELECT value FROM collection_meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let stored: String = row.get("value");
                if stored != expected {
                    return Err(StoreError::Corrupt(format!(
                        "collection {} is {}, configured as {}",
                        key, stored, expected
                    )));
                }
            }
            None => {
                sqlx::query("INSERT INTO collection_meta (key, value) VALUES (?, ?)")
                    .bind(key)
                    .bind(expected)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    fn decode_row(&self, row: &sqlx::sqlite::SqliteRow) -> Result<VectorRecord, StoreError> {
        let blob: Vec<u8> = row.get("vector");
        let vector = VectorRecord::vector_from_bytes(&blob)?;
        if vector.len() != self.dimension {
            return Err(StoreError::Corrupt(format!(
                "stored vector has dimension {}, collection expects {}",
                vector.len(),
                self.dimension
            )));
        }
        Ok(VectorRecord {
            id: row.get("id"),
            vector,
            metadata: row.get("metadata"),
        })
    }
}

#[async_trait]
impl VectorStore for SqliteStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn similarity_type(&self) -> SimilarityType {
        self.similarity
    }

    async fn register(
        &self,
        vector: &[f32],
        metadata: &str,
        id: Option<String>,
    ) -> Result<String, StoreError> {
        check_dimension(self.dimension, vector.len())?;
        let id = id.unwrap_or_else(new_record_id);
        check_record_bounds(&id, metadata)?;

        let record = VectorRecord::new(id.clone(), vector.to_vec(), metadata);
        // INSERT OR REPLACE is a single statement: an existing id is
        // replaced atomically, never observed half-written.
        sqlx::query("INSERT OR REPLACE INTO vectors (id, vector, metadata) VALUES (?, ?, ?)")
            .bind(&record.id)
            .bind(record.vector_bytes())
            .bind(&record.metadata)
            .execute(&self.pool)
            .await?;

        debug!(%id, "registered vector");
        Ok(id)
    }

    async fn register_batch(&self, records: Vec<VectorRecord>) -> Result<Vec<String>, StoreError> {
        for record in &records {
            check_dimension(self.dimension, record.vector.len())?;
            check_record_bounds(&record.id, &record.metadata)?;
        }

        // One transaction: the batch lands wholesale or rolls back.
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(records.len());
        for record in &records {
            sqlx::query("INSERT OR REPLACE INTO vectors (id, vector, metadata) VALUES (?, ?, ?)")
                .bind(&record.id)
                .bind(record.vector_bytes())
                .bind(&record.metadata)
                .execute(&mut *tx)
                .await?;
            ids.push(record.id.clone());
        }
        tx.commit().await?;

        debug!(count = ids.len(), "registered vector batch");
        Ok(ids)
    }

    async fn search(
        &self,
        query: &[f32],
        params: &SearchParams,
    ) -> Result<Vec<FaceResult>, StoreError> {
        check_dimension(self.dimension, query.len())?;

        let rows = sqlx::query("SELECT id, vector FROM vectors")
            .fetch_all(&self.pool)
            .await?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            let blob: Vec<u8> = row.get("vector");
            let vector = VectorRecord::vector_from_bytes(&blob)?;
            candidates.push((row.get::<String, _>("id"), vector));
        }

        Ok(rank_matches(candidates, query, self.similarity, params))
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM vectors WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, id: &str) -> Result<Option<VectorRecord>, StoreError> {
        let row = sqlx::query("SELECT id, vector, metadata FROM vectors WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.decode_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM vectors")
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.get("count");
        Ok(count as u64)
    }
}
