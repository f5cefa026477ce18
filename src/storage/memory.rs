//! In-memory storage implementation
//!
//! Reference backend: a map of records behind a read-write lock. Writes
//! are serialized; searches take the read lock and run concurrently, so
//! a search observes every record whole or not at all.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::StoreError;

use super::traits::{
    check_dimension, check_record_bounds, new_record_id, rank_matches, FaceResult, SearchParams,
    SimilarityType, VectorRecord, VectorStore,
};

/// In-memory vector storage
pub struct MemoryStore {
    dimension: usize,
    similarity: SimilarityType,
    records: RwLock<HashMap<String, VectorRecord>>,
}

impl MemoryStore {
    pub fn new(dimension: usize, similarity: SimilarityType) -> Self {
        Self {
            dimension,
            similarity,
            records: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl VectorStore for MemoryStore {
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
        self.records.write().insert(id.clone(), record);
        debug!(%id, "registered vector");
        Ok(id)
    }

    async fn register_batch(&self, records: Vec<VectorRecord>) -> Result<Vec<String>, StoreError> {
        // Validate everything up front so the batch applies as a unit.
        for record in &records {
            check_dimension(self.dimension, record.vector.len())?;
            check_record_bounds(&record.id, &record.metadata)?;
        }

        let mut map = self.records.write();
        let ids = records
            .into_iter()
            .map(|record| {
                let id = record.id.clone();
                map.insert(id.clone(), record);
                id
            })
            .collect();
        Ok(ids)
    }

    async fn search(
        &self,
        query: &[f32],
        params: &SearchParams,
    ) -> Result<Vec<FaceResult>, StoreError> {
        check_dimension(self.dimension, query.len())?;

        let candidates: Vec<(String, Vec<f32>)> = {
            let map = self.records.read();
            map.values()
                .map(|record| (record.id.clone(), record.vector.clone()))
                .collect()
        };

        Ok(rank_matches(candidates, query, self.similarity, params))
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.records.write().remove(id).is_some())
    }

    async fn get(&self, id: &str) -> Result<Option<VectorRecord>, StoreError> {
        Ok(self.records.read().get(id).cloned())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.records.read().len() as u64)
    }
}
