//! Remote vector service adapter
//!
//! Wraps a Milvus-class remote engine behind the [`VectorStore`] contract.
//! The wire protocol lives behind [`RemoteVectorService`]; this adapter
//! owns connection state (reconnect on the next call, never block
//! indefinitely), translates the remote's native scores onto the unified
//! similarity scale, and surfaces every transport failure as
//! [`StoreError::BackendUnavailable`].

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::utils::math::l2_normalized;

use super::traits::{
    check_dimension, check_record_bounds, new_record_id, FaceResult, SearchParams, SimilarityType,
    VectorRecord, VectorStore,
};

/// One hit as reported by the remote engine: the metric's native score
/// (distance for L2, dot product for IP/cosine), not yet on the unified
/// similarity scale.
#[derive(Debug, Clone)]
pub struct RawHit {
    pub id: String,
    pub raw_score: f32,
}

/// Transport contract a remote vector engine must provide. Every call has
/// its own I/O timeout; none blocks forever.
#[async_trait]
pub trait RemoteVectorService: Send + Sync + 'static {
    async fn connect(&self) -> anyhow::Result<()>;
    async fn upsert(&self, record: &VectorRecord) -> anyhow::Result<()>;
    /// Return up to `limit` hits ranked by the engine's native metric.
    async fn query(&self, vector: &[f32], limit: usize) -> anyhow::Result<Vec<RawHit>>;
    async fn remove(&self, id: &str) -> anyhow::Result<bool>;
    async fn fetch(&self, id: &str) -> anyhow::Result<Option<VectorRecord>>;
    async fn count(&self) -> anyhow::Result<u64>;
}

/// Remote-backed vector storage
pub struct RemoteStore<S: RemoteVectorService> {
    service: S,
    dimension: usize,
    similarity: SimilarityType,
    connected: AtomicBool,
}

impl<S: RemoteVectorService> RemoteStore<S> {
    /// Wrap a transport. The connection is established lazily on the
    /// first call and re-established after any transport failure.
    pub fn new(service: S, dimension: usize, similarity: SimilarityType) -> Self {
        Self {
            service,
            dimension,
            similarity,
            connected: AtomicBool::new(false),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// One reconnect attempt per call when disconnected; failure surfaces
    /// immediately rather than blocking or retrying internally.
    async fn ensure_connected(&self) -> Result<(), StoreError> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        match self.service.connect().await {
            Ok(()) => {
                info!("remote vector service connected");
                self.connected.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "remote vector service connect failed");
                Err(StoreError::BackendUnavailable(err.to_string()))
            }
        }
    }

    fn transport_failed(&self, err: anyhow::Error) -> StoreError {
        warn!(error = %err, "remote vector service call failed");
        self.connected.store(false, Ordering::SeqCst);
        StoreError::BackendUnavailable(err.to_string())
    }
}

#[async_trait]
impl<S: RemoteVectorService> VectorStore for RemoteStore<S> {
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
        self.ensure_connected().await?;

        let record = VectorRecord::new(id.clone(), vector.to_vec(), metadata);
        self.service
            .upsert(&record)
            .await
            .map_err(|e| self.transport_failed(e))?;

        debug!(%id, "registered vector remotely");
        Ok(id)
    }

    async fn register_batch(&self, records: Vec<VectorRecord>) -> Result<Vec<String>, StoreError> {
        for record in &records {
            check_dimension(self.dimension, record.vector.len())?;
            check_record_bounds(&record.id, &record.metadata)?;
        }
        self.ensure_connected().await?;

        // The remote engine has no batch atomicity; records are applied
        // one by one and a partial outcome is reported as such.
        let mut succeeded = Vec::with_capacity(records.len());
        let mut failed = Vec::new();
        for (index, record) in records.iter().enumerate() {
            match self.service.upsert(record).await {
                Ok(()) => succeeded.push(record.id.clone()),
                Err(err) => {
                    self.connected.store(false, Ordering::SeqCst);
                    failed.push((index, err.to_string()));
                }
            }
        }

        if failed.is_empty() {
            Ok(succeeded)
        } else {
            Err(StoreError::PartialBatch { succeeded, failed })
        }
    }

    async fn search(
        &self,
        query: &[f32],
        params: &SearchParams,
    ) -> Result<Vec<FaceResult>, StoreError> {
        check_dimension(self.dimension, query.len())?;
        self.ensure_connected().await?;

        // Stored-side normalization is the remote index's configuration;
        // the adapter normalizes the query it forwards.
        let normalized;
        let query: &[f32] = if params.normalize {
            normalized = l2_normalized(query);
            &normalized
        } else {
            query
        };

        let hits = self
            .service
            .query(query, params.top_k)
            .await
            .map_err(|e| self.transport_failed(e))?;

        let mut results: Vec<FaceResult> = hits
            .into_iter()
            .map(|hit| FaceResult {
                id: hit.id,
                similarity: self.similarity.from_raw_score(hit.raw_score),
            })
            .filter(|result| match params.threshold {
                Some(threshold) => result.similarity >= threshold,
                None => true,
            })
            .collect();

        results.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        results.truncate(params.top_k);

        Ok(results)
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        self.ensure_connected().await?;
        self.service
            .remove(id)
            .await
            .map_err(|e| self.transport_failed(e))
    }

    async fn get(&self, id: &str) -> Result<Option<VectorRecord>, StoreError> {
        self.ensure_connected().await?;
        self.service
            .fetch(id)
            .await
            .map_err(|e| self.transport_failed(e))
    }

    async fn count(&self) -> Result<u64, StoreError> {
        self.ensure_connected().await?;
        self.service
            .count()
            .await
            .map_err(|e| self.transport_failed(e))
    }
}
