//! Storage abstraction traits
//!
//! Defines the interface for embedding persistence and similarity search.
//! Implementations can be swapped between in-memory, embedded SQLite, and
//! a remote vector service.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::utils::math::{cosine_similarity, euclidean_distance, inner_product, l2_normalized};

/// Maximum id length the persisted layout allows (UUID-sized).
pub const MAX_ID_BYTES: usize = 36;
/// Maximum metadata payload per record.
pub const MAX_METADATA_BYTES: usize = 32 * 1024;

/// Metric used to compare vectors, fixed per collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimilarityType {
    #[serde(rename = "ip")]
    InnerProduct,
    #[serde(rename = "l2")]
    L2,
    #[serde(rename = "cosine")]
    Cosine,
}

impl SimilarityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SimilarityType::InnerProduct => "ip",
            SimilarityType::L2 => "l2",
            SimilarityType::Cosine => "cosine",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ip" => Some(SimilarityType::InnerProduct),
            "l2" => Some(SimilarityType::L2),
            "cosine" => Some(SimilarityType::Cosine),
            _ => None,
        }
    }

    /// Map a pair of vectors onto the unified similarity scale.
    ///
    /// Inner product and cosine pass their raw score through (identical
    /// on unit vectors). L2 maps distance via `1 / (1 + d)` so a smaller
    /// distance yields a higher similarity and `threshold` means the same
    /// thing under every metric.
    pub fn similarity(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            SimilarityType::InnerProduct => inner_product(a, b),
            SimilarityType::Cosine => cosine_similarity(a, b),
            SimilarityType::L2 => 1.0 / (1.0 + euclidean_distance(a, b)),
        }
    }

    /// Map a raw score reported by a remote backend onto the unified
    /// scale. Remote engines return the metric's native score (distance
    /// for L2, dot product otherwise).
    pub fn from_raw_score(&self, raw: f32) -> f32 {
        match self {
            SimilarityType::InnerProduct | SimilarityType::Cosine => raw,
            SimilarityType::L2 => 1.0 / (1.0 + raw.max(0.0)),
        }
    }
}

/// A stored embedding record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    /// Unique record id (UUID when generated by the store)
    pub id: String,
    /// Embedding vector; length is always the collection dimension
    pub vector: Vec<f32>,
    /// Opaque caller metadata (typically JSON)
    pub metadata: String,
}

impl VectorRecord {
    pub fn new(id: impl Into<String>, vector: Vec<f32>, metadata: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            vector,
            metadata: metadata.into(),
        }
    }

    /// Encode the vector as little-endian f32 bytes for blob storage.
    pub fn vector_bytes(&self) -> Vec<u8> {
        self.vector.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    /// Decode a little-endian f32 blob back into a vector.
    pub fn vector_from_bytes(bytes: &[u8]) -> Result<Vec<f32>, StoreError> {
        if bytes.len() % 4 != 0 {
            return Err(StoreError::Corrupt(format!(
                "vector blob length {} is not a multiple of 4",
                bytes.len()
            )));
        }
        Ok(bytes
            .chunks_exact(4)
            .map(|chunk| {
                let arr: [u8; 4] = chunk.try_into().expect("chunks_exact yields 4 bytes");
                f32::from_le_bytes(arr)
            })
            .collect())
    }
}

/// Ranking and filtering parameters for one search. Governs the result
/// set, never storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchParams {
    /// Maximum number of results returned. Zero yields no results.
    pub top_k: usize,
    /// Minimum similarity a result must reach, on the unified scale.
    pub threshold: Option<f32>,
    /// L2-normalize the query and every stored vector before scoring.
    pub normalize: bool,
}

impl SearchParams {
    pub fn top_k(top_k: usize) -> Self {
        Self {
            top_k,
            threshold: None,
            normalize: false,
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn normalized(mut self) -> Self {
        self.normalize = true;
        self
    }
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            top_k: 5,
            threshold: None,
            normalize: false,
        }
    }
}

/// One ranked search hit. Transient, created per query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceResult {
    pub id: String,
    pub similarity: f32,
}

/// Durable, similarity-queryable storage of fixed-dimension vectors.
///
/// Mutations on one collection are serialized with respect to each other;
/// searches run concurrently but never observe a partially-written record.
#[async_trait]
pub trait VectorStore: Send + Sync + 'static {
    /// Fixed vector dimension of this collection.
    fn dimension(&self) -> usize;

    /// Metric this collection compares vectors with.
    fn similarity_type(&self) -> SimilarityType;

    /// Store a vector with metadata. A fresh UUID is generated when `id`
    /// is omitted; an existing id is replaced atomically in full.
    async fn register(
        &self,
        vector: &[f32],
        metadata: &str,
        id: Option<String>,
    ) -> Result<String, StoreError>;

    /// Store several records as a unit. Backends with batch atomicity
    /// roll back wholesale on failure; the remote adapter applies records
    /// one by one and reports [`StoreError::PartialBatch`].
    async fn register_batch(&self, records: Vec<VectorRecord>) -> Result<Vec<String>, StoreError>;

    /// Rank every stored vector against `query`. At most `top_k` results
    /// at or above the threshold, sorted by similarity descending with
    /// ascending-id tie break.
    async fn search(
        &self,
        query: &[f32],
        params: &SearchParams,
    ) -> Result<Vec<FaceResult>, StoreError>;

    /// Remove a record. Returns whether it existed; idempotent.
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    /// Point lookup by id.
    async fn get(&self, id: &str) -> Result<Option<VectorRecord>, StoreError>;

    /// Number of stored records.
    async fn count(&self) -> Result<u64, StoreError>;
}

pub(crate) fn new_record_id() -> String {
    Uuid::new_v4().to_string()
}

pub(crate) fn check_dimension(expected: usize, got: usize) -> Result<(), StoreError> {
    if expected != got {
        return Err(StoreError::DimensionMismatch { expected, got });
    }
    Ok(())
}

pub(crate) fn check_record_bounds(id: &str, metadata: &str) -> Result<(), StoreError> {
    if id.is_empty() {
        return Err(StoreError::InvalidRecord("id must not be empty".into()));
    }
    if id.len() > MAX_ID_BYTES {
        return Err(StoreError::InvalidRecord(format!(
            "id exceeds {} bytes",
            MAX_ID_BYTES
        )));
    }
    if metadata.len() > MAX_METADATA_BYTES {
        return Err(StoreError::InvalidRecord(format!(
            "metadata exceeds {} bytes",
            MAX_METADATA_BYTES
        )));
    }
    Ok(())
}

/// Rank candidate vectors against a query with a single shared policy so
/// every full-scan backend filters, orders, and truncates identically.
pub(crate) fn rank_matches<I>(
    candidates: I,
    query: &[f32],
    metric: SimilarityType,
    params: &SearchParams,
) -> Vec<FaceResult>
where
    I: IntoIterator<Item = (String, Vec<f32>)>,
{
    let normalized_query;
    let query: &[f32] = if params.normalize {
        normalized_query = l2_normalized(query);
        &normalized_query
    } else {
        query
    };

    let mut results: Vec<FaceResult> = candidates
        .into_iter()
        .filter_map(|(id, mut vector)| {
            if params.normalize {
                crate::utils::math::l2_normalize(&mut vector);
            }
            let similarity = metric.similarity(query, &vector);
            match params.threshold {
                Some(threshold) if similarity < threshold => None,
                _ => Some(FaceResult { id, similarity }),
            }
        })
        .collect();

    // Descending similarity, ascending id on ties for determinism.
    results.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    results.truncate(params.top_k);

    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_similarity_scale_l2_identity() {
        let a = vec![0.5, 0.5];
        // Zero distance maps to exactly 1.0.
        assert_eq!(SimilarityType::L2.similarity(&a, &a), 1.0);
    }

    #[test]
    fn test_similarity_scale_l2_monotone() {
        let origin = vec![0.0, 0.0];
        let near = SimilarityType::L2.similarity(&origin, &[0.1, 0.0]);
        let far = SimilarityType::L2.similarity(&origin, &[3.0, 0.0]);
        assert!(near > far);
        assert!(far > 0.0);
    }

    #[test]
    fn test_vector_blob_round_trip() {
        let record = VectorRecord::new("a", vec![1.0, -2.5, 0.0], "");
        let bytes = record.vector_bytes();
        assert_eq!(bytes.len(), 12);
        let decoded = VectorRecord::vector_from_bytes(&bytes).unwrap();
        assert_eq!(decoded, record.vector);
    }

    #[test]
    fn test_vector_blob_bad_length() {
        assert!(matches!(
            VectorRecord::vector_from_bytes(&[0u8; 5]),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn test_rank_matches_orders_and_truncates() {
        let candidates = vec![
            ("b".to_string(), vec![0.6, 0.8]),
            ("a".to_string(), vec![1.0, 0.0]),
            ("c".to_string(), vec![0.0, 1.0]),
        ];
        let results = rank_matches(
            candidates,
            &[1.0, 0.0],
            SimilarityType::Cosine,
            &SearchParams::top_k(2),
        );
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "a");
        assert_eq!(results[1].id, "b");
    }

    #[test]
    fn test_rank_matches_tie_breaks_by_id() {
        let candidates = vec![
            ("z".to_string(), vec![1.0, 0.0]),
            ("a".to_string(), vec![1.0, 0.0]),
        ];
        let results = rank_matches(
            candidates,
            &[1.0, 0.0],
            SimilarityType::Cosine,
            &SearchParams::top_k(2),
        );
        assert_eq!(results[0].id, "a");
        assert_eq!(results[1].id, "z");
    }

    #[test]
    fn test_rank_matches_normalize_scales_inner_product() {
        let candidates = vec![("a".to_string(), vec![10.0, 0.0])];
        let params = SearchParams::top_k(1).normalized();
        let results = rank_matches(
            candidates,
            &[2.0, 0.0],
            SimilarityType::InnerProduct,
            &params,
        );
        assert!((results[0].similarity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_check_record_bounds() {
        assert!(check_record_bounds("a", "meta").is_ok());
        assert!(check_record_bounds("", "meta").is_err());
        assert!(check_record_bounds(&"x".repeat(37), "meta").is_err());
        assert!(check_record_bounds("a", &"m".repeat(MAX_METADATA_BYTES + 1)).is_err());
    }
}
