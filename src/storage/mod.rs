//! Storage module for embedding persistence and similarity search

pub mod memory;
pub mod remote;
pub mod sqlite;
pub mod traits;

use std::sync::Arc;

use crate::config::{BackendConfig, StoreConfig};
use crate::error::StoreError;

pub use memory::MemoryStore;
pub use remote::{RawHit, RemoteStore, RemoteVectorService};
pub use sqlite::SqliteStore;
pub use traits::{
    FaceResult, SearchParams, SimilarityType, VectorRecord, VectorStore, MAX_ID_BYTES,
    MAX_METADATA_BYTES,
};

/// Open a store for the configured backend.
///
/// Covers the self-contained backends. A remote store needs its transport
/// and is constructed explicitly via [`RemoteStore::new`].
pub async fn open(config: &StoreConfig) -> Result<Arc<dyn VectorStore>, StoreError> {
    match &config.backend {
        BackendConfig::Memory => Ok(Arc::new(MemoryStore::new(
            config.dimension,
            config.similarity,
        ))),
        BackendConfig::Embedded { path } => {
            let path = path.to_string_lossy();
            let store = SqliteStore::open(&path, config.dimension, config.similarity).await?;
            Ok(Arc::new(store))
        }
        BackendConfig::Remote { uri, .. } => Err(StoreError::BackendUnavailable(format!(
            "remote backend {} requires a transport; construct RemoteStore directly",
            uri
        ))),
    }
}
