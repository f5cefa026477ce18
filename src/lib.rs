//! Face Recognition Core Library
//!
//! The two mechanisms every model wrapper in a face recognition service
//! plugs into:
//!
//! - [`engine::PredictorPool`]: bounded, exclusive checkout of stateful
//!   inference handles minted from one loaded model.
//! - [`storage::VectorStore`]: fixed-dimension embedding storage with
//!   top-K threshold similarity search over pluggable backends.
//!
//! Callers check out a predictor, run inference, release it, then convert
//! the output into a flat float vector for `register`/`search`.

pub mod config;
pub mod engine;
pub mod error;
pub mod storage;
pub mod utils;

pub use config::Config;
pub use engine::{ModelHandle, Predictor, PredictorPool};
pub use error::{PoolError, PredictorError, StoreError};
pub use storage::{FaceResult, SearchParams, SimilarityType, VectorRecord, VectorStore};
