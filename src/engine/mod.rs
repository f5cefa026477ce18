//! Inference engine module
//!
//! Contracts for loaded models and the bounded predictor pool that
//! serializes access to their stateful inference contexts.

pub mod model;
pub mod pool;

pub use model::{Device, ModelHandle, ModelInfo, Predictor};
pub use pool::{Lease, PoolOptions, PredictorPool};
