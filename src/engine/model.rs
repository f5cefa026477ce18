//! Model and predictor contracts
//!
//! A `ModelHandle` is the loaded, shareable artifact (weights mapped once,
//! shared read-only); a `Predictor` is a stateful per-caller inference
//! context minted from it. Engines (OpenVINO, ONNX Runtime, ...) implement
//! both; the pool only ever talks to these traits.

use ndarray::{ArrayD, ArrayViewD};

use crate::error::PredictorError;

/// Device a model is compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Gpu(u32),
}

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
            Device::Gpu(_) => "gpu",
        }
    }
}

/// Identity and shape metadata of a loaded model. Immutable after load.
#[derive(Debug, Clone)]
pub struct ModelInfo {
    /// Model name or path, used for logging and identity.
    pub name: String,
    /// Expected input shape, e.g. `[1, 3, 112, 112]`.
    pub input_shape: Vec<usize>,
    pub device: Device,
}

/// One stateful inference context.
///
/// Not safe for concurrent use: a predictor belongs to exactly one caller
/// at a time, which the pool enforces. `Send` so it can move between
/// worker tasks across checkouts.
pub trait Predictor: Send + 'static {
    /// Run one inference call.
    fn infer(&mut self, input: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>, PredictorError>;

    /// Release engine resources. Called once, when the pool retires or
    /// destroys the instance.
    fn close(&mut self);
}

/// A loaded model from which predictors are minted.
///
/// Shared read-only by every predictor minted from it; the pool holds it
/// alive until shutdown.
pub trait ModelHandle: Send + Sync + 'static {
    type Predictor: Predictor;

    fn info(&self) -> &ModelInfo;

    /// Mint a fresh predictor instance. Expensive; the pool calls this
    /// lazily, at most `max_size` live instances at a time.
    fn new_predictor(&self) -> Result<Self::Predictor, PredictorError>;

    /// Release the model itself. Called by the pool at shutdown, after
    /// every predictor has been destroyed.
    fn close(&self);
}
