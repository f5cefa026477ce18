//! Library configuration
//!
//! One flat value with a tagged variant for backend-specific options; no
//! per-backend config subclasses.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::storage::SimilarityType;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub pool: PoolConfig,
    pub store: StoreConfig,
}

/// Predictor pool sizing and timeout settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Maximum concurrently-live predictor instances. Native inference
    /// contexts are expensive, so this stays small.
    pub max_size: usize,
    /// Default wait for `acquire`. `None` waits indefinitely, `Some(0)`
    /// is a non-blocking try-acquire.
    pub acquire_timeout_ms: Option<u64>,
    /// How long `shutdown` waits for outstanding checkouts before it
    /// stops waiting and lets late releases destroy their instances.
    pub shutdown_grace_ms: u64,
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Collection-level store settings, fixed at creation time.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Vector dimension; every stored vector has exactly this length.
    pub dimension: usize,
    pub similarity: SimilarityType,
    pub backend: BackendConfig,
}

/// Backend selection plus its connection parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// In-memory reference backend; nothing survives the process.
    Memory,
    /// Embedded SQLite file.
    Embedded { path: PathBuf },
    /// Remote vector service (Milvus-class). The transport is supplied
    /// separately when the store is constructed.
    Remote {
        uri: String,
        request_timeout_ms: u64,
    },
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn default_path() -> &'static str {
        "facecore.toml"
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            store: StoreConfig {
                dimension: 512,
                similarity: SimilarityType::Cosine,
                backend: BackendConfig::Embedded {
                    path: PathBuf::from("data/faces.db"),
                },
            },
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            max_size: cores.min(4),
            acquire_timeout_ms: None,
            shutdown_grace_ms: 5_000,
        }
    }
}
