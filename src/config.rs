//! Configuration management for the loan scoring job and model server

use crate::feature_transformer::UnseenCategoryPolicy;
use crate::storage::{ArtifactCache, HttpObjectStore, LocalObjectStore, ObjectStore};
use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Environment variable naming an alternative config file
pub const CONFIG_PATH_ENV: &str = "LOAN_SCORING_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "config/config.toml";

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub artifacts: ArtifactsConfig,
    #[serde(default)]
    pub predictor: PredictorConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub serving: ServingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Directory on the local filesystem
    #[default]
    Local,
    /// S3-compatible bucket reached over HTTP
    Http,
}

/// Object storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Root directory for the local backend
    #[serde(default = "default_storage_root")]
    pub root: String,
    /// Bucket URL for the http backend
    #[serde(default)]
    pub base_url: Option<String>,
    /// Where pulled artifacts are copied locally, if anywhere
    #[serde(default)]
    pub tmp_localdir: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl StorageConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Open the configured object store
    pub fn artifact_cache(&self) -> Result<ArtifactCache> {
        let store: Arc<dyn ObjectStore> = match self.backend {
            StorageBackend::Local => Arc::new(LocalObjectStore::new(&self.root)),
            StorageBackend::Http => {
                let Some(base_url) = self.base_url.as_deref() else {
                    bail!("storage.base_url is required for the http backend");
                };
                Arc::new(HttpObjectStore::new(base_url, self.timeout())?)
            }
        };

        let cache = ArtifactCache::new(store);
        Ok(match &self.tmp_localdir {
            Some(dir) => cache.with_local_copies(dir),
            None => cache,
        })
    }
}

fn default_storage_root() -> String {
    "data".to_string()
}

/// Artifact keys inside the store
#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactsConfig {
    /// Feature schema JSON
    pub schema_key: String,
    /// ONNX classifier
    pub model_key: String,
    /// Loan batch JSON
    pub batch_key: String,
    /// Where the scored batch is written, if anywhere
    #[serde(default)]
    pub output_key: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PredictorMode {
    /// ONNX model run in process
    #[default]
    Local,
    /// Deployed endpoint scoring a whole batch per request
    BatchEndpoint,
    /// Leapframe model server scoring one row per request
    Leapframe,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CredentialKind {
    #[default]
    Cookie,
    Bearer,
    None,
}

/// Probability source configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PredictorConfig {
    #[serde(default)]
    pub mode: PredictorMode,
    /// Endpoint URL for the remote modes
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub credential: CredentialKind,
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    /// Secret for the batch endpoint; supply via LOAN_SCORING__PREDICTOR__API_SECRET
    #[serde(default)]
    pub api_secret: Option<String>,
    /// Request timeout for the remote modes
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Bundle path the leapframe server should load before scoring
    #[serde(default)]
    pub leapframe_model_path: Option<String>,
    /// Number of threads for ONNX inference (default: 1)
    #[serde(default = "default_onnx_threads")]
    pub onnx_threads: usize,
}

fn default_cookie_name() -> String {
    crate::models::batch_endpoint::DEFAULT_COOKIE_NAME.to_string()
}

fn default_onnx_threads() -> usize {
    1
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            mode: PredictorMode::Local,
            endpoint_url: None,
            credential: CredentialKind::Cookie,
            cookie_name: default_cookie_name(),
            api_secret: None,
            timeout_ms: None,
            leapframe_model_path: None,
            onnx_threads: default_onnx_threads(),
        }
    }
}

impl PredictorConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Scoring configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ScoringConfig {
    /// Loans with expected profit at or above this are selected
    #[serde(default = "default_threshold")]
    pub expected_profit_threshold: f64,
    /// What to do with categories the model was not trained on
    #[serde(default)]
    pub unseen_categories: UnseenCategoryPolicy,
}

fn default_threshold() -> f64 {
    1000.0
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            expected_profit_threshold: default_threshold(),
            unseen_categories: UnseenCategoryPolicy::default(),
        }
    }
}

/// Model server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServingConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Install the global tracing subscriber
    pub fn init(&self) -> Result<()> {
        let filter = EnvFilter::from_default_env()
            .add_directive(format!("loan_default_scoring={}", self.level).parse()?);

        let builder = tracing_subscriber::fmt().with_env_filter(filter);
        let installed = if self.format == "json" {
            builder.json().try_init()
        } else {
            builder.try_init()
        };
        installed.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
    }
}

impl AppConfig {
    /// Load configuration from `LOAN_SCORING_CONFIG` or the default file
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from_path(path)
    }

    /// Load configuration from a specific path, overlaid with
    /// `LOAN_SCORING__SECTION__KEY` environment variables
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(Environment::with_prefix("LOAN_SCORING").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig {
                backend: StorageBackend::Local,
                root: default_storage_root(),
                base_url: None,
                tmp_localdir: None,
                timeout_ms: None,
            },
            artifacts: ArtifactsConfig {
                schema_key: "models/feature_schema.json".to_string(),
                model_key: "models/default_classifier.onnx".to_string(),
                batch_key: "batches/loans.json".to_string(),
                output_key: None,
            },
            predictor: PredictorConfig::default(),
            scoring: ScoringConfig::default(),
            serving: ServingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
