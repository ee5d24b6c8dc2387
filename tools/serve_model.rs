//! Model server: exposes the ONNX default classifier over HTTP.
//!
//! Usage: serve-model [bind_addr]
//! Defaults to `serving.bind_addr` from config.

use anyhow::{Context, Result};
use loan_default_scoring::config::AppConfig;
use loan_default_scoring::models::{LocalPredictor, ModelLoader, OnnxModel, ProbabilityModel};
use loan_default_scoring::serving;
use loan_default_scoring::{FeatureSchema, FeatureTransformer};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

fn main() -> ExitCode {
    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = config.logging.init() {
        eprintln!("{e:#}");
        return ExitCode::FAILURE;
    }

    let bind_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| config.serving.bind_addr.clone());

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to start runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config, bind_addr)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = format!("{e:#}"), "Model server failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: AppConfig, bind_addr: String) -> Result<()> {
    let artifacts = config.storage.artifact_cache()?;

    let schema = FeatureSchema::load(&artifacts, &config.artifacts.schema_key)
        .await
        .context("Failed to load feature schema")?;
    let transformer = FeatureTransformer::new(Arc::new(schema))
        .with_policy(config.scoring.unseen_categories);

    let loaded = ModelLoader::with_threads(config.predictor.onnx_threads)
        .load_from_store(&artifacts, &config.artifacts.model_key)
        .await
        .context("Failed to load ONNX model")?;
    let model: Box<dyn ProbabilityModel> = Box::new(OnnxModel::new(loaded));
    info!(
        model = %model.name(),
        features = transformer.schema().feature_count(),
        "Serving default classifier"
    );

    serving::run_server(Arc::new(LocalPredictor::new(transformer, model)), &bind_addr).await
}
