//! Loan Default Scoring - Scheduled Job
//!
//! Pulls the feature schema, model and today's loan batch from object storage,
//! scores every loan and reports the ones worth funding.

use anyhow::{Context, Result};
use loan_default_scoring::config::{AppConfig, CredentialKind, PredictorConfig, PredictorMode};
use loan_default_scoring::models::{
    BatchEndpointClient, Credential, LeapframeClient, LocalPredictor, ModelLoader, OnnxModel,
    ProbabilitySource,
};
use loan_default_scoring::{ArtifactCache, FeatureSchema, FeatureTransformer, LoanScorer};
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

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to start runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = format!("{e:#}"), "Loan scoring failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: AppConfig) -> Result<()> {
    info!("Starting Loan Default Scoring");
    info!(
        mode = ?config.predictor.mode,
        threshold = config.scoring.expected_profit_threshold,
        unseen_categories = ?config.scoring.unseen_categories,
        "Configuration loaded successfully"
    );

    let artifacts = config.storage.artifact_cache()?;

    let schema = FeatureSchema::load(&artifacts, &config.artifacts.schema_key)
        .await
        .context("Failed to load feature schema")?;
    let transformer = FeatureTransformer::new(Arc::new(schema))
        .with_policy(config.scoring.unseen_categories);
    info!(
        "Feature transformer initialized ({} features)",
        transformer.schema().feature_count()
    );

    let source = build_source(&config, &artifacts, transformer).await?;
    info!(source = %source.name(), "Probability source ready");

    let scorer = LoanScorer::new(source, config.scoring.expected_profit_threshold);
    let batch = scorer
        .run(&artifacts, &config.artifacts.batch_key)
        .await
        .with_context(|| format!("Failed to score batch {}", config.artifacts.batch_key))?;

    info!(
        run_id = %batch.run_id,
        best_loan_ids = ?batch.best_loan_ids,
        "Loans meeting the expected profit threshold"
    );
    batch.metrics.print_summary();

    if let Some(output_key) = &config.artifacts.output_key {
        let body = serde_json::to_vec_pretty(&batch).context("Failed to serialize scored batch")?;
        let key = artifacts
            .push_bytes(output_key, body)
            .await
            .context("Failed to write scored batch")?;
        info!(key = %key, "Scored batch written");
    }

    Ok(())
}

/// Build the probability source the config asks for
async fn build_source(
    config: &AppConfig,
    artifacts: &ArtifactCache,
    transformer: FeatureTransformer,
) -> Result<Arc<dyn ProbabilitySource>> {
    let predictor = &config.predictor;

    match predictor.mode {
        PredictorMode::Local => {
            let loader = ModelLoader::with_threads(predictor.onnx_threads);
            let model = loader
                .load_from_store(artifacts, &config.artifacts.model_key)
                .await
                .context("Failed to load ONNX model")?;
            Ok(Arc::new(LocalPredictor::new(transformer, OnnxModel::new(model))))
        }
        PredictorMode::BatchEndpoint => {
            let url = endpoint_url(predictor)?;
            let client = BatchEndpointClient::new(url, credential(predictor)?, predictor.timeout())?;
            Ok(Arc::new(client))
        }
        PredictorMode::Leapframe => {
            let url = endpoint_url(predictor)?;
            let client = LeapframeClient::new(url, transformer, predictor.timeout())?;
            if let Some(path) = &predictor.leapframe_model_path {
                client
                    .load_model(path)
                    .await
                    .context("Failed to load model on leapframe server")?;
            }
            Ok(Arc::new(client))
        }
    }
}

fn endpoint_url(predictor: &PredictorConfig) -> Result<&str> {
    predictor
        .endpoint_url
        .as_deref()
        .context("predictor.endpoint_url is required for remote predictors")
}

fn credential(predictor: &PredictorConfig) -> Result<Credential> {
    let secret = || {
        predictor
            .api_secret
            .clone()
            .context("predictor.api_secret is required (set LOAN_SCORING__PREDICTOR__API_SECRET)")
    };

    Ok(match predictor.credential {
        CredentialKind::Cookie => Credential::Cookie {
            name: predictor.cookie_name.clone(),
            secret: secret()?,
        },
        CredentialKind::Bearer => Credential::Bearer(secret()?),
        CredentialKind::None => Credential::None,
    })
}
