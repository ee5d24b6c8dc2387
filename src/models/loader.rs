//! ONNX model loader

use crate::error::{Result, ScoringError};
use crate::storage::ArtifactCache;
use ort::session::{builder::GraphOptimizationLevel, Session};
use std::path::Path;
use tracing::info;

/// Loaded ONNX model with metadata
pub struct LoadedModel {
    /// Model name
    pub name: String,
    /// ONNX Runtime session
    pub session: Session,
    /// Input name for the model
    pub input_name: String,
    /// Feature count the input declares, when it is not dynamic
    pub input_width: Option<usize>,
    /// Output name for probabilities
    pub output_name: String,
}

/// Loader for ONNX models
pub struct ModelLoader {
    /// Number of threads for ONNX inference
    onnx_threads: usize,
}

impl ModelLoader {
    /// Create a new model loader with default settings (1 thread)
    pub fn new() -> Self {
        Self::with_threads(1)
    }

    /// Create a new model loader with specified number of threads
    pub fn with_threads(onnx_threads: usize) -> Self {
        Self {
            onnx_threads: onnx_threads.max(1),
        }
    }

    /// Load a model from artifact bytes pulled out of storage
    pub fn load_from_bytes(&self, bytes: &[u8], name: &str) -> Result<LoadedModel> {
        info!(model = %name, bytes = bytes.len(), threads = self.onnx_threads, "Loading ONNX model");

        let session = Session::builder()
            .map_err(|e| load_error(name, e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| load_error(name, e))?
            .with_intra_threads(self.onnx_threads)
            .map_err(|e| load_error(name, e))?
            .commit_from_memory(bytes)
            .map_err(|e| load_error(name, e))?;

        Ok(Self::describe(session, name))
    }

    /// Load a model from a local file
    pub fn load_model<P: AsRef<Path>>(&self, path: P, name: &str) -> Result<LoadedModel> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        info!(model = %name, path = %path.display(), "Read ONNX model file");
        self.load_from_bytes(&bytes, name)
    }

    /// Load a model artifact pulled from object storage
    pub async fn load_from_store(&self, artifacts: &ArtifactCache, key: &str) -> Result<LoadedModel> {
        let bytes = artifacts.pull(key).await?;
        self.load_from_bytes(&bytes, key)
    }

    fn describe(session: Session, name: &str) -> LoadedModel {
        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .unwrap_or_else(|| "float_input".to_string());
        let input_width = session
            .inputs
            .first()
            .and_then(|i| i.input_type.tensor_shape())
            .and_then(|shape| declared_width(shape));

        // skl2onnx classifiers expose `output_label` and `output_probability`
        let output_name = session
            .outputs
            .iter()
            .find(|o| o.name.contains("prob"))
            .or_else(|| session.outputs.last())
            .map(|o| o.name.clone())
            .unwrap_or_else(|| "probabilities".to_string());

        info!(
            model = %name,
            input = %input_name,
            input_width = ?input_width,
            output = %output_name,
            "Model loaded successfully"
        );

        LoadedModel {
            name: name.to_string(),
            session,
            input_name,
            input_width,
            output_name,
        }
    }
}

/// Column count of a `[rows, cols]` input. Dynamic dimensions are -1 or 0.
fn declared_width(dims: &[i64]) -> Option<usize> {
    match dims {
        [_, cols] if *cols > 0 => usize::try_from(*cols).ok(),
        _ => None,
    }
}

fn load_error(name: &str, e: impl std::fmt::Display) -> ScoringError {
    ScoringError::Model(format!("failed to load model {name}: {e}"))
}

impl Default for ModelLoader {
    fn default() -> Self {
        Self::new()
    }
}
