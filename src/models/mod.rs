//! Default probability sources: local ONNX model and remote endpoints

pub mod batch_endpoint;
pub mod inference;
pub mod leapframe;
pub mod loader;

pub use batch_endpoint::{BatchEndpointClient, Credential};
pub use inference::{LocalPredictor, OnnxModel, PredictRequest, Predictions, ProbabilityModel, ProbabilitySource};
pub use leapframe::LeapframeClient;
pub use loader::ModelLoader;
