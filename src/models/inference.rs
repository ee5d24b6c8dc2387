//! Default probability inference over transformed loan features

use crate::feature_transformer::{FeatureMatrix, FeatureSchema, FeatureTransformer};
use crate::error::{Result, ScoringError};
use crate::models::loader::LoadedModel;
use crate::types::loan::RawRecord;
use async_trait::async_trait;
use ort::memory::Allocator;
use ort::value::{DowncastableTarget, DynMapValueType, DynSequenceValueType, DynValue, Tensor};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Probabilities of default keyed by the batch position they belong to
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Predictions {
    /// Batch position of each probability
    pub row_index: Vec<usize>,
    /// Positive-class probability per row
    pub p_default: Vec<f64>,
}

impl Predictions {
    /// Predictions covering every position of a batch, in order
    pub fn aligned(p_default: Vec<f64>) -> Self {
        Self {
            row_index: (0..p_default.len()).collect(),
            p_default,
        }
    }

    pub fn len(&self) -> usize {
        self.p_default.len()
    }

    pub fn is_empty(&self) -> bool {
        self.p_default.is_empty()
    }

    /// `(position, probability)` pairs in row order
    pub fn iter(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.row_index.iter().copied().zip(self.p_default.iter().copied())
    }
}

/// Binary classifier producing the probability of the positive (default) class
pub trait ProbabilityModel: Send + Sync {
    fn name(&self) -> &str;

    /// One probability per matrix row, in row order
    fn predict_proba(&self, matrix: &FeatureMatrix) -> Result<Vec<f64>>;
}

impl<M: ProbabilityModel + ?Sized> ProbabilityModel for Box<M> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn predict_proba(&self, matrix: &FeatureMatrix) -> Result<Vec<f64>> {
        (**self).predict_proba(matrix)
    }
}

/// Anything that can attach default probabilities to a batch of raw records
#[async_trait]
pub trait ProbabilitySource: Send + Sync {
    fn name(&self) -> &str;

    async fn predict_default_probability(&self, records: &[RawRecord]) -> Result<Predictions>;
}

/// Prediction request as accepted by the deployed endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct PredictRequest {
    pub data: Vec<RawRecord>,
    /// Run the feature transformer first (`1`/`true`), or treat `data` as
    /// rows already in feature space (`0`/`false`)
    #[serde(default = "default_transform", deserialize_with = "deserialize_flag")]
    pub transform: bool,
}

fn default_transform() -> bool {
    true
}

fn deserialize_flag<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<bool, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Bool(b) => Ok(b),
        Value::Number(n) => Ok(n.as_f64().is_some_and(|v| v != 0.0)),
        other => Err(serde::de::Error::custom(format!(
            "transform flag must be a boolean or number, got {other}"
        ))),
    }
}

/// Feature transformer paired with a trained classifier
pub struct LocalPredictor<M> {
    transformer: FeatureTransformer,
    model: M,
}

impl<M: ProbabilityModel> LocalPredictor<M> {
    pub fn new(transformer: FeatureTransformer, model: M) -> Self {
        Self { transformer, model }
    }

    pub fn schema(&self) -> &FeatureSchema {
        self.transformer.schema()
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Transform raw records, then predict
    pub fn predict_records(&self, records: &[RawRecord]) -> Result<Predictions> {
        let matrix = self.transformer.transform(records)?;
        if !matrix.dropped_rows().is_empty() {
            warn!(
                dropped = ?matrix.dropped_rows(),
                "Records dropped for missing feature values"
            );
        }
        let p_default = self.predict_matrix(&matrix)?;
        Ok(Predictions {
            row_index: matrix.row_index().to_vec(),
            p_default,
        })
    }

    /// Predict on a matrix the caller already built
    pub fn predict_matrix(&self, matrix: &FeatureMatrix) -> Result<Vec<f64>> {
        check_columns(matrix.columns(), &self.schema().trained_features)?;
        if matrix.is_empty() {
            return Ok(Vec::new());
        }

        let probabilities = self.model.predict_proba(matrix)?;
        if probabilities.len() != matrix.n_rows() {
            return Err(ScoringError::Model(format!(
                "model {} returned {} probabilities for {} rows",
                self.model.name(),
                probabilities.len(),
                matrix.n_rows()
            )));
        }

        debug!(model = %self.model.name(), rows = matrix.n_rows(), "Predicted default probabilities");
        Ok(probabilities)
    }

    /// Honour the request's transform flag
    pub fn predict(&self, request: &PredictRequest) -> Result<Predictions> {
        if request.transform {
            return self.predict_records(&request.data);
        }
        let matrix =
            FeatureMatrix::from_feature_records(&request.data, &self.schema().trained_features)?;
        let p_default = self.predict_matrix(&matrix)?;
        Ok(Predictions {
            row_index: matrix.row_index().to_vec(),
            p_default,
        })
    }
}

#[async_trait]
impl<M: ProbabilityModel> ProbabilitySource for LocalPredictor<M> {
    fn name(&self) -> &str {
        self.model.name()
    }

    async fn predict_default_probability(&self, records: &[RawRecord]) -> Result<Predictions> {
        self.predict_records(records)
    }
}

/// Matrix columns must match the trained features in identity and order
pub(crate) fn check_columns(columns: &[String], trained: &[String]) -> Result<()> {
    if columns == trained {
        return Ok(());
    }
    let missing = trained
        .iter()
        .filter(|f| !columns.contains(f))
        .cloned()
        .collect();
    let unexpected = columns
        .iter()
        .filter(|c| !trained.contains(c))
        .cloned()
        .collect();
    Err(ScoringError::SchemaMismatch {
        missing,
        unexpected,
    })
}

/// Matrix width must equal the feature count the model input declares
pub(crate) fn check_input_width(declared: Option<usize>, columns: &[String]) -> Result<()> {
    let Some(width) = declared else {
        return Ok(());
    };
    if columns.len() == width {
        return Ok(());
    }
    let missing = (columns.len()..width).map(|i| format!("model input {i}")).collect();
    let unexpected = columns.iter().skip(width).cloned().collect();
    Err(ScoringError::SchemaMismatch {
        missing,
        unexpected,
    })
}

/// Classifier exported to ONNX and run with ONNX Runtime
pub struct OnnxModel {
    name: String,
    model: Mutex<LoadedModel>,
}

impl OnnxModel {
    pub fn new(model: LoadedModel) -> Self {
        Self {
            name: model.name.clone(),
            model: Mutex::new(model),
        }
    }
}

impl ProbabilityModel for OnnxModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn predict_proba(&self, matrix: &FeatureMatrix) -> Result<Vec<f64>> {
        let mut guard = self
            .model
            .lock()
            .map_err(|e| ScoringError::Model(format!("lock error: {e}")))?;
        let model: &mut LoadedModel = &mut guard;
        run_model(model, matrix)
    }
}

fn model_error(model_name: &str, e: impl std::fmt::Display) -> ScoringError {
    ScoringError::Model(format!("{model_name}: {e}"))
}

/// Run the session on the whole matrix as one `[rows, cols]` tensor
fn run_model(model: &mut LoadedModel, matrix: &FeatureMatrix) -> Result<Vec<f64>> {
    check_input_width(model.input_width, matrix.columns())?;

    let shape = vec![matrix.n_rows() as i64, matrix.n_cols() as i64];
    let input_tensor =
        Tensor::from_array((shape, matrix.to_f32())).map_err(|e| model_error(&model.name, e))?;

    let outputs = model
        .session
        .run(ort::inputs![&model.input_name => input_tensor])
        .map_err(|e| model_error(&model.name, e))?;

    extract_probabilities(&outputs, &model.output_name, &model.name, matrix.n_rows())
}

/// Extract positive-class probabilities from model output.
/// Handles tensor outputs and the seq(map) outputs of zipmapped classifiers.
fn extract_probabilities(
    outputs: &ort::session::SessionOutputs,
    output_name: &str,
    model_name: &str,
    n_rows: usize,
) -> Result<Vec<f64>> {
    if let Some(output) = outputs.get(output_name) {
        if let Some(probs) = try_extract(output, n_rows, model_name)? {
            return Ok(probs);
        }
    }

    for (name, output) in outputs.iter() {
        if name.contains("label") {
            continue;
        }
        if let Some(probs) = try_extract(&output, n_rows, model_name)? {
            debug!(model = %model_name, output = %name, "Extracted probabilities (fallback)");
            return Ok(probs);
        }
    }

    Err(ScoringError::Model(format!(
        "{model_name}: no probability output found"
    )))
}

fn try_extract(output: &DynValue, n_rows: usize, model_name: &str) -> Result<Option<Vec<f64>>> {
    if let Ok(tensor) = output.try_extract_tensor::<f32>() {
        let (shape, data) = tensor;
        let dims: Vec<i64> = shape.iter().copied().collect();
        return probabilities_from_tensor(&dims, data, n_rows)
            .map(Some)
            .map_err(|reason| model_error(model_name, reason));
    }

    let dtype = output.dtype();
    if DynSequenceValueType::can_downcast(&dtype) {
        return probabilities_from_sequence_map(output, n_rows, model_name).map(Some);
    }

    Ok(None)
}

/// Positive-class column of a `[rows, classes]` or `[rows]` tensor
fn probabilities_from_tensor(
    dims: &[i64],
    data: &[f32],
    n_rows: usize,
) -> std::result::Result<Vec<f64>, String> {
    let per_row: usize = match dims {
        [rows, classes] if *rows as usize == n_rows => *classes as usize,
        [len] if *len as usize == n_rows => 1,
        [len] if n_rows == 1 && *len >= 2 => *len as usize,
        _ => return Err(format!("unexpected output shape {dims:?} for {n_rows} rows")),
    };

    let column = match per_row {
        0 => return Err("output has no classes".to_string()),
        1 => 0,
        _ => 1,
    };
    if data.len() < n_rows * per_row {
        return Err(format!(
            "output holds {} values, expected {}",
            data.len(),
            n_rows * per_row
        ));
    }

    Ok((0..n_rows)
        .map(|i| f64::from(data[i * per_row + column]))
        .collect())
}

/// Probabilities from seq(map(int64, float)), one map per row
fn probabilities_from_sequence_map(
    output: &DynValue,
    n_rows: usize,
    model_name: &str,
) -> Result<Vec<f64>> {
    let allocator = Allocator::default();

    let sequence = output
        .downcast_ref::<DynSequenceValueType>()
        .map_err(|e| model_error(model_name, e))?;
    let maps = sequence
        .try_extract_sequence::<DynMapValueType>(&allocator)
        .map_err(|e| model_error(model_name, e))?;

    if maps.len() != n_rows {
        return Err(model_error(
            model_name,
            format!("sequence holds {} maps for {} rows", maps.len(), n_rows),
        ));
    }

    let mut probs = Vec::with_capacity(n_rows);
    for map_value in &maps {
        let kv_pairs = map_value
            .try_extract_key_values::<i64, f32>()
            .map_err(|e| model_error(model_name, e))?;
        probs.push(positive_class_probability(&kv_pairs).ok_or_else(|| {
            model_error(model_name, "no class probabilities in map")
        })?);
    }
    Ok(probs)
}

/// Class 1 probability, or the complement of class 0
fn positive_class_probability(pairs: &[(i64, f32)]) -> Option<f64> {
    pairs
        .iter()
        .find(|(class, _)| *class == 1)
        .map(|(_, p)| f64::from(*p))
        .or_else(|| {
            pairs
                .iter()
                .find(|(class, _)| *class == 0)
                .map(|(_, p)| 1.0 - f64::from(*p))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature_transformer::{FeatureSchema, UnseenCategoryPolicy};
    use serde_json::json;
    use std::sync::Arc;

    /// Probability is the `dti` column scaled into [0, 1]
    struct DtiModel;

    impl ProbabilityModel for DtiModel {
        fn name(&self) -> &str {
            "dti"
        }

        fn predict_proba(&self, matrix: &FeatureMatrix) -> Result<Vec<f64>> {
            let j = matrix
                .columns()
                .iter()
                .position(|c| c == "dti")
                .ok_or_else(|| ScoringError::Model("no dti column".to_string()))?;
            Ok(matrix.rows().map(|r| (r[j] / 100.0).clamp(0.0, 1.0)).collect())
        }
    }

    fn schema() -> Arc<FeatureSchema> {
        Arc::new(FeatureSchema::new(
            ["loan_amnt", "dti"],
            ["purpose"],
            ["loan_amnt", "dti", "purpose_car", "purpose_credit_card"],
        ))
    }

    fn records(value: Value) -> Vec<RawRecord> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_predict_records_keeps_row_positions() {
        let predictor = LocalPredictor::new(FeatureTransformer::new(schema()), DtiModel);
        let input = records(json!([
            {"loan_amnt": 5000, "dti": "27.5", "purpose": "car"},
            {"loan_amnt": 1000, "dti": null, "purpose": "car"},
            {"loan_amnt": 2000, "dti": 10, "purpose": "credit_card"}
        ]));

        let preds = predictor.predict_records(&input).unwrap();

        assert_eq!(preds.row_index, vec![0, 2]);
        assert_eq!(preds.p_default, vec![0.275, 0.1]);
    }

    #[test]
    fn test_extra_columns_surface_as_schema_mismatch() {
        let transformer = FeatureTransformer::new(schema()).with_policy(UnseenCategoryPolicy::Keep);
        let predictor = LocalPredictor::new(transformer, DtiModel);
        let input = records(json!([{"loan_amnt": 5000, "dti": 20, "purpose": "wedding"}]));

        match predictor.predict_records(&input) {
            Err(ScoringError::SchemaMismatch { missing, unexpected }) => {
                assert!(missing.is_empty());
                assert_eq!(unexpected, vec!["purpose_wedding".to_string()]);
            }
            other => panic!("expected schema mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_request_without_transform_uses_feature_rows() {
        let predictor = LocalPredictor::new(FeatureTransformer::new(schema()), DtiModel);
        let request: PredictRequest = serde_json::from_value(json!({
            "data": [{"loan_amnt": 5000, "dti": 50, "purpose_car": 1, "purpose_credit_card": 0}],
            "transform": 0
        }))
        .unwrap();
        assert!(!request.transform);

        let preds = predictor.predict(&request).unwrap();
        assert_eq!(preds, Predictions::aligned(vec![0.5]));

        let raw: PredictRequest = serde_json::from_value(json!({
            "data": [{"loan_amnt": 5000, "dti": 50, "purpose": "car"}],
            "transform": 0
        }))
        .unwrap();
        assert!(matches!(
            predictor.predict(&raw),
            Err(ScoringError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn test_transform_flag_defaults_on() {
        let request: PredictRequest =
            serde_json::from_value(json!({"data": []})).unwrap();
        assert!(request.transform);

        let request: PredictRequest =
            serde_json::from_value(json!({"data": [], "transform": true})).unwrap();
        assert!(request.transform);

        assert!(serde_json::from_value::<PredictRequest>(json!({"data": [], "transform": "yes"})).is_err());
    }

    #[test]
    fn test_probability_count_mismatch_is_an_error() {
        struct ShortModel;
        impl ProbabilityModel for ShortModel {
            fn name(&self) -> &str {
                "short"
            }
            fn predict_proba(&self, _: &FeatureMatrix) -> Result<Vec<f64>> {
                Ok(vec![0.5])
            }
        }

        let predictor = LocalPredictor::new(FeatureTransformer::new(schema()), ShortModel);
        let input = records(json!([
            {"loan_amnt": 5000, "dti": 20, "purpose": "car"},
            {"loan_amnt": 5000, "dti": 20, "purpose": "car"}
        ]));
        assert!(matches!(predictor.predict_records(&input), Err(ScoringError::Model(_))));
    }

    #[test]
    fn test_input_width_must_match_model() {
        let columns: Vec<String> = ["loan_amnt", "dti", "purpose_car"]
            .iter()
            .map(|c| c.to_string())
            .collect();

        assert!(check_input_width(None, &columns).is_ok());
        assert!(check_input_width(Some(3), &columns).is_ok());

        match check_input_width(Some(2), &columns) {
            Err(ScoringError::SchemaMismatch { missing, unexpected }) => {
                assert!(missing.is_empty());
                assert_eq!(unexpected, vec!["purpose_car".to_string()]);
            }
            other => panic!("expected schema mismatch, got {other:?}"),
        }
        match check_input_width(Some(5), &columns) {
            Err(ScoringError::SchemaMismatch { missing, unexpected }) => {
                assert_eq!(missing, vec!["model input 3".to_string(), "model input 4".to_string()]);
                assert!(unexpected.is_empty());
            }
            other => panic!("expected schema mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_probabilities_from_tensor_shapes() {
        let two_class = [0.9_f32, 0.1, 0.25, 0.75];
        assert_eq!(
            probabilities_from_tensor(&[2, 2], &two_class, 2).unwrap(),
            vec![f64::from(0.1_f32), f64::from(0.75_f32)]
        );

        let single = [0.3_f32, 0.6];
        assert_eq!(
            probabilities_from_tensor(&[2, 1], &single, 2).unwrap(),
            vec![f64::from(0.3_f32), f64::from(0.6_f32)]
        );
        assert_eq!(
            probabilities_from_tensor(&[2], &single, 2).unwrap(),
            vec![f64::from(0.3_f32), f64::from(0.6_f32)]
        );
        assert_eq!(
            probabilities_from_tensor(&[2], &single, 1).unwrap(),
            vec![f64::from(0.6_f32)]
        );
        assert!(probabilities_from_tensor(&[3, 2], &two_class, 2).is_err());
    }

    #[test]
    fn test_positive_class_probability() {
        assert_eq!(positive_class_probability(&[(0, 0.75), (1, 0.25)]), Some(0.25));
        assert_eq!(positive_class_probability(&[(0, 0.75)]), Some(0.25));
        assert_eq!(positive_class_probability(&[]), None);
    }
}
