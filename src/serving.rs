//! HTTP model server exposing the local predictor.
//!
//! `POST /predict` (also `POST /`) takes `{"data": [records], "transform": 1}`
//! and answers with one bracketed probability per record, e.g. `[0.12],[0.34]`.

use crate::error::ScoringError;
use crate::models::batch_endpoint::format_bracketed_floats;
use crate::models::inference::{LocalPredictor, PredictRequest, ProbabilityModel};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Predictor shared by every request
pub type SharedPredictor = Arc<LocalPredictor<Box<dyn ProbabilityModel>>>;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    model: String,
    features: usize,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    dropped_rows: Vec<usize>,
}

/// Error returned from the prediction handler
#[derive(Debug)]
enum ServeError {
    /// The transformer dropped rows, so probabilities would misalign
    DroppedRows(Vec<usize>),
    Scoring(ScoringError),
}

impl IntoResponse for ServeError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ServeError::DroppedRows(rows) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                ErrorResponse {
                    error: format!("{} records have missing feature values", rows.len()),
                    dropped_rows: rows,
                },
            ),
            ServeError::Scoring(e) => {
                let status = if e.is_input_error() {
                    StatusCode::UNPROCESSABLE_ENTITY
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                };
                (
                    status,
                    ErrorResponse {
                        error: e.to_string(),
                        dropped_rows: Vec::new(),
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

/// Build the model server router.
pub fn router(predictor: SharedPredictor) -> Router {
    Router::new()
        .route("/", post(predict_handler))
        .route("/predict", post(predict_handler))
        .route("/health", get(health_handler))
        .with_state(predictor)
}

/// `GET /health`
async fn health_handler(State(predictor): State<SharedPredictor>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        model: predictor.model().name().to_string(),
        features: predictor.schema().feature_count(),
    })
}

/// `POST /predict`
async fn predict_handler(
    State(predictor): State<SharedPredictor>,
    Json(request): Json<PredictRequest>,
) -> Result<String, ServeError> {
    let predictions = predictor.predict(&request).map_err(|e| {
        warn!(error = %e, records = request.data.len(), "Prediction failed");
        ServeError::Scoring(e)
    })?;

    if predictions.len() != request.data.len() {
        let dropped: Vec<usize> = (0..request.data.len())
            .filter(|i| !predictions.row_index.contains(i))
            .collect();
        warn!(dropped = ?dropped, "Rejecting request with unscorable records");
        return Err(ServeError::DroppedRows(dropped));
    }

    info!(records = predictions.len(), "Prediction served");
    Ok(format_bracketed_floats(&predictions.p_default))
}

/// Bind and serve until the process is stopped.
pub async fn run_server(predictor: SharedPredictor, bind_addr: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = %listener.local_addr()?, "Model server listening");
    axum::serve(listener, router(predictor)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::feature_transformer::{FeatureMatrix, FeatureSchema, FeatureTransformer};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::json;
    use tower::ServiceExt;

    /// Probability is the `dti` column scaled into [0, 1]
    struct DtiModel;

    impl ProbabilityModel for DtiModel {
        fn name(&self) -> &str {
            "dti"
        }

        fn predict_proba(&self, matrix: &FeatureMatrix) -> Result<Vec<f64>> {
            let dti = matrix
                .column("dti")
                .ok_or_else(|| ScoringError::Model("no dti column".to_string()))?;
            Ok(dti.iter().map(|v| (v / 100.0).clamp(0.0, 1.0)).collect())
        }
    }

    fn make_app() -> Router {
        let schema = Arc::new(FeatureSchema::new(
            ["loan_amnt", "dti"],
            ["purpose"],
            ["loan_amnt", "dti", "purpose_car", "purpose_credit_card"],
        ));
        let model: Box<dyn ProbabilityModel> = Box::new(DtiModel);
        router(Arc::new(LocalPredictor::new(FeatureTransformer::new(schema), model)))
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_text(resp: Response) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = make_app().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["model"], "dti");
        assert_eq!(json["features"], 4);
    }

    #[tokio::test]
    async fn test_predict_returns_bracketed_floats() {
        let req = post_json(
            "/predict",
            json!({
                "data": [
                    {"loan_amnt": 5000, "dti": 12, "purpose": "car"},
                    {"loan_amnt": 9000, "dti": 50, "purpose": "credit_card"}
                ],
                "transform": 1
            }),
        );
        let resp = make_app().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp).await, "[0.12],[0.5]");
    }

    #[tokio::test]
    async fn test_root_route_accepts_predictions() {
        let req = post_json("/", json!({"data": [{"loan_amnt": 1, "dti": 25, "purpose": "car"}]}));
        let resp = make_app().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp).await, "[0.25]");
    }

    #[tokio::test]
    async fn test_dropped_rows_are_rejected() {
        let req = post_json(
            "/predict",
            json!({"data": [
                {"loan_amnt": 5000, "dti": 12, "purpose": "car"},
                {"loan_amnt": 5000, "dti": null, "purpose": "car"}
            ]}),
        );
        let resp = make_app().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let json: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(json["dropped_rows"], json!([1]));
    }

    #[tokio::test]
    async fn test_schema_mismatch_is_input_error() {
        let req = post_json(
            "/predict",
            json!({"data": [{"loan_amnt": 5000, "dti": 12}], "transform": 0}),
        );
        let resp = make_app().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body_text(resp).await.contains("schema mismatch"));
    }
}
