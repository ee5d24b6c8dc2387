//! Client for a model server speaking the leapframe envelope.
//!
//! The server loads a serialized pipeline with `PUT /model` and scores one
//! row at a time with `POST /transform`. The response row carries the class
//! probabilities second to last and the predicted class last.

use crate::error::{Result, ScoringError};
use crate::feature_transformer::FeatureTransformer;
use crate::models::inference::{check_columns, Predictions, ProbabilitySource};
use crate::types::loan::RawRecord;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

/// Field declaration inside a leapframe schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeapFrameField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeapFrameSchema {
    pub fields: Vec<LeapFrameField>,
}

impl LeapFrameSchema {
    /// All fields declared as doubles, in model input order
    pub fn doubles(names: &[String]) -> Self {
        Self {
            fields: names
                .iter()
                .map(|name| LeapFrameField {
                    name: name.clone(),
                    field_type: "double".to_string(),
                })
                .collect(),
        }
    }
}

/// Request envelope for `POST /transform`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeapFrame {
    pub schema: LeapFrameSchema,
    pub rows: Vec<Vec<f64>>,
}

/// Predicted class and per-class probabilities for one row
#[derive(Debug, Clone, PartialEq)]
pub struct LeapFramePrediction {
    pub class: f64,
    pub probabilities: Vec<f64>,
}

impl LeapFramePrediction {
    /// Probability of the positive class
    pub fn positive(&self) -> Option<f64> {
        self.probabilities.get(1).copied()
    }
}

/// Read the prediction out of a `POST /transform` response body
pub fn parse_transform_response(body: &Value) -> std::result::Result<LeapFramePrediction, String> {
    let row = body
        .get("rows")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .and_then(Value::as_array)
        .ok_or("response has no rows")?;

    if row.len() < 2 {
        return Err(format!("response row has {} entries, expected at least 2", row.len()));
    }
    let class = row[row.len() - 1]
        .as_f64()
        .ok_or("predicted class is not a number")?;
    let probabilities = row[row.len() - 2]
        .get("values")
        .and_then(Value::as_array)
        .ok_or("class probabilities missing `values`")?
        .iter()
        .map(|v| v.as_f64().ok_or("class probability is not a number"))
        .collect::<std::result::Result<Vec<f64>, _>>()?;

    Ok(LeapFramePrediction {
        class,
        probabilities,
    })
}

/// Leapframe model server client
pub struct LeapframeClient {
    base_url: String,
    client: Client,
    transformer: FeatureTransformer,
    schema: LeapFrameSchema,
}

impl LeapframeClient {
    pub fn new(
        base_url: impl Into<String>,
        transformer: FeatureTransformer,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| ScoringError::http(&base_url, e))?;
        let schema = LeapFrameSchema::doubles(&transformer.schema().trained_features);

        Ok(Self {
            base_url,
            client,
            transformer,
            schema,
        })
    }

    pub fn schema(&self) -> &LeapFrameSchema {
        &self.schema
    }

    /// Ask the server to load a serialized model bundle
    pub async fn load_model(&self, path: &str) -> Result<()> {
        let url = format!("{}/model", self.base_url);
        let resp = self
            .client
            .put(&url)
            .json(&json!({ "path": path }))
            .send()
            .await
            .map_err(|e| ScoringError::http(&url, e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ScoringError::RemoteStatus {
                endpoint: url,
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        info!(path = %path, "Model loaded on leapframe server");
        Ok(())
    }

    /// Score one feature row
    pub async fn transform_row(&self, row: &[f64]) -> Result<LeapFramePrediction> {
        let url = format!("{}/transform", self.base_url);
        let frame = LeapFrame {
            schema: self.schema.clone(),
            rows: vec![row.to_vec()],
        };

        let resp = self
            .client
            .post(&url)
            .json(&frame)
            .send()
            .await
            .map_err(|e| ScoringError::http(&url, e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ScoringError::RemoteStatus {
                endpoint: url,
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| ScoringError::malformed(&url, e.to_string()))?;
        parse_transform_response(&body).map_err(|reason| ScoringError::malformed(&url, reason))
    }
}

#[async_trait]
impl ProbabilitySource for LeapframeClient {
    fn name(&self) -> &str {
        "leapframe"
    }

    async fn predict_default_probability(&self, records: &[RawRecord]) -> Result<Predictions> {
        let matrix = self.transformer.transform(records)?;
        check_columns(matrix.columns(), &self.transformer.schema().trained_features)?;

        let mut p_default = Vec::with_capacity(matrix.n_rows());
        for (i, row) in matrix.rows().enumerate() {
            let prediction = self.transform_row(row).await?;
            let p = prediction.positive().ok_or_else(|| {
                ScoringError::malformed(
                    &self.base_url,
                    format!("row {i}: {} class probabilities", prediction.probabilities.len()),
                )
            })?;
            debug!(row = matrix.row_index()[i], class = prediction.class, p_default = p, "Scored row");
            p_default.push(p);
        }

        Ok(Predictions {
            row_index: matrix.row_index().to_vec(),
            p_default,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_envelope_shape() {
        let frame = LeapFrame {
            schema: LeapFrameSchema::doubles(&["loan_amnt".to_string(), "term_ 36 months".to_string()]),
            rows: vec![vec![5000.0, 1.0]],
        };

        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({
                "schema": {"fields": [
                    {"name": "loan_amnt", "type": "double"},
                    {"name": "term_ 36 months", "type": "double"}
                ]},
                "rows": [[5000.0, 1.0]]
            })
        );
    }

    #[test]
    fn test_parse_transform_response() {
        let body = json!({
            "schema": {"fields": []},
            "rows": [[5000.0, 1.0, {"values": [0.8, 0.2]}, 0.0]]
        });
        let prediction = parse_transform_response(&body).unwrap();
        assert_eq!(prediction.class, 0.0);
        assert_eq!(prediction.probabilities, vec![0.8, 0.2]);
        assert_eq!(prediction.positive(), Some(0.2));
    }

    #[test]
    fn test_parse_transform_response_rejects_bad_shapes() {
        assert!(parse_transform_response(&json!({"rows": []})).is_err());
        assert!(parse_transform_response(&json!({"rows": [[1.0]]})).is_err());
        assert!(parse_transform_response(&json!({"rows": [[{"values": [0.5]}, "yes"]]})).is_err());
        assert!(parse_transform_response(&json!({"rows": [[{"probs": [0.5]}, 1.0]]})).is_err());
    }
}
