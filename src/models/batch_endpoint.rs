//! Client for a deployed batch scoring endpoint

use crate::error::{Result, ScoringError};
use crate::models::inference::{Predictions, ProbabilitySource};
use crate::types::loan::RawRecord;
use async_trait::async_trait;
use reqwest::header::COOKIE;
use reqwest::{Client, RequestBuilder};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

/// Cookie name the hosted data science platform expects
pub const DEFAULT_COOKIE_NAME: &str = "datascience-platform";

/// How the endpoint authenticates callers
#[derive(Debug, Clone, PartialEq)]
pub enum Credential {
    /// `Cookie: <name>=<secret>`
    Cookie { name: String, secret: String },
    /// `Authorization: Bearer <secret>`
    Bearer(String),
    None,
}

impl Credential {
    pub fn cookie(secret: impl Into<String>) -> Self {
        Credential::Cookie {
            name: DEFAULT_COOKIE_NAME.to_string(),
            secret: secret.into(),
        }
    }

    fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            Credential::Cookie { name, secret } => request.header(COOKIE, format!("{name}={secret}")),
            Credential::Bearer(secret) => request.bearer_auth(secret),
            Credential::None => request,
        }
    }
}

#[derive(Serialize)]
struct BatchRequest<'a> {
    data: &'a [RawRecord],
}

/// Parse a body like `[0.12],[0.34]` into one probability per entry
pub fn parse_bracketed_floats(body: &str) -> std::result::Result<Vec<f64>, String> {
    let body = body.trim().trim_matches('"');
    let stripped: String = body.chars().filter(|c| *c != '[' && *c != ']').collect();
    if stripped.trim().is_empty() {
        return Ok(Vec::new());
    }

    stripped
        .split(',')
        .map(|piece| {
            let piece = piece.trim();
            piece
                .parse::<f64>()
                .map_err(|_| format!("`{piece}` is not a probability"))
        })
        .collect()
}

/// Inverse of [`parse_bracketed_floats`]
pub fn format_bracketed_floats(values: &[f64]) -> String {
    values
        .iter()
        .map(|v| format!("[{v}]"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Batch endpoint client: one request per batch
pub struct BatchEndpointClient {
    url: String,
    client: Client,
    credential: Credential,
}

impl BatchEndpointClient {
    pub fn new(url: impl Into<String>, credential: Credential, timeout: Option<Duration>) -> Result<Self> {
        let url = url.into();
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(|e| ScoringError::http(&url, e))?;

        info!(endpoint = %url, "Batch endpoint client ready");
        Ok(Self {
            url,
            client,
            credential,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send the records and return the raw probability list
    pub async fn score(&self, records: &[RawRecord]) -> Result<Vec<f64>> {
        let request = self
            .client
            .post(&self.url)
            .json(&BatchRequest { data: records });
        let resp = self
            .credential
            .apply(request)
            .send()
            .await
            .map_err(|e| ScoringError::http(&self.url, e))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| ScoringError::http(&self.url, e))?;
        if !status.is_success() {
            return Err(ScoringError::RemoteStatus {
                endpoint: self.url.clone(),
                status: status.as_u16(),
                body,
            });
        }

        let probabilities =
            parse_bracketed_floats(&body).map_err(|reason| ScoringError::malformed(&self.url, reason))?;
        debug!(endpoint = %self.url, count = probabilities.len(), "Batch scored remotely");
        Ok(probabilities)
    }
}

#[async_trait]
impl ProbabilitySource for BatchEndpointClient {
    fn name(&self) -> &str {
        "batch_endpoint"
    }

    async fn predict_default_probability(&self, records: &[RawRecord]) -> Result<Predictions> {
        let probabilities = self.score(records).await?;
        if probabilities.len() != records.len() {
            return Err(ScoringError::malformed(
                &self.url,
                format!(
                    "{} probabilities for {} records",
                    probabilities.len(),
                    records.len()
                ),
            ));
        }
        Ok(Predictions::aligned(probabilities))
    }
}
