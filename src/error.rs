//! Error taxonomy for the scoring pipeline.
//!
//! Every failure is fatal for the batch it occurs in; nothing in the library
//! retries or recovers locally.

/// Errors raised by the scoring pipeline.
#[derive(Debug, thiserror::Error)]
pub enum ScoringError {
    /// The requested artifact key does not exist in the store.
    #[error("artifact not found: {key}")]
    ArtifactNotFound { key: String },

    /// The store could not serve or accept an artifact.
    #[error("storage error for {key}: {reason}")]
    Storage { key: String, reason: String },

    /// An artifact was fetched but could not be decoded.
    #[error("failed to decode artifact {key}: {reason}")]
    ArtifactDecode { key: String, reason: String },

    /// A record value could not be coerced to a number.
    #[error("record {row}: field `{field}` has unparseable value {value}")]
    Coercion {
        row: usize,
        field: String,
        value: String,
    },

    /// A record lacks a field the profit math needs.
    #[error("record {row}: missing required field `{field}`")]
    MissingField { row: usize, field: String },

    /// A loan term could not be read as a positive number of months.
    #[error("record {row}: invalid loan term {value}")]
    InvalidTerm { row: usize, value: String },

    /// Matrix columns differ from the features the model was trained on.
    #[error("feature schema mismatch: missing {missing:?}, unexpected {unexpected:?}")]
    SchemaMismatch {
        missing: Vec<String>,
        unexpected: Vec<String>,
    },

    /// The classifier failed to produce probabilities.
    #[error("model error: {0}")]
    Model(String),

    /// A remote endpoint could not be reached.
    #[error("request to {endpoint} failed: {source}")]
    Http {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    /// A remote endpoint answered with a non-success status.
    #[error("{endpoint} answered {status}: {body}")]
    RemoteStatus {
        endpoint: String,
        status: u16,
        body: String,
    },

    /// A remote endpoint answered with an unexpected body.
    #[error("malformed response from {endpoint}: {reason}")]
    MalformedResponse { endpoint: String, reason: String },

    /// Amortization needs a strictly positive rate.
    #[error("record {row}: interest rate {int_rate} must be positive to amortize")]
    NonPositiveRate { row: usize, int_rate: f64 },

    /// Probability of default outside the unit interval.
    #[error("record {row}: probability of default {p_default} is outside [0, 1]")]
    InvalidProbability { row: usize, p_default: f64 },

    /// The profit math produced NaN or infinity.
    #[error("record {row}: amortization produced a non-finite value")]
    NonFinite { row: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ScoringError {
    /// Whether the error was caused by the caller's input rather than by the
    /// pipeline or its collaborators.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            ScoringError::Coercion { .. }
                | ScoringError::MissingField { .. }
                | ScoringError::InvalidTerm { .. }
                | ScoringError::SchemaMismatch { .. }
                | ScoringError::NonPositiveRate { .. }
                | ScoringError::InvalidProbability { .. }
        )
    }

    pub(crate) fn http(endpoint: &str, source: reqwest::Error) -> Self {
        ScoringError::Http {
            endpoint: endpoint.to_string(),
            source,
        }
    }

    pub(crate) fn malformed(endpoint: &str, reason: impl Into<String>) -> Self {
        ScoringError::MalformedResponse {
            endpoint: endpoint.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ScoringError>;
