//! Loan Default Scoring Library
//!
//! Scores daily batches of loan applications: a trained classifier estimates
//! each loan's probability of default, amortization math turns that into an
//! expected profit, and loans clearing a profit threshold are selected.

pub mod config;
pub mod error;
pub mod feature_transformer;
pub mod metrics;
pub mod models;
pub mod profit;
pub mod scoring;
pub mod serving;
pub mod storage;
pub mod types;

pub use config::AppConfig;
pub use error::{Result, ScoringError};
pub use feature_transformer::{FeatureMatrix, FeatureSchema, FeatureTransformer, UnseenCategoryPolicy};
pub use metrics::BatchMetrics;
pub use models::inference::{LocalPredictor, OnnxModel, ProbabilitySource};
pub use profit::{calculate_expected_profit, ProfitBreakdown};
pub use scoring::{select_loans, LoanScorer};
pub use storage::{ArtifactCache, ObjectStore};
pub use types::{LoanRecord, RawRecord, ScoredBatch, ScoredLoan, Term};
