//! Loan scoring orchestration: load, predict, price, select.

use crate::error::{Result, ScoringError};
use crate::metrics::BatchMetrics;
use crate::models::inference::ProbabilitySource;
use crate::profit::calculate_expected_profit;
use crate::storage::ArtifactCache;
use crate::types::{LoanRecord, RawRecord, ScoredBatch, ScoredLoan};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Positions of loans whose expected profit meets the threshold, in batch order
pub fn select_loans(loans: &[ScoredLoan], threshold: f64) -> Vec<usize> {
    loans
        .iter()
        .filter(|l| l.meets_threshold(threshold))
        .map(|l| l.id)
        .collect()
}

/// Scores daily loan batches against a probability source
pub struct LoanScorer {
    source: Arc<dyn ProbabilitySource>,
    threshold: f64,
}

impl LoanScorer {
    pub fn new(source: Arc<dyn ProbabilitySource>, threshold: f64) -> Self {
        Self { source, threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Pull the batch stored under `batch_key` and score it
    pub async fn run(&self, artifacts: &ArtifactCache, batch_key: &str) -> Result<ScoredBatch> {
        let start = Instant::now();
        let records: Vec<RawRecord> = artifacts.pull_json(batch_key).await?;
        let load_time = start.elapsed();
        info!(key = %batch_key, records = records.len(), "Loan batch loaded");

        let mut batch = self.score_loans(records).await?;
        batch.metrics.record_load_time(load_time);
        Ok(batch)
    }

    /// Score a batch of raw records.
    ///
    /// Only rows the source returned a probability for are coerced and priced;
    /// the rest are reported in `unscored_ids`.
    pub async fn score_loans(&self, records: Vec<RawRecord>) -> Result<ScoredBatch> {
        let run_id = Uuid::new_v4().to_string();
        let mut metrics = BatchMetrics::new(records.len());

        let start = Instant::now();
        let predictions = self.source.predict_default_probability(&records).await?;
        metrics.record_predict_time(start.elapsed());
        debug!(
            run_id = %run_id,
            source = %self.source.name(),
            predicted = predictions.len(),
            "Default probabilities attached"
        );

        let start = Instant::now();
        let mut slots: Vec<Option<RawRecord>> = records.into_iter().map(Some).collect();
        let mut predicted = Vec::with_capacity(predictions.len());
        for (row, p_default) in predictions.iter() {
            let raw = slots.get_mut(row).and_then(Option::take).ok_or_else(|| {
                ScoringError::Model(format!(
                    "{} returned a probability for unknown or repeated row {row}",
                    self.source.name()
                ))
            })?;
            let loan = LoanRecord::from_raw(row, &raw)?;
            predicted.push((raw, loan, p_default));
        }

        let breakdowns =
            calculate_expected_profit(predicted.iter().map(|(_, loan, p)| (loan, *p)))?;
        let loans: Vec<ScoredLoan> = predicted
            .into_iter()
            .zip(breakdowns)
            .map(|((raw, loan, p_default), breakdown)| {
                metrics.record_loan(p_default, breakdown.expected_profit);
                ScoredLoan::new(loan.row, raw, p_default, breakdown)
            })
            .collect();
        metrics.record_profit_time(start.elapsed());

        let unscored_ids: Vec<usize> = slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(row, _)| row)
            .collect();
        if !unscored_ids.is_empty() {
            warn!(run_id = %run_id, unscored = ?unscored_ids, "Loans left unscored");
        }
        metrics.record_unscored(unscored_ids.len());

        let best_loan_ids = select_loans(&loans, self.threshold);
        for loan in loans.iter().filter(|l| l.meets_threshold(self.threshold)) {
            metrics.record_selected(loan.expected_profit);
        }

        info!(
            run_id = %run_id,
            scored = loans.len(),
            selected = best_loan_ids.len(),
            threshold = self.threshold,
            "Loan batch scored"
        );

        Ok(ScoredBatch {
            run_id,
            scored_at: Utc::now(),
            threshold: self.threshold,
            loans,
            best_loan_ids,
            unscored_ids,
            metrics,
        })
    }
}
