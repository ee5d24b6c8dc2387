//! Scored loan data structures

use crate::metrics::BatchMetrics;
use crate::profit::ProfitBreakdown;
use crate::types::loan::RawRecord;
use chrono::{DateTime, Utc};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

/// Output names owned by the scorer. Raw fields with these names are not emitted.
const COMPUTED_FIELDS: [&str; 5] = ["id", "p_default", "monthly_payment", "profit", "expected_profit"];

/// A raw loan record with its default probability and profit figures attached
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScoredLoan {
    /// Position of the record in its batch
    pub id: usize,

    /// Original record fields
    #[serde(flatten)]
    pub record: RawRecord,

    /// Probability of default (0.0 - 1.0)
    pub p_default: f64,

    /// Amortized monthly payment
    pub monthly_payment: f64,

    /// Profit if the loan is held to maturity
    pub profit: f64,

    /// Probability-weighted profit
    pub expected_profit: f64,
}

impl ScoredLoan {
    pub fn new(id: usize, record: RawRecord, p_default: f64, breakdown: ProfitBreakdown) -> Self {
        Self {
            id,
            record,
            p_default,
            monthly_payment: breakdown.monthly_payment,
            profit: breakdown.profit,
            expected_profit: breakdown.expected_profit,
        }
    }

    /// Whether the loan clears the expected profit threshold
    pub fn meets_threshold(&self, threshold: f64) -> bool {
        self.expected_profit >= threshold
    }
}

impl Serialize for ScoredLoan {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let raw = self
            .record
            .iter()
            .filter(|(key, _)| !COMPUTED_FIELDS.contains(&key.as_str()));

        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("id", &self.id)?;
        for (key, value) in raw {
            map.serialize_entry(key, value)?;
        }
        map.serialize_entry("p_default", &self.p_default)?;
        map.serialize_entry("monthly_payment", &self.monthly_payment)?;
        map.serialize_entry("profit", &self.profit)?;
        map.serialize_entry("expected_profit", &self.expected_profit)?;
        map.end()
    }
}

/// Result of scoring one daily batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredBatch {
    /// Unique run identifier
    pub run_id: String,

    /// When the batch was scored
    pub scored_at: DateTime<Utc>,

    /// Expected profit threshold applied
    pub threshold: f64,

    /// Every scored loan, in batch order
    pub loans: Vec<ScoredLoan>,

    /// Positions of loans with `expected_profit >= threshold`
    pub best_loan_ids: Vec<usize>,

    /// Positions the transformer dropped for missing values
    pub unscored_ids: Vec<usize>,

    /// Counters and timings for the run
    pub metrics: BatchMetrics,
}

impl ScoredBatch {
    /// Loans that met the threshold, in batch order
    pub fn best_loans(&self) -> impl Iterator<Item = &ScoredLoan> {
        self.loans.iter().filter(|l| l.meets_threshold(self.threshold))
    }

    /// Look up a scored loan by its batch position
    pub fn get(&self, id: usize) -> Option<&ScoredLoan> {
        self.loans.iter().find(|l| l.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scored_loan_serializes_flat() {
        let mut record = RawRecord::new();
        record.insert("loan_amnt".to_string(), json!("5000.0"));
        record.insert("purpose".to_string(), json!("credit_card"));

        let loan = ScoredLoan::new(
            7,
            record,
            0.2,
            ProfitBreakdown {
                monthly_payment: 162.87,
                profit: 863.16,
                expected_profit: -309.47,
            },
        );

        let value = serde_json::to_value(&loan).unwrap();
        assert_eq!(value["id"], 7);
        assert_eq!(value["purpose"], "credit_card");
        assert_eq!(value["p_default"], 0.2);
        assert!(!loan.meets_threshold(0.0));
    }

    #[test]
    fn test_computed_fields_replace_raw_keys() {
        let record: RawRecord = serde_json::from_value(json!({
            "id": 1077501,
            "loan_amnt": 5000,
            "profit": "n/a"
        }))
        .unwrap();
        let breakdown = ProfitBreakdown {
            monthly_payment: 162.87,
            profit: 863.16,
            expected_profit: 518.43,
        };
        let loan = ScoredLoan::new(2, record, 0.1, breakdown);

        let text = serde_json::to_string(&loan).unwrap();
        assert_eq!(text.matches("\"id\"").count(), 1);
        assert_eq!(text.matches("\"profit\"").count(), 1);
        assert!(text.starts_with("{\"id\":2,"));

        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["profit"], 863.16);
        assert_eq!(value["loan_amnt"], 5000);
    }
}
