//! Loan record data structures and the coercion boundary for loosely typed input.

use crate::error::{Result, ScoringError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// A raw loan record as it arrives from storage or over the wire.
///
/// Values are loosely typed: numeric fields are sometimes stringified
/// (`"5000.0"`), the term is text (`" 36 months"`).
pub type RawRecord = serde_json::Map<String, Value>;

/// Outcome of coercing one loosely typed value to a number.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Numeric {
    Value(f64),
    Missing,
    Invalid,
}

/// Coerce a JSON value to `f64`.
///
/// Null, empty strings and NaN are missing. Booleans map to 0/1.
pub(crate) fn coerce_numeric(value: &Value) -> Numeric {
    let parsed = match value {
        Value::Null => return Numeric::Missing,
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Numeric::Missing;
            }
            trimmed.parse::<f64>().ok()
        }
        Value::Array(_) | Value::Object(_) => None,
    };

    match parsed {
        Some(v) if v.is_nan() => Numeric::Missing,
        Some(v) => Numeric::Value(v),
        None => Numeric::Invalid,
    }
}

/// Loan term in months.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Term {
    months: u32,
}

impl Term {
    pub fn new(months: u32) -> Self {
        Self { months }
    }

    pub fn months(self) -> u32 {
        self.months
    }

    /// Read a term from a JSON value: `" 36 months"`, `"60"` or `36`.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => s.parse().ok(),
            Value::Number(n) => n
                .as_u64()
                .and_then(|m| u32::try_from(m).ok())
                .filter(|&m| m > 0)
                .map(Term::new),
            _ => None,
        }
    }
}

impl FromStr for Term {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let months = parts
            .next()
            .and_then(|n| n.parse::<u32>().ok())
            .filter(|&m| m > 0)
            .ok_or_else(|| format!("no month count in {s:?}"))?;

        match parts.next() {
            None | Some("month") | Some("months") => Ok(Term::new(months)),
            Some(unit) => Err(format!("unexpected term unit {unit:?}")),
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} months", self.months)
    }
}

/// Typed view of the loan terms the profit calculation needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanRecord {
    /// Position of the record in its batch
    pub row: usize,

    /// Principal
    pub loan_amnt: f64,

    /// Annual interest rate as a percentage (10.65 means 10.65%)
    pub int_rate: f64,

    /// Term of the loan
    pub term: Term,
}

impl LoanRecord {
    /// Create a loan record from already typed values.
    pub fn new(row: usize, loan_amnt: f64, int_rate: f64, term: Term) -> Self {
        Self {
            row,
            loan_amnt,
            int_rate,
            term,
        }
    }

    /// Coerce a raw record into typed loan terms.
    pub fn from_raw(row: usize, raw: &RawRecord) -> Result<Self> {
        let loan_amnt = required_number(row, raw, "loan_amnt")?;
        let int_rate = required_number(row, raw, "int_rate")?;

        let term_value = raw
            .get("term")
            .filter(|v| !v.is_null())
            .ok_or_else(|| ScoringError::MissingField {
                row,
                field: "term".to_string(),
            })?;
        let term = Term::from_value(term_value).ok_or_else(|| ScoringError::InvalidTerm {
            row,
            value: term_value.to_string(),
        })?;

        Ok(Self {
            row,
            loan_amnt,
            int_rate,
            term,
        })
    }
}

fn required_number(row: usize, raw: &RawRecord, field: &str) -> Result<f64> {
    let value = raw.get(field).unwrap_or(&Value::Null);
    match coerce_numeric(value) {
        Numeric::Value(v) => Ok(v),
        Numeric::Missing => Err(ScoringError::MissingField {
            row,
            field: field.to_string(),
        }),
        Numeric::Invalid => Err(ScoringError::Coercion {
            row,
            field: field.to_string(),
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> RawRecord {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn test_from_raw_coerces_stringified_numbers() {
        let raw = record(json!({
            "addr_state": "AZ",
            "int_rate": "10.65",
            "loan_amnt": "5000.0",
            "term": " 36 months"
        }));

        let loan = LoanRecord::from_raw(0, &raw).unwrap();
        assert_eq!(loan.loan_amnt, 5000.0);
        assert_eq!(loan.int_rate, 10.65);
        assert_eq!(loan.term.months(), 36);
    }

    #[test]
    fn test_from_raw_rejects_unparseable_amount() {
        let raw = record(json!({
            "int_rate": 10.65,
            "loan_amnt": "five thousand",
            "term": "36 months"
        }));

        match LoanRecord::from_raw(3, &raw) {
            Err(ScoringError::Coercion { row, field, .. }) => {
                assert_eq!(row, 3);
                assert_eq!(field, "loan_amnt");
            }
            other => panic!("expected coercion error, got {other:?}"),
        }
    }

    #[test]
    fn test_from_raw_reports_missing_term() {
        let raw = record(json!({"int_rate": 10.65, "loan_amnt": 5000, "term": null}));
        assert!(matches!(
            LoanRecord::from_raw(0, &raw),
            Err(ScoringError::MissingField { field, .. }) if field == "term"
        ));
    }

    #[test]
    fn test_term_parsing() {
        assert_eq!(" 36 months".parse::<Term>().unwrap().months(), 36);
        assert_eq!("60".parse::<Term>().unwrap().months(), 60);
        assert!("months".parse::<Term>().is_err());
        assert!("0 months".parse::<Term>().is_err());
        assert!("36 years".parse::<Term>().is_err());
        assert_eq!(Term::from_value(&json!(60)).unwrap().months(), 60);
        assert!(Term::from_value(&json!(36.5)).is_none());
    }

    #[test]
    fn test_coerce_numeric_edge_cases() {
        assert_eq!(coerce_numeric(&json!(" 3.5 ")), Numeric::Value(3.5));
        assert_eq!(coerce_numeric(&json!("")), Numeric::Missing);
        assert_eq!(coerce_numeric(&json!("NaN")), Numeric::Missing);
        assert_eq!(coerce_numeric(&Value::Null), Numeric::Missing);
        assert_eq!(coerce_numeric(&json!(true)), Numeric::Value(1.0));
        assert_eq!(coerce_numeric(&json!("RENT")), Numeric::Invalid);
    }
}
