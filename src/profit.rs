//! Expected profit calculation from amortization math.
//!
//! A loan either runs to maturity, returning `n * payment - principal`, or
//! defaults and loses the whole principal. Partial recovery and prepayment are
//! not modelled.

use crate::error::{Result, ScoringError};
use crate::types::loan::LoanRecord;
use serde::{Deserialize, Serialize};

/// Profit figures for one loan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfitBreakdown {
    pub monthly_payment: f64,
    pub profit: f64,
    pub expected_profit: f64,
}

/// Monthly rate from an annual percentage rate (10.65 -> 0.008875).
pub fn monthly_rate(int_rate: f64) -> f64 {
    int_rate / 12.0 / 100.0
}

/// Standard amortized monthly payment.
///
/// `rate` must be positive: the closed form divides by zero at `rate == 0`.
pub fn monthly_payment(principal: f64, rate: f64, months: i32) -> f64 {
    let growth = (1.0 + rate).powi(months);
    principal * (rate * growth) / (growth - 1.0)
}

/// Payment and total profit if the loan is held to maturity.
pub fn profit_at_maturity(loan: &LoanRecord) -> Result<(f64, f64)> {
    if !(loan.int_rate > 0.0) {
        return Err(ScoringError::NonPositiveRate {
            row: loan.row,
            int_rate: loan.int_rate,
        });
    }
    let months = match i32::try_from(loan.term.months()) {
        Ok(months) if months > 0 => months,
        _ => {
            return Err(ScoringError::InvalidTerm {
                row: loan.row,
                value: loan.term.to_string(),
            })
        }
    };

    let payment = monthly_payment(loan.loan_amnt, monthly_rate(loan.int_rate), months);
    let profit = f64::from(months) * payment - loan.loan_amnt;
    if !payment.is_finite() || !profit.is_finite() {
        return Err(ScoringError::NonFinite { row: loan.row });
    }
    Ok((payment, profit))
}

/// Expected profit of one loan given its probability of default.
pub fn expected_profit(loan: &LoanRecord, p_default: f64) -> Result<ProfitBreakdown> {
    if !(0.0..=1.0).contains(&p_default) {
        return Err(ScoringError::InvalidProbability {
            row: loan.row,
            p_default,
        });
    }

    let (monthly_payment, profit) = profit_at_maturity(loan)?;
    let expected_profit = (1.0 - p_default) * profit - p_default * loan.loan_amnt;
    if !expected_profit.is_finite() {
        return Err(ScoringError::NonFinite { row: loan.row });
    }

    Ok(ProfitBreakdown {
        monthly_payment,
        profit,
        expected_profit,
    })
}

/// Expected profit for a sequence of loans, in input order.
pub fn calculate_expected_profit<'a, I>(loans: I) -> Result<Vec<ProfitBreakdown>>
where
    I: IntoIterator<Item = (&'a LoanRecord, f64)>,
{
    loans
        .into_iter()
        .map(|(loan, p_default)| expected_profit(loan, p_default))
        .collect()
}
