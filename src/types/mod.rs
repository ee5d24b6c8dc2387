//! Type definitions for the loan scoring pipeline

pub mod loan;
pub mod scored;

pub use loan::{LoanRecord, RawRecord, Term};
pub use scored::{ScoredBatch, ScoredLoan};
