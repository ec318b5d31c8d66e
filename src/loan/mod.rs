//! Loan domain module
//!
//! Loan requests, the lifecycle state machine and the funding aggregator.

pub mod lifecycle;
mod model;
mod service;

pub use model::*;
pub(crate) use service::{lender_shares, lock_loan, require_loan_viewer, transition};
pub use service::LoanService;
