//! Loan models and data structures

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::types::chrono::{DateTime, Utc};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::money::{Currency, Money, MAX_AMOUNT};

/// Loan lifecycle status
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq, Hash)]
#[sqlx(type_name = "loan_status", rename_all = "lowercase")]
pub enum LoanStatus {
    Pending,
    Approved,
    Rejected,
    Funded,
    Active,
    Completed,
    Defaulted,
}

/// Loan request. Status is only ever changed by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LoanRequest {
    pub id: Uuid,
    pub borrower_id: Uuid,
    pub amount_requested: Money,
    pub currency: Currency,
    pub term_months: i32,
    /// Annual rate in percent, e.g. 12.5
    pub interest_rate: Decimal,
    pub status: LoanStatus,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub approved_by: Option<Uuid>,
    pub activated_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// One lender's contribution to a loan
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LoanFunding {
    pub id: Uuid,
    pub loan_id: Uuid,
    pub lender_id: Uuid,
    pub amount: Money,
    pub funded_at: DateTime<Utc>,
}

fn validate_loan_amount(amount: &Decimal) -> Result<(), ValidationError> {
    if *amount <= Decimal::ZERO || *amount > MAX_AMOUNT {
        return Err(ValidationError::new("amount_out_of_range"));
    }
    Ok(())
}

fn validate_interest_rate(rate: &Decimal) -> Result<(), ValidationError> {
    if rate.is_sign_negative() || *rate > Decimal::ONE_HUNDRED {
        return Err(ValidationError::new("interest_rate_out_of_range"));
    }
    if rate.normalize().scale() > 4 {
        return Err(ValidationError::new("interest_rate_too_precise"));
    }
    Ok(())
}

/// Input for creating a loan request
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewLoanRequest {
    pub borrower_id: Uuid,
    #[validate(custom = "validate_loan_amount")]
    pub amount: Decimal,
    #[validate(length(equal = 3))]
    pub currency: String,
    #[validate(range(min = 1, max = 360))]
    pub term_months: i32,
    #[validate(custom = "validate_interest_rate")]
    pub interest_rate: Decimal,
}

/// Aggregated contribution of one lender
#[derive(Debug, Clone, Serialize, PartialEq, Eq, sqlx::FromRow)]
pub struct LenderShare {
    pub lender_id: Uuid,
    pub amount: Money,
}

/// Funding progress of a loan
#[derive(Debug, Clone, Serialize)]
pub struct FundingStatus {
    pub loan_id: Uuid,
    pub status: LoanStatus,
    pub currency: Currency,
    pub amount_requested: Money,
    pub funded: Money,
    pub remaining: Money,
    pub contributions: Vec<LoanFunding>,
}

/// Result of an accepted contribution
#[derive(Debug, Clone, Serialize)]
pub struct FundingOutcome {
    pub funding: LoanFunding,
    pub funded_total: Money,
    pub remaining: Money,
    /// Loan status after the contribution committed
    pub loan_status: LoanStatus,
    /// This contribution completed the requested amount
    pub completed_funding: bool,
}
