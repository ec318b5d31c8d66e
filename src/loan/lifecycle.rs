//! Loan lifecycle rules
//!
//! Pure transition table and the no-overshoot funding check. The service
//! applies these under row locks; nothing here touches the store.

use uuid::Uuid;

use super::LoanStatus;
use crate::error::{EngineError, EngineResult};
use crate::money::Money;

impl LoanStatus {
    /// Allowed edges of the lifecycle graph
    pub fn can_transition_to(self, next: LoanStatus) -> bool {
        use LoanStatus::*;
        matches!(
            (self, next),
            (Pending, Approved)
                | (Pending, Rejected)
                | (Approved, Rejected)
                | (Approved, Funded)
                | (Funded, Active)
                | (Active, Completed)
                | (Active, Defaulted)
        )
    }

    /// No transition leaves a terminal status
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LoanStatus::Rejected | LoanStatus::Completed | LoanStatus::Defaulted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LoanStatus::Pending => "pending",
            LoanStatus::Approved => "approved",
            LoanStatus::Rejected => "rejected",
            LoanStatus::Funded => "funded",
            LoanStatus::Active => "active",
            LoanStatus::Completed => "completed",
            LoanStatus::Defaulted => "defaulted",
        }
    }
}

/// `InvalidLoanState` unless `from -> to` is a lifecycle edge
pub fn ensure_transition(loan_id: Uuid, from: LoanStatus, to: LoanStatus) -> EngineResult<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(EngineError::InvalidLoanState(format!(
            "Loan {} cannot move from {} to {}",
            loan_id,
            from.as_str(),
            to.as_str()
        )))
    }
}

/// Effect of an accepted contribution on the funding total
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContributionCheck {
    pub new_total: Money,
    pub remaining: Money,
    /// The contribution lands exactly on the requested amount
    pub fills_loan: bool,
}

/// Validate a contribution against the current funded sum.
///
/// Contributions that would push the total past the requested amount are
/// rejected outright rather than truncated; the caller retries with at most
/// the remaining gap.
pub fn check_contribution(
    loan_id: Uuid,
    status: LoanStatus,
    requested: Money,
    funded: Money,
    amount: Money,
) -> EngineResult<ContributionCheck> {
    if status != LoanStatus::Approved {
        return Err(EngineError::InvalidLoanState(format!(
            "Loan {} is {} and cannot accept funding",
            loan_id,
            status.as_str()
        )));
    }
    if amount.is_zero() {
        return Err(EngineError::InvalidAmount(
            "Funding amount must be greater than 0".to_string(),
        ));
    }

    let remaining_before = requested.checked_sub(funded).unwrap_or(Money::ZERO);
    let new_total = funded
        .checked_add(amount)
        .ok_or_else(|| EngineError::InvalidAmount("Funding total overflow".to_string()))?;

    if new_total > requested {
        return Err(EngineError::FundingExceedsRequestedAmount {
            loan_id,
            attempted: amount.value(),
            remaining: remaining_before.value(),
        });
    }

    let remaining = requested.checked_sub(new_total).unwrap_or(Money::ZERO);

    Ok(ContributionCheck {
        new_total,
        remaining,
        fills_loan: remaining.is_zero(),
    })
}
