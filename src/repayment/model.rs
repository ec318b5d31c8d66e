//! Repayment models

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::types::chrono::{DateTime, Utc};
use uuid::Uuid;

use super::Payout;
use crate::loan::LoanStatus;
use crate::money::Money;

/// Installment status
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "repayment_status", rename_all = "lowercase")]
pub enum RepaymentStatus {
    Pending,
    Paid,
    Overdue,
}

/// Scheduled installment of a loan
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Repayment {
    pub id: Uuid,
    pub loan_id: Uuid,
    pub installment_number: i32,
    pub due_date: NaiveDate,
    pub principal: Money,
    pub interest: Money,
    pub late_fee: Money,
    pub status: RepaymentStatus,
    pub paid_at: Option<DateTime<Utc>>,
}

impl Repayment {
    /// Principal plus interest, before any late fee
    pub fn installment_amount(&self) -> Money {
        Money::round(self.principal.value() + self.interest.value())
    }

    /// Status as of `today`: an unpaid row past its due date is Overdue even
    /// when no sweep has written that yet.
    pub fn effective_status(&self, today: NaiveDate) -> RepaymentStatus {
        match self.status {
            RepaymentStatus::Pending if today > self.due_date => RepaymentStatus::Overdue,
            status => status,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.status == RepaymentStatus::Paid
    }
}

/// Outcome of a successful settlement
#[derive(Debug, Clone, Serialize)]
pub struct SettlementReceipt {
    pub repayment: Repayment,
    pub late_fee: Money,
    pub total_paid: Money,
    pub payouts: Vec<Payout>,
    pub loan_status: LoanStatus,
}
