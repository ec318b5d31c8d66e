//! Wallet and ledger models

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::types::chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::money::{Currency, Money};

/// Per-user wallet. `balance` is a materialized view of the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Wallet {
    pub id: Uuid,
    pub user_id: Uuid,
    pub currency: Currency,
    pub balance: Money,
    pub opening_balance: Money,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Ledger entry kinds
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "transaction_kind", rename_all = "snake_case")]
pub enum TransactionKind {
    Deposit,
    Withdraw,
    LoanFunding,
    RepaymentReceived,
    RepaymentDebit,
}

/// Direction of a posting against a wallet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Credit,
    Debit,
}

impl TransactionKind {
    /// Whether entries of this kind may move money in `direction`
    pub fn allows(&self, direction: Direction) -> bool {
        match self {
            TransactionKind::Deposit | TransactionKind::RepaymentReceived => {
                direction == Direction::Credit
            }
            TransactionKind::Withdraw | TransactionKind::RepaymentDebit => {
                direction == Direction::Debit
            }
            // lender side is a debit, borrower side a credit
            TransactionKind::LoanFunding => true,
        }
    }
}

/// Immutable ledger entry. `amount` is signed: credits positive, debits negative.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WalletTransaction {
    pub id: Uuid,
    pub wallet_id: Uuid,
    pub kind: TransactionKind,
    pub amount: Decimal,
    pub currency: Currency,
    pub related_loan_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// A posting to apply to a locked wallet
#[derive(Debug, Clone, Copy)]
pub struct Posting {
    pub direction: Direction,
    pub amount: Money,
    pub kind: TransactionKind,
    pub related_loan_id: Option<Uuid>,
}

impl Posting {
    pub fn credit(amount: Money, kind: TransactionKind, related_loan_id: Option<Uuid>) -> Self {
        Self {
            direction: Direction::Credit,
            amount,
            kind,
            related_loan_id,
        }
    }

    pub fn debit(amount: Money, kind: TransactionKind, related_loan_id: Option<Uuid>) -> Self {
        Self {
            direction: Direction::Debit,
            amount,
            kind,
            related_loan_id,
        }
    }

    /// Signed ledger amount of this posting
    pub fn signed_amount(&self) -> Decimal {
        self.amount.signed(self.direction == Direction::Debit)
    }
}

/// Result of recomputing a wallet's balance from its ledger
#[derive(Debug, Clone, Serialize)]
pub struct BalanceCheck {
    pub wallet_id: Uuid,
    pub stored: Decimal,
    pub derived: Decimal,
}

impl BalanceCheck {
    pub fn is_consistent(&self) -> bool {
        self.stored == self.derived
    }
}
