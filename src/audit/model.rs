//! Audit trail models

use serde::{Deserialize, Serialize};
use sqlx::types::chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::permission::Actor;

/// Action names written to the trail
pub mod actions {
    pub const WALLET_OPENED: &str = "WalletOpened";
    pub const WALLET_CREDITED: &str = "WalletCredited";
    pub const WALLET_DEBITED: &str = "WalletDebited";
    pub const LOAN_REQUESTED: &str = "LoanRequested";
    pub const LOAN_APPROVED: &str = "LoanApproved";
    pub const LOAN_REJECTED: &str = "LoanRejected";
    pub const LOAN_CONTRIBUTION: &str = "LoanContribution";
    pub const LOAN_FUNDED: &str = "LoanFunded";
    pub const LOAN_ACTIVATED: &str = "LoanActivated";
    pub const LOAN_COMPLETED: &str = "LoanCompleted";
    pub const LOAN_DEFAULTED: &str = "LoanDefaulted";
    pub const SCHEDULE_GENERATED: &str = "ScheduleGenerated";
    pub const REPAYMENT_SETTLED: &str = "RepaymentSettled";
    pub const REPAYMENTS_OVERDUE: &str = "RepaymentsMarkedOverdue";
    pub const PERMISSION_GRANTED: &str = "PermissionGranted";
    pub const PERMISSION_REVOKED: &str = "PermissionRevoked";
    pub const PERMISSION_DENIED: &str = "PermissionDenied";
}

/// Persisted audit record. Never updated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditLog {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub action: String,
    pub details: String,
    pub origin: String,
    pub created_at: DateTime<Utc>,
}

/// Entry to append
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub user_id: Option<Uuid>,
    pub action: &'static str,
    pub details: String,
    pub origin: String,
}

impl AuditEntry {
    /// Entry attributed to `actor`, originating from engine component `component`
    pub fn new(actor: &Actor, component: &str, action: &'static str, details: impl Into<String>) -> Self {
        Self {
            user_id: actor.user_id(),
            action,
            details: details.into(),
            origin: format!("{}/{}", actor.kind(), component),
        }
    }
}
