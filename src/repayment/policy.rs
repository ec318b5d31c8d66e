//! Default (Active -> Defaulted) policies
//!
//! The trigger is a business rule, so it sits behind a trait; the engine
//! ships a missed-installments rule configured from the environment.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use super::{Repayment, RepaymentStatus};

/// Decides whether an active loan should be declared defaulted
pub trait DefaultPolicy: Send + Sync {
    /// `schedule` is ordered by installment number
    fn should_default(&self, schedule: &[Repayment], today: NaiveDate) -> bool;

    fn describe(&self) -> String;
}

/// Default after `max_missed` consecutive installments are unpaid more than
/// `grace_days` past their due date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissedInstallmentsPolicy {
    pub max_missed: u32,
    pub grace_days: i64,
}

impl Default for MissedInstallmentsPolicy {
    fn default() -> Self {
        Self {
            max_missed: 3,
            grace_days: 15,
        }
    }
}

/// Longest configurable grace period, ten years
pub const MAX_GRACE_DAYS: i64 = 3650;

impl MissedInstallmentsPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if !(0..=MAX_GRACE_DAYS).contains(&self.grace_days) {
            return Err(format!(
                "DEFAULT_GRACE_DAYS must be between 0 and {}, got {}",
                MAX_GRACE_DAYS, self.grace_days
            ));
        }
        Ok(())
    }

    fn is_missed(&self, repayment: &Repayment, today: NaiveDate) -> bool {
        if repayment.status == RepaymentStatus::Paid {
            return false;
        }
        // a grace period past the calendar never expires
        Duration::try_days(self.grace_days)
            .and_then(|grace| repayment.due_date.checked_add_signed(grace))
            .map_or(false, |deadline| deadline < today)
    }
}

impl DefaultPolicy for MissedInstallmentsPolicy {
    fn should_default(&self, schedule: &[Repayment], today: NaiveDate) -> bool {
        if self.max_missed == 0 {
            return false;
        }

        let mut run = 0u32;
        for repayment in schedule {
            if self.is_missed(repayment, today) {
                run += 1;
                if run >= self.max_missed {
                    return true;
                }
            } else {
                run = 0;
            }
        }
        false
    }

    fn describe(&self) -> String {
        format!(
            "{} consecutive installments unpaid {} days past due",
            self.max_missed, self.grace_days
        )
    }
}
