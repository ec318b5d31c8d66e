//! Late fee accrual
//!
//! A fee is owed only when settlement happens after the due date. It grows
//! per day late, never drops below the minimum fee and never exceeds
//! `max_ratio` of the installment.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::money::Money;

/// Late fee parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LateFeePolicy {
    /// Fraction of the installment charged per day late (0.0005 = 0.05%)
    pub daily_rate: Decimal,
    /// Floor applied to any late settlement, in currency units
    pub minimum_fee: Decimal,
    /// Ceiling as a fraction of the installment
    pub max_ratio: Decimal,
}

impl Default for LateFeePolicy {
    fn default() -> Self {
        Self {
            daily_rate: Decimal::new(5, 4),
            minimum_fee: Decimal::ONE,
            max_ratio: Decimal::new(25, 2),
        }
    }
}

impl LateFeePolicy {
    pub fn validate(&self) -> Result<(), String> {
        if self.daily_rate.is_sign_negative() || self.minimum_fee.is_sign_negative() {
            return Err("Late fee rates must not be negative".to_string());
        }
        if self.max_ratio <= Decimal::ZERO || self.max_ratio > Decimal::ONE {
            return Err("LATE_FEE_MAX_RATIO must be greater than 0 and at most 1".to_string());
        }
        Ok(())
    }

    /// Days past `due_date` as of `today`; zero when on time
    pub fn days_late(due_date: NaiveDate, today: NaiveDate) -> i64 {
        (today - due_date).num_days().max(0)
    }

    /// Fee owed on `installment` when settled on `today`
    pub fn fee_for(&self, installment: Money, due_date: NaiveDate, today: NaiveDate) -> Money {
        let days = Self::days_late(due_date, today);
        if days == 0 {
            return Money::ZERO;
        }

        // an accrual too large for a Decimal is capped below anyway
        let accrued = installment
            .value()
            .checked_mul(self.daily_rate)
            .and_then(|v| v.checked_mul(Decimal::from(days)))
            .map_or(Money::round(Decimal::MAX), Money::round);
        let floored = accrued.max(Money::round(self.minimum_fee));
        let cap = Money::round(installment.value() * self.max_ratio.min(Decimal::ONE));

        // a late settlement always carries at least one cent
        floored.min(cap).max(Money::from_cents(1))
    }
}
