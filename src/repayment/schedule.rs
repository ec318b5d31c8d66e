//! Equal-installment amortization
//!
//! Deterministic in (amount, annual rate, term, start date). Each row carries
//! interest on the outstanding balance rounded to cents; the final row takes
//! whatever principal is left so the principals sum to the loan amount.

use chrono::{Months, NaiveDate};
use rust_decimal::prelude::*;
use rust_decimal::MathematicalOps;
use serde::Serialize;

use crate::error::{EngineError, EngineResult};
use crate::money::Money;

/// One computed schedule row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Installment {
    pub number: u32,
    pub due_date: NaiveDate,
    pub principal: Money,
    pub interest: Money,
}

impl Installment {
    pub fn total(&self) -> Money {
        Money::round(self.principal.value() + self.interest.value())
    }
}

/// Monthly rate from an annual percentage, e.g. 12 -> 0.01
pub fn monthly_rate(annual_percent: Decimal) -> Decimal {
    annual_percent / Decimal::from(1200)
}

/// Level payment retiring `principal` over `term_months` at `annual_percent`.
///
/// The annuity factor is computed before scaling by the principal so the
/// intermediate values stay near the payment size.
pub fn level_payment(principal: Money, annual_percent: Decimal, term_months: u32) -> EngineResult<Money> {
    let term = term_months.max(1);
    let r = monthly_rate(annual_percent);
    if r.is_zero() {
        return Ok(Money::round(principal.value() / Decimal::from(term)));
    }

    let overflow = || EngineError::InvalidAmount(format!("Installment overflow for {} at {}%", principal, annual_percent));

    let growth = (Decimal::ONE + r)
        .checked_powu(u64::from(term))
        .ok_or_else(overflow)?;
    let factor = r
        .checked_mul(growth)
        .and_then(|v| v.checked_div(growth - Decimal::ONE))
        .ok_or_else(overflow)?;
    let payment = principal.value().checked_mul(factor).ok_or_else(overflow)?;

    Money::new(Money::round(payment).value()).map_err(EngineError::from)
}

/// Due date of installment `number`, one month apart from `start`
pub fn due_date(start: NaiveDate, number: u32) -> EngineResult<NaiveDate> {
    start
        .checked_add_months(Months::new(number))
        .ok_or_else(|| EngineError::InvalidLoanState(format!("Due date overflow for installment {}", number)))
}

/// Build the full schedule for a loan starting at `start`
pub fn amortize(
    principal: Money,
    annual_percent: Decimal,
    term_months: u32,
    start: NaiveDate,
) -> EngineResult<Vec<Installment>> {
    if term_months == 0 {
        return Err(EngineError::InvalidLoanState(
            "Loan term must be at least one month".to_string(),
        ));
    }
    if principal.is_zero() {
        return Err(EngineError::InvalidAmount(
            "Cannot amortize a zero principal".to_string(),
        ));
    }

    let r = monthly_rate(annual_percent);
    let payment = level_payment(principal, annual_percent, term_months)?;
    let mut outstanding = principal;
    let mut rows = Vec::with_capacity(term_months as usize);

    for number in 1..=term_months {
        let interest = Money::round(outstanding.value() * r);

        let principal_part = if number == term_months {
            outstanding
        } else {
            let scheduled = payment.checked_sub(interest).unwrap_or(Money::ZERO);
            scheduled.min(outstanding)
        };

        outstanding = outstanding.checked_sub(principal_part).unwrap_or(Money::ZERO);

        rows.push(Installment {
            number,
            due_date: due_date(start, number)?,
            principal: principal_part,
            interest,
        });
    }

    Ok(rows)
}
