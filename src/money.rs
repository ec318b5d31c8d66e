//! Fixed-point money and currency codes
//!
//! Every monetary amount handled by the engine is a `rust_decimal::Decimal`
//! with exactly two fraction digits. Floating point never touches the ledger.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of fraction digits carried by every amount.
pub const MONEY_SCALE: u32 = 2;

/// Largest amount a `NUMERIC(20, 2)` column holds: 999999999999999999.99
pub const MAX_AMOUNT: Decimal = Decimal::from_parts(1_661_992_959, 1_808_227_885, 5, false, MONEY_SCALE);

/// Errors raised when constructing money values
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MoneyError {
    #[error("Amount cannot be negative: {0}")]
    Negative(Decimal),

    #[error("Amount has more than {MONEY_SCALE} fraction digits: {0}")]
    TooPrecise(Decimal),

    #[error("Amount exceeds the maximum of {MAX_AMOUNT}: {0}")]
    TooLarge(Decimal),

    #[error("Invalid currency code: '{0}' (expected 3 letters)")]
    InvalidCurrency(String),
}

/// A non-negative amount with two fraction digits.
///
/// # Invariant
/// The inner value is always between 0 and `MAX_AMOUNT` and always has
/// scale 2.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(try_from = "Decimal", into = "Decimal")]
#[sqlx(transparent)]
pub struct Money(Decimal);

impl Money {
    pub const ZERO: Self = Self(Decimal::ZERO);

    /// Create a Money value, rejecting negatives and sub-cent precision.
    pub fn new(value: Decimal) -> Result<Self, MoneyError> {
        if value.is_sign_negative() && !value.is_zero() {
            return Err(MoneyError::Negative(value));
        }
        if value.normalize().scale() > MONEY_SCALE {
            return Err(MoneyError::TooPrecise(value));
        }
        if value > MAX_AMOUNT {
            return Err(MoneyError::TooLarge(value));
        }
        let mut scaled = value;
        scaled.rescale(MONEY_SCALE);
        Ok(Self(scaled))
    }

    /// Whole cents, e.g. `Money::from_cents(1050)` is 10.50.
    pub fn from_cents(cents: u64) -> Self {
        Self(Decimal::from_i128_with_scale(i128::from(cents), MONEY_SCALE))
    }

    /// Round an arbitrary-precision intermediate result to cents.
    ///
    /// Midpoints round away from zero. Negative inputs clamp to zero.
    pub fn round(value: Decimal) -> Self {
        let mut rounded =
            value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero);
        if rounded.is_sign_negative() {
            rounded = Decimal::ZERO;
        }
        rounded.rescale(MONEY_SCALE);
        Self(rounded)
    }

    /// Truncate toward zero at cent precision.
    pub fn floor(value: Decimal) -> Self {
        let mut floored = value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::ToZero);
        if floored.is_sign_negative() {
            floored = Decimal::ZERO;
        }
        floored.rescale(MONEY_SCALE);
        Self(floored)
    }

    #[inline]
    pub const fn value(&self) -> Decimal {
        self.0
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    #[inline]
    pub fn is_positive(&self) -> bool {
        !self.0.is_zero()
    }

    /// Amount expressed in cents.
    pub fn cents(&self) -> i64 {
        let mut cents = self.0 * Decimal::ONE_HUNDRED;
        cents.rescale(0);
        i64::try_from(cents).unwrap_or(i64::MAX)
    }

    /// Returns None past `MAX_AMOUNT`.
    pub fn checked_add(&self, other: Money) -> Option<Money> {
        let result = self.0.checked_add(other.0)?;
        if result > MAX_AMOUNT {
            None
        } else {
            Some(Money(result))
        }
    }

    /// Returns None if the result would be negative.
    pub fn checked_sub(&self, other: Money) -> Option<Money> {
        let result = self.0.checked_sub(other.0)?;
        if result.is_sign_negative() && !result.is_zero() {
            None
        } else {
            Some(Money(result))
        }
    }

    /// Signed ledger representation: positive for credits, negative for debits.
    pub fn signed(&self, negative: bool) -> Decimal {
        if negative {
            -self.0
        } else {
            self.0
        }
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<Decimal> for Money {
    type Error = MoneyError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Money> for Decimal {
    fn from(money: Money) -> Self {
        money.0
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, m| Money(acc.0.saturating_add(m.0)))
    }
}

/// ISO-4217 style three-letter currency code, stored upper-case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(try_from = "String", into = "String")]
#[sqlx(transparent)]
pub struct Currency(String);

impl Currency {
    pub fn new(code: &str) -> Result<Self, MoneyError> {
        let trimmed = code.trim();
        if trimmed.len() != 3 || !trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(MoneyError::InvalidCurrency(code.to_string()));
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Currency {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Currency {
    type Error = MoneyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<Currency> for String {
    fn from(currency: Currency) -> Self {
        currency.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
