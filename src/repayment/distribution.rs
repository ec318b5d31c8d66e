//! Pro-rata distribution of collected repayments to lenders

use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::loan::LenderShare;
use crate::money::Money;

/// Amount owed to one lender out of a settlement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Payout {
    pub lender_id: Uuid,
    pub amount: Money,
}

/// Split `total` across lenders in proportion to their funded amounts.
///
/// Each share is floored to the cent; leftover cents go to the largest
/// funder (lowest lender id on ties). Payouts always sum to `total`.
pub fn split_pro_rata(total: Money, shares: &[LenderShare]) -> EngineResult<Vec<Payout>> {
    let funded: Decimal = shares.iter().map(|s| s.amount.value()).sum();
    if funded.is_zero() {
        return Err(EngineError::InvalidLoanState(
            "Loan has no funding to distribute against".to_string(),
        ));
    }

    let mut payouts = Vec::with_capacity(shares.len());
    for share in shares {
        payouts.push(Payout {
            lender_id: share.lender_id,
            amount: Money::floor(proportional(total, share.amount, funded)?),
        });
    }

    let distributed: Money = payouts.iter().map(|p| p.amount).sum();
    let residual = total.checked_sub(distributed).ok_or_else(|| {
        EngineError::InvalidAmount(format!(
            "Payouts {} exceed the collected {}",
            distributed, total
        ))
    })?;

    if residual.is_positive() {
        let largest = shares
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                a.amount
                    .cmp(&b.amount)
                    .then_with(|| b.lender_id.cmp(&a.lender_id))
            })
            .map(|(idx, _)| idx)
            .unwrap_or(0);

        let receiver = &mut payouts[largest];
        receiver.amount = receiver
            .amount
            .checked_add(residual)
            .ok_or_else(|| EngineError::InvalidAmount("Payout overflow".to_string()))?;
    }

    Ok(payouts)
}

/// `total * share / funded`, exact while the product fits a `Decimal` and
/// through the share ratio otherwise.
fn proportional(total: Money, share: Money, funded: Decimal) -> EngineResult<Decimal> {
    match total.value().checked_mul(share.value()) {
        Some(product) => Ok(product / funded),
        None => share
            .value()
            .checked_div(funded)
            .and_then(|ratio| total.value().checked_mul(ratio))
            .ok_or_else(|| {
                EngineError::InvalidAmount(format!("Cannot split {} across lenders", total))
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn share(id: u128, cents: u64) -> LenderShare {
        LenderShare {
            lender_id: Uuid::from_u128(id),
            amount: Money::from_cents(cents),
        }
    }

    #[test]
    fn test_seventy_thirty_split() {
        let shares = [share(1, 70_000), share(2, 30_000)];
        let payouts = split_pro_rata(Money::from_cents(11_000), &shares).unwrap();
        assert_eq!(payouts[0].amount, Money::from_cents(7_700));
        assert_eq!(payouts[1].amount, Money::from_cents(3_300));
    }

    #[test]
    fn test_residual_cent_goes_to_largest_share() {
        let shares = [share(1, 10_000), share(2, 10_000), share(3, 10_001)];
        let payouts = split_pro_rata(Money::from_cents(100), &shares).unwrap();
        let total: Money = payouts.iter().map(|p| p.amount).sum();
        assert_eq!(total, Money::from_cents(100));
        assert_eq!(payouts[0].amount, Money::from_cents(33));
        assert_eq!(payouts[1].amount, Money::from_cents(33));
        assert_eq!(payouts[2].amount, Money::from_cents(34));
    }

    #[test]
    fn test_tie_breaks_on_lowest_lender_id() {
        let shares = [share(9, 50_000), share(4, 50_000)];
        let payouts = split_pro_rata(Money::from_cents(1), &shares).unwrap();
        assert_eq!(payouts[0].amount, Money::ZERO);
        assert_eq!(payouts[1].amount, Money::from_cents(1));
    }

    #[test]
    fn test_single_lender_takes_everything() {
        let payouts = split_pro_rata(Money::from_cents(8885), &[share(1, 100_000)]).unwrap();
        assert_eq!(payouts[0].amount, Money::from_cents(8885));
    }

    #[test]
    fn test_huge_totals_split_without_overflow() {
        let half = Money::from_cents(500_000_000_000_000_000);
        let shares = [
            LenderShare { lender_id: Uuid::from_u128(1), amount: half },
            LenderShare { lender_id: Uuid::from_u128(2), amount: half },
        ];
        let total = Money::new(crate::money::MAX_AMOUNT).unwrap();
        let payouts = split_pro_rata(total, &shares).unwrap();

        let paid: Money = payouts.iter().map(|p| p.amount).sum();
        assert_eq!(paid, total);
        assert_eq!(payouts[0].amount, Money::new(Decimal::from(500_000_000_000_000_000i64)).unwrap());
    }

    #[test]
    fn test_no_funding_is_an_error() {
        assert!(split_pro_rata(Money::from_cents(100), &[]).is_err());
    }
}
