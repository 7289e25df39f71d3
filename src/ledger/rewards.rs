//! Cost & reward arithmetic. Pure functions over `BigDecimal`; the
//! correlator decides when to apply them, the ledger records the result.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};

use crate::shared::models::CostRate;

/// Billable seconds between start and end, clamped to zero. A missing
/// `started_at` yields 0: a data-integrity gap must never turn into an
/// unbounded or negative charge.
pub fn duration_seconds(started_at: Option<DateTime<Utc>>, ended_at: DateTime<Utc>) -> i64 {
    match started_at {
        Some(started) => (ended_at - started).num_seconds().max(0),
        None => 0,
    }
}

pub fn base_cost(duration_secs: i64, rate: &CostRate) -> BigDecimal {
    BigDecimal::from(duration_secs) * &rate.amount
}

/// Surcharge added on top of the base cost (never deducted from it).
pub fn creator_fee(base: &BigDecimal, fee_percent: &BigDecimal) -> BigDecimal {
    (base * fee_percent) / BigDecimal::from(100)
}

/// Even share of the fee for one of `owners` creators. Zero owners means
/// no surcharge was applicable in the first place.
pub fn split_even(total: &BigDecimal, owners: usize) -> BigDecimal {
    if owners == 0 {
        return BigDecimal::from(0);
    }
    total / BigDecimal::from(owners as u64)
}

/// What the consuming user is debited: base cost plus the full surcharge.
pub fn settlement_total(base: &BigDecimal, fee: &BigDecimal) -> BigDecimal {
    base + fee
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn bd(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    #[test]
    fn test_worked_example_two_co_owners() {
        // 10 s at 0.01/s, 5% creator fee, two co-owners.
        let rate = CostRate::per_second(bd("0.01"));
        let base = base_cost(10, &rate);
        assert_eq!(base, bd("0.10"));

        let fee = creator_fee(&base, &bd("5"));
        assert_eq!(fee, bd("0.005"));

        let share = split_even(&fee, 2);
        assert_eq!(share, bd("0.0025"));

        assert_eq!(settlement_total(&base, &fee), bd("0.105"));
    }

    #[test]
    fn test_duration_clamped_and_missing_start_is_zero() {
        let now = Utc::now();
        assert_eq!(duration_seconds(Some(now + chrono::Duration::seconds(5)), now), 0);
        assert_eq!(duration_seconds(None, now), 0);
        assert_eq!(
            duration_seconds(Some(now - chrono::Duration::seconds(42)), now),
            42
        );
    }

    #[test]
    fn test_split_with_no_owners_is_zero() {
        assert_eq!(split_even(&bd("0.005"), 0), bd("0"));
        assert_eq!(split_even(&bd("0.003"), 3), bd("0.001"));
    }

    #[test]
    fn test_zero_duration_costs_nothing() {
        let rate = CostRate::per_second(bd("0.01"));
        assert_eq!(base_cost(0, &rate), bd("0"));
        assert_eq!(creator_fee(&bd("0"), &bd("5")), bd("0"));
    }
}
