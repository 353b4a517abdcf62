//! Interest accrual arithmetic
//!
//! Intermediate divisions are rounded to 8 decimal places and the result to
//! 6, both half-even. Rounding at 8 places first keeps repeated small
//! increments from drifting.

use chrono::{DateTime, Datelike, Duration, Months, Timelike, Utc};
use rust_decimal::{Decimal, RoundingStrategy};

use crate::aggregate::CompoundingType;
use crate::domain::{BasisPoints, Money};

/// Scale of intermediate quotients
pub const INTERMEDIATE_SCALE: u32 = 8;

/// Scale of accrued interest
pub const ACCRUAL_SCALE: u32 = 6;

const DAYS_PER_YEAR: i64 = 365;
const MONTHS_PER_YEAR: i64 = 12;

/// Inputs of a single accrual window
#[derive(Debug, Clone, Copy)]
pub struct AccrualInput {
    pub principal: Money,
    pub current_accrued: Decimal,
    pub base_rate: BasisPoints,
    pub bonus_rate: BasisPoints,
    pub compounding_type: CompoundingType,
    pub last_accrual_ts: DateTime<Utc>,
    pub as_of: DateTime<Utc>,
}

/// Whole periods an accrual window consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Elapsed {
    Days(i64),
    Months(i64),
}

fn elapsed(input: &AccrualInput) -> Elapsed {
    let days = (input.as_of - input.last_accrual_ts).num_days();
    let months = months_between(input.last_accrual_ts, input.as_of);
    match input.compounding_type {
        CompoundingType::Simple | CompoundingType::Daily => Elapsed::Days(days),
        CompoundingType::Month if months > 0 => Elapsed::Months(months),
        CompoundingType::Year if months >= MONTHS_PER_YEAR => {
            Elapsed::Months(months - months % MONTHS_PER_YEAR)
        }
        CompoundingType::Month | CompoundingType::Year => Elapsed::Days(days),
    }
}

/// Interest earned between `last_accrual_ts` and `as_of`.
///
/// Pure: the caller adds the result to the accrued balance and moves its
/// watermark to [`accrued_until`]. Only whole elapsed periods count; the
/// time left over stays unaccrued for the next window.
pub fn compute_accrual(input: &AccrualInput) -> Decimal {
    if input.principal.is_zero() || input.as_of <= input.last_accrual_ts {
        return Decimal::ZERO;
    }

    let rate = input.base_rate.as_fraction() + input.bonus_rate.as_fraction();
    if rate.is_zero() {
        return Decimal::ZERO;
    }

    let principal = input.principal.to_decimal();
    let compounding_base = principal + input.current_accrued;

    let interest = match (input.compounding_type, elapsed(input)) {
        (CompoundingType::Daily, Elapsed::Days(days)) => {
            let periodic = round8(rate / Decimal::from(DAYS_PER_YEAR));
            compound(compounding_base, periodic, days)
        }
        (_, Elapsed::Days(days)) => simple(principal, rate, days),
        (CompoundingType::Year, Elapsed::Months(months)) => {
            compound(compounding_base, rate, months / MONTHS_PER_YEAR)
        }
        (_, Elapsed::Months(months)) => {
            let periodic = round8(rate / Decimal::from(MONTHS_PER_YEAR));
            compound(compounding_base, periodic, months)
        }
    };

    round_accrual(interest)
}

/// End of the window [`compute_accrual`] actually paid for: `last_accrual_ts`
/// moved forward by the whole days, months or years it counted.
pub fn accrued_until(input: &AccrualInput) -> DateTime<Utc> {
    if input.as_of <= input.last_accrual_ts {
        return input.last_accrual_ts;
    }
    let advanced = match elapsed(input) {
        Elapsed::Days(days) => input.last_accrual_ts.checked_add_signed(Duration::days(days)),
        Elapsed::Months(months) => u32::try_from(months)
            .ok()
            .and_then(|m| input.last_accrual_ts.checked_add_months(Months::new(m))),
    };
    advanced.map_or(input.as_of, |ts| ts.min(input.as_of))
}

/// `principal * rate * days / 365`
fn simple(principal: Decimal, rate: Decimal, days: i64) -> Decimal {
    if days <= 0 {
        return Decimal::ZERO;
    }
    let product = principal
        .checked_mul(rate)
        .and_then(|p| p.checked_mul(Decimal::from(days)));
    match product {
        Some(product) => round8(product / Decimal::from(DAYS_PER_YEAR)),
        None => {
            tracing::error!(days, %rate, "Simple interest overflowed, no interest accrued");
            Decimal::ZERO
        }
    }
}

/// `base * ((1 + periodic)^periods - 1)`
fn compound(base: Decimal, periodic: Decimal, periods: i64) -> Decimal {
    if periods <= 0 {
        return Decimal::ZERO;
    }
    let Ok(periods) = u64::try_from(periods) else {
        return Decimal::ZERO;
    };
    let interest = pow(Decimal::ONE + periodic, periods)
        .and_then(|factor| base.checked_mul(factor - Decimal::ONE));
    match interest {
        Some(interest) => interest,
        None => {
            tracing::error!(periods, %periodic, "Compound interest overflowed, no interest accrued");
            Decimal::ZERO
        }
    }
}

/// Exponentiation by squaring
fn pow(base: Decimal, mut exponent: u64) -> Option<Decimal> {
    let mut result = Decimal::ONE;
    let mut square = base;
    while exponent > 0 {
        if exponent & 1 == 1 {
            result = result.checked_mul(square)?;
        }
        exponent >>= 1;
        if exponent > 0 {
            square = square.checked_mul(square)?;
        }
    }
    Some(result)
}

/// Whole calendar months from `from` to `to`; a month only counts once the
/// same day and time of day has been reached.
pub fn months_between(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    if to <= from {
        return 0;
    }
    let mut months = i64::from(to.year() - from.year()) * MONTHS_PER_YEAR
        + i64::from(to.month()) - i64::from(from.month());

    let to_in_month = (to.day(), to.num_seconds_from_midnight(), to.nanosecond());
    let from_in_month = (from.day(), from.num_seconds_from_midnight(), from.nanosecond());
    if to_in_month < from_in_month {
        months -= 1;
    }
    months.max(0)
}

fn round8(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(INTERMEDIATE_SCALE, RoundingStrategy::MidpointNearestEven)
}

/// Final rounding of accrued interest: 6 places, half-even
pub fn round_accrual(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(ACCRUAL_SCALE, RoundingStrategy::MidpointNearestEven)
}
