//! Money and rate primitives
//!
//! Domain primitives for won amounts and basis-point rates. Both are
//! validated at construction time, so an out-of-range value cannot exist
//! anywhere past the boundary.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum representable amount (1 quadrillion won)
pub const MAX_MONEY: i64 = 1_000_000_000_000_000;

/// Upper bound of a rate in basis points (100%)
pub const MAX_BASIS_POINTS: u32 = 10_000;

/// Money is an integer amount of won.
///
/// # Invariants
/// - Value is never negative
/// - Value never exceeds [`MAX_MONEY`]
///
/// # Example
/// ```
/// use won_ledger::domain::Money;
///
/// let balance = Money::new(5_000).unwrap();
/// let after = balance.checked_sub(Money::new(1_000).unwrap()).unwrap();
/// assert_eq!(after.value(), 4_000);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Money(i64);

/// Errors that can occur when creating Money
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MoneyError {
    #[error("Amount must not be negative (got {0})")]
    Negative(i64),

    #[error("Amount must be positive (got {0})")]
    NotPositive(i64),

    #[error("Amount exceeds maximum allowed value ({MAX_MONEY})")]
    Overflow,

    #[error("Invalid amount format: {0}")]
    ParseError(String),
}

impl Money {
    pub const ZERO: Money = Money(0);

    /// Create a new amount (zero allowed).
    ///
    /// # Errors
    /// - `MoneyError::Negative` if value < 0
    /// - `MoneyError::Overflow` if value > [`MAX_MONEY`]
    pub fn new(value: i64) -> Result<Self, MoneyError> {
        if value < 0 {
            return Err(MoneyError::Negative(value));
        }
        if value > MAX_MONEY {
            return Err(MoneyError::Overflow);
        }
        Ok(Self(value))
    }

    /// Create an amount that must be strictly positive (movement amounts).
    pub fn positive(value: i64) -> Result<Self, MoneyError> {
        if value <= 0 {
            return Err(MoneyError::NotPositive(value));
        }
        Self::new(value)
    }

    pub fn value(&self) -> i64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Add two amounts, failing if the sum exceeds the maximum.
    pub fn checked_add(&self, other: Money) -> Result<Money, MoneyError> {
        Money::new(self.0 + other.0)
    }

    /// Subtract, returning `None` when the result would be negative.
    pub fn checked_sub(&self, other: Money) -> Option<Money> {
        Money::new(self.0 - other.0).ok()
    }

    pub fn to_decimal(&self) -> Decimal {
        Decimal::from(self.0)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} won", self.0)
    }
}

impl FromStr for Money {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: i64 = s
            .trim()
            .parse()
            .map_err(|e: std::num::ParseIntError| MoneyError::ParseError(e.to_string()))?;
        Money::new(value)
    }
}

impl TryFrom<i64> for Money {
    type Error = MoneyError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Money::new(value)
    }
}

impl From<Money> for i64 {
    fn from(money: Money) -> Self {
        money.0
    }
}

/// An annual rate expressed in basis points (1bp = 0.01%).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct BasisPoints(u32);

/// Errors that can occur when creating a rate
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateError {
    #[error("Rate out of range 0..={MAX_BASIS_POINTS}bps (got {0})")]
    OutOfRange(Decimal),

    #[error("Rate is finer than one basis point: {0}%")]
    TooPrecise(Decimal),
}

impl BasisPoints {
    pub const ZERO: BasisPoints = BasisPoints(0);

    pub fn new(bps: u32) -> Result<Self, RateError> {
        if bps > MAX_BASIS_POINTS {
            return Err(RateError::OutOfRange(Decimal::from(bps)));
        }
        Ok(Self(bps))
    }

    /// Convert a percentage (e.g. `2.5` for 2.5%) to basis points.
    pub fn from_percent(percent: Decimal) -> Result<Self, RateError> {
        let bps = percent
            .checked_mul(Decimal::ONE_HUNDRED)
            .ok_or(RateError::OutOfRange(percent))?;
        if bps.fract() != Decimal::ZERO {
            return Err(RateError::TooPrecise(percent));
        }
        if bps < Decimal::ZERO || bps > Decimal::from(MAX_BASIS_POINTS) {
            return Err(RateError::OutOfRange(bps));
        }
        bps.to_u32().map(Self).ok_or(RateError::OutOfRange(bps))
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    /// Annual rate as a decimal fraction (500bps => 0.05).
    pub fn as_fraction(&self) -> Decimal {
        Decimal::new(i64::from(self.0), 4)
    }

    pub fn as_percent(&self) -> Decimal {
        Decimal::new(i64::from(self.0), 2)
    }
}

impl fmt::Display for BasisPoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}bps", self.0)
    }
}

impl TryFrom<u32> for BasisPoints {
    type Error = RateError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        BasisPoints::new(value)
    }
}

impl From<BasisPoints> for u32 {
    fn from(bps: BasisPoints) -> Self {
        bps.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_money_zero_allowed() {
        assert_eq!(Money::new(0).unwrap(), Money::ZERO);
    }

    #[test]
    fn test_money_negative_rejected() {
        assert!(matches!(Money::new(-1), Err(MoneyError::Negative(-1))));
    }

    #[test]
    fn test_money_positive_rejects_zero() {
        assert!(matches!(Money::positive(0), Err(MoneyError::NotPositive(0))));
        assert!(Money::positive(1).is_ok());
    }

    #[test]
    fn test_money_overflow() {
        assert!(matches!(Money::new(MAX_MONEY + 1), Err(MoneyError::Overflow)));
        assert!(Money::new(MAX_MONEY).is_ok());
    }

    #[test]
    fn test_money_checked_sub_never_negative() {
        let a = Money::new(100).unwrap();
        let b = Money::new(150).unwrap();
        assert!(a.checked_sub(b).is_none());
        assert_eq!(b.checked_sub(a).unwrap().value(), 50);
    }

    #[test]
    fn test_money_from_str() {
        let m: Money = " 2500 ".parse().unwrap();
        assert_eq!(m.value(), 2500);
        assert!(matches!("12.5".parse::<Money>(), Err(MoneyError::ParseError(_))));
    }

    #[test]
    fn test_money_serde_rejects_negative() {
        let ok: Money = serde_json::from_str("1000").unwrap();
        assert_eq!(ok.value(), 1000);
        assert!(serde_json::from_str::<Money>("-5").is_err());
    }

    #[test]
    fn test_basis_points_bounds() {
        assert!(BasisPoints::new(10_000).is_ok());
        assert!(matches!(BasisPoints::new(10_001), Err(RateError::OutOfRange(_))));
    }

    #[test]
    fn test_basis_points_from_percent() {
        assert_eq!(BasisPoints::from_percent(dec!(2.5)).unwrap().value(), 250);
        assert_eq!(BasisPoints::from_percent(dec!(1.50)).unwrap().value(), 150);
        assert_eq!(BasisPoints::from_percent(dec!(0)).unwrap().value(), 0);
        assert!(matches!(
            BasisPoints::from_percent(dec!(0.005)),
            Err(RateError::TooPrecise(_))
        ));
        assert!(matches!(
            BasisPoints::from_percent(dec!(-1)),
            Err(RateError::OutOfRange(_))
        ));
        assert!(matches!(
            BasisPoints::from_percent(dec!(100.01)),
            Err(RateError::OutOfRange(_))
        ));
    }

    #[test]
    fn test_basis_points_from_huge_percent() {
        assert!(matches!(
            BasisPoints::from_percent(Decimal::MAX),
            Err(RateError::OutOfRange(p)) if p == Decimal::MAX
        ));
        assert!(BasisPoints::from_percent(Decimal::MIN).is_err());
    }

    #[test]
    fn test_basis_points_fraction() {
        let bps = BasisPoints::new(500).unwrap();
        assert_eq!(bps.as_fraction(), dec!(0.05));
        assert_eq!(bps.as_percent(), dec!(5.00));
    }
}
