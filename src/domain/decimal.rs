//! Lossless decimal numeric type backed by rust_decimal.
//!
//! Provides canonical parsing from strings and formatting without exponent notation.
//! Token amounts are integers in base units; prices and USD values carry fractions.

use rust_decimal::Decimal as RustDecimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lossless decimal numeric type for ledger and valuation arithmetic.
///
/// Backed by rust_decimal to avoid floating-point drift.
/// Serializes to a JSON string so large base-unit amounts survive round trips.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Decimal(#[serde(with = "rust_decimal::serde::str")] RustDecimal);

impl Decimal {
    /// Parse a Decimal from a string losslessly.
    ///
    /// # Errors
    /// Returns an error if the string is not a valid decimal number.
    pub fn from_str_canonical(s: &str) -> Result<Self, rust_decimal::Error> {
        RustDecimal::from_str(s.trim()).map(Decimal)
    }

    /// Format the Decimal as a canonical string (no exponent notation).
    pub fn to_canonical_string(&self) -> String {
        let normalized = self.0.normalize();
        format!("{}", normalized)
    }

    /// The additive identity (0).
    pub fn zero() -> Self {
        Decimal(RustDecimal::ZERO)
    }

    pub fn from_i64(value: i64) -> Self {
        Decimal(RustDecimal::from(value))
    }

    /// `10^exp`, used to turn base-unit amounts into display units.
    ///
    /// Returns `None` when the power does not fit the 96-bit mantissa.
    pub fn pow10(exp: u32) -> Option<Self> {
        let mut acc = RustDecimal::ONE;
        for _ in 0..exp {
            acc = acc.checked_mul(RustDecimal::TEN)?;
        }
        Some(Decimal(acc))
    }

    /// Returns true if the value is exactly zero.
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Returns true if the value is > 0.
    pub fn is_positive(&self) -> bool {
        !self.is_zero() && self.0.is_sign_positive()
    }

    /// Returns true if the value is < 0.
    pub fn is_negative(&self) -> bool {
        !self.is_zero() && self.0.is_sign_negative()
    }

    /// Addition that yields `None` when the sum does not fit.
    pub fn checked_add(self, rhs: Decimal) -> Option<Decimal> {
        self.0.checked_add(rhs.0).map(Decimal)
    }

    pub fn checked_sub(self, rhs: Decimal) -> Option<Decimal> {
        self.0.checked_sub(rhs.0).map(Decimal)
    }

    /// Addition clamped to the representable range.
    pub fn saturating_add(self, rhs: Decimal) -> Decimal {
        Decimal(self.0.saturating_add(rhs.0))
    }

    pub fn saturating_sub(self, rhs: Decimal) -> Decimal {
        Decimal(self.0.saturating_sub(rhs.0))
    }

    pub fn checked_mul(self, rhs: Decimal) -> Option<Decimal> {
        self.0.checked_mul(rhs.0).map(Decimal)
    }

    /// Division that yields `None` on a zero divisor or overflow.
    pub fn checked_div(self, rhs: Decimal) -> Option<Decimal> {
        self.0.checked_div(rhs.0).map(Decimal)
    }

    /// Returns the value 365, used to annualise daily rates.
    pub fn days_per_year() -> Self {
        Decimal(RustDecimal::from(365))
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_canonical_string())
    }
}

impl FromStr for Decimal {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_canonical(s)
    }
}

impl From<RustDecimal> for Decimal {
    fn from(value: RustDecimal) -> Self {
        Decimal(value)
    }
}

impl From<Decimal> for RustDecimal {
    fn from(value: Decimal) -> Self {
        value.0
    }
}

// Only negation is an operator; sums go through the checked or saturating methods.
impl std::ops::Neg for Decimal {
    type Output = Decimal;

    fn neg(self) -> Decimal {
        Decimal(-self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decimal_canonical_strips_trailing_zeros() {
        let decimal = Decimal::from_str_canonical("1808.000").expect("parse failed");
        assert_eq!(decimal.to_canonical_string(), "1808");
        assert!(!decimal.to_canonical_string().contains('e'));
    }

    #[test]
    fn test_decimal_arithmetic() {
        let a = Decimal::from_str_canonical("2000").unwrap();
        let b = Decimal::from_str_canonical("190").unwrap();
        let c = Decimal::from_str_canonical("2").unwrap();

        let rest = a.checked_sub(b).and_then(|r| r.checked_sub(c)).unwrap();
        assert_eq!(rest.to_canonical_string(), "1808");
        assert_eq!(b.checked_mul(c).unwrap().to_canonical_string(), "380");
        assert_eq!(a.checked_add(b).unwrap().to_canonical_string(), "2190");
        assert_eq!((-c).to_canonical_string(), "-2");
    }

    #[test]
    fn test_overflow_is_reported_not_panicking() {
        let max = Decimal::from(RustDecimal::MAX);
        assert!(max.checked_add(Decimal::from_i64(1)).is_none());
        assert!((-max).checked_sub(Decimal::from_i64(1)).is_none());
        assert_eq!(max.saturating_add(Decimal::from_i64(1)), max);
        assert_eq!((-max).saturating_sub(max), -max);
    }

    #[test]
    fn test_decimal_json_serialization_is_string() {
        let decimal = Decimal::from_str_canonical("123456789012345678901234").unwrap();
        let json = serde_json::to_value(decimal).unwrap();
        assert!(json.is_string());
        let back: Decimal = serde_json::from_value(json).unwrap();
        assert_eq!(back, decimal);
    }

    #[test]
    fn test_pow10() {
        assert_eq!(Decimal::pow10(0).unwrap().to_canonical_string(), "1");
        assert_eq!(Decimal::pow10(6).unwrap().to_canonical_string(), "1000000");
        assert_eq!(
            Decimal::pow10(18).unwrap().to_canonical_string(),
            "1000000000000000000"
        );
        assert!(Decimal::pow10(40).is_none());
    }

    #[test]
    fn test_checked_div_by_zero() {
        let a = Decimal::from_i64(10);
        assert!(a.checked_div(Decimal::zero()).is_none());
        assert_eq!(
            a.checked_div(Decimal::from_i64(4)).unwrap().to_canonical_string(),
            "2.5"
        );
    }

    #[test]
    fn test_sign_predicates() {
        assert!(Decimal::from_i64(-1).is_negative());
        assert!(Decimal::from_i64(1).is_positive());
        assert!(!Decimal::zero().is_negative());
        assert!(!Decimal::zero().is_positive());
    }
}
