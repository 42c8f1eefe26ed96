use crate::error::{BillingError, Result};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A currency amount held as a whole number of cents.
///
/// Every balance, price and allocation in the billing core is a `Money`.
/// Decimal strings only appear at the edges, through [`Money::from_display_string`]
/// and [`Money::to_display_string`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    pub const fn cents(&self) -> i64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn checked_add(self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(Money)
    }

    pub fn add(self, other: Money) -> Result<Money> {
        self.checked_add(other)
            .ok_or_else(|| BillingError::invalid_amount(format!("{} + {} overflows", self, other)))
    }

    pub fn checked_sub(self, other: Money) -> Option<Money> {
        self.0.checked_sub(other.0).map(Money)
    }

    /// Subtract, flooring the result at zero.
    pub fn saturating_sub(self, other: Money) -> Money {
        Money(self.0.saturating_sub(other.0).max(0))
    }

    pub fn multiply(self, quantity: u32) -> Result<Money> {
        self.0
            .checked_mul(i64::from(quantity))
            .map(Money)
            .ok_or_else(|| {
                BillingError::invalid_amount(format!("{} x {} overflows", self, quantity))
            })
    }

    /// Split into whole `unit`s and the cents left over.
    pub fn div_rem(self, unit: Money) -> Option<(i64, Money)> {
        if unit.0 <= 0 {
            return None;
        }
        Some((self.0.div_euclid(unit.0), Money(self.0.rem_euclid(unit.0))))
    }

    pub fn sum<I: IntoIterator<Item = Money>>(amounts: I) -> Result<Money> {
        amounts
            .into_iter()
            .try_fold(Money::ZERO, |total, amount| total.add(amount))
    }

    /// Format as a plain decimal with two places, e.g. `"12.50"` or `"-0.05"`.
    pub fn to_display_string(&self) -> String {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        format!("{}{}.{:02}", sign, abs / 100, abs % 100)
    }

    /// Parse a decimal string such as `"30"`, `"30.5"` or `"$1,250.00"`.
    ///
    /// Values with more than two decimal places round to the nearest cent,
    /// midpoints away from zero.
    pub fn from_display_string(input: &str) -> Result<Money> {
        let trimmed = input.trim();
        let unsigned = trimmed.strip_prefix('-').unwrap_or(trimmed);
        let negative = unsigned.len() != trimmed.len();
        let cleaned: String = unsigned
            .strip_prefix('$')
            .unwrap_or(unsigned)
            .chars()
            .filter(|c| *c != ',')
            .collect();

        if cleaned.is_empty()
            || !cleaned.chars().all(|c| c.is_ascii_digit() || c == '.')
            || !cleaned.chars().any(|c| c.is_ascii_digit())
        {
            return Err(BillingError::invalid_amount(format!(
                "'{}' is not a decimal amount",
                input
            )));
        }

        let value = Decimal::from_str(&cleaned).map_err(|e| {
            BillingError::invalid_amount(format!("'{}' is not a decimal amount: {}", input, e))
        })?;

        let cents = (value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
            * Decimal::ONE_HUNDRED)
            .to_i64()
            .ok_or_else(|| BillingError::invalid_amount(format!("'{}' is out of range", input)))?;

        Ok(Money(if negative { -cents } else { cents }))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_display_string())
    }
}

impl FromStr for Money {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self> {
        Money::from_display_string(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_string() {
        assert_eq!(Money::from_cents(5000).to_display_string(), "50.00");
        assert_eq!(Money::from_cents(1205).to_display_string(), "12.05");
        assert_eq!(Money::from_cents(7).to_display_string(), "0.07");
        assert_eq!(Money::from_cents(-250).to_display_string(), "-2.50");
        assert_eq!(Money::ZERO.to_string(), "0.00");
    }

    #[test]
    fn test_parse_rounds_to_nearest_cent() {
        assert_eq!(Money::from_display_string("30").unwrap().cents(), 3000);
        assert_eq!(Money::from_display_string("30.5").unwrap().cents(), 3050);
        assert_eq!(Money::from_display_string("0.125").unwrap().cents(), 13);
        assert_eq!(Money::from_display_string("0.124").unwrap().cents(), 12);
        assert_eq!(Money::from_display_string("19.999").unwrap().cents(), 2000);
        assert_eq!(Money::from_display_string(" $1,250.00 ").unwrap().cents(), 125000);
        assert_eq!(Money::from_display_string("-4.005").unwrap().cents(), -401);
    }

    #[test]
    fn test_parse_rejects_non_numeric() {
        for input in ["", "  ", "abc", "12.3.4", "1e5", "$", "--5", "12a", "."] {
            let err = Money::from_display_string(input).unwrap_err();
            assert!(
                matches!(err, BillingError::InvalidAmount { .. }),
                "expected InvalidAmount for {:?}",
                input
            );
        }
    }

    #[test]
    fn test_arithmetic_is_exact() {
        let price = Money::from_cents(15000);
        assert_eq!(price.multiply(3).unwrap(), Money::from_cents(45000));
        assert_eq!(
            Money::from_cents(3000).saturating_sub(Money::from_cents(5000)),
            Money::ZERO
        );
        assert_eq!(
            Money::from_cents(45000).div_rem(price),
            Some((3, Money::ZERO))
        );
        assert_eq!(
            Money::from_cents(20000).div_rem(price),
            Some((1, Money::from_cents(5000)))
        );
        assert_eq!(price.div_rem(Money::ZERO), None);

        let total = Money::sum((0..1000).map(|_| Money::from_cents(1))).unwrap();
        assert_eq!(total, Money::from_cents(1000));
    }

    #[test]
    fn test_overflow_is_invalid_amount() {
        let big = Money::from_cents(i64::MAX);
        assert!(matches!(
            big.add(Money::from_cents(1)),
            Err(BillingError::InvalidAmount { .. })
        ));
        assert!(matches!(
            big.multiply(2),
            Err(BillingError::InvalidAmount { .. })
        ));
    }

    #[test]
    fn test_serializes_as_integer_cents() {
        let json = serde_json::to_string(&Money::from_cents(1234)).unwrap();
        assert_eq!(json, "1234");
        let parsed: Money = serde_json::from_str("99").unwrap();
        assert_eq!(parsed, Money::from_cents(99));
    }
}
