//! Monetary values: an arbitrary-precision decimal amount bound to a currency.
//!
//! `Money` is immutable. Every operation returns a new value, and arithmetic that
//! combines two values in different currencies fails with
//! [`DomainError::CurrencyMismatch`].

use core::cmp::Ordering;
use core::fmt;
use core::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// ISO 4217 currency codes supported by the ledger.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    #[default]
    Cny,
    Usd,
    Eur,
    Gbp,
    Jpy,
    Hkd,
}

impl Currency {
    pub fn code(self) -> &'static str {
        match self {
            Currency::Cny => "CNY",
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
            Currency::Gbp => "GBP",
            Currency::Jpy => "JPY",
            Currency::Hkd => "HKD",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Currency {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CNY" => Ok(Currency::Cny),
            "USD" => Ok(Currency::Usd),
            "EUR" => Ok(Currency::Eur),
            "GBP" => Ok(Currency::Gbp),
            "JPY" => Ok(Currency::Jpy),
            "HKD" => Ok(Currency::Hkd),
            other => Err(DomainError::validation(format!("unsupported currency: {other}"))),
        }
    }
}

/// One hundredth of a currency unit.
fn cent() -> Decimal {
    Decimal::new(1, 2)
}

/// A decimal amount in a single currency.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money {
    amount: Decimal,
    currency: Currency,
}

impl Money {
    pub fn new(amount: Decimal, currency: Currency) -> Self {
        Self { amount, currency }
    }

    pub fn zero(currency: Currency) -> Self {
        Self::new(Decimal::ZERO, currency)
    }

    /// Build a value from minor units (cents): `from_minor(12345, Cny)` is `123.45 CNY`.
    pub fn from_minor(minor: i64, currency: Currency) -> Self {
        Self::new(Decimal::new(minor, 2), currency)
    }

    /// Parse a decimal string such as `"199.90"`.
    pub fn parse(amount: &str, currency: Currency) -> DomainResult<Self> {
        let amount = Decimal::from_str(amount.trim())
            .map_err(|e| DomainError::validation(format!("invalid amount '{amount}': {e}")))?;
        Ok(Self::new(amount, currency))
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }

    pub fn is_positive(&self) -> bool {
        self.amount > Decimal::ZERO
    }

    pub fn is_negative(&self) -> bool {
        self.amount < Decimal::ZERO
    }

    fn same_currency(&self, other: &Money) -> DomainResult<()> {
        if self.currency != other.currency {
            return Err(DomainError::currency_mismatch(self.currency, other.currency));
        }
        Ok(())
    }

    fn with_amount(&self, amount: Decimal) -> Self {
        Self::new(amount, self.currency)
    }

    pub fn checked_add(&self, other: &Money) -> DomainResult<Money> {
        self.same_currency(other)?;
        let sum = self
            .amount
            .checked_add(other.amount)
            .ok_or_else(|| DomainError::invariant("monetary addition overflow"))?;
        Ok(self.with_amount(sum))
    }

    pub fn checked_sub(&self, other: &Money) -> DomainResult<Money> {
        self.same_currency(other)?;
        let diff = self
            .amount
            .checked_sub(other.amount)
            .ok_or_else(|| DomainError::invariant("monetary subtraction overflow"))?;
        Ok(self.with_amount(diff))
    }

    pub fn multiply(&self, factor: Decimal) -> DomainResult<Money> {
        let product = self
            .amount
            .checked_mul(factor)
            .ok_or_else(|| DomainError::invariant("monetary multiplication overflow"))?;
        Ok(self.with_amount(product))
    }

    pub fn divide(&self, divisor: Decimal) -> DomainResult<Money> {
        if divisor.is_zero() {
            return Err(DomainError::validation("cannot divide money by zero"));
        }
        let quotient = self
            .amount
            .checked_div(divisor)
            .ok_or_else(|| DomainError::invariant("monetary division overflow"))?;
        Ok(self.with_amount(quotient))
    }

    pub fn negate(&self) -> Money {
        self.with_amount(-self.amount)
    }

    pub fn abs(&self) -> Money {
        self.with_amount(self.amount.abs())
    }

    /// Round half away from zero to `places` decimal places.
    pub fn round(&self, places: u32) -> Money {
        self.with_amount(
            self.amount
                .round_dp_with_strategy(places, RoundingStrategy::MidpointAwayFromZero),
        )
    }

    /// Drop digits beyond `places` decimal places (toward zero).
    pub fn truncate(&self, places: u32) -> Money {
        self.with_amount(self.amount.round_dp_with_strategy(places, RoundingStrategy::ToZero))
    }

    pub fn compare(&self, other: &Money) -> DomainResult<Ordering> {
        self.same_currency(other)?;
        Ok(self.amount.cmp(&other.amount))
    }

    pub fn greater_than(&self, other: &Money) -> DomainResult<bool> {
        Ok(self.compare(other)? == Ordering::Greater)
    }

    pub fn less_than(&self, other: &Money) -> DomainResult<bool> {
        Ok(self.compare(other)? == Ordering::Less)
    }

    /// The smaller of two values in the same currency.
    pub fn min(&self, other: &Money) -> DomainResult<Money> {
        Ok(match self.compare(other)? {
            Ordering::Greater => *other,
            _ => *self,
        })
    }

    /// Sum an iterator of values, all of which must be in `currency`.
    pub fn sum<'a, I>(currency: Currency, values: I) -> DomainResult<Money>
    where
        I: IntoIterator<Item = &'a Money>,
    {
        values
            .into_iter()
            .try_fold(Money::zero(currency), |acc, v| acc.checked_add(v))
    }

    /// Split into `parts` values whose sum is exactly `self`.
    ///
    /// Every part gets `floor(amount / parts)` at cent precision; the leftover cents go
    /// one each to the leading parts. Residue below a cent (amounts carrying more than
    /// two decimal places) is added to the first part.
    pub fn allocate(&self, parts: usize) -> DomainResult<Vec<Money>> {
        if parts == 0 {
            return Err(DomainError::validation("cannot allocate money into zero parts"));
        }
        if parts == 1 {
            return Ok(vec![*self]);
        }

        let n = Decimal::from(parts as u64);
        let base = (self.amount / n).round_dp_with_strategy(2, RoundingStrategy::ToNegativeInfinity);
        let remainder = self.amount - base * n;
        let bumps = (remainder / cent())
            .trunc()
            .to_usize()
            .ok_or_else(|| DomainError::invariant("allocation remainder out of range"))?;
        let residue = remainder - cent() * Decimal::from(bumps as u64);

        let mut out: Vec<Money> = (0..parts)
            .map(|i| {
                if i < bumps {
                    self.with_amount(base + cent())
                } else {
                    self.with_amount(base)
                }
            })
            .collect();

        if !residue.is_zero() {
            out[0] = out[0].with_amount(out[0].amount + residue);
        }

        Ok(out)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2} {}", self.amount, self.currency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn cny(minor: i64) -> Money {
        Money::from_minor(minor, Currency::Cny)
    }

    #[test]
    fn arithmetic_rejects_mixed_currencies() {
        let usd = Money::from_minor(100, Currency::Usd);
        let err = cny(100).checked_add(&usd).unwrap_err();
        assert_eq!(err, DomainError::currency_mismatch(Currency::Cny, Currency::Usd));
        assert!(cny(100).compare(&usd).is_err());
        assert!(cny(100).checked_sub(&usd).is_err());
    }

    #[test]
    fn divide_by_zero_is_a_validation_error() {
        match cny(100).divide(Decimal::ZERO) {
            Err(DomainError::Validation(msg)) if msg.contains("zero") => {}
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn round_and_truncate_differ_on_midpoints() {
        let v = Money::parse("2.345", Currency::Cny).unwrap();
        assert_eq!(v.round(2).amount(), Decimal::new(235, 2));
        assert_eq!(v.truncate(2).amount(), Decimal::new(234, 2));
        assert_eq!(v.negate().truncate(2).amount(), Decimal::new(-234, 2));
    }

    #[test]
    fn display_uses_two_places_and_code() {
        assert_eq!(cny(10000).to_string(), "100.00 CNY");
        assert_eq!(Money::parse("3.5", Currency::Usd).unwrap().to_string(), "3.50 USD");
    }

    #[test]
    fn allocate_spreads_leftover_cents_to_leading_parts() {
        let parts = cny(10000).allocate(3).unwrap();
        assert_eq!(parts, vec![cny(3334), cny(3333), cny(3333)]);
    }

    #[test]
    fn allocate_single_part_is_identity() {
        assert_eq!(cny(999).allocate(1).unwrap(), vec![cny(999)]);
    }

    #[test]
    fn allocate_zero_parts_is_rejected() {
        assert!(matches!(cny(999).allocate(0), Err(DomainError::Validation(_))));
    }

    #[test]
    fn allocate_negative_amount_keeps_sum() {
        let parts = cny(-100).allocate(3).unwrap();
        assert_eq!(parts, vec![cny(-33), cny(-33), cny(-34)]);
        assert_eq!(Money::sum(Currency::Cny, &parts).unwrap(), cny(-100));
    }

    #[test]
    fn currency_parses_case_insensitively() {
        assert_eq!("hkd".parse::<Currency>().unwrap(), Currency::Hkd);
        assert!("XYZ".parse::<Currency>().is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, .. ProptestConfig::default() })]

        #[test]
        fn allocation_sum_is_exact(
            mantissa in -10_000_000_000i64..10_000_000_000i64,
            scale in 0u32..=4,
            parts in 1usize..64,
        ) {
            let value = Money::new(Decimal::new(mantissa, scale), Currency::Cny);
            let split = value.allocate(parts).unwrap();
            prop_assert_eq!(split.len(), parts);
            prop_assert_eq!(Money::sum(Currency::Cny, &split).unwrap(), value);
        }

        #[test]
        fn cent_amounts_split_within_one_cent(
            minor in 0i64..1_000_000_000,
            parts in 2usize..64,
        ) {
            let split = cny(minor).allocate(parts).unwrap();
            let max = split.iter().map(Money::amount).max().unwrap();
            let min = split.iter().map(Money::amount).min().unwrap();
            prop_assert!(max - min <= Decimal::new(1, 2));
        }
    }
}
