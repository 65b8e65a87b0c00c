//! Monetary amounts.
//!
//! Prices and payment amounts are non-negative decimals with two fraction digits.
//! They are held as integer minor units (cents) so sums are exact.

use core::num::ParseIntError;
use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Non-negative amount in minor currency units.
#[derive(
    Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Money(u64);

impl Money {
    pub const ZERO: Money = Money(0);

    /// Amount from minor units (e.g. `2550` is `25.50`).
    pub const fn from_cents(cents: u64) -> Self {
        Self(cents)
    }

    /// Amount from signed minor units, as stored by SQL backends.
    ///
    /// Negative amounts violate the price invariant.
    pub fn from_minor(minor: i64) -> DomainResult<Self> {
        u64::try_from(minor)
            .map(Self)
            .map_err(|_| DomainError::invariant(format!("amount cannot be negative ({minor})")))
    }

    pub const fn cents(self) -> u64 {
        self.0
    }

    /// Signed minor units for SQL backends.
    pub fn to_minor(self) -> DomainResult<i64> {
        i64::try_from(self.0)
            .map_err(|_| DomainError::invariant(format!("amount {self} exceeds storage range")))
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Money) -> DomainResult<Money> {
        self.0
            .checked_add(other.0)
            .map(Money)
            .ok_or_else(|| DomainError::invariant("amount overflow"))
    }

    /// Exact sum of a sequence of amounts.
    pub fn sum<I>(amounts: I) -> DomainResult<Money>
    where
        I: IntoIterator<Item = Money>,
    {
        amounts
            .into_iter()
            .try_fold(Money::ZERO, |acc, amount| acc.checked_add(amount))
    }
}

impl core::fmt::Display for Money {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

impl FromStr for Money {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.starts_with('-') {
            return Err(DomainError::invariant(format!("amount cannot be negative ({s})")));
        }

        let (whole, fraction) = match s.split_once('.') {
            Some((whole, fraction)) => (whole, fraction),
            None => (s, ""),
        };

        if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
            return Err(DomainError::validation(format!("malformed amount '{s}'")));
        }
        if fraction.len() > 2 || !fraction.bytes().all(|b| b.is_ascii_digit()) {
            return Err(DomainError::validation(format!(
                "amount '{s}' must have at most two fraction digits"
            )));
        }

        let malformed =
            |_: ParseIntError| DomainError::validation(format!("malformed amount '{s}'"));
        let whole: u64 = whole.parse().map_err(malformed)?;
        let fraction: u64 = match fraction.len() {
            0 => 0,
            1 => fraction.parse::<u64>().map_err(malformed)? * 10,
            _ => fraction.parse::<u64>().map_err(malformed)?,
        };

        whole
            .checked_mul(100)
            .and_then(|cents| cents.checked_add(fraction))
            .map(Money)
            .ok_or_else(|| DomainError::invariant(format!("amount '{s}' overflows")))
    }
}
