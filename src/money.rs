//! Fixed-point micro-USD arithmetic.
//!
//! `MicroUSD` is a non-negative count of 1e-6 USD. It serializes to the
//! wire as a decimal string so a 53-bit-float JSON consumer never loses
//! precision on large balances; internally it is a `u64`.

use std::fmt;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

pub const MICROS_PER_USD: u64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct MicroUsd(pub u64);

impl MicroUsd {
    pub const ZERO: MicroUsd = MicroUsd(0);

    pub fn from_usd(usd: f64) -> Self {
        MicroUsd((usd * MICROS_PER_USD as f64).round() as u64)
    }

    pub fn checked_sub(self, other: MicroUsd) -> Option<MicroUsd> {
        self.0.checked_sub(other.0).map(MicroUsd)
    }

    pub fn saturating_sub(self, other: MicroUsd) -> MicroUsd {
        MicroUsd(self.0.saturating_sub(other.0))
    }

    pub fn checked_add(self, other: MicroUsd) -> Option<MicroUsd> {
        self.0.checked_add(other.0).map(MicroUsd)
    }
}

impl fmt::Display for MicroUsd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for MicroUsd {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for MicroUsd {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse::<u64>().map(MicroUsd).map_err(de::Error::custom)
    }
}

/// Computes `tokens * price_per_1m_tokens / 1_000_000`, floored, in
/// micro-USD. `price_per_1m_micro` is the price of one million tokens,
/// expressed in micro-USD.
pub fn cost_for_tokens(tokens: u64, price_per_1m_micro: u64) -> MicroUsd {
    let num = (tokens as u128) * (price_per_1m_micro as u128);
    MicroUsd((num / 1_000_000u128) as u64)
}

/// Carries fractional micro-USD remainders from partial-cost
/// computations forward onto the next operation for the same account,
/// so that `sum(floor(partial_costs)) + carried_remainder ==
/// floor(total_cost)` holds over any number of operations.
///
/// The remainder is tracked in units of `1 / SCALE` micro-USD so that
/// genuinely fractional per-token prices don't get rounded away before
/// they have a chance to accumulate into a whole micro-USD.
#[derive(Debug, Default, Clone, Copy)]
pub struct RemainderAccumulator {
    /// Carried remainder, in units of 1e-6 micro-USD (i.e. 1e-12 USD).
    carried: u128,
}

const SCALE: u128 = 1_000_000;

impl RemainderAccumulator {
    pub fn new() -> Self {
        Self { carried: 0 }
    }

    /// Applies this accumulator to an exact-rational cost
    /// (`numerator / denominator` micro-USD), returning the floored
    /// micro-USD amount to charge now and retaining any new remainder.
    pub fn apply(&mut self, numerator: u128, denominator: u128) -> MicroUsd {
        if denominator == 0 {
            return MicroUsd::ZERO;
        }
        // Scale the exact value up, add the carried remainder, floor to
        // whole micro-USD, and keep the new sub-micro remainder.
        let scaled = numerator * SCALE / denominator + self.carried;
        let whole = scaled / SCALE;
        self.carried = scaled % SCALE;
        MicroUsd(whole as u64)
    }

    pub fn carried_fraction(&self) -> f64 {
        self.carried as f64 / SCALE as f64
    }
}
