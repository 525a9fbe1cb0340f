//! Fixed-width 256-bit integer used for target and difficulty math.
//!
//! A thin wrapper around `ruint`'s 256-bit type, exposing only the
//! operations the pool needs: conversions to and from `bitcoin::Target`
//! byte order, division for difficulty ratios, and saturating arithmetic
//! for the easy-target (sub-1.0 difficulty) cases.

use std::ops::{Add, Div, Mul};

use bitcoin::pow::Target;
use ruint::aliases::U256 as Inner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct U256(Inner);

impl U256 {
    pub const ZERO: Self = Self(Inner::ZERO);
    pub const MAX: Self = Self(Inner::MAX);

    /// Interpret 32 bytes in Bitcoin's little-endian block order.
    pub fn from_le_bytes(bytes: [u8; 32]) -> Self {
        Self(Inner::from_le_bytes(bytes))
    }

    pub fn to_le_bytes(self) -> [u8; 32] {
        self.0.to_le_bytes()
    }

    pub fn is_zero(self) -> bool {
        self.0 == Inner::ZERO
    }

    pub fn saturating_add(self, rhs: u64) -> Self {
        Self(self.0.saturating_add(Inner::from(rhs)))
    }

    pub fn saturating_mul(self, rhs: u64) -> Self {
        Self(self.0.saturating_mul(Inner::from(rhs)))
    }

    /// Lossy conversion for display and ratio math.
    pub fn as_f64(self) -> f64 {
        self.0
            .as_limbs()
            .iter()
            .enumerate()
            .map(|(i, &limb)| limb as f64 * 2f64.powi(64 * i as i32))
            .sum()
    }
}

impl From<u64> for U256 {
    fn from(value: u64) -> Self {
        Self(Inner::from(value))
    }
}

impl From<u128> for U256 {
    fn from(value: u128) -> Self {
        Self(Inner::from(value))
    }
}

impl From<Target> for U256 {
    fn from(target: Target) -> Self {
        Self::from_le_bytes(target.to_le_bytes())
    }
}

impl From<U256> for Target {
    fn from(value: U256) -> Self {
        Target::from_le_bytes(value.to_le_bytes())
    }
}

impl Div for U256 {
    type Output = Self;

    /// Integer division. Division by zero saturates to `MAX` rather than
    /// panicking; callers treat a zero divisor as "easiest possible".
    fn div(self, rhs: Self) -> Self {
        if rhs.is_zero() {
            return Self::MAX;
        }
        Self(self.0 / rhs.0)
    }
}

impl Div<u64> for U256 {
    type Output = Self;

    fn div(self, rhs: u64) -> Self {
        self / Self::from(rhs)
    }
}

impl Mul<u64> for U256 {
    type Output = Self;

    fn mul(self, rhs: u64) -> Self {
        self.saturating_mul(rhs)
    }
}

impl Add<u64> for U256 {
    type Output = Self;

    fn add(self, rhs: u64) -> Self {
        self.saturating_add(rhs)
    }
}
