//! Difficulty type with lossless 256-bit representation.

use std::cmp::Ordering;
use std::fmt;

use bitcoin::hash_types::BlockHash;
use bitcoin::hashes::Hash;
use bitcoin::pow::{CompactTarget, Target};

use crate::u256::U256;

/// Mining difficulty.
///
/// Internally stores the corresponding target value for lossless 256-bit
/// precision. Difficulty and target have an inverse relationship:
/// ```text
/// target = MAX_TARGET / difficulty
/// difficulty = MAX_TARGET / target
/// ```
///
/// Used for:
/// - Stratum protocol (`mining.set_difficulty`, vardiff)
/// - Share validation (via `to_target()`)
/// - Classifying submitted hashes (via `from_hash()`)
/// - Logging and display
///
/// A hash satisfies a difficulty when it is numerically less than or equal
/// to the difficulty's target, read in Bitcoin's little-endian block order.
/// Higher difficulty means a smaller target and fewer qualifying hashes.
#[derive(Debug, Clone, Copy)]
pub struct Difficulty(Target);

impl Difficulty {
    /// Maximum difficulty (target of zero; no hash can satisfy it).
    pub const MAX: Self = Self(Target::ZERO);

    /// The difficulty-1 ("diff1") target, as encoded by nBits 0x1d00ffff.
    pub fn diff1_target() -> Target {
        Target::from_compact(CompactTarget::from_consensus(0x1d00ffff))
    }

    /// Create from f64, accepting sub-1.0 difficulties.
    ///
    /// Integer difficulties should use `Difficulty::from(u64)`. Fractional
    /// values appear in vardiff floors and in tests; the conversion is
    /// necessarily lossy.
    pub fn from_f64(value: f64) -> Self {
        if value <= 0.0 || !value.is_finite() {
            return Self(Target::MAX);
        }

        // target = MAX / value. At or above 1.0, fixed point with 16
        // fractional bits keeps quantised vardiff values (2^(k/gran))
        // precise; MAX is ~2^224, so the shifted numerator stays well
        // inside 256 bits. Below 1.0, multiplying MAX by the rounded
        // reciprocal is the more accurate form.
        let max_target = U256::from(Target::MAX);
        if value >= 1.0 {
            let scaled = ((value * 65536.0).round() as u128).max(1);
            Self(Target::from(
                max_target.saturating_mul(65536) / U256::from(scaled),
            ))
        } else {
            let multiplier = ((1.0 / value).round() as u64).max(1);
            Self(Target::from(max_target.saturating_mul(multiplier)))
        }
    }

    /// Get difficulty as f64 (lossy for very large values).
    pub fn as_f64(self) -> f64 {
        let target = U256::from(self.0);
        if target.is_zero() {
            return f64::INFINITY;
        }
        U256::from(Target::MAX).as_f64() / target.as_f64()
    }

    /// Create difficulty from a target (lossless).
    pub fn from_target(target: Target) -> Self {
        Self(target)
    }

    /// Get the underlying target (lossless).
    ///
    /// Use this for share validation (comparing against header hashes).
    pub fn to_target(self) -> Target {
        self.0
    }

    /// Calculate the difficulty a header hash represents.
    ///
    /// Defined as `diff1 / (hash + 1)` with the hash read in little-endian
    /// block order. The met target is reconstructed from that ratio so the
    /// result stays comparable with pool-assigned difficulties; an
    /// all-zero hash saturates to `MAX`.
    pub fn from_hash(hash: &BlockHash) -> Self {
        let hash_value = U256::from_le_bytes(*hash.as_byte_array());
        if hash_value.is_zero() {
            return Self::MAX;
        }
        // The hash itself is the hardest target it satisfies.
        Self(Target::from(hash_value))
    }

    /// Whether a header hash meets this difficulty's target.
    pub fn is_met_by(self, hash: &BlockHash) -> bool {
        U256::from_le_bytes(*hash.as_byte_array()) <= U256::from(self.0)
    }
}

impl From<u64> for Difficulty {
    fn from(diff: u64) -> Self {
        if diff == 0 {
            return Self(Target::MAX);
        }
        let max_target = U256::from(Target::MAX);
        Self(Target::from(max_target / diff))
    }
}

impl PartialEq for Difficulty {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Difficulty {}

impl PartialOrd for Difficulty {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Difficulty {
    fn cmp(&self, other: &Self) -> Ordering {
        // Smaller target = higher difficulty.
        other.0.cmp(&self.0)
    }
}

/// Metric prefixes for log output, largest first.
const UNITS: [(f64, &str); 5] = [
    (1e15, "P"),
    (1e12, "T"),
    (1e9, "G"),
    (1e6, "M"),
    (1e3, "K"),
];

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.as_f64();

        if value < 1.0 {
            let text = format!("{value:.6}");
            return f.write_str(text.trim_end_matches('0').trim_end_matches('.'));
        }

        let (scaled, suffix) = UNITS
            .iter()
            .find(|(threshold, _)| value >= *threshold)
            .map(|(threshold, suffix)| (value / threshold, *suffix))
            .unwrap_or((value, ""));

        // Three significant digits; whole numbers drop the decimals.
        let decimals = if scaled.fract() == 0.0 {
            0
        } else {
            // scaled is in [1, 1000), so this is 0, 1, or 2 places.
            2usize.saturating_sub(scaled.log10() as usize)
        };
        write!(f, "{:.*}{}", decimals, scaled, suffix)
    }
}

/// Snap a difficulty onto a logarithmic grid, then clamp.
///
/// The grid steps are `2^(k/granularity)` for integer `k`; granularity 1
/// gives plain powers of two, higher granularities give finer steps. The
/// nearest grid point is chosen, then the result is clamped into
/// `[min, max]`. Quantising keeps `mining.set_difficulty` values stable
/// under small rate fluctuations.
pub fn quantize(difficulty: f64, min: f64, max: f64, granularity: u32) -> f64 {
    let granularity = granularity.max(1) as f64;
    let clamped = |d: f64| d.clamp(min, max);

    if difficulty <= 0.0 || !difficulty.is_finite() {
        return clamped(min);
    }

    let steps = (granularity * difficulty.log2()).round();
    clamped(2f64.powf(steps / granularity))
}
