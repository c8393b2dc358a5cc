//! Dual-oracle price consensus.
//!
//! Both the live path (router reads) and the demo path feed their observations
//! through [`evaluate`], so rounding and tie-breaks are shared everywhere a
//! verdict is produced.

use ethereum_types::U256;
use serde::{Deserialize, Serialize};

/// Basis points in one unit.
pub const BPS_DENOMINATOR: u64 = 10_000;

/// One feed's latest report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedObservation {
    pub price: i128,
    pub updated_at: u64,
}

impl FeedObservation {
    pub fn new(price: i128, updated_at: u64) -> Self {
        Self { price, updated_at }
    }

    pub fn is_fresh(&self, now: u64, stale_after_seconds: u64) -> bool {
        now.saturating_sub(self.updated_at) <= stale_after_seconds
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusPolicy {
    pub max_deviation_bps: u32,
    pub stale_after_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub price: i128,
    pub safe: bool,
    pub both_fresh: bool,
    pub deviation_bps: u64,
}

impl Verdict {
    /// A verdict the evaluator treats as healthy. Anything else opens an incident.
    pub fn is_healthy(&self) -> bool {
        self.safe && self.both_fresh
    }
}

/// Relative difference of two prices in basis points, floored.
///
/// Computed in 256-bit arithmetic; two zero prices deviate by 0.
pub fn deviation_bps(a: i128, b: i128) -> u64 {
    let larger = a.unsigned_abs().max(b.unsigned_abs());
    if larger == 0 {
        return 0;
    }
    let diff = U256::from(a.abs_diff(b));
    (diff * U256::from(BPS_DENOMINATOR) / U256::from(larger)).low_u64()
}

/// Floor of `(a + b) / 2` without intermediate overflow.
pub fn floor_midpoint(a: i128, b: i128) -> i128 {
    a.div_euclid(2) + b.div_euclid(2) + (a.rem_euclid(2) + b.rem_euclid(2)) / 2
}

/// Decide whether the pair agrees closely enough, and recently enough, to trust.
pub fn evaluate(
    protofire: FeedObservation,
    dia: FeedObservation,
    now: u64,
    policy: &ConsensusPolicy,
) -> Verdict {
    let protofire_fresh = protofire.is_fresh(now, policy.stale_after_seconds);
    let dia_fresh = dia.is_fresh(now, policy.stale_after_seconds);
    let deviation = deviation_bps(protofire.price, dia.price);

    let (price, safe) = match (protofire_fresh, dia_fresh) {
        (true, true) if deviation <= u64::from(policy.max_deviation_bps) => {
            (floor_midpoint(protofire.price, dia.price), true)
        }
        (true, true) => (most_recent(protofire, dia).price, false),
        (true, false) => (protofire.price, false),
        (false, true) => (dia.price, false),
        (false, false) => (most_recent(protofire, dia).price, false),
    };

    Verdict {
        price,
        safe,
        both_fresh: protofire_fresh && dia_fresh,
        deviation_bps: deviation,
    }
}

// Ties resolve to the first feed.
fn most_recent(first: FeedObservation, second: FeedObservation) -> FeedObservation {
    if second.updated_at > first.updated_at {
        second
    } else {
        first
    }
}
