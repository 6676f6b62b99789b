//! Timelock ordering policy
//!
//! The maker reveals the secret by claiming leg B, after which the taker needs
//! time to claim leg A. Leg A must therefore outlive leg B by at least `margin`:
//!
//! ```text
//! timelock_a >= timelock_b + margin
//! ```
//!
//! All timelock values used by the agents come from this module.

use super::{Leg, LegPhase};
use crate::config::TimelockConfig;
use crate::error::{SwapError, SwapResult};

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelockPolicy {
    window_a: u64,
    window_b: u64,
    margin: u64,
}

impl TimelockPolicy {
    /// Build a policy; windows that cannot satisfy the ordering are rejected
    pub fn new(window_a: u64, window_b: u64, margin: u64) -> SwapResult<Self> {
        if window_b == 0 || margin == 0 {
            return Err(SwapError::Config(
                "timelock window_b and margin must be positive".to_string(),
            ));
        }
        let policy = Self {
            window_a,
            window_b,
            margin,
        };
        policy.assert_ordering(window_a, window_b)?;
        Ok(policy)
    }

    pub fn from_config(config: &TimelockConfig) -> SwapResult<Self> {
        Self::new(config.window_a_secs, config.window_b_secs, config.margin_secs)
    }

    pub fn margin(&self) -> u64 {
        self.margin
    }

    /// `(timelock_a, timelock_b)` anchored at `now`, ordering asserted
    pub fn choose_timelocks(&self, now: u64) -> SwapResult<(u64, u64)> {
        let timelock_a = now.checked_add(self.window_a).ok_or_else(overflow)?;
        let timelock_b = now.checked_add(self.window_b).ok_or_else(overflow)?;
        self.assert_ordering(timelock_a, timelock_b)?;
        Ok((timelock_a, timelock_b))
    }

    /// Timelock for the taker's leg, asserted against the leg A timelock the
    /// maker actually published.
    pub fn taker_timelock(&self, now: u64, observed_timelock_a: u64) -> SwapResult<u64> {
        let timelock_b = now.checked_add(self.window_b).ok_or_else(overflow)?;
        self.assert_ordering(observed_timelock_a, timelock_b)?;
        debug!(
            "Taker timelock {} against leg A timelock {} (margin {})",
            timelock_b, observed_timelock_a, self.margin
        );
        Ok(timelock_b)
    }

    pub fn assert_ordering(&self, timelock_a: u64, timelock_b: u64) -> SwapResult<()> {
        let satisfied = timelock_b
            .checked_add(self.margin)
            .map(|min_a| timelock_a >= min_a)
            .unwrap_or(false);
        if satisfied {
            Ok(())
        } else {
            Err(SwapError::TimelockOrdering {
                timelock_a,
                timelock_b,
                margin: self.margin,
            })
        }
    }

    pub fn is_refund_eligible(leg: &Leg, now: u64) -> bool {
        leg.phase == LegPhase::Initiated && now >= leg.timelock
    }

    pub fn can_claim(leg: &Leg, now: u64) -> bool {
        leg.phase == LegPhase::Initiated && now < leg.timelock
    }
}

fn overflow() -> SwapError {
    SwapError::Internal("timelock overflow".to_string())
}
