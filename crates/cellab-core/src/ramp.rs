//! Bandwidth ramp strategies.
//!
//! ## Policy
//!
//! - **Incremental**: a fixed schedule, `(i + 1) * step`, capped at the
//!   original target. Only applies to targets above `min_original_mbps`.
//! - **Smart**: adaptive. When the last run got within 90% of its step the
//!   step grows by an increasingly large increment; otherwise it holds.
//!   Smart evaluation never lowers the step; reductions only come from the
//!   packet-loss path.

/// Tunables shared by both ramp strategies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampPolicy {
    /// Increment per iteration index (Mbps).
    pub step_mbps: u32,
    /// Fraction of the step that counts as "hitting" it.
    pub achieve_ratio: f64,
    /// Incremental ramp is skipped unless the original target exceeds this.
    pub min_original_mbps: u32,
}

impl Default for RampPolicy {
    fn default() -> Self {
        Self {
            step_mbps: 50,
            achieve_ratio: 0.9,
            min_original_mbps: 100,
        }
    }
}

/// Result of a smart ramp evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RampDecision {
    Increase { from: u32, to: u32 },
    Hold(u32),
}

impl RampDecision {
    pub fn bandwidth(self) -> u32 {
        match self {
            RampDecision::Increase { to, .. } => to,
            RampDecision::Hold(bw) => bw,
        }
    }
}

impl RampPolicy {
    /// Smart ramp: push harder if the run comfortably reached its step.
    pub fn evaluate(
        &self,
        step: u32,
        iteration: usize,
        max_achieved: u32,
        original: u32,
    ) -> RampDecision {
        let reached = f64::from(max_achieved) >= f64::from(step) * self.achieve_ratio;
        if reached && step < original {
            let increment = self.increment(iteration);
            let to = step.saturating_add(increment).min(original);
            RampDecision::Increase { from: step, to }
        } else {
            RampDecision::Hold(step)
        }
    }

    /// Incremental schedule for `iteration`, or `None` when the ramp does
    /// not apply (no target, or a target too small to ramp).
    pub fn incremental(&self, iteration: usize, target: Option<u32>, original: u32) -> Option<u32> {
        target?;
        if original <= self.min_original_mbps {
            return None;
        }
        Some(self.increment(iteration).min(original))
    }

    fn increment(&self, iteration: usize) -> u32 {
        let n = u32::try_from(iteration).unwrap_or(u32::MAX).saturating_add(1);
        n.saturating_mul(self.step_mbps)
    }
}
