//! Piezo-pair registry.
//!
//! One pair of piezoelectric cantilevers deflects each fiber; the registry
//! owns the current 16-bit bias on both cantilevers of every pair, knows
//! which DAC channels drive them, and is the single place where bias
//! arithmetic happens. Two properties are enforced here and relied on
//! everywhere else:
//!
//! - biases never leave `0..=max_bias`, and a clamped move is reported to
//!   the caller so the search can treat the rail as a failed probe;
//! - a change of travel direction on a cantilever inserts an extra
//!   `hysteresis` step, compensating the mechanical backlash of the flexure
//!   before the commanded displacement is measured.

use crate::error::{Error, Result};
use crate::fiber::Fiber;
use crate::{MAX_BIAS, NUM_FIBERS};
use mams_hal::DacChannel;

/// Bias state of one piezo pair.
#[derive(Debug, Clone)]
pub struct PiezoPair {
    dac_left: DacChannel,
    dac_right: DacChannel,
    bias_left: u16,
    bias_right: u16,
    max_bias: u16,
    last_dir_left: i8,
    last_dir_right: i8,
}

impl Default for PiezoPair {
    fn default() -> Self {
        Self {
            dac_left: DacChannel::new(0, 0),
            dac_right: DacChannel::new(0, 0),
            bias_left: 0,
            bias_right: 0,
            max_bias: MAX_BIAS,
            last_dir_left: 0,
            last_dir_right: 0,
        }
    }
}

/// Result of one clamped bias increment.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    /// New bias on the left cantilever.
    pub left: u16,
    /// New bias on the right cantilever.
    pub right: u16,
    /// Whether either side ran into `0` or `max_bias`.
    pub clamped: bool,
}

/// Registry of every pair on the bench.
#[derive(Debug, Clone, Default)]
pub struct PiezoBank {
    pairs: [PiezoPair; NUM_FIBERS],
}

impl PiezoBank {
    /// A bank with all biases at zero and default channel wiring.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the DAC wiring and bias ceiling of one pair.
    pub fn set_dac(
        &mut self,
        fiber: Fiber,
        left: DacChannel,
        right: DacChannel,
        max_bias: u16,
    ) -> Result<()> {
        let pair = &mut self.pairs[fiber.index()];
        if pair.bias_left > max_bias || pair.bias_right > max_bias {
            return Err(Error::OutOfRange("max bias below current bias"));
        }
        pair.dac_left = left;
        pair.dac_right = right;
        pair.max_bias = max_bias;
        Ok(())
    }

    /// Overwrite both biases of one pair. Fails when either value exceeds
    /// the pair's ceiling. Direction history is reset: the next increment
    /// counts as a fresh motion.
    pub fn set_bias(&mut self, fiber: Fiber, left: u16, right: u16) -> Result<()> {
        let pair = &mut self.pairs[fiber.index()];
        if left > pair.max_bias || right > pair.max_bias {
            return Err(Error::OutOfRange("bias"));
        }
        pair.bias_left = left;
        pair.bias_right = right;
        pair.last_dir_left = 0;
        pair.last_dir_right = 0;
        Ok(())
    }

    /// Clamped addition of `(delta_left, delta_right)` to one pair.
    ///
    /// Whenever the sign of a side's increment differs from its previous
    /// increment (the first motion after a `set_bias` always does), an extra
    /// `hysteresis` step is added in the direction of motion to take up the
    /// flexure backlash. Boundary reporting is judged on the pre-hysteresis
    /// target; the extra step itself is clamped silently.
    pub fn increment_bias(
        &mut self,
        fiber: Fiber,
        delta_left: i32,
        delta_right: i32,
        hysteresis: u16,
    ) -> StepOutcome {
        let pair = &mut self.pairs[fiber.index()];
        let max = pair.max_bias;
        let clamped_left = step_side(
            &mut pair.bias_left,
            &mut pair.last_dir_left,
            delta_left,
            hysteresis,
            max,
        );
        let clamped_right = step_side(
            &mut pair.bias_right,
            &mut pair.last_dir_right,
            delta_right,
            hysteresis,
            max,
        );
        StepOutcome {
            left: pair.bias_left,
            right: pair.bias_right,
            clamped: clamped_left || clamped_right,
        }
    }

    /// Current `(left, right)` bias of one pair.
    pub fn bias(&self, fiber: Fiber) -> (u16, u16) {
        let pair = &self.pairs[fiber.index()];
        (pair.bias_left, pair.bias_right)
    }

    /// DAC channel driving the left cantilever.
    pub fn dac_left(&self, fiber: Fiber) -> DacChannel {
        self.pairs[fiber.index()].dac_left
    }

    /// DAC channel driving the right cantilever.
    pub fn dac_right(&self, fiber: Fiber) -> DacChannel {
        self.pairs[fiber.index()].dac_right
    }

    /// Bias ceiling of one pair.
    pub fn max_bias(&self, fiber: Fiber) -> u16 {
        self.pairs[fiber.index()].max_bias
    }
}

/// Clamped, backlash-compensated step of a single cantilever. Returns
/// whether the pre-hysteresis target hit a rail.
fn step_side(bias: &mut u16, last_dir: &mut i8, delta: i32, hysteresis: u16, max: u16) -> bool {
    if delta == 0 {
        return false;
    }
    let target = i32::from(*bias) + delta;
    let clamped = target < 0 || target > i32::from(max);
    let mut new = target.clamp(0, i32::from(max));
    let dir: i8 = if delta > 0 { 1 } else { -1 };
    if dir != *last_dir {
        new = (new + i32::from(dir) * i32::from(hysteresis)).clamp(0, i32::from(max));
    }
    *last_dir = dir;
    *bias = new as u16;
    clamped
}
