//! Algorithm kernel: motion intent → bias deltas, and probe outcomes →
//! state transitions.
//!
//! The kernel is pure arithmetic over [`MotionState`] values. All geometry
//! lives here: which `(Δleft, Δright)` pair realizes a probe, and how the
//! offset a fiber has accumulated since its last accepted maximum is undone
//! to bring it back to the reference point.

use crate::motion::{Attempt, Axis, MotionState};

/// Translate an axis and a signed step count into a bias delta pair.
pub fn displacement_to_delta_bias(axis: Axis, steps: i8, step_size: u16) -> (i32, i32) {
    let (ul, ur) = axis.unit();
    let amount = i32::from(steps) * i32::from(step_size);
    (ul * amount, ur * amount)
}

/// The full delta applied by this iteration's move for `state`.
///
/// Probe geometry per round, all relative to the reference point `R` (the
/// position of the stored maximum, where the tracked offset is zero):
///
/// - `INITIAL` climbs `steps` steps along the axis, departing from `R`.
/// - `RESET_1` probes one step on the opposite side of `R`.
/// - `FAIL_1_1` probes one step along the perpendicular.
/// - `FAIL_1_2` returns to `R`.
/// - `RESET_2` probes the remaining opposite perpendicular.
/// - `FAIL_2_1` probes the quarter-turn direction.
/// - `FAIL_2_2` returns to `R`.
///
/// Every non-climbing move is computed as its target position minus the
/// offset accumulated from the moves as actually applied, so a probe that
/// clamped against a rail (or picked up a backlash step) is still undone
/// exactly by the next transition.
pub fn delta_bias_for(state: &MotionState) -> (i32, i32) {
    let s = i32::from(state.curr_step_size);
    let (tl, tr) = match state.attempt {
        Attempt::Initial => {
            return displacement_to_delta_bias(state.axis, state.steps, state.curr_step_size);
        }
        Attempt::Reset1 => {
            let (ul, ur) = state.axis.unit();
            (-ul, -ur)
        }
        Attempt::Fail11 | Attempt::Reset2 | Attempt::Fail21 => state.axis.unit(),
        Attempt::Fail12 | Attempt::Fail22 => (0, 0),
    };
    (tl * s - state.offset.0, tr * s - state.offset.1)
}

/// Update the stored maximum: `true` iff `new_val` beats it.
pub fn compare_coupling(stored: &mut u16, new_val: u16) -> bool {
    if new_val > *stored {
        *stored = new_val;
        true
    } else {
        false
    }
}

/// Fold the measurement outcome and the sticky boundary flags into a
/// success/failure verdict for this iteration.
///
/// A probe that clamped against a bias rail is judged a failure even when
/// the reading improved: an optimum on the rail is an artifact of the
/// clamp, not of the landscape. The boundary-forced failure then takes the
/// same transition as an ordinary no-new-maximum failure; the two cases are
/// deliberately indistinguishable downstream.
pub fn decide(state: &MotionState, new_max_found: bool) -> bool {
    match state.attempt {
        // Deliberate return-to-reference moves always "succeed".
        Attempt::Fail12 | Attempt::Fail22 => true,
        Attempt::Reset1 | Attempt::Reset2 => new_max_found && !state.boundary_hit_on_reset,
        Attempt::Fail11 | Attempt::Fail21 => new_max_found && !state.boundary_hit_on_fail_1,
        Attempt::Initial => new_max_found,
    }
}
