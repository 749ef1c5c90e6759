//! Per-fiber search state.
//!
//! Every fiber climbs its coupling landscape independently through a small
//! state machine. One global iteration gives each enabled fiber exactly one
//! probe move; the machine records which direction is being probed, how far,
//! and which phase of the local search the fiber is in, and the transition
//! functions fold in the outcome of the following measurement.
//!
//! The transitions are pure state updates with no hardware side effects, so
//! the whole table is unit-testable; translating the resulting intent into
//! DAC deltas is the kernel's job.

/// Probe direction, encoded as a sign pair on `(Δleft, Δright)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Axis {
    /// `(+s, 0)`
    Left,
    /// `(-s, 0)`
    Right,
    /// `(0, +s)`
    Up,
    /// `(0, -s)`
    Down,
}

impl Axis {
    /// Unit displacement of this axis on `(Δleft, Δright)`.
    pub fn unit(self) -> (i32, i32) {
        match self {
            Axis::Left => (1, 0),
            Axis::Right => (-1, 0),
            Axis::Up => (0, 1),
            Axis::Down => (0, -1),
        }
    }

    /// The opposite direction along the same geometric axis.
    pub fn opposite(self) -> Axis {
        match self {
            Axis::Left => Axis::Right,
            Axis::Right => Axis::Left,
            Axis::Up => Axis::Down,
            Axis::Down => Axis::Up,
        }
    }

    /// The next direction a quarter turn away.
    pub fn rotated(self) -> Axis {
        match self {
            Axis::Left => Axis::Up,
            Axis::Up => Axis::Right,
            Axis::Right => Axis::Down,
            Axis::Down => Axis::Left,
        }
    }

    /// Inverse of [`Axis::rotated`].
    pub fn rotated_back(self) -> Axis {
        match self {
            Axis::Up => Axis::Left,
            Axis::Right => Axis::Up,
            Axis::Down => Axis::Right,
            Axis::Left => Axis::Down,
        }
    }
}

/// Phase of the local search.
///
/// A full failed round probes the current direction, its opposite, the
/// perpendicular, and the remaining opposite perpendicular, returning to the
/// reference point in between; `Fail22` ends the round by halving the step.
/// The `Fail12`/`Fail22` states are deliberate return-to-reference moves and
/// never count as failures themselves.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Attempt {
    /// Climbing: probe one step along the current axis.
    Initial,
    /// First probe failed; probing the opposite side.
    Reset1,
    /// Both sides failed; probing the perpendicular while returning.
    Fail11,
    /// Perpendicular failed; returning to the reference point.
    Fail12,
    /// Probing the remaining perpendicular direction.
    Reset2,
    /// Probing the quarter-turn direction while returning.
    Fail21,
    /// Returning to the reference point before halving the step.
    Fail22,
}

/// Widest climbing stride, in steps per iteration. A run of successful
/// probes doubles the stride up to this bound; any failure drops back to
/// single steps.
const MAX_CLIMB_STRIDE: i8 = 64;

/// Search state of one fiber.
#[derive(Debug, Clone)]
pub struct MotionState {
    /// Current probe half-amplitude in bias LSBs. Zero means converged.
    pub curr_step_size: u16,
    /// Widest step of this run.
    pub max_step_size: u16,
    /// Narrowest step before the fiber is declared converged.
    pub min_step_size: u16,
    /// Direction probed by the next move.
    pub axis: Axis,
    /// Signed step count along the axis for climbing moves. The compound
    /// probe/return moves of the failure states are derived from `offset`
    /// instead; there `steps` only describes the nominal probe.
    pub steps: i8,
    /// Phase of the local search.
    pub attempt: Attempt,
    /// Bias offset `(left, right)` from the reference point, accumulated
    /// from the moves as actually applied. Clamped or backlash-compensated
    /// moves land where they land; tracking the real deltas keeps the
    /// return moves honest.
    pub offset: (i32, i32),
    /// A reset-phase move clamped against a bias rail.
    pub boundary_hit_on_reset: bool,
    /// A perpendicular-probe move clamped against a bias rail.
    pub boundary_hit_on_fail_1: bool,
    /// Whether this fiber takes part in the current search.
    pub enabled: bool,
}

impl Default for MotionState {
    fn default() -> Self {
        Self {
            curr_step_size: 0,
            max_step_size: 0,
            min_step_size: 0,
            axis: Axis::Left,
            steps: 1,
            attempt: Attempt::Initial,
            offset: (0, 0),
            boundary_hit_on_reset: false,
            boundary_hit_on_fail_1: false,
            enabled: false,
        }
    }
}

impl MotionState {
    /// Arm the fiber for a new search. A continuous-mode search starts at
    /// the narrowest step and only dithers around the held optimum.
    pub fn reset(&mut self, min_step_size: u16, max_step_size: u16, continuous: bool) {
        self.min_step_size = min_step_size;
        self.max_step_size = max_step_size;
        self.curr_step_size = if continuous { min_step_size } else { max_step_size };
        self.axis = Axis::Left;
        self.steps = 1;
        self.attempt = Attempt::Initial;
        self.offset = (0, 0);
        self.boundary_hit_on_reset = false;
        self.boundary_hit_on_fail_1 = false;
    }

    /// Record the bias delta a move actually applied to this fiber's pair.
    pub fn apply_move(&mut self, delta_left: i32, delta_right: i32) {
        self.offset.0 += delta_left;
        self.offset.1 += delta_right;
    }

    /// Whether the local search has finished.
    pub fn converged(&self) -> bool {
        self.curr_step_size == 0
    }

    /// Record that this iteration's move clamped against a bias rail. The
    /// sticky flag makes the next decision treat the probe as a failure even
    /// if the reading improved: a maximum on the rail is not a maximum.
    pub fn handle_boundary_hit(&mut self) {
        match self.attempt {
            Attempt::Reset1 | Attempt::Reset2 => self.boundary_hit_on_reset = true,
            Attempt::Fail11 | Attempt::Fail21 => self.boundary_hit_on_fail_1 = true,
            _ => {}
        }
    }

    /// Consume the sticky boundary flags after a decision.
    pub fn clear_boundary_flags(&mut self) {
        self.boundary_hit_on_reset = false;
        self.boundary_hit_on_fail_1 = false;
    }

    /// The probe found a new maximum (or finished a return move). The
    /// probe's position becomes the new reference point.
    pub fn handle_success(&mut self) {
        self.offset = (0, 0);
        match self.attempt {
            // Keep climbing in the direction that just paid off, doubling
            // the stride while the landscape keeps agreeing.
            Attempt::Initial => {
                self.steps = self.steps.saturating_mul(2).min(MAX_CLIMB_STRIDE);
            }
            Attempt::Reset1 => {
                // The opposite side is uphill; make it the climb direction.
                self.axis = self.axis.opposite();
                self.steps = 1;
                self.attempt = Attempt::Initial;
            }
            Attempt::Fail11 | Attempt::Reset2 | Attempt::Fail21 => {
                self.steps = 1;
                self.attempt = Attempt::Initial;
            }
            Attempt::Fail12 => {
                // Back at the reference; probe the remaining direction.
                self.axis = self.axis.opposite();
                self.steps = 1;
                self.attempt = Attempt::Reset2;
            }
            Attempt::Fail22 => {
                self.halve_step();
                self.steps = 1;
                self.attempt = Attempt::Initial;
            }
        }
    }

    /// The probe did not improve on the stored maximum (or clamped against
    /// a rail, which takes the same transition).
    pub fn handle_failure(&mut self) {
        match self.attempt {
            Attempt::Initial => {
                // Undo the probe and try one step on the opposite side in a
                // single move.
                self.steps = -(self.steps + 1);
                self.attempt = Attempt::Reset1;
            }
            Attempt::Reset1 => {
                self.axis = self.axis.rotated();
                self.steps = 1;
                self.attempt = Attempt::Fail11;
            }
            Attempt::Fail11 => {
                self.steps = -1;
                self.attempt = Attempt::Fail12;
            }
            Attempt::Reset2 => {
                self.axis = self.axis.rotated();
                self.steps = 1;
                self.attempt = Attempt::Fail21;
            }
            Attempt::Fail21 => {
                self.steps = -1;
                self.attempt = Attempt::Fail22;
            }
            // Return moves never fail; the decision logic maps them to
            // success unconditionally. Keep the transition total anyway.
            Attempt::Fail12 | Attempt::Fail22 => self.handle_success(),
        }
    }

    fn halve_step(&mut self) {
        let next = self.curr_step_size / 2;
        self.curr_step_size = if next < self.min_step_size { 0 } else { next };
    }
}

/// Arm exactly the fibers in `move_list`; other states are left untouched
/// but skipped by the loop.
pub fn enable_motion(move_list: &crate::FiberList, states: &mut [MotionState]) {
    for fiber in move_list.iter() {
        states[fiber.index()].enabled = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn armed() -> MotionState {
        let mut st = MotionState::default();
        st.reset(4, 1024, false);
        st.enabled = true;
        st
    }

    #[test]
    fn axis_algebra() {
        for axis in [Axis::Left, Axis::Right, Axis::Up, Axis::Down] {
            assert_eq!(axis.opposite().opposite(), axis);
            assert_eq!(axis.rotated().rotated_back(), axis);
            assert_eq!(axis.rotated().rotated(), axis.opposite());
            let (l, r) = axis.unit();
            let (ol, or) = axis.opposite().unit();
            assert_eq!((l + ol, r + or), (0, 0));
        }
    }

    #[test]
    fn reset_modes() {
        let mut st = MotionState::default();
        st.reset(8, 2048, false);
        assert_eq!(st.curr_step_size, 2048);
        st.reset(8, 2048, true);
        assert_eq!(st.curr_step_size, 8);
        assert_eq!(st.attempt, Attempt::Initial);
        assert!(!st.converged());
    }

    #[test]
    fn success_keeps_climbing_and_accelerates() {
        let mut st = armed();
        st.handle_success();
        assert_eq!(st.attempt, Attempt::Initial);
        assert_eq!(st.axis, Axis::Left);
        assert_eq!(st.steps, 2);
        for _ in 0..8 {
            st.handle_success();
        }
        // The stride doubles per confirmed step, bounded well inside i8.
        assert_eq!(st.steps, 64);
        st.handle_success();
        assert_eq!(st.steps, 64);

        // A failed stride swings back past the reference plus one step.
        st.handle_failure();
        assert_eq!((st.attempt, st.steps), (Attempt::Reset1, -65));
    }

    #[test]
    fn success_re_references_the_offset() {
        let mut st = armed();
        st.apply_move(128, -32);
        assert_eq!(st.offset, (128, -32));
        st.handle_success();
        assert_eq!(st.offset, (0, 0));
    }

    #[test]
    fn full_failed_round_halves_the_step() {
        let mut st = armed();
        // INITIAL → RESET_1 → FAIL_1_1 → FAIL_1_2 → RESET_2 → FAIL_2_1
        // → FAIL_2_2, all failing; the two return states resolve as
        // successes at the decision site, modeled here by handle_success.
        st.handle_failure();
        assert_eq!((st.attempt, st.steps), (Attempt::Reset1, -2));
        st.handle_failure();
        assert_eq!((st.attempt, st.axis, st.steps), (Attempt::Fail11, Axis::Up, 1));
        st.handle_failure();
        assert_eq!((st.attempt, st.steps), (Attempt::Fail12, -1));
        st.handle_success();
        assert_eq!((st.attempt, st.axis, st.steps), (Attempt::Reset2, Axis::Down, 1));
        st.handle_failure();
        assert_eq!((st.attempt, st.axis, st.steps), (Attempt::Fail21, Axis::Left, 1));
        st.handle_failure();
        assert_eq!((st.attempt, st.steps), (Attempt::Fail22, -1));
        st.handle_success();
        assert_eq!((st.attempt, st.curr_step_size), (Attempt::Initial, 512));
    }

    #[test]
    fn reset_success_reverses_the_climb() {
        let mut st = armed();
        st.handle_failure();
        st.handle_success();
        assert_eq!((st.attempt, st.axis), (Attempt::Initial, Axis::Right));
    }

    #[test]
    fn step_collapses_to_zero_below_minimum() {
        let mut st = armed();
        st.curr_step_size = 8;
        st.attempt = Attempt::Fail22;
        st.handle_success();
        assert_eq!(st.curr_step_size, 4);
        st.attempt = Attempt::Fail22;
        st.handle_success();
        assert!(st.converged());
    }

    #[test]
    fn boundary_flags_follow_the_attempt() {
        let mut st = armed();
        st.attempt = Attempt::Reset2;
        st.handle_boundary_hit();
        assert!(st.boundary_hit_on_reset);
        assert!(!st.boundary_hit_on_fail_1);

        st.clear_boundary_flags();
        st.attempt = Attempt::Fail21;
        st.handle_boundary_hit();
        assert!(st.boundary_hit_on_fail_1);

        st.clear_boundary_flags();
        st.attempt = Attempt::Initial;
        st.handle_boundary_hit();
        assert!(!st.boundary_hit_on_reset && !st.boundary_hit_on_fail_1);
    }

    #[test]
    fn enable_motion_marks_only_listed_fibers() {
        use crate::{Fiber, FiberList};
        let mut states = vec![MotionState::default(); crate::NUM_FIBERS];
        let mut list = FiberList::new();
        list.push(Fiber::new(2).unwrap()).unwrap();
        list.push(Fiber::new(5).unwrap()).unwrap();
        enable_motion(&list, &mut states);
        for (i, st) in states.iter().enumerate() {
            assert_eq!(st.enabled, i == 2 || i == 5);
        }
    }
}
