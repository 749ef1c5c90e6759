//! Run parameters and the process-wide alignment context.

use crate::error::{Error, Result};
use crate::fiber::FiberList;
use crate::mapping::Mapping;
use crate::motion::MotionState;
use crate::{MAX_STEP_BITS, MAX_STEP_SIZE, NUM_FIBERS};

/// Upper bound on per-iteration sample counts; anything larger is a typo,
/// not a measurement plan.
const MAX_SAMPLES: u32 = 4096;

/// Parameters of one alignment run, as validated off the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RunParams {
    /// ADC conversions averaged per coupling measurement.
    pub num_samples: u32,
    /// Narrowest search step.
    pub min_step_size: u16,
    /// Widest search step.
    pub max_step_size: u16,
    /// Backlash compensation step added on direction changes.
    pub hysteresis_step_size: u16,
}

impl RunParams {
    /// Validate the raw `START` arguments.
    ///
    /// The minimum step must leave at least two halvings of headroom below
    /// the deployment's widest step, and the hysteresis compensation cannot
    /// exceed the widest step.
    pub fn from_wire(num_samples: u32, min_step_bits: u8, hysteresis: u16) -> Result<Self> {
        if num_samples == 0 || num_samples > MAX_SAMPLES {
            return Err(Error::OutOfRange("sample count"));
        }
        if min_step_bits > MAX_STEP_BITS - 2 || min_step_bits > 15 {
            return Err(Error::OutOfRange("minimum step bits"));
        }
        if hysteresis > MAX_STEP_SIZE {
            return Err(Error::OutOfRange("hysteresis step"));
        }
        Ok(Self {
            num_samples,
            min_step_size: 1 << min_step_bits,
            max_step_size: MAX_STEP_SIZE,
            hysteresis_step_size: hysteresis,
        })
    }
}

/// Which fiber set the loop is currently driving.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Phase {
    /// Moving the input fibers, reading their correlated outputs.
    Input,
    /// Moving the output fibers, reading themselves.
    Output,
}

/// Process-wide state of the alignment engine.
///
/// There is exactly one of these per bench; only the request channel that
/// currently holds the arbiter may touch it.
pub struct AlignmentContext {
    /// Fiber classification, fixed for the process lifetime.
    pub mapping: Mapping,
    /// Input fibers, derived once from the mapping.
    pub input_list: FiberList,
    /// Output fibers, derived once from the mapping.
    pub output_list: FiberList,
    /// Fibers moved this phase.
    pub move_list: FiberList,
    /// Fibers read this phase; `read_list[i]` evaluates `move_list[i]`.
    pub read_list: FiberList,
    /// Last accepted coupling per fiber.
    pub coupling: [u16; NUM_FIBERS],
    /// Most recent measurement per fiber.
    pub new_coupling: [u16; NUM_FIBERS],
    /// Per-fiber search state.
    pub motion: [MotionState; NUM_FIBERS],
    /// Current phase.
    pub phase: Phase,
}

impl AlignmentContext {
    /// Build the context for a bench described by `mapping`.
    pub fn new(mapping: Mapping) -> Self {
        let input_list = mapping.input_list();
        let output_list = mapping.output_list();
        Self {
            mapping,
            input_list,
            output_list,
            move_list: FiberList::new(),
            read_list: FiberList::new(),
            coupling: [0; NUM_FIBERS],
            new_coupling: [0; NUM_FIBERS],
            motion: Default::default(),
            phase: Phase::Input,
        }
    }

    /// Forget all measurements from a previous run.
    pub fn reset_measurements(&mut self) {
        self.coupling = [0; NUM_FIBERS];
        self.new_coupling = [0; NUM_FIBERS];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_validation() {
        assert!(RunParams::from_wire(16, MAX_STEP_BITS - 2, 0).is_ok());
        assert!(RunParams::from_wire(16, MAX_STEP_BITS - 1, 0).is_err());
        assert!(RunParams::from_wire(0, 2, 0).is_err());
        assert!(RunParams::from_wire(1 << 20, 2, 0).is_err());
        assert!(RunParams::from_wire(16, 2, MAX_STEP_SIZE).is_ok());
        assert!(RunParams::from_wire(16, 2, MAX_STEP_SIZE + 1).is_err());

        let p = RunParams::from_wire(4, 3, 12).unwrap();
        assert_eq!(p.min_step_size, 8);
        assert_eq!(p.max_step_size, MAX_STEP_SIZE);
        assert_eq!(p.hysteresis_step_size, 12);
    }

    #[test]
    fn context_derives_lists_from_mapping() {
        let ctx = AlignmentContext::new(Mapping::default());
        assert_eq!(ctx.input_list.len(), NUM_FIBERS / 2);
        assert_eq!(ctx.output_list.len(), NUM_FIBERS / 2);
        assert!(ctx.move_list.is_empty());
        assert_eq!(ctx.phase, Phase::Input);
    }
}
