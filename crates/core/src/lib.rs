//! Alignment search engine for the MAMS multichannel fiber bench.
//!
//! A bench carries one piezo pair per optical fiber; each pair deflects its
//! fiber along two orthogonal axes under 16-bit DAC bias control, and an ADC
//! array reports the optical power coupled through each fiber. This crate
//! owns everything between "a request channel asked for an alignment" and
//! "the DACs hold the biases that maximize coupling":
//!
//! - [`piezo`]: the per-fiber bias registry with clamping and mechanical
//!   backlash compensation;
//! - [`motion`] and [`kernel`]: the per-fiber search state machine and the
//!   translation from search intent to bias deltas;
//! - [`align`]: the coordinated move→settle→read→decide loop over all
//!   fibers, plus the pre-run hysteresis discharge;
//! - [`arbiter`]: the compare-and-set owner lock that keeps the operator
//!   and orchestrator channels from driving the bench at the same time;
//! - [`frame`]: the line-oriented data frames streamed to whichever channel
//!   owns the run.
//!
//! The crate has no platform dependencies; all hardware access goes through
//! the capability traits of `mams-hal`.

pub mod align;
pub mod arbiter;
pub mod context;
pub mod error;
pub mod fiber;
pub mod frame;
pub mod kernel;
pub mod mapping;
pub mod motion;
pub mod piezo;

pub use crate::error::{Error, Result};
pub use crate::fiber::{Fiber, FiberList};

use std::time::Duration;

/// Number of fibers on the bench. Fixed per deployment.
pub const NUM_FIBERS: usize = 8;

/// Mid-scale bias, the mechanical rest position of every cantilever.
pub const HALF_BIAS: u16 = 1 << 15;

/// Largest bias the DACs can produce.
pub const MAX_BIAS: u16 = u16::MAX;

/// log2 of the widest search step. Configured per deployment; the wire
/// protocol validates requested minimum steps against this.
pub const MAX_STEP_BITS: u8 = 13;

/// Widest search step, the starting perturbation of a non-continuous run.
pub const MAX_STEP_SIZE: u16 = 1 << MAX_STEP_BITS;

/// Pause after a batch of DAC writes, long enough for the piezos to
/// physically reach the commanded deflection before the next conversion.
pub const SETTLING_TIME: Duration = Duration::from_micros(500);

/// Bias increment used by the hysteresis discharge sweep.
pub const DISCHARGE_STEP: u16 = 64;

/// Pause between discharge sweep steps.
pub const DISCHARGE_PAUSE: Duration = Duration::from_micros(100);
