//! The coordinated alignment loop.
//!
//! One iteration moves every fiber in the move list, waits out the piezo
//! settling time, measures every fiber in the read list, streams the data to
//! the owning channel, and only then lets each fiber's state machine decide
//! how its probe went. The ordering is a hard serial one, never a pipeline:
//! a conversion taken before the mechanics settle would judge the previous
//! position.
//!
//! Alignment happens in two phases: first the input fibers are steered while
//! their correlated outputs are read, then the output fibers are steered
//! reading themselves. An orchestrator-owned run ends when the second phase
//! converges; an operator-owned run drops to the minimum step and keeps
//! dithering around the optimum until cancelled.

use crate::arbiter::Owner;
use crate::context::{AlignmentContext, Phase, RunParams};
use crate::error::{Error, Result};
use crate::fiber::Fiber;
use crate::frame::{self, FrameSink};
use crate::kernel;
use crate::motion::{enable_motion, Attempt};
use crate::piezo::PiezoBank;
use crate::{DISCHARGE_PAUSE, DISCHARGE_STEP, HALF_BIAS, NUM_FIBERS, SETTLING_TIME};
use mams_hal::Bench;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// Cooperative cancellation flag.
///
/// Backed by a static so an async-signal-safe handler can set it directly;
/// the loop polls it at the top of every iteration and after every emission.
#[derive(Copy, Clone)]
pub struct CancelToken {
    flag: &'static AtomicBool,
}

impl CancelToken {
    /// Wrap a static flag.
    pub const fn new(flag: &'static AtomicBool) -> Self {
        Self { flag }
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Re-arm the token before a new run.
    pub fn clear(&self) {
        self.flag.store(false, Ordering::Release);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// How a run ended.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Both phases converged.
    Completed,
    /// The cancel token fired first.
    Cancelled,
}

/// Sleep intervals of the loop. Tests run with zeroed pauses; the bench
/// uses the deployment constants.
#[derive(Debug, Copy, Clone)]
pub struct Timing {
    /// Pause after each batch of DAC writes.
    pub settling: Duration,
    /// Pause between hysteresis discharge steps.
    pub discharge_pause: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self { settling: SETTLING_TIME, discharge_pause: DISCHARGE_PAUSE }
    }
}

/// Center every pair at `HALF_BIAS` on both cantilevers and push the values
/// to the DACs. The caller owes the bench a settling pause afterwards.
pub fn center_all(bench: &mut Bench, bank: &mut PiezoBank) -> Result<()> {
    for fiber in fibers() {
        bank.set_bias(fiber, HALF_BIAS, HALF_BIAS)?;
        bench.write_dac(bank.dac_left(fiber), HALF_BIAS)?;
        bench.write_dac(bank.dac_right(fiber), HALF_BIAS)?;
    }
    Ok(())
}

/// Condition the piezos before a run: a damped triangle sweep on every
/// cantilever with peaks at HALF, 3·HALF/4, HALF/2 and HALF/4 of full bias,
/// stepping by [`DISCHARGE_STEP`] with `pause` between steps, ending
/// centered at `HALF_BIAS`. This walks the ferroelectric hysteresis loop of
/// the actuators down to a repeatable state.
pub fn discharge_hysteresis(bench: &mut Bench, bank: &mut PiezoBank, pause: Duration) -> Result<()> {
    log::info!("discharging piezo hysteresis");
    let mut level: Vec<(u16, u16)> = fibers().map(|f| bank.bias(f)).collect();

    ramp_all(bench, bank, &mut level, 0, pause)?;
    for peak in [HALF_BIAS, HALF_BIAS / 4 * 3, HALF_BIAS / 2, HALF_BIAS / 4] {
        ramp_all(bench, bank, &mut level, peak, pause)?;
        ramp_all(bench, bank, &mut level, 0, pause)?;
    }
    ramp_all(bench, bank, &mut level, HALF_BIAS, pause)?;

    for fiber in fibers() {
        bank.set_bias(fiber, HALF_BIAS, HALF_BIAS)?;
    }
    Ok(())
}

fn ramp_all(
    bench: &mut Bench,
    bank: &PiezoBank,
    level: &mut [(u16, u16)],
    target: u16,
    pause: Duration,
) -> Result<()> {
    loop {
        let mut moved = false;
        for (i, fiber) in fibers().enumerate() {
            let goal = target.min(bank.max_bias(fiber));
            let (l, r) = level[i];
            let (nl, nr) = (step_toward(l, goal), step_toward(r, goal));
            if nl != l {
                bench.write_dac(bank.dac_left(fiber), nl)?;
            }
            if nr != r {
                bench.write_dac(bank.dac_right(fiber), nr)?;
            }
            moved |= nl != l || nr != r;
            level[i] = (nl, nr);
        }
        if !moved {
            return Ok(());
        }
        if !pause.is_zero() {
            thread::sleep(pause);
        }
    }
}

fn step_toward(value: u16, target: u16) -> u16 {
    if value < target {
        value.saturating_add(DISCHARGE_STEP).min(target)
    } else {
        value.saturating_sub(DISCHARGE_STEP).max(target)
    }
}

/// Sample one fiber's coupling `samples` times and report
/// `(min, max, mean)`.
///
/// Every ADC device is converted on every sample even though a single
/// channel is consumed, so this call has the same per-sample bus timing as
/// the alignment loop's batched reads.
pub fn read_averaged_coupling(
    bench: &mut Bench,
    fiber: Fiber,
    samples: u32,
) -> Result<(u16, u16, u16)> {
    if samples == 0 {
        return Err(Error::OutOfRange("sample count"));
    }
    let total = bench.total_adc_channels();
    if fiber.index() >= total {
        return Err(Error::Unexpected(format!("no ADC channel behind {fiber}")));
    }
    let mut buf = vec![0u16; total];
    let (mut lo, mut hi, mut sum) = (u16::MAX, 0u16, 0u64);
    for _ in 0..samples {
        bench.read_all_channels(&mut buf)?;
        let v = buf[fiber.index()];
        lo = lo.min(v);
        hi = hi.max(v);
        sum += u64::from(v);
    }
    Ok((lo, hi, (sum / u64::from(samples)) as u16))
}

/// One alignment run over a bench.
pub struct AlignmentLoop<'a> {
    bench: &'a mut Bench,
    bank: &'a mut PiezoBank,
    ctx: &'a mut AlignmentContext,
    sink: &'a mut dyn FrameSink,
    cancel: CancelToken,
    owner: Owner,
    params: RunParams,
    timing: Timing,
    continuous: bool,
}

impl<'a> AlignmentLoop<'a> {
    /// Wire up a run. Nothing moves until [`AlignmentLoop::run`].
    pub fn new(
        bench: &'a mut Bench,
        bank: &'a mut PiezoBank,
        ctx: &'a mut AlignmentContext,
        sink: &'a mut dyn FrameSink,
        cancel: CancelToken,
        owner: Owner,
        params: RunParams,
    ) -> Self {
        Self {
            bench,
            bank,
            ctx,
            sink,
            cancel,
            owner,
            params,
            timing: Timing::default(),
            continuous: false,
        }
    }

    /// Override the sleep intervals (simulation and tests).
    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    /// Execute the search until both phases converge or the token fires.
    pub fn run(&mut self) -> Result<Outcome> {
        if self.ctx.input_list.is_empty() && self.ctx.output_list.is_empty() {
            return Err(Error::Invalid("no fibers classified in the mapping".to_string()));
        }
        log::info!(
            "alignment run ({:?}): {} inputs, {} outputs, steps {}..{}, {} samples",
            self.owner,
            self.ctx.input_list.len(),
            self.ctx.output_list.len(),
            self.params.min_step_size,
            self.params.max_step_size,
            self.params.num_samples,
        );
        self.ctx.reset_measurements();
        self.continuous = false;

        center_all(self.bench, self.bank)?;
        self.settle();
        self.prime_baseline()?;
        self.begin_phase(Phase::Input)?;

        self.sink.start(&self.params)?;
        self.emit_frames()?;

        let mut iterations = 0u64;
        let outcome = loop {
            if self.cancel.is_cancelled() {
                break Outcome::Cancelled;
            }
            self.move_all()?;
            self.read_coupling()?;
            self.emit_frames()?;
            if self.cancel.is_cancelled() {
                break Outcome::Cancelled;
            }
            self.decide_all();
            iterations += 1;

            if self.phase_converged() {
                match self.ctx.phase {
                    Phase::Input => {
                        log::info!("input fibers converged after {iterations} iterations");
                        self.begin_phase(Phase::Output)?;
                    }
                    Phase::Output => {
                        log::info!("output fibers converged after {iterations} iterations");
                        match self.owner {
                            Owner::Orchestrator => break Outcome::Completed,
                            Owner::Serial => {
                                // Operator runs hold the optimum and keep
                                // dithering at the narrowest step.
                                self.continuous = true;
                                self.begin_phase(Phase::Input)?;
                            }
                        }
                    }
                }
            }
        };

        self.sink.finish()?;
        log::info!("alignment run {:?} after {iterations} iterations", outcome);
        Ok(outcome)
    }

    /// Switch the loop onto a phase: rebuild the paired lists, re-arm the
    /// motion states, enable the movers.
    fn begin_phase(&mut self, phase: Phase) -> Result<()> {
        self.ctx.phase = phase;
        match phase {
            Phase::Input => {
                self.ctx.move_list.copy_from(&self.ctx.input_list);
                self.ctx.read_list.clear();
                for fiber in self.ctx.input_list.iter() {
                    let read = self.ctx.mapping.read_fiber_for(fiber);
                    self.ctx.read_list.push(read)?;
                }
            }
            Phase::Output => {
                self.ctx.move_list.copy_from(&self.ctx.output_list);
                self.ctx.read_list.copy_from(&self.ctx.output_list);
            }
        }
        for fiber in self.ctx.move_list.iter() {
            self.ctx.motion[fiber.index()].reset(
                self.params.min_step_size,
                self.params.max_step_size,
                self.continuous,
            );
        }
        enable_motion(&self.ctx.move_list, &mut self.ctx.motion);
        log::debug!(
            "phase {:?}: moving {:?}, reading {:?}",
            phase,
            self.ctx.move_list,
            self.ctx.read_list
        );
        Ok(())
    }

    /// Establish the reference couplings on every output fiber.
    fn prime_baseline(&mut self) -> Result<()> {
        let averages = self.averaged_readings()?;
        for fiber in self.ctx.output_list.iter() {
            let idx = fiber.index();
            let v = *averages
                .get(idx)
                .ok_or_else(|| Error::Unexpected(format!("no ADC channel behind {fiber}")))?;
            self.ctx.coupling[idx] = v;
            self.ctx.new_coupling[idx] = v;
        }
        Ok(())
    }

    /// Apply one probe move to every enabled, unconverged fiber and give the
    /// mechanics time to follow.
    fn move_all(&mut self) -> Result<()> {
        let movers = self.ctx.move_list.clone();
        for fiber in movers.iter() {
            let state = &mut self.ctx.motion[fiber.index()];
            if !state.enabled || state.converged() {
                continue;
            }
            let (dl, dr) = kernel::delta_bias_for(state);
            let (old_left, old_right) = self.bank.bias(fiber);
            let out =
                self.bank
                    .increment_bias(fiber, dl, dr, self.params.hysteresis_step_size);
            // Track what was actually applied, which differs from the
            // commanded delta under clamping or backlash compensation.
            state.apply_move(
                i32::from(out.left) - i32::from(old_left),
                i32::from(out.right) - i32::from(old_right),
            );
            if out.clamped {
                log::debug!("{fiber}: clamped at a bias rail during {:?}", state.attempt);
                state.handle_boundary_hit();
            }
            self.bench.write_dac(self.bank.dac_left(fiber), out.left)?;
            self.bench.write_dac(self.bank.dac_right(fiber), out.right)?;
        }
        self.settle();
        Ok(())
    }

    /// Measure every fiber in the read list, averaged over the run's sample
    /// count.
    fn read_coupling(&mut self) -> Result<()> {
        let averages = self.averaged_readings()?;
        let readers = self.ctx.read_list.clone();
        for fiber in readers.iter() {
            let idx = fiber.index();
            let v = *averages
                .get(idx)
                .ok_or_else(|| Error::Unexpected(format!("no ADC channel behind {fiber}")))?;
            self.ctx.new_coupling[idx] = v;
        }
        Ok(())
    }

    /// Convert every ADC channel `num_samples` times and average.
    fn averaged_readings(&mut self) -> Result<Vec<u16>> {
        let total = self.bench.total_adc_channels();
        let mut sums = vec![0u64; total];
        let mut sample = vec![0u16; total];
        for _ in 0..self.params.num_samples {
            self.bench.read_all_channels(&mut sample)?;
            for (acc, &v) in sums.iter_mut().zip(&sample) {
                *acc += u64::from(v);
            }
        }
        Ok(sums
            .into_iter()
            .map(|s| (s / u64::from(self.params.num_samples)) as u16)
            .collect())
    }

    /// Let every moved fiber judge its probe against the reading taken for
    /// it this iteration.
    fn decide_all(&mut self) {
        for i in 0..self.ctx.move_list.len() {
            let (mover, reader) = match (self.ctx.move_list.get(i), self.ctx.read_list.get(i)) {
                (Some(m), Some(r)) => (m, r),
                _ => continue,
            };
            let reading = self.ctx.new_coupling[reader.index()];
            let state = &mut self.ctx.motion[mover.index()];
            if !state.enabled || state.converged() {
                continue;
            }
            if matches!(state.attempt, Attempt::Fail12 | Attempt::Fail22) {
                // Deliberate return to the reference point: re-reference the
                // stored maximum to whatever the landscape reads there now.
                self.ctx.coupling[reader.index()] = reading;
            }
            let new_max = kernel::compare_coupling(&mut self.ctx.coupling[reader.index()], reading);
            let success = kernel::decide(state, new_max);
            state.clear_boundary_flags();
            log::trace!(
                "{mover}: {:?} via {reader} reading {reading} -> {}",
                state.attempt,
                if success { "success" } else { "failure" },
            );
            if success {
                state.handle_success();
            } else {
                state.handle_failure();
            }
        }
    }

    fn phase_converged(&self) -> bool {
        self.ctx
            .move_list
            .iter()
            .all(|f| self.ctx.motion[f.index()].converged())
    }

    fn emit_frames(&mut self) -> Result<()> {
        let coupling = frame::coupling_frame(&self.ctx.read_list, &self.ctx.new_coupling);
        self.sink.emit(&coupling)?;
        let bias = frame::bias_frame(&self.ctx.move_list, self.bank);
        self.sink.emit(&bias)?;
        Ok(())
    }

    fn settle(&self) {
        if !self.timing.settling.is_zero() {
            thread::sleep(self.timing.settling);
        }
    }
}

fn fibers() -> impl Iterator<Item = Fiber> {
    (0..NUM_FIBERS).map(|i| Fiber::new(i).expect("fiber table index"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mams_hal::sim::SimRig;
    use mams_hal::DacChannel;

    fn leaked_token() -> CancelToken {
        CancelToken::new(Box::leak(Box::new(AtomicBool::new(false))))
    }

    fn wired_bank(rig_channels: u8) -> PiezoBank {
        let mut bank = PiezoBank::new();
        for i in 0..NUM_FIBERS {
            let fiber = Fiber::new(i).unwrap();
            let base = (i as u8) * 2 % rig_channels;
            bank.set_dac(
                fiber,
                DacChannel::new(0, base),
                DacChannel::new(0, base + 1),
                crate::MAX_BIAS,
            )
            .unwrap();
        }
        bank
    }

    #[test]
    fn discharge_ends_centered() {
        let rig = SimRig::new(1, NUM_FIBERS, 1, 16);
        let mut bench = rig.bench();
        let mut bank = wired_bank(16);
        bank.set_bias(Fiber::new(0).unwrap(), 100, 60000).unwrap();

        discharge_hysteresis(&mut bench, &mut bank, Duration::ZERO).unwrap();
        for i in 0..NUM_FIBERS {
            let fiber = Fiber::new(i).unwrap();
            assert_eq!(bank.bias(fiber), (HALF_BIAS, HALF_BIAS));
            assert_eq!(rig.dac_value(bank.dac_left(fiber)), HALF_BIAS);
            assert_eq!(rig.dac_value(bank.dac_right(fiber)), HALF_BIAS);
        }
    }

    #[test]
    fn averaged_read_reports_min_max_mean() {
        let rig = SimRig::new(2, 4, 1, 16);
        let mut bench = rig.bench();
        rig.set_surface(
            5,
            mams_hal::sim::Surface { full_scale: 1234, sources: Vec::new() },
        );
        let (lo, hi, mean) =
            read_averaged_coupling(&mut bench, Fiber::new(5).unwrap(), 3).unwrap();
        assert_eq!((lo, hi, mean), (1234, 1234, 1234));
        assert!(read_averaged_coupling(&mut bench, Fiber::new(5).unwrap(), 0).is_err());
    }

    #[test]
    fn cancel_token_round_trip() {
        let token = leaked_token();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        token.clear();
        assert!(!token.is_cancelled());
    }
}
