//! End-to-end scenarios for the alignment engine, driven against the
//! simulated bench.

use mams_core::align::{
    center_all, AlignmentLoop, CancelToken, Outcome, Timing,
};
use mams_core::arbiter::{Arbiter, Owner};
use mams_core::context::{AlignmentContext, RunParams};
use mams_core::frame::FrameSink;
use mams_core::mapping::Mapping;
use mams_core::piezo::PiezoBank;
use mams_core::{Fiber, HALF_BIAS, MAX_BIAS, NUM_FIBERS};
use mams_hal::sim::{SimRig, Surface, SurfaceSource};
use mams_hal::{Bench, DacChannel};
use std::sync::atomic::AtomicBool;
use std::time::Duration;

/// Sink that records every frame; optionally cancels the run after a number
/// of emissions so operator-style endless runs terminate.
#[derive(Default)]
struct RecordingSink {
    frames: Vec<String>,
    cancel_after: Option<(usize, CancelToken)>,
}

impl FrameSink for RecordingSink {
    fn start(&mut self, _params: &RunParams) -> mams_core::Result<()> {
        Ok(())
    }

    fn emit(&mut self, frame: &str) -> mams_core::Result<()> {
        self.frames.push(frame.to_string());
        if let Some((limit, token)) = &self.cancel_after {
            if self.frames.len() >= *limit {
                token.cancel();
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> mams_core::Result<()> {
        Ok(())
    }
}

fn token() -> CancelToken {
    CancelToken::new(Box::leak(Box::new(AtomicBool::new(false))))
}

fn zero_timing() -> Timing {
    Timing { settling: Duration::ZERO, discharge_pause: Duration::ZERO }
}

/// A rig with one 8-channel ADC and one 16-channel DAC, wired so fiber `i`
/// is driven by DAC channels `2i`/`2i+1` and read on ADC channel `i`.
fn rig_and_bank() -> (SimRig, Bench, PiezoBank) {
    let rig = SimRig::new(1, NUM_FIBERS, 1, 2 * NUM_FIBERS);
    let bench = rig.bench();
    let mut bank = PiezoBank::new();
    for i in 0..NUM_FIBERS {
        bank.set_dac(
            Fiber::new(i).unwrap(),
            DacChannel::new(0, 2 * i as u8),
            DacChannel::new(0, 2 * i as u8 + 1),
            MAX_BIAS,
        )
        .unwrap();
    }
    (rig, bench, bank)
}

fn pair_surface(bank: &PiezoBank, fiber: Fiber, peaks: (u16, u16)) -> SurfaceSource {
    SurfaceSource {
        left: bank.dac_left(fiber),
        right: bank.dac_right(fiber),
        left_peak: peaks.0,
        right_peak: peaks.1,
    }
}

#[test]
fn centering_overrides_any_previous_bias() {
    let (rig, mut bench, mut bank) = rig_and_bank();
    let f0 = Fiber::new(0).unwrap();
    let f1 = Fiber::new(1).unwrap();
    bank.set_bias(f0, 0, 0).unwrap();
    bank.set_bias(f1, MAX_BIAS, MAX_BIAS).unwrap();

    center_all(&mut bench, &mut bank).unwrap();

    for fiber in [f0, f1] {
        assert_eq!(bank.bias(fiber), (HALF_BIAS, HALF_BIAS));
        assert_eq!(rig.dac_value(bank.dac_left(fiber)), HALF_BIAS);
        assert_eq!(rig.dac_value(bank.dac_right(fiber)), HALF_BIAS);
    }
}

#[test]
fn single_fiber_ascent_converges_to_the_peak() {
    let (rig, mut bench, mut bank) = rig_and_bank();
    let f0 = Fiber::new(0).unwrap();
    let f1 = Fiber::new(1).unwrap();

    // Fiber 0 feeds fiber 1; the landscape peaks at bias (1000, HALF).
    let mut mapping = Mapping::empty();
    mapping.set_input(f0, f1);
    rig.set_surface(
        1,
        Surface {
            full_scale: u16::MAX,
            sources: vec![pair_surface(&bank, f0, (1000, HALF_BIAS))],
        },
    );

    let mut ctx = AlignmentContext::new(mapping);
    let params = RunParams {
        num_samples: 1,
        min_step_size: 4,
        max_step_size: 1024,
        hysteresis_step_size: 0,
    };
    let mut sink = RecordingSink::default();
    let outcome = AlignmentLoop::new(
        &mut bench,
        &mut bank,
        &mut ctx,
        &mut sink,
        token(),
        Owner::Orchestrator,
        params,
    )
    .with_timing(zero_timing())
    .run()
    .unwrap();

    assert_eq!(outcome, Outcome::Completed);
    let (left, right) = bank.bias(f0);
    assert!(
        left.abs_diff(1000) < 4,
        "left bias {left} did not converge to the peak"
    );
    assert!(
        right.abs_diff(HALF_BIAS) < 1024,
        "right bias {right} wandered off"
    );
    // Two frames per iteration plus the initial pair.
    let iterations = sink.frames.len() / 2 - 1;
    assert!(iterations <= 80, "took {iterations} iterations");
    // The DACs hold what the registry says.
    assert_eq!(rig.dac_value(bank.dac_left(f0)), left);
}

#[test]
fn two_phase_alignment_steers_input_then_output() {
    let (rig, mut bench, mut bank) = rig_and_bank();
    let f0 = Fiber::new(0).unwrap();
    let f1 = Fiber::new(1).unwrap();

    let mut mapping = Mapping::empty();
    mapping.set_input(f0, f1);
    mapping.set_output(f1);

    // Coupling at fiber 1 depends on both pairs: the launch side and the
    // pickup side each sit ~3000 LSB off center.
    let input_peak = (HALF_BIAS - 3000, HALF_BIAS + 2000);
    let output_peak = (HALF_BIAS + 2500, HALF_BIAS - 1500);
    rig.set_surface(
        1,
        Surface {
            full_scale: u16::MAX,
            sources: vec![
                pair_surface(&bank, f0, input_peak),
                pair_surface(&bank, f1, output_peak),
            ],
        },
    );

    let mut ctx = AlignmentContext::new(mapping);
    let params = RunParams {
        num_samples: 2,
        min_step_size: 4,
        max_step_size: 1024,
        hysteresis_step_size: 0,
    };
    let mut sink = RecordingSink::default();
    let outcome = AlignmentLoop::new(
        &mut bench,
        &mut bank,
        &mut ctx,
        &mut sink,
        token(),
        Owner::Orchestrator,
        params,
    )
    .with_timing(zero_timing())
    .run()
    .unwrap();

    assert_eq!(outcome, Outcome::Completed);
    let (l0, r0) = bank.bias(f0);
    let (l1, r1) = bank.bias(f1);
    assert!(l0.abs_diff(input_peak.0) < 8, "input left at {l0}");
    assert!(r0.abs_diff(input_peak.1) < 8, "input right at {r0}");
    assert!(l1.abs_diff(output_peak.0) < 8, "output left at {l1}");
    assert!(r1.abs_diff(output_peak.1) < 8, "output right at {r1}");
}

#[test]
fn operator_runs_keep_dithering_until_cancelled() {
    let (rig, mut bench, mut bank) = rig_and_bank();
    let f0 = Fiber::new(0).unwrap();
    let f1 = Fiber::new(1).unwrap();

    let mut mapping = Mapping::empty();
    mapping.set_input(f0, f1);
    mapping.set_output(f1);
    rig.set_surface(
        1,
        Surface {
            full_scale: u16::MAX,
            sources: vec![
                pair_surface(&bank, f0, (HALF_BIAS - 500, HALF_BIAS)),
                pair_surface(&bank, f1, (HALF_BIAS, HALF_BIAS + 400)),
            ],
        },
    );

    let cancel = token();
    let mut ctx = AlignmentContext::new(mapping);
    let params = RunParams {
        num_samples: 1,
        min_step_size: 4,
        max_step_size: 256,
        hysteresis_step_size: 0,
    };
    let mut sink = RecordingSink { frames: Vec::new(), cancel_after: Some((600, cancel)) };
    let outcome = AlignmentLoop::new(
        &mut bench,
        &mut bank,
        &mut ctx,
        &mut sink,
        cancel,
        Owner::Serial,
        params,
    )
    .with_timing(zero_timing())
    .run()
    .unwrap();

    // A serial-owned run never completes on its own.
    assert_eq!(outcome, Outcome::Cancelled);
    assert!(sink.frames.len() >= 600);
    // It still found and held the optimum while dithering; the cancel can
    // land mid-probe, so allow a few minimum steps of slack.
    let (l0, _) = bank.bias(f0);
    assert!(l0.abs_diff(HALF_BIAS - 500) <= 16, "input left at {l0}");
}

#[test]
fn run_without_mapped_fibers_is_rejected() {
    let (_rig, mut bench, mut bank) = rig_and_bank();
    let mut ctx = AlignmentContext::new(Mapping::empty());
    let params = RunParams {
        num_samples: 1,
        min_step_size: 4,
        max_step_size: 64,
        hysteresis_step_size: 0,
    };
    let mut sink = RecordingSink::default();
    let err = AlignmentLoop::new(
        &mut bench,
        &mut bank,
        &mut ctx,
        &mut sink,
        token(),
        Owner::Orchestrator,
        params,
    )
    .with_timing(zero_timing())
    .run()
    .unwrap_err();
    assert!(matches!(err, mams_core::Error::Invalid(_)));
}

#[test]
fn arbiter_contention_has_exactly_one_winner() {
    use std::sync::Arc;

    let arbiter = Arc::new(Arbiter::new());
    let a = arbiter.clone();
    let b = arbiter.clone();
    let serial = std::thread::spawn(move || a.start_serial());
    let orch = std::thread::spawn(move || b.start_orchestrator());
    let serial_won = serial.join().unwrap();
    let orch_won = orch.join().unwrap();

    assert!(serial_won ^ orch_won, "exactly one channel must win");
    assert!(arbiter.stop());

    // Once the winner stops, the loser can acquire.
    if serial_won {
        assert!(arbiter.start_orchestrator());
    } else {
        assert!(arbiter.start_serial());
    }
    assert!(arbiter.stop());
}
