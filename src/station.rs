//! Process-wide wiring of the bench, the registry and the arbiter.

use crate::signals;
use mams_core::align::CancelToken;
use mams_core::arbiter::Arbiter;
use mams_core::context::AlignmentContext;
use mams_core::mapping::Mapping;
use mams_core::piezo::PiezoBank;
use mams_core::{Fiber, Result, HALF_BIAS, MAX_BIAS, NUM_FIBERS};
use mams_hal::sim::{SimRig, Surface, SurfaceSource};
use mams_hal::{Bench, DacChannel};
use std::path::Path;
use std::sync::Mutex;

/// Everything a channel needs to own before touching hardware. Guarded by
/// the arbiter; the mutex is only ever taken by the arbiter holder, so it
/// is uncontended by construction.
pub struct Shared {
    /// The hardware devices.
    pub bench: Bench,
    /// Piezo bias registry.
    pub bank: PiezoBank,
    /// Alignment context.
    pub ctx: AlignmentContext,
}

/// The one instance shared by both channel threads.
pub struct Station {
    /// Owner lock between the two channels.
    pub arbiter: Arbiter,
    /// Bench, registry and context, mutated only by the arbiter owner.
    pub shared: Mutex<Shared>,
    /// Cancellation token of the alignment loop, backed by the global
    /// exit flag so the signal handler reaches it directly.
    pub align_cancel: CancelToken,
}

impl Station {
    /// Assemble the station around a bench and its fiber mapping.
    pub fn new(bench: Bench, bank: PiezoBank, mapping: Mapping) -> Station {
        Station {
            arbiter: Arbiter::new(),
            shared: Mutex::new(Shared { bench, bank, ctx: AlignmentContext::new(mapping) }),
            align_cancel: CancelToken::new(&signals::EXIT_ALIGNMENT),
        }
    }

    /// Best-effort operator feedback on the display and status line.
    pub fn show_state(&self, text: &str, busy: bool) {
        let mut shared = self.shared.lock().unwrap();
        shared.bench.show(0, text);
        shared.bench.set_status(busy);
    }
}

/// Load the fiber mapping from `path` when present, else the as-built
/// default.
pub fn load_mapping(path: &Path) -> Result<Mapping> {
    if path.exists() {
        log::info!("loading fiber mapping from {}", path.display());
        Mapping::load(path)
    } else {
        log::info!("using the built-in fiber mapping");
        Ok(Mapping::default())
    }
}

/// Registry wired the way the bench is built: fiber `i` is driven by DAC
/// device `i / 4`, channels `2·(i % 4)` and `2·(i % 4) + 1`.
pub fn default_bank() -> Result<PiezoBank> {
    let mut bank = PiezoBank::new();
    for i in 0..NUM_FIBERS {
        let device = (i / 4) as u8;
        let base = 2 * (i % 4) as u8;
        bank.set_dac(
            Fiber::new(i)?,
            DacChannel::new(device, base),
            DacChannel::new(device, base + 1),
            MAX_BIAS,
        )?;
    }
    Ok(bank)
}

/// Simulated bench with the as-built geometry: two 4-channel ADCs and two
/// 8-channel DACs. Register-level chip drivers replace this by handing
/// [`Station::new`] their own `Bench`.
///
/// Each output fiber gets a coupling surface shaped by its own pair and its
/// mapped input pair, with peaks scattered around center so a search has
/// real work to do.
pub fn sim_bench(bank: &PiezoBank, mapping: &Mapping) -> Bench {
    let rig = SimRig::new(2, 4, 2, 8);
    for output in mapping.output_list().iter() {
        let mut sources = vec![SurfaceSource {
            left: bank.dac_left(output),
            right: bank.dac_right(output),
            left_peak: offset_peak(output, 0),
            right_peak: offset_peak(output, 1),
        }];
        for input in mapping.input_list().iter() {
            if mapping.read_fiber_for(input) == output {
                sources.push(SurfaceSource {
                    left: bank.dac_left(input),
                    right: bank.dac_right(input),
                    left_peak: offset_peak(input, 2),
                    right_peak: offset_peak(input, 3),
                });
            }
        }
        rig.set_surface(output.index(), Surface { full_scale: u16::MAX, sources });
    }
    rig.bench()
}

/// Deterministic peak placement a few thousand LSB off center.
fn offset_peak(fiber: Fiber, axis: usize) -> u16 {
    let spread = ((fiber.index() * 5 + axis * 3) % 11) as i32 - 5;
    (i32::from(HALF_BIAS) + spread * 700) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_bank_wiring() {
        let bank = default_bank().unwrap();
        let f0 = Fiber::new(0).unwrap();
        let f7 = Fiber::new(7).unwrap();
        assert_eq!(bank.dac_left(f0), DacChannel::new(0, 0));
        assert_eq!(bank.dac_right(f0), DacChannel::new(0, 1));
        assert_eq!(bank.dac_left(f7), DacChannel::new(1, 6));
        assert_eq!(bank.dac_right(f7), DacChannel::new(1, 7));
    }

    #[test]
    fn sim_bench_has_light_on_centered_outputs() {
        let bank = default_bank().unwrap();
        let mapping = Mapping::default();
        let mut bench = sim_bench(&bank, &mapping);
        for i in 0..NUM_FIBERS {
            let fiber = Fiber::new(i).unwrap();
            bench.write_dac(bank.dac_left(fiber), HALF_BIAS).unwrap();
            bench.write_dac(bank.dac_right(fiber), HALF_BIAS).unwrap();
        }
        let mut out = [0u16; NUM_FIBERS];
        bench.read_all_channels(&mut out).unwrap();
        for output in mapping.output_list().iter() {
            // Peaks sit within a few thousand LSB of center, so a centered
            // bench is already coupling light.
            assert!(out[output.index()] > 0, "output {output} reads dark");
        }
    }
}
