//! Simulated bench.
//!
//! Implements every capability trait over an in-memory model: DAC writes land
//! in a shared table, and each ADC channel reads a synthetic coupling surface
//! evaluated against the current DAC values. The surface is a V-shaped
//! landscape per channel, full scale at the peak and falling off linearly
//! with the bias distance of each contributing piezo pair; it is
//! single-modal like the real coupling landscape and cheap to reason about
//! in tests.

use crate::{Adc, Bench, Dac, DacChannel, Display, Gpio, Result};
use std::sync::{Arc, Mutex};

/// One piezo pair contributing to a coupling surface.
#[derive(Debug, Clone)]
pub struct SurfaceSource {
    /// DAC channel deflecting the fiber along the first axis.
    pub left: DacChannel,
    /// DAC channel deflecting the fiber along the second axis.
    pub right: DacChannel,
    /// Bias on `left` at which this source contributes no loss.
    pub left_peak: u16,
    /// Bias on `right` at which this source contributes no loss.
    pub right_peak: u16,
}

/// Synthetic coupling landscape behind one ADC channel.
///
/// The reading is `full_scale` minus the summed bias distance of every
/// source, saturating at zero. A channel with no sources reads a constant.
#[derive(Debug, Clone, Default)]
pub struct Surface {
    /// Reading when every source sits exactly on its peak.
    pub full_scale: u16,
    /// Piezo pairs whose position shapes this channel.
    pub sources: Vec<SurfaceSource>,
}

impl Surface {
    fn reading(&self, dac: &[Vec<u16>]) -> u16 {
        let mut loss: u32 = 0;
        for src in &self.sources {
            let l = dac[src.left.device as usize][src.left.channel as usize];
            let r = dac[src.right.device as usize][src.right.channel as usize];
            loss += u32::from(l.abs_diff(src.left_peak));
            loss += u32::from(r.abs_diff(src.right_peak));
        }
        u32::from(self.full_scale).saturating_sub(loss) as u16
    }
}

struct SimState {
    adc_channels: Vec<usize>,
    dac: Vec<Vec<u16>>,
    surfaces: Vec<Surface>,
    display: Vec<String>,
    led: bool,
}

/// Handle to a simulated bench. Cloning the handle or building a [`Bench`]
/// shares the same underlying state, so tests can poke DAC values and read
/// back what the core wrote.
#[derive(Clone)]
pub struct SimRig {
    state: Arc<Mutex<SimState>>,
}

impl SimRig {
    /// Build a rig with `adc_devices` ADCs of `adc_channels` inputs each and
    /// `dac_devices` DACs of `dac_channels` outputs each. All DAC outputs
    /// start at zero and all surfaces read zero until configured.
    pub fn new(
        adc_devices: usize,
        adc_channels: usize,
        dac_devices: usize,
        dac_channels: usize,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                adc_channels: vec![adc_channels; adc_devices],
                dac: vec![vec![0; dac_channels]; dac_devices],
                surfaces: vec![Surface::default(); adc_devices * adc_channels],
                display: Vec::new(),
                led: false,
            })),
        }
    }

    /// Install the landscape behind one global ADC channel.
    pub fn set_surface(&self, channel: usize, surface: Surface) {
        self.state.lock().unwrap().surfaces[channel] = surface;
    }

    /// Current value of one DAC output.
    pub fn dac_value(&self, channel: DacChannel) -> u16 {
        self.state.lock().unwrap().dac[channel.device as usize][channel.channel as usize]
    }

    /// Overwrite one DAC output behind the core's back (drift injection).
    pub fn set_dac_value(&self, channel: DacChannel, value: u16) {
        self.state.lock().unwrap().dac[channel.device as usize][channel.channel as usize] = value;
    }

    /// Most recent text written to a display row, if any.
    pub fn display_line(&self, row: usize) -> Option<String> {
        self.state.lock().unwrap().display.get(row).cloned()
    }

    /// Current status line level.
    pub fn led(&self) -> bool {
        self.state.lock().unwrap().led
    }

    /// Assemble a [`Bench`] whose devices all share this rig's state.
    pub fn bench(&self) -> Bench {
        let state = self.state.lock().unwrap();
        let adcs = (0..state.adc_channels.len())
            .map(|device| {
                Box::new(SimAdc { device, state: self.state.clone() }) as Box<dyn Adc + Send>
            })
            .collect();
        let dacs = (0..state.dac.len())
            .map(|device| {
                Box::new(SimDac { device, state: self.state.clone() }) as Box<dyn Dac + Send>
            })
            .collect();
        Bench {
            adcs,
            dacs,
            display: Box::new(SimDisplay { state: self.state.clone() }),
            status_led: Box::new(SimGpio { state: self.state.clone() }),
        }
    }
}

struct SimAdc {
    device: usize,
    state: Arc<Mutex<SimState>>,
}

impl Adc for SimAdc {
    fn channels(&self) -> usize {
        self.state.lock().unwrap().adc_channels[self.device]
    }

    fn read_first_n_channels(&mut self, n: usize, out: &mut [u16]) -> Result<()> {
        let state = self.state.lock().unwrap();
        let base: usize = state.adc_channels[..self.device].iter().sum();
        for (i, slot) in out.iter_mut().enumerate().take(n) {
            *slot = state.surfaces[base + i].reading(&state.dac);
        }
        Ok(())
    }
}

struct SimDac {
    device: usize,
    state: Arc<Mutex<SimState>>,
}

impl Dac for SimDac {
    fn channels(&self) -> usize {
        self.state.lock().unwrap().dac[self.device].len()
    }

    fn write(&mut self, channel: u8, value: u16) -> Result<()> {
        self.state.lock().unwrap().dac[self.device][channel as usize] = value;
        Ok(())
    }
}

struct SimDisplay {
    state: Arc<Mutex<SimState>>,
}

impl Display for SimDisplay {
    fn write_line_center(&mut self, row: usize, text: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.display.len() <= row {
            state.display.resize(row + 1, String::new());
        }
        state.display[row] = text.to_string();
        Ok(())
    }
}

struct SimGpio {
    state: Arc<Mutex<SimState>>,
}

impl Gpio for SimGpio {
    fn set(&mut self, level: bool) -> Result<()> {
        self.state.lock().unwrap().led = level;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn surface_tracks_dac_moves() {
        let rig = SimRig::new(1, 2, 1, 4);
        rig.set_surface(
            1,
            Surface {
                full_scale: 50_000,
                sources: vec![SurfaceSource {
                    left: DacChannel::new(0, 0),
                    right: DacChannel::new(0, 1),
                    left_peak: 1_000,
                    right_peak: 2_000,
                }],
            },
        );
        let mut bench = rig.bench();

        bench.write_dac(DacChannel::new(0, 0), 1_000).unwrap();
        bench.write_dac(DacChannel::new(0, 1), 2_000).unwrap();
        let mut out = [0u16; 2];
        assert_eq!(bench.read_all_channels(&mut out).unwrap(), 2);
        // Channel 0 has no surface, channel 1 sits on its peak.
        assert_eq!(out, [0, 50_000]);

        bench.write_dac(DacChannel::new(0, 0), 1_500).unwrap();
        bench.read_all_channels(&mut out).unwrap();
        assert_eq!(out[1], 49_500);
    }

    #[test]
    fn surface_saturates_at_zero() {
        let rig = SimRig::new(1, 1, 1, 2);
        rig.set_surface(
            0,
            Surface {
                full_scale: 10,
                sources: vec![SurfaceSource {
                    left: DacChannel::new(0, 0),
                    right: DacChannel::new(0, 1),
                    left_peak: 0,
                    right_peak: 0,
                }],
            },
        );
        let mut bench = rig.bench();
        bench.write_dac(DacChannel::new(0, 0), 60_000).unwrap();
        let mut out = [0u16; 1];
        bench.read_all_channels(&mut out).unwrap();
        assert_eq!(out[0], 0);
    }

    #[test]
    fn display_and_led_are_recorded() {
        let rig = SimRig::new(1, 1, 1, 1);
        let mut bench = rig.bench();
        bench.show(0, "IDLE");
        bench.set_status(true);
        assert_eq!(rig.display_line(0).as_deref(), Some("IDLE"));
        assert!(rig.led());
    }
}
