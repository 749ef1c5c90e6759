//! Hardware capability traits for the MAMS alignment bench.
//!
//! The alignment core never talks to a chip directly. Register-level drivers
//! for the ADC, DAC, display and GPIO expanders live outside this repository
//! and plug in through the narrow traits defined here; the core consumes them
//! through a [`Bench`], which bundles one box per capability.
//!
//! Keeping the traits this small has two payoffs: a driver for a new chip
//! family only has to implement one or two methods, and the whole alignment
//! engine can be exercised against the in-process simulator in [`sim`], which
//! implements the same traits over a synthetic coupling landscape.

pub mod sim;

use std::fmt;

/// Errors surfaced by bench devices.
///
/// Drivers are expected to fold transport-level failures (SPI transfer
/// errors, bus contention) into [`Error::Bus`]; addressing mistakes are
/// programming errors on the caller's side and get their own variants so they
/// are distinguishable in logs.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No DAC device with this number is installed on the bench.
    #[error("no DAC device {0}")]
    NoSuchDacDevice(u8),
    /// The device exists but does not expose the requested channel.
    #[error("no channel {channel} on DAC device {device}")]
    NoSuchDacChannel {
        /// Device number as wired on the bench.
        device: u8,
        /// Channel within that device.
        channel: u8,
    },
    /// The underlying bus transfer failed.
    #[error("bus transfer failed: {0}")]
    Bus(String),
}

/// Result type used by all bench devices.
pub type Result<T> = std::result::Result<T, Error>;

/// Address of one DAC output: a device number on the SPI bus plus the channel
/// within that device.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DacChannel {
    /// Device number as wired on the bench.
    pub device: u8,
    /// Channel within the device.
    pub channel: u8,
}

impl DacChannel {
    /// Create a channel address.
    pub fn new(device: u8, channel: u8) -> Self {
        Self { device, channel }
    }
}

impl fmt::Display for DacChannel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "dac{}.{}", self.device, self.channel)
    }
}

/// One analog-to-digital converter device.
///
/// A conversion covers the first `n` channels of the device in wiring order.
/// The call blocks until the conversion completes.
pub trait Adc {
    /// Number of input channels this device exposes.
    fn channels(&self) -> usize;

    /// Run one conversion of the first `n` channels, writing `n` samples
    /// into `out`.
    fn read_first_n_channels(&mut self, n: usize, out: &mut [u16]) -> Result<()>;
}

/// One digital-to-analog converter device.
pub trait Dac {
    /// Number of output channels this device exposes.
    fn channels(&self) -> usize;

    /// Blocking write of one 16-bit value to one channel.
    fn write(&mut self, channel: u8, value: u16) -> Result<()>;
}

/// Character display used for operator feedback. Updates are idempotent.
pub trait Display {
    /// Replace row `row` with `text`, centered.
    fn write_line_center(&mut self, row: usize, text: &str) -> Result<()>;
}

/// A single general-purpose output line.
pub trait Gpio {
    /// Drive the line high (`true`) or low (`false`).
    fn set(&mut self, level: bool) -> Result<()>;
}

/// The full set of devices the alignment core drives.
///
/// ADC devices are ordered; the global input channel `c` lives on device
/// `adcs[d]` where `d` is found by walking the per-device channel counts in
/// order. The same fiber numbering is used by the core's registry.
pub struct Bench {
    /// ADC devices in bus order.
    pub adcs: Vec<Box<dyn Adc + Send>>,
    /// DAC devices in bus order.
    pub dacs: Vec<Box<dyn Dac + Send>>,
    /// Operator display.
    pub display: Box<dyn Display + Send>,
    /// Status line, asserted while a search owns the bench.
    pub status_led: Box<dyn Gpio + Send>,
}

impl Bench {
    /// Total number of ADC input channels across all devices.
    pub fn total_adc_channels(&self) -> usize {
        self.adcs.iter().map(|a| a.channels()).sum()
    }

    /// Run one conversion on every ADC device, concatenating the samples in
    /// device order. Returns the number of samples written.
    ///
    /// Every device is converted even when the caller only consumes one
    /// channel, so that the per-sample bus timing does not depend on which
    /// fibers are being read.
    pub fn read_all_channels(&mut self, out: &mut [u16]) -> Result<usize> {
        let mut offset = 0;
        for adc in &mut self.adcs {
            let n = adc.channels();
            adc.read_first_n_channels(n, &mut out[offset..offset + n])?;
            offset += n;
        }
        Ok(offset)
    }

    /// Write one bias value to one DAC channel.
    pub fn write_dac(&mut self, channel: DacChannel, value: u16) -> Result<()> {
        let dac = self
            .dacs
            .get_mut(channel.device as usize)
            .ok_or(Error::NoSuchDacDevice(channel.device))?;
        if channel.channel as usize >= dac.channels() {
            return Err(Error::NoSuchDacChannel {
                device: channel.device,
                channel: channel.channel,
            });
        }
        dac.write(channel.channel, value)
    }

    /// Best-effort display update. Display failures never disturb a search;
    /// they are logged and dropped.
    pub fn show(&mut self, row: usize, text: &str) {
        if let Err(e) = self.display.write_line_center(row, text) {
            log::warn!("display update failed: {e}");
        }
    }

    /// Best-effort status line update.
    pub fn set_status(&mut self, level: bool) {
        if let Err(e) = self.status_led.set(level) {
            log::warn!("status line update failed: {e}");
        }
    }
}
