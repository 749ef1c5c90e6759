//! Serial request channel (main thread).
//!
//! The operator console gets the full vocabulary. `READ`, `WRITE` and
//! `START` take the arbiter for their duration so a run owned by the other
//! channel answers `BUSY` instead of interleaving bus traffic with the
//! owner's move/read cycle.

use crate::request::{Request, IDENTIFIER};
use crate::serial::SerialPort;
use crate::signals::{self, Wakeup};
use crate::station::Station;
use mams_core::align::{self, AlignmentLoop, Outcome};
use mams_core::arbiter::Owner;
use mams_core::context::RunParams;
use mams_core::frame::FrameSink;
use mams_core::{Error, Result, DISCHARGE_PAUSE};

/// Serve the operator until the exit flag is raised or the line dies.
/// `Ok` is the flag-driven shutdown; `Err` is a dead console.
pub fn run(station: &Station, port: &mut SerialPort, wakeup: &Wakeup) -> Result<()> {
    log::info!("operator channel ready");
    let outcome = loop {
        if signals::exit_requested() {
            break Ok(());
        }
        let line = match port.read_line(wakeup) {
            Ok(Some(line)) => line,
            Ok(None) => continue,
            Err(e) => break Err(e),
        };
        if line.is_empty() {
            continue;
        }
        if let Err(e) = handle_line(station, port, wakeup, &line) {
            break Err(e);
        }
    };
    log::info!("operator channel closed");
    outcome
}

/// Dispatch one request line. Only unrecoverable serial I/O errors
/// propagate; protocol-level problems answer `ERR` and keep the channel
/// alive.
fn handle_line(
    station: &Station,
    port: &mut SerialPort,
    wakeup: &Wakeup,
    line: &str,
) -> Result<()> {
    let request = match Request::parse(line) {
        Ok(request) => request,
        Err(e) => {
            log::debug!("rejected request `{line}`: {e}");
            return port.write_all(b"ERR\n");
        }
    };
    match request {
        Request::Idn => port.write_all(format!("{IDENTIFIER}\n").as_bytes()),
        Request::Read { fiber, samples } => {
            let Some(_own) = station.arbiter.lock(Owner::Serial) else {
                return port.write_all(b"BUSY\n");
            };
            let mut shared = station.shared.lock().unwrap();
            match align::read_averaged_coupling(&mut shared.bench, fiber, samples) {
                Ok((lo, hi, mean)) => port.write_all(format!("{lo} {hi} {mean}\n").as_bytes()),
                Err(e) => {
                    log::warn!("READ {fiber}: {e}");
                    port.write_all(b"ERR\n")
                }
            }
        }
        Request::Write { fiber, left, right } => {
            let Some(_own) = station.arbiter.lock(Owner::Serial) else {
                return port.write_all(b"BUSY\n");
            };
            let mut shared = station.shared.lock().unwrap();
            let shared = &mut *shared;
            let outcome = (|| -> Result<()> {
                shared.bank.set_bias(fiber, left, right)?;
                shared.bench.write_dac(shared.bank.dac_left(fiber), left)?;
                shared.bench.write_dac(shared.bank.dac_right(fiber), right)?;
                Ok(())
            })();
            match outcome {
                Ok(()) => port.write_all(b"OK\n"),
                Err(e) => {
                    log::warn!("WRITE {fiber}: {e}");
                    port.write_all(b"ERR\n")
                }
            }
        }
        Request::Start { params } => start_run(station, port, wakeup, params),
    }
}

fn start_run(
    station: &Station,
    port: &mut SerialPort,
    wakeup: &Wakeup,
    params: RunParams,
) -> Result<()> {
    let Some(_own) = station.arbiter.lock(Owner::Serial) else {
        return port.write_all(b"BUSY\n");
    };
    if signals::exit_requested() {
        return Ok(());
    }
    station.align_cancel.clear();

    let mut shared = station.shared.lock().unwrap();
    let shared = &mut *shared;
    shared.bench.show(0, "ALIGNING");
    shared.bench.set_status(true);

    if params.hysteresis_step_size > 0 {
        if let Err(e) =
            align::discharge_hysteresis(&mut shared.bench, &mut shared.bank, DISCHARGE_PAUSE)
        {
            log::error!("hysteresis discharge failed: {e}");
            shared.bench.show(0, "IDLE");
            shared.bench.set_status(false);
            return port.write_all(b"ERR\n");
        }
    }
    port.write_all(b"STARTING\n")?;

    let result = {
        let mut sink = SerialSink { port: &mut *port, wakeup };
        AlignmentLoop::new(
            &mut shared.bench,
            &mut shared.bank,
            &mut shared.ctx,
            &mut sink,
            station.align_cancel,
            Owner::Serial,
            params,
        )
        .run()
    };
    shared.bench.show(0, "IDLE");
    shared.bench.set_status(false);
    match result {
        Ok(Outcome::Completed) => log::info!("operator run completed"),
        Ok(Outcome::Cancelled) => log::info!("operator run cancelled"),
        Err(Error::Interrupted) => log::info!("operator run interrupted"),
        Err(e) => {
            // Abort the run, keep the channel; the biases stay wherever the
            // search left them.
            station.align_cancel.cancel();
            log::error!("operator run aborted: {e}");
        }
    }
    port.write_all(b"STOPPED\n")
}

/// Streams frames over the serial line, one acknowledgment per frame.
struct SerialSink<'a> {
    port: &'a mut SerialPort,
    wakeup: &'a Wakeup,
}

impl FrameSink for SerialSink<'_> {
    fn start(&mut self, _params: &RunParams) -> Result<()> {
        Ok(())
    }

    fn emit(&mut self, frame: &str) -> Result<()> {
        self.port.write_all(frame.as_bytes())?;
        self.port.wait_ack(self.wakeup)
    }

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}
