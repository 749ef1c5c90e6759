//! The `mams` controller binary.
//!
//! Startup wires the pieces together in a fixed order: real-time
//! scheduling, signal handling, the orchestrator pipes, the station
//! (bench, registry and context behind the arbiter), then the orchestrator
//! thread. The operator serial loop takes over the main thread until a
//! signal or a dead console ends the process.

pub mod fifo;
pub mod operator;
pub mod orchestrator;
pub mod realtime;
pub mod request;
pub mod serial;
pub mod signals;
pub mod station;

use crate::serial::SerialPort;
use crate::station::Station;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Optional on-disk fiber mapping; the built-in table is used when absent.
pub const MAPPING_FILE: &str = "artifacts/mapping.cfg";

/// Command line of the `mams` binary.
#[derive(Parser)]
#[command(name = "mams", about = "Multichannel fiber alignment controller")]
pub struct Cli {
    /// Print the version and exit.
    #[arg(short = 'v', long = "version")]
    pub version: bool,

    /// Serial device of the operator console.
    pub device: Option<PathBuf>,
}

/// Run the controller; returns the process exit code.
pub fn run(cli: Cli) -> i32 {
    if cli.version {
        println!("mams {}", env!("CARGO_PKG_VERSION"));
        return 0;
    }
    env_logger::init();
    let Some(device) = cli.device else {
        log::error!("missing serial device argument");
        return mams_core::Error::Invalid("missing serial device".to_string()).exit_code();
    };

    if let Err(e) = realtime::elevate() {
        log::warn!("running without real-time scheduling: {e}");
    }
    let wakeup = match signals::install() {
        Ok(wakeup) => wakeup,
        Err(e) => {
            log::error!("{e}");
            return e.exit_code();
        }
    };
    for path in [fifo::FIFO_IN, fifo::FIFO_OUT] {
        if let Err(e) = fifo::ensure_fifo(Path::new(path)) {
            log::error!("{e}");
            return e.exit_code();
        }
    }

    let mapping = match station::load_mapping(Path::new(MAPPING_FILE)) {
        Ok(mapping) => mapping,
        Err(e) => {
            log::error!("{e}");
            return e.exit_code();
        }
    };
    let bank = match station::default_bank() {
        Ok(bank) => bank,
        Err(e) => {
            log::error!("{e}");
            return e.exit_code();
        }
    };
    // Register-level chip drivers live outside this repository; until they
    // are wired in, the simulated bench keeps every surface exercisable.
    let bench = station::sim_bench(&bank, &mapping);
    let station = Arc::new(Station::new(bench, bank, mapping));
    station.show_state("IDLE", false);

    let orchestrator_thread = {
        let station = station.clone();
        match std::thread::Builder::new()
            .name("orchestrator".to_string())
            .spawn(move || orchestrator::run(&station))
        {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("spawning the orchestrator thread: {e}");
                return mams_core::Error::Unexpected(e.to_string()).exit_code();
            }
        }
    };

    let code = match SerialPort::open(&device) {
        Ok(mut port) => match operator::run(&station, &mut port, &wakeup) {
            Ok(()) => 0,
            Err(e) => {
                log::error!("{e}");
                e.exit_code()
            }
        },
        Err(e) => {
            log::error!("{e}");
            e.exit_code()
        }
    };

    // Wind down the orchestrator: raise the flags, then release its reader
    // from the blocking open/read so the channel can observe them.
    signals::request_exit();
    if let Err(e) = fifo::unblock_reader() {
        log::debug!("fifo reader already unblocked: {e}");
    }
    if orchestrator_thread.join().is_err() {
        log::error!("orchestrator thread panicked");
        return mams_core::Error::Fatal("orchestrator thread panicked".to_string()).exit_code();
    }
    station.show_state("OFF", false);
    code
}
