//! Orchestrator request channel (secondary thread).
//!
//! The supervisor may only start alignments; every other well-formed
//! command is refused. Runs stream no frames back over the bus; the data
//! goes into the run log, header and footer included, so a supervisor can
//! collect it after `STOPPED`.

use crate::fifo;
use crate::request::Request;
use crate::signals;
use crate::station::Station;
use mams_core::align::{self, AlignmentLoop, Outcome};
use mams_core::arbiter::Owner;
use mams_core::context::RunParams;
use mams_core::frame::FrameSink;
use mams_core::{Error, Result, DISCHARGE_PAUSE, NUM_FIBERS};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::mpsc;
use std::time::Instant;

/// Per-run data log appended by orchestrator-owned runs.
pub const RUN_LOG: &str = "logs/mams-algorithm.log";

/// Serve the supervisor until the exit flag is raised.
pub fn run(station: &Station) {
    let (tx, rx) = mpsc::sync_channel::<String>(1);
    let reader = match fifo::spawn_reader(tx) {
        Ok(handle) => handle,
        Err(e) => {
            log::error!("spawning fifo reader: {e}");
            return;
        }
    };
    log::info!("orchestrator channel ready");

    loop {
        if signals::exit_requested() {
            break;
        }
        // The reader dropping its sender also ends the loop.
        let line = match rx.recv() {
            Ok(line) => line,
            Err(_) => break,
        };
        if signals::exit_requested() {
            break;
        }
        handle_line(station, &line);
    }

    match fifo::unblock_reader() {
        Ok(()) => {
            if reader.join().is_err() {
                log::error!("fifo reader panicked");
            }
        }
        Err(e) => {
            // Nothing to release, or the pipe is gone; either way the
            // reader cannot be woken, so leave it detached.
            log::warn!("could not release the fifo reader, detaching it: {e}");
            drop(reader);
        }
    }
    log::info!("orchestrator channel closed");
}

fn handle_line(station: &Station, line: &str) {
    let reply = match Request::parse(line) {
        Ok(Request::Start { params }) => start_run(station, params),
        Ok(other) => {
            log::debug!("orchestrator may only start alignments, refused {other:?}");
            "ERR\n"
        }
        Err(e) => {
            log::debug!("rejected request `{line}`: {e}");
            "ERR\n"
        }
    };
    if let Err(e) = fifo::reply(reply) {
        log::error!("orchestrator reply failed: {e}");
    }
}

fn start_run(station: &Station, params: RunParams) -> &'static str {
    let Some(_own) = station.arbiter.lock(Owner::Orchestrator) else {
        return "BUSY\n";
    };
    if signals::exit_requested() {
        return "STOPPED\n";
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
            return "ERR\n";
        }
    }
    if let Err(e) = fifo::reply("STARTING\n") {
        log::error!("orchestrator channel: {e}");
        shared.bench.show(0, "IDLE");
        shared.bench.set_status(false);
        return "STOPPED\n";
    }

    let result = LogSink::open().and_then(|mut sink| {
        AlignmentLoop::new(
            &mut shared.bench,
            &mut shared.bank,
            &mut shared.ctx,
            &mut sink,
            station.align_cancel,
            Owner::Orchestrator,
            params,
        )
        .run()
    });
    shared.bench.show(0, "IDLE");
    shared.bench.set_status(false);
    match result {
        Ok(Outcome::Completed) => log::info!("orchestrator run completed"),
        Ok(Outcome::Cancelled) => log::info!("orchestrator run cancelled"),
        Err(Error::Interrupted) => log::info!("orchestrator run interrupted"),
        Err(e) => {
            station.align_cancel.cancel();
            log::error!("orchestrator run aborted: {e}");
        }
    }
    "STOPPED\n"
}

/// Appends the run header, frames and elapsed-time footer to [`RUN_LOG`].
struct LogSink {
    file: File,
    started: Instant,
}

impl LogSink {
    fn open() -> Result<LogSink> {
        std::fs::create_dir_all("logs")
            .map_err(|e| Error::Unexpected(format!("mkdir logs: {e}")))?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(RUN_LOG)
            .map_err(|e| Error::Unexpected(format!("open {RUN_LOG}: {e}")))?;
        Ok(LogSink { file, started: Instant::now() })
    }

    fn write(&mut self, text: &str) -> Result<()> {
        self.file
            .write_all(text.as_bytes())
            .map_err(|e| Error::Unexpected(format!("write {RUN_LOG}: {e}")))
    }
}

impl FrameSink for LogSink {
    fn start(&mut self, params: &RunParams) -> Result<()> {
        self.started = Instant::now();
        self.write(&format!(
            "N:{}\nMIN STEP:{}\nMAX STEP:{}\nNUM OF SAMPLES:{}\nHYSTERESIS STEP SIZE:{}\n",
            NUM_FIBERS,
            params.min_step_size,
            params.max_step_size,
            params.num_samples,
            params.hysteresis_step_size,
        ))
    }

    fn emit(&mut self, frame: &str) -> Result<()> {
        // The run log does not block, so this is the orchestrator run's
        // cancellation point.
        if signals::exit_requested() {
            return Err(Error::Interrupted);
        }
        self.write(frame)
    }

    fn finish(&mut self) -> Result<()> {
        let elapsed = self.started.elapsed().as_millis();
        self.write(&format!("Elapsed time:{elapsed}\n"))
    }
}
