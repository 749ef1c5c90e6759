//! Real-time scheduling.
//!
//! Settling pauses and the move-then-read ordering are timing commitments;
//! a preempted controller can convert a settled measurement into a reading
//! of the previous position. The process therefore asks for round-robin
//! real-time scheduling at the highest available priority on startup.
//! Running without it (no privileges, ordinary desktop) is allowed but
//! loudly logged.

use mams_core::{Error, Result};

/// Switch the process to `SCHED_RR` at maximum priority.
pub fn elevate() -> Result<()> {
    let max = unsafe { libc::sched_get_priority_max(libc::SCHED_RR) };
    if max < 0 {
        return Err(Error::Unexpected(format!(
            "sched_get_priority_max: {}",
            std::io::Error::last_os_error()
        )));
    }
    let param = libc::sched_param { sched_priority: max };
    if unsafe { libc::sched_setscheduler(0, libc::SCHED_RR, &param) } != 0 {
        return Err(Error::Unexpected(format!(
            "sched_setscheduler: {}",
            std::io::Error::last_os_error()
        )));
    }
    log::info!("running SCHED_RR at priority {max}");
    Ok(())
}
