//! Named-pipe transport of the orchestrator bus.
//!
//! The supervisor writes commands into `artifacts/fifo_in` and reads
//! replies from `artifacts/fifo_out`, one line per message. A dedicated
//! reader thread blocks on the inbound pipe and forwards each line through
//! a rendezvous channel, so the orchestrator loop has a single blocking
//! wait and no spin. A blocked reader is released on shutdown by writing a
//! sentinel line into the inbound pipe from our own side.

use crate::signals;
use mams_core::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;
use std::sync::mpsc::SyncSender;
use std::thread::JoinHandle;

/// Inbound pipe, supervisor → controller.
pub const FIFO_IN: &str = "artifacts/fifo_in";

/// Outbound pipe, controller → supervisor.
pub const FIFO_OUT: &str = "artifacts/fifo_out";

/// Line written into `FIFO_IN` to release our own blocked reader.
const SENTINEL: &str = "dummy";

/// Create `path` as a FIFO (mode 0777) if it does not exist. A pre-existing
/// path that is not a FIFO is unusable and fatal for the bus.
pub fn ensure_fifo(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Unexpected(format!("mkdir {}: {e}", parent.display())))?;
        }
    }
    match std::fs::metadata(path) {
        Ok(meta) => {
            if !meta.file_type().is_fifo() {
                return Err(Error::Fatal(format!("{} is not a FIFO", path.display())));
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let cpath = std::ffi::CString::new(path.as_os_str().as_bytes())
                .map_err(|_| Error::Invalid(format!("bad path {}", path.display())))?;
            if unsafe { libc::mkfifo(cpath.as_ptr(), 0o777) } != 0 {
                return Err(Error::Unexpected(format!(
                    "mkfifo {}: {}",
                    path.display(),
                    std::io::Error::last_os_error()
                )));
            }
            // mkfifo is subject to the umask; force the advertised mode.
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777))
                .map_err(|e| Error::Unexpected(format!("chmod {}: {e}", path.display())))?;
            log::info!("created FIFO {}", path.display());
            Ok(())
        }
        Err(e) => Err(Error::Unexpected(format!("stat {}: {e}", path.display()))),
    }
}

/// Spawn the inbound reader. Each open/read cycle forwards the received
/// lines; the thread exits when the exit flag is up or the receiver went
/// away.
pub fn spawn_reader(tx: SyncSender<String>) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("fifo-reader".to_string())
        .spawn(move || reader_loop(&tx))
}

fn reader_loop(tx: &SyncSender<String>) {
    'outer: while !signals::exit_requested() {
        let mut text = String::new();
        match File::open(FIFO_IN) {
            Ok(mut pipe) => {
                if let Err(e) = pipe.read_to_string(&mut text) {
                    log::error!("reading {FIFO_IN}: {e}");
                    break;
                }
            }
            Err(e) => {
                log::error!("opening {FIFO_IN}: {e}");
                break;
            }
        }
        for line in text.lines() {
            if signals::exit_requested() {
                break 'outer;
            }
            if line == SENTINEL || line.is_empty() {
                continue;
            }
            if tx.send(line.to_string()).is_err() {
                break 'outer;
            }
        }
    }
    log::debug!("fifo reader finished");
}

/// Release a reader blocked on `FIFO_IN` by writing the sentinel from our
/// side. Fails when nobody is reading, which means there is nothing to
/// release.
pub fn unblock_reader() -> Result<()> {
    let mut pipe = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(FIFO_IN)
        .map_err(|e| Error::Unexpected(format!("opening {FIFO_IN} for unblock: {e}")))?;
    writeln!(pipe, "{SENTINEL}")
        .map_err(|e| Error::Unexpected(format!("writing sentinel: {e}")))?;
    Ok(())
}

/// Send one reply line to the supervisor.
///
/// Waits for the supervisor to open the read side, but keeps the wait
/// interruptible: a plain blocking open could park the channel forever if
/// the far side died, so the rendezvous is polled and abandoned once the
/// exit flag is up.
pub fn reply(text: &str) -> Result<()> {
    loop {
        match OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(FIFO_OUT)
        {
            Ok(mut pipe) => {
                // Back to blocking for the write itself.
                let fd = pipe.as_raw_fd();
                unsafe {
                    let flags = libc::fcntl(fd, libc::F_GETFL);
                    if flags >= 0 {
                        libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK);
                    }
                }
                return pipe
                    .write_all(text.as_bytes())
                    .map_err(|e| Error::Unexpected(format!("writing {FIFO_OUT}: {e}")));
            }
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                if signals::exit_requested() {
                    log::warn!("dropping reply `{}`: no supervisor reading", text.trim_end());
                    return Ok(());
                }
                std::thread::sleep(std::time::Duration::from_millis(50));
            }
            Err(e) => {
                return Err(Error::Unexpected(format!("opening {FIFO_OUT}: {e}")));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_fifo_creates_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fifo_in");
        ensure_fifo(&path).unwrap();
        assert!(std::fs::metadata(&path).unwrap().file_type().is_fifo());
        // Idempotent on an existing FIFO.
        ensure_fifo(&path).unwrap();

        let plain = dir.path().join("not_a_fifo");
        std::fs::write(&plain, b"x").unwrap();
        assert!(matches!(ensure_fifo(&plain), Err(Error::Fatal(_))));
    }

    #[test]
    fn ensure_fifo_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("fifo_out");
        ensure_fifo(&path).unwrap();
        assert!(std::fs::metadata(&path).unwrap().file_type().is_fifo());
    }
}
