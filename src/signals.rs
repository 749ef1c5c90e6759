//! Signal handling and the wakeup pipe.
//!
//! SIGINT/SIGTERM must stop a controller that is usually asleep in a
//! blocking read, a settling pause, or an acknowledgment wait. The handler
//! does the only two async-signal-safe things it needs: it raises the two
//! exit flags and writes one byte into a self-pipe. Every blocking wait in
//! the process multiplexes its own descriptor with the pipe's read end, so
//! the byte converts "a flag changed" into "your poll returned".

use mams_core::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// Stops the alignment loop at its next polling point.
pub static EXIT_ALIGNMENT: AtomicBool = AtomicBool::new(false);

/// Stops both channel loops at their next blocking wait.
pub static EXIT_CHANNELS: AtomicBool = AtomicBool::new(false);

static WAKEUP_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_signal(_sig: libc::c_int) {
    EXIT_ALIGNMENT.store(true, Ordering::Release);
    EXIT_CHANNELS.store(true, Ordering::Release);
    let fd = WAKEUP_WRITE_FD.load(Ordering::Acquire);
    if fd >= 0 {
        let byte = [1u8];
        // Best effort: a full pipe already wakes the readers.
        unsafe {
            libc::write(fd, byte.as_ptr().cast(), 1);
        }
    }
}

/// Read end of the self-pipe.
pub struct Wakeup {
    read_fd: libc::c_int,
}

impl Wakeup {
    /// Descriptor to include in `poll` sets.
    pub fn fd(&self) -> libc::c_int {
        self.read_fd
    }

    /// Discard any pending wakeup bytes.
    pub fn drain(&self) {
        let mut buf = [0u8; 16];
        loop {
            let n = unsafe { libc::read(self.read_fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n <= 0 {
                return;
            }
        }
    }
}

impl Drop for Wakeup {
    fn drop(&mut self) {
        WAKEUP_WRITE_FD.store(-1, Ordering::Release);
        unsafe {
            libc::close(self.read_fd);
        }
    }
}

/// Create the self-pipe and install the SIGINT/SIGTERM handler.
///
/// Handlers are installed without `SA_RESTART` so long blocking calls also
/// return `EINTR` and re-check the flags.
pub fn install() -> Result<Wakeup> {
    let mut fds: [libc::c_int; 2] = [0; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } != 0 {
        return Err(Error::Unexpected(format!(
            "self-pipe creation failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    WAKEUP_WRITE_FD.store(fds[1], Ordering::Release);

    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        let handler: extern "C" fn(libc::c_int) = on_signal;
        sa.sa_sigaction = handler as usize;
        libc::sigemptyset(&mut sa.sa_mask);
        for sig in [libc::SIGINT, libc::SIGTERM] {
            if libc::sigaction(sig, &sa, std::ptr::null_mut()) != 0 {
                return Err(Error::Unexpected(format!(
                    "installing handler for signal {sig} failed: {}",
                    std::io::Error::last_os_error()
                )));
            }
        }
    }
    Ok(Wakeup { read_fd: fds[0] })
}

/// Raise both exit flags from an error path, as the signal handler would.
pub fn request_exit() {
    EXIT_ALIGNMENT.store(true, Ordering::Release);
    EXIT_CHANNELS.store(true, Ordering::Release);
    let fd = WAKEUP_WRITE_FD.load(Ordering::Acquire);
    if fd >= 0 {
        let byte = [1u8];
        unsafe {
            libc::write(fd, byte.as_ptr().cast(), 1);
        }
    }
}

/// Whether the channel loops should wind down.
pub fn exit_requested() -> bool {
    EXIT_CHANNELS.load(Ordering::Acquire)
}
