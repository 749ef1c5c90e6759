//! Operator serial line.
//!
//! RS-232 at 115200 8N1 in canonical mode: the tty driver hands us whole
//! lines, carriage returns are folded into newlines (`ICRNL`), and writes
//! block until the driver takes them. The previous port configuration is
//! saved on open and restored on drop so a crashed session does not leave
//! the console unusable.

use crate::signals::Wakeup;
use mams_core::{Error, Result};
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

const READ_BUF_SIZE: usize = 4096;

/// An open, configured serial device.
#[derive(Debug)]
pub struct SerialPort {
    fd: libc::c_int,
    saved: libc::termios,
}

impl SerialPort {
    /// Open and configure `device`.
    pub fn open(device: &Path) -> Result<SerialPort> {
        let path = CString::new(device.as_os_str().as_bytes())
            .map_err(|_| Error::Invalid(format!("bad device path {}", device.display())))?;
        let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR | libc::O_NOCTTY) };
        if fd < 0 {
            return Err(Error::Unexpected(format!(
                "open {}: {}",
                device.display(),
                io::Error::last_os_error()
            )));
        }
        if unsafe { libc::isatty(fd) } != 1 {
            unsafe { libc::close(fd) };
            return Err(Error::Invalid(format!("{} is not a tty", device.display())));
        }

        let mut saved: libc::termios = unsafe { std::mem::zeroed() };
        if unsafe { libc::tcgetattr(fd, &mut saved) } != 0 {
            let e = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::Unexpected(format!("tcgetattr: {e}")));
        }

        let mut options: libc::termios = unsafe { std::mem::zeroed() };
        options.c_cflag = libc::CLOCAL | libc::CREAD | libc::CS8 | libc::CRTSCTS;
        options.c_iflag = libc::IGNPAR | libc::ICRNL;
        options.c_oflag = 0;
        options.c_lflag = libc::ICANON;
        options.c_cc[libc::VEOF] = 4;
        options.c_cc[libc::VMIN] = 1;
        options.c_cc[libc::VTIME] = 0;
        unsafe {
            libc::cfsetispeed(&mut options, libc::B115200);
            libc::cfsetospeed(&mut options, libc::B115200);
        }
        if unsafe { libc::tcsetattr(fd, libc::TCSAFLUSH, &options) } != 0 {
            let e = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::Unexpected(format!("tcsetattr: {e}")));
        }

        // Toggle DTR and drop whatever the far end sent while nobody was
        // listening.
        let flags: libc::c_int = libc::TIOCM_DTR;
        unsafe {
            libc::ioctl(fd, libc::TIOCMBIS, &flags);
            libc::ioctl(fd, libc::TIOCMBIC, &flags);
            libc::tcflush(fd, libc::TCIFLUSH);
        }

        log::info!("serial console on {} at 115200 8N1", device.display());
        Ok(SerialPort { fd, saved })
    }

    /// Block until a full line arrives or the wakeup pipe fires.
    ///
    /// `Ok(None)` means "no line, re-check the exit flags": the wakeup fd
    /// became readable, the wait was interrupted, or the far end closed.
    pub fn read_line(&mut self, wakeup: &Wakeup) -> Result<Option<String>> {
        if !self.wait_readable(wakeup)? {
            return Ok(None);
        }
        let mut buf = [0u8; READ_BUF_SIZE];
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len() - 1) };
        if n < 0 {
            let e = io::Error::last_os_error();
            if e.raw_os_error() == Some(libc::EINTR) {
                return Ok(None);
            }
            return Err(Error::Unexpected(format!("serial read: {e}")));
        }
        if n == 0 {
            return Ok(None);
        }
        let mut line = String::from_utf8_lossy(&buf[..n as usize]).into_owned();
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        log::trace!("serial <- `{line}`");
        Ok(Some(line))
    }

    /// Block until the operator acknowledges the last frame with any
    /// completed input. Interrupted waits abort the run.
    pub fn wait_ack(&mut self, wakeup: &Wakeup) -> Result<()> {
        if !self.wait_readable(wakeup)? {
            return Err(Error::Interrupted);
        }
        let mut buf = [0u8; READ_BUF_SIZE];
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n > 0 {
            return Ok(());
        }
        if n < 0 && io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
            return Err(Error::Interrupted);
        }
        Err(Error::Unexpected("serial ack read failed".to_string()))
    }

    /// Write the whole buffer, riding out short writes and `EINTR`.
    pub fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < bytes.len() {
            let n = unsafe {
                libc::write(
                    self.fd,
                    bytes[written..].as_ptr().cast(),
                    bytes.len() - written,
                )
            };
            if n < 0 {
                let e = io::Error::last_os_error();
                if e.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(Error::Unexpected(format!("serial write: {e}")));
            }
            written += n as usize;
        }
        Ok(())
    }

    /// `true` when the serial fd is readable, `false` when the wakeup pipe
    /// fired or the wait was interrupted.
    fn wait_readable(&self, wakeup: &Wakeup) -> Result<bool> {
        let mut fds = [
            libc::pollfd { fd: self.fd, events: libc::POLLIN, revents: 0 },
            libc::pollfd { fd: wakeup.fd(), events: libc::POLLIN, revents: 0 },
        ];
        let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if n < 0 {
            let e = io::Error::last_os_error();
            if e.raw_os_error() == Some(libc::EINTR) {
                return Ok(false);
            }
            return Err(Error::Unexpected(format!("poll: {e}")));
        }
        if fds[1].revents != 0 {
            return Ok(false);
        }
        Ok(fds[0].revents & (libc::POLLIN | libc::POLLHUP) != 0)
    }
}

impl Drop for SerialPort {
    fn drop(&mut self) {
        unsafe {
            libc::tcsetattr(self.fd, libc::TCSAFLUSH, &self.saved);
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regular_files_are_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = SerialPort::open(file.path()).unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[test]
    fn missing_devices_are_unexpected() {
        let err = SerialPort::open(Path::new("/nonexistent/ttyUSB9")).unwrap_err();
        assert!(matches!(err, Error::Unexpected(_)));
    }
}
