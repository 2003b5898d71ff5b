//! A POSIX tty [`Device`], opened raw at 2400 baud, 8N1, no flow control.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::path::PathBuf;
use std::time::Duration;

use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::sys::termios::{self, BaudRate, SetArg, SpecialCharacterIndices};
use nix::unistd;

use super::{Device, DeviceError};

/// A serial device: the path to a tty node (e.g. `/dev/ttyUSB0`).
pub struct SerialDevice {
    path: PathBuf,
    device_check: bool,
    fd: Option<OwnedFd>,
}

impl SerialDevice {
    /// Creates a device for the tty at `path`. `device_check` enables
    /// polling the path to confirm the node is still present (spec.md
    /// §4.3's device-check mode).
    pub fn new(path: impl Into<PathBuf>, device_check: bool) -> Self {
        Self {
            path: path.into(),
            device_check,
            fd: None,
        }
    }

    fn borrowed(&self) -> Result<BorrowedFd<'_>, DeviceError> {
        self.fd.as_ref().map(|fd| fd.as_fd()).ok_or(DeviceError::Closed)
    }
}

impl Device for SerialDevice {
    fn open(&mut self) -> Result<(), DeviceError> {
        let fd = fcntl::open(
            &self.path,
            OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK,
            Mode::empty(),
        )
        .map_err(|_| DeviceError::OpenFailed)?;
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        if let Err(e) = configure_raw_2400_8n1(fd.as_fd()) {
            drop(fd);
            tracing::warn!(error = %e, "failed to configure tty, closing");
            return Err(DeviceError::OpenFailed);
        }

        self.fd = Some(fd);
        Ok(())
    }

    fn close(&mut self) {
        self.fd = None;
    }

    fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    fn read_byte(&mut self, timeout: Duration) -> Result<u8, DeviceError> {
        let fd = self.borrowed()?;
        if !wait_readable(fd, timeout)? {
            return Err(DeviceError::Timeout);
        }
        let mut buf = [0u8; 1];
        match unistd::read(fd.as_raw_fd(), &mut buf) {
            Ok(1) => Ok(buf[0]),
            Ok(0) => Err(DeviceError::Closed),
            Ok(_) => unreachable!("read into a 1-byte buffer returned more than 1 byte"),
            Err(nix::errno::Errno::EAGAIN) => Err(DeviceError::Timeout),
            Err(e) => Err(DeviceError::Io(e.into())),
        }
    }

    fn write_byte(&mut self, byte: u8) -> Result<(), DeviceError> {
        let fd = self.borrowed()?;
        unistd::write(fd, &[byte]).map_err(|e| DeviceError::Io(e.into()))?;
        Ok(())
    }

    fn flush_input(&mut self) -> Result<(), DeviceError> {
        let fd = self.borrowed()?;
        termios::tcflush(fd, termios::FlushArg::TCIFLUSH).map_err(|e| DeviceError::Io(e.into()))
    }

    fn check_present(&self) -> bool {
        if !self.device_check {
            return true;
        }
        nix::sys::stat::stat(&self.path).is_ok()
    }
}

/// Raw mode, 2400 baud, 8N1, no flow control, receiver enabled, ignoring
/// modem control lines. `VMIN`/`VTIME` are left at 0 (return immediately);
/// timing is driven by [`wait_readable`]'s `ppoll`, which gives microsecond
/// resolution that termios' decisecond `VTIME` cannot.
fn configure_raw_2400_8n1(fd: BorrowedFd<'_>) -> nix::Result<()> {
    let mut tio = termios::tcgetattr(fd)?;

    termios::cfmakeraw(&mut tio);
    termios::cfsetispeed(&mut tio, BaudRate::B2400)?;
    termios::cfsetospeed(&mut tio, BaudRate::B2400)?;

    tio.control_flags |= termios::ControlFlags::CLOCAL | termios::ControlFlags::CREAD;
    tio.control_flags &= !termios::ControlFlags::CRTSCTS;

    tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

    termios::tcsetattr(fd, SetArg::TCSANOW, &tio)
}

/// Blocks until `fd` is readable or `timeout` elapses, returning whether it
/// became readable. Uses raw `ppoll(2)` rather than `nix::poll`'s wrapper or
/// `poll(2)`'s millisecond-granular timeout: `ppoll` takes a `timespec`, so
/// the arbitration window (4400 microseconds by default) survives intact
/// instead of being rounded up to whole milliseconds.
fn wait_readable(fd: BorrowedFd<'_>, timeout: Duration) -> Result<bool, DeviceError> {
    use std::os::fd::AsRawFd;

    let mut pfd = libc::pollfd {
        fd: fd.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let ts = libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    };

    loop {
        let rc = unsafe { libc::ppoll(&mut pfd, 1, &ts, std::ptr::null()) };
        match rc {
            -1 => {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(DeviceError::Io(err));
            }
            0 => return Ok(false),
            _ => return Ok(pfd.revents & libc::POLLIN != 0),
        }
    }
}
