//! A TCP client [`Device`], for talking to a remote proxy that owns the
//! physical bus. No local serial settings are applied here; the remote end
//! is responsible for them.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use super::{Device, DeviceError};

/// A `host:port` TCP transport.
pub struct TcpDevice {
    addr: String,
    stream: Option<TcpStream>,
}

impl TcpDevice {
    /// Creates a device that connects to `addr` (`host:port`) on [`open`](Device::open).
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            stream: None,
        }
    }
}

impl Device for TcpDevice {
    fn open(&mut self) -> Result<(), DeviceError> {
        let stream = TcpStream::connect(&self.addr).map_err(|_| DeviceError::OpenFailed)?;
        stream.set_nodelay(true).map_err(DeviceError::Io)?;
        self.stream = Some(stream);
        Ok(())
    }

    fn close(&mut self) {
        self.stream = None;
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn read_byte(&mut self, timeout: Duration) -> Result<u8, DeviceError> {
        let stream = self.stream.as_mut().ok_or(DeviceError::Closed)?;
        // A zero timeout means "block forever" to std::net; eBUS never asks
        // for that, but guard against it turning into an indefinite stall.
        let effective = if timeout.is_zero() {
            Duration::from_millis(1)
        } else {
            timeout
        };
        stream
            .set_read_timeout(Some(effective))
            .map_err(DeviceError::Io)?;

        let mut buf = [0u8; 1];
        match stream.read(&mut buf) {
            Ok(1) => Ok(buf[0]),
            Ok(0) => Err(DeviceError::Closed),
            Ok(_) => unreachable!("read into a 1-byte buffer returned more than 1 byte"),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                Err(DeviceError::Timeout)
            }
            Err(e) => Err(DeviceError::Io(e)),
        }
    }

    fn write_byte(&mut self, byte: u8) -> Result<(), DeviceError> {
        let stream = self.stream.as_mut().ok_or(DeviceError::Closed)?;
        stream.write_all(&[byte]).map_err(DeviceError::Io)
    }

    fn flush_input(&mut self) -> Result<(), DeviceError> {
        let stream = self.stream.as_mut().ok_or(DeviceError::Closed)?;
        stream
            .set_read_timeout(Some(Duration::from_millis(1)))
            .map_err(DeviceError::Io)?;
        let mut buf = [0u8; 256];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                    return Ok(())
                }
                Err(e) => return Err(DeviceError::Io(e)),
            }
        }
    }
}
