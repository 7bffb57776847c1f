/*!
Byte transports underneath [`MotorLink`](crate::link::MotorLink).

A transport moves bytes and nothing else. [`read_until_idle`](Transport::read_until_idle)
is the only place the library ever waits on hardware, and it always returns
once its timeout has passed.
*/

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use serialport::SerialPort;
use tracing::{debug, info};

use crate::error::IoError;

/// Duplex byte channel to the adapter
pub trait Transport: Send {
    /// Write all of `bytes`
    fn write(&mut self, bytes: &[u8]) -> Result<(), IoError>;

    /// Collect whatever arrives within `timeout`, possibly nothing
    fn read_until_idle(&mut self, timeout: Duration) -> Result<Vec<u8>, IoError>;

    /// Drop stale input so the next read belongs to the next request
    fn clear_input(&mut self) -> Result<(), IoError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), IoError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, bytes: &[u8]) -> Result<(), IoError> {
        (**self).write(bytes)
    }

    fn read_until_idle(&mut self, timeout: Duration) -> Result<Vec<u8>, IoError> {
        (**self).read_until_idle(timeout)
    }

    fn clear_input(&mut self) -> Result<(), IoError> {
        (**self).clear_input()
    }

    fn close(&mut self) -> Result<(), IoError> {
        (**self).close()
    }
}

/// Default quiet period that ends a read once bytes have arrived
pub const DEFAULT_IDLE_GAP: Duration = Duration::from_millis(20);

/// Serial device transport (8N1, no flow control)
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    path: String,
    idle_gap: Duration,
}

impl SerialTransport {
    /// Open `path` at `baud`. A port held by another process fails here.
    pub fn open(path: &str, baud: u32) -> Result<Self, IoError> {
        Self::open_with_idle_gap(path, baud, DEFAULT_IDLE_GAP)
    }

    pub fn open_with_idle_gap(path: &str, baud: u32, idle_gap: Duration) -> Result<Self, IoError> {
        let port = serialport::new(path, baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(idle_gap)
            .open()
            .map_err(|source| IoError::Open {
                path: path.to_string(),
                baud,
                source,
            })?;

        info!("Opened {} at {} baud", path, baud);

        Ok(Self {
            port: Some(port),
            path: path.to_string(),
            idle_gap,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>, IoError> {
        self.port.as_mut().ok_or(IoError::Closed)
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<(), IoError> {
        let port = self.port_mut()?;
        port.write_all(bytes).map_err(IoError::Write)?;
        port.flush().map_err(IoError::Write)?;
        Ok(())
    }

    fn read_until_idle(&mut self, timeout: Duration) -> Result<Vec<u8>, IoError> {
        let idle_gap = self.idle_gap;
        let port = self.port_mut()?;
        let deadline = Instant::now() + timeout;
        let mut received = Vec::new();
        let mut chunk = [0u8; 256];

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            // Never wait past the caller's deadline
            port.set_timeout(idle_gap.min(deadline - now))
                .map_err(|e| IoError::Read(e.into()))?;

            match port.read(&mut chunk) {
                Ok(0) => {}
                Ok(n) => received.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    // Bus went quiet after a reply
                    if !received.is_empty() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(IoError::Read(e)),
            }
        }

        Ok(received)
    }

    fn clear_input(&mut self) -> Result<(), IoError> {
        let port = self.port_mut()?;
        port.clear(serialport::ClearBuffer::Input)
            .map_err(|e| IoError::Read(e.into()))
    }

    fn close(&mut self) -> Result<(), IoError> {
        if self.port.take().is_some() {
            debug!("Closed {}", self.path);
        }
        Ok(())
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
