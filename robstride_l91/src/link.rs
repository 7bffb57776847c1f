/*!
Request/response exchanges against a single transport.

The wire format carries no request id, so a link owns its transport outright
and every exchange takes `&mut self`: two exchanges on one transport can
never overlap.
*/

use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{DecodeError, IoError, LinkError};
use crate::frame::{decode_reply, decode_stream, Frame};
use crate::protocol::{ADAPTER_PROBE, DEFAULT_ADAPTER_ADDRESS};
use crate::transport::Transport;

/// Retry policy of a link
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkConfig {
    /// Session constant written into every frame
    pub adapter_address: u16,
    /// Extra attempts after the first one
    pub max_retries: u32,
    /// Pause between attempts
    pub retry_delay: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            adapter_address: DEFAULT_ADAPTER_ADDRESS,
            max_retries: 1,
            retry_delay: Duration::from_millis(100),
        }
    }
}

/// Owner of one transport, issuing one exchange at a time
pub struct MotorLink<T: Transport> {
    transport: T,
    config: LinkConfig,
}

impl<T: Transport> MotorLink<T> {
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, LinkConfig::default())
    }

    pub fn with_config(transport: T, config: LinkConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn adapter_address(&self) -> u16 {
        self.config.adapter_address
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Give the transport back, e.g. to close it
    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Probe the adapter with `AT+AT`. Returns whether it answered `OK`.
    pub fn handshake(&mut self, timeout: Duration) -> Result<bool, IoError> {
        self.transport.clear_input()?;
        self.transport.write(ADAPTER_PROBE)?;
        let reply = self.transport.read_until_idle(timeout)?;
        let ok = reply.windows(2).any(|w| w == b"OK");
        if ok {
            info!("Adapter acknowledged handshake");
        } else {
            warn!("Adapter did not answer AT+AT with OK ({} bytes received)", reply.len());
        }
        Ok(ok)
    }

    /// Send one frame and wait for the first decodable reply.
    ///
    /// Silence or undecodable bytes are retried `max_retries` times; after
    /// that the exchange fails with [`LinkError::NoResponse`]. That only
    /// means nothing usable arrived in time, not that the device is absent.
    pub fn exchange(
        &mut self,
        command: u8,
        target_id: u8,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Frame, LinkError> {
        let request = Frame::new(command, self.config.adapter_address, target_id, payload);
        self.exchange_frame(&request, timeout)
    }

    /// [`exchange`](Self::exchange) for an already built frame
    pub fn exchange_frame(&mut self, request: &Frame, timeout: Duration) -> Result<Frame, LinkError> {
        let bytes = request.to_bytes();
        let attempts = self.config.max_retries + 1;
        let mut last_decode: Option<DecodeError> = None;

        for attempt in 1..=attempts {
            if attempt > 1 && !self.config.retry_delay.is_zero() {
                thread::sleep(self.config.retry_delay);
            }

            self.transport.clear_input()?;
            debug!("-> id {} attempt {}/{}: {}", request.target_id, attempt, attempts, hex::encode(&bytes));
            self.transport.write(&bytes)?;

            let reply = self.transport.read_until_idle(timeout)?;
            if reply.is_empty() {
                debug!("<- id {}: silence", request.target_id);
                continue;
            }

            debug!("<- id {}: {}", request.target_id, hex::encode(&reply));
            if let Some(frame) = decode_stream(&reply).into_iter().next() {
                return Ok(frame);
            }
            last_decode = decode_reply(&reply).err();
        }

        Err(LinkError::NoResponse {
            target_id: request.target_id,
            attempts,
            last_decode,
        })
    }

    /// Write a frame without waiting for a reply
    pub fn send(&mut self, frame: &Frame) -> Result<(), LinkError> {
        let bytes = frame.to_bytes();
        debug!("-> id {} (no reply expected): {}", frame.target_id, hex::encode(&bytes));
        self.transport.write(&bytes)?;
        Ok(())
    }

    /// Listen without sending and decode whatever arrives
    pub fn listen(&mut self, window: Duration) -> Result<Vec<Frame>, IoError> {
        let bytes = self.transport.read_until_idle(window)?;
        Ok(decode_stream(&bytes))
    }

    pub fn activate(&mut self, target_id: u8, timeout: Duration) -> Result<Frame, LinkError> {
        let frame = Frame::activate(self.config.adapter_address, target_id);
        self.exchange_frame(&frame, timeout)
    }

    pub fn deactivate(&mut self, target_id: u8, timeout: Duration) -> Result<Frame, LinkError> {
        let frame = Frame::deactivate(self.config.adapter_address, target_id);
        self.exchange_frame(&frame, timeout)
    }

    pub fn load_parameters(&mut self, target_id: u8, timeout: Duration) -> Result<Frame, LinkError> {
        let frame = Frame::load_parameters(self.config.adapter_address, target_id);
        self.exchange_frame(&frame, timeout)
    }

    /// Read parameter `index`; never causes motion
    pub fn query(&mut self, target_id: u8, index: u16, timeout: Duration) -> Result<Frame, LinkError> {
        let frame = Frame::query(self.config.adapter_address, target_id, index);
        self.exchange_frame(&frame, timeout)
    }

    /// Jog with an already encoded speed
    pub fn jog(&mut self, target_id: u8, run: bool, speed_raw: i16, timeout: Duration) -> Result<Frame, LinkError> {
        let frame = Frame::jog(self.config.adapter_address, target_id, run, speed_raw);
        self.exchange_frame(&frame, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimDevice, SimulatedBus};

    fn quick_link(bus: SimulatedBus) -> MotorLink<SimulatedBus> {
        MotorLink::with_config(
            bus,
            LinkConfig {
                retry_delay: Duration::ZERO,
                ..LinkConfig::default()
            },
        )
    }

    #[test]
    fn test_exchange_returns_reply() {
        let bus = SimulatedBus::new(vec![SimDevice::new(7, vec![0x0f, 0xec])]);
        let mut link = quick_link(bus);

        let reply = link.activate(7, Duration::from_millis(50)).unwrap();
        assert_eq!(reply.responder_id(), 7);
        assert_eq!(reply.payload, vec![0x0f, 0xec]);
        assert_eq!(link.transport().sent_frames().len(), 1);
    }

    #[test]
    fn test_captured_reply_completes_exchange() {
        let mut bus = SimulatedBus::new(vec![]);
        bus.push_raw_reply(hex::decode("415400000ff40836453b4e207130180d0a").unwrap());
        let mut link = quick_link(bus);

        let reply = link.activate(8, Duration::from_millis(50)).unwrap();
        assert_eq!(reply.responder_id(), 1);
        assert_eq!(reply.payload, [0x36, 0x45, 0x3b, 0x4e, 0x20, 0x71, 0x30, 0x18]);
        assert_eq!(link.transport().sent_frames().len(), 1);

        // Data ending in 0x0d right before the terminator
        let mut bus = SimulatedBus::new(vec![]);
        bus.push_raw_reply(hex::decode("415400004ff408c94230209c23370d0d0a").unwrap());
        let mut link = quick_link(bus);
        let reply = link.load_parameters(72, Duration::from_millis(50)).unwrap();
        assert_eq!(reply.responder_id(), 9);
        assert_eq!(reply.payload.last(), Some(&0x0d));
    }

    #[test]
    fn test_silence_retries_then_no_response() {
        let bus = SimulatedBus::new(vec![]);
        let mut link = quick_link(bus);

        let err = link.load_parameters(3, Duration::from_millis(50)).unwrap_err();
        match err {
            LinkError::NoResponse { target_id, attempts, last_decode } => {
                assert_eq!(target_id, 3);
                assert_eq!(attempts, 2);
                assert_eq!(last_decode, None);
            }
            other => panic!("unexpected error: {other}"),
        }
        // one initial attempt plus the default single retry
        assert_eq!(link.transport().sent_frames().len(), 2);
    }

    #[test]
    fn test_garbage_reply_reports_decode_error() {
        let mut bus = SimulatedBus::new(vec![]);
        bus.push_raw_reply(b"AT\x00\x07".to_vec());
        bus.push_raw_reply(b"AT\x00\x07".to_vec());
        let mut link = quick_link(bus);

        let err = link.activate(1, Duration::from_millis(50)).unwrap_err();
        assert!(matches!(
            err,
            LinkError::NoResponse {
                last_decode: Some(DecodeError::Truncated { .. }),
                ..
            }
        ));
    }

    #[test]
    fn test_retry_recovers_after_garbage() {
        let mut bus = SimulatedBus::new(vec![SimDevice::new(4, vec![0x01])]);
        bus.push_raw_reply(b"\xff\xff".to_vec());
        let mut link = quick_link(bus);

        let reply = link.activate(4, Duration::from_millis(50)).unwrap();
        assert_eq!(reply.responder_id(), 4);
        assert_eq!(link.transport().sent_frames().len(), 2);
    }

    #[test]
    fn test_handshake() {
        let mut link = quick_link(SimulatedBus::new(vec![]));
        assert!(link.handshake(Duration::from_millis(50)).unwrap());

        let mut silent = quick_link(SimulatedBus::new(vec![]).without_adapter());
        assert!(!silent.handshake(Duration::from_millis(50)).unwrap());
    }

    #[test]
    fn test_io_failure_is_not_retried() {
        let mut bus = SimulatedBus::new(vec![SimDevice::new(1, vec![0x01])]);
        bus.disconnect();
        let mut link = quick_link(bus);

        let err = link.activate(1, Duration::from_millis(50)).unwrap_err();
        assert!(err.is_io());
    }
}
