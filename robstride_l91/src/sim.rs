/*!
Simulated L91 bus for tests and dry runs.

The simulation runs on virtual time. A device answers a request when its
latency fits inside the read timeout; a slower answer is kept as a late
reply that a later passive read picks up, and that the next exchange throws
away with [`clear_input`](Transport::clear_input). Nothing here sleeps.
*/

use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use tracing::debug;

use crate::error::IoError;
use crate::frame::{decode, reply_can_id, CommandFamily, Frame};
use crate::protocol::ADAPTER_PROBE;
use crate::transport::Transport;

/// Host id motors put in the low byte of their replies
const HOST_ID: u8 = 0xFE;

/// One simulated motor, possibly answering under several identifiers
#[derive(Debug, Clone)]
pub struct SimDevice {
    base_id: u8,
    span: u8,
    reply_id: u32,
    signature: Vec<u8>,
    parameter_reply: Option<Vec<u8>>,
    latency: Duration,
    respond_limit: Option<u32>,
    answers_motion: bool,
    responses: u32,
    enabled: bool,
    running: bool,
    speed_raw: i16,
}

impl SimDevice {
    /// Device answering only `base_id` with `signature` as reply data.
    /// Its replies carry `base_id` as motor id.
    pub fn new(base_id: u8, signature: impl Into<Vec<u8>>) -> Self {
        Self {
            base_id,
            span: 1,
            reply_id: reply_can_id(0, base_id, HOST_ID),
            signature: signature.into(),
            parameter_reply: None,
            latency: Duration::ZERO,
            respond_limit: None,
            answers_motion: true,
            responses: 0,
            enabled: false,
            running: false,
            speed_raw: 0,
        }
    }

    /// Answer every id in `base_id .. base_id + span`
    pub fn masked(mut self, span: u8) -> Self {
        self.span = span.max(1);
        self
    }

    /// Motor id written into replies, when it differs from the ids answered
    pub fn with_native_id(mut self, motor_id: u8) -> Self {
        self.reply_id = reply_can_id(0, motor_id, HOST_ID);
        self
    }

    /// Raw id field of every reply
    pub fn with_reply_id(mut self, can_id: u32) -> Self {
        self.reply_id = can_id;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Data returned for parameter frames; defaults to the signature
    pub fn with_parameter_reply(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.parameter_reply = Some(payload.into());
        self
    }

    /// Go quiet after `limit` replies
    pub fn respond_limit(mut self, limit: u32) -> Self {
        self.respond_limit = Some(limit);
        self
    }

    /// Act on jog frames but never acknowledge them
    pub fn silent_to_motion(mut self) -> Self {
        self.answers_motion = false;
        self
    }

    pub fn base_id(&self) -> u8 {
        self.base_id
    }

    pub fn accepts(&self, id: u8) -> bool {
        let id = id as u16;
        let base = self.base_id as u16;
        id >= base && id < base + self.span as u16
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn speed_raw(&self) -> i16 {
        self.speed_raw
    }

    pub fn responses(&self) -> u32 {
        self.responses
    }

    /// Update motion state from a received frame
    fn apply(&mut self, frame: &Frame) {
        match frame.family() {
            CommandFamily::Enable => {
                self.enabled = frame.is_activate();
                if !self.enabled {
                    self.running = false;
                    self.speed_raw = 0;
                }
            }
            CommandFamily::Jog => {
                // A disabled drive ignores jog requests
                if self.enabled {
                    self.running = frame.jog_flag().unwrap_or(false);
                    self.speed_raw = frame.jog_speed_raw().unwrap_or(0);
                }
            }
            _ => {}
        }
    }

    fn reply_to(&mut self, frame: &Frame) -> Option<Frame> {
        if self.respond_limit.is_some_and(|limit| self.responses >= limit) {
            return None;
        }

        let payload = match frame.family() {
            CommandFamily::Enable => self.signature.clone(),
            CommandFamily::Parameter => self
                .parameter_reply
                .clone()
                .unwrap_or_else(|| self.signature.clone()),
            CommandFamily::Jog if self.answers_motion => Vec::new(),
            _ => return None,
        };

        self.responses += 1;
        Some(Frame::reply(self.reply_id, payload))
    }
}

/// [`Transport`] backed by a simulated device population
#[derive(Debug, Default)]
pub struct SimulatedBus {
    devices: Vec<SimDevice>,
    silent_adapter: bool,
    disconnected: bool,
    closed: bool,
    sent: Vec<Frame>,
    raw_replies: VecDeque<Vec<u8>>,
    awaiting_reply: bool,
    pending: Vec<(Duration, Vec<u8>)>,
    late: Vec<u8>,
}

impl SimulatedBus {
    pub fn new(mut devices: Vec<SimDevice>) -> Self {
        devices.sort_by_key(|device| device.base_id);
        Self {
            devices,
            ..Self::default()
        }
    }

    /// Population used by `--simulate`, replaying six captured motors:
    /// masked devices at 8-10, 32-39, 64-71 and 72-79, two distinct devices
    /// at 20 and 31, and the one at 72-79 slow enough that a fast ascending
    /// pass alone misses it.
    pub fn demo() -> Self {
        let motor = |base_id: u8, can_id: u32, data: [u8; 8], latency_ms: u64| {
            SimDevice::new(base_id, data)
                .with_reply_id(can_id)
                .with_latency(Duration::from_millis(latency_ms))
        };

        Self::new(vec![
            motor(8, 0x0000_0ff4, [0x36, 0x45, 0x3b, 0x4e, 0x20, 0x71, 0x30, 0x18], 5).masked(3),
            motor(20, 0x1000_17ec, [0x00, 0xc4, 0x56, 0x00, 0x03, 0x01, 0x0b, 0x07], 8),
            motor(31, 0x0000_1ff4, [0x40, 0x64, 0x3b, 0x4e, 0x20, 0x71, 0x30, 0x18], 8),
            motor(32, 0x0000_27f4, [0x3b, 0x44, 0x30, 0x02, 0x14, 0x33, 0xb2, 0x17], 5).masked(8),
            motor(64, 0x0000_47f4, [0x43, 0x3c, 0x30, 0x02, 0x14, 0x33, 0xb2, 0x18], 5).masked(8),
            motor(72, 0x0000_4ff4, [0xc9, 0x42, 0x30, 0x20, 0x9c, 0x23, 0x37, 0x0d], 120).masked(8),
        ])
    }

    /// The adapter ignores `AT+AT`
    pub fn without_adapter(mut self) -> Self {
        self.silent_adapter = true;
        self
    }

    /// Simulate a pulled cable: every later read and write fails
    pub fn disconnect(&mut self) {
        self.disconnected = true;
    }

    /// Answer the next request with `bytes` instead of the devices
    pub fn push_raw_reply(&mut self, bytes: Vec<u8>) {
        self.raw_replies.push_back(bytes);
    }

    /// Every decodable frame written so far, in order
    pub fn sent_frames(&self) -> &[Frame] {
        &self.sent
    }

    pub fn clear_sent(&mut self) {
        self.sent.clear();
    }

    /// Device whose base id is `base_id`
    pub fn device(&self, base_id: u8) -> Option<&SimDevice> {
        self.devices.iter().find(|device| device.base_id == base_id)
    }

    pub fn devices(&self) -> &[SimDevice] {
        &self.devices
    }

    fn check_open(&self, write: bool) -> Result<(), IoError> {
        if self.closed {
            return Err(IoError::Closed);
        }
        if self.disconnected {
            let err = io::Error::new(io::ErrorKind::BrokenPipe, "simulated device unplugged");
            return Err(if write { IoError::Write(err) } else { IoError::Read(err) });
        }
        Ok(())
    }
}

impl Transport for SimulatedBus {
    fn write(&mut self, bytes: &[u8]) -> Result<(), IoError> {
        self.check_open(true)?;
        self.awaiting_reply = true;
        self.pending.clear();

        if bytes == ADAPTER_PROBE {
            if !self.silent_adapter {
                self.pending.push((Duration::ZERO, b"OK\r\n".to_vec()));
            }
            return Ok(());
        }

        let Ok(frame) = decode(bytes) else {
            debug!("sim: ignoring undecodable write {}", hex::encode(bytes));
            return Ok(());
        };

        let raw = self.raw_replies.pop_front();
        for device in self.devices.iter_mut().filter(|d| d.accepts(frame.target_id)) {
            device.apply(&frame);
            if raw.is_some() {
                continue;
            }
            if let Some(reply) = device.reply_to(&frame) {
                self.pending.push((device.latency, reply.to_reply_bytes()));
            }
        }
        if let Some(raw) = raw {
            self.pending.push((Duration::ZERO, raw));
        }

        // Faster devices win arbitration
        self.pending.sort_by_key(|(latency, _)| *latency);
        self.sent.push(frame);
        Ok(())
    }

    fn read_until_idle(&mut self, timeout: Duration) -> Result<Vec<u8>, IoError> {
        self.check_open(false)?;

        if !self.awaiting_reply {
            return Ok(std::mem::take(&mut self.late));
        }
        self.awaiting_reply = false;

        let mut received = Vec::new();
        for (latency, bytes) in self.pending.drain(..) {
            if latency <= timeout {
                received.extend(bytes);
            } else {
                self.late.extend(bytes);
            }
        }
        Ok(received)
    }

    fn clear_input(&mut self) -> Result<(), IoError> {
        self.check_open(false)?;
        self.late.clear();
        Ok(())
    }

    fn close(&mut self) -> Result<(), IoError> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::decode_reply;

    const SHORT: Duration = Duration::from_millis(50);

    #[test]
    fn test_masked_device_replies_with_its_own_id() {
        let mut bus = SimulatedBus::new(vec![SimDevice::new(8, vec![0xaa]).masked(8).with_native_id(1)]);

        bus.write(&Frame::activate(0x07E8, 13).to_bytes()).unwrap();
        let reply = decode_reply(&bus.read_until_idle(SHORT).unwrap()).unwrap();
        assert_eq!(reply.responder_id(), 1);
        assert_eq!(reply.can_id(), 0x0000_0ff4);
        assert_eq!(reply.payload, vec![0xaa]);

        bus.write(&Frame::activate(0x07E8, 16).to_bytes()).unwrap();
        assert!(bus.read_until_idle(SHORT).unwrap().is_empty());
    }

    #[test]
    fn test_slow_reply_becomes_late() {
        let mut bus =
            SimulatedBus::new(vec![SimDevice::new(3, vec![0x01]).with_latency(Duration::from_millis(80))]);

        bus.write(&Frame::activate(0x07E8, 3).to_bytes()).unwrap();
        assert!(bus.read_until_idle(SHORT).unwrap().is_empty());

        // A passive read collects it
        let late = bus.read_until_idle(SHORT).unwrap();
        assert_eq!(decode_reply(&late).unwrap().responder_id(), 3);

        bus.write(&Frame::activate(0x07E8, 3).to_bytes()).unwrap();
        assert!(bus.read_until_idle(SHORT).unwrap().is_empty());
        bus.clear_input().unwrap();
        assert!(bus.read_until_idle(SHORT).unwrap().is_empty());
    }

    #[test]
    fn test_demo_replies_match_captures() {
        let mut bus = SimulatedBus::demo();

        bus.write(&Frame::activate(0x07E8, 75).to_bytes()).unwrap();
        assert!(bus.read_until_idle(SHORT).unwrap().is_empty());
        let late = bus.read_until_idle(SHORT).unwrap();
        assert_eq!(hex::encode(&late), "415400004ff408c94230209c23370d0d0a");

        bus.write(&Frame::load_parameters(0x07E8, 20).to_bytes()).unwrap();
        let reply = bus.read_until_idle(SHORT).unwrap();
        assert_eq!(hex::encode(&reply), "4154100017ec0800c4560003010b070d0a");
    }

    #[test]
    fn test_motion_state_follows_frames() {
        let mut bus = SimulatedBus::new(vec![SimDevice::new(5, vec![0x01])]);

        // Ignored while disabled
        bus.write(&Frame::jog(0x07E8, 5, true, 500).to_bytes()).unwrap();
        assert!(!bus.device(5).unwrap().is_running());

        bus.write(&Frame::activate(0x07E8, 5).to_bytes()).unwrap();
        bus.write(&Frame::jog(0x07E8, 5, true, 500).to_bytes()).unwrap();
        let device = bus.device(5).unwrap();
        assert!(device.is_enabled());
        assert!(device.is_running());
        assert_eq!(device.speed_raw(), 500);

        bus.write(&Frame::deactivate(0x07E8, 5).to_bytes()).unwrap();
        let device = bus.device(5).unwrap();
        assert!(!device.is_enabled());
        assert!(!device.is_running());
        assert_eq!(bus.sent_frames().len(), 4);
    }

    #[test]
    fn test_respond_limit() {
        let mut bus = SimulatedBus::new(vec![SimDevice::new(2, vec![0x01]).respond_limit(1)]);

        bus.write(&Frame::activate(0x07E8, 2).to_bytes()).unwrap();
        assert!(!bus.read_until_idle(SHORT).unwrap().is_empty());
        bus.write(&Frame::activate(0x07E8, 2).to_bytes()).unwrap();
        assert!(bus.read_until_idle(SHORT).unwrap().is_empty());
    }

    #[test]
    fn test_closed_bus_rejects_io() {
        let mut bus = SimulatedBus::new(vec![]);
        bus.close().unwrap();
        assert!(matches!(bus.write(b"AT+AT\r\n"), Err(IoError::Closed)));
    }
}
