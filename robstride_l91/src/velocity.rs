/*!
Jog speed encoding and the motor control state machine.

Speeds travel as a signed 16-bit value in hundredths of an RPM, big-endian,
in plain two's complement. Values are clamped to the configured limit before
encoding so an out-of-range request can never wrap around.

A motor moves through

```text
Discovered -> Activated -> { Jogging <-> Stopped } -> Deactivated
```

and a jog from `Discovered` or `Deactivated` brings the motor up first
(Activate, LoadParameters). Every stop is a zero-speed halt jog followed by
Deactivate, and Deactivate is sent even when the halt failed.
*/

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::error::{ControlError, ControlStep, LinkError};
use crate::frame::Frame;
use crate::link::MotorLink;
use crate::protocol::{DEFAULT_MAX_SPEED_RPM, SPEED_SCALE, WIRE_MAX_SPEED_RPM};
use crate::registry::MotorRegistry;
use crate::transport::Transport;

/// Encode `rpm` with the default ±300 RPM clamp
pub fn encode_speed(rpm: f32) -> i16 {
    encode_speed_with_limit(rpm, DEFAULT_MAX_SPEED_RPM)
}

/// Clamp `rpm` to `±limit` (never beyond the wire range) and encode it.
/// NaN encodes as zero.
pub fn encode_speed_with_limit(rpm: f32, limit: f32) -> i16 {
    let limit = limit.abs().min(WIRE_MAX_SPEED_RPM);
    let clamped = rpm.clamp(-limit, limit);
    (clamped * SPEED_SCALE).round() as i16
}

/// Wire value back to RPM
pub fn decode_speed(raw: i16) -> f32 {
    raw as f32 / SPEED_SCALE
}

/// Rotation direction of a jog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

impl Direction {
    pub fn sign(self) -> f32 {
        match self {
            Self::Forward => 1.0,
            Self::Reverse => -1.0,
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "forward" | "fwd" | "f" | "+" => Ok(Self::Forward),
            "reverse" | "rev" | "r" | "-" => Ok(Self::Reverse),
            other => Err(format!("unknown direction '{}' (expected forward or reverse)", other)),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forward => f.write_str("forward"),
            Self::Reverse => f.write_str("reverse"),
        }
    }
}

/// One encoded jog request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VelocityCommand {
    pub target_id: u8,
    pub speed_raw: i16,
    /// Run flag; cleared for a halt
    pub run: bool,
}

impl VelocityCommand {
    /// Jog at `|speed_rpm|` in `direction`, clamped to `max_speed_rpm`
    pub fn new(
        target_id: u8,
        speed_rpm: f32,
        direction: Direction,
        max_speed_rpm: f32,
    ) -> Result<Self, ControlError> {
        if !speed_rpm.is_finite() {
            return Err(ControlError::InvalidSpeed(speed_rpm));
        }

        let signed = speed_rpm.abs() * direction.sign();
        let speed_raw = encode_speed_with_limit(signed, max_speed_rpm);
        let applied = decode_speed(speed_raw);
        if (applied - signed).abs() > 1.0 / SPEED_SCALE {
            warn!("Speed {:.2} RPM clamped to {:.2} RPM", signed, applied);
        }

        Ok(Self {
            target_id,
            speed_raw,
            run: true,
        })
    }

    /// Zero speed with the run flag cleared
    pub fn halt(target_id: u8) -> Self {
        Self {
            target_id,
            speed_raw: 0,
            run: false,
        }
    }

    pub fn speed_rpm(&self) -> f32 {
        decode_speed(self.speed_raw)
    }

    pub fn to_frame(&self, adapter_address: u16) -> Frame {
        Frame::jog(adapter_address, self.target_id, self.run, self.speed_raw)
    }
}

/// Control state of one motor as tracked by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MotionState {
    #[default]
    Discovered,
    Activated,
    Jogging,
    Stopped,
    Deactivated,
}

impl MotionState {
    /// Check if a jog from here needs Activate + LoadParameters first
    pub fn needs_bring_up(self) -> bool {
        matches!(self, Self::Discovered | Self::Deactivated)
    }
}

/// Control tuning
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlConfig {
    /// Jog speeds are clamped to ±this
    pub max_speed_rpm: f32,
    /// Read window of every control exchange
    pub exchange_timeout: Duration,
    /// Pause after Activate and after LoadParameters
    pub bring_up_settle: Duration,
    /// Wait for a reply to jog frames instead of fire-and-forget
    pub require_jog_ack: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            max_speed_rpm: DEFAULT_MAX_SPEED_RPM,
            exchange_timeout: Duration::from_millis(200),
            bring_up_settle: Duration::from_millis(200),
            require_jog_ack: false,
        }
    }
}

/// Longest uninterrupted sleep while a motor is moving
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Drives motors addressed by canonical id over one link
pub struct VelocityController<T: Transport> {
    link: MotorLink<T>,
    config: ControlConfig,
    states: BTreeMap<u8, MotionState>,
    running: Arc<AtomicBool>,
}

impl<T: Transport> VelocityController<T> {
    pub fn new(link: MotorLink<T>, config: ControlConfig) -> Self {
        Self {
            link,
            config,
            states: BTreeMap::new(),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Share a run flag, e.g. with a Ctrl+C handler. Once it is cleared,
    /// timed jogs and pulses cut their wait short and stop the motor.
    pub fn with_run_flag(mut self, running: Arc<AtomicBool>) -> Self {
        self.running = running;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    /// Tracked state; motors never addressed are `Discovered`
    pub fn state(&self, canonical_id: u8) -> MotionState {
        self.states.get(&canonical_id).copied().unwrap_or_default()
    }

    pub fn link(&self) -> &MotorLink<T> {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut MotorLink<T> {
        &mut self.link
    }

    pub fn into_link(self) -> MotorLink<T> {
        self.link
    }

    /// Activate + LoadParameters
    pub fn bring_up(&mut self, canonical_id: u8) -> Result<(), ControlError> {
        let timeout = self.config.exchange_timeout;

        self.link
            .activate(canonical_id, timeout)
            .map_err(|source| step_error(canonical_id, ControlStep::Activate, source))?;
        self.settle();

        self.link
            .load_parameters(canonical_id, timeout)
            .map_err(|source| step_error(canonical_id, ControlStep::LoadParameters, source))?;
        self.settle();

        self.states.insert(canonical_id, MotionState::Activated);
        info!("Motor {} activated", canonical_id);
        Ok(())
    }

    /// Bring the motor up if needed and leave it jogging.
    ///
    /// On failure a best-effort stop is attempted and the original error is
    /// returned.
    pub fn start_jog(
        &mut self,
        canonical_id: u8,
        speed_rpm: f32,
        direction: Direction,
    ) -> Result<VelocityCommand, ControlError> {
        let command = VelocityCommand::new(canonical_id, speed_rpm, direction, self.config.max_speed_rpm)?;

        let started = self.try_start(&command);
        if let Err(e) = started {
            warn!("Motor {}: {}; stopping", canonical_id, e);
            if let Err(stop_err) = self.stop(canonical_id) {
                error!("{}", stop_err);
            }
            return Err(e);
        }

        info!(
            "Motor {} jogging at {:.2} RPM ({})",
            canonical_id,
            command.speed_rpm(),
            direction
        );
        Ok(command)
    }

    fn try_start(&mut self, command: &VelocityCommand) -> Result<(), ControlError> {
        let canonical_id = command.target_id;
        if self.state(canonical_id).needs_bring_up() {
            debug!("Motor {} needs bring-up before jogging", canonical_id);
            self.bring_up(canonical_id)?;
        }

        self.dispatch(command)
            .map_err(|source| step_error(canonical_id, ControlStep::Jog, source))?;
        self.states.insert(canonical_id, MotionState::Jogging);
        Ok(())
    }

    /// Jog for `duration`, then stop
    pub fn jog(
        &mut self,
        canonical_id: u8,
        speed_rpm: f32,
        direction: Direction,
        duration: Duration,
    ) -> Result<(), ControlError> {
        self.start_jog(canonical_id, speed_rpm, direction)?;
        if !self.wait(duration) {
            warn!("Motor {} jog interrupted", canonical_id);
        }
        self.stop(canonical_id)
    }

    /// Zero-speed halt that keeps the motor enabled
    pub fn halt(&mut self, canonical_id: u8) -> Result<(), ControlError> {
        self.dispatch(&VelocityCommand::halt(canonical_id))
            .map_err(|source| step_error(canonical_id, ControlStep::Halt, source))?;
        self.states.insert(canonical_id, MotionState::Stopped);
        Ok(())
    }

    /// Halt jog followed by Deactivate, whatever the tracked state.
    /// Deactivate is attempted even if the halt failed.
    pub fn stop(&mut self, canonical_id: u8) -> Result<(), ControlError> {
        let halt = self.dispatch(&VelocityCommand::halt(canonical_id)).err();
        let deactivate = self
            .link
            .deactivate(canonical_id, self.config.exchange_timeout)
            .err();

        let state = match (&halt, &deactivate) {
            (_, None) => MotionState::Deactivated,
            (None, Some(_)) => MotionState::Stopped,
            (Some(_), Some(_)) => self.state(canonical_id),
        };
        self.states.insert(canonical_id, state);

        if halt.is_none() && deactivate.is_none() {
            info!("Motor {} stopped and deactivated", canonical_id);
            return Ok(());
        }

        let err = ControlError::StopFailed {
            canonical_id,
            halt,
            deactivate,
        };
        error!("{}", err);
        Err(err)
    }

    /// Stop every motor of `registry`, continuing past failures
    pub fn emergency_stop_all(&mut self, registry: &MotorRegistry) -> Result<(), ControlError> {
        let ids = registry.canonical_ids();
        warn!("Emergency stop of {} motor(s)", ids.len());

        let failures: Vec<ControlError> = ids
            .iter()
            .filter_map(|&canonical_id| self.stop(canonical_id).err())
            .collect();

        if failures.is_empty() {
            info!("Emergency stop complete");
            return Ok(());
        }

        let err = ControlError::EmergencyStop {
            attempted: ids.len(),
            failures,
        };
        error!("{}", err);
        Err(err)
    }

    /// Jog briefly `pulses` times so the motor can be spotted, then stop
    pub fn pulse(
        &mut self,
        canonical_id: u8,
        pulses: u32,
        on: Duration,
        off: Duration,
        speed_rpm: f32,
    ) -> Result<(), ControlError> {
        info!("Pulsing motor {} {} time(s)", canonical_id, pulses);

        for pulse in 0..pulses {
            if !self.is_running() {
                warn!("Motor {} pulsing interrupted after {} pulse(s)", canonical_id, pulse);
                break;
            }
            self.start_jog(canonical_id, speed_rpm, Direction::Forward)?;
            let completed = self.wait(on);
            if let Err(e) = self.halt(canonical_id) {
                if let Err(stop_err) = self.stop(canonical_id) {
                    error!("{}", stop_err);
                }
                return Err(e);
            }
            if completed {
                self.wait(off);
            }
        }

        self.stop(canonical_id)
    }

    /// Sleep up to `duration` in short slices; false if the run flag was
    /// cleared first
    fn wait(&self, duration: Duration) -> bool {
        // None: too far out to represent, wait for the flag alone
        let deadline = Instant::now().checked_add(duration);
        loop {
            if !self.is_running() {
                return false;
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return true;
                    }
                    (deadline - now).min(WAIT_SLICE)
                }
                None => WAIT_SLICE,
            };
            thread::sleep(slice);
        }
    }

    fn dispatch(&mut self, command: &VelocityCommand) -> Result<(), LinkError> {
        let frame = command.to_frame(self.link.adapter_address());
        if self.config.require_jog_ack {
            self.link.exchange_frame(&frame, self.config.exchange_timeout)?;
        } else {
            self.link.send(&frame)?;
        }
        Ok(())
    }

    fn settle(&self) {
        if !self.config.bring_up_settle.is_zero() {
            thread::sleep(self.config.bring_up_settle);
        }
    }
}

fn step_error(canonical_id: u8, step: ControlStep, source: LinkError) -> ControlError {
    ControlError::Step {
        canonical_id,
        step,
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::CommandFamily;
    use crate::link::LinkConfig;
    use crate::registry::{MotorState, PhysicalMotor, ResponseSignature};
    use crate::sim::{SimDevice, SimulatedBus};

    fn controller(devices: Vec<SimDevice>, require_jog_ack: bool) -> VelocityController<SimulatedBus> {
        let link = MotorLink::with_config(
            SimulatedBus::new(devices),
            LinkConfig {
                retry_delay: Duration::ZERO,
                ..LinkConfig::default()
            },
        );
        VelocityController::new(
            link,
            ControlConfig {
                bring_up_settle: Duration::ZERO,
                require_jog_ack,
                ..ControlConfig::default()
            },
        )
    }

    fn sent(controller: &VelocityController<SimulatedBus>) -> Vec<Frame> {
        controller.link().transport().sent_frames().to_vec()
    }

    fn clear_sent(controller: &mut VelocityController<SimulatedBus>) {
        controller.link_mut().transport_mut().clear_sent();
    }

    fn registry(ids: &[u8]) -> MotorRegistry {
        MotorRegistry::from_motors(ids.iter().map(|&id| {
            PhysicalMotor::from_members(
                [id].into_iter().collect(),
                ResponseSignature::from_bytes(vec![id]),
                MotorState::Activated,
            )
            .unwrap()
        }))
        .unwrap()
    }

    #[test]
    fn test_speed_is_twos_complement() {
        let forward = encode_speed(10.0);
        let reverse = encode_speed(-10.0);

        assert_eq!(forward, 1000);
        assert_eq!(reverse, -1000);
        assert_eq!(reverse as u16, 0xFC18);
        assert_eq!(reverse, forward.wrapping_neg());
        assert_eq!(reverse.to_be_bytes(), [0xFC, 0x18]);
        assert!((decode_speed(reverse) + 10.0).abs() < 0.01);
    }

    #[test]
    fn test_speed_quantization_and_symmetry() {
        for step in -3000..=3000 {
            let rpm = step as f32 * 0.1 + 0.003;
            let raw = encode_speed(rpm);
            assert!(
                (decode_speed(raw) - rpm).abs() <= 0.5 / SPEED_SCALE + 1e-3,
                "rpm {rpm} encoded as {raw}"
            );
            assert_eq!(encode_speed(-rpm), -raw);
        }
    }

    #[test]
    fn test_speed_clamping() {
        assert_eq!(encode_speed(1000.0), 30000);
        assert_eq!(encode_speed(-1000.0), -30000);
        assert_eq!(encode_speed_with_limit(1000.0, 1000.0), i16::MAX);
        assert_eq!(encode_speed_with_limit(-1000.0, 1000.0), -i16::MAX);
        assert_eq!(encode_speed_with_limit(50.0, 20.0), 2000);
    }

    #[test]
    fn test_velocity_command() {
        let cmd = VelocityCommand::new(3, 12.5, Direction::Reverse, 300.0).unwrap();
        assert_eq!(cmd.speed_raw, -1250);
        assert!(cmd.run);
        assert_eq!(cmd.to_frame(0x07E8).jog_speed_raw(), Some(-1250));

        // Direction wins over the sign of the speed
        let cmd = VelocityCommand::new(3, -12.5, Direction::Forward, 300.0).unwrap();
        assert_eq!(cmd.speed_raw, 1250);

        assert!(VelocityCommand::halt(3).to_frame(0x07E8).is_halt());
        assert!(matches!(
            VelocityCommand::new(3, f32::NAN, Direction::Forward, 300.0),
            Err(ControlError::InvalidSpeed(_))
        ));
    }

    #[test]
    fn test_direction_parsing() {
        assert_eq!("forward".parse::<Direction>().unwrap(), Direction::Forward);
        assert_eq!("REV".parse::<Direction>().unwrap(), Direction::Reverse);
        assert!("sideways".parse::<Direction>().is_err());
    }

    #[test]
    fn test_jog_from_discovered_brings_up_first() {
        let mut ctl = controller(vec![SimDevice::new(5, vec![0x01])], false);

        ctl.start_jog(5, 10.0, Direction::Forward).unwrap();
        assert_eq!(ctl.state(5), MotionState::Jogging);

        let frames = sent(&ctl);
        assert_eq!(frames.len(), 3);
        assert!(frames[0].is_activate());
        assert_eq!(frames[1].family(), CommandFamily::Parameter);
        assert_eq!(frames[2].jog_speed_raw(), Some(1000));
        assert_eq!(ctl.link().transport().device(5).unwrap().speed_raw(), 1000);
    }

    #[test]
    fn test_jog_from_deactivated_brings_up_again() {
        let mut ctl = controller(vec![SimDevice::new(5, vec![0x01])], false);
        ctl.start_jog(5, 10.0, Direction::Forward).unwrap();
        ctl.stop(5).unwrap();
        assert_eq!(ctl.state(5), MotionState::Deactivated);

        clear_sent(&mut ctl);
        ctl.start_jog(5, 10.0, Direction::Reverse).unwrap();
        let frames = sent(&ctl);
        assert!(frames[0].is_activate());
        assert_eq!(frames[2].jog_speed_raw(), Some(-1000));
    }

    #[test]
    fn test_jog_from_stopped_skips_bring_up() {
        let mut ctl = controller(vec![SimDevice::new(5, vec![0x01])], false);
        ctl.start_jog(5, 10.0, Direction::Forward).unwrap();
        ctl.halt(5).unwrap();
        assert_eq!(ctl.state(5), MotionState::Stopped);

        clear_sent(&mut ctl);
        ctl.start_jog(5, 10.0, Direction::Forward).unwrap();
        let frames = sent(&ctl);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].family(), CommandFamily::Jog);
    }

    #[test]
    fn test_stop_halts_before_disabling_from_every_state() {
        type Ctl = VelocityController<SimulatedBus>;
        let prepare: [fn(&mut Ctl); 5] = [
            |_: &mut Ctl| {},
            |c: &mut Ctl| c.bring_up(5).unwrap(),
            |c: &mut Ctl| {
                c.start_jog(5, 30.0, Direction::Forward).unwrap();
            },
            |c: &mut Ctl| {
                c.start_jog(5, 30.0, Direction::Forward).unwrap();
                c.halt(5).unwrap();
            },
            |c: &mut Ctl| {
                c.start_jog(5, 30.0, Direction::Forward).unwrap();
                c.stop(5).unwrap();
            },
        ];

        for (case, setup) in prepare.iter().enumerate() {
            for require_jog_ack in [false, true] {
                let mut ctl = controller(vec![SimDevice::new(5, vec![0x01])], require_jog_ack);
                setup(&mut ctl);
                clear_sent(&mut ctl);

                ctl.stop(5).unwrap();

                let frames = sent(&ctl);
                assert_eq!(frames.len(), 2, "case {case}");
                assert!(frames[0].is_halt(), "case {case}");
                assert!(frames[1].is_deactivate(), "case {case}");
                assert_eq!(ctl.state(5), MotionState::Deactivated);
                assert!(!ctl.link().transport().device(5).unwrap().is_running());
            }
        }
    }

    #[test]
    fn test_stop_still_deactivates_when_halt_fails() {
        let mut ctl = controller(vec![SimDevice::new(5, vec![0x01]).silent_to_motion()], true);
        ctl.bring_up(5).unwrap();
        clear_sent(&mut ctl);

        let err = ctl.stop(5).unwrap_err();
        match &err {
            ControlError::StopFailed {
                canonical_id,
                halt,
                deactivate,
            } => {
                assert_eq!(*canonical_id, 5);
                assert!(halt.is_some());
                assert!(deactivate.is_none());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.is_stop_failure());
        assert_eq!(err.step(), Some(ControlStep::Halt));

        let frames = sent(&ctl);
        assert!(frames.last().unwrap().is_deactivate());
        assert!(!ctl.link().transport().device(5).unwrap().is_enabled());
    }

    #[test]
    fn test_failed_jog_reports_jog_step_and_stops() {
        let mut ctl = controller(vec![SimDevice::new(5, vec![0x01]).silent_to_motion()], true);

        let err = ctl.start_jog(5, 10.0, Direction::Forward).unwrap_err();
        assert_eq!(err.step(), Some(ControlStep::Jog));
        assert!(!err.is_stop_failure());
        assert!(sent(&ctl).last().unwrap().is_deactivate());
    }

    #[test]
    fn test_missing_motor_fails_at_activate() {
        let mut ctl = controller(vec![], false);
        let err = ctl.start_jog(7, 10.0, Direction::Forward).unwrap_err();
        assert_eq!(err.step(), Some(ControlStep::Activate));
        assert!(sent(&ctl).iter().all(|f| f.jog_flag() != Some(true)));
    }

    #[test]
    fn test_nan_speed_sends_nothing() {
        let mut ctl = controller(vec![SimDevice::new(5, vec![0x01])], false);
        assert!(matches!(
            ctl.start_jog(5, f32::NAN, Direction::Forward),
            Err(ControlError::InvalidSpeed(_))
        ));
        assert!(sent(&ctl).is_empty());
    }

    #[test]
    fn test_timed_jog_ends_stopped() {
        let mut ctl = controller(vec![SimDevice::new(5, vec![0x01])], false);
        ctl.jog(5, 20.0, Direction::Reverse, Duration::from_millis(1)).unwrap();

        let frames = sent(&ctl);
        let n = frames.len();
        assert_eq!(frames[n - 3].jog_speed_raw(), Some(-2000));
        assert!(frames[n - 2].is_halt());
        assert!(frames[n - 1].is_deactivate());
    }

    #[test]
    fn test_cleared_run_flag_cuts_jog_short() {
        let running = Arc::new(AtomicBool::new(true));
        let mut ctl = controller(vec![SimDevice::new(5, vec![0x01])], false).with_run_flag(running.clone());

        let interrupter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            running.store(false, Ordering::SeqCst);
        });
        let started = Instant::now();
        ctl.jog(5, 20.0, Direction::Forward, Duration::from_secs(60)).unwrap();
        interrupter.join().unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        let frames = sent(&ctl);
        assert!(frames[frames.len() - 2].is_halt());
        assert!(frames[frames.len() - 1].is_deactivate());
        assert_eq!(ctl.state(5), MotionState::Deactivated);
        assert!(!ctl.link().transport().device(5).unwrap().is_running());
    }

    #[test]
    fn test_cleared_run_flag_ends_pulsing_with_stop() {
        let running = Arc::new(AtomicBool::new(false));
        let mut ctl = controller(vec![SimDevice::new(5, vec![0x01])], false).with_run_flag(running);

        let started = Instant::now();
        ctl.pulse(5, 5, Duration::from_secs(30), Duration::from_secs(30), 5.0).unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));

        let frames = sent(&ctl);
        assert_eq!(frames.iter().filter(|f| f.jog_flag() == Some(true)).count(), 0);
        assert!(frames[frames.len() - 2].is_halt());
        assert!(frames[frames.len() - 1].is_deactivate());
    }

    #[test]
    fn test_pulse_interrupted_mid_pulse_still_stops() {
        let running = Arc::new(AtomicBool::new(true));
        let mut ctl = controller(vec![SimDevice::new(5, vec![0x01])], false).with_run_flag(running.clone());

        let interrupter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            running.store(false, Ordering::SeqCst);
        });
        ctl.pulse(5, 3, Duration::from_secs(30), Duration::from_secs(30), 5.0).unwrap();
        interrupter.join().unwrap();

        let frames = sent(&ctl);
        assert_eq!(frames.iter().filter(|f| f.jog_flag() == Some(true)).count(), 1);
        assert!(frames[frames.len() - 1].is_deactivate());
        assert_eq!(ctl.state(5), MotionState::Deactivated);
    }

    #[test]
    fn test_emergency_stop_continues_past_failures() {
        let mut ctl = controller(vec![SimDevice::new(5, vec![0x01]), SimDevice::new(12, vec![0x02])], false);
        ctl.start_jog(5, 10.0, Direction::Forward).unwrap();
        ctl.start_jog(12, 10.0, Direction::Forward).unwrap();

        let err = ctl.emergency_stop_all(&registry(&[5, 9, 12])).unwrap_err();
        match &err {
            ControlError::EmergencyStop { attempted, failures } => {
                assert_eq!(*attempted, 3);
                assert_eq!(failures.len(), 1);
                assert!(matches!(
                    failures[0],
                    ControlError::StopFailed {
                        canonical_id: 9,
                        halt: None,
                        deactivate: Some(_)
                    }
                ));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.is_stop_failure());

        let bus = ctl.link().transport();
        assert!(!bus.device(5).unwrap().is_enabled());
        assert!(!bus.device(12).unwrap().is_enabled());
        assert!(sent(&ctl).last().unwrap().is_deactivate());
        assert_eq!(sent(&ctl).last().unwrap().target_id, 12);
    }

    #[test]
    fn test_emergency_stop_all_ok() {
        let mut ctl = controller(vec![SimDevice::new(5, vec![0x01])], false);
        ctl.emergency_stop_all(&registry(&[5])).unwrap();
        ctl.emergency_stop_all(&MotorRegistry::new()).unwrap();
    }

    #[test]
    fn test_pulse_ends_with_stop() {
        let mut ctl = controller(vec![SimDevice::new(5, vec![0x01])], false);
        ctl.pulse(5, 2, Duration::ZERO, Duration::ZERO, 5.0).unwrap();

        let frames = sent(&ctl);
        let jogs = frames.iter().filter(|f| f.jog_flag() == Some(true)).count();
        assert_eq!(jogs, 2);
        assert!(frames[frames.len() - 2].is_halt());
        assert!(frames[frames.len() - 1].is_deactivate());
        assert_eq!(ctl.state(5), MotionState::Deactivated);
    }
}
