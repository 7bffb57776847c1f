/*!
Error taxonomy for the L91 motor client.

Every layer has its own error type so callers can tell a dead serial device
from a silent motor from an ambiguous scan. [`BusError`] collects them for
callers that only want one type.
*/

use std::fmt;
use std::io;

use thiserror::Error;

use crate::registry::MotorRegistry;

/// Common result type used throughout the library
pub type Result<T> = std::result::Result<T, BusError>;

/// Transport open/read/write failures. Never retried by the library.
#[derive(Error, Debug)]
pub enum IoError {
    #[error("failed to open {path} at {baud} baud: {source}")]
    Open {
        path: String,
        baud: u32,
        #[source]
        source: serialport::Error,
    },

    #[error("serial read failed: {0}")]
    Read(#[source] io::Error),

    #[error("serial write failed: {0}")]
    Write(#[source] io::Error),

    #[error("transport is closed")]
    Closed,
}

/// Malformed bytes on the wire
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame truncated: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("missing CRLF terminator at offset {offset}")]
    BadTerminator { offset: usize },

    #[error("frame does not start with AT preamble")]
    BadPreamble,

    #[error("length byte {0} exceeds the 8 byte CAN payload")]
    Oversized(u8),
}

/// Failures of a single request/response exchange
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("no usable response from id {target_id} after {attempts} attempt(s){}", decode_suffix(.last_decode))]
    NoResponse {
        target_id: u8,
        attempts: u32,
        last_decode: Option<DecodeError>,
    },

    #[error(transparent)]
    Io(#[from] IoError),
}

impl LinkError {
    /// True when the transport itself failed, as opposed to a silent device
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

/// Discovery failures
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("invalid scan range [{lo}, {hi}]")]
    InvalidRange { lo: u8, hi: u8 },

    #[error("scan unstable across {} runs: {}", .observed.len(), describe_runs(.observed))]
    Unstable { observed: Vec<MotorRegistry> },

    #[error("scan produced an inconsistent registry: {0}")]
    Inconsistent(#[from] RegistryError),

    #[error(transparent)]
    Io(#[from] IoError),
}

fn decode_suffix(last: &Option<DecodeError>) -> String {
    match last {
        Some(e) => format!(" (last decode error: {e})"),
        None => String::new(),
    }
}

fn describe_runs(observed: &[MotorRegistry]) -> String {
    observed
        .iter()
        .enumerate()
        .map(|(run, registry)| format!("run {}: {}", run + 1, registry.describe_groups()))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Partition violations found by [`MotorRegistry::validate`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("motor {canonical_id} has no member ids")]
    EmptyGroup { canonical_id: u8 },

    #[error("canonical id {canonical_id} is not one of its members")]
    CanonicalNotMember { canonical_id: u8 },

    #[error("canonical id {canonical_id} is not the lowest member (lowest is {lowest})")]
    CanonicalNotLowest { canonical_id: u8, lowest: u8 },

    #[error("registry key {key} does not match motor canonical id {canonical_id}")]
    KeyMismatch { key: u8, canonical_id: u8 },

    #[error("id {member} claimed by both motor {first} and motor {second}")]
    Overlap { member: u8, first: u8, second: u8 },
}

/// Step of a control sequence, reported with every [`ControlError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlStep {
    Activate,
    LoadParameters,
    Jog,
    /// The zero-speed, flag-cleared Jog that opens a stop
    Halt,
    Deactivate,
}

impl fmt::Display for ControlStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Activate => "activate",
            Self::LoadParameters => "load-parameters",
            Self::Jog => "jog",
            Self::Halt => "halt",
            Self::Deactivate => "deactivate",
        };
        f.write_str(name)
    }
}

/// Failed jog, stop or emergency stop
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("motor {canonical_id}: {step} failed: {source}")]
    Step {
        canonical_id: u8,
        step: ControlStep,
        #[source]
        source: LinkError,
    },

    #[error("STOP FAILED for motor {canonical_id}: halt {}, deactivate {}", outcome(.halt), outcome(.deactivate))]
    StopFailed {
        canonical_id: u8,
        halt: Option<LinkError>,
        deactivate: Option<LinkError>,
    },

    #[error("EMERGENCY STOP incomplete: {} of {attempted} motor(s) failed: {}", .failures.len(), join_errors(.failures))]
    EmergencyStop {
        attempted: usize,
        failures: Vec<ControlError>,
    },

    #[error("speed {0} is not a finite number")]
    InvalidSpeed(f32),
}

fn join_errors(failures: &[ControlError]) -> String {
    failures
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn outcome(result: &Option<LinkError>) -> String {
    match result {
        Some(e) => format!("failed ({e})"),
        None => "ok".to_string(),
    }
}

impl ControlError {
    /// Which sub-step failed, if the error concerns a single step
    pub fn step(&self) -> Option<ControlStep> {
        match self {
            Self::Step { step, .. } => Some(*step),
            Self::StopFailed { deactivate: Some(_), .. } => Some(ControlStep::Deactivate),
            Self::StopFailed { halt: Some(_), .. } => Some(ControlStep::Halt),
            _ => None,
        }
    }

    /// True for failures of the stop path, which are safety relevant
    pub fn is_stop_failure(&self) -> bool {
        matches!(self, Self::StopFailed { .. } | Self::EmergencyStop { .. })
    }
}

/// Umbrella error for callers that mix discovery, control and persistence
#[derive(Error, Debug)]
pub enum BusError {
    #[error(transparent)]
    Io(#[from] IoError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error("invalid registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("registry file error: {0}")]
    File(#[from] io::Error),

    #[error("registry serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
