/*!
# RobStride L91 Client

Discovery and velocity control for RobStride servo actuators reached through
an L91 serial-to-CAN adapter speaking the AT-command framing.

## Core Types

- [`Frame`] - One AT-command wire frame
- [`MotorLink`] - Request/response exchanges with bounded retry
- [`ArbitrationAwareScanner`] - Two-pass discovery with signature grouping
- [`MotorRegistry`] - Physical motors and the identifiers they answer to
- [`VelocityController`] - Jog dispatch and the stop/disable contract

## Modules

- [`frame`] - Frame encoding and decoding
- [`transport`] - Byte transport trait and the serial implementation
- [`link`] - Single exchanges against a transport
- [`scanner`] - Identifier enumeration and grouping
- [`registry`] - Motor address book
- [`velocity`] - Speed encoding and motion control
- [`sim`] - Simulated bus for tests and dry runs
- [`error`] - Error taxonomy
*/

pub mod error;
pub mod frame;
pub mod link;
pub mod registry;
pub mod scanner;
pub mod sim;
pub mod transport;
pub mod velocity;

// Re-export commonly used types
pub use error::{
    BusError, ControlError, ControlStep, DecodeError, IoError, LinkError, RegistryError, Result,
    ScanError,
};
pub use frame::{decode, decode_reply, decode_stream, encode, reply_can_id, CommandFamily, Frame};
pub use link::{LinkConfig, MotorLink};
pub use registry::{MotorRegistry, MotorState, PhysicalMotor, ResponseSignature};
pub use scanner::{ArbitrationAwareScanner, PassOrder, ScanConfig};
pub use sim::{SimDevice, SimulatedBus};
pub use transport::{SerialTransport, Transport};
pub use velocity::{
    decode_speed, encode_speed, ControlConfig, Direction, MotionState, VelocityCommand,
    VelocityController,
};

/// Version information for the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol constants
pub mod protocol {
    /// ASCII "AT" that opens every frame
    pub const PREAMBLE: [u8; 2] = *b"AT";

    /// CRLF that closes every frame
    pub const TERMINATOR: [u8; 2] = *b"\r\n";

    /// Adapter address used by the stock L91 firmware
    pub const DEFAULT_ADAPTER_ADDRESS: u16 = 0x07E8;

    /// Documented working baud rate of the adapter
    pub const DEFAULT_BAUD_RATE: u32 = 921_600;

    /// Preamble + command + address + id + terminator
    pub const MIN_FRAME_LEN: usize = 8;

    /// Offset of the first body byte
    pub const BODY_OFFSET: usize = 6;

    /// Largest CAN data field
    pub const MAX_PAYLOAD: usize = 8;

    /// The 29-bit extended id sits above three flag bits in a reply's id field
    pub const REPLY_ID_SHIFT: u32 = 3;

    /// IDE bit set in the id field of every extended reply
    pub const REPLY_EXTENDED_FLAG: u32 = 0x04;

    /// Command byte of Activate and Deactivate
    pub const CMD_ENABLE: u8 = 0x00;

    /// Command byte of parameter loads and reads
    pub const CMD_PARAMETER: u8 = 0x20;

    /// Command byte of velocity (jog) frames
    pub const CMD_JOG: u8 = 0x90;

    /// Parameter index loaded during bring-up
    pub const LOAD_PARAMETERS_INDEX: u16 = 0x00C4;

    /// Register 0x0570 written by jog frames, high byte sent first
    pub const JOG_REGISTER: [u8; 2] = [0x05, 0x70];

    /// Run-mode value selecting jog
    pub const JOG_MODE: u8 = 0x07;

    /// Adapter probe sent before any motor traffic
    pub const ADAPTER_PROBE: &[u8] = b"AT+AT\r\n";

    /// Jog speed units per RPM (hundredths)
    pub const SPEED_SCALE: f32 = 100.0;

    /// Default clamp for jog speed in RPM
    pub const DEFAULT_MAX_SPEED_RPM: f32 = 300.0;

    /// Largest speed representable on the wire in RPM
    pub const WIRE_MAX_SPEED_RPM: f32 = i16::MAX as f32 / SPEED_SCALE;
}
