/*!
L91 AT-command frame encoding and decoding.

Requests written to the adapter have the shape

```text
'A' 'T' | command | adapter address (u16 BE) | target id | body | '\r' '\n'
```

Replies read back from it carry the sender's CAN id instead:

```text
'A' 'T' | CAN id field (u32 BE) | length | data | '\r' '\n'
```

The id field is the 29-bit extended id shifted up by three with the IDE bit
set, e.g. `00 00 0f f4` for motor 1. Both shapes share the four header bytes,
so a decoded [`Frame`] keeps them in `command`, `adapter_address` and
`target_id`, and [`Frame::can_id`] reads them back as a reply id.

Enable requests carry a fixed two byte body. Everything else, replies
included, carries a length byte and up to eight data bytes. Data is taken by
length, so a `0D` inside it is not mistaken for the terminator. Decoding only
checks framing; what the payload means is up to the caller.
*/

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;
use crate::protocol::{
    BODY_OFFSET, CMD_ENABLE, CMD_JOG, CMD_PARAMETER, DEFAULT_ADAPTER_ADDRESS, JOG_MODE,
    JOG_REGISTER, LOAD_PARAMETERS_INDEX, MAX_PAYLOAD, MIN_FRAME_LEN, PREAMBLE, REPLY_EXTENDED_FLAG,
    REPLY_ID_SHIFT, TERMINATOR,
};

/// Command families, selected by the high nibble of the command byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandFamily {
    /// 0x00: Activate / Deactivate
    Enable,
    /// 0x10: replies whose id field carries communication type 2
    Reply,
    /// 0x20: parameter load / read
    Parameter,
    /// 0x90: velocity jog
    Jog,
    /// Any other high nibble; decoded with a length byte
    Unknown,
}

/// How the bytes between the header and the terminator are laid out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyLayout {
    Fixed(usize),
    LengthPrefixed,
}

impl CommandFamily {
    /// Classify a raw command byte
    pub fn from_u8(command: u8) -> Self {
        match command & 0xF0 {
            0x00 => Self::Enable,
            0x10 => Self::Reply,
            0x20 => Self::Parameter,
            0x90 => Self::Jog,
            _ => Self::Unknown,
        }
    }

    fn layout(self) -> BodyLayout {
        match self {
            Self::Enable => BodyLayout::Fixed(2),
            Self::Reply | Self::Parameter | Self::Jog | Self::Unknown => BodyLayout::LengthPrefixed,
        }
    }

    /// Check if frames of this family can set a motor in motion
    pub fn is_motion(self) -> bool {
        matches!(self, Self::Jog)
    }
}

/// Pack a reply id field from its parts: communication type (bits 24..29),
/// motor id (bits 8..16) and host id (bits 0..8)
pub fn reply_can_id(comm_type: u8, motor_id: u8, host_id: u8) -> u32 {
    let extended = (u32::from(comm_type & 0x1F) << 24) | (u32::from(motor_id) << 8) | u32::from(host_id);
    (extended << REPLY_ID_SHIFT) | REPLY_EXTENDED_FLAG
}

/// One decoded or to-be-encoded wire frame.
///
/// For replies the header fields hold the bytes of the CAN id field, not a
/// command and a target; use [`Frame::can_id`] and [`Frame::responder_id`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: u8,
    pub adapter_address: u16,
    pub target_id: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a frame; the payload is fitted to the command's schema on encode
    pub fn new(command: u8, adapter_address: u16, target_id: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            command,
            adapter_address,
            target_id,
            payload: payload.into(),
        }
    }

    /// A device reply with the given id field and data
    pub fn reply(can_id: u32, data: impl Into<Vec<u8>>) -> Self {
        let [command, hi, lo, target_id] = can_id.to_be_bytes();
        Self::new(command, u16::from_be_bytes([hi, lo]), target_id, data)
    }

    pub fn activate(adapter_address: u16, target_id: u8) -> Self {
        Self::new(CMD_ENABLE, adapter_address, target_id, [0x01, 0x00])
    }

    pub fn deactivate(adapter_address: u16, target_id: u8) -> Self {
        Self::new(CMD_ENABLE, adapter_address, target_id, [0x00, 0x00])
    }

    /// Parameter read of `index`; motion-free
    pub fn query(adapter_address: u16, target_id: u8, index: u16) -> Self {
        let [hi, lo] = index.to_be_bytes();
        Self::new(
            CMD_PARAMETER,
            adapter_address,
            target_id,
            [hi, lo, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
        )
    }

    /// The parameter load sent during bring-up
    pub fn load_parameters(adapter_address: u16, target_id: u8) -> Self {
        Self::query(adapter_address, target_id, LOAD_PARAMETERS_INDEX)
    }

    /// Jog frame carrying a run flag and an already encoded speed
    pub fn jog(adapter_address: u16, target_id: u8, run: bool, speed_raw: i16) -> Self {
        let [hi, lo] = speed_raw.to_be_bytes();
        Self::new(
            CMD_JOG,
            adapter_address,
            target_id,
            [
                JOG_REGISTER[0],
                JOG_REGISTER[1],
                0x00,
                0x00,
                JOG_MODE,
                u8::from(run),
                hi,
                lo,
            ],
        )
    }

    pub fn family(&self) -> CommandFamily {
        CommandFamily::from_u8(self.command)
    }

    /// The four header bytes read as a reply's CAN id field
    pub fn can_id(&self) -> u32 {
        let [hi, lo] = self.adapter_address.to_be_bytes();
        u32::from_be_bytes([self.command, hi, lo, self.target_id])
    }

    /// 29-bit extended id of a reply
    pub fn extended_id(&self) -> u32 {
        self.can_id() >> REPLY_ID_SHIFT
    }

    /// Check the id field has the IDE bit of an extended reply
    pub fn is_extended_reply(&self) -> bool {
        self.can_id() & REPLY_EXTENDED_FLAG != 0
    }

    /// Motor id of the device that sent a reply
    pub fn responder_id(&self) -> u8 {
        (self.extended_id() >> 8) as u8
    }

    /// Enable flag of an Activate/Deactivate frame
    pub fn enable_flag(&self) -> Option<bool> {
        match (self.family(), self.payload.first()) {
            (CommandFamily::Enable, Some(&flag)) => Some(flag != 0),
            _ => None,
        }
    }

    pub fn is_activate(&self) -> bool {
        self.enable_flag() == Some(true)
    }

    pub fn is_deactivate(&self) -> bool {
        self.enable_flag() == Some(false)
    }

    /// Run flag of a jog frame
    pub fn jog_flag(&self) -> Option<bool> {
        if self.family() != CommandFamily::Jog || self.payload.len() < 8 {
            return None;
        }
        Some(self.payload[5] != 0)
    }

    /// Signed speed field of a jog frame, in wire units
    pub fn jog_speed_raw(&self) -> Option<i16> {
        if self.family() != CommandFamily::Jog || self.payload.len() < 8 {
            return None;
        }
        Some(i16::from_be_bytes([self.payload[6], self.payload[7]]))
    }

    /// A zero-speed jog with the run flag cleared
    pub fn is_halt(&self) -> bool {
        self.jog_flag() == Some(false) && self.jog_speed_raw() == Some(0)
    }

    /// Encode as a request
    pub fn to_bytes(&self) -> Vec<u8> {
        match self.family().layout() {
            // Short payloads are zero padded; a longer one can only be a reply
            BodyLayout::Fixed(len) if self.payload.len() <= len => {
                let mut bytes = self.header_bytes();
                for i in 0..len {
                    bytes.push(self.payload.get(i).copied().unwrap_or(0));
                }
                bytes.extend_from_slice(&TERMINATOR);
                bytes
            }
            _ => self.to_reply_bytes(),
        }
    }

    /// Encode with a length byte whatever the header, as devices reply
    pub fn to_reply_bytes(&self) -> Vec<u8> {
        let mut bytes = self.header_bytes();
        let data = &self.payload[..self.payload.len().min(MAX_PAYLOAD)];
        bytes.push(data.len() as u8);
        bytes.extend_from_slice(data);
        bytes.extend_from_slice(&TERMINATOR);
        bytes
    }

    fn header_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(MIN_FRAME_LEN + 1 + MAX_PAYLOAD);
        bytes.extend_from_slice(&PREAMBLE);
        bytes.push(self.command);
        bytes.extend_from_slice(&self.adapter_address.to_be_bytes());
        bytes.push(self.target_id);
        bytes
    }

    /// Decode a single frame from the start of `bytes`; trailing bytes are ignored
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        decode_prefix(bytes).map(|(frame, _)| frame)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.to_bytes()))
    }
}

/// Encode a frame addressed through the default adapter address
pub fn encode(command: u8, target_id: u8, payload: &[u8]) -> Vec<u8> {
    Frame::new(command, DEFAULT_ADAPTER_ADDRESS, target_id, payload).to_bytes()
}

/// Decode the frame at the start of `bytes`, request or reply.
///
/// An enable-family header is read as a two byte Enable body when the
/// terminator follows it, and as a length-prefixed reply otherwise.
pub fn decode(bytes: &[u8]) -> Result<Frame, DecodeError> {
    Frame::from_bytes(bytes)
}

/// Decode the device reply at the start of `bytes`
pub fn decode_reply(bytes: &[u8]) -> Result<Frame, DecodeError> {
    decode_reply_prefix(bytes).map(|(frame, _)| frame)
}

/// Decode every well-formed reply in a buffer that may hold several replies
/// and line noise. Garbage between frames is skipped.
pub fn decode_stream(bytes: &[u8]) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut cursor = 0;

    while let Some(start) = find_preamble(bytes, cursor) {
        match decode_reply_prefix(&bytes[start..]) {
            Ok((frame, consumed)) => {
                frames.push(frame);
                cursor = start + consumed;
            }
            Err(_) => cursor = start + 1,
        }
    }

    frames
}

fn find_preamble(bytes: &[u8], from: usize) -> Option<usize> {
    if from >= bytes.len() {
        return None;
    }
    bytes[from..]
        .windows(PREAMBLE.len())
        .position(|w| w == PREAMBLE)
        .map(|pos| from + pos)
}

fn check_header(bytes: &[u8]) -> Result<(), DecodeError> {
    if bytes.len() < MIN_FRAME_LEN {
        return Err(DecodeError::Truncated {
            needed: MIN_FRAME_LEN,
            got: bytes.len(),
        });
    }
    if bytes[..2] != PREAMBLE {
        return Err(DecodeError::BadPreamble);
    }
    Ok(())
}

/// Decode one frame of either direction and report how many bytes it occupied
fn decode_prefix(bytes: &[u8]) -> Result<(Frame, usize), DecodeError> {
    check_header(bytes)?;
    match CommandFamily::from_u8(bytes[2]).layout() {
        BodyLayout::Fixed(len) => decode_body(bytes, BODY_OFFSET, len)
            .or_else(|fixed| decode_length_prefixed(bytes).map_err(|_| fixed)),
        BodyLayout::LengthPrefixed => decode_length_prefixed(bytes),
    }
}

/// Replies always carry a length byte, whatever their id field starts with
fn decode_reply_prefix(bytes: &[u8]) -> Result<(Frame, usize), DecodeError> {
    check_header(bytes)?;
    decode_length_prefixed(bytes)
}

fn decode_length_prefixed(bytes: &[u8]) -> Result<(Frame, usize), DecodeError> {
    let needed = BODY_OFFSET + 1 + TERMINATOR.len();
    if bytes.len() < needed {
        return Err(DecodeError::Truncated {
            needed,
            got: bytes.len(),
        });
    }
    let len = bytes[BODY_OFFSET];
    if len as usize > MAX_PAYLOAD {
        return Err(DecodeError::Oversized(len));
    }
    decode_body(bytes, BODY_OFFSET + 1, len as usize)
}

fn decode_body(bytes: &[u8], data_start: usize, data_len: usize) -> Result<(Frame, usize), DecodeError> {
    let terminator_at = data_start + data_len;
    let total = terminator_at + TERMINATOR.len();
    if bytes.len() < total {
        return Err(DecodeError::Truncated {
            needed: total,
            got: bytes.len(),
        });
    }
    if bytes[terminator_at..total] != TERMINATOR {
        return Err(DecodeError::BadTerminator {
            offset: terminator_at,
        });
    }

    let frame = Frame {
        command: bytes[2],
        adapter_address: u16::from_be_bytes([bytes[3], bytes[4]]),
        target_id: bytes[5],
        payload: bytes[data_start..terminator_at].to_vec(),
    };
    Ok((frame, total))
}
