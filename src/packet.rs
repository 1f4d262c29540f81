//! Framing for the ring's command protocol.
//!
//! Every message in either direction is a fixed 16 byte packet:
//!
//! Start Byte | End Byte     | Meaning
//! 0          | 0            | The command id
//! 1          | 14           | The payload, zero padded
//! 15         | 15           | Checksum: sum of bytes 0-14, modulo 255

use thiserror::Error;

/// Length of every packet on the wire.
pub const PACKET_LEN: usize = 16;
/// Capacity of the payload section of a packet.
pub const MAX_PAYLOAD_LEN: usize = PACKET_LEN - 2;

/// Request the battery level.
pub const CMD_BATTERY: u8 = 0x03;
/// Start a real-time (on-body) measurement.
pub const CMD_START_REAL_TIME: u8 = 0x69;
/// Stop a real-time measurement.
pub const CMD_STOP_REAL_TIME: u8 = 0x6A;

/// Command ids the crate knows about. Anything else decodes to `Other` since
/// the R09 and R12 firmware families only partially overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandId {
    Battery,
    StartRealTime,
    StopRealTime,
    Other(u8),
}

impl From<u8> for CommandId {
    fn from(value: u8) -> Self {
        match value {
            CMD_BATTERY => Self::Battery,
            CMD_START_REAL_TIME => Self::StartRealTime,
            CMD_STOP_REAL_TIME => Self::StopRealTime,
            other => Self::Other(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("payload of {len} bytes exceeds the {max} byte packet capacity")]
    PayloadTooLarge { len: usize, max: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorReason {
    TooShort,
    ChecksumMismatch,
    UnknownCommandId,
}

/// A notification that could not be turned into a [`ResponseFrame`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("undecodable packet ({reason:?}): {raw}")]
pub struct DecodeError {
    pub reason: DecodeErrorReason,
    /// Hex dump of the offending bytes
    pub raw: String,
}

impl DecodeError {
    fn new(reason: DecodeErrorReason, raw: &[u8]) -> Self {
        Self { reason, raw: hex::encode(raw) }
    }
}

/// An outgoing packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    command_id: u8,
    payload: [u8; MAX_PAYLOAD_LEN],
    checksum: u8,
}

impl CommandFrame {
    pub fn command_id(&self) -> u8 {
        self.command_id
    }

    pub fn payload(&self) -> &[u8; MAX_PAYLOAD_LEN] {
        &self.payload
    }

    pub fn checksum(&self) -> u8 {
        self.checksum
    }

    pub fn to_bytes(&self) -> [u8; PACKET_LEN] {
        let mut packet = [0u8; PACKET_LEN];
        packet[0] = self.command_id;
        packet[1..PACKET_LEN - 1].copy_from_slice(&self.payload);
        packet[PACKET_LEN - 1] = self.checksum;
        packet
    }
}

/// An incoming packet that passed length and checksum validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    command_id: u8,
    payload: [u8; MAX_PAYLOAD_LEN],
    checksum: u8,
}

impl ResponseFrame {
    pub fn command_id(&self) -> u8 {
        self.command_id
    }

    pub fn kind(&self) -> CommandId {
        CommandId::from(self.command_id)
    }

    pub fn payload(&self) -> &[u8; MAX_PAYLOAD_LEN] {
        &self.payload
    }

    /// First payload byte. Real-time responses carry the measurement type here.
    pub fn subtype(&self) -> u8 {
        self.payload[0]
    }

    pub fn checksum(&self) -> u8 {
        self.checksum
    }
}

/// Compute the checksum over the first 15 bytes of a packet.
pub fn checksum(bytes: &[u8]) -> u8 {
    let sum: u32 = bytes.iter().take(PACKET_LEN - 1).map(|&b| u32::from(b)).sum();
    // always < 255
    (sum % 255) as u8
}

/// Build a packet for `command_id`. Payloads shorter than the packet capacity
/// are zero padded.
pub fn encode(command_id: u8, payload: &[u8]) -> Result<CommandFrame, PacketError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(PacketError::PayloadTooLarge { len: payload.len(), max: MAX_PAYLOAD_LEN });
    }

    let mut padded = [0u8; MAX_PAYLOAD_LEN];
    padded[..payload.len()].copy_from_slice(payload);

    let mut head = [0u8; PACKET_LEN - 1];
    head[0] = command_id;
    head[1..].copy_from_slice(&padded);

    Ok(CommandFrame { command_id, payload: padded, checksum: checksum(&head) })
}

/// Validate and parse a raw notification.
///
/// Some adapters hand over notifications with trailing bytes, so anything
/// after the first 16 bytes is ignored. Command id 0 never occurs in a real
/// response and is what a zero-filled buffer looks like, so it is rejected.
pub fn decode(raw: &[u8]) -> Result<ResponseFrame, DecodeError> {
    if raw.len() < PACKET_LEN {
        return Err(DecodeError::new(DecodeErrorReason::TooShort, raw));
    }
    let packet = &raw[..PACKET_LEN];

    let expected = checksum(packet);
    let actual = packet[PACKET_LEN - 1];
    if actual != expected {
        return Err(DecodeError::new(DecodeErrorReason::ChecksumMismatch, packet));
    }

    if packet[0] == 0 {
        return Err(DecodeError::new(DecodeErrorReason::UnknownCommandId, packet));
    }

    let mut payload = [0u8; MAX_PAYLOAD_LEN];
    payload.copy_from_slice(&packet[1..PACKET_LEN - 1]);

    Ok(ResponseFrame { command_id: packet[0], payload, checksum: actual })
}
