use crate::packet::{ResponseFrame, MAX_PAYLOAD_LEN};

/// A real-time measurement response.
///
/// Payload byte | Meaning
/// 0            | Measurement type, echoed from the request
/// 1            | Error code, 0 on success
/// 2            | Value, 0 while the ring is still measuring
/// 3            | Second value byte (diastolic, tenths of a degree, or low byte of a u16)
pub(crate) struct RealTimeMessage([u8; MAX_PAYLOAD_LEN]);

impl RealTimeMessage {
    pub fn new(frame: &ResponseFrame) -> Self {
        Self(*frame.payload())
    }

    pub fn error_code(&self) -> u8 {
        self.0[1]
    }

    pub fn value(&self) -> u8 {
        self.0[2]
    }

    pub fn value2(&self) -> u8 {
        self.0[3]
    }

    /// Value and second value read together as a big-endian u16.
    pub fn value_u16(&self) -> u16 {
        u16::from_be_bytes([self.0[2], self.0[3]])
    }
}
