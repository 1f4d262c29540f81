use crate::metric::Reading;
use crate::packet::{ResponseFrame, MAX_PAYLOAD_LEN};

use super::ReadingError;

/// The reply to a battery request: level in % followed by a charging flag.
pub(crate) struct BatteryMessage([u8; MAX_PAYLOAD_LEN]);

impl BatteryMessage {
    pub fn new(frame: &ResponseFrame) -> Self {
        Self(*frame.payload())
    }

    pub fn level_pct(&self) -> u8 {
        self.0[0]
    }

    pub fn charging(&self) -> bool {
        self.0[1] != 0
    }

    pub fn reading(&self) -> Result<Reading, ReadingError> {
        let level = self.level_pct();
        if level > 100 {
            return Err(ReadingError::OutOfRange { field: "battery level", value: level.into(), min: 0, max: 100 });
        }
        Ok(Reading::Battery { level, charging: self.charging() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_transport::packet;
    use crate::packet::decode;

    #[test]
    fn test_battery_message() {
        let frame = decode(&hex::decode("03520100000000000000000000000056").unwrap()).unwrap();
        let msg = BatteryMessage::new(&frame);
        assert_eq!(msg.level_pct(), 82);
        assert!(msg.charging());
        assert_eq!(msg.reading(), Ok(Reading::Battery { level: 82, charging: true }));
    }

    #[test]
    fn test_battery_level_out_of_range() {
        let frame = decode(&packet(0x03, &[200, 0])).unwrap();
        assert!(matches!(BatteryMessage::new(&frame).reading(), Err(ReadingError::OutOfRange { value: 200, .. })));
    }
}
