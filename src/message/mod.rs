//! Payload decoding for each metric.
//!
//! A measurement can take several notifications to complete: the ring streams
//! zero values while it is still measuring, and some firmware revisions report
//! blood pressure as a systolic frame followed by a diastolic frame. The
//! [`MetricDecoder`] is fed every matching frame of one attempt and says when
//! it has a complete reading.

mod battery_message;
mod real_time_message;

use thiserror::Error;

use crate::metric::{MetricKind, Reading};
use crate::packet::ResponseFrame;

use battery_message::BatteryMessage;
use real_time_message::RealTimeMessage;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadingError {
    /// The ring refused the measurement, usually because this firmware does
    /// not support it.
    #[error("ring reported error code {0:#04x}")]
    DeviceError(u8),
    #[error("{field} value {value} outside {min}..={max}")]
    OutOfRange { field: &'static str, value: u32, min: u32, max: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodeProgress {
    /// Keep waiting for more frames.
    Pending,
    Complete(Reading),
}

#[derive(Debug, Clone)]
pub struct MetricDecoder {
    kind: MetricKind,
    systolic: Option<u8>,
    diastolic: Option<u8>,
}

fn check(field: &'static str, value: u32, min: u32, max: u32) -> Result<u32, ReadingError> {
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(ReadingError::OutOfRange { field, value, min, max })
    }
}

impl MetricDecoder {
    pub fn new(kind: MetricKind) -> Self {
        Self { kind, systolic: None, diastolic: None }
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    /// Feed one frame that matched this metric.
    pub fn feed(&mut self, frame: &ResponseFrame) -> Result<DecodeProgress, ReadingError> {
        let msg = RealTimeMessage::new(frame);
        if self.kind != MetricKind::Battery && msg.error_code() != 0 {
            return Err(ReadingError::DeviceError(msg.error_code()));
        }

        let scalar = |value: u32| -> Result<DecodeProgress, ReadingError> {
            Ok(DecodeProgress::Complete(Reading::Scalar(f64::from(value))))
        };

        match self.kind {
            MetricKind::Battery => BatteryMessage::new(frame).reading().map(DecodeProgress::Complete),
            MetricKind::HeartRate => match msg.value() {
                0 => Ok(DecodeProgress::Pending),
                v => scalar(check("heart rate", v.into(), 25, 250)?),
            },
            MetricKind::SpO2 => match msg.value() {
                0 => Ok(DecodeProgress::Pending),
                v => scalar(check("SpO2", v.into(), 50, 100)?),
            },
            MetricKind::Stress => match msg.value() {
                0 => Ok(DecodeProgress::Pending),
                v => scalar(check("stress", v.into(), 1, 100)?),
            },
            MetricKind::Hrv => match msg.value_u16() {
                0 => Ok(DecodeProgress::Pending),
                v => scalar(check("HRV", v.into(), 1, 3000)?),
            },
            MetricKind::BloodGlucose => match msg.value_u16() {
                0 => Ok(DecodeProgress::Pending),
                v => scalar(check("blood glucose", v.into(), 1, 1000)?),
            },
            MetricKind::Temperature => {
                let (whole, tenths) = (msg.value(), msg.value2());
                if whole == 0 {
                    return Ok(DecodeProgress::Pending);
                }
                check("temperature", whole.into(), 20, 45)?;
                check("temperature tenths", tenths.into(), 0, 9)?;
                let celsius = f64::from(whole) + f64::from(tenths) / 10.0;
                Ok(DecodeProgress::Complete(Reading::Scalar((celsius * 10.0).round() / 10.0)))
            }
            MetricKind::BloodPressure => self.feed_blood_pressure(msg.value(), msg.value2()),
        }
    }

    /// Systolic and diastolic may arrive together or in separate frames.
    fn feed_blood_pressure(&mut self, systolic: u8, diastolic: u8) -> Result<DecodeProgress, ReadingError> {
        if systolic != 0 {
            check("systolic", systolic.into(), 50, 250)?;
            self.systolic = Some(systolic);
        }
        if diastolic != 0 {
            check("diastolic", diastolic.into(), 30, 200)?;
            self.diastolic = Some(diastolic);
        }

        match (self.systolic, self.diastolic) {
            (Some(systolic), Some(diastolic)) => {
                Ok(DecodeProgress::Complete(Reading::BloodPressure { systolic, diastolic }))
            }
            _ => Ok(DecodeProgress::Pending),
        }
    }
}
