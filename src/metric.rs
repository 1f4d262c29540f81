//! What can be measured, how each measurement is triggered, and what comes back.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::{MetricDecoder, ReadingError};
use crate::packet::{
    self, CommandFrame, PacketError, ResponseFrame, CMD_BATTERY, CMD_START_REAL_TIME, CMD_STOP_REAL_TIME,
};

/// Real-time measurement types, sent as the first payload byte of a
/// start/stop request and echoed back in every response.
pub mod real_time {
    pub const HEART_RATE: u8 = 0x01;
    pub const BLOOD_PRESSURE: u8 = 0x02;
    pub const SPO2: u8 = 0x03;
    pub const STRESS: u8 = 0x04;
    pub const TEMPERATURE: u8 = 0x08;
    pub const BLOOD_GLUCOSE: u8 = 0x09;
    pub const HRV: u8 = 0x0A;

    pub const ACTION_START: u8 = 0x01;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Battery,
    HeartRate,
    #[serde(rename = "spo2")]
    SpO2,
    BloodPressure,
    Temperature,
    Hrv,
    Stress,
    BloodGlucose,
}

impl MetricKind {
    /// Cheap metrics first, so a link that drops mid-cycle still yields
    /// something, and in the sequence older firmware expects.
    pub const DEFAULT_ORDER: [MetricKind; 8] = [
        MetricKind::Battery,
        MetricKind::HeartRate,
        MetricKind::SpO2,
        MetricKind::Stress,
        MetricKind::Hrv,
        MetricKind::Temperature,
        MetricKind::BloodPressure,
        MetricKind::BloodGlucose,
    ];

    /// The real-time measurement type, `None` for battery.
    pub fn real_time_type(self) -> Option<u8> {
        match self {
            Self::Battery => None,
            Self::HeartRate => Some(real_time::HEART_RATE),
            Self::SpO2 => Some(real_time::SPO2),
            Self::BloodPressure => Some(real_time::BLOOD_PRESSURE),
            Self::Temperature => Some(real_time::TEMPERATURE),
            Self::Hrv => Some(real_time::HRV),
            Self::Stress => Some(real_time::STRESS),
            Self::BloodGlucose => Some(real_time::BLOOD_GLUCOSE),
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Battery => "battery",
            Self::HeartRate => "heart rate",
            Self::SpO2 => "SpO2",
            Self::BloodPressure => "blood pressure",
            Self::Temperature => "temperature",
            Self::Hrv => "HRV",
            Self::Stress => "stress",
            Self::BloodGlucose => "blood glucose",
        };
        f.write_str(name)
    }
}

/// A decoded value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reading {
    /// Heart rate (bpm), SpO2 (%), stress (0-100), HRV (ms), temperature (°C)
    /// or blood glucose (mg/dL), depending on the metric.
    Scalar(f64),
    Battery { level: u8, charging: bool },
    BloodPressure { systolic: u8, diastolic: u8 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementResult {
    pub kind: MetricKind,
    pub reading: Reading,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetricOutcome {
    Success(MeasurementResult),
    Timeout,
    ConnectionLost,
    DecodeError(ReadingError),
    /// The ring refused the measurement type.
    Unsupported,
    Cancelled,
}

impl MetricOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn reading(&self) -> Option<&Reading> {
        match self {
            Self::Success(result) => Some(&result.reading),
            _ => None,
        }
    }
}

/// A packet template: command id and unpadded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameTemplate {
    pub command_id: u8,
    pub payload: Vec<u8>,
}

impl FrameTemplate {
    fn new(command_id: u8, payload: &[u8]) -> Self {
        Self { command_id, payload: payload.to_vec() }
    }

    pub fn encode(&self) -> Result<CommandFrame, PacketError> {
        packet::encode(self.command_id, &self.payload)
    }
}

/// How one metric is requested from the ring and recognised in the
/// notification stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSpec {
    pub kind: MetricKind,
    pub trigger: FrameTemplate,
    pub result_command_id: u8,
    /// Real-time responses must also echo the measurement type.
    pub result_subtype: Option<u8>,
    /// Sent once the measurement is over, to stop the ring's sensor.
    pub stop: Option<FrameTemplate>,
    /// Wait per trigger.
    pub max_wait: Duration,
    pub max_retries: u32,
}

impl MetricSpec {
    const BATTERY_WAIT: Duration = Duration::from_secs(10);
    const BATTERY_RETRIES: u32 = 2;
    const REAL_TIME_WAIT: Duration = Duration::from_secs(60);
    const REAL_TIME_RETRIES: u32 = 1;

    pub fn for_kind(kind: MetricKind) -> Self {
        match kind.real_time_type() {
            None => Self {
                kind,
                trigger: FrameTemplate::new(CMD_BATTERY, &[]),
                result_command_id: CMD_BATTERY,
                result_subtype: None,
                stop: None,
                max_wait: Self::BATTERY_WAIT,
                max_retries: Self::BATTERY_RETRIES,
            },
            Some(measurement) => Self {
                kind,
                trigger: FrameTemplate::new(CMD_START_REAL_TIME, &[measurement, real_time::ACTION_START]),
                result_command_id: CMD_START_REAL_TIME,
                result_subtype: Some(measurement),
                stop: Some(FrameTemplate::new(CMD_STOP_REAL_TIME, &[measurement, 0, 0])),
                max_wait: Self::REAL_TIME_WAIT,
                max_retries: Self::REAL_TIME_RETRIES,
            },
        }
    }

    #[must_use]
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Whether `frame` is the answer to this metric's trigger.
    pub fn matches(&self, frame: &ResponseFrame) -> bool {
        frame.command_id() == self.result_command_id
            && self.result_subtype.map_or(true, |subtype| frame.subtype() == subtype)
    }

    /// A fresh decoder for one attempt.
    pub fn decoder(&self) -> MetricDecoder {
        MetricDecoder::new(self.kind)
    }
}
