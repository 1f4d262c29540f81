//! Turning cycle reports into sensor values and storing them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::metric::{MetricKind, MetricOutcome, Reading};
use crate::ring_client::CycleReport;

/// A named value exposed to the state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorDescription {
    pub key: &'static str,
    pub name: &'static str,
    pub unit: Option<&'static str>,
    pub metric: MetricKind,
}

const fn sensor(
    key: &'static str,
    name: &'static str,
    unit: Option<&'static str>,
    metric: MetricKind,
) -> SensorDescription {
    SensorDescription { key, name, unit, metric }
}

pub static SENSORS: [SensorDescription; 10] = [
    sensor("battery", "Battery", Some("%"), MetricKind::Battery),
    sensor("battery_charging", "Battery charging", None, MetricKind::Battery),
    sensor("heart_rate", "Heart rate", Some("bpm"), MetricKind::HeartRate),
    sensor("spo2", "SpO2", Some("%"), MetricKind::SpO2),
    sensor("blood_pressure_systolic", "Blood pressure systolic", Some("mmHg"), MetricKind::BloodPressure),
    sensor("blood_pressure_diastolic", "Blood pressure diastolic", Some("mmHg"), MetricKind::BloodPressure),
    sensor("temperature", "Temperature", Some("°C"), MetricKind::Temperature),
    sensor("hrv", "HRV", Some("ms"), MetricKind::Hrv),
    sensor("stress", "Stress", None, MetricKind::Stress),
    sensor("blood_sugar", "Blood sugar", Some("mg/dL"), MetricKind::BloodGlucose),
];

pub fn sensors_for(metric: MetricKind) -> impl Iterator<Item = &'static SensorDescription> {
    SENSORS.iter().filter(move |s| s.metric == metric)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SensorState {
    Available(f64),
    Unavailable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SensorUpdate {
    pub sensor: &'static SensorDescription,
    pub state: SensorState,
    pub at: DateTime<Utc>,
}

/// The value a sensor takes from a reading of its metric.
fn sensor_value(key: &str, reading: &Reading) -> Option<f64> {
    match (key, reading) {
        ("battery", Reading::Battery { level, .. }) => Some(f64::from(*level)),
        ("battery_charging", Reading::Battery { charging, .. }) => Some(if *charging { 1.0 } else { 0.0 }),
        ("blood_pressure_systolic", Reading::BloodPressure { systolic, .. }) => Some(f64::from(*systolic)),
        ("blood_pressure_diastolic", Reading::BloodPressure { diastolic, .. }) => Some(f64::from(*diastolic)),
        (_, Reading::Scalar(value)) => Some(*value),
        _ => None,
    }
}

/// One update per sensor of every metric in the report, in polling order.
pub fn sensor_updates(report: &CycleReport) -> Vec<SensorUpdate> {
    let mut updates = Vec::new();
    for (kind, outcome) in &report.outcomes {
        for sensor in sensors_for(*kind) {
            let (state, at) = match outcome {
                MetricOutcome::Success(result) => match sensor_value(sensor.key, &result.reading) {
                    Some(value) => (SensorState::Available(value), result.captured_at),
                    None => (SensorState::Unavailable, report.finished_at),
                },
                _ => (SensorState::Unavailable, report.finished_at),
            };
            updates.push(SensorUpdate { sensor, state, at });
        }
    }
    updates
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("cannot access state file {}: {source}", path.display())]
    Io { path: PathBuf, source: std::io::Error },
    #[error("state file {} is not valid: {source}", path.display())]
    Format { path: PathBuf, source: serde_json::Error },
}

/// Somewhere to put the values from each cycle.
#[async_trait]
pub trait Publisher: Send {
    async fn publish(&mut self, updates: &[SensorUpdate]) -> Result<(), PublishError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorRecord {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub unit: Option<String>,
    /// Last known value. Kept when the sensor becomes unavailable.
    pub value: Option<f64>,
    pub available: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub device: Option<String>,
    pub sensors: BTreeMap<String, SensorRecord>,
}

/// Keeps every sensor's state in a JSON file, rewritten after each cycle.
#[derive(Debug)]
pub struct JsonStatePublisher {
    path: PathBuf,
    document: StateDocument,
}

impl JsonStatePublisher {
    /// Open the state file at `path`, picking up the values it already holds.
    /// A missing file starts an empty document.
    pub fn open(path: impl Into<PathBuf>, device: Option<String>) -> Result<Self, PublishError> {
        let path = path.into();
        let mut document = if path.exists() {
            let content =
                std::fs::read_to_string(&path).map_err(|source| PublishError::Io { path: path.clone(), source })?;
            serde_json::from_str(&content).map_err(|source| PublishError::Format { path: path.clone(), source })?
        } else {
            StateDocument::default()
        };
        if device.is_some() {
            document.device = device;
        }
        Ok(Self { path, document })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn document(&self) -> &StateDocument {
        &self.document
    }

    fn apply(&mut self, update: &SensorUpdate) {
        let record = self.document.sensors.entry(update.sensor.key.to_string()).or_insert_with(|| SensorRecord {
            name: update.sensor.name.to_string(),
            unit: update.sensor.unit.map(str::to_string),
            value: None,
            available: false,
            updated_at: update.at,
        });
        match update.state {
            SensorState::Available(value) => {
                record.value = Some(value);
                record.available = true;
            }
            SensorState::Unavailable => record.available = false,
        }
        record.updated_at = update.at;
    }

    fn save(&self) -> Result<(), PublishError> {
        let io_err = |source: std::io::Error| PublishError::Io { path: self.path.clone(), source };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let content = serde_json::to_string_pretty(&self.document)
            .map_err(|source| PublishError::Format { path: self.path.clone(), source })?;
        std::fs::write(&self.path, content).map_err(io_err)
    }
}

#[async_trait]
impl Publisher for JsonStatePublisher {
    async fn publish(&mut self, updates: &[SensorUpdate]) -> Result<(), PublishError> {
        for update in updates {
            debug!(sensor = update.sensor.key, state = ?update.state, "update");
            self.apply(update);
        }
        self.save()?;
        let available = updates.iter().filter(|u| matches!(u.state, SensorState::Available(_))).count();
        info!(path = %self.path.display(), available, total = updates.len(), "state written");
        Ok(())
    }
}
