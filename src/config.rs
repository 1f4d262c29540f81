//! Configuration loaded from a TOML file.
//!
//! ```toml
//! address = "AA:BB:CC:DD:EE:FF"
//! name = "Colmi R09"
//! scan_interval_minutes = 10
//! session_open_attempts = 3
//! metrics = ["battery", "heart_rate", "spo2"]
//! state_file = "ringread-state.json"
//!
//! [logging]
//! level = "debug"
//! ```
//!
//! Everything but `address` has a default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::{DeviceAddress, InvalidAddress};
use crate::metric::MetricKind;
use crate::ring_client::CycleConfig;

pub const DEFAULT_SCAN_INTERVAL_MINUTES: u64 = 10;
pub const MIN_SCAN_INTERVAL_MINUTES: u64 = 5;
pub const MAX_SCAN_INTERVAL_MINUTES: u64 = 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {}: {source}", path.display())]
    Io { path: PathBuf, source: std::io::Error },
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error(transparent)]
    InvalidAddress(#[from] InvalidAddress),
    #[error("scan interval of {0} minutes is outside 5..=60")]
    IntervalOutOfRange(u64),
    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),
    #[error("session_open_attempts must be at least 1")]
    NoOpenAttempts,
    #[error("no metrics configured")]
    NoMetrics,
    #[error("metric {0} is listed more than once")]
    DuplicateMetric(MetricKind),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set.
    pub level: String,
    /// Emit JSON lines instead of human readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), json: false }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RingConfig {
    pub address: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_scan_interval")]
    pub scan_interval_minutes: u64,
    #[serde(default = "default_session_open_timeout")]
    pub session_open_timeout_ms: u64,
    #[serde(default = "default_session_open_attempts")]
    pub session_open_attempts: u32,
    #[serde(default)]
    pub per_metric_timeout_ms: Option<u64>,
    #[serde(default)]
    pub per_metric_max_retries: Option<u32>,
    /// Polling order. Defaults to [`MetricKind::DEFAULT_ORDER`].
    #[serde(default)]
    pub metrics: Option<Vec<MetricKind>>,
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_scan_interval() -> u64 {
    DEFAULT_SCAN_INTERVAL_MINUTES
}

fn default_session_open_timeout() -> u64 {
    30_000
}

fn default_session_open_attempts() -> u32 {
    3
}

fn default_state_file() -> PathBuf {
    PathBuf::from("ringread-state.json")
}

impl RingConfig {
    /// Read, parse and validate the file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        content.parse()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.device_address()?;
        if !(MIN_SCAN_INTERVAL_MINUTES..=MAX_SCAN_INTERVAL_MINUTES).contains(&self.scan_interval_minutes) {
            return Err(ConfigError::IntervalOutOfRange(self.scan_interval_minutes));
        }
        if self.session_open_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout("session_open_timeout_ms"));
        }
        if self.session_open_attempts == 0 {
            return Err(ConfigError::NoOpenAttempts);
        }
        if self.per_metric_timeout_ms == Some(0) {
            return Err(ConfigError::ZeroTimeout("per_metric_timeout_ms"));
        }
        if let Some(metrics) = &self.metrics {
            if metrics.is_empty() {
                return Err(ConfigError::NoMetrics);
            }
            for (i, kind) in metrics.iter().enumerate() {
                if metrics[..i].contains(kind) {
                    return Err(ConfigError::DuplicateMetric(*kind));
                }
            }
        }
        Ok(())
    }

    pub fn device_address(&self) -> Result<DeviceAddress, InvalidAddress> {
        self.address.parse()
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_minutes * 60)
    }

    pub fn metrics(&self) -> Vec<MetricKind> {
        self.metrics.clone().unwrap_or_else(|| MetricKind::DEFAULT_ORDER.to_vec())
    }

    pub fn cycle_config(&self) -> CycleConfig {
        CycleConfig {
            session_open_timeout: Duration::from_millis(self.session_open_timeout_ms),
            session_open_attempts: self.session_open_attempts,
            per_metric_timeout: self.per_metric_timeout_ms.map(Duration::from_millis),
            per_metric_max_retries: self.per_metric_max_retries,
        }
    }
}

impl std::str::FromStr for RingConfig {
    type Err = ConfigError;

    /// Parse and validate.
    fn from_str(content: &str) -> Result<Self, Self::Err> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: RingConfig = r#"address = "aa:bb:cc:dd:ee:ff""#.parse().unwrap();

        assert_eq!(config.device_address().unwrap().as_str(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(config.scan_interval(), Duration::from_secs(600));
        assert_eq!(config.metrics(), MetricKind::DEFAULT_ORDER.to_vec());
        assert_eq!(config.cycle_config(), CycleConfig::default());
        assert_eq!(config.logging, LoggingConfig::default());
    }

    #[test]
    fn test_full_config() {
        let config: RingConfig = r#"
            address = "AA:BB:CC:DD:EE:FF"
            name = "Colmi R09"
            scan_interval_minutes = 5
            session_open_timeout_ms = 15000
            session_open_attempts = 8
            per_metric_timeout_ms = 45000
            per_metric_max_retries = 2
            metrics = ["battery", "spo2", "blood_pressure"]
            state_file = "/var/lib/ringread/state.json"

            [logging]
            level = "ringread=debug"
            json = true
        "#
        .parse()
        .unwrap();

        assert_eq!(config.name.as_deref(), Some("Colmi R09"));
        assert_eq!(config.metrics(), vec![MetricKind::Battery, MetricKind::SpO2, MetricKind::BloodPressure]);
        assert_eq!(
            config.cycle_config(),
            CycleConfig {
                session_open_timeout: Duration::from_secs(15),
                session_open_attempts: 8,
                per_metric_timeout: Some(Duration::from_secs(45)),
                per_metric_max_retries: Some(2),
            }
        );
        assert!(config.logging.json);
        assert_eq!(config.state_file, PathBuf::from("/var/lib/ringread/state.json"));
    }

    #[test]
    fn test_rejects_bad_address() {
        let err = r#"address = "not-a-mac""#.parse::<RingConfig>().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAddress(_)), "{err}");
    }

    #[test]
    fn test_rejects_interval_out_of_range() {
        for minutes in [0, 4, 61] {
            let err = format!("address = \"AA:BB:CC:DD:EE:FF\"\nscan_interval_minutes = {minutes}")
                .parse::<RingConfig>()
                .unwrap_err();
            assert!(matches!(err, ConfigError::IntervalOutOfRange(m) if m == minutes), "{err}");
        }
    }

    #[test]
    fn test_rejects_bad_metric_lists() {
        let base = "address = \"AA:BB:CC:DD:EE:FF\"\n";
        let empty = format!("{base}metrics = []").parse::<RingConfig>().unwrap_err();
        assert!(matches!(empty, ConfigError::NoMetrics));

        let duplicate = format!(r#"{base}metrics = ["hrv", "stress", "hrv"]"#).parse::<RingConfig>().unwrap_err();
        assert!(matches!(duplicate, ConfigError::DuplicateMetric(MetricKind::Hrv)));

        let unknown = format!(r#"{base}metrics = ["steps"]"#).parse::<RingConfig>().unwrap_err();
        assert!(matches!(unknown, ConfigError::Parse(_)));
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let err = "address = \"AA:BB:CC:DD:EE:FF\"\nper_metric_timeout_ms = 0".parse::<RingConfig>().unwrap_err();
        assert!(matches!(err, ConfigError::ZeroTimeout("per_metric_timeout_ms")));

        let err = "address = \"AA:BB:CC:DD:EE:FF\"\nsession_open_attempts = 0".parse::<RingConfig>().unwrap_err();
        assert!(matches!(err, ConfigError::NoOpenAttempts));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ringread.toml");
        std::fs::write(&path, "address = \"AA:BB:CC:DD:EE:FF\"\nmetrics = [\"temperature\"]\n").unwrap();

        let config = RingConfig::load(&path).unwrap();
        assert_eq!(config.metrics(), vec![MetricKind::Temperature]);

        let missing = RingConfig::load(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Io { .. }));
    }
}
