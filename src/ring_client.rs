//! Polling every configured metric over a single connection.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, info_span, warn, Instrument};

use crate::address::DeviceAddress;
use crate::measurement::run_metric;
use crate::metric::{MetricKind, MetricOutcome, MetricSpec};
use crate::session::Session;
use crate::shutdown::Shutdown;
use crate::transport::Transport;

/// Limits applied to one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleConfig {
    /// Bounds the whole open, retries included.
    pub session_open_timeout: Duration,
    /// Connect attempts made before the cycle gives up on the ring.
    pub session_open_attempts: u32,
    /// Overrides each metric's default wait per trigger.
    pub per_metric_timeout: Option<Duration>,
    /// Overrides each metric's default retry count.
    pub per_metric_max_retries: Option<u32>,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            session_open_timeout: Duration::from_secs(30),
            session_open_attempts: 3,
            per_metric_timeout: None,
            per_metric_max_retries: None,
        }
    }
}

impl CycleConfig {
    pub fn spec_for(&self, kind: MetricKind) -> MetricSpec {
        let mut spec = MetricSpec::for_kind(kind);
        if let Some(timeout) = self.per_metric_timeout {
            spec = spec.with_max_wait(timeout);
        }
        if let Some(retries) = self.per_metric_max_retries {
            spec = spec.with_max_retries(retries);
        }
        spec
    }
}

/// The result of one poll cycle, one entry per requested metric in polling
/// order.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub outcomes: Vec<(MetricKind, MetricOutcome)>,
    /// The session opened and the link held for the whole cycle.
    pub session_ok: bool,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl CycleReport {
    pub fn outcome(&self, kind: MetricKind) -> Option<&MetricOutcome> {
        self.outcomes.iter().find(|(k, _)| *k == kind).map(|(_, outcome)| outcome)
    }

    pub fn successes(&self) -> usize {
        self.outcomes.iter().filter(|(_, outcome)| outcome.is_success()).count()
    }
}

/// Drives a ring through complete poll cycles.
///
/// Cycles must not overlap; `run_cycle` takes `&mut self` so the borrow
/// checker enforces that for a single client.
pub struct RingClient<T: Transport> {
    transport: T,
    config: CycleConfig,
}

impl<T: Transport> RingClient<T> {
    pub fn new(transport: T, config: CycleConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &CycleConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Connect, run every metric in `metrics` in order, disconnect.
    ///
    /// Always returns a report. A connect that still fails after
    /// `session_open_attempts` tries marks every metric
    /// `ConnectionLost` without touching the ring. A dropped link marks the
    /// metric in progress and all later ones `ConnectionLost`; shutdown marks
    /// them `Cancelled`.
    pub async fn run_cycle(
        &mut self,
        address: &DeviceAddress,
        metrics: &[MetricKind],
        shutdown: &mut Shutdown,
    ) -> CycleReport {
        let span = info_span!("cycle", %address);
        self.run_cycle_inner(address, metrics, shutdown).instrument(span).await
    }

    async fn run_cycle_inner(
        &mut self,
        address: &DeviceAddress,
        metrics: &[MetricKind],
        shutdown: &mut Shutdown,
    ) -> CycleReport {
        let started_at = Utc::now();
        info!(metrics = metrics.len(), "starting cycle");

        let opened = Session::open_with_attempts(
            &mut self.transport,
            address,
            self.config.session_open_timeout,
            self.config.session_open_attempts,
        )
        .await;
        let mut session = match opened {
            Ok(session) => session,
            Err(err) => {
                warn!("cannot open session: {err}");
                return CycleReport {
                    outcomes: metrics.iter().map(|&kind| (kind, MetricOutcome::ConnectionLost)).collect(),
                    session_ok: false,
                    cancelled: false,
                    started_at,
                    finished_at: Utc::now(),
                };
            }
        };

        let mut outcomes = Vec::with_capacity(metrics.len());
        let mut short_circuit: Option<MetricOutcome> = None;

        for &kind in metrics {
            if short_circuit.is_none() && shutdown.is_triggered() {
                info!("shutdown requested, skipping remaining metrics");
                short_circuit = Some(MetricOutcome::Cancelled);
            }
            if let Some(outcome) = &short_circuit {
                outcomes.push((kind, outcome.clone()));
                continue;
            }

            let spec = self.config.spec_for(kind);
            let run = run_metric(&mut session, &spec, shutdown).await;
            if matches!(run.outcome, MetricOutcome::ConnectionLost | MetricOutcome::Cancelled) {
                short_circuit = Some(run.outcome.clone());
            }
            outcomes.push((kind, run.outcome));
        }

        session.close().await;

        let report = CycleReport {
            session_ok: short_circuit != Some(MetricOutcome::ConnectionLost),
            cancelled: short_circuit == Some(MetricOutcome::Cancelled),
            outcomes,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            successes = report.successes(),
            metrics = report.outcomes.len(),
            session_ok = report.session_ok,
            "cycle finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::metric::Reading;
    use crate::mock_transport::{packet, MockReply, MockTransport};
    use crate::packet::{CMD_BATTERY, CMD_START_REAL_TIME};
    use crate::shutdown;
    use crate::transport::TransportError;

    fn address() -> DeviceAddress {
        "AA:BB:CC:DD:EE:FF".parse().unwrap()
    }

    fn is_start(bytes: &[u8], measurement: u8) -> bool {
        bytes[0] == CMD_START_REAL_TIME && bytes[1] == measurement
    }

    #[tokio::test(start_paused = true)]
    async fn test_battery_then_heart_rate_with_one_retry() {
        let heart_rate_triggers = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&heart_rate_triggers);
        let transport = MockTransport::new().with_responder(move |bytes| {
            if bytes[0] == CMD_BATTERY {
                return vec![MockReply::Notify(packet(CMD_BATTERY, &[82, 0]))];
            }
            if is_start(bytes, 0x01) && counter.fetch_add(1, Ordering::SeqCst) == 1 {
                return vec![MockReply::NotifyAfter(
                    Duration::from_secs(5),
                    packet(CMD_START_REAL_TIME, &[0x01, 0x00, 67]),
                )];
            }
            Vec::new()
        });
        let config = CycleConfig { per_metric_max_retries: Some(1), ..CycleConfig::default() };
        let mut client = RingClient::new(transport, config);

        let report = client
            .run_cycle(&address(), &[MetricKind::Battery, MetricKind::HeartRate], &mut Shutdown::never())
            .await;

        assert!(report.session_ok);
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.outcomes[0].0, MetricKind::Battery);
        assert_eq!(report.outcomes[0].1.reading(), Some(&Reading::Battery { level: 82, charging: false }));
        assert_eq!(report.outcomes[1].0, MetricKind::HeartRate);
        assert_eq!(report.outcomes[1].1.reading(), Some(&Reading::Scalar(67.0)));
        assert_eq!(heart_rate_triggers.load(Ordering::SeqCst), 2);
        assert!(!client.transport().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_drop_short_circuits_remaining_metrics() {
        let transport = MockTransport::new().with_responder(|bytes| {
            if bytes[0] == CMD_BATTERY {
                vec![MockReply::Notify(packet(CMD_BATTERY, &[40, 1]))]
            } else if is_start(bytes, 0x01) {
                vec![MockReply::DropLink]
            } else {
                Vec::new()
            }
        });
        let log = transport.log_handle();
        let mut client = RingClient::new(transport, CycleConfig::default());
        let metrics = [MetricKind::Battery, MetricKind::HeartRate, MetricKind::SpO2, MetricKind::Stress];

        let report = client.run_cycle(&address(), &metrics, &mut Shutdown::never()).await;

        assert!(!report.session_ok);
        assert!(report.outcomes[0].1.is_success());
        for (kind, outcome) in &report.outcomes[1..] {
            assert_eq!(outcome, &MetricOutcome::ConnectionLost, "{kind}");
        }
        // battery request and heart rate trigger, nothing after the drop
        assert_eq!(log.lock().unwrap().writes.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_reports_every_metric_lost() {
        let missing = TransportError::DeviceNotFound("AA:BB:CC:DD:EE:FF".into());
        let transport = MockTransport::new().fail_connect(missing);
        let log = transport.log_handle();
        let mut client = RingClient::new(transport, CycleConfig::default());

        let report = client.run_cycle(&address(), &MetricKind::DEFAULT_ORDER, &mut Shutdown::never()).await;

        assert!(!report.session_ok);
        assert_eq!(report.outcomes.len(), MetricKind::DEFAULT_ORDER.len());
        assert!(report.outcomes.iter().all(|(_, o)| *o == MetricOutcome::ConnectionLost));
        let log = log.lock().unwrap();
        assert_eq!(log.bytes_written(), 0);
        assert_eq!(log.connects, 3);
        assert_eq!(log.disconnects, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flaky_connect_still_yields_a_normal_report() {
        let transport = MockTransport::new()
            .fail_connect_times(1, TransportError::AdapterRejected("le-connection-abort-by-local".into()))
            .with_responder(|bytes| {
                if bytes[0] == CMD_BATTERY {
                    vec![MockReply::Notify(packet(CMD_BATTERY, &[64, 1]))]
                } else {
                    Vec::new()
                }
            });
        let log = transport.log_handle();
        let mut client = RingClient::new(transport, CycleConfig::default());

        let report = client.run_cycle(&address(), &[MetricKind::Battery], &mut Shutdown::never()).await;

        assert!(report.session_ok);
        assert_eq!(report.outcomes[0].1.reading(), Some(&Reading::Battery { level: 64, charging: true }));
        let log = log.lock().unwrap();
        assert_eq!(log.connects, 2);
        assert_eq!(log.disconnects, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_stop_the_cycle() {
        let transport = MockTransport::new().with_responder(|bytes| {
            if is_start(bytes, 0x09) {
                vec![MockReply::Notify(packet(CMD_START_REAL_TIME, &[0x09, 0x01]))]
            } else if is_start(bytes, 0x03) {
                vec![MockReply::Notify(packet(CMD_START_REAL_TIME, &[0x03, 0x00, 97]))]
            } else {
                Vec::new()
            }
        });
        let config = CycleConfig {
            per_metric_timeout: Some(Duration::from_secs(5)),
            per_metric_max_retries: Some(0),
            ..CycleConfig::default()
        };
        let mut client = RingClient::new(transport, config);
        let metrics = [MetricKind::HeartRate, MetricKind::BloodGlucose, MetricKind::SpO2];

        let report = client.run_cycle(&address(), &metrics, &mut Shutdown::never()).await;

        assert!(report.session_ok);
        assert_eq!(report.outcome(MetricKind::HeartRate), Some(&MetricOutcome::Timeout));
        assert_eq!(report.outcome(MetricKind::BloodGlucose), Some(&MetricOutcome::Unsupported));
        assert_eq!(report.outcome(MetricKind::SpO2).and_then(MetricOutcome::reading), Some(&Reading::Scalar(97.0)));
        assert_eq!(report.successes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_between_metrics() {
        let (trigger, mut shutdown) = shutdown::channel();
        let trigger = Arc::new(trigger);
        let fire = Arc::clone(&trigger);
        let transport = MockTransport::new().with_responder(move |bytes| {
            if bytes[0] == CMD_BATTERY {
                fire.trigger();
                return vec![MockReply::Notify(packet(CMD_BATTERY, &[90, 0]))];
            }
            Vec::new()
        });
        let log = transport.log_handle();
        let mut client = RingClient::new(transport, CycleConfig::default());

        let report = client
            .run_cycle(&address(), &[MetricKind::Battery, MetricKind::HeartRate, MetricKind::Hrv], &mut shutdown)
            .await;

        // the battery answer was already queued, but the wait sees shutdown first
        assert!(report.cancelled);
        assert!(report.session_ok);
        assert!(report.outcomes.iter().all(|(_, o)| *o == MetricOutcome::Cancelled));
        let log = log.lock().unwrap();
        assert_eq!(log.writes.len(), 1);
        assert_eq!(log.disconnects, 1);
    }
}
