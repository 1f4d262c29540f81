//! Running one metric: trigger, wait, decode, retry.
//!
//! The ring answers a trigger asynchronously. Real-time metrics take several
//! seconds of on-body measuring and stream zero values until done, and stale
//! pushes from earlier requests are common. So one attempt is a wait loop over
//! a fixed time budget that skips frames meant for someone else, and an attempt
//! that runs out of budget is retried a bounded number of times.

use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::message::{DecodeProgress, ReadingError};
use crate::metric::{MeasurementResult, MetricOutcome, MetricSpec};
use crate::session::{RecvError, Session, WriteError};
use crate::shutdown::Shutdown;
use crate::transport::Transport;

/// How long the ring gets to acknowledge a stop frame.
const STOP_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementPhase {
    Idle,
    Triggered,
    Waiting,
    Decoding,
    Done,
}

/// The outcome of one metric plus what it took to get there.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRun {
    pub outcome: MetricOutcome,
    pub triggers_sent: u32,
    /// Frames skipped because they belonged to another request or failed
    /// validation.
    pub frames_discarded: u32,
    pub phase: MeasurementPhase,
}

/// How one attempt's wait loop ended.
enum AttemptEnd {
    Finished(MetricOutcome),
    TimedOut,
}

struct Measurement<'a, 's, 't, T: Transport + ?Sized> {
    session: &'s mut Session<'t, T>,
    spec: &'a MetricSpec,
    phase: MeasurementPhase,
    triggers_sent: u32,
    frames_discarded: u32,
}

/// Run `spec` to completion over `session`. Never fails: every error ends up
/// as a [`MetricOutcome`].
pub async fn run_metric<T: Transport + ?Sized>(
    session: &mut Session<'_, T>,
    spec: &MetricSpec,
    shutdown: &mut Shutdown,
) -> MetricRun {
    let mut measurement = Measurement {
        session,
        spec,
        phase: MeasurementPhase::Idle,
        triggers_sent: 0,
        frames_discarded: 0,
    };
    let outcome = measurement.run(shutdown).await;
    measurement.phase = MeasurementPhase::Done;

    MetricRun {
        outcome,
        triggers_sent: measurement.triggers_sent,
        frames_discarded: measurement.frames_discarded,
        phase: measurement.phase,
    }
}

impl<T: Transport + ?Sized> Measurement<'_, '_, '_, T> {
    async fn run(&mut self, shutdown: &mut Shutdown) -> MetricOutcome {
        let kind = self.spec.kind;

        let trigger = match self.spec.trigger.encode() {
            Ok(frame) => frame,
            Err(err) => {
                error!(%kind, "cannot encode trigger: {err}");
                return MetricOutcome::Unsupported;
            }
        };

        loop {
            self.phase = MeasurementPhase::Idle;
            // the write and the wait share one attempt's budget
            let deadline = Instant::now() + self.spec.max_wait;
            match self.session.send(&trigger, self.spec.max_wait, shutdown).await {
                Ok(()) => {}
                Err(WriteError::Cancelled) => return MetricOutcome::Cancelled,
                Err(err) => {
                    warn!(%kind, "trigger not sent: {err}");
                    return MetricOutcome::ConnectionLost;
                }
            }
            self.triggers_sent += 1;
            self.phase = MeasurementPhase::Triggered;
            debug!(%kind, attempt = self.triggers_sent, "triggered");

            match self.wait_for_result(deadline, shutdown).await {
                AttemptEnd::Finished(outcome) => {
                    if !matches!(outcome, MetricOutcome::ConnectionLost | MetricOutcome::Cancelled) {
                        self.stop_measurement(shutdown).await;
                    }
                    return outcome;
                }
                AttemptEnd::TimedOut if self.triggers_sent <= self.spec.max_retries => {
                    warn!(%kind, attempt = self.triggers_sent, "no result within {:?}, retrying", self.spec.max_wait);
                }
                AttemptEnd::TimedOut => {
                    warn!(%kind, attempts = self.triggers_sent, "no result, giving up");
                    self.stop_measurement(shutdown).await;
                    return MetricOutcome::Timeout;
                }
            }
        }
    }

    /// Wait until `deadline`. Frames that are not ours are dropped and the
    /// wait resumes with whatever budget is left.
    async fn wait_for_result(&mut self, deadline: Instant, shutdown: &mut Shutdown) -> AttemptEnd {
        let kind = self.spec.kind;
        let mut decoder = self.spec.decoder();

        loop {
            self.phase = MeasurementPhase::Waiting;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return AttemptEnd::TimedOut;
            }

            let frame = match self.session.next_notification(remaining, shutdown).await {
                Ok(frame) => frame,
                Err(RecvError::Timeout) => return AttemptEnd::TimedOut,
                Err(RecvError::ConnectionDropped) => {
                    warn!(%kind, "connection dropped while waiting");
                    return AttemptEnd::Finished(MetricOutcome::ConnectionLost);
                }
                Err(RecvError::Cancelled) => return AttemptEnd::Finished(MetricOutcome::Cancelled),
                Err(RecvError::Decode(err)) => {
                    self.frames_discarded += 1;
                    warn!(%kind, "discarding bad packet: {err}");
                    continue;
                }
            };

            if !self.spec.matches(&frame) {
                self.frames_discarded += 1;
                debug!(
                    %kind,
                    command_id = frame.command_id(),
                    remaining_ms = remaining.as_millis() as u64,
                    "discarding unrelated notification"
                );
                continue;
            }

            self.phase = MeasurementPhase::Decoding;
            match decoder.feed(&frame) {
                Ok(DecodeProgress::Pending) => debug!(%kind, "measurement in progress"),
                Ok(DecodeProgress::Complete(reading)) => {
                    info!(%kind, ?reading, "measured");
                    return AttemptEnd::Finished(MetricOutcome::Success(MeasurementResult {
                        kind,
                        reading,
                        captured_at: Utc::now(),
                    }));
                }
                Err(ReadingError::DeviceError(code)) => {
                    warn!(%kind, "ring refused the measurement (error code {code:#04x})");
                    return AttemptEnd::Finished(MetricOutcome::Unsupported);
                }
                Err(err) => {
                    warn!(%kind, "undecodable result: {err}");
                    return AttemptEnd::Finished(MetricOutcome::DecodeError(err));
                }
            }
        }
    }

    /// Best effort: the ring keeps its sensor on until told otherwise.
    async fn stop_measurement(&mut self, shutdown: &mut Shutdown) {
        let Some(stop) = &self.spec.stop else {
            return;
        };
        match stop.encode() {
            Ok(frame) => {
                if let Err(err) = self.session.send(&frame, STOP_WRITE_TIMEOUT, shutdown).await {
                    debug!(kind = %self.spec.kind, "stop not sent: {err}");
                }
            }
            Err(err) => error!(kind = %self.spec.kind, "cannot encode stop: {err}"),
        }
    }
}
