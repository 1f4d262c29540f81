use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::address::DeviceAddress;
use crate::metric::MetricKind;
use crate::publish::{sensor_updates, Publisher};
use crate::ring_client::RingClient;
use crate::shutdown::Shutdown;
use crate::transport::Transport;

/// Runs poll cycles on a fixed cadence until shutdown.
pub struct PollScheduler {
    address: DeviceAddress,
    metrics: Vec<MetricKind>,
    interval: Duration,
}

impl PollScheduler {
    pub fn new(address: DeviceAddress, metrics: Vec<MetricKind>, interval: Duration) -> Self {
        Self { address, metrics, interval }
    }

    /// Poll, publish, wait for the next tick, repeat.
    ///
    /// The first cycle starts immediately. A cycle that overruns the interval
    /// pushes the next tick back rather than queueing a burst of catch-up
    /// cycles. Returns how many cycles completed.
    pub async fn run<T, P>(&self, client: &mut RingClient<T>, publisher: &mut P, mut shutdown: Shutdown) -> u64
    where
        T: Transport,
        P: Publisher + ?Sized,
    {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cycles = 0;

        info!(address = %self.address, interval = ?self.interval, "polling started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.triggered() => break,
                _ = ticker.tick() => {}
            }

            let report = client.run_cycle(&self.address, &self.metrics, &mut shutdown).await;
            if report.cancelled {
                break;
            }
            cycles += 1;

            if let Err(err) = publisher.publish(&sensor_updates(&report)).await {
                warn!("publishing failed: {err}");
            }
        }

        info!(cycles, "polling stopped");
        cycles
    }
}
