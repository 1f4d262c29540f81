//! Read health measurements from Colmi R09 style smart rings over Bluetooth Low Energy
//!
//! The ring has a BLE interface with a vendor service that behaves like Nordic UART: 16 byte command packets are
//! written to one characteristic and responses arrive as notifications on another. Measurements are asynchronous;
//! a trigger starts the sensor and the value shows up some seconds later, often behind unrelated notifications.
//!
//! Currently the following data can be read:
//!
//! - Battery level (%) and charging state
//! - Heart rate (bpm)
//! - SpO2 (%)
//! - Blood pressure (mmHg)
//! - Body temperature (°C)
//! - Heart rate variability (ms)
//! - Stress (0-100)
//! - Blood glucose (mg/dL)
//!
//! Each poll cycle opens one connection, runs every configured metric in order and disconnects. Failures are
//! reported per metric in a [`CycleReport`] instead of failing the cycle.
//!
//! # Example
//!
//! ```no_run
//! # use ringread::{BluestTransport, CycleConfig, MetricKind, RingClient, Shutdown};
//! # #[tokio::main]
//! # pub async fn main() {
//!     let address = "AA:BB:CC:DD:EE:FF".parse().unwrap();
//!     let mut client = RingClient::new(BluestTransport::new(), CycleConfig::default());
//!     let report = client.run_cycle(&address, &MetricKind::DEFAULT_ORDER, &mut Shutdown::never()).await;
//!     for (kind, outcome) in &report.outcomes {
//!         println!("{kind}: {outcome:?}");
//!     }
//! # }
//! ```

pub mod address;
pub mod bluest_transport;
pub mod config;
pub mod measurement;
mod message;
pub mod metric;
#[cfg(any(test, feature = "mock-transport"))]
pub mod mock_transport;
pub mod packet;
pub mod publish;
pub mod ring_client;
pub mod scheduler;
pub mod session;
pub mod shutdown;
pub mod transport;

pub use address::DeviceAddress;
pub use bluest_transport::BluestTransport;
pub use config::RingConfig;
pub use message::ReadingError;
pub use metric::{MeasurementResult, MetricKind, MetricOutcome, Reading};
pub use publish::{JsonStatePublisher, Publisher};
pub use ring_client::{CycleConfig, CycleReport, RingClient};
pub use scheduler::PollScheduler;
pub use shutdown::{Shutdown, ShutdownTrigger};
pub use transport::{Transport, TransportError};
