//! `ringread [CONFIG]`
//!
//! Polls a ring on a fixed interval and keeps the latest values in a JSON
//! state file. The config path defaults to `ringread.toml`.

use std::path::PathBuf;

use anyhow::Context;
use tracing::{info, warn};

use ringread::{shutdown, BluestTransport, JsonStatePublisher, PollScheduler, RingClient, RingConfig};

mod logging;

const DEFAULT_CONFIG_PATH: &str = "ringread.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args_os().nth(1).map(PathBuf::from).unwrap_or_else(|| DEFAULT_CONFIG_PATH.into());
    let config = RingConfig::load(&config_path).with_context(|| format!("loading {}", config_path.display()))?;

    logging::init(&config.logging)?;
    info!(config = %config_path.display(), "starting ringread");

    let address = config.device_address()?;
    let mut transport = BluestTransport::new();
    if let Some(name) = &config.name {
        transport = transport.with_name(name.clone());
    }
    let mut client = RingClient::new(transport, config.cycle_config());
    let mut publisher = JsonStatePublisher::open(&config.state_file, config.name.clone())?;
    let scheduler = PollScheduler::new(address, config.metrics(), config.scan_interval());

    let (trigger, shutdown) = shutdown::channel();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("cannot listen for Ctrl-C: {err}");
            return;
        }
        info!("interrupted, finishing up");
        trigger.trigger();
    });

    let cycles = scheduler.run(&mut client, &mut publisher, shutdown).await;
    info!(cycles, "stopped");
    Ok(())
}
