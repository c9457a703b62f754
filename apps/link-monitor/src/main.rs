mod config;
mod cycle;
mod error;
mod link;
mod modem;
mod probe;
mod publish;
mod radio;
mod sample;
mod store;
mod supervisor;

use crate::config::Config;
use crate::cycle::PollingCycle;
use crate::link::LinkController;
use crate::modem::SerialModem;
use crate::probe::PingProber;
use crate::publish::{MqttConnector, Publisher};
use crate::radio::RadioReader;
use crate::supervisor::Supervisor;
use anyhow::Result;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,link_monitor=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing()?;

    store::bootstrap(config.storage_roots())?;

    let modem = SerialModem::new(&config.modem_device, config.modem_baud, config.modem_timeout);
    let link = LinkController::new(modem, config.settle_interval);
    let radio = RadioReader::new(config.radio_command.clone(), config.signal_command.clone());
    let cycle = PollingCycle::new(&config, link, PingProber::new(config.probe_timeout), radio);
    let publisher = Publisher::new(MqttConnector::new(&config), config.publish_window);
    let mut supervisor = Supervisor::new(&config, cycle, publisher);

    tracing::info!(
        device_id = %config.device_id,
        modem = %config.modem_device,
        broker = %format!("{}:{}", config.mqtt_host, config.mqtt_port),
        "link-monitor starting"
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        result = supervisor.run() => {
            if let Err(err) = result {
                tracing::error!(error=%err, "supervisor stopped");
                return Err(err.into());
            }
        }
    }

    Ok(())
}
