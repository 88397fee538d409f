use std::sync::Arc;

use log::info;
use tokio::sync::mpsc;

use uwb_bridge::api::controller::UwbControllerClient;
use uwb_bridge::api::host::register_host_api;
use uwb_bridge::config::UwbConfig;
use uwb_bridge::error::Result;
use uwb_bridge::host::{UndeliveredEvent, UwbHost};
use uwb_bridge::messenger::Endpoint;
use uwb_bridge::radio::SimulatedRadio;

async fn log_undelivered(mut undelivered: mpsc::Receiver<UndeliveredEvent>) {
    while let Some(UndeliveredEvent { event, error }) = undelivered.recv().await {
        info!("Controller missed {}: {}", event.kind().name(), error);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    info!("Starting uwb bridge");

    let config = UwbConfig::load("uwb-bridge-config.json").await?;

    let endpoint = Arc::new(Endpoint::new(
        tokio::io::stdin(),
        tokio::io::stdout(),
        config.request_buffer_size,
    ));

    let (radio, signals) =
        SimulatedRadio::new(config.uwb_supported, config.event_buffer_size);

    let controller = UwbControllerClient::new(endpoint.clone(), &config.namespace);

    let host =
        Arc::new(UwbHost::new(radio, signals, Arc::new(controller), &config));

    if let Some(undelivered) = host.take_undelivered() {
        tokio::spawn(log_undelivered(undelivered));
    }

    register_host_api(endpoint.as_ref(), &config.namespace, Some(host.clone()));

    info!("Host ready on namespace {}", config.namespace);

    endpoint.closed().await;

    register_host_api(endpoint.as_ref(), &config.namespace, None);

    info!("uwb bridge stopped");

    Ok(())
}
