//! Watch temperature entities as the bridge sees them.
//!
//! Usage:
//!   cargo run --bin statestream-watch -- sensor.living_room sensor.garden
//!
//! Connects to the MQTT broker, follows the given entities through
//! Home Assistant's statestream and logs every reading together with its
//! normalized Celsius value or the reason it would be rejected.

use clap::Parser;
use heat_transfer_bridge::config::{self, Config};
use heat_transfer_bridge::host::{Host, HostState, MqttHost, Subscription};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "statestream-watch")]
#[command(about = "Log temperature readings received through mqtt_statestream")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(long, env = "HEAT_TRANSFER_CONFIG")]
    config: Option<PathBuf>,

    /// Entity ids to follow
    #[arg(required = true)]
    entity_ids: Vec<String>,
}

fn log_reading(state: &HostState) {
    match state.reading().normalize() {
        Ok(celsius) => info!(
            "{} = {} {} -> {:.2}°C",
            state.entity_id,
            state.state,
            state.unit_of_measurement.as_deref().unwrap_or("(no unit)"),
            celsius
        ),
        Err(e) => warn!("{} = {} rejected: {}", state.entity_id, state.state, e),
    }
}

#[tokio::main]
async fn main() {
    // Load .env file before anything else
    config::load_dotenv();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let path = cli.config.unwrap_or_else(config::default_config_path);
    let mut config = Config::load(&path).unwrap_or_else(|e| {
        warn!("Ignoring {}: {}", path.display(), e);
        Config::default()
    });
    config.apply_env();

    let (host, mqtt_task) = MqttHost::connect(&config.mqtt);
    let _subscriptions: Vec<Subscription> = cli
        .entity_ids
        .iter()
        .map(|entity_id| host.subscribe(entity_id, Arc::new(log_reading)))
        .collect();

    info!(
        "Watching {} entities. Press Ctrl+C to exit.",
        cli.entity_ids.len()
    );

    tokio::select! {
        _ = mqtt_task => {
            warn!("MQTT task ended");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }
}
