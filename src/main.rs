use clap::{Parser, Subcommand};
use heat_transfer_bridge::config::{self, Config};
use heat_transfer_bridge::config_flow;
use heat_transfer_bridge::host::MqttHost;
use heat_transfer_bridge::instance_lock::{InstanceLock, InstanceLockError};
use heat_transfer_bridge::registry::Registry;
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::signal::unix::{SignalKind, signal as unix_signal};

/// Seconds to wait for retained statestream messages after connecting.
const DEFAULT_SETTLE_SECS: u64 = 3;

#[derive(Parser)]
#[command(name = "heat-transfer")]
#[command(about = "Publish heat transfer coefficients of Home Assistant temperature sensors")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(long, env = "HEAT_TRANSFER_CONFIG")]
    config: Option<PathBuf>,

    /// Seconds to wait for the initial entity states
    #[arg(long, default_value_t = DEFAULT_SETTLE_SECS)]
    settle: u64,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge until interrupted (default). SIGHUP reloads the
    /// declared devices from the configuration file.
    Run,
    /// Check every declared device against the live entity states
    Check,
    /// List entities usable as temperature inputs
    Candidates {
        /// Also list entities without the temperature device class
        #[arg(long)]
        all: bool,
    },
}

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn main() -> ExitCode {
    // Environment must be settled before the runtime spawns threads
    config::load_dotenv();
    init_logger();

    let cli = Cli::parse();
    let path = cli.config.clone().unwrap_or_else(config::default_config_path);
    let mut config = match Config::load(&path) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load {}: {}", path.display(), e);
            return ExitCode::FAILURE;
        }
    };
    config.apply_env();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let settle = Duration::from_secs(cli.settle);
    runtime.block_on(async move {
        match cli.command.unwrap_or(Commands::Run) {
            Commands::Run => run(config, path, settle).await,
            Commands::Check => check(config, settle).await,
            Commands::Candidates { all } => candidates(config, settle, all).await,
        }
    })
}

async fn run(config: Config, path: PathBuf, settle: Duration) -> ExitCode {
    info!("Starting Heat Transfer Bridge");

    let _lock = match InstanceLock::acquire() {
        Ok(lock) => lock,
        Err(InstanceLockError::AlreadyRunning) => {
            error!("Another instance of the bridge is already running");
            return ExitCode::FAILURE;
        }
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let (host, mqtt_task) = MqttHost::connect(&config.mqtt);
    tokio::time::sleep(settle).await;
    info!("[MQTT] {} entity state(s) known", host.known_state_count());

    let registry = Registry::new(host.clone());
    let entry_ids = registry.setup_declared(&config.devices);
    if entry_ids.is_empty() {
        warn!("No devices configured, nothing to publish");
    }

    info!("Heat Transfer Bridge is running with {} device(s)", entry_ids.len());
    info!("  - Press Ctrl+C to exit");
    info!("  - Send SIGHUP to reload {}", path.display());

    let mut hangup = match unix_signal(SignalKind::hangup()) {
        Ok(hangup) => Some(hangup),
        Err(e) => {
            warn!("Reload on SIGHUP unavailable: {}", e);
            None
        }
    };

    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received shutdown signal"),
                    Err(e) => error!("Failed to listen for shutdown signal: {}", e),
                }
                break;
            }
            Some(()) = async {
                match hangup.as_mut() {
                    Some(hangup) => hangup.recv().await,
                    None => std::future::pending().await,
                }
            } => reload(&registry, &path),
        }
    }

    if let Err(e) = host.go_offline().await {
        warn!("[MQTT] {}", e);
    }
    registry.shutdown();

    // Give the event loop a moment to flush the availability message
    tokio::time::sleep(Duration::from_millis(200)).await;
    mqtt_task.abort();

    info!("Heat Transfer Bridge stopped");
    ExitCode::SUCCESS
}

/// Re-read the configuration file and replace the declared devices. A file
/// that cannot be read keeps the current devices.
fn reload(registry: &Registry, path: &Path) {
    info!("[Setup] Reloading {}", path.display());
    match Config::load(path) {
        Ok(config) => {
            let entry_ids = registry.reload_declared(&config.devices);
            info!("[Setup] Reloaded, {} declared device(s) running", entry_ids.len());
        }
        Err(e) => error!("[Setup] Reload failed, keeping current devices: {}", e),
    }
}

async fn connect_and_settle(config: &Config, settle: Duration) -> Arc<MqttHost> {
    let (host, _task) = MqttHost::connect(&config.mqtt);
    tokio::time::sleep(settle).await;
    host
}

async fn check(config: Config, settle: Duration) -> ExitCode {
    if config.devices.is_empty() {
        println!("No devices declared");
        return ExitCode::SUCCESS;
    }

    let host = connect_and_settle(&config, settle).await;
    let mut failed = 0;
    for device in &config.devices {
        let unique_id = config_flow::unique_id_for(device);
        let result = config_flow::validate_input(host.as_ref(), device)
            .and_then(|_| device.validate().map_err(config_flow::FlowError::from));
        match result {
            Ok(()) => println!("ok: {} ({})", device.name, unique_id),
            Err(e) => {
                failed += 1;
                println!("{}: {} ({}): {}", e.key(), device.name, unique_id, e);
            }
        }
    }

    if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn candidates(config: Config, settle: Duration, include_all: bool) -> ExitCode {
    let host = connect_and_settle(&config, settle).await;
    let candidates = config_flow::temperature_candidates(host.as_ref(), include_all);
    if candidates.is_empty() {
        println!("{}", config_flow::FlowError::NoSensors.key());
        return ExitCode::FAILURE;
    }
    for entity_id in candidates {
        println!("{}", entity_id);
    }
    ExitCode::SUCCESS
}
