use crate::compute::MetricKind;
use crate::error::{HeatTransferError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Display name used when none is configured.
pub const DEFAULT_NAME: &str = "Heat Transfer";

/// Poll interval used when `scan_interval` is not set.
pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 30;

/// Load environment variables from .env file with robust parsing.
/// Handles values with spaces without requiring quotes.
pub fn load_dotenv() {
    let env_path = Path::new(".env");
    if !env_path.exists() {
        return;
    }

    let content = match fs::read_to_string(env_path) {
        Ok(c) => c,
        Err(_) => return,
    };

    for (key, value) in parse_dotenv(&content) {
        // Only set if not already set (env vars take precedence)
        if std::env::var(key).is_err() {
            // SAFETY: We're single-threaded at this point (called before any async runtime)
            unsafe { std::env::set_var(key, value) };
        }
    }
}

/// Split `.env` content into key/value pairs, skipping blanks and comments.
fn parse_dotenv(content: &str) -> Vec<(&str, &str)> {
    let mut pairs = Vec::new();
    for line in content.lines() {
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some((key, value)) = line.split_once('=') {
            let mut value = value.trim();

            // Remove surrounding quotes if present
            if value.len() >= 2
                && ((value.starts_with('"') && value.ends_with('"'))
                    || (value.starts_with('\'') && value.ends_with('\'')))
            {
                value = &value[1..value.len() - 1];
            }

            pairs.push((key.trim(), value));
        }
    }
    pairs
}

/// Default location of the configuration file.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("heat-transfer")
        .join("config.json")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Base topic of Home Assistant's `mqtt_statestream` integration.
    pub statestream_prefix: String,
    /// MQTT discovery prefix Home Assistant listens on.
    pub discovery_prefix: String,
    /// Topic root for the bridge's own state and attribute topics.
    pub node_id: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            client_id: "heat-transfer-bridge".to_string(),
            username: None,
            password: None,
            statestream_prefix: "homeassistant/statestream".to_string(),
            discovery_prefix: "homeassistant".to_string(),
            node_id: "heat_transfer".to_string(),
        }
    }
}

/// One logical heat transfer device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_name")]
    pub name: String,
    pub in_temp_sensor_entity_id: String,
    pub out_temp_sensor_entity_id: String,
    #[serde(default)]
    pub poll: bool,
    #[serde(default = "default_scan_interval")]
    pub scan_interval: u64,
    /// Metric keys to expose. Absent or empty exposes every metric.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled_sensors: Option<Vec<String>>,
}

fn default_name() -> String {
    DEFAULT_NAME.to_string()
}

fn default_scan_interval() -> u64 {
    DEFAULT_SCAN_INTERVAL_SECS
}

impl DeviceConfig {
    pub fn new(in_entity_id: impl Into<String>, out_entity_id: impl Into<String>) -> Self {
        Self {
            name: default_name(),
            in_temp_sensor_entity_id: in_entity_id.into(),
            out_temp_sensor_entity_id: out_entity_id.into(),
            poll: false,
            scan_interval: DEFAULT_SCAN_INTERVAL_SECS,
            enabled_sensors: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll(mut self, scan_interval: u64) -> Self {
        self.poll = true;
        self.scan_interval = scan_interval;
        self
    }

    /// Poll interval, only set when polling is enabled.
    pub fn poll_interval(&self) -> Option<Duration> {
        self.poll
            .then(|| Duration::from_secs(self.scan_interval.max(1)))
    }

    /// Metrics to expose, in declaration order.
    pub fn enabled_metrics(&self) -> Result<Vec<MetricKind>> {
        match &self.enabled_sensors {
            Some(keys) if !keys.is_empty() => {
                let mut kinds = keys
                    .iter()
                    .map(|key| MetricKind::from_key(key))
                    .collect::<Result<Vec<_>>>()?;
                kinds.sort();
                kinds.dedup();
                Ok(kinds)
            }
            _ => Ok(MetricKind::all()),
        }
    }

    /// Apply options on top of this configuration, field by field.
    pub fn with_options(&self, options: &DeviceOptions) -> DeviceConfig {
        DeviceConfig {
            name: options.name.clone().unwrap_or_else(|| self.name.clone()),
            in_temp_sensor_entity_id: options
                .in_temp_sensor_entity_id
                .clone()
                .unwrap_or_else(|| self.in_temp_sensor_entity_id.clone()),
            out_temp_sensor_entity_id: options
                .out_temp_sensor_entity_id
                .clone()
                .unwrap_or_else(|| self.out_temp_sensor_entity_id.clone()),
            poll: options.poll.unwrap_or(self.poll),
            scan_interval: options.scan_interval.unwrap_or(self.scan_interval),
            enabled_sensors: options
                .enabled_sensors
                .clone()
                .or_else(|| self.enabled_sensors.clone()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.in_temp_sensor_entity_id.trim().is_empty() {
            return Err(HeatTransferError::Config(
                "in_temp_sensor_entity_id must not be empty".to_string(),
            ));
        }
        if self.out_temp_sensor_entity_id.trim().is_empty() {
            return Err(HeatTransferError::Config(
                "out_temp_sensor_entity_id must not be empty".to_string(),
            ));
        }
        if self.poll && self.scan_interval == 0 {
            return Err(HeatTransferError::Config(
                "scan_interval must be at least 1 second".to_string(),
            ));
        }
        self.enabled_metrics()?;
        Ok(())
    }
}

/// Options set after creation. Any field left `None` keeps the original.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceOptions {
    pub name: Option<String>,
    pub in_temp_sensor_entity_id: Option<String>,
    pub out_temp_sensor_entity_id: Option<String>,
    pub poll: Option<bool>,
    pub scan_interval: Option<u64>,
    pub enabled_sensors: Option<Vec<String>>,
}

impl Config {
    /// Load from a JSON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::warn!(
                "Config file {} not found, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse the file. Devices are validated one by one when they are set
    /// up, so a bad device block does not take the others down with it.
    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Override MQTT settings from the environment.
    pub fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("MQTT_BROKER_HOST") {
            self.mqtt.broker_host = host;
        }
        if let Ok(port) = std::env::var("MQTT_BROKER_PORT")
            && let Ok(p) = port.parse()
        {
            self.mqtt.broker_port = p;
        }
        if let Ok(client_id) = std::env::var("MQTT_CLIENT_ID") {
            self.mqtt.client_id = client_id;
        }
        if let Ok(username) = std::env::var("MQTT_USERNAME") {
            self.mqtt.username = Some(username);
        }
        if let Ok(password) = std::env::var("MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        if let Ok(prefix) = std::env::var("HA_STATESTREAM_PREFIX") {
            self.mqtt.statestream_prefix = prefix;
        }
        if let Ok(prefix) = std::env::var("HA_DISCOVERY_PREFIX") {
            self.mqtt.discovery_prefix = prefix;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_defaults() {
        let config = Config::from_json(
            r#"{
                "devices": [
                    {
                        "in_temp_sensor_entity_id": "sensor.living_room",
                        "out_temp_sensor_entity_id": "sensor.garden"
                    }
                ]
            }"#,
        )
        .unwrap();

        let device = &config.devices[0];
        assert_eq!(device.name, DEFAULT_NAME);
        assert!(!device.poll);
        assert_eq!(device.scan_interval, 30);
        assert_eq!(device.poll_interval(), None);
        assert_eq!(device.enabled_metrics().unwrap(), MetricKind::all());
        assert_eq!(config.mqtt.broker_port, 1883);
    }

    #[test]
    fn test_poll_interval() {
        let device = DeviceConfig::new("sensor.a", "sensor.b").with_poll(45);
        assert_eq!(device.poll_interval(), Some(Duration::from_secs(45)));
    }

    #[test]
    fn test_invalid_device_does_not_reject_file() {
        let config = Config::from_json(
            r#"{
                "devices": [
                    {
                        "in_temp_sensor_entity_id": "sensor.a",
                        "out_temp_sensor_entity_id": "sensor.b",
                        "enabled_sensors": ["heat_transfer_coefficient", "humidex"]
                    },
                    {
                        "in_temp_sensor_entity_id": "sensor.c",
                        "out_temp_sensor_entity_id": "sensor.d",
                        "poll": true,
                        "scan_interval": 0
                    },
                    {
                        "in_temp_sensor_entity_id": "sensor.e",
                        "out_temp_sensor_entity_id": "sensor.f"
                    }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.devices.len(), 3);
        assert!(matches!(
            config.devices[0].validate(),
            Err(HeatTransferError::UnknownSensorType(key)) if key == "humidex"
        ));
        assert!(matches!(
            config.devices[1].validate(),
            Err(HeatTransferError::Config(_))
        ));
        assert!(config.devices[2].validate().is_ok());
    }

    #[test]
    fn test_malformed_file_is_rejected() {
        assert!(matches!(
            Config::from_json(r#"{"devices": [{"name": "No inputs"}]}"#),
            Err(HeatTransferError::SerdeJsonError(_))
        ));
    }

    #[test]
    fn test_empty_enabled_sensors_means_all() {
        let mut device = DeviceConfig::new("sensor.a", "sensor.b");
        device.enabled_sensors = Some(vec![]);
        assert_eq!(device.enabled_metrics().unwrap(), MetricKind::all());
    }

    #[test]
    fn test_options_override_data() {
        let device = DeviceConfig::new("sensor.a", "sensor.b").with_name("Attic");
        let options = DeviceOptions {
            out_temp_sensor_entity_id: Some("sensor.c".to_string()),
            poll: Some(true),
            ..Default::default()
        };

        let merged = device.with_options(&options);
        assert_eq!(merged.name, "Attic");
        assert_eq!(merged.in_temp_sensor_entity_id, "sensor.a");
        assert_eq!(merged.out_temp_sensor_entity_id, "sensor.c");
        assert!(merged.poll);
        assert_eq!(merged.scan_interval, 30);
    }

    #[test]
    fn test_empty_entity_id_is_invalid() {
        let device = DeviceConfig::new("", "sensor.b");
        assert!(matches!(
            device.validate(),
            Err(HeatTransferError::Config(_))
        ));
    }

    #[test]
    fn test_parse_dotenv() {
        let pairs = parse_dotenv(
            "# broker\nMQTT_BROKER_HOST = 10.0.0.2\n\nMQTT_USERNAME=\"home user\"\nBROKEN LINE\n",
        );
        assert_eq!(
            pairs,
            vec![
                ("MQTT_BROKER_HOST", "10.0.0.2"),
                ("MQTT_USERNAME", "home user")
            ]
        );
    }
}
