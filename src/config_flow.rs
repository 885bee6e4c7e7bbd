//! Interactive setup of heat transfer devices.
//!
//! Validates user supplied configurations against the host's live state,
//! suggests temperature sensors and turns accepted configurations into
//! registry entries. Failures are reported as [`FlowError`]s whose
//! [`key`](FlowError::key) is what a setup form displays.

use crate::compute::MetricKind;
use crate::config::{DeviceConfig, DeviceOptions};
use crate::error::HeatTransferError;
use crate::host::{Host, HostState};
use crate::registry::{ConfigEntry, Registry};
use log::{debug, error, info};
use std::collections::BTreeSet;
use strum::IntoStaticStr;
use thiserror::Error;

const DEVICE_CLASS_TEMPERATURE: &str = "temperature";

/// Device classes that never carry a temperature.
const EXCLUDED_DEVICE_CLASSES: &[&str] = &[
    "aqi",
    "battery",
    "carbon_monoxide",
    "carbon_dioxide",
    "current",
    "date",
    "energy",
    "frequency",
    "gas",
    "illuminance",
    "monetary",
    "nitrogen_dioxide",
    "nitrogen_monoxide",
    "nitrous_oxide",
    "ozone",
    "pm1",
    "pm10",
    "pm25",
    "power_factor",
    "power",
    "pressure",
    "signal_strength",
    "sulphur_dioxide",
    "timestamp",
    "volatile_organic_compounds",
    "voltage",
];

/// Domains whose entities cannot be used as a temperature input.
const EXCLUDED_DOMAINS: &[&str] = &[
    "air_quality",
    "alarm_control_panel",
    "automation",
    "binary_sensor",
    "button",
    "calendar",
    "camera",
    "climate",
    "cover",
    "device_tracker",
    "fan",
    "geo_location",
    "image_processing",
    "light",
    "lock",
    "mailbox",
    "media_player",
    "notify",
    "person",
    "remote",
    "scene",
    "script",
    "siren",
    "stt",
    "sun",
    "switch",
    "timer",
    "tts",
    "vacuum",
    "zone",
];

/// Units that rule an entity out as a temperature.
const EXCLUDED_UNITS: &[&str] = &[
    // Electric
    "W", "kW", "VA", "BTU/h", "Wh", "kWh", "MWh", "mA", "A", "mV", "V",
    // Angle and percentage
    "°", "%",
    // Currency
    "€", "$", "¢",
    // Time
    "μs", "ms", "s", "min", "h", "d", "w", "m", "y",
    // Length
    "mm", "cm", "km", "in", "ft", "yd", "mi",
    // Frequency
    "Hz", "kHz", "MHz", "GHz",
    // Pressure
    "Pa", "hPa", "kPa", "bar", "cbar", "mbar", "mmHg", "inHg", "psi",
    // Sound and signal
    "dB", "dBa", "dBm",
    // Volume and flow
    "L", "mL", "m³", "ft³", "gal", "fl. oz.", "m³/h", "ft³/m",
    // Area and mass
    "m²", "g", "kg", "mg", "µg", "oz", "lb",
    // Light and conductivity
    "µS/cm", "lx", "UV index", "W/m²", "BTU/(h×ft²)",
    // Precipitation and speed
    "mm/h", "in/h", "mm/d", "in/d", "m/s", "km/h", "mph",
    // Concentration
    "µg/m³", "mg/m³", "μg/ft³", "p/m³", "ppm", "ppb",
    // Data
    "bit", "kbit", "Mbit", "Gbit", "B", "kB", "MB", "GB", "TB", "KiB", "MiB", "GiB", "TiB",
    "bit/s", "kbit/s", "Mbit/s", "Gbit/s", "B/s", "kB/s", "MB/s", "GB/s", "KiB/s", "MiB/s",
    "GiB/s",
];

/// Errors surfaced to the user during setup.
#[derive(Error, Debug, Clone, PartialEq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum FlowError {
    #[error("Temperature sensor not found: {0}")]
    TemperatureNotFound(String),

    #[error("A device for {0} is already configured")]
    AlreadyConfigured(String),

    #[error("No temperature sensors available")]
    NoSensors,

    #[error("Unknown sensor type: {0}")]
    UnknownSensorType(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unexpected error: {0}")]
    Unknown(String),
}

impl FlowError {
    /// Stable error key for the setup form.
    pub fn key(&self) -> &'static str {
        self.into()
    }
}

impl From<HeatTransferError> for FlowError {
    fn from(e: HeatTransferError) -> Self {
        match e {
            HeatTransferError::UnknownSensorType(key) => FlowError::UnknownSensorType(key),
            HeatTransferError::Config(reason) => FlowError::InvalidConfig(reason),
            other => {
                error!("[Setup] Unexpected error: {}", other);
                FlowError::Unknown(other.to_string())
            }
        }
    }
}

/// Unique id of a device, derived from its two inputs.
pub fn unique_id_for(config: &DeviceConfig) -> String {
    format!(
        "{}-{}",
        config.in_temp_sensor_entity_id, config.out_temp_sensor_entity_id
    )
}

/// Both inputs of `config` must currently exist on the host.
pub fn validate_input(host: &dyn Host, config: &DeviceConfig) -> Result<(), FlowError> {
    for entity_id in [
        &config.in_temp_sensor_entity_id,
        &config.out_temp_sensor_entity_id,
    ] {
        if host.get_current_state(entity_id).is_none() {
            debug!("[Setup] {} has no current state", entity_id);
            return Err(FlowError::TemperatureNotFound(entity_id.clone()));
        }
    }
    Ok(())
}

/// Entity ids usable as a temperature input.
///
/// Sensors with the `temperature` device class come first, sorted. With
/// `include_all` every other entity that is not ruled out by its domain,
/// device class or unit follows, also sorted. Entities created by this bridge
/// are never offered.
pub fn temperature_candidates(host: &dyn Host, include_all: bool) -> Vec<String> {
    let states = host.all_states();

    let mut result: Vec<String> = states
        .iter()
        .filter(|state| {
            state.domain() == "sensor"
                && state.device_class.as_deref() == Some(DEVICE_CLASS_TEMPERATURE)
        })
        .map(|state| state.entity_id.clone())
        .collect();
    result.sort();
    debug!("[Setup] Temperature sensors by device class: {:?}", result);

    if include_all {
        let primary: BTreeSet<&str> = result.iter().map(String::as_str).collect();
        let additional: BTreeSet<String> = states
            .iter()
            .filter(|state| is_plausible_temperature(state))
            .filter(|state| !primary.contains(state.entity_id.as_str()))
            .map(|state| state.entity_id.clone())
            .collect();
        debug!("[Setup] Additional candidates: {:?}", additional);
        result.extend(additional);
    }

    result.retain(|entity_id| !is_own_entity(entity_id));
    result
}

fn is_plausible_temperature(state: &HostState) -> bool {
    let device_class_ok = state
        .device_class
        .as_deref()
        .is_none_or(|class| !EXCLUDED_DEVICE_CLASSES.contains(&class));
    let unit_ok = state
        .unit_of_measurement
        .as_deref()
        .is_none_or(|unit| !EXCLUDED_UNITS.contains(&unit));
    device_class_ok && unit_ok && !EXCLUDED_DOMAINS.contains(&state.domain())
}

fn is_own_entity(entity_id: &str) -> bool {
    MetricKind::all()
        .into_iter()
        .any(|kind| entity_id.contains(kind.key()))
}

/// Starting point for the setup form: the first candidate on both sides.
pub fn default_config(host: &dyn Host) -> Result<DeviceConfig, FlowError> {
    let candidates = temperature_candidates(host, false);
    let first = candidates.first().ok_or(FlowError::NoSensors)?;
    Ok(DeviceConfig::new(first.clone(), first.clone()))
}

/// Validate `config` and set the device up. Returns the new entry id.
pub fn create_entry(registry: &Registry, config: DeviceConfig) -> Result<String, FlowError> {
    validate_input(registry.host().as_ref(), &config)?;
    config.validate()?;

    let unique_id = unique_id_for(&config);
    if registry.find_by_unique_id(&unique_id).is_some() {
        return Err(FlowError::AlreadyConfigured(unique_id));
    }

    let entry_id = registry.setup_entry(ConfigEntry::new(unique_id, config))?;
    info!("[Setup] Created entry {}", entry_id);
    Ok(entry_id)
}

/// Validate new options for an existing entry and apply them.
pub fn options_flow(
    registry: &Registry,
    entry_id: &str,
    options: DeviceOptions,
) -> Result<(), FlowError> {
    let entry = registry
        .entry(entry_id)
        .ok_or_else(|| HeatTransferError::EntryNotFound(entry_id.to_string()))?;

    let merged = entry.data.with_options(&options);
    validate_input(registry.host().as_ref(), &merged)?;
    merged.validate()?;

    debug!("[Setup] Updating {} with {:?}", entry_id, options);
    registry.update_options(entry_id, options)?;
    Ok(())
}
