//! Config entries and the devices loaded from them.
//!
//! The application owns one [`Registry`]. Each loaded entry holds its running
//! [`ReactiveDevice`] and the sensors attached to it; unloading an entry tears
//! all of that down again.

use crate::config::{DeviceConfig, DeviceOptions};
use crate::config_flow::unique_id_for;
use crate::device::ReactiveDevice;
use crate::error::{HeatTransferError, Result};
use crate::host::Host;
use crate::sensor::HeatTransferSensor;
use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Where an entry came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntrySource {
    /// Created through the setup flow.
    #[default]
    User,
    /// Declared in the configuration file; replaced on every reload.
    Declared,
}

/// A configured heat transfer device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub entry_id: String,
    pub unique_id: String,
    pub title: String,
    pub data: DeviceConfig,
    #[serde(default)]
    pub options: DeviceOptions,
    #[serde(default)]
    pub source: EntrySource,
}

impl ConfigEntry {
    pub fn new(unique_id: impl Into<String>, data: DeviceConfig) -> Self {
        Self {
            entry_id: Uuid::new_v4().to_string(),
            unique_id: unique_id.into(),
            title: data.name.clone(),
            data,
            options: DeviceOptions::default(),
            source: EntrySource::User,
        }
    }

    pub fn declared(unique_id: impl Into<String>, data: DeviceConfig) -> Self {
        Self {
            source: EntrySource::Declared,
            ..Self::new(unique_id, data)
        }
    }

    /// Data with options applied on top.
    pub fn effective_config(&self) -> DeviceConfig {
        self.data.with_options(&self.options)
    }
}

struct LoadedEntry {
    entry: ConfigEntry,
    device: Arc<ReactiveDevice>,
    sensors: Vec<Arc<HeatTransferSensor>>,
}

impl LoadedEntry {
    /// Attach the sensors, then start the device so the seed fan-out reaches
    /// them.
    fn activate(&self) {
        for sensor in &self.sensors {
            sensor.attach();
        }
        self.device.start();
    }

    fn teardown(&self) {
        for sensor in &self.sensors {
            sensor.detach();
        }
        self.device.shutdown();
    }
}

pub struct Registry {
    host: Arc<dyn Host>,
    entries: Mutex<BTreeMap<String, LoadedEntry>>,
}

impl Registry {
    pub fn new(host: Arc<dyn Host>) -> Self {
        Self {
            host,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    /// Build the device of `entry` with one sensor per enabled metric.
    /// Nothing touches the host until the result is activated.
    fn build(&self, entry: ConfigEntry) -> Result<LoadedEntry> {
        let config = entry.effective_config();
        let device = ReactiveDevice::new(entry.unique_id.clone(), &config, self.host.clone())?;
        let sensors = device
            .metrics()
            .map(|kind| HeatTransferSensor::new(&device, kind, self.host.clone()))
            .collect();
        Ok(LoadedEntry {
            entry,
            device,
            sensors,
        })
    }

    /// Build and start the device of `entry`. Returns the entry id.
    ///
    /// Must be called from within a tokio runtime.
    pub fn setup_entry(&self, entry: ConfigEntry) -> Result<String> {
        let loaded = self.build(entry)?;
        let entry_id = loaded.entry.entry_id.clone();

        if let Some(previous) = self.entries.lock().remove(&entry_id) {
            warn!("[Registry] Replacing already loaded entry {}", entry_id);
            previous.teardown();
        }
        self.install(loaded);
        Ok(entry_id)
    }

    fn install(&self, loaded: LoadedEntry) {
        loaded.activate();
        info!(
            "[Registry] Set up {} ({}) with {} sensor(s)",
            loaded.entry.title,
            loaded.entry.unique_id,
            loaded.sensors.len()
        );
        self.entries
            .lock()
            .insert(loaded.entry.entry_id.clone(), loaded);
    }

    /// Swap a loaded entry for `entry`. The replacement is built first, so a
    /// configuration that fails to build leaves the running device untouched.
    fn replace_entry(&self, entry: ConfigEntry) -> Result<()> {
        let loaded = self.build(entry)?;
        let previous = self
            .entries
            .lock()
            .remove(&loaded.entry.entry_id)
            .ok_or_else(|| HeatTransferError::EntryNotFound(loaded.entry.entry_id.clone()))?;
        previous.teardown();
        self.install(loaded);
        Ok(())
    }

    /// Detach all sensors of the entry, stop its device and forget it.
    pub fn unload_entry(&self, entry_id: &str) -> Result<ConfigEntry> {
        let loaded = self
            .entries
            .lock()
            .remove(entry_id)
            .ok_or_else(|| HeatTransferError::EntryNotFound(entry_id.to_string()))?;
        loaded.teardown();
        info!("[Registry] Unloaded {}", loaded.entry.unique_id);
        Ok(loaded.entry)
    }

    pub fn reload_entry(&self, entry_id: &str) -> Result<()> {
        let entry = self
            .entry(entry_id)
            .ok_or_else(|| HeatTransferError::EntryNotFound(entry_id.to_string()))?;
        self.replace_entry(entry)
    }

    /// Store new options for an entry and reload it. Options the device
    /// cannot be built from are rejected and the entry keeps running as is.
    pub fn update_options(&self, entry_id: &str, options: DeviceOptions) -> Result<()> {
        let mut entry = self
            .entry(entry_id)
            .ok_or_else(|| HeatTransferError::EntryNotFound(entry_id.to_string()))?;
        entry.options = options;
        entry.title = entry.effective_config().name;
        self.replace_entry(entry)
    }

    /// Load devices declared in the configuration file. Inputs are not
    /// checked against the host; a missing input simply stays absent.
    ///
    /// Each device is validated on its own; one that fails is logged and
    /// skipped.
    pub fn setup_declared(&self, configs: &[DeviceConfig]) -> Vec<String> {
        let mut entry_ids = Vec::with_capacity(configs.len());
        for config in configs {
            let unique_id = unique_id_for(config);
            if self.find_by_unique_id(&unique_id).is_some() {
                warn!("[Registry] Skipping duplicate device {}", unique_id);
                continue;
            }
            match self.setup_entry(ConfigEntry::declared(unique_id, config.clone())) {
                Ok(entry_id) => entry_ids.push(entry_id),
                Err(e) => warn!("[Registry] Failed to set up {}: {}", config.name, e),
            }
        }
        entry_ids
    }

    /// Replace every declared entry with the devices in `configs`. Entries
    /// created through the setup flow are left alone.
    pub fn reload_declared(&self, configs: &[DeviceConfig]) -> Vec<String> {
        let declared: Vec<LoadedEntry> = {
            let mut entries = self.entries.lock();
            let ids: Vec<String> = entries
                .values()
                .filter(|loaded| loaded.entry.source == EntrySource::Declared)
                .map(|loaded| loaded.entry.entry_id.clone())
                .collect();
            ids.iter().filter_map(|id| entries.remove(id)).collect()
        };
        for loaded in &declared {
            loaded.teardown();
        }

        let entry_ids = self.setup_declared(configs);
        info!(
            "[Registry] Reloaded declared devices: {} unloaded, {} set up",
            declared.len(),
            entry_ids.len()
        );
        entry_ids
    }

    pub fn entry(&self, entry_id: &str) -> Option<ConfigEntry> {
        self.entries
            .lock()
            .get(entry_id)
            .map(|loaded| loaded.entry.clone())
    }

    pub fn entry_ids(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn device(&self, entry_id: &str) -> Option<Arc<ReactiveDevice>> {
        self.entries
            .lock()
            .get(entry_id)
            .map(|loaded| loaded.device.clone())
    }

    pub fn sensors(&self, entry_id: &str) -> Vec<Arc<HeatTransferSensor>> {
        self.entries
            .lock()
            .get(entry_id)
            .map(|loaded| loaded.sensors.clone())
            .unwrap_or_default()
    }

    /// Entry id of the entry with this device unique id.
    pub fn find_by_unique_id(&self, unique_id: &str) -> Option<String> {
        self.entries
            .lock()
            .values()
            .find(|loaded| loaded.entry.unique_id == unique_id)
            .map(|loaded| loaded.entry.entry_id.clone())
    }

    /// Unload every entry.
    pub fn shutdown(&self) {
        let entries: Vec<LoadedEntry> = std::mem::take(&mut *self.entries.lock())
            .into_values()
            .collect();
        for loaded in &entries {
            loaded.teardown();
        }
        info!("[Registry] Unloaded all {} entries", entries.len());
    }
}
