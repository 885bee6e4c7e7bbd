//! Host automation platform interface.
//!
//! The bridge never talks to Home Assistant directly. Everything it needs
//! (current states, change notifications, entity registration and state
//! publishing) goes through the [`Host`] trait so the reactive core can run
//! against MQTT in production and against [`memory::MemoryHost`] in tests.

pub mod memory;
pub mod mqtt;

use crate::units::TemperatureReading;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

pub use memory::MemoryHost;
pub use mqtt::MqttHost;

/// Current state of a host entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub unit_of_measurement: Option<String>,
    #[serde(default)]
    pub device_class: Option<String>,
}

impl HostState {
    pub fn new(entity_id: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            state: state.into(),
            unit_of_measurement: None,
            device_class: None,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit_of_measurement = Some(unit.into());
        self
    }

    pub fn with_device_class(mut self, device_class: impl Into<String>) -> Self {
        self.device_class = Some(device_class.into());
        self
    }

    /// Entity domain, the part before the first dot (`sensor`, `input_number`).
    pub fn domain(&self) -> &str {
        self.entity_id
            .split_once('.')
            .map(|(domain, _)| domain)
            .unwrap_or_default()
    }

    /// View this state as a temperature reading.
    pub fn reading(&self) -> TemperatureReading {
        TemperatureReading::new(self.state.clone(), self.unit_of_measurement.as_deref())
    }
}

/// Static description of an entity exposed by the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub unique_id: String,
    pub name: String,
    pub device_id: String,
    pub device_name: String,
    pub unit_of_measurement: String,
    pub icon: String,
}

/// A state update for an entity exposed by the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedState {
    pub state: f64,
    pub attributes: BTreeMap<String, f64>,
    pub last_updated: DateTime<Utc>,
}

/// Callback invoked with every new state of a subscribed entity.
pub type StateCallback = Arc<dyn Fn(&HostState) + Send + Sync>;

/// The host automation platform, as seen by the bridge.
pub trait Host: Send + Sync {
    /// Watch an entity. Callbacks run in delivery order until the returned
    /// [`Subscription`] is cancelled or dropped.
    fn subscribe(&self, entity_id: &str, callback: StateCallback) -> Subscription;

    fn get_current_state(&self, entity_id: &str) -> Option<HostState>;

    /// Every entity state the host currently knows about.
    fn all_states(&self) -> Vec<HostState>;

    fn register_entity(&self, entity: &EntityDescriptor);

    fn unregister_entity(&self, unique_id: &str);

    fn publish_state(&self, unique_id: &str, state: &PublishedState);
}

/// Per-entity callback lists shared by host implementations.
#[derive(Default)]
pub struct SubscriberTable {
    next_id: AtomicU64,
    callbacks: RwLock<HashMap<String, Vec<(u64, StateCallback)>>>,
}

impl SubscriberTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(self: &Arc<Self>, entity_id: &str, callback: StateCallback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.callbacks
            .write()
            .entry(entity_id.to_string())
            .or_default()
            .push((id, callback));
        Subscription {
            id,
            entity_id: entity_id.to_string(),
            table: Arc::downgrade(self),
        }
    }

    /// Deliver a state to every subscriber of its entity.
    ///
    /// Callbacks are invoked outside the table lock so they may subscribe or
    /// cancel subscriptions themselves.
    pub fn dispatch(&self, state: &HostState) {
        let callbacks: Vec<StateCallback> = match self.callbacks.read().get(&state.entity_id) {
            Some(list) => list.iter().map(|(_, cb)| cb.clone()).collect(),
            None => return,
        };
        for callback in callbacks {
            callback(state);
        }
    }

    pub fn subscriber_count(&self, entity_id: &str) -> usize {
        self.callbacks
            .read()
            .get(entity_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn remove(&self, entity_id: &str, id: u64) {
        let mut callbacks = self.callbacks.write();
        if let Some(list) = callbacks.get_mut(entity_id) {
            list.retain(|(entry_id, _)| *entry_id != id);
            if list.is_empty() {
                callbacks.remove(entity_id);
            }
        }
    }
}

/// Cancel token for a state subscription. Dropping it cancels too.
pub struct Subscription {
    id: u64,
    entity_id: String,
    table: Weak<SubscriberTable>,
}

impl Subscription {
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            table.remove(&self.entity_id, self.id);
        }
    }
}
