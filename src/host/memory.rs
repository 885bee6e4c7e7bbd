//! In-process host.
//!
//! Keeps states, registered entities and published values in memory. Used by
//! the test suite and handy for driving a device by hand.

use super::{
    EntityDescriptor, Host, HostState, PublishedState, StateCallback, SubscriberTable,
    Subscription,
};
use log::debug;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Default)]
pub struct MemoryHost {
    states: RwLock<BTreeMap<String, HostState>>,
    subscribers: Arc<SubscriberTable>,
    entities: RwLock<BTreeMap<String, EntityDescriptor>>,
    published: RwLock<HashMap<String, Vec<PublishedState>>>,
}

impl MemoryHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Set a plain temperature state and notify subscribers.
    pub fn set_state(&self, entity_id: &str, state: &str, unit: Option<&str>) {
        let mut host_state = HostState::new(entity_id, state).with_device_class("temperature");
        host_state.unit_of_measurement = unit.map(str::to_string);
        self.set_host_state(host_state);
    }

    /// Store a full state and notify subscribers.
    pub fn set_host_state(&self, state: HostState) {
        debug!("[Host] {} = {}", state.entity_id, state.state);
        self.states
            .write()
            .insert(state.entity_id.clone(), state.clone());
        self.subscribers.dispatch(&state);
    }

    /// Store a state without notifying anyone, as if it predates subscribers.
    pub fn seed_state(&self, state: HostState) {
        self.states.write().insert(state.entity_id.clone(), state);
    }

    pub fn remove_state(&self, entity_id: &str) {
        self.states.write().remove(entity_id);
    }

    pub fn subscriber_count(&self, entity_id: &str) -> usize {
        self.subscribers.subscriber_count(entity_id)
    }

    pub fn entity(&self, unique_id: &str) -> Option<EntityDescriptor> {
        self.entities.read().get(unique_id).cloned()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.read().len()
    }

    /// Every state published for an entity, oldest first.
    pub fn published(&self, unique_id: &str) -> Vec<PublishedState> {
        self.published
            .read()
            .get(unique_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn last_published(&self, unique_id: &str) -> Option<PublishedState> {
        self.published
            .read()
            .get(unique_id)
            .and_then(|states| states.last().cloned())
    }
}

impl Host for MemoryHost {
    fn subscribe(&self, entity_id: &str, callback: StateCallback) -> Subscription {
        self.subscribers.subscribe(entity_id, callback)
    }

    fn get_current_state(&self, entity_id: &str) -> Option<HostState> {
        self.states.read().get(entity_id).cloned()
    }

    fn all_states(&self) -> Vec<HostState> {
        self.states.read().values().cloned().collect()
    }

    fn register_entity(&self, entity: &EntityDescriptor) {
        self.entities
            .write()
            .insert(entity.unique_id.clone(), entity.clone());
    }

    fn unregister_entity(&self, unique_id: &str) {
        self.entities.write().remove(unique_id);
    }

    fn publish_state(&self, unique_id: &str, state: &PublishedState) {
        self.published
            .write()
            .entry(unique_id.to_string())
            .or_default()
            .push(state.clone());
    }
}
