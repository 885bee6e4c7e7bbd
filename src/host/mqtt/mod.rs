//! Home Assistant over MQTT.
//!
//! Entity states come in through the `mqtt_statestream` integration. Bridge
//! sensors go out through MQTT discovery: one retained config message per
//! entity, then plain state and JSON attribute topics under `node_id`.

mod client;
pub mod statestream;

pub use client::{MqttClient, MqttEvent, MqttMessage};

use super::{
    EntityDescriptor, Host, HostState, PublishedState, StateCallback, SubscriberTable,
    Subscription,
};
use crate::config::MqttConfig;
use crate::error::Result;
use client::{PAYLOAD_OFFLINE, PAYLOAD_ONLINE};
use log::{debug, info, warn};
use parking_lot::RwLock;
use rumqttc::{AsyncClient, QoS};
use serde_json::{Value, json};
use statestream::StateCache;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Most queued messages folded into one batch before subscribers are told.
const MAX_BATCH: usize = 64;

pub struct MqttHost {
    client: AsyncClient,
    config: MqttConfig,
    states: StateCache,
    subscribers: Arc<SubscriberTable>,
    /// Entities announced via discovery, replayed after a reconnect.
    entities: RwLock<BTreeMap<String, EntityDescriptor>>,
    /// Set by `go_offline`; nothing is published afterwards.
    offline: AtomicBool,
}

impl MqttHost {
    /// Create the host and the client whose event loop must be driven.
    pub fn new(config: &MqttConfig) -> (Arc<Self>, MqttClient) {
        let availability = availability_topic(&config.node_id);
        let mqtt_client = MqttClient::new(config, &availability);
        let host = Arc::new(Self {
            client: mqtt_client.client(),
            config: config.clone(),
            states: StateCache::new(),
            subscribers: SubscriberTable::new(),
            entities: RwLock::new(BTreeMap::new()),
            offline: AtomicBool::new(false),
        });
        (host, mqtt_client)
    }

    /// Connect to the broker and route incoming traffic.
    ///
    /// Returns a JoinHandle that can be used to abort the task on shutdown.
    pub fn connect(config: &MqttConfig) -> (Arc<Self>, JoinHandle<()>) {
        info!(
            "[MQTT] Connecting to {}:{}",
            config.broker_host, config.broker_port
        );

        let (host, mqtt_client) = Self::new(config);
        let (tx, mut rx) = mpsc::channel::<MqttEvent>(256);

        let router = host.clone();
        let handle = tokio::spawn(async move {
            let mqtt_loop = tokio::spawn(mqtt_client.run(tx));

            let mut batch = Vec::with_capacity(MAX_BATCH);
            while let Some(event) = rx.recv().await {
                let mut next = Some(event);
                while let Some(event) = next.take() {
                    match event {
                        MqttEvent::Connected => {
                            router.handle_batch(&batch);
                            batch.clear();
                            router.on_connected().await;
                        }
                        MqttEvent::Message(msg) => batch.push(msg),
                    }
                    if batch.len() < MAX_BATCH {
                        next = rx.try_recv().ok();
                    }
                }
                router.handle_batch(&batch);
                batch.clear();
            }

            mqtt_loop.abort();
        });

        (host, handle)
    }

    /// Number of entities with a known state.
    pub fn known_state_count(&self) -> usize {
        self.states.len()
    }

    /// Renew subscriptions and announcements after a (re)connect.
    async fn on_connected(&self) {
        for filter in statestream::topic_filters(&self.config.statestream_prefix) {
            if let Err(e) = self.client.subscribe(&filter, QoS::AtMostOnce).await {
                warn!("[MQTT] Failed to subscribe to {}: {:?}", filter, e);
            } else {
                info!("[MQTT] Subscribed to {}", filter);
            }
        }

        if let Err(e) = self
            .client
            .publish(
                availability_topic(&self.config.node_id),
                QoS::AtLeastOnce,
                true,
                PAYLOAD_ONLINE,
            )
            .await
        {
            warn!("[MQTT] Failed to publish availability: {:?}", e);
        }

        let entities: Vec<EntityDescriptor> = self.entities.read().values().cloned().collect();
        for entity in &entities {
            self.announce(entity);
        }
    }

    /// Mark the bridge offline before a graceful exit and stop publishing.
    ///
    /// Entities stay announced so they survive a restart of the bridge. The
    /// broker only sends the last will when the connection is lost.
    pub async fn go_offline(&self) -> Result<()> {
        self.offline.store(true, Ordering::SeqCst);
        self.client
            .publish(
                availability_topic(&self.config.node_id),
                QoS::AtLeastOnce,
                true,
                PAYLOAD_OFFLINE,
            )
            .await?;
        Ok(())
    }

    /// Apply one incoming message and notify subscribers of the entity.
    pub fn handle_message(&self, topic: &str, payload: &str) {
        self.handle_batch(&[MqttMessage {
            topic: topic.to_string(),
            payload: payload.to_string(),
        }]);
    }

    /// Apply queued messages in order, then notify each changed entity once
    /// with its final state.
    ///
    /// Statestream sends a new state before the unit it is measured in, so
    /// folding both first keeps subscribers from normalizing the new value
    /// against the old unit. Only messages that already arrived are folded;
    /// a unit that lands after the dispatch still re-dispatches the state.
    pub fn handle_batch(&self, messages: &[MqttMessage]) {
        let mut changed: BTreeMap<String, HostState> = BTreeMap::new();
        for msg in messages {
            let Some(update) =
                statestream::parse(&self.config.statestream_prefix, &msg.topic, &msg.payload)
            else {
                continue;
            };
            if let Some(state) = self.states.apply(update) {
                changed.insert(state.entity_id.clone(), state);
            }
        }
        for state in changed.values() {
            debug!("[MQTT] {} = {}", state.entity_id, state.state);
            self.subscribers.dispatch(state);
        }
    }

    fn discovery_topic(&self, unique_id: &str) -> String {
        format!(
            "{}/sensor/{}/config",
            self.config.discovery_prefix.trim_end_matches('/'),
            unique_id
        )
    }

    fn announce(&self, entity: &EntityDescriptor) {
        let payload = discovery_config(&self.config.node_id, entity).to_string();
        self.try_publish(&self.discovery_topic(&entity.unique_id), true, payload);
    }

    fn try_publish(&self, topic: &str, retain: bool, payload: String) {
        if self.offline.load(Ordering::SeqCst) {
            return;
        }
        debug!("[MQTT] Publishing to {}: {}", topic, payload);
        if let Err(e) = self
            .client
            .try_publish(topic, QoS::AtLeastOnce, retain, payload)
        {
            warn!("[MQTT] Failed to publish to {}: {:?}", topic, e);
        }
    }
}

impl Host for MqttHost {
    fn subscribe(&self, entity_id: &str, callback: StateCallback) -> Subscription {
        self.subscribers.subscribe(entity_id, callback)
    }

    fn get_current_state(&self, entity_id: &str) -> Option<HostState> {
        self.states.get(entity_id)
    }

    fn all_states(&self) -> Vec<HostState> {
        self.states.all()
    }

    fn register_entity(&self, entity: &EntityDescriptor) {
        self.entities
            .write()
            .insert(entity.unique_id.clone(), entity.clone());
        self.announce(entity);
    }

    fn unregister_entity(&self, unique_id: &str) {
        self.entities.write().remove(unique_id);
        // An empty retained config removes the entity from Home Assistant
        self.try_publish(&self.discovery_topic(unique_id), true, String::new());
    }

    fn publish_state(&self, unique_id: &str, state: &PublishedState) {
        let node_id = &self.config.node_id;
        self.try_publish(
            &state_topic(node_id, unique_id),
            true,
            state.state.to_string(),
        );
        match serde_json::to_string(&state.attributes) {
            Ok(attributes) => {
                self.try_publish(&attributes_topic(node_id, unique_id), true, attributes)
            }
            Err(e) => warn!("[MQTT] Failed to encode attributes of {}: {}", unique_id, e),
        }
    }
}

pub fn availability_topic(node_id: &str) -> String {
    format!("{}/status", node_id)
}

pub fn state_topic(node_id: &str, unique_id: &str) -> String {
    format!("{}/{}/state", node_id, unique_id)
}

pub fn attributes_topic(node_id: &str, unique_id: &str) -> String {
    format!("{}/{}/attributes", node_id, unique_id)
}

/// Discovery payload announcing `entity` as a Home Assistant sensor.
pub fn discovery_config(node_id: &str, entity: &EntityDescriptor) -> Value {
    json!({
        "name": entity.name,
        "unique_id": entity.unique_id,
        "object_id": entity.unique_id,
        "state_topic": state_topic(node_id, &entity.unique_id),
        "json_attributes_topic": attributes_topic(node_id, &entity.unique_id),
        "availability_topic": availability_topic(node_id),
        "unit_of_measurement": entity.unit_of_measurement,
        "icon": entity.icon,
        "state_class": "measurement",
        "device": {
            "identifiers": [entity.device_id],
            "name": entity.device_name,
            "manufacturer": "Heat Transfer Bridge",
            "model": "Heat transfer device",
            "sw_version": env!("CARGO_PKG_VERSION"),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn config() -> MqttConfig {
        MqttConfig {
            statestream_prefix: "ha/statestream".to_string(),
            node_id: "bridge".to_string(),
            ..Default::default()
        }
    }

    fn descriptor() -> EntityDescriptor {
        EntityDescriptor {
            unique_id: "attic_heat_transfer_coefficient".to_string(),
            name: "Attic Heat transfer coefficient".to_string(),
            device_id: "attic".to_string(),
            device_name: "Attic".to_string(),
            unit_of_measurement: "°C".to_string(),
            icon: "mdi:thermometer".to_string(),
        }
    }

    #[test]
    fn test_topics() {
        assert_eq!(availability_topic("bridge"), "bridge/status");
        assert_eq!(state_topic("bridge", "x"), "bridge/x/state");
        assert_eq!(attributes_topic("bridge", "x"), "bridge/x/attributes");
    }

    #[test]
    fn test_discovery_config() {
        let payload = discovery_config("bridge", &descriptor());
        assert_eq!(payload["unique_id"], "attic_heat_transfer_coefficient");
        assert_eq!(
            payload["state_topic"],
            "bridge/attic_heat_transfer_coefficient/state"
        );
        assert_eq!(
            payload["json_attributes_topic"],
            "bridge/attic_heat_transfer_coefficient/attributes"
        );
        assert_eq!(payload["unit_of_measurement"], "°C");
        assert_eq!(payload["state_class"], "measurement");
        assert_eq!(payload["device"]["identifiers"][0], "attic");
    }

    #[tokio::test]
    async fn test_statestream_messages_reach_subscribers() {
        let (host, _client) = MqttHost::new(&config());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_cb = seen.clone();
        let _sub = host.subscribe(
            "sensor.attic",
            Arc::new(move |state: &HostState| {
                seen_cb
                    .lock()
                    .push((state.state.clone(), state.unit_of_measurement.clone()))
            }),
        );

        host.handle_message("ha/statestream/sensor/attic/unit_of_measurement", "\"°F\"");
        host.handle_message("ha/statestream/sensor/attic/state", "68");
        host.handle_message("ha/statestream/sensor/cellar/state", "12");
        host.handle_message("other/topic", "1");

        assert_eq!(
            *seen.lock(),
            vec![("68".to_string(), Some("°F".to_string()))]
        );
        assert_eq!(
            host.get_current_state("sensor.cellar").map(|s| s.state),
            Some("12".to_string())
        );
        assert_eq!(host.known_state_count(), 2);
        assert_eq!(host.all_states().len(), 2);
    }

    #[tokio::test]
    async fn test_unit_change_in_same_batch_dispatches_once() {
        let (host, _client) = MqttHost::new(&config());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_cb = seen.clone();
        let _sub = host.subscribe(
            "sensor.attic",
            Arc::new(move |state: &HostState| {
                seen_cb
                    .lock()
                    .push((state.state.clone(), state.unit_of_measurement.clone()))
            }),
        );

        let msg = |topic: &str, payload: &str| MqttMessage {
            topic: format!("ha/statestream/sensor/attic/{}", topic),
            payload: payload.to_string(),
        };
        host.handle_batch(&[msg("unit_of_measurement", "\"°C\""), msg("state", "20")]);
        // Sensor switched to Fahrenheit: the state lands before the unit
        host.handle_batch(&[msg("state", "68"), msg("unit_of_measurement", "\"°F\"")]);

        assert_eq!(
            *seen.lock(),
            vec![
                ("20".to_string(), Some("°C".to_string())),
                ("68".to_string(), Some("°F".to_string())),
            ]
        );
    }

    #[tokio::test]
    async fn test_registered_entities_are_remembered() {
        let (host, _client) = MqttHost::new(&config());
        host.register_entity(&descriptor());
        assert_eq!(host.entities.read().len(), 1);

        host.unregister_entity("attic_heat_transfer_coefficient");
        assert!(host.entities.read().is_empty());
    }
}
