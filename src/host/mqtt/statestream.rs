//! Decoding of Home Assistant `mqtt_statestream` topics.
//!
//! Statestream mirrors every entity onto
//! `{prefix}/{domain}/{object_id}/{field}`. The `state` field carries the raw
//! state string; attribute fields are JSON encoded.

use crate::host::HostState;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// The statestream fields the bridge listens to.
pub const SUBSCRIBED_FIELDS: [&str; 3] = ["state", "unit_of_measurement", "device_class"];

#[derive(Debug, Clone, PartialEq)]
pub enum StatestreamField {
    State,
    UnitOfMeasurement,
    DeviceClass,
}

impl StatestreamField {
    fn from_topic_segment(segment: &str) -> Option<Self> {
        match segment {
            "state" => Some(Self::State),
            "unit_of_measurement" => Some(Self::UnitOfMeasurement),
            "device_class" => Some(Self::DeviceClass),
            _ => None,
        }
    }
}

/// One decoded statestream message.
#[derive(Debug, Clone, PartialEq)]
pub struct StatestreamUpdate {
    pub entity_id: String,
    pub field: StatestreamField,
    pub value: String,
}

/// Topic filters to subscribe to for `prefix`.
pub fn topic_filters(prefix: &str) -> Vec<String> {
    let prefix = prefix.trim_end_matches('/');
    SUBSCRIBED_FIELDS
        .iter()
        .map(|field| format!("{}/+/+/{}", prefix, field))
        .collect()
}

/// Decode a message, `None` when the topic is not a statestream field we use.
pub fn parse(prefix: &str, topic: &str, payload: &str) -> Option<StatestreamUpdate> {
    let prefix = prefix.trim_end_matches('/');
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;

    let mut segments = rest.split('/');
    let (domain, object_id, field) = (segments.next()?, segments.next()?, segments.next()?);
    if segments.next().is_some() || domain.is_empty() || object_id.is_empty() {
        return None;
    }
    let field = StatestreamField::from_topic_segment(field)?;

    let value = match field {
        StatestreamField::State => payload.trim().to_string(),
        _ => decode_attribute(payload),
    };

    Some(StatestreamUpdate {
        entity_id: format!("{}.{}", domain, object_id),
        field,
        value,
    })
}

/// Attribute payloads are JSON. Strings are unquoted, anything that does not
/// parse is taken verbatim.
fn decode_attribute(payload: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(payload) {
        Ok(serde_json::Value::String(s)) => s,
        Ok(serde_json::Value::Null) => String::new(),
        Ok(other) => other.to_string(),
        Err(_) => payload.trim().to_string(),
    }
}

struct CachedEntity {
    state: HostState,
    /// Set once the `state` field has been seen.
    has_state: bool,
}

/// Entity states assembled from statestream updates.
#[derive(Default)]
pub struct StateCache {
    entities: RwLock<BTreeMap<String, CachedEntity>>,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold an update into the cache.
    ///
    /// Returns the entity's new state when subscribers should hear about it:
    /// on every state update, and on unit changes once a state is known.
    pub fn apply(&self, update: StatestreamUpdate) -> Option<HostState> {
        let mut entities = self.entities.write();
        let entry = entities
            .entry(update.entity_id.clone())
            .or_insert_with(|| CachedEntity {
                state: HostState::new(update.entity_id, ""),
                has_state: false,
            });

        match update.field {
            StatestreamField::State => {
                entry.state.state = update.value;
                entry.has_state = true;
                Some(entry.state.clone())
            }
            StatestreamField::UnitOfMeasurement => {
                let unit = (!update.value.is_empty()).then_some(update.value);
                if entry.state.unit_of_measurement == unit {
                    return None;
                }
                entry.state.unit_of_measurement = unit;
                entry.has_state.then(|| entry.state.clone())
            }
            StatestreamField::DeviceClass => {
                entry.state.device_class = (!update.value.is_empty()).then_some(update.value);
                None
            }
        }
    }

    pub fn get(&self, entity_id: &str) -> Option<HostState> {
        self.entities
            .read()
            .get(entity_id)
            .filter(|entry| entry.has_state)
            .map(|entry| entry.state.clone())
    }

    pub fn all(&self) -> Vec<HostState> {
        self.entities
            .read()
            .values()
            .filter(|entry| entry.has_state)
            .map(|entry| entry.state.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entities
            .read()
            .values()
            .filter(|entry| entry.has_state)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
