//! Derived metrics and their formulas.
//!
//! Each [`MetricKind`] maps to one pure function over the current input
//! snapshot. Adding a metric means adding a variant and an arm in
//! [`MetricKind::evaluate`]; the device builds one compute cell per variant.

use crate::device::inputs::InputSnapshot;
use crate::error::HeatTransferError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

/// Attribute key carrying the unrounded coefficient.
pub const ATTR_HEAT_TRANSFER_COEFFICIENT: &str = "heat_transfer_coefficient";

/// Derived metrics a device can expose.
///
/// The string form (`heat_transfer_coefficient`) is the key used in
/// `enabled_sensors` and in entity unique ids.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
    IntoStaticStr,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    HeatTransferCoefficient,
}

impl MetricKind {
    /// Key used in configuration and unique ids.
    pub fn key(self) -> &'static str {
        self.into()
    }

    /// Human readable title, e.g. "Heat transfer coefficient".
    pub fn to_name(self) -> String {
        let spaced = self.key().replace('_', " ");
        let mut chars = spaced.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        }
    }

    /// Parse a configuration key.
    pub fn from_key(key: &str) -> Result<Self, HeatTransferError> {
        key.trim()
            .parse()
            .map_err(|_| HeatTransferError::UnknownSensorType(key.to_string()))
    }

    /// All metrics, in declaration order.
    pub fn all() -> Vec<MetricKind> {
        MetricKind::iter().collect()
    }

    /// Unit label published with the entity.
    ///
    /// The computed quantity is a plain temperature difference, so it is
    /// labelled in degrees Celsius rather than "1/s".
    pub fn unit_of_measurement(self) -> &'static str {
        match self {
            MetricKind::HeatTransferCoefficient => "°C",
        }
    }

    pub fn icon(self) -> &'static str {
        match self {
            MetricKind::HeatTransferCoefficient => "mdi:home-thermometer-outline",
        }
    }

    /// Evaluate this metric. Returns `None` until both inputs are valid.
    pub fn evaluate(self, inputs: &InputSnapshot) -> Option<MetricValue> {
        match self {
            MetricKind::HeatTransferCoefficient => heat_transfer_coefficient(inputs),
        }
    }

    /// Formula for this metric as a shareable closure.
    pub fn formula(self) -> Formula {
        Arc::new(move |inputs: &InputSnapshot| self.evaluate(inputs))
    }
}

/// A pure function from the input snapshot to a metric value.
pub type Formula = Arc<dyn Fn(&InputSnapshot) -> Option<MetricValue> + Send + Sync>;

/// Result of a metric evaluation: the headline value plus extra attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    pub value: f64,
    #[serde(default)]
    pub extras: BTreeMap<String, f64>,
}

impl MetricValue {
    pub fn new(value: f64) -> Self {
        Self {
            value,
            extras: BTreeMap::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: f64) -> Self {
        self.extras.insert(key.into(), value);
        self
    }
}

/// Temperature difference between the outside and inside sensors.
pub fn heat_transfer_coefficient(inputs: &InputSnapshot) -> Option<MetricValue> {
    let (in_celsius, out_celsius) = inputs.both()?;
    let coefficient = out_celsius - in_celsius;
    Some(MetricValue::new(coefficient).with_extra(ATTR_HEAT_TRANSFER_COEFFICIENT, coefficient))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::inputs::NormalizedInput;

    fn snapshot(in_c: Option<f64>, out_c: Option<f64>) -> InputSnapshot {
        InputSnapshot {
            in_temp: in_c.map(NormalizedInput::valid).unwrap_or_default(),
            out_temp: out_c.map(NormalizedInput::valid).unwrap_or_default(),
        }
    }

    #[test]
    fn test_coefficient_is_out_minus_in() {
        let value = heat_transfer_coefficient(&snapshot(Some(20.0), Some(25.0))).unwrap();
        assert_eq!(value.value, 5.0);
        assert_eq!(value.extras[ATTR_HEAT_TRANSFER_COEFFICIENT], 5.0);
    }

    #[test]
    fn test_coefficient_is_exact_for_arbitrary_pairs() {
        let pairs = [
            (-89.2, 56.7),
            (56.7, -89.2),
            (0.1, 0.2),
            (-3.333, 17.25),
            (21.5, 21.5),
        ];
        for (a, b) in pairs {
            let value = heat_transfer_coefficient(&snapshot(Some(a), Some(b))).unwrap();
            assert_eq!(value.value, b - a, "in={a} out={b}");
        }
    }

    #[test]
    fn test_coefficient_needs_both_inputs() {
        assert!(heat_transfer_coefficient(&snapshot(Some(20.0), None)).is_none());
        assert!(heat_transfer_coefficient(&snapshot(None, Some(20.0))).is_none());
        assert!(heat_transfer_coefficient(&snapshot(None, None)).is_none());
    }

    #[test]
    fn test_key_round_trip_and_name() {
        let kind = MetricKind::from_key("heat_transfer_coefficient").unwrap();
        assert_eq!(kind, MetricKind::HeatTransferCoefficient);
        assert_eq!(kind.key(), "heat_transfer_coefficient");
        assert_eq!(kind.to_string(), "heat_transfer_coefficient");
        assert_eq!(kind.to_name(), "Heat transfer coefficient");
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        assert!(matches!(
            MetricKind::from_key("dew_point"),
            Err(HeatTransferError::UnknownSensorType(key)) if key == "dew_point"
        ));
    }
}
