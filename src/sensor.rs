//! Presentation sensors published to the host.
//!
//! One [`HeatTransferSensor`] exists per enabled metric of a device. It is an
//! [`Observer`] of that device: on every refresh it reads the metric's compute
//! cell and publishes the result. While the device has no value yet the
//! previously published state is left untouched.

use crate::compute::metric::ATTR_HEAT_TRANSFER_COEFFICIENT;
use crate::compute::{MetricKind, MetricValue};
use crate::device::ReactiveDevice;
use crate::host::{EntityDescriptor, Host, PublishedState};
use crate::observer::{Observer, ObserverId};
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

/// Decimal places of the published state. Attributes keep full precision.
const STATE_PRECISION: i32 = 2;

pub struct HeatTransferSensor {
    kind: MetricKind,
    descriptor: EntityDescriptor,
    device: Weak<ReactiveDevice>,
    host: Arc<dyn Host>,
    published: RwLock<Option<MetricValue>>,
    version: AtomicU32,
    registration: Mutex<Option<ObserverId>>,
}

impl HeatTransferSensor {
    /// Create the sensor for one metric of `device`. Call [`attach`] to make
    /// it visible.
    ///
    /// [`attach`]: HeatTransferSensor::attach
    pub fn new(device: &Arc<ReactiveDevice>, kind: MetricKind, host: Arc<dyn Host>) -> Arc<Self> {
        let descriptor = EntityDescriptor {
            unique_id: format!("{}_{}", device.unique_id(), kind.key()),
            name: format!("{} {}", device.name(), kind.to_name()),
            device_id: device.unique_id().to_string(),
            device_name: device.name().to_string(),
            unit_of_measurement: kind.unit_of_measurement().to_string(),
            icon: kind.icon().to_string(),
        };

        Arc::new(Self {
            kind,
            descriptor,
            device: Arc::downgrade(device),
            host,
            published: RwLock::new(None),
            version: AtomicU32::new(0),
            registration: Mutex::new(None),
        })
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    pub fn unique_id(&self) -> &str {
        &self.descriptor.unique_id
    }

    pub fn descriptor(&self) -> &EntityDescriptor {
        &self.descriptor
    }

    /// Published value rounded for display, `None` before the first publish.
    pub fn native_value(&self) -> Option<f64> {
        self.published
            .read()
            .as_ref()
            .map(|value| round(value.value, STATE_PRECISION))
    }

    /// Unrounded coefficient of the last publish.
    pub fn raw_coefficient(&self) -> Option<f64> {
        self.published
            .read()
            .as_ref()
            .and_then(|value| value.extras.get(ATTR_HEAT_TRANSFER_COEFFICIENT).copied())
    }

    /// Incremented on every publish.
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn is_attached(&self) -> bool {
        self.registration.lock().is_some()
    }

    /// Register with the host and start observing the device.
    pub fn attach(self: &Arc<Self>) {
        let Some(device) = self.device.upgrade() else {
            return;
        };
        let mut registration = self.registration.lock();
        if registration.is_some() {
            return;
        }

        self.host.register_entity(&self.descriptor);
        let observer: Arc<dyn Observer> = self.clone();
        *registration = Some(device.register_observer(Arc::downgrade(&observer)));
        info!("[Sensor] Added {}", self.descriptor.unique_id);
    }

    /// Stop observing the device and remove the entity from the host.
    pub fn detach(&self) {
        let Some(id) = self.registration.lock().take() else {
            return;
        };
        if let Some(device) = self.device.upgrade() {
            device.unregister_observer(id);
        }
        self.host.unregister_entity(&self.descriptor.unique_id);
        info!("[Sensor] Removed {}", self.descriptor.unique_id);
    }

    fn publish(&self, value: MetricValue) {
        let state = PublishedState {
            state: round(value.value, STATE_PRECISION),
            attributes: value.extras.clone(),
            last_updated: Utc::now(),
        };
        *self.published.write() = Some(value);
        self.version.fetch_add(1, Ordering::SeqCst);
        self.host.publish_state(&self.descriptor.unique_id, &state);
    }
}

#[async_trait]
impl Observer for HeatTransferSensor {
    async fn refresh(&self) {
        let Some(device) = self.device.upgrade() else {
            return;
        };
        match device.value(self.kind).await {
            Some(value) => self.publish(value),
            None => debug!(
                "[Sensor] {} has no value yet, keeping previous state",
                self.descriptor.unique_id
            ),
        }
    }
}

fn round(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::host::MemoryHost;

    const IN: &str = "sensor.bedroom";
    const OUT: &str = "sensor.balcony";

    fn setup() -> (Arc<MemoryHost>, Arc<ReactiveDevice>, Arc<HeatTransferSensor>) {
        let host = MemoryHost::new();
        let config = DeviceConfig::new(IN, OUT).with_name("Bedroom");
        let device = ReactiveDevice::new("bedroom", &config, host.clone()).unwrap();
        let sensor =
            HeatTransferSensor::new(&device, MetricKind::HeatTransferCoefficient, host.clone());
        (host, device, sensor)
    }

    #[test]
    fn test_descriptor() {
        let (_host, _device, sensor) = setup();
        let descriptor = sensor.descriptor();
        assert_eq!(descriptor.unique_id, "bedroom_heat_transfer_coefficient");
        assert_eq!(descriptor.name, "Bedroom Heat transfer coefficient");
        assert_eq!(descriptor.device_id, "bedroom");
        assert_eq!(descriptor.unit_of_measurement, "°C");
    }

    #[tokio::test]
    async fn test_refresh_publishes_rounded_state_and_raw_attribute() {
        let (host, device, sensor) = setup();
        sensor.attach();
        device.start();

        host.set_state(IN, "20.123", Some("°C"));
        host.set_state(OUT, "-1.5", Some("°C"));
        device.refresh_observers().await;

        let published = host.last_published(sensor.unique_id()).unwrap();
        assert_eq!(published.state, -21.62);
        let raw = published.attributes[ATTR_HEAT_TRANSFER_COEFFICIENT];
        assert_eq!(raw, -1.5 - 20.123);
        assert_eq!(sensor.native_value(), Some(-21.62));
        assert_eq!(sensor.raw_coefficient(), Some(raw));
    }

    #[tokio::test]
    async fn test_refresh_without_value_keeps_previous_state() {
        let (host, device, sensor) = setup();
        sensor.attach();
        device.start();

        sensor.refresh().await;
        assert_eq!(sensor.version(), 0);
        assert_eq!(sensor.native_value(), None);
        assert!(host.published(sensor.unique_id()).is_empty());

        host.set_state(IN, "20", Some("°C"));
        host.set_state(OUT, "25", Some("°C"));
        sensor.refresh().await;
        assert_eq!(sensor.native_value(), Some(5.0));

        // The out sensor drops away, the published value stays
        host.set_state(OUT, "unavailable", None);
        sensor.refresh().await;
        assert_eq!(sensor.native_value(), Some(5.0));
    }

    #[tokio::test]
    async fn test_attach_and_detach() {
        let (host, device, sensor) = setup();

        sensor.attach();
        sensor.attach();
        assert!(sensor.is_attached());
        assert_eq!(device.observer_count(), 1);
        assert!(host.entity(sensor.unique_id()).is_some());

        sensor.detach();
        assert!(!sensor.is_attached());
        assert_eq!(device.observer_count(), 0);
        assert!(host.entity(sensor.unique_id()).is_none());
    }

    #[test]
    fn test_round() {
        assert_eq!(round(1.005_1, 2), 1.01);
        assert_eq!(round(-21.623, 2), -21.62);
        assert_eq!(round(5.0, 2), 5.0);
    }
}
