//! Reactive heat transfer device.
//!
//! A device watches two temperature entities on the host, keeps their last
//! good values, and owns one [`ComputeCell`] per enabled metric. Every valid
//! input change marks all cells dirty. In push mode the registered observers
//! are refreshed right away; in poll mode a timer refreshes them once per
//! interval no matter how many changes arrived in between.

pub mod inputs;

use crate::compute::{ComputeCell, MetricKind, MetricValue};
use crate::config::DeviceConfig;
use crate::error::Result;
use crate::host::{Host, HostState, StateCallback, Subscription};
use crate::observer::{Observer, ObserverId, ObserverSet};
use crate::units::TemperatureReading;
use futures_util::future::join_all;
use inputs::{InputCache, InputSide};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

pub struct ReactiveDevice {
    unique_id: String,
    name: String,
    in_entity_id: String,
    out_entity_id: String,
    inputs: InputCache,
    cells: BTreeMap<MetricKind, ComputeCell>,
    observers: ObserverSet,
    poll_interval: Option<Duration>,
    host: Arc<dyn Host>,
    subscriptions: Mutex<Vec<Subscription>>,
    cancel: CancellationToken,
    fan_outs: AtomicU64,
}

impl ReactiveDevice {
    /// Build a device from its configuration. Nothing is subscribed until
    /// [`ReactiveDevice::start`] is called.
    pub fn new(
        unique_id: impl Into<String>,
        config: &DeviceConfig,
        host: Arc<dyn Host>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let cells = config
            .enabled_metrics()?
            .into_iter()
            .map(|kind| (kind, ComputeCell::new(kind)))
            .collect();

        Ok(Arc::new(Self {
            unique_id: unique_id.into(),
            name: config.name.clone(),
            in_entity_id: config.in_temp_sensor_entity_id.clone(),
            out_entity_id: config.out_temp_sensor_entity_id.clone(),
            inputs: InputCache::new(),
            cells,
            observers: ObserverSet::new(),
            poll_interval: config.poll_interval(),
            host,
            subscriptions: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            fan_outs: AtomicU64::new(0),
        }))
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entity_id(&self, side: InputSide) -> &str {
        match side {
            InputSide::In => &self.in_entity_id,
            InputSide::Out => &self.out_entity_id,
        }
    }

    pub fn should_poll(&self) -> bool {
        self.poll_interval.is_some()
    }

    pub fn inputs(&self) -> &InputCache {
        &self.inputs
    }

    pub fn metrics(&self) -> impl Iterator<Item = MetricKind> + '_ {
        self.cells.keys().copied()
    }

    pub fn cell(&self, kind: MetricKind) -> Option<&ComputeCell> {
        self.cells.get(&kind)
    }

    /// Number of fan-outs issued so far.
    pub fn fan_out_count(&self) -> u64 {
        self.fan_outs.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Subscribe to both inputs, seed them from the host's current state and,
    /// in poll mode, start the refresh timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self: &Arc<Self>) {
        info!(
            "[Device] Starting {} ({} -> {}, {})",
            self.unique_id,
            self.in_entity_id,
            self.out_entity_id,
            match self.poll_interval {
                Some(period) => format!("poll every {}s", period.as_secs()),
                None => "push".to_string(),
            }
        );

        {
            let mut subscriptions = self.subscriptions.lock();
            for side in InputSide::BOTH {
                let weak = Arc::downgrade(self);
                let callback: StateCallback = Arc::new(move |state: &HostState| {
                    if let Some(device) = weak.upgrade() {
                        device.on_input_changed(side, &state.reading());
                    }
                });
                subscriptions.push(self.host.subscribe(self.entity_id(side), callback));
            }
        }

        // Inputs may already have a value before we subscribed
        for side in InputSide::BOTH {
            if let Some(state) = self.host.get_current_state(self.entity_id(side)) {
                self.on_input_changed(side, &state.reading());
            } else {
                debug!(
                    "[Device] {} has no current state for {}",
                    self.unique_id,
                    self.entity_id(side)
                );
            }
        }

        if let Some(period) = self.poll_interval {
            self.spawn_poll_timer(period);
        }
    }

    /// Handle a new reading for one input.
    ///
    /// Invalid readings are logged and dropped, keeping the last good value.
    /// Once both inputs are valid every cell is marked dirty and, in push
    /// mode, a fan-out is requested.
    pub fn on_input_changed(self: &Arc<Self>, side: InputSide, reading: &TemperatureReading) {
        if !self.is_running() {
            return;
        }

        let celsius = match reading.normalize() {
            Ok(celsius) => celsius,
            Err(e) => {
                warn!(
                    "[Device] {}: ignoring {} reading from {}: {}",
                    self.unique_id,
                    side,
                    self.entity_id(side),
                    e
                );
                return;
            }
        };

        debug!(
            "[Device] {}: {} temperature {:.2}°C",
            self.unique_id, side, celsius
        );

        if !self.inputs.update(side, celsius) {
            return;
        }

        for cell in self.cells.values() {
            cell.mark_dirty();
        }

        if !self.should_poll() {
            self.request_refresh();
        }
    }

    /// Current value of a metric; `None` if not enabled or not yet computable.
    pub async fn value(&self, kind: MetricKind) -> Option<MetricValue> {
        self.cells.get(&kind)?.value(&self.inputs).await
    }

    pub fn register_observer(&self, observer: Weak<dyn Observer>) -> ObserverId {
        self.observers.register(observer)
    }

    pub fn unregister_observer(&self, id: ObserverId) -> bool {
        self.observers.unregister(id)
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Ask every live observer to refresh and wait for all of them.
    pub async fn refresh_observers(&self) {
        let observers = self.observers.live();
        self.fan_outs.fetch_add(1, Ordering::SeqCst);
        debug!(
            "[Device] {}: refreshing {} observer(s)",
            self.unique_id,
            observers.len()
        );
        join_all(observers.iter().map(|observer| observer.refresh())).await;
    }

    /// Spawn a fan-out without waiting for it.
    fn request_refresh(self: &Arc<Self>) {
        let device = self.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { device.refresh_observers().await });
            }
            Err(_) => warn!(
                "[Device] {}: no runtime available, refresh skipped",
                self.unique_id
            ),
        }
    }

    fn spawn_poll_timer(self: &Arc<Self>, period: Duration) {
        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let unique_id = self.unique_id.clone();
        let first_tick = Instant::now() + period;

        tokio::spawn(async move {
            let mut ticker = interval_at(first_tick, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(device) = weak.upgrade() else { break };
                        device.refresh_observers().await;
                    }
                }
            }
            debug!("[Device] {}: poll timer stopped", unique_id);
        });
    }

    /// Cancel both subscriptions and the poll timer.
    ///
    /// Refreshes already in flight run to completion.
    pub fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        let subscriptions: Vec<Subscription> = self.subscriptions.lock().drain(..).collect();
        for subscription in subscriptions {
            subscription.cancel();
        }
        info!("[Device] Stopped {}", self.unique_id);
    }
}

impl Drop for ReactiveDevice {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
