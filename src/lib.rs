//! Heat Transfer Bridge library.
//!
//! Derives a heat transfer coefficient from an indoor and an outdoor
//! temperature sensor and publishes it back to Home Assistant as a sensor.

pub mod compute;
pub mod config;
pub mod config_flow;
pub mod device;
pub mod error;
pub mod host;
pub mod instance_lock;
pub mod observer;
pub mod registry;
pub mod sensor;
pub mod units;
