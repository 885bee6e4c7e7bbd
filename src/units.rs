//! Temperature unit normalization.
//!
//! Every reading coming from the host is converted to degrees Celsius and
//! checked against the coldest and hottest temperatures ever recorded on
//! Earth. Anything outside that window is a sensor fault, not weather.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Lowest natural temperature on record (Vostok Station, 1983).
pub const MIN_PLAUSIBLE_CELSIUS: f64 = -89.2;

/// Highest natural temperature on record (Death Valley, 1913).
pub const MAX_PLAUSIBLE_CELSIUS: f64 = 56.7;

/// Host sentinel for an entity whose value has never been reported.
pub const STATE_UNKNOWN: &str = "unknown";

/// Host sentinel for an entity that is currently offline.
pub const STATE_UNAVAILABLE: &str = "unavailable";

/// Reasons a temperature reading is rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReadingError {
    /// The host reported `unknown` or `unavailable`.
    #[error("sensor state is {0}")]
    Unavailable(String),

    /// The value does not parse as a finite number.
    #[error("not a number: {0:?}")]
    NotANumber(String),

    /// The unit of measurement is not a temperature unit.
    #[error("unsupported temperature unit: {0:?}")]
    UnsupportedUnit(String),

    /// The converted value lies outside the physically plausible window.
    #[error(
        "{0:.2}°C is outside the plausible range [{MIN_PLAUSIBLE_CELSIUS}, {MAX_PLAUSIBLE_CELSIUS}]"
    )]
    OutOfRange(f64),
}

/// Temperature units accepted from upstream sensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TemperatureUnit {
    #[default]
    Celsius,
    Fahrenheit,
    Kelvin,
}

impl TemperatureUnit {
    /// Convert a value in this unit to degrees Celsius.
    pub fn to_celsius(self, value: f64) -> f64 {
        match self {
            TemperatureUnit::Celsius => value,
            TemperatureUnit::Fahrenheit => (value - 32.0) * 5.0 / 9.0,
            TemperatureUnit::Kelvin => value - 273.15,
        }
    }

    /// Unit symbol as used by Home Assistant.
    pub fn symbol(self) -> &'static str {
        match self {
            TemperatureUnit::Celsius => "°C",
            TemperatureUnit::Fahrenheit => "°F",
            TemperatureUnit::Kelvin => "K",
        }
    }
}

impl fmt::Display for TemperatureUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for TemperatureUnit {
    type Err = ReadingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "°C" | "℃" | "C" | "celsius" | "Celsius" => Ok(TemperatureUnit::Celsius),
            "°F" | "℉" | "F" | "fahrenheit" | "Fahrenheit" => Ok(TemperatureUnit::Fahrenheit),
            "K" | "kelvin" | "Kelvin" => Ok(TemperatureUnit::Kelvin),
            other => Err(ReadingError::UnsupportedUnit(other.to_string())),
        }
    }
}

/// A raw observation as delivered by the host.
///
/// Replaced wholesale on every notification, never patched.
#[derive(Debug, Clone, PartialEq)]
pub struct TemperatureReading {
    pub raw_value: String,
    pub unit: Option<String>,
}

impl TemperatureReading {
    pub fn new(raw_value: impl Into<String>, unit: Option<&str>) -> Self {
        Self {
            raw_value: raw_value.into(),
            unit: unit.map(str::to_string),
        }
    }

    /// Shorthand for a Celsius reading, mostly useful in tests.
    pub fn celsius(value: f64) -> Self {
        Self::new(value.to_string(), Some("°C"))
    }

    /// Run this reading through [`normalize`].
    pub fn normalize(&self) -> Result<f64, ReadingError> {
        normalize(&self.raw_value, self.unit.as_deref())
    }
}

/// Convert a raw value in the given unit to plausible degrees Celsius.
///
/// A missing unit is taken as Celsius, the host's native unit. Pure; callers
/// decide how loudly to complain about a rejected reading.
pub fn normalize(raw_value: &str, unit: Option<&str>) -> Result<f64, ReadingError> {
    let raw = raw_value.trim();
    if raw == STATE_UNKNOWN || raw == STATE_UNAVAILABLE {
        return Err(ReadingError::Unavailable(raw.to_string()));
    }

    let value: f64 = raw
        .parse()
        .map_err(|_| ReadingError::NotANumber(raw.to_string()))?;
    if !value.is_finite() {
        return Err(ReadingError::NotANumber(raw.to_string()));
    }

    let unit = match unit {
        Some(u) => u.parse::<TemperatureUnit>()?,
        None => TemperatureUnit::Celsius,
    };

    let celsius = unit.to_celsius(value);
    if !(MIN_PLAUSIBLE_CELSIUS..=MAX_PLAUSIBLE_CELSIUS).contains(&celsius) {
        return Err(ReadingError::OutOfRange(celsius));
    }

    Ok(celsius)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f64 = 1e-9;

    #[test]
    fn test_freezing_point_in_every_unit() {
        assert!((normalize("0", Some("°C")).unwrap()).abs() < EPSILON);
        assert!((normalize("32", Some("°F")).unwrap()).abs() < EPSILON);
        assert!((normalize("273.15", Some("K")).unwrap()).abs() < EPSILON);
    }

    #[test]
    fn test_missing_unit_is_celsius() {
        assert_eq!(normalize("21.5", None), Ok(21.5));
    }

    #[test]
    fn test_sentinels_are_unavailable() {
        assert_eq!(
            normalize("unavailable", Some("°C")),
            Err(ReadingError::Unavailable("unavailable".into()))
        );
        assert_eq!(
            normalize("unknown", Some("°C")),
            Err(ReadingError::Unavailable("unknown".into()))
        );
    }

    #[test]
    fn test_non_numeric_values_are_rejected() {
        assert!(matches!(
            normalize("warm", Some("°C")),
            Err(ReadingError::NotANumber(_))
        ));
        assert!(matches!(
            normalize("NaN", Some("°C")),
            Err(ReadingError::NotANumber(_))
        ));
        assert!(matches!(
            normalize("inf", Some("°C")),
            Err(ReadingError::NotANumber(_))
        ));
    }

    #[test]
    fn test_unsupported_unit() {
        assert_eq!(
            normalize("40", Some("%")),
            Err(ReadingError::UnsupportedUnit("%".into()))
        );
    }

    #[test]
    fn test_range_bounds_are_inclusive() {
        assert_eq!(normalize("-89.2", None), Ok(-89.2));
        assert_eq!(normalize("56.7", None), Ok(56.7));
        assert!(matches!(
            normalize("56.8", None),
            Err(ReadingError::OutOfRange(_))
        ));
        assert!(matches!(
            normalize("-90", None),
            Err(ReadingError::OutOfRange(_))
        ));
    }

    #[test]
    fn test_range_is_checked_after_conversion() {
        // 140°F is 60°C, above the record
        assert!(matches!(
            normalize("140", Some("°F")),
            Err(ReadingError::OutOfRange(_))
        ));
        // 100 K is far below anything natural
        assert!(matches!(
            normalize("100", Some("K")),
            Err(ReadingError::OutOfRange(_))
        ));
        // 100°F is a hot but real day
        let c = normalize("100", Some("°F")).unwrap();
        assert!((c - 37.777_777_777_777_78).abs() < EPSILON);
    }

    #[test]
    fn test_unit_parsing() {
        assert_eq!("°F".parse::<TemperatureUnit>(), Ok(TemperatureUnit::Fahrenheit));
        assert_eq!(" K ".parse::<TemperatureUnit>(), Ok(TemperatureUnit::Kelvin));
        assert_eq!(TemperatureUnit::Celsius.to_string(), "°C");
    }
}
