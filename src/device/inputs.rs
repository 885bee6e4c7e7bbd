//! Last known good values of the two temperature inputs.

use parking_lot::RwLock;
use std::fmt;

/// Which of the two upstream sensors a value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputSide {
    /// Indoor temperature sensor.
    In,
    /// Outdoor temperature sensor.
    Out,
}

impl InputSide {
    pub const BOTH: [InputSide; 2] = [InputSide::In, InputSide::Out];

    fn index(self) -> usize {
        match self {
            InputSide::In => 0,
            InputSide::Out => 1,
        }
    }
}

impl fmt::Display for InputSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputSide::In => f.write_str("in"),
            InputSide::Out => f.write_str("out"),
        }
    }
}

/// A normalized input value. `valid` is false until a good reading arrives.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NormalizedInput {
    pub value_celsius: f64,
    pub valid: bool,
}

impl NormalizedInput {
    pub fn valid(value_celsius: f64) -> Self {
        Self {
            value_celsius,
            valid: true,
        }
    }

    pub fn celsius(&self) -> Option<f64> {
        self.valid.then_some(self.value_celsius)
    }
}

/// Point-in-time copy of both inputs, handed to metric formulas.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct InputSnapshot {
    pub in_temp: NormalizedInput,
    pub out_temp: NormalizedInput,
}

impl InputSnapshot {
    /// Both values in Celsius as `(in, out)`, or `None` if either is missing.
    pub fn both(&self) -> Option<(f64, f64)> {
        Some((self.in_temp.celsius()?, self.out_temp.celsius()?))
    }
}

/// Holds the two input slots. Only valid readings are ever written, so an
/// invalid reading cannot erase the last good value.
#[derive(Debug, Default)]
pub struct InputCache {
    slots: RwLock<[NormalizedInput; 2]>,
}

impl InputCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a validated value. Returns true when both slots are now valid.
    pub fn update(&self, side: InputSide, value_celsius: f64) -> bool {
        let mut slots = self.slots.write();
        slots[side.index()] = NormalizedInput::valid(value_celsius);
        slots.iter().all(|slot| slot.valid)
    }

    pub fn get(&self, side: InputSide) -> NormalizedInput {
        self.slots.read()[side.index()]
    }

    pub fn snapshot(&self) -> InputSnapshot {
        let slots = self.slots.read();
        InputSnapshot {
            in_temp: slots[0],
            out_temp: slots[1],
        }
    }

    pub fn both_valid(&self) -> bool {
        self.slots.read().iter().all(|slot| slot.valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_empty() {
        let cache = InputCache::new();
        assert!(!cache.get(InputSide::In).valid);
        assert!(!cache.both_valid());
        assert_eq!(cache.snapshot().both(), None);
    }

    #[test]
    fn test_update_reports_when_both_valid() {
        let cache = InputCache::new();
        assert!(!cache.update(InputSide::In, 20.0));
        assert!(cache.update(InputSide::Out, 25.0));
        assert_eq!(cache.snapshot().both(), Some((20.0, 25.0)));

        // Overwriting one side keeps the pair complete
        assert!(cache.update(InputSide::In, 19.5));
        assert_eq!(cache.get(InputSide::In).celsius(), Some(19.5));
    }
}
