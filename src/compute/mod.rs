//! Derived metric computation.
//!
//! [`MetricKind`] enumerates what can be computed and holds the formulas;
//! [`ComputeCell`] memoizes one metric behind a dirty flag and a lock.

pub mod cell;
pub mod metric;

pub use cell::ComputeCell;
pub use metric::{Formula, MetricKind, MetricValue};
