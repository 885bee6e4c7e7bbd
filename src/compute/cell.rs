//! Memoizing compute cell.
//!
//! A cell caches the last value of one metric. Input changes only flip the
//! `needs_update` flag; the next reader takes the cell lock, recomputes once
//! and every reader queued behind it gets the same cached value.

use super::metric::{Formula, MetricKind, MetricValue};
use crate::device::inputs::InputCache;
use log::debug;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Mutex;

pub struct ComputeCell {
    kind: MetricKind,
    formula: Formula,
    needs_update: AtomicBool,
    /// Cached result. Only replaced while this lock is held.
    cached: Mutex<Option<MetricValue>>,
    evaluations: AtomicU64,
}

impl ComputeCell {
    /// Create a cell for `kind` using its standard formula.
    pub fn new(kind: MetricKind) -> Self {
        Self::with_formula(kind, kind.formula())
    }

    /// Create a cell with an explicit formula.
    pub fn with_formula(kind: MetricKind, formula: Formula) -> Self {
        Self {
            kind,
            formula,
            needs_update: AtomicBool::new(false),
            cached: Mutex::new(None),
            evaluations: AtomicU64::new(0),
        }
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    /// Flag the cached value as stale. Does not take the lock.
    pub fn mark_dirty(&self) {
        self.needs_update.store(true, Ordering::SeqCst);
    }

    pub fn needs_update(&self) -> bool {
        self.needs_update.load(Ordering::SeqCst)
    }

    /// Number of times the formula has run.
    pub fn evaluations(&self) -> u64 {
        self.evaluations.load(Ordering::SeqCst)
    }

    /// Return the current value, recomputing first if the cell is dirty.
    ///
    /// At most one recomputation runs at a time; callers arriving while one is
    /// in flight wait on the lock and receive its result. Returns `None` while
    /// either input is still missing.
    pub async fn value(&self, inputs: &InputCache) -> Option<MetricValue> {
        let mut cached = self.cached.lock().await;

        // Cleared before the snapshot is taken: a change landing after this
        // point marks the cell dirty again for the next reader.
        if self.needs_update.swap(false, Ordering::SeqCst) {
            let snapshot = inputs.snapshot();
            if snapshot.both().is_none() {
                self.needs_update.store(true, Ordering::SeqCst);
                return cached.clone();
            }

            self.evaluations.fetch_add(1, Ordering::SeqCst);

            match (self.formula)(&snapshot) {
                Some(value) => {
                    debug!("[Compute] {} recomputed: {}", self.kind, value.value);
                    *cached = Some(value);
                }
                None => debug!("[Compute] {} produced no value", self.kind),
            }
        }

        cached.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::inputs::{InputCache, InputSide, InputSnapshot};
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counting_cell(counter: Arc<AtomicUsize>) -> ComputeCell {
        ComputeCell::with_formula(
            MetricKind::HeatTransferCoefficient,
            Arc::new(move |inputs: &InputSnapshot| {
                counter.fetch_add(1, Ordering::SeqCst);
                MetricKind::HeatTransferCoefficient.evaluate(inputs)
            }),
        )
    }

    fn filled_inputs(in_c: f64, out_c: f64) -> InputCache {
        let inputs = InputCache::new();
        inputs.update(InputSide::In, in_c);
        inputs.update(InputSide::Out, out_c);
        inputs
    }

    #[tokio::test]
    async fn test_clean_cell_returns_no_value() {
        let cell = ComputeCell::new(MetricKind::HeatTransferCoefficient);
        let inputs = filled_inputs(20.0, 25.0);
        assert_eq!(cell.value(&inputs).await, None);
        assert_eq!(cell.evaluations(), 0);
    }

    #[tokio::test]
    async fn test_value_is_memoized() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cell = counting_cell(counter.clone());
        let inputs = filled_inputs(20.0, 25.0);

        cell.mark_dirty();
        let first = cell.value(&inputs).await;
        let second = cell.value(&inputs).await;

        assert_eq!(first.as_ref().map(|v| v.value), Some(5.0));
        assert_eq!(first, second);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!cell.needs_update());
    }

    #[tokio::test]
    async fn test_dirty_cell_recomputes_with_new_inputs() {
        let cell = ComputeCell::new(MetricKind::HeatTransferCoefficient);
        let inputs = filled_inputs(20.0, 25.0);

        cell.mark_dirty();
        assert_eq!(cell.value(&inputs).await.map(|v| v.value), Some(5.0));

        inputs.update(InputSide::Out, 10.0);
        // Not dirty yet: still the cached value
        assert_eq!(cell.value(&inputs).await.map(|v| v.value), Some(5.0));

        cell.mark_dirty();
        assert_eq!(cell.value(&inputs).await.map(|v| v.value), Some(-10.0));
        assert_eq!(cell.evaluations(), 2);
    }

    #[tokio::test]
    async fn test_incomplete_inputs_leave_cell_dirty() {
        let cell = ComputeCell::new(MetricKind::HeatTransferCoefficient);
        let inputs = InputCache::new();
        inputs.update(InputSide::In, 20.0);

        cell.mark_dirty();
        assert_eq!(cell.value(&inputs).await, None);
        assert!(cell.needs_update());
        assert_eq!(cell.evaluations(), 0);
    }

    #[tokio::test]
    async fn test_change_during_evaluation_keeps_cell_dirty() {
        let inputs = Arc::new(filled_inputs(20.0, 25.0));
        let cell_slot: Arc<parking_lot::Mutex<Option<Arc<ComputeCell>>>> =
            Arc::new(parking_lot::Mutex::new(None));

        let formula_inputs = inputs.clone();
        let formula_slot = cell_slot.clone();
        let raced = Arc::new(AtomicBool::new(false));
        let cell = Arc::new(ComputeCell::with_formula(
            MetricKind::HeatTransferCoefficient,
            Arc::new(move |snapshot: &InputSnapshot| {
                let value = MetricKind::HeatTransferCoefficient.evaluate(snapshot);
                // The first evaluation races with a new outdoor reading
                if !raced.swap(true, Ordering::SeqCst) {
                    formula_inputs.update(InputSide::Out, 10.0);
                    if let Some(cell) = formula_slot.lock().as_ref() {
                        cell.mark_dirty();
                    }
                }
                value
            }),
        ));
        *cell_slot.lock() = Some(cell.clone());

        cell.mark_dirty();
        assert_eq!(cell.value(&inputs).await.map(|v| v.value), Some(5.0));
        assert!(cell.needs_update());

        assert_eq!(cell.value(&inputs).await.map(|v| v.value), Some(-10.0));
        assert!(!cell.needs_update());
        assert_eq!(cell.evaluations(), 2);

        cell_slot.lock().take();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_readers_share_one_evaluation() {
        let counter = Arc::new(AtomicUsize::new(0));
        let slow_counter = counter.clone();
        let cell = Arc::new(ComputeCell::with_formula(
            MetricKind::HeatTransferCoefficient,
            Arc::new(move |inputs: &InputSnapshot| {
                slow_counter.fetch_add(1, Ordering::SeqCst);
                // Widen the window in which other readers pile up on the lock
                std::thread::sleep(Duration::from_millis(20));
                MetricKind::HeatTransferCoefficient.evaluate(inputs)
            }),
        ));
        let inputs = Arc::new(filled_inputs(18.0, 3.5));
        cell.mark_dirty();

        let readers: Vec<_> = (0..16)
            .map(|_| {
                let cell = cell.clone();
                let inputs = inputs.clone();
                tokio::spawn(async move { cell.value(&inputs).await })
            })
            .collect();

        let results = futures_util::future::join_all(readers).await;
        for result in results {
            let value = result.expect("reader task panicked");
            assert_eq!(value.map(|v| v.value), Some(3.5 - 18.0));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
