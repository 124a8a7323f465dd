//! Fault injection and fixtures for tests of the write path and the crates built on it.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hashbrown::HashSet;
use parking_lot::Mutex;
use statingest_types::{
    AggregateDelta, EntryKind, Measurement, Resolution, SeriesKey, StoredEntry, TimeSeriesPoint,
};
use tokio::sync::Semaphore;

use crate::backend::{Backend, BackendError, MemBackend, PutOutcome, Result};

/// A [`MemBackend`] that fails on request.
///
/// Failures happen before the inner backend is touched, so a failed call never leaves a partial
/// write behind.
#[derive(Debug, Default)]
pub struct FailingBackend {
    inner: MemBackend,
    failing_puts: AtomicUsize,
    failing_increments: Mutex<HashSet<Resolution>>,
    put_gate: Mutex<Option<Arc<Semaphore>>>,
    put_calls: AtomicUsize,
    increment_calls: AtomicUsize,
}

impl FailingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &MemBackend {
        &self.inner
    }

    /// Fail the next `n` calls to `put_if_absent`.
    pub fn fail_next_puts(&self, n: usize) {
        self.failing_puts.store(n, Ordering::SeqCst);
    }

    pub fn fail_all_puts(&self) {
        self.failing_puts.store(usize::MAX, Ordering::SeqCst);
    }

    /// Fail every increment of an aggregate at `resolution`.
    pub fn fail_increments_at(&self, resolution: Resolution) {
        self.failing_increments.lock().insert(resolution);
    }

    /// Stop injecting failures.
    pub fn heal(&self) {
        self.failing_puts.store(0, Ordering::SeqCst);
        self.failing_increments.lock().clear();
    }

    /// Make every `put_if_absent` wait until the returned semaphore is closed.
    pub fn hold_puts(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.put_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub fn increment_calls(&self) -> usize {
        self.increment_calls.load(Ordering::SeqCst)
    }

    fn take_put_failure(&self) -> bool {
        self.failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok()
    }
}

#[async_trait]
impl Backend for FailingBackend {
    async fn put_if_absent(&self, key: &SeriesKey, point: &TimeSeriesPoint) -> Result<PutOutcome> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);

        let gate = self.put_gate.lock().clone();
        if let Some(gate) = gate {
            // a closed gate lets everyone through
            let _ = gate.acquire().await;
        }

        if self.take_put_failure() {
            return Err(BackendError::Unavailable(format!("injected failure for {key}")));
        }
        self.inner.put_if_absent(key, point).await
    }

    async fn get_exact(&self, kind: EntryKind, key: &SeriesKey) -> Result<Option<StoredEntry>> {
        self.inner.get_exact(kind, key).await
    }

    async fn atomic_increment(
        &self,
        key: &SeriesKey,
        delta: &AggregateDelta,
    ) -> Result<StoredEntry> {
        self.increment_calls.fetch_add(1, Ordering::SeqCst);

        if self.failing_increments.lock().contains(&key.resolution) {
            return Err(BackendError::Unavailable(format!("injected failure for {key}")));
        }
        self.inner.atomic_increment(key, delta).await
    }
}

pub fn utc(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .expect("valid RFC 3339 timestamp")
        .with_timezone(&Utc)
}

/// A point with a single measurement.
pub fn point(timestamp: &str, id: &str, value: f64) -> TimeSeriesPoint {
    TimeSeriesPoint::new(utc(timestamp), vec![Measurement::new(id, value)])
}
