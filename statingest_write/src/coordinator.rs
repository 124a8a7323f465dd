//! Exactly-once commit of leaf points.
//!
//! For every [`SeriesKey`] at most one write is in flight at a time. The first write to reach
//! the backend wins; later submissions of equivalent content are idempotent replays, anything
//! else is a conflict and the stored point stays authoritative.

use std::{num::NonZeroUsize, sync::Arc};

use statingest_types::{SeriesKey, StoredEntry, TimeSeriesPoint};
use tokio::time::Instant;
use tracing::{debug, error};

use crate::{
    backend::{Backend, BackendError, PutOutcome},
    backoff::{Backoff, BackoffConfig, BackoffError},
    lock::KeyLockTable,
};

/// How a successful ingest left the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commit {
    /// This call wrote the point. Only this outcome triggers a rollup.
    Created,

    /// An equivalent point was already stored; nothing changed.
    Unchanged,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Committed(Commit),

    /// A different point is stored at the key.
    Conflict { existing: StoredEntry },

    /// Another write for the same key is in flight.
    Busy,

    /// The conditional write could not be completed; the key is left as it was.
    BackendFailure(BackoffError<BackendError>),
}

#[derive(Debug)]
pub struct WriteCoordinator {
    backend: Arc<dyn Backend>,
    locks: KeyLockTable<SeriesKey>,
    backoff: BackoffConfig,
}

impl WriteCoordinator {
    pub fn new(backend: Arc<dyn Backend>, lock_shards: NonZeroUsize, backoff: BackoffConfig) -> Self {
        Self {
            backend,
            locks: KeyLockTable::new(lock_shards),
            backoff,
        }
    }

    /// Commit `point` under `key` unless the key already holds a point.
    ///
    /// Never waits for another writer of the same key: a held lock yields [`WriteOutcome::Busy`].
    /// Backend errors are retried until the attempts run out or `deadline` would pass.
    pub async fn ingest(
        &self,
        key: &SeriesKey,
        point: &TimeSeriesPoint,
        deadline: Instant,
    ) -> WriteOutcome {
        let Some(_guard) = self.locks.try_lock(key) else {
            debug!(%key, "write already in flight for key");
            return WriteOutcome::Busy;
        };

        let res = Backoff::new(&self.backoff, deadline)
            .retry_all_errors("put if absent", || self.backend.put_if_absent(key, point))
            .await;

        match res {
            Ok(PutOutcome::Created(entry)) => {
                debug!(%key, version = entry.version, "committed point");
                WriteOutcome::Committed(Commit::Created)
            }
            Ok(PutOutcome::AlreadyExists(existing)) => match existing.as_point() {
                Some(stored) if stored.is_equivalent(point) => {
                    debug!(%key, "idempotent replay of committed point");
                    WriteOutcome::Committed(Commit::Unchanged)
                }
                _ => {
                    debug!(%key, "conflicting point for committed key");
                    WriteOutcome::Conflict { existing }
                }
            },
            Err(e) => {
                error!(%key, error=%e, "failed to commit point");
                WriteOutcome::BackendFailure(e)
            }
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Whether a write for `key` is currently in flight.
    pub fn is_writing(&self, key: &SeriesKey) -> bool {
        self.locks.is_locked(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use chrono::{DateTime, Utc};
    use pretty_assertions::assert_eq;
    use statingest_types::{EntryKind, Measurement, Resolution};

    use crate::{backend::MemBackend, test_util::FailingBackend};

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn point(ts: &str, value: f64) -> TimeSeriesPoint {
        TimeSeriesPoint::new(utc(ts), vec![Measurement::new("antall", value)])
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    fn fast_backoff() -> BackoffConfig {
        BackoffConfig {
            init_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            ..Default::default()
        }
    }

    fn coordinator(backend: Arc<dyn Backend>) -> WriteCoordinator {
        WriteCoordinator::new(backend, NonZeroUsize::new(16).unwrap(), fast_backoff())
    }

    #[tokio::test]
    async fn first_write_creates_then_replay_is_unchanged() {
        let backend = Arc::new(MemBackend::new());
        let coordinator = coordinator(Arc::clone(&backend) as _);
        let p = point("2024-01-01T09:15:00Z", 2.0);
        let key = SeriesKey::for_timestamp("test", Resolution::Minute, p.timestamp());

        assert_eq!(
            coordinator.ingest(&key, &p, deadline()).await,
            WriteOutcome::Committed(Commit::Created)
        );
        assert_eq!(
            coordinator.ingest(&key, &p, deadline()).await,
            WriteOutcome::Committed(Commit::Unchanged)
        );

        let stored = backend.snapshot(EntryKind::Point);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].version, 1);
        assert!(!coordinator.is_writing(&key));
    }

    #[tokio::test]
    async fn replay_with_reordered_measurements_is_unchanged() {
        let coordinator = coordinator(Arc::new(MemBackend::new()));
        let t = utc("2024-01-01T09:15:00Z");
        let a = TimeSeriesPoint::new(
            t,
            vec![Measurement::new("antall", 2.0), Measurement::new("feil", 1.0)],
        );
        let b = TimeSeriesPoint::new(
            t,
            vec![Measurement::new("feil", 1.0), Measurement::new("antall", 2.0)],
        );
        let key = SeriesKey::for_timestamp("test", Resolution::Minute, t);

        coordinator.ingest(&key, &a, deadline()).await;
        assert_eq!(
            coordinator.ingest(&key, &b, deadline()).await,
            WriteOutcome::Committed(Commit::Unchanged)
        );
    }

    #[tokio::test]
    async fn different_content_conflicts_and_keeps_original() {
        let backend = Arc::new(MemBackend::new());
        let coordinator = coordinator(Arc::clone(&backend) as _);
        let original = point("2024-01-01T09:15:00Z", 2.0);
        let key = SeriesKey::for_timestamp("test", Resolution::Minute, original.timestamp());

        coordinator.ingest(&key, &original, deadline()).await;
        let outcome = coordinator
            .ingest(&key, &point("2024-01-01T09:15:00Z", 3.0), deadline())
            .await;

        let WriteOutcome::Conflict { existing } = outcome else {
            panic!("expected a conflict");
        };
        assert_eq!(existing.as_point(), Some(&original));
        assert_eq!(
            backend.snapshot(EntryKind::Point)[0].as_point(),
            Some(&original)
        );
    }

    #[tokio::test]
    async fn held_key_is_busy_but_other_keys_proceed() {
        let coordinator = coordinator(Arc::new(MemBackend::new()));
        let p = point("2024-01-01T09:15:00Z", 2.0);
        let key = SeriesKey::for_timestamp("test", Resolution::Minute, p.timestamp());

        let guard = coordinator.locks.try_lock(&key).unwrap();
        assert_eq!(
            coordinator.ingest(&key, &p, deadline()).await,
            WriteOutcome::Busy
        );

        let other = point("2024-01-01T09:16:00Z", 2.0);
        let other_key = SeriesKey::for_timestamp("test", Resolution::Minute, other.timestamp());
        assert_eq!(
            coordinator.ingest(&other_key, &other, deadline()).await,
            WriteOutcome::Committed(Commit::Created)
        );

        drop(guard);
        assert_eq!(
            coordinator.ingest(&key, &p, deadline()).await,
            WriteOutcome::Committed(Commit::Created)
        );
    }

    #[test_log::test(tokio::test)]
    async fn transient_backend_errors_are_retried() {
        let backend = Arc::new(FailingBackend::new());
        backend.fail_next_puts(2);
        let coordinator = coordinator(Arc::clone(&backend) as _);
        let p = point("2024-01-01T09:15:00Z", 2.0);
        let key = SeriesKey::for_timestamp("test", Resolution::Minute, p.timestamp());

        assert_eq!(
            coordinator.ingest(&key, &p, deadline()).await,
            WriteOutcome::Committed(Commit::Created)
        );
        assert_eq!(backend.put_calls(), 3);
    }

    #[test_log::test(tokio::test)]
    async fn exhausted_retries_leave_key_absent() {
        let backend = Arc::new(FailingBackend::new());
        backend.fail_all_puts();
        let coordinator = coordinator(Arc::clone(&backend) as _);
        let p = point("2024-01-01T09:15:00Z", 2.0);
        let key = SeriesKey::for_timestamp("test", Resolution::Minute, p.timestamp());

        let outcome = coordinator.ingest(&key, &p, deadline()).await;
        let WriteOutcome::BackendFailure(e) = outcome else {
            panic!("expected a backend failure");
        };
        assert_eq!(e.attempts(), 3);
        assert!(!coordinator.is_writing(&key));
        assert_eq!(
            backend.get_exact(EntryKind::Point, &key).await.unwrap(),
            None
        );

        // the key can be written once the backend recovers
        backend.heal();
        assert_eq!(
            coordinator.ingest(&key, &p, deadline()).await,
            WriteOutcome::Committed(Commit::Created)
        );
    }

    #[tokio::test]
    async fn passed_deadline_fails_without_waiting() {
        let backend = Arc::new(FailingBackend::new());
        backend.fail_all_puts();
        let coordinator = WriteCoordinator::new(
            Arc::clone(&backend) as _,
            NonZeroUsize::new(4).unwrap(),
            BackoffConfig {
                init_backoff: Duration::from_secs(30),
                max_backoff: Duration::from_secs(30),
                ..Default::default()
            },
        );
        let p = point("2024-01-01T09:15:00Z", 2.0);
        let key = SeriesKey::for_timestamp("test", Resolution::Minute, p.timestamp());

        let outcome = coordinator.ingest(&key, &p, deadline()).await;
        assert!(
            matches!(
                outcome,
                WriteOutcome::BackendFailure(BackoffError::DeadlineExceeded { attempts: 1, .. })
            ),
            "{outcome:?}"
        );
        assert_eq!(backend.put_calls(), 1);
    }
}
