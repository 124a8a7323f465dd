//! An in-memory [`Backend`](super::Backend) for tests and single-process deployments.

use async_trait::async_trait;
use hashbrown::{HashMap, hash_map::Entry};
use parking_lot::RwLock;
use statingest_types::{
    AggregateDelta, AggregateValue, EntryKind, Payload, SeriesKey, StoredEntry, TimeSeriesPoint,
};

use super::{Backend, KeyValueStore, PutOutcome, Result, expect_kind};

type Keyspace = HashMap<(EntryKind, SeriesKey), StoredEntry>;

/// An in-memory backend.
///
/// Conditional writes and increments run under one write lock, so both are atomic.
#[derive(Debug, Default)]
pub struct MemBackend {
    entries: RwLock<Keyspace>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries of `kind`.
    pub fn count(&self, kind: EntryKind) -> usize {
        self.entries
            .read()
            .keys()
            .filter(|(k, _)| *k == kind)
            .count()
    }

    /// All entries of `kind`, ordered by key.
    pub fn snapshot(&self, kind: EntryKind) -> Vec<StoredEntry> {
        let mut entries: Vec<_> = self
            .entries
            .read()
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, e)| e.clone())
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    pub(crate) fn put_if_absent_sync(
        &self,
        key: &SeriesKey,
        point: &TimeSeriesPoint,
    ) -> Result<PutOutcome> {
        match self.entries.write().entry((EntryKind::Point, key.clone())) {
            Entry::Occupied(o) => Ok(PutOutcome::AlreadyExists(o.get().clone())),
            Entry::Vacant(v) => {
                let entry = v.insert(StoredEntry {
                    key: key.clone(),
                    payload: Payload::Point(point.clone()),
                    version: 1,
                });
                Ok(PutOutcome::Created(entry.clone()))
            }
        }
    }

    pub(crate) fn get_sync(&self, kind: EntryKind, key: &SeriesKey) -> Option<StoredEntry> {
        self.entries.read().get(&(kind, key.clone())).cloned()
    }

    pub(crate) fn increment_sync(
        &self,
        key: &SeriesKey,
        delta: &AggregateDelta,
    ) -> Result<StoredEntry> {
        let mut entries = self.entries.write();
        let entry = entries
            .entry((EntryKind::Aggregate, key.clone()))
            .or_insert_with(|| StoredEntry {
                key: key.clone(),
                payload: Payload::Aggregate(AggregateValue::default()),
                version: 0,
            });
        expect_kind(entry, EntryKind::Aggregate)?;

        if let Payload::Aggregate(agg) = &mut entry.payload {
            agg.apply(delta);
        }
        entry.version += 1;
        Ok(entry.clone())
    }
}

#[async_trait]
impl Backend for MemBackend {
    async fn put_if_absent(&self, key: &SeriesKey, point: &TimeSeriesPoint) -> Result<PutOutcome> {
        self.put_if_absent_sync(key, point)
    }

    async fn get_exact(&self, kind: EntryKind, key: &SeriesKey) -> Result<Option<StoredEntry>> {
        Ok(self.get_sync(kind, key))
    }

    async fn atomic_increment(
        &self,
        key: &SeriesKey,
        delta: &AggregateDelta,
    ) -> Result<StoredEntry> {
        self.increment_sync(key, delta)
    }
}

#[async_trait]
impl KeyValueStore for MemBackend {
    async fn insert_if_absent(&self, entry: StoredEntry) -> Result<Option<StoredEntry>> {
        match self
            .entries
            .write()
            .entry((entry.payload.kind(), entry.key.clone()))
        {
            Entry::Occupied(o) => Ok(Some(o.get().clone())),
            Entry::Vacant(v) => {
                v.insert(entry);
                Ok(None)
            }
        }
    }

    async fn get(&self, kind: EntryKind, key: &SeriesKey) -> Result<Option<StoredEntry>> {
        Ok(self.get_sync(kind, key))
    }

    async fn put(&self, entry: StoredEntry) -> Result<()> {
        self.entries
            .write()
            .insert((entry.payload.kind(), entry.key.clone()), entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{DateTime, Utc};
    use pretty_assertions::assert_eq;
    use statingest_types::{Measurement, Resolution};

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn minute_key(ts: &str) -> SeriesKey {
        SeriesKey::for_timestamp("test", Resolution::Minute, utc(ts))
    }

    #[tokio::test]
    async fn put_if_absent_keeps_first_value() {
        let backend = MemBackend::new();
        let key = minute_key("2024-01-01T09:15:00Z");
        let first = TimeSeriesPoint::new(key.bucket_start, vec![Measurement::new("antall", 2.0)]);
        let second = TimeSeriesPoint::new(key.bucket_start, vec![Measurement::new("antall", 9.0)]);

        let entry = match backend.put_if_absent(&key, &first).await.unwrap() {
            PutOutcome::Created(entry) => entry,
            other => panic!("expected creation, got {other:?}"),
        };
        assert_eq!(entry.version, 1);

        let again = backend.put_if_absent(&key, &second).await.unwrap();
        assert_eq!(again, PutOutcome::AlreadyExists(entry.clone()));

        let stored = backend.get_exact(EntryKind::Point, &key).await.unwrap();
        assert_eq!(stored, Some(entry));
    }

    #[tokio::test]
    async fn increments_create_then_accumulate() {
        let backend = MemBackend::new();
        let key = SeriesKey::for_timestamp("test", Resolution::Hour, utc("2024-01-01T09:00:00Z"));

        let first = backend
            .atomic_increment(
                &key,
                &AggregateDelta::from_measurements(&[Measurement::new("antall", 2.0)]),
            )
            .await
            .unwrap();
        assert_eq!(first.version, 1);

        let second = backend
            .atomic_increment(
                &key,
                &AggregateDelta::from_measurements(&[Measurement::new("antall", 3.0)]),
            )
            .await
            .unwrap();
        assert_eq!(second.version, 2);

        let agg = second.as_aggregate().unwrap();
        assert_eq!(agg.sum_of("antall"), Some(5.0));
        assert_eq!(agg.count, 2);
    }

    #[tokio::test]
    async fn points_and_aggregates_do_not_collide() {
        let backend = MemBackend::new();
        let key = SeriesKey::for_timestamp("test", Resolution::Hour, utc("2024-01-01T09:00:00Z"));
        let point = TimeSeriesPoint::new(key.bucket_start, vec![Measurement::new("antall", 1.0)]);

        backend.put_if_absent(&key, &point).await.unwrap();
        backend
            .atomic_increment(&key, &AggregateDelta::from_measurements(point.measurements()))
            .await
            .unwrap();

        assert_eq!(backend.count(EntryKind::Point), 1);
        assert_eq!(backend.count(EntryKind::Aggregate), 1);
        let stored = backend.get_exact(EntryKind::Point, &key).await.unwrap().unwrap();
        assert_eq!(stored.as_point(), Some(&point));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_increments_are_not_lost() {
        let backend = std::sync::Arc::new(MemBackend::new());
        let key = SeriesKey::for_timestamp("test", Resolution::Day, utc("2024-01-01T00:00:00Z"));

        let tasks: Vec<_> = (0..100)
            .map(|_| {
                let backend = std::sync::Arc::clone(&backend);
                let key = key.clone();
                tokio::spawn(async move {
                    backend
                        .atomic_increment(
                            &key,
                            &AggregateDelta::from_measurements(&[Measurement::new("n", 1.0)]),
                        )
                        .await
                        .unwrap();
                })
            })
            .collect();
        for t in tasks {
            t.await.unwrap();
        }

        let entry = backend
            .get_exact(EntryKind::Aggregate, &key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.version, 100);
        assert_eq!(entry.as_aggregate().unwrap().sum_of("n"), Some(100.0));
    }
}
