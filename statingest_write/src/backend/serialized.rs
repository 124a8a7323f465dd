//! Atomic increments for stores that only offer get and put.

use std::num::NonZeroUsize;

use async_trait::async_trait;
use statingest_types::{
    AggregateDelta, AggregateValue, EntryKind, Payload, SeriesKey, StoredEntry, TimeSeriesPoint,
};

use super::{Backend, KeyValueStore, PutOutcome, Result, expect_kind};
use crate::lock::KeyLockTable;

/// A [`Backend`] over a [`KeyValueStore`] that has no native increment.
///
/// Each increment is a read-modify-write performed while holding the aggregate key's lock, so
/// increments to one aggregate are applied one at a time and none is lost. Waiters queue on the
/// lock rather than failing.
#[derive(Debug)]
pub struct SerializedIncrement<S> {
    store: S,
    locks: KeyLockTable<SeriesKey>,
}

impl<S> SerializedIncrement<S>
where
    S: KeyValueStore,
{
    pub fn new(store: S, lock_shards: NonZeroUsize) -> Self {
        Self {
            store,
            locks: KeyLockTable::new(lock_shards),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

#[async_trait]
impl<S> Backend for SerializedIncrement<S>
where
    S: KeyValueStore,
{
    async fn put_if_absent(&self, key: &SeriesKey, point: &TimeSeriesPoint) -> Result<PutOutcome> {
        let entry = StoredEntry {
            key: key.clone(),
            payload: Payload::Point(point.clone()),
            version: 1,
        };
        match self.store.insert_if_absent(entry.clone()).await? {
            None => Ok(PutOutcome::Created(entry)),
            Some(existing) => Ok(PutOutcome::AlreadyExists(existing)),
        }
    }

    async fn get_exact(&self, kind: EntryKind, key: &SeriesKey) -> Result<Option<StoredEntry>> {
        self.store.get(kind, key).await
    }

    async fn atomic_increment(
        &self,
        key: &SeriesKey,
        delta: &AggregateDelta,
    ) -> Result<StoredEntry> {
        let _guard = self.locks.lock(key).await;

        let mut entry = match self.store.get(EntryKind::Aggregate, key).await? {
            Some(entry) => {
                expect_kind(&entry, EntryKind::Aggregate)?;
                entry
            }
            None => StoredEntry {
                key: key.clone(),
                payload: Payload::Aggregate(AggregateValue::default()),
                version: 0,
            },
        };

        if let Payload::Aggregate(agg) = &mut entry.payload {
            agg.apply(delta);
        }
        entry.version += 1;

        self.store.put(entry.clone()).await?;
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use chrono::{DateTime, Utc};
    use pretty_assertions::assert_eq;
    use statingest_types::{Measurement, Resolution};

    use crate::backend::MemBackend;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn backend() -> SerializedIncrement<MemBackend> {
        SerializedIncrement::new(MemBackend::new(), NonZeroUsize::new(8).unwrap())
    }

    #[tokio::test]
    async fn put_if_absent_reports_existing() {
        let backend = backend();
        let key = SeriesKey::for_timestamp("test", Resolution::Minute, utc("2024-01-01T09:15:00Z"));
        let point = TimeSeriesPoint::new(key.bucket_start, vec![Measurement::new("antall", 2.0)]);

        let created = backend.put_if_absent(&key, &point).await.unwrap();
        assert!(matches!(created, PutOutcome::Created(_)));

        let other = TimeSeriesPoint::new(key.bucket_start, vec![Measurement::new("antall", 7.0)]);
        match backend.put_if_absent(&key, &other).await.unwrap() {
            PutOutcome::AlreadyExists(existing) => assert_eq!(existing.as_point(), Some(&point)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_increments_are_serialized() {
        let backend = Arc::new(backend());
        let key = SeriesKey::for_timestamp("test", Resolution::Hour, utc("2024-01-01T09:00:00Z"));

        let tasks: Vec<_> = (1..=50)
            .map(|i| {
                let backend = Arc::clone(&backend);
                let key = key.clone();
                tokio::spawn(async move {
                    let delta =
                        AggregateDelta::from_measurements(&[Measurement::new("antall", i as f64)]);
                    backend.atomic_increment(&key, &delta).await.unwrap();
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
        let agg = entry.as_aggregate().unwrap();
        assert_eq!(agg.count, 50);
        assert_eq!(agg.sum_of("antall"), Some((1..=50).sum::<i32>() as f64));
        assert_eq!(entry.version, 50);
        assert_eq!(backend.store().count(EntryKind::Aggregate), 1);
    }
}
