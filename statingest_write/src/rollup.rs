//! Incremental maintenance of coarser-resolution aggregates.

use std::{collections::BTreeSet, sync::Arc};

use chrono::{DateTime, Utc};
use serde::Serialize;
use statingest_types::{
    AggregateDelta, AggregateValue, EntryKind, Measurement, Payload, Resolution, SeriesKey,
    StoredEntry,
};
use tokio::time::Instant;
use tracing::{debug, error};

use crate::{
    backend::{Backend, BackendError},
    backoff::{Backoff, BackoffConfig, BackoffError},
};

/// An aggregate that took the increment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedRollup {
    pub key: SeriesKey,
    pub value: AggregateValue,
    pub version: u64,
}

/// An aggregate that could not be incremented and no longer reflects its leaf entries.
#[derive(Debug, Clone, PartialEq)]
pub struct StaleRollup {
    pub key: SeriesKey,
    pub error: BackoffError<BackendError>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RollupReport {
    pub applied: Vec<AppliedRollup>,
    pub stale: Vec<StaleRollup>,
}

impl RollupReport {
    /// The leaf was committed but at least one aggregate missed it.
    pub fn is_degraded(&self) -> bool {
        !self.stale.is_empty()
    }

    pub fn stale_resolutions(&self) -> Vec<Resolution> {
        self.stale.iter().map(|s| s.key.resolution).collect()
    }
}

/// Folds first commits into every configured coarser aggregate.
#[derive(Debug)]
pub struct RollupAggregator {
    backend: Arc<dyn Backend>,
    resolutions: BTreeSet<Resolution>,
    backoff: BackoffConfig,
}

impl RollupAggregator {
    pub fn new(
        backend: Arc<dyn Backend>,
        resolutions: impl IntoIterator<Item = Resolution>,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            backend,
            resolutions: resolutions.into_iter().collect(),
            backoff,
        }
    }

    /// Increment the aggregate of every configured resolution coarser than
    /// `committed_resolution` whose window contains `bucket_start`.
    ///
    /// Must only be called once per leaf, right after its first commit. Each resolution is
    /// attempted independently, a failure at one does not stop the others.
    pub async fn roll_up(
        &self,
        series: &str,
        committed_resolution: Resolution,
        bucket_start: DateTime<Utc>,
        measurements: &[Measurement],
        deadline: Instant,
    ) -> RollupReport {
        let delta = AggregateDelta::from_measurements(measurements);
        let mut report = RollupReport::default();

        for resolution in committed_resolution
            .coarser()
            .filter(|r| self.resolutions.contains(r))
        {
            let key = SeriesKey::for_timestamp(series, resolution, bucket_start);

            let res = Backoff::new(&self.backoff, deadline)
                .retry_all_errors("aggregate increment", || {
                    self.backend.atomic_increment(&key, &delta)
                })
                .await
                .and_then(into_applied);

            match res {
                Ok(applied) => {
                    debug!(
                        %key,
                        version = applied.version,
                        count = applied.value.count,
                        "aggregate updated"
                    );
                    report.applied.push(applied);
                }
                Err(error) => {
                    error!(
                        %key,
                        series,
                        %resolution,
                        bucket_start = %key.bucket_start,
                        %error,
                        "aggregate is stale, it needs to be reconciled"
                    );
                    report.stale.push(StaleRollup { key, error });
                }
            }
        }

        report
    }
}

fn into_applied(entry: StoredEntry) -> Result<AppliedRollup, BackoffError<BackendError>> {
    match entry.payload {
        Payload::Aggregate(value) => Ok(AppliedRollup {
            key: entry.key,
            value,
            version: entry.version,
        }),
        Payload::Point(_) => Err(BackoffError::RetriesExhausted {
            task_name: "aggregate increment",
            attempts: 1,
            source: BackendError::UnexpectedKind {
                key: entry.key,
                expected: EntryKind::Aggregate,
                found: EntryKind::Point,
            },
        }),
    }
}
