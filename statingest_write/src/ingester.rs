use std::{collections::BTreeSet, num::NonZeroUsize, sync::Arc, time::Duration};

use statingest_types::{Resolution, SeriesKey, StoredEntry, TimeSeriesPoint};
use thiserror::Error;
use tokio::time::Instant;
use tracing::info;

use crate::{
    backend::{Backend, BackendError},
    backoff::{BackoffConfig, BackoffError},
    coordinator::{Commit, WriteCoordinator, WriteOutcome},
    rollup::{RollupAggregator, RollupReport},
    validator::{self, ValidationError},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid point: {0}")]
    Validation(#[from] ValidationError),

    #[error("resolution {0} is not configured")]
    ResolutionNotConfigured(Resolution),

    #[error("invalid series name {0:?}: {1}")]
    InvalidSeriesName(String, &'static str),

    #[error("at least one resolution must be configured")]
    NoResolutions,

    #[error("backoff base must be a finite number of at least 1.0, got {0}")]
    InvalidBackoffBase(f64),

    #[error("ingest deadline {0:?} exceeds the maximum of {max:?}", max = MAX_INGEST_DEADLINE)]
    DeadlineTooLong(Duration),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Upper bound accepted for [`IngestConfig::deadline`].
pub const MAX_INGEST_DEADLINE: Duration = Duration::from_secs(60 * 60);

/// Tuning for an [`Ingester`].
#[derive(Debug, Clone, PartialEq)]
pub struct IngestConfig {
    /// Resolutions clients may submit at, and that receive rollups.
    pub resolutions: BTreeSet<Resolution>,

    /// Shard count of the per-key lock tables.
    pub lock_shards: NonZeroUsize,

    pub backoff: BackoffConfig,

    /// Upper bound on the time one ingest spends retrying backend calls.
    pub deadline: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            resolutions: Resolution::ALL.into_iter().collect(),
            lock_shards: NonZeroUsize::new(64).expect("64 is non-zero"),
            backoff: BackoffConfig::default(),
            deadline: Duration::from_secs(5),
        }
    }
}

/// What happened to one submitted point.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// The point is stored. `rollup` is empty unless this call created the entry.
    Committed {
        key: SeriesKey,
        commit: Commit,
        rollup: RollupReport,
    },

    Conflict {
        key: SeriesKey,
        existing: StoredEntry,
    },

    Busy {
        key: SeriesKey,
    },

    BackendFailure {
        key: SeriesKey,
        error: BackoffError<BackendError>,
    },
}

impl IngestOutcome {
    pub fn key(&self) -> &SeriesKey {
        match self {
            Self::Committed { key, .. }
            | Self::Conflict { key, .. }
            | Self::Busy { key }
            | Self::BackendFailure { key, .. } => key,
        }
    }
}

/// Validates points, commits them exactly once and keeps the coarser aggregates up to date.
#[derive(Debug)]
pub struct Ingester {
    coordinator: WriteCoordinator,
    aggregator: RollupAggregator,
    config: IngestConfig,
}

impl Ingester {
    pub fn new(backend: Arc<dyn Backend>, config: IngestConfig) -> Result<Self> {
        if config.resolutions.is_empty() {
            return Err(Error::NoResolutions);
        }
        if !config.backoff.base.is_finite() || config.backoff.base < 1. {
            return Err(Error::InvalidBackoffBase(config.backoff.base));
        }
        if config.deadline > MAX_INGEST_DEADLINE {
            return Err(Error::DeadlineTooLong(config.deadline));
        }

        let coordinator =
            WriteCoordinator::new(Arc::clone(&backend), config.lock_shards, config.backoff);
        let aggregator =
            RollupAggregator::new(backend, config.resolutions.iter().copied(), config.backoff);

        Ok(Self {
            coordinator,
            aggregator,
            config,
        })
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        self.coordinator.backend()
    }

    /// Parse, validate and ingest a JSON encoded point.
    pub async fn ingest_json(
        &self,
        series: &str,
        resolution: Resolution,
        body: &[u8],
    ) -> Result<IngestOutcome> {
        self.check_target(series, resolution)?;
        let point = validator::normalize_json(body)?;
        self.ingest(series, resolution, point).await
    }

    /// Ingest an already normalized point.
    pub async fn ingest(
        &self,
        series: &str,
        resolution: Resolution,
        point: TimeSeriesPoint,
    ) -> Result<IngestOutcome> {
        self.check_target(series, resolution)?;

        let now = Instant::now();
        // bounded by MAX_INGEST_DEADLINE, so only an exhausted clock falls back to no retries
        let deadline = now.checked_add(self.config.deadline).unwrap_or(now);
        let key = SeriesKey::for_timestamp(series, resolution, point.timestamp());

        let outcome = match self.coordinator.ingest(&key, &point, deadline).await {
            WriteOutcome::Committed(Commit::Created) => {
                let rollup = self
                    .aggregator
                    .roll_up(
                        series,
                        resolution,
                        key.bucket_start,
                        point.measurements(),
                        deadline,
                    )
                    .await;
                if rollup.is_degraded() {
                    info!(
                        %key,
                        stale = ?rollup.stale_resolutions(),
                        "point committed with stale aggregates"
                    );
                }
                IngestOutcome::Committed {
                    key,
                    commit: Commit::Created,
                    rollup,
                }
            }
            WriteOutcome::Committed(Commit::Unchanged) => IngestOutcome::Committed {
                key,
                commit: Commit::Unchanged,
                rollup: RollupReport::default(),
            },
            WriteOutcome::Conflict { existing } => IngestOutcome::Conflict { key, existing },
            WriteOutcome::Busy => IngestOutcome::Busy { key },
            WriteOutcome::BackendFailure(error) => IngestOutcome::BackendFailure { key, error },
        };

        Ok(outcome)
    }

    fn check_target(&self, series: &str, resolution: Resolution) -> Result<()> {
        if series.is_empty() {
            return Err(Error::InvalidSeriesName(
                series.to_string(),
                "must not be empty",
            ));
        }
        if series.chars().any(|c| c == '/' || c.is_control()) {
            return Err(Error::InvalidSeriesName(
                series.to_string(),
                "must not contain '/' or control characters",
            ));
        }
        if !self.config.resolutions.contains(&resolution) {
            return Err(Error::ResolutionNotConfigured(resolution));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;
    use statingest_types::EntryKind;

    use crate::{
        backend::MemBackend,
        test_util::{FailingBackend, point, utc},
    };

    fn fast_config() -> IngestConfig {
        IngestConfig {
            backoff: BackoffConfig {
                init_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn requires_a_resolution() {
        let config = IngestConfig {
            resolutions: BTreeSet::new(),
            ..Default::default()
        };
        let err = Ingester::new(Arc::new(MemBackend::new()), config).unwrap_err();
        assert!(matches!(err, Error::NoResolutions), "{err}");
    }

    #[test]
    fn rejects_unusable_retry_settings() {
        for base in [0.5, f64::NAN, f64::INFINITY] {
            let config = IngestConfig {
                backoff: BackoffConfig {
                    base,
                    ..Default::default()
                },
                ..Default::default()
            };
            let err = Ingester::new(Arc::new(MemBackend::new()), config).unwrap_err();
            assert!(matches!(err, Error::InvalidBackoffBase(_)), "{err}");
        }

        let config = IngestConfig {
            deadline: Duration::MAX,
            ..Default::default()
        };
        let err = Ingester::new(Arc::new(MemBackend::new()), config).unwrap_err();
        assert!(matches!(err, Error::DeadlineTooLong(_)), "{err}");

        let config = IngestConfig {
            deadline: MAX_INGEST_DEADLINE,
            ..Default::default()
        };
        Ingester::new(Arc::new(MemBackend::new()), config).unwrap();
    }

    #[tokio::test]
    async fn unchanged_replay_does_not_roll_up_again() {
        let backend = Arc::new(MemBackend::new());
        let ingester = Ingester::new(Arc::clone(&backend) as _, fast_config()).unwrap();
        let p = point("2024-01-01T09:15:00Z", "antall", 2.0);

        let first = ingester
            .ingest("test", Resolution::Minute, p.clone())
            .await
            .unwrap();
        let IngestOutcome::Committed { commit, rollup, .. } = first else {
            panic!("expected a commit");
        };
        assert_eq!(commit, Commit::Created);
        assert_eq!(rollup.applied.len(), 4);

        let second = ingester
            .ingest("test", Resolution::Minute, p)
            .await
            .unwrap();
        let IngestOutcome::Committed { commit, rollup, .. } = second else {
            panic!("expected a commit");
        };
        assert_eq!(commit, Commit::Unchanged);
        assert_eq!(rollup, RollupReport::default());

        for entry in backend.snapshot(EntryKind::Aggregate) {
            assert_eq!(entry.version, 1, "{}", entry.key);
            assert_eq!(entry.as_aggregate().unwrap().count, 1);
        }
    }

    #[tokio::test]
    async fn hour_submission_rolls_into_day_month_year() {
        let backend = Arc::new(MemBackend::new());
        let ingester = Ingester::new(Arc::clone(&backend) as _, fast_config()).unwrap();

        let outcome = ingester
            .ingest(
                "test",
                Resolution::Hour,
                point("2024-01-01T09:30:00Z", "antall", 4.0),
            )
            .await
            .unwrap();

        assert_eq!(
            outcome.key(),
            &SeriesKey {
                series: "test".to_string(),
                resolution: Resolution::Hour,
                bucket_start: utc("2024-01-01T09:00:00Z"),
            }
        );
        let resolutions: Vec<_> = backend
            .snapshot(EntryKind::Aggregate)
            .into_iter()
            .map(|e| e.key.resolution)
            .collect();
        assert_eq!(
            resolutions,
            vec![Resolution::Day, Resolution::Month, Resolution::Year]
        );
    }

    #[tokio::test]
    async fn rejects_unconfigured_resolution_and_bad_series() {
        let config = IngestConfig {
            resolutions: [Resolution::Minute, Resolution::Hour].into_iter().collect(),
            ..fast_config()
        };
        let backend = Arc::new(MemBackend::new());
        let ingester = Ingester::new(Arc::clone(&backend) as _, config).unwrap();
        let p = point("2024-01-01T09:15:00Z", "antall", 2.0);

        let err = ingester
            .ingest("test", Resolution::Day, p.clone())
            .await
            .unwrap_err();
        assert!(
            matches!(err, Error::ResolutionNotConfigured(Resolution::Day)),
            "{err}"
        );

        for series in ["", "a/b", "tab\there"] {
            let err = ingester
                .ingest(series, Resolution::Minute, p.clone())
                .await
                .unwrap_err();
            assert!(matches!(err, Error::InvalidSeriesName(..)), "{err}");
        }

        assert_eq!(backend.count(EntryKind::Point), 0);
    }

    #[tokio::test]
    async fn malformed_json_is_rejected_before_any_write() {
        let backend = Arc::new(FailingBackend::new());
        let ingester = Ingester::new(Arc::clone(&backend) as _, fast_config()).unwrap();

        let err = ingester
            .ingest_json("test", Resolution::Minute, b"invalidJson")
            .await
            .unwrap_err();
        assert!(
            matches!(err, Error::Validation(ValidationError::MalformedInput(_))),
            "{err}"
        );
        assert_eq!(backend.put_calls(), 0);
        assert_eq!(backend.increment_calls(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn stale_aggregates_are_reported_as_degraded_success() {
        let backend = Arc::new(FailingBackend::new());
        backend.fail_increments_at(Resolution::Month);
        let ingester = Ingester::new(Arc::clone(&backend) as _, fast_config()).unwrap();

        let outcome = ingester
            .ingest(
                "test",
                Resolution::Minute,
                point("2024-01-01T09:15:00Z", "antall", 2.0),
            )
            .await
            .unwrap();

        let IngestOutcome::Committed { commit, rollup, .. } = outcome else {
            panic!("expected a commit");
        };
        assert_eq!(commit, Commit::Created);
        assert!(rollup.is_degraded());
        assert_eq!(rollup.stale_resolutions(), vec![Resolution::Month]);
        assert_eq!(backend.inner().count(EntryKind::Point), 1);
    }
}
