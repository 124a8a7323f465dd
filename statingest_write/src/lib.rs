//! The ingestion and rollup engine.
//!
//! A submitted point goes through three stages:
//!
//! 1. [`validator`] turns the raw request into a [`TimeSeriesPoint`] with a UTC timestamp.
//! 2. [`coordinator::WriteCoordinator`] commits it exactly once under its [`SeriesKey`], holding
//!    a per-key lock from a sharded [`lock::KeyLockTable`] for the duration of the write.
//! 3. On a first commit, [`rollup::RollupAggregator`] folds the measurements into the aggregate of
//!    every configured coarser resolution with one atomic increment each.
//!
//! [`Ingester`] ties the stages together over any [`backend::Backend`].
//!
//! [`TimeSeriesPoint`]: statingest_types::TimeSeriesPoint
//! [`SeriesKey`]: statingest_types::SeriesKey

pub mod backend;
pub mod backoff;
pub mod coordinator;
mod ingester;
pub mod lock;
pub mod rollup;
pub mod validator;

#[cfg(any(test, feature = "test_helpers"))]
pub mod test_util;

pub use ingester::{Error, IngestConfig, IngestOutcome, Ingester, MAX_INGEST_DEADLINE, Result};
