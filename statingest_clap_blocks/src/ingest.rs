//! CLI config for the ingestion engine.

use std::{collections::BTreeSet, num::NonZeroUsize, time::Duration};

use statingest_types::Resolution;
use statingest_write::{
    IngestConfig as EngineConfig, MAX_INGEST_DEADLINE, backoff::BackoffConfig,
};

/// Resolutions, lock table sizing, retries and deadline of the ingestion engine.
#[derive(Debug, Clone, clap::Parser)]
pub struct IngestConfig {
    /// Resolutions clients may write at. Each also receives rollups from finer ones.
    #[clap(
        long = "resolutions",
        env = "STATINGEST_RESOLUTIONS",
        default_value = "minute,hour,day,month,year",
        value_delimiter = ',',
        action
    )]
    pub resolutions: Vec<Resolution>,

    /// Number of shards in the per-key lock tables.
    #[clap(
        long = "lock-shards",
        env = "STATINGEST_LOCK_SHARDS",
        default_value = "64",
        action
    )]
    pub lock_shards: NonZeroUsize,

    /// Total attempts for each backend call, including the first.
    #[clap(
        long = "backend-retry-attempts",
        env = "STATINGEST_BACKEND_RETRY_ATTEMPTS",
        default_value = "3",
        action
    )]
    pub backend_retry_attempts: NonZeroUsize,

    /// Sleep before the first retry of a failed backend call.
    #[clap(
        long = "backend-retry-initial-backoff",
        env = "STATINGEST_BACKEND_RETRY_INITIAL_BACKOFF",
        default_value = "50ms",
        value_parser = humantime::parse_duration
    )]
    pub backend_retry_initial_backoff: Duration,

    /// Upper bound on the sleep between retries.
    #[clap(
        long = "backend-retry-max-backoff",
        env = "STATINGEST_BACKEND_RETRY_MAX_BACKOFF",
        default_value = "1s",
        value_parser = humantime::parse_duration
    )]
    pub backend_retry_max_backoff: Duration,

    /// Growth factor of the sleep between retries.
    #[clap(
        long = "backend-retry-backoff-base",
        env = "STATINGEST_BACKEND_RETRY_BACKOFF_BASE",
        default_value = "2.0",
        value_parser = parse_backoff_base
    )]
    pub backend_retry_backoff_base: f64,

    /// Upper bound on the time one write may spend on backend retries.
    #[clap(
        long = "ingest-deadline",
        env = "STATINGEST_INGEST_DEADLINE",
        default_value = "5s",
        value_parser = parse_ingest_deadline
    )]
    pub ingest_deadline: Duration,
}

fn parse_backoff_base(s: &str) -> Result<f64, String> {
    let base: f64 = s.parse().map_err(|e| format!("invalid backoff base '{s}': {e}"))?;
    if !base.is_finite() || base < 1. {
        return Err(format!(
            "backoff base must be a finite number of at least 1.0, got {s}"
        ));
    }
    Ok(base)
}

fn parse_ingest_deadline(s: &str) -> Result<Duration, String> {
    let deadline = humantime::parse_duration(s).map_err(|e| e.to_string())?;
    if deadline > MAX_INGEST_DEADLINE {
        return Err(format!(
            "ingest deadline must be at most {}",
            humantime::format_duration(MAX_INGEST_DEADLINE)
        ));
    }
    Ok(deadline)
}

impl IngestConfig {
    pub fn resolutions(&self) -> BTreeSet<Resolution> {
        self.resolutions.iter().copied().collect()
    }

    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            max_attempts: self.backend_retry_attempts,
            init_backoff: self.backend_retry_initial_backoff,
            max_backoff: self.backend_retry_max_backoff,
            base: self.backend_retry_backoff_base,
        }
    }

    /// The engine config these flags describe.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            resolutions: self.resolutions(),
            lock_shards: self.lock_shards,
            backoff: self.backoff(),
            deadline: self.ingest_deadline,
        }
    }
}
