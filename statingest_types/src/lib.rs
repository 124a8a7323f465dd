//! Shared data model for statingest.
//!
//! A client submits a [`TimeSeriesPoint`] for a series at some [`Resolution`]. The point is
//! stored once as a leaf entry under its [`SeriesKey`], and folded into an [`AggregateValue`]
//! for every coarser resolution whose window contains it.

mod resolution;

pub use resolution::{ParseResolutionError, Resolution};

use std::{collections::BTreeMap, fmt::Display};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// A single named value within a point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub id: String,
    pub value: f64,
}

impl Measurement {
    pub fn new(id: impl Into<String>, value: f64) -> Self {
        Self {
            id: id.into(),
            value,
        }
    }
}

/// A normalized point: the timestamp is in UTC and measurement ids are unique.
///
/// The derived [`PartialEq`] is sensitive to measurement order, use
/// [`is_equivalent`][Self::is_equivalent] to compare stored content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    timestamp: DateTime<Utc>,
    measurements: Vec<Measurement>,
}

impl TimeSeriesPoint {
    pub fn new(timestamp: DateTime<Utc>, measurements: Vec<Measurement>) -> Self {
        Self {
            timestamp,
            measurements,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn measurements(&self) -> &[Measurement] {
        &self.measurements
    }

    pub fn value_of(&self, id: &str) -> Option<f64> {
        self.measurements
            .iter()
            .find(|m| m.id == id)
            .map(|m| m.value)
    }

    /// Two points are equivalent when they have the same timestamp and the same id to value
    /// mapping, regardless of measurement order.
    pub fn is_equivalent(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp
            && self.measurements.len() == other.measurements.len()
            && self
                .measurements
                .iter()
                .all(|m| other.value_of(&m.id) == Some(m.value))
    }
}

/// The identity of a stored entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    pub series: String,
    pub resolution: Resolution,
    pub bucket_start: DateTime<Utc>,
}

impl SeriesKey {
    /// Build the key of the bucket at `resolution` that contains `timestamp`.
    pub fn for_timestamp(
        series: impl Into<String>,
        resolution: Resolution,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            series: series.into(),
            resolution,
            bucket_start: resolution.truncate(timestamp),
        }
    }

    /// The key of the aggregate at the coarser `resolution` whose window covers this key.
    pub fn covering(&self, resolution: Resolution) -> Self {
        Self::for_timestamp(self.series.clone(), resolution, self.bucket_start)
    }

    /// Exclusive end of the bucket this key identifies.
    pub fn bucket_end(&self) -> DateTime<Utc> {
        self.resolution.bucket_end(self.bucket_start)
    }
}

impl Display for SeriesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.series,
            self.resolution,
            self.bucket_start.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }
}

/// The change one committed finer entry contributes to a coarser aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateDelta {
    values: BTreeMap<String, f64>,
}

impl AggregateDelta {
    pub fn from_measurements(measurements: &[Measurement]) -> Self {
        Self {
            values: measurements
                .iter()
                .map(|m| (m.id.clone(), m.value))
                .collect(),
        }
    }

    pub fn values(&self) -> &BTreeMap<String, f64> {
        &self.values
    }
}

/// Running sum per measurement id and number of contributing finer entries for a window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateValue {
    pub sums: BTreeMap<String, f64>,
    pub count: u64,
}

impl AggregateValue {
    /// Fold one contribution into the aggregate.
    pub fn apply(&mut self, delta: &AggregateDelta) {
        for (id, value) in delta.values() {
            *self.sums.entry(id.clone()).or_insert(0.0) += value;
        }
        self.count += 1;
    }

    pub fn sum_of(&self, id: &str) -> Option<f64> {
        self.sums.get(id).copied()
    }
}

/// The two namespaces of the keyspace. A leaf point and an aggregate may share a [`SeriesKey`]
/// when a client submits directly at a resolution that also receives rollups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Point,
    Aggregate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Payload {
    Point(TimeSeriesPoint),
    Aggregate(AggregateValue),
}

impl Payload {
    pub fn kind(&self) -> EntryKind {
        match self {
            Self::Point(_) => EntryKind::Point,
            Self::Aggregate(_) => EntryKind::Aggregate,
        }
    }
}

/// An entry as held by a backend.
///
/// Leaf points are created at version 1 and never change. Aggregates are created at version 1
/// by their first increment and gain one version per increment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub key: SeriesKey,
    pub payload: Payload,
    pub version: u64,
}

impl StoredEntry {
    pub fn as_point(&self) -> Option<&TimeSeriesPoint> {
        match &self.payload {
            Payload::Point(p) => Some(p),
            Payload::Aggregate(_) => None,
        }
    }

    pub fn as_aggregate(&self) -> Option<&AggregateValue> {
        match &self.payload {
            Payload::Aggregate(a) => Some(a),
            Payload::Point(_) => None,
        }
    }
}
