//! Time resolutions and their bucketing functions.

use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, Datelike, Months, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A granularity level of the store.
///
/// Resolutions are totally ordered from finest to coarsest, so `Resolution::Minute <
/// Resolution::Year`. Each one truncates a timestamp to the start of its bucket, and every bucket
/// of a resolution is contained in exactly one bucket of each coarser resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Minute,
    Hour,
    Day,
    Month,
    Year,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unrecognized resolution: {0}")]
pub struct ParseResolutionError(String);

impl Resolution {
    /// Every resolution, finest first.
    pub const ALL: [Self; 5] = [Self::Minute, Self::Hour, Self::Day, Self::Month, Self::Year];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Month => "month",
            Self::Year => "year",
        }
    }

    /// Truncate `t` to the start of the bucket of this resolution that contains it.
    pub fn truncate(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let (year, month, day, hour, minute) = match self {
            Self::Minute => (t.year(), t.month(), t.day(), t.hour(), t.minute()),
            Self::Hour => (t.year(), t.month(), t.day(), t.hour(), 0),
            Self::Day => (t.year(), t.month(), t.day(), 0, 0),
            Self::Month => (t.year(), t.month(), 1, 0, 0),
            Self::Year => (t.year(), 1, 1, 0, 0),
        };
        Utc.with_ymd_and_hms(year, month, day, hour, minute, 0)
            .single()
            .expect("components taken from a valid UTC instant form a valid UTC instant")
    }

    /// The exclusive end of the bucket starting at `bucket_start`.
    ///
    /// `bucket_start` is expected to already be truncated to this resolution.
    pub fn bucket_end(&self, bucket_start: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Minute => bucket_start + chrono::Duration::minutes(1),
            Self::Hour => bucket_start + chrono::Duration::hours(1),
            Self::Day => bucket_start + chrono::Duration::days(1),
            Self::Month => bucket_start
                .checked_add_months(Months::new(1))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            Self::Year => bucket_start
                .checked_add_months(Months::new(12))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// All resolutions strictly coarser than this one, finest first.
    pub fn coarser(self) -> impl Iterator<Item = Self> {
        Self::ALL.into_iter().filter(move |r| *r > self)
    }
}

impl Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = ParseResolutionError;

    /// Accepts the singular name as well as the plural form used in request paths, e.g. both
    /// `minute` and `minutes`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let r = match s {
            "minute" | "minutes" => Self::Minute,
            "hour" | "hours" => Self::Hour,
            "day" | "days" => Self::Day,
            "month" | "months" => Self::Month,
            "year" | "years" => Self::Year,
            _ => return Err(ParseResolutionError(s.to_string())),
        };
        Ok(r)
    }
}
