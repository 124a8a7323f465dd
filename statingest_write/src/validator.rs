//! Validation and normalization of submitted points.
//!
//! Everything in here is a pure function of its input: no I/O, no shared state, and the same
//! input always yields the same result.

use chrono::{DateTime, TimeZone, Utc};
use hashbrown::HashSet;
use serde::Deserialize;
use statingest_types::{Measurement, TimeSeriesPoint};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("point is missing a timestamp")]
    MissingTimestamp,

    #[error("invalid timestamp {value}: {reason}")]
    InvalidTimestamp { value: String, reason: String },

    #[error("point has no measurements")]
    EmptyMeasurements,

    #[error("measurement id '{0}' occurs more than once")]
    DuplicateMeasurementId(String),

    #[error("measurement '{id}' has a non-finite value")]
    InvalidValue { id: String },
}

/// A point as submitted, before any validation.
///
/// The timestamp is either an RFC 3339 string carrying an offset, or a number of (possibly
/// fractional) seconds since the Unix epoch.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawPoint {
    #[serde(default)]
    pub timestamp: Option<serde_json::Value>,
    #[serde(default)]
    pub measurements: Option<Vec<RawMeasurement>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawMeasurement {
    pub id: String,
    pub value: f64,
}

/// Parse a JSON request body and [`normalize`] it.
pub fn normalize_json(body: &[u8]) -> Result<TimeSeriesPoint, ValidationError> {
    let raw: RawPoint = serde_json::from_slice(body)
        .map_err(|e| ValidationError::MalformedInput(e.to_string()))?;
    normalize(raw)
}

/// Validate a raw point and convert its timestamp to UTC.
///
/// Measurement order is preserved.
pub fn normalize(raw: RawPoint) -> Result<TimeSeriesPoint, ValidationError> {
    let timestamp = match raw.timestamp {
        None | Some(serde_json::Value::Null) => return Err(ValidationError::MissingTimestamp),
        Some(value) => parse_timestamp(&value)?,
    };

    let raw_measurements = raw.measurements.unwrap_or_default();
    if raw_measurements.is_empty() {
        return Err(ValidationError::EmptyMeasurements);
    }

    let mut seen = HashSet::with_capacity(raw_measurements.len());
    let mut measurements = Vec::with_capacity(raw_measurements.len());
    for m in raw_measurements {
        if m.id.is_empty() {
            return Err(ValidationError::MalformedInput(
                "measurement id must not be empty".to_string(),
            ));
        }
        if !seen.insert(m.id.clone()) {
            return Err(ValidationError::DuplicateMeasurementId(m.id));
        }
        if !m.value.is_finite() {
            return Err(ValidationError::InvalidValue { id: m.id });
        }
        measurements.push(Measurement::new(m.id, m.value));
    }

    Ok(TimeSeriesPoint::new(timestamp, measurements))
}

fn parse_timestamp(value: &serde_json::Value) -> Result<DateTime<Utc>, ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidTimestamp {
        value: value.to_string(),
        reason: reason.to_string(),
    };

    match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| invalid(&e.to_string())),
        serde_json::Value::Number(n) => {
            let secs = n
                .as_f64()
                .filter(|s| s.is_finite())
                .ok_or_else(|| invalid("not a finite number of seconds"))?;
            let whole = secs.floor();
            let nanos = (((secs - whole) * 1e9).round() as u32).min(999_999_999);
            if whole < i64::MIN as f64 || whole > i64::MAX as f64 {
                return Err(invalid("out of range"));
            }
            Utc.timestamp_opt(whole as i64, nanos)
                .single()
                .ok_or_else(|| invalid("out of range"))
        }
        _ => Err(invalid("expected an RFC 3339 string or epoch seconds")),
    }
}
