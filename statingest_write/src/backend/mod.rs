//! The narrow key/value contract the write path depends on, and the backends that ship with it.
//!
//! Leaf points and aggregates live in separate namespaces ([`EntryKind`]), so a [`SeriesKey`]
//! identifies at most one entry of each kind.

mod mem;
mod serialized;

pub use mem::MemBackend;
pub use serialized::SerializedIncrement;

use std::fmt::Debug;

use async_trait::async_trait;
use statingest_types::{AggregateDelta, EntryKind, SeriesKey, StoredEntry, TimeSeriesPoint};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("entry {key} holds a {found:?} payload where {expected:?} was expected")]
    UnexpectedKind {
        key: SeriesKey,
        expected: EntryKind,
        found: EntryKind,
    },
}

pub type Result<T, E = BackendError> = std::result::Result<T, E>;

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq)]
pub enum PutOutcome {
    /// The key was absent and now holds the submitted point.
    Created(StoredEntry),

    /// The key was already present; the existing entry is returned untouched.
    AlreadyExists(StoredEntry),
}

/// A store that holds leaf points and aggregates.
///
/// Every method is a single round trip. Implementations must make `put_if_absent` and
/// `atomic_increment` atomic with respect to concurrent calls on the same key.
///
/// The ingest deadline is only checked between retries; a call in flight is never cancelled.
/// Implementations must bound their own round trips (e.g. a client request timeout), since a call
/// that never returns keeps its key locked and later writes to that key are rejected as busy.
#[async_trait]
pub trait Backend: Debug + Send + Sync + 'static {
    /// Store `point` as the leaf entry for `key` unless one already exists.
    async fn put_if_absent(&self, key: &SeriesKey, point: &TimeSeriesPoint) -> Result<PutOutcome>;

    async fn get_exact(&self, kind: EntryKind, key: &SeriesKey) -> Result<Option<StoredEntry>>;

    /// Add `delta` to the aggregate at `key`, creating it if needed, and return the new entry.
    async fn atomic_increment(&self, key: &SeriesKey, delta: &AggregateDelta)
    -> Result<StoredEntry>;
}

/// A plain key/value store without a native increment.
///
/// Wrap it in [`SerializedIncrement`] to get a [`Backend`].
#[async_trait]
pub trait KeyValueStore: Debug + Send + Sync + 'static {
    /// Insert `entry` unless an entry of the same kind exists at its key, in which case the
    /// existing entry is returned and nothing is written.
    async fn insert_if_absent(&self, entry: StoredEntry) -> Result<Option<StoredEntry>>;

    async fn get(&self, kind: EntryKind, key: &SeriesKey) -> Result<Option<StoredEntry>>;

    /// Unconditionally write `entry`.
    async fn put(&self, entry: StoredEntry) -> Result<()>;
}

fn expect_kind(entry: &StoredEntry, expected: EntryKind) -> Result<()> {
    let found = entry.payload.kind();
    if found == expected {
        Ok(())
    } else {
        Err(BackendError::UnexpectedKind {
            key: entry.key.clone(),
            expected,
            found,
        })
    }
}
