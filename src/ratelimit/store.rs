//! Window counter stores.
//!
//! A store owns every [`WindowCounter`] and is the single serialization point
//! of the engine. Implementations must make check-expire-or-increment one
//! atomic step per key.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::fmt::Debug;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::counter::{CounterKey, WindowAlignment, WindowCounter, WindowSnapshot};
use super::policy::ScopeKey;

/// Failures reported by a counter store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store could not be reached
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    /// The store call did not complete within the configured bound
    #[error("counter store timed out after {0:?}")]
    Timeout(Duration),

    /// The store returned state that cannot be interpreted
    #[error("counter store corrupted: {0}")]
    Corrupted(String),
}

impl StoreError {
    /// Whether the engine's fail mode decides the outcome of this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }
}

/// Shared counter storage used by the admission engine.
#[async_trait]
pub trait CounterStore: Send + Sync + Debug {
    /// Record one hit for `key` at `now` and return the post-increment state.
    ///
    /// A missing or expired counter is replaced by a fresh window with a
    /// count of 1.
    async fn increment(
        &self,
        key: &CounterKey,
        now: DateTime<Utc>,
    ) -> Result<WindowSnapshot, StoreError>;

    /// Read the active window for `key` without recording a hit.
    async fn peek(
        &self,
        key: &CounterKey,
        now: DateTime<Utc>,
    ) -> Result<Option<WindowSnapshot>, StoreError>;

    /// Remove every counter of `scope_key`, whatever its window length.
    async fn reset(&self, scope_key: &ScopeKey) -> Result<usize, StoreError>;

    /// Remove counters whose window expired more than one window ago.
    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Number of counter records currently held.
    fn counter_count(&self) -> usize;
}

/// In-process counter store backed by a sharded concurrent map.
///
/// Each key's update runs under the lock of the shard holding it, so hits
/// on unrelated keys proceed independently.
#[derive(Debug, Default)]
pub struct MemoryStore {
    counters: DashMap<CounterKey, WindowCounter>,
    alignment: WindowAlignment,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_alignment(alignment: WindowAlignment) -> Self {
        Self {
            counters: DashMap::new(),
            alignment,
        }
    }

    /// Drop every counter.
    pub fn clear(&self) {
        self.counters.clear();
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(
        &self,
        key: &CounterKey,
        now: DateTime<Utc>,
    ) -> Result<WindowSnapshot, StoreError> {
        let alignment = self.alignment;
        let snapshot = match self.counters.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                entry.get_mut().hit(now, alignment)
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                debug!(key = %key, "Opening new rate limit window");
                entry
                    .insert(WindowCounter::open(now, key.window_ms, alignment))
                    .snapshot()
            }
        };
        Ok(snapshot)
    }

    async fn peek(
        &self,
        key: &CounterKey,
        now: DateTime<Utc>,
    ) -> Result<Option<WindowSnapshot>, StoreError> {
        Ok(self
            .counters
            .get(key)
            .filter(|counter| !counter.is_expired(now))
            .map(|counter| counter.snapshot()))
    }

    async fn reset(&self, scope_key: &ScopeKey) -> Result<usize, StoreError> {
        let keys: Vec<CounterKey> = self
            .counters
            .iter()
            .filter(|entry| &entry.key().scope_key == scope_key)
            .map(|entry| entry.key().clone())
            .collect();

        let removed = keys
            .iter()
            .filter(|key| self.counters.remove(*key).is_some())
            .count();
        debug!(scope_key = %scope_key, removed, "Reset rate limit counters");
        Ok(removed)
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let candidates: Vec<CounterKey> = self
            .counters
            .iter()
            .filter(|entry| entry.value().is_reclaimable(now))
            .map(|entry| entry.key().clone())
            .collect();

        // Recheck under the key's lock: a hit may have opened a new window
        // since the scan.
        let removed = candidates
            .iter()
            .filter(|key| {
                self.counters
                    .remove_if(*key, |_, counter| counter.is_reclaimable(now))
                    .is_some()
            })
            .count();
        Ok(removed)
    }

    fn counter_count(&self) -> usize {
        self.counters.len()
    }
}
