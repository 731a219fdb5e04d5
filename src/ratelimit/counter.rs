//! Fixed-window counter records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::policy::{Scope, ScopeKey};

/// How a new window's start instant is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowAlignment {
    /// The window opens at the first hit after the previous one expired.
    #[default]
    FirstHit,
    /// Windows open on multiples of the window length since the Unix epoch.
    Epoch,
}

impl WindowAlignment {
    /// Start of the window that a hit at `now` opens.
    pub fn window_start(&self, now: DateTime<Utc>, window_ms: u32) -> DateTime<Utc> {
        match self {
            WindowAlignment::FirstHit => now,
            WindowAlignment::Epoch => {
                let window = window_ms as i64;
                let floored = now.timestamp_millis().div_euclid(window) * window;
                DateTime::from_timestamp_millis(floored).unwrap_or(now)
            }
        }
    }
}

/// Identifies one counter: a scope key under one window length.
///
/// The window length is part of the identity so that two policies of the
/// same scope with different windows never share a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub scope_key: ScopeKey,
    pub window_ms: u32,
}

impl CounterKey {
    pub fn new(scope_key: ScopeKey, window_ms: u32) -> Self {
        Self {
            scope_key,
            window_ms,
        }
    }

    pub fn scope(&self) -> Scope {
        self.scope_key.scope()
    }
}

impl std::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}ms", self.scope_key, self.window_ms)
    }
}

/// Result of an increment or a peek: the counter state after the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    pub count: u32,
    pub window_start: DateTime<Utc>,
    pub window_ms: u32,
}

impl WindowSnapshot {
    /// Instant at which this window closes.
    pub fn reset_at(&self) -> DateTime<Utc> {
        self.window_start + chrono::Duration::milliseconds(self.window_ms as i64)
    }
}

/// Mutable counter state owned by a counter store.
#[derive(Debug, Clone)]
pub struct WindowCounter {
    window_start: DateTime<Utc>,
    window_ms: u32,
    count: u32,
}

impl WindowCounter {
    /// A counter that has already seen its first hit.
    pub fn open(now: DateTime<Utc>, window_ms: u32, alignment: WindowAlignment) -> Self {
        Self {
            window_start: alignment.window_start(now, window_ms),
            window_ms,
            count: 1,
        }
    }

    pub fn reset_at(&self) -> DateTime<Utc> {
        self.snapshot().reset_at()
    }

    /// Whether the window has elapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.reset_at()
    }

    /// Whether the window expired more than one full window ago.
    ///
    /// Only such counters may be reclaimed; an active or just-expired
    /// window is always kept.
    pub fn is_reclaimable(&self, now: DateTime<Utc>) -> bool {
        let grace = chrono::Duration::milliseconds(self.window_ms as i64);
        now > self.reset_at() + grace
    }

    /// Record one hit, opening a new window first if the current one expired.
    ///
    /// Callers must hold exclusive access to the counter for the duration of
    /// the call; the store guarantees this with its per-key entry lock.
    pub fn hit(&mut self, now: DateTime<Utc>, alignment: WindowAlignment) -> WindowSnapshot {
        if self.is_expired(now) {
            *self = Self::open(now, self.window_ms, alignment);
        } else {
            self.count = self.count.saturating_add(1);
        }
        self.snapshot()
    }

    pub fn snapshot(&self) -> WindowSnapshot {
        WindowSnapshot {
            count: self.count,
            window_start: self.window_start,
            window_ms: self.window_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    #[test]
    fn test_counter_opens_with_one_hit() {
        let counter = WindowCounter::open(at(1_000), 500, WindowAlignment::FirstHit);
        let snap = counter.snapshot();

        assert_eq!(snap.count, 1);
        assert_eq!(snap.window_start, at(1_000));
        assert_eq!(snap.reset_at(), at(1_500));
    }

    #[test]
    fn test_counter_increments_within_window() {
        let mut counter = WindowCounter::open(at(0), 1_000, WindowAlignment::FirstHit);

        counter.hit(at(10), WindowAlignment::FirstHit);
        let snap = counter.hit(at(999), WindowAlignment::FirstHit);

        assert_eq!(snap.count, 3);
        assert_eq!(snap.window_start, at(0));
    }

    #[test]
    fn test_counter_resets_at_window_boundary() {
        let mut counter = WindowCounter::open(at(0), 1_000, WindowAlignment::FirstHit);
        counter.hit(at(500), WindowAlignment::FirstHit);

        // now == window_start + window_ms starts a new window
        let snap = counter.hit(at(1_000), WindowAlignment::FirstHit);
        assert_eq!(snap.count, 1);
        assert_eq!(snap.window_start, at(1_000));
    }

    #[test]
    fn test_epoch_alignment_floors_window_start() {
        let counter = WindowCounter::open(at(61_234), 60_000, WindowAlignment::Epoch);
        assert_eq!(counter.snapshot().window_start, at(60_000));
        assert_eq!(counter.reset_at(), at(120_000));
    }

    #[test]
    fn test_reclaimable_only_after_a_full_extra_window() {
        let counter = WindowCounter::open(at(0), 1_000, WindowAlignment::FirstHit);

        assert!(!counter.is_reclaimable(at(999)));
        assert!(!counter.is_reclaimable(at(1_500)));
        assert!(!counter.is_reclaimable(at(2_000)));
        assert!(counter.is_reclaimable(at(2_001)));
    }

    #[test]
    fn test_counter_key_display() {
        let key = CounterKey::new(ScopeKey::User("u1".into()), 900_000);
        assert_eq!(key.to_string(), "user:u1|900000ms");
        assert_eq!(key.scope(), Scope::User);
    }
}
