//! Invalidation watermarks.
//!
//! Every (cache, database) pair remembers the newest invalidation timestamp
//! it applied and the monotonic instant of its last local clear. Timestamps
//! only ever move forward, so late or duplicated notifications are harmless.

use std::time::Instant;

use trellis_core::Timestamp;

/// Invalidation state of one cache for one database.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Watermark {
    timestamp: Option<Timestamp>,
    lower_bound: Option<Instant>,
}

impl Watermark {
    /// A watermark that has seen nothing yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Newest invalidation timestamp applied.
    pub fn timestamp(&self) -> Option<Timestamp> {
        self.timestamp
    }

    /// Instant of the last local clear.
    pub fn lower_bound(&self) -> Option<Instant> {
        self.lower_bound
    }

    /// Whether a stored invalidation timestamp is newer than what was applied.
    pub fn is_newer(&self, timestamp: Timestamp) -> bool {
        match self.timestamp {
            Some(known) => timestamp > known,
            None => true,
        }
    }

    /// Whether a transaction that started at `started_at` may have read data
    /// older than the last local clear.
    pub fn is_stale(&self, started_at: Instant) -> bool {
        self.lower_bound
            .map(|lower| started_at < lower)
            .unwrap_or(false)
    }

    /// Record a local clear at `now`, optionally carrying the invalidation
    /// timestamp that caused it. Both readings keep their maximum.
    pub fn advance(&mut self, timestamp: Option<Timestamp>, now: Instant) {
        self.lower_bound = Some(self.lower_bound.map_or(now, |lower| lower.max(now)));
        if let Some(timestamp) = timestamp {
            self.timestamp = Some(self.timestamp.map_or(timestamp, |known| known.max(timestamp)));
        }
    }
}
