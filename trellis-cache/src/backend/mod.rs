//! Database collaborators.
//!
//! The cache never talks SQL directly. It needs a durable table with one
//! timestamp per cache name, optionally a publish/subscribe channel, and the
//! list of activated modules. These traits are that contract; the framework's
//! database layer implements them.

use std::sync::Arc;
use std::time::Duration;

use trellis_core::{Timestamp, TrellisResult};

pub mod memory;
#[cfg(feature = "postgres")]
pub mod pg;

pub use memory::{InMemoryChannel, InMemoryDatabase, InMemoryTable, PUBLISHED_HISTORY};
#[cfg(feature = "postgres")]
pub use pg::{PgConfig, PostgresChannel, PostgresDatabase, PostgresTable};

/// Name of the durable invalidation table.
pub const INVALIDATION_TABLE: &str = "cache_invalidation";

/// One row of the invalidation table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationRecord {
    pub name: String,
    pub timestamp: Timestamp,
}

/// A database the cache keeps coherent.
pub trait Database: Send + Sync {
    /// Database name, the key of every per-database store.
    fn name(&self) -> &str;

    /// The durable invalidation table.
    fn table(&self) -> &dyn InvalidationTable;

    /// The publish/subscribe channel, when the database has one.
    fn channel(&self) -> Option<Arc<dyn NotificationChannel>>;

    fn has_channel(&self) -> bool {
        self.channel().is_some()
    }

    /// Names of the activated modules.
    fn active_modules(&self) -> TrellisResult<Vec<String>>;
}

/// Durable table holding the last invalidation timestamp of every cache name.
///
/// Writers stamp rows with the database's current time and return the
/// timestamp stored afterwards.
pub trait InvalidationTable: Send + Sync {
    /// Whether [`InvalidationTable::upsert`] is available.
    fn supports_upsert(&self) -> bool;

    /// Insert or update atomically. The stored timestamp never moves back.
    fn upsert(&self, name: &str) -> TrellisResult<Timestamp>;

    fn select(&self, name: &str) -> TrellisResult<Option<Timestamp>>;

    fn insert(&self, name: &str) -> TrellisResult<Timestamp>;

    fn update(&self, name: &str) -> TrellisResult<Timestamp>;

    fn select_all(&self) -> TrellisResult<Vec<InvalidationRecord>>;
}

/// Publish/subscribe channel shared by every process using a database.
pub trait NotificationChannel: Send + Sync {
    /// Deliver `payload` to every current subscriber.
    fn publish(&self, payload: &str) -> TrellisResult<()>;

    /// Open a new subscription.
    fn listen(&self) -> TrellisResult<Box<dyn ChannelListener>>;
}

/// An open subscription.
pub trait ChannelListener: Send {
    /// Block until at least one payload arrives or `timeout` elapses.
    ///
    /// Returns every payload received, oldest first; an empty vector means
    /// the wait timed out.
    fn wait(&mut self, timeout: Duration) -> TrellisResult<Vec<String>>;
}

/// The framework's registry of model classes.
pub trait ModuleRegistry: Send + Sync {
    /// Reload class registrations of `database` for the activated `modules`.
    fn refresh(&self, database: &str, modules: &[String]);
}

/// Record an invalidation of `name`, returning the stored timestamp.
///
/// Uses the native upsert when the table has one, otherwise reads then
/// inserts or updates. Two writers racing on the fallback path may lose one
/// update; readers only compare timestamps with `>` so the newer write wins.
pub fn record_invalidation(table: &dyn InvalidationTable, name: &str) -> TrellisResult<Timestamp> {
    if table.supports_upsert() {
        return table.upsert(name);
    }
    match table.select(name)? {
        Some(_) => table.update(name),
        None => table.insert(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    #[test]
    fn test_record_invalidation_with_upsert() {
        let clock = Arc::new(ManualClock::new());
        let db = InMemoryDatabase::with_clock("erp", clock.clone());

        let first = record_invalidation(db.table(), "ir.rule").unwrap();
        clock.advance(Duration::from_secs(1));
        let second = record_invalidation(db.table(), "ir.rule").unwrap();

        assert!(second > first);
        assert_eq!(db.table().select("ir.rule").unwrap(), Some(second));
    }

    #[test]
    fn test_record_invalidation_without_upsert() {
        let clock = Arc::new(ManualClock::new());
        let db = InMemoryDatabase::with_clock("erp", clock.clone()).without_upsert();
        assert!(!db.table().supports_upsert());

        let first = record_invalidation(db.table(), "ir.rule").unwrap();
        clock.advance(Duration::from_secs(1));
        let second = record_invalidation(db.table(), "ir.rule").unwrap();

        assert!(second > first);
        assert_eq!(db.table().select_all().unwrap().len(), 1);
    }
}
