//! Trellis Cache - Transaction-Scoped Coherent Cache
//!
//! Named, bounded, per-database caches shared by the transactions of one
//! process and kept coherent across processes. A transaction that clears a
//! cache works on a private overlay until it commits; the commit stamps the
//! name in the database's invalidation table and notifies the other
//! processes, which drop their copy on their next sync or as soon as their
//! channel listener hears about it.
//!
//! The database itself is reached through the traits in [`backend`]; an
//! in-memory implementation is provided for tests and single-process use,
//! and a PostgreSQL one behind the `postgres` feature.

pub mod backend;
pub mod clock;
pub mod coordinator;
pub mod freeze;
pub mod instance;
mod listener;
pub mod lru;
pub mod message;
mod modules;
pub mod registry;
pub mod stats;
pub mod transaction;
pub mod watermark;

pub use backend::{
    record_invalidation, ChannelListener, Database, InMemoryChannel, InMemoryDatabase,
    InMemoryTable, InvalidationRecord, InvalidationTable, ModuleRegistry, NotificationChannel,
    INVALIDATION_TABLE, PUBLISHED_HISTORY,
};
#[cfg(feature = "postgres")]
pub use backend::{PgConfig, PostgresChannel, PostgresDatabase, PostgresTable};
pub use clock::{Clock, ManualClock, SystemClock};
pub use coordinator::{CacheBackend, DisabledBackend, MemoryBackend};
pub use freeze::{freeze, freeze_context, try_freeze, unfreeze, CacheKey, FrozenKey, Unordered};
pub use instance::{Cache, CacheOptions};
pub use lru::{LruStore, TransactionLruStore};
pub use message::{invalidation_batches, Payload, PayloadError};
pub use registry::CacheRegistry;
pub use stats::CacheStats;
pub use transaction::{Generation, Transaction};
pub use watermark::Watermark;

// Re-export core types used in the public API
pub use trellis_core::{
    BackendError, CacheBackendKind, CacheSettings, ConfigError, Context, Timestamp, TrellisError,
    TrellisResult, UserId,
};
