//! Invalidation coordinator.
//!
//! Commit records every name a transaction cleared in the invalidation table,
//! clears the local stores and broadcasts the names on the notification
//! channel. Other processes learn about it either from a channel listener or
//! by polling the table from `sync`. Delivery failures are logged and never
//! reach the business transaction: at worst peers serve stale values until
//! their next poll.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use trellis_core::CacheBackendKind;

use crate::backend::{record_invalidation, Database};
use crate::listener::{self, ListenerSet};
use crate::message::{invalidation_batches, Payload};
use crate::registry::CacheRegistry;
use crate::transaction::Transaction;

/// Cache implementation selected once per process.
///
/// Every hook is infallible: failures are logged and degrade to staleness
/// bounded by the poll interval.
pub trait CacheBackend: Send + Sync {
    fn kind(&self) -> CacheBackendKind;

    /// Whether caches keep values at all.
    fn stores_values(&self) -> bool {
        true
    }

    /// Bring local stores up to date with other processes.
    fn sync(&self, registry: &CacheRegistry, transaction: &Transaction);

    /// Persist and broadcast the names cleared by `transaction`.
    fn commit(&self, registry: &CacheRegistry, transaction: &Transaction);

    /// Forget the names cleared by `transaction`.
    fn rollback(&self, registry: &CacheRegistry, transaction: &Transaction);

    /// Stop listening to `database` and forget its local state.
    fn drop_database(&self, registry: &CacheRegistry, database: &str);

    /// Tell peers to reload their class registry.
    fn refresh_pool(&self, registry: &CacheRegistry, transaction: &Transaction) {
        publish_refresh_pool(registry, transaction);
    }

    fn is_listening(&self, _database: &str) -> bool {
        false
    }

    /// Stop every background worker.
    fn shutdown(&self) {}
}

// ============================================================================
// MEMORY BACKEND
// ============================================================================

/// Per-process memory stores kept coherent through the invalidation table
/// and the notification channel.
pub struct MemoryBackend {
    listeners: Arc<ListenerSet>,
    last_poll: Mutex<HashMap<String, Instant>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(ListenerSet::default()),
            last_poll: Mutex::new(HashMap::new()),
        }
    }

    /// Read the invalidation table and reset every store whose stored
    /// timestamp is newer than the one applied, at most once per
    /// `clean_timeout` per database.
    fn poll(&self, registry: &CacheRegistry, database: &dyn Database) {
        let dbname = database.name();
        let now = registry.clock().monotonic();
        let interval = registry.settings().clean_timeout;
        if let Some(last) = self.last_poll.lock().get(dbname) {
            if now.saturating_duration_since(*last) < interval {
                return;
            }
        }

        let records = match database.table().select_all() {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(
                    database = %dbname,
                    error = %e,
                    "Failed to poll cache invalidations"
                );
                return;
            }
        };

        let mut cleared = 0usize;
        for record in records {
            // rows of caches this process never created are skipped
            let Some(handle) = registry.handle(&record.name) else {
                continue;
            };
            if handle.reset_if_newer(dbname, record.timestamp) {
                cleared += 1;
            }
        }
        registry.modules().refresh(database, false);
        self.last_poll.lock().insert(dbname.to_string(), now);
        tracing::debug!(database = %dbname, cleared, "Polled cache invalidations");
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheBackend for MemoryBackend {
    fn kind(&self) -> CacheBackendKind {
        CacheBackendKind::Memory
    }

    fn sync(&self, registry: &CacheRegistry, transaction: &Transaction) {
        let database = transaction.database();
        if registry.settings().uses_listener() && database.has_channel() {
            match listener::start(&self.listeners, registry, database) {
                Ok(()) => return,
                Err(e) => tracing::warn!(
                    database = %database.name(),
                    error = %e,
                    "Cannot listen for cache invalidations, polling instead"
                ),
            }
        }
        self.poll(registry, database.as_ref());
    }

    fn commit(&self, registry: &CacheRegistry, transaction: &Transaction) {
        let names = transaction.take_pending();
        transaction.drop_overlays();
        if names.is_empty() {
            return;
        }

        let database = transaction.database();
        let dbname = database.name();
        for name in &names {
            let timestamp = match record_invalidation(database.table(), name) {
                Ok(timestamp) => Some(timestamp),
                Err(e) => {
                    tracing::warn!(
                        database = %dbname,
                        cache = %name,
                        error = %e,
                        "Failed to record cache invalidation"
                    );
                    None
                }
            };
            if let Some(handle) = registry.handle(name) {
                handle.reset(dbname, timestamp);
            }
        }

        if let Some(channel) = database.channel() {
            for payload in invalidation_batches(&names, registry.settings().notify_batch_size) {
                if let Err(e) = channel.publish(&payload) {
                    tracing::warn!(
                        database = %dbname,
                        error = %e,
                        "Failed to broadcast cache invalidation"
                    );
                    break;
                }
            }
        }
        tracing::info!(database = %dbname, caches = ?names, "Cache invalidations committed");
    }

    fn rollback(&self, _registry: &CacheRegistry, transaction: &Transaction) {
        let names = transaction.take_pending();
        transaction.drop_overlays();
        if !names.is_empty() {
            tracing::debug!(
                database = %transaction.database_name(),
                caches = ?names,
                "Cache invalidations discarded"
            );
        }
    }

    fn drop_database(&self, registry: &CacheRegistry, database: &str) {
        self.listeners.stop(database);
        self.last_poll.lock().remove(database);
        registry.modules().forget(database);
        for handle in registry.handles() {
            handle.forget_database(database);
        }
        tracing::info!(database = %database, "Cache state dropped");
    }

    fn is_listening(&self, database: &str) -> bool {
        self.listeners.is_active(database)
    }

    fn shutdown(&self) {
        self.listeners.stop_all();
    }
}

// ============================================================================
// DISABLED BACKEND
// ============================================================================

/// Backend that never stores anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledBackend;

impl CacheBackend for DisabledBackend {
    fn kind(&self) -> CacheBackendKind {
        CacheBackendKind::Disabled
    }

    fn stores_values(&self) -> bool {
        false
    }

    fn sync(&self, _registry: &CacheRegistry, _transaction: &Transaction) {}

    fn commit(&self, _registry: &CacheRegistry, transaction: &Transaction) {
        transaction.take_pending();
        transaction.drop_overlays();
    }

    fn rollback(&self, _registry: &CacheRegistry, transaction: &Transaction) {
        transaction.take_pending();
        transaction.drop_overlays();
    }

    fn drop_database(&self, _registry: &CacheRegistry, _database: &str) {}
}

/// Publish `refresh pool <process id>` on the transaction's channel.
/// Without a channel peers notice module changes when they poll.
fn publish_refresh_pool(registry: &CacheRegistry, transaction: &Transaction) {
    let Some(channel) = transaction.database().channel() else {
        return;
    };
    let payload = Payload::RefreshPool {
        process_id: Some(registry.process_id().to_string()),
    };
    if let Err(e) = channel.publish(&payload.encode()) {
        tracing::warn!(
            database = %transaction.database_name(),
            error = %e,
            "Failed to broadcast registry refresh"
        );
    }
}
