//! Named caches.
//!
//! A [`Cache`] is created once per process under a unique name and shared by
//! every thread. Reads and writes go to the shared store of the
//! transaction's database unless the transaction cleared the cache itself or
//! started before the last local invalidation; then they go to an overlay
//! owned by the transaction.

use std::collections::HashSet;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use trellis_core::{ConfigError, Timestamp, TrellisResult, DEFAULT_CONTEXT_IGNORED_KEYS};

use crate::clock::Clock;
use crate::freeze::{freeze_context, try_freeze, CacheKey};
use crate::lru::LruStore;
use crate::registry::CacheRegistry;
use crate::stats::{CacheStats, HitCounter};
use crate::transaction::Transaction;
use crate::watermark::Watermark;

// ============================================================================
// OPTIONS
// ============================================================================

/// Construction options of a [`Cache`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOptions {
    /// Process-unique name, also the key of the invalidation table.
    pub name: String,
    /// Time to live of entries; `None` keeps them until evicted or cleared.
    pub duration: Option<Duration>,
    /// Whether the user and request context are part of key identity.
    pub context: bool,
    /// Context keys to leave out of key identity, on top of the defaults.
    pub context_ignored_keys: Option<Vec<String>>,
}

impl CacheOptions {
    /// Context-sensitive cache without expiry.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            duration: None,
            context: true,
            context_ignored_keys: None,
        }
    }

    /// Expire entries `duration` after they are set.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Key entries on the key alone.
    pub fn without_context(mut self) -> Self {
        self.context = false;
        self
    }

    /// Leave more context keys out of key identity.
    pub fn with_ignored_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.context_ignored_keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    fn validate(&self) -> TrellisResult<()> {
        if self.name.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "name".to_string(),
            }
            .into());
        }
        if !self.context && self.context_ignored_keys.is_some() {
            return Err(ConfigError::IncompatibleOptions {
                option_a: "context = false".to_string(),
                option_b: "context_ignored_keys".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

// ============================================================================
// ENTRIES AND STORES
// ============================================================================

#[derive(Debug, Clone)]
pub(crate) struct CacheEntry<V> {
    value: V,
    expires_at: Option<Timestamp>,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

type EntryStore<V> = LruStore<CacheKey, CacheEntry<V>>;

/// Shared store and watermark of one cache for one database.
struct DatabaseSlot<V> {
    store: EntryStore<V>,
    watermark: Watermark,
}

// ============================================================================
// HANDLE
// ============================================================================

/// Type-erased view of a cache used by the registry and the coordinator.
pub(crate) trait CacheHandle: Send + Sync {
    fn name(&self) -> &str;

    /// Stage a clear in `transaction`.
    fn clear(&self, transaction: &Transaction);

    /// Empty the shared store of `database` and record the invalidation.
    fn reset(&self, database: &str, timestamp: Option<Timestamp>);

    /// [`CacheHandle::reset`] if `timestamp` is newer than the last one
    /// applied. Returns whether the store was reset.
    fn reset_if_newer(&self, database: &str, timestamp: Timestamp) -> bool;

    /// Drop every piece of state kept for `database`.
    fn forget_database(&self, database: &str);

    fn stats(&self) -> CacheStats;
}

struct CacheInner<V> {
    name: String,
    duration: Option<Duration>,
    context: bool,
    ignored_keys: HashSet<String>,
    capacity: NonZeroUsize,
    clock: Arc<dyn Clock>,
    enabled: bool,
    slots: DashMap<String, Arc<Mutex<DatabaseSlot<V>>>>,
    counter: HitCounter,
}

impl<V: Clone + Send + 'static> CacheInner<V> {
    fn slot(&self, database: &str) -> Arc<Mutex<DatabaseSlot<V>>> {
        if let Some(slot) = self.slots.get(database) {
            return Arc::clone(slot.value());
        }
        let capacity = self.capacity;
        Arc::clone(
            self.slots
                .entry(database.to_string())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(DatabaseSlot {
                        store: LruStore::with_capacity(capacity),
                        watermark: Watermark::new(),
                    }))
                })
                .value(),
        )
    }

    fn key<K: Serialize + ?Sized>(&self, transaction: &Transaction, key: &K) -> Option<CacheKey> {
        let key = try_freeze(key)?;
        if !self.context {
            return Some(CacheKey::Plain(key));
        }
        Some(CacheKey::Contextual {
            key,
            user: transaction.user(),
            context: freeze_context(transaction.context(), &self.ignored_keys),
        })
    }

    /// Run `f` on the store that serves `transaction`.
    fn with_store<R>(
        &self,
        transaction: &Transaction,
        f: impl FnOnce(&mut EntryStore<V>) -> R,
    ) -> Option<R> {
        if !transaction.is_pending(&self.name) {
            let slot = self.slot(transaction.database_name());
            let mut slot = slot.lock();
            if !slot.watermark.is_stale(transaction.started_at()) {
                return Some(f(&mut slot.store));
            }
        }
        let capacity = self.capacity;
        transaction.with_overlay(&self.name, || EntryStore::<V>::with_capacity(capacity), f)
    }

    fn get<K: Serialize + ?Sized>(&self, transaction: &Transaction, key: &K) -> Option<V> {
        if !self.enabled {
            self.counter.miss();
            return None;
        }
        let Some(key) = self.key(transaction, key) else {
            self.counter.miss();
            return None;
        };
        let now = self.clock.now();
        let found = self
            .with_store(transaction, |store| {
                let lookup = store
                    .get(&key)
                    .map(|entry| (!entry.is_expired(now)).then(|| entry.value.clone()));
                match lookup {
                    Some(Some(value)) => Some(value),
                    Some(None) => {
                        store.remove(&key);
                        None
                    }
                    None => None,
                }
            })
            .flatten();
        match found {
            Some(_) => self.counter.hit(),
            None => self.counter.miss(),
        }
        found
    }

    fn set<K: Serialize + ?Sized>(&self, transaction: &Transaction, key: &K, value: &V) {
        if !self.enabled {
            return;
        }
        let Some(key) = self.key(transaction, key) else {
            tracing::debug!(cache = %self.name, "Key cannot be frozen, value not cached");
            return;
        };
        let expires_at = self.duration.and_then(|duration| {
            let delta = chrono::Duration::from_std(duration).ok()?;
            self.clock.now().checked_add_signed(delta)
        });
        let entry = CacheEntry {
            value: value.clone(),
            expires_at,
        };
        self.with_store(transaction, |store| {
            store.set(key, entry);
        });
    }

    fn len(&self, database: &str) -> usize {
        self.slots
            .get(database)
            .map(|slot| slot.lock().store.len())
            .unwrap_or(0)
    }

    fn last_timestamp(&self, database: &str) -> Option<Timestamp> {
        self.slots
            .get(database)
            .and_then(|slot| slot.lock().watermark.timestamp())
    }
}

impl<V: Clone + Send + 'static> CacheHandle for CacheInner<V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn clear(&self, transaction: &Transaction) {
        transaction.mark_pending(&self.name);
        transaction.drop_overlay(&self.name);
    }

    fn reset(&self, database: &str, timestamp: Option<Timestamp>) {
        let slot = self.slot(database);
        let mut slot = slot.lock();
        slot.store.clear();
        slot.watermark.advance(timestamp, self.clock.monotonic());
    }

    fn reset_if_newer(&self, database: &str, timestamp: Timestamp) -> bool {
        let slot = self.slot(database);
        let mut slot = slot.lock();
        if !slot.watermark.is_newer(timestamp) {
            return false;
        }
        slot.store.clear();
        slot.watermark.advance(Some(timestamp), self.clock.monotonic());
        true
    }

    fn forget_database(&self, database: &str) {
        self.slots.remove(database);
    }

    fn stats(&self) -> CacheStats {
        self.counter.snapshot(&self.name)
    }
}

// ============================================================================
// CACHE
// ============================================================================

/// A named, transaction aware cache of `V` values.
///
/// Values are stored and returned by `Clone`: the caller never shares
/// mutable state with the stored copy. `V` must own its data.
pub struct Cache<V> {
    inner: Arc<CacheInner<V>>,
}

impl<V> Clone for Cache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> Cache<V> {
    /// Create and register a cache.
    ///
    /// Fails when the name is taken in `registry`, when its configured size
    /// limit is zero, or when ignored context keys are given for a cache
    /// that ignores the context.
    pub fn new(registry: &CacheRegistry, options: CacheOptions) -> TrellisResult<Self> {
        options.validate()?;
        let size_limit = registry.settings().size_limit(&options.name);
        let capacity = NonZeroUsize::new(size_limit).ok_or_else(|| ConfigError::InvalidValue {
            field: format!("size_limits.{}", options.name),
            value: size_limit.to_string(),
            reason: "size limits must be greater than 0".to_string(),
        })?;

        let mut ignored_keys: HashSet<String> = DEFAULT_CONTEXT_IGNORED_KEYS
            .iter()
            .map(|key| key.to_string())
            .collect();
        ignored_keys.extend(options.context_ignored_keys.unwrap_or_default());

        let inner = Arc::new(CacheInner {
            name: options.name,
            duration: options.duration,
            context: options.context,
            ignored_keys,
            capacity,
            clock: registry.clock(),
            enabled: registry.stores_values(),
            slots: DashMap::new(),
            counter: HitCounter::default(),
        });
        registry.register(Arc::clone(&inner) as Arc<dyn CacheHandle>)?;
        tracing::debug!(cache = %inner.name, capacity = %capacity, "Cache registered");
        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of entries a store of this cache holds.
    pub fn capacity(&self) -> usize {
        self.inner.capacity.get()
    }

    pub fn duration(&self) -> Option<Duration> {
        self.inner.duration
    }

    /// Look `key` up for `transaction`.
    ///
    /// Keys that cannot be frozen and expired entries are misses.
    pub fn get<K: Serialize + ?Sized>(&self, transaction: &Transaction, key: &K) -> Option<V> {
        self.inner.get(transaction, key)
    }

    /// Look `key` up, falling back to `default`.
    pub fn get_or<K: Serialize + ?Sized>(&self, transaction: &Transaction, key: &K, default: V) -> V {
        self.get(transaction, key).unwrap_or(default)
    }

    /// Store a copy of `value` under `key` and hand `value` back.
    pub fn set<K: Serialize + ?Sized>(&self, transaction: &Transaction, key: &K, value: V) -> V {
        self.inner.set(transaction, key, &value);
        value
    }

    /// Invalidate the cache from `transaction` on.
    ///
    /// The transaction stops seeing cached values at once; other
    /// transactions and processes follow when it commits.
    pub fn clear(&self, transaction: &Transaction) {
        self.inner.clear(transaction);
    }

    /// Entries in the shared store of `database`.
    pub fn len(&self, database: &str) -> usize {
        self.inner.len(database)
    }

    /// Whether the shared store of `database` is empty.
    pub fn is_empty(&self, database: &str) -> bool {
        self.len(database) == 0
    }

    /// Newest invalidation timestamp applied for `database`.
    pub fn last_invalidation(&self, database: &str) -> Option<Timestamp> {
        self.inner.last_timestamp(database)
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.stats()
    }
}

impl<V> fmt::Debug for Cache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.inner.name)
            .field("duration", &self.inner.duration)
            .field("context", &self.inner.context)
            .field("capacity", &self.inner.capacity)
            .field("databases", &self.inner.slots.len())
            .finish()
    }
}
