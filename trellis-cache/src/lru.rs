//! Bounded LRU stores.
//!
//! [`LruStore`] backs every per-database and per-transaction cache view.
//! [`TransactionLruStore`] is the helper variant the framework uses for
//! memoisation that must not outlive one transaction generation (a savepoint
//! rollback bumps the generation and the store empties itself on refresh).

use std::fmt;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::ops::{Deref, DerefMut};

use lru::LruCache;
use trellis_core::{ConfigError, TrellisResult};

use crate::transaction::{Generation, Transaction};

type PlainFactory<V> = Box<dyn Fn() -> V + Send + Sync>;
type KeyedFactory<K, V> = Box<dyn Fn(&K) -> V + Send + Sync>;

enum DefaultFactory<K, V> {
    Plain(PlainFactory<V>),
    Keyed(KeyedFactory<K, V>),
}

/// Fixed capacity mapping evicting the least recently used entry.
///
/// Both insertion and lookup through [`LruStore::get`] count as a use.
pub struct LruStore<K: Hash + Eq, V> {
    entries: LruCache<K, V>,
    default: Option<DefaultFactory<K, V>>,
}

impl<K: Hash + Eq + Clone, V> LruStore<K, V> {
    /// Create an empty store. The capacity must be positive.
    pub fn new(capacity: usize) -> TrellisResult<Self> {
        let capacity = NonZeroUsize::new(capacity).ok_or_else(|| ConfigError::InvalidValue {
            field: "size_limit".to_string(),
            value: capacity.to_string(),
            reason: "size_limit must be greater than 0".to_string(),
        })?;
        Ok(Self::with_capacity(capacity))
    }

    /// Create an empty store from an already checked capacity.
    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self {
            entries: LruCache::new(capacity),
            default: None,
        }
    }

    /// Create a store that fills missing keys with `factory()`.
    pub fn with_default<F>(capacity: usize, factory: F) -> TrellisResult<Self>
    where
        F: Fn() -> V + Send + Sync + 'static,
    {
        let mut store = Self::new(capacity)?;
        store.default = Some(DefaultFactory::Plain(Box::new(factory)));
        Ok(store)
    }

    /// Create a store that fills missing keys with `factory(&key)`.
    pub fn with_keyed_default<F>(capacity: usize, factory: F) -> TrellisResult<Self>
    where
        F: Fn(&K) -> V + Send + Sync + 'static,
    {
        let mut store = Self::new(capacity)?;
        store.default = Some(DefaultFactory::Keyed(Box::new(factory)));
        Ok(store)
    }

    /// Look a key up and mark it most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    /// Look a key up without touching it.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.peek(key)
    }

    /// Look a key up, computing and inserting it with the default factory
    /// when missing. Without a factory this is [`LruStore::get`].
    pub fn get_or_compute(&mut self, key: K) -> Option<&V> {
        if !self.entries.contains(&key) {
            let value = match self.default.as_ref()? {
                DefaultFactory::Plain(factory) => factory(),
                DefaultFactory::Keyed(factory) => factory(&key),
            };
            self.entries.push(key.clone(), value);
        }
        self.entries.get(&key)
    }

    /// Insert or overwrite, marking the key most recently used.
    /// Returns the entry evicted to stay within capacity, if any.
    pub fn set(&mut self, key: K, value: V) -> Option<(K, V)> {
        match self.entries.push(key, value) {
            // push hands back the previous value when the key was present
            Some((evicted, _)) if self.entries.contains(&evicted) => None,
            other => other,
        }
    }

    /// Remove a key.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.pop(key)
    }

    /// Whether the key is present, without touching it.
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains(key)
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    /// Keys from most to least recently used.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.iter().map(|(k, _)| k)
    }
}

impl<K: Hash + Eq, V> fmt::Debug for LruStore<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LruStore")
            .field("len", &self.entries.len())
            .field("capacity", &self.entries.cap())
            .field("has_default", &self.default.is_some())
            .finish()
    }
}

/// LRU store bound to the generation of the transaction that built it.
pub struct TransactionLruStore<K: Hash + Eq, V> {
    store: LruStore<K, V>,
    generation: Generation,
    counter: u64,
}

impl<K: Hash + Eq + Clone, V> TransactionLruStore<K, V> {
    /// Create a store for the transaction's current generation.
    pub fn new(capacity: usize, transaction: &Transaction) -> TrellisResult<Self> {
        Ok(Self::wrap(LruStore::new(capacity)?, transaction))
    }

    /// Bind an existing store (for instance one with a default factory).
    pub fn wrap(store: LruStore<K, V>, transaction: &Transaction) -> Self {
        let generation = transaction.generation();
        let counter = generation.current();
        Self {
            store,
            generation,
            counter,
        }
    }

    /// Empty the store and adopt the current generation.
    pub fn clear(&mut self) {
        self.store.clear();
        self.counter = self.generation.current();
    }

    /// Empty the store if the transaction moved to another generation.
    pub fn refresh(&mut self) {
        if self.counter != self.generation.current() {
            self.clear();
        }
    }
}

impl<K: Hash + Eq, V> Deref for TransactionLruStore<K, V> {
    type Target = LruStore<K, V>;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

impl<K: Hash + Eq, V> DerefMut for TransactionLruStore<K, V> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.store
    }
}

impl<K: Hash + Eq, V> fmt::Debug for TransactionLruStore<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionLruStore")
            .field("store", &self.store)
            .field("counter", &self.counter)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::InMemoryDatabase;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_zero_capacity_is_rejected() {
        assert!(LruStore::<u32, u32>::new(0).is_err());
        assert!(LruStore::<u32, u32>::with_default(0, || 0).is_err());
    }

    #[test]
    fn test_overflow_evicts_least_recently_used() {
        let mut store = LruStore::new(3).unwrap();
        store.set("a", 1);
        store.set("b", 2);
        store.set("c", 3);
        let evicted = store.set("d", 4);

        assert_eq!(evicted, Some(("a", 1)));
        assert_eq!(store.len(), 3);
        assert!(!store.contains(&"a"));
        assert_eq!(store.keys().copied().collect::<Vec<_>>(), vec!["d", "c", "b"]);
    }

    #[test]
    fn test_get_protects_from_next_eviction() {
        let mut store = LruStore::new(2).unwrap();
        store.set(1, "one");
        store.set(2, "two");
        assert_eq!(store.get(&1), Some(&"one"));

        store.set(3, "three");
        assert!(store.contains(&1));
        assert!(!store.contains(&2));
    }

    #[test]
    fn test_peek_does_not_touch() {
        let mut store = LruStore::new(2).unwrap();
        store.set(1, "one");
        store.set(2, "two");
        assert_eq!(store.peek(&1), Some(&"one"));

        store.set(3, "three");
        assert!(!store.contains(&1));
    }

    #[test]
    fn test_overwrite_is_not_an_eviction() {
        let mut store = LruStore::new(2).unwrap();
        store.set(1, "one");
        store.set(2, "two");
        assert_eq!(store.set(1, "uno"), None);
        assert_eq!(store.len(), 2);
        assert_eq!(store.peek(&1), Some(&"uno"));

        // 1 was refreshed by the overwrite, so 2 goes first
        assert_eq!(store.set(3, "three"), Some((2, "two")));
    }

    #[test]
    fn test_get_or_compute_with_default() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut store = LruStore::with_default(2, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Vec::<u32>::new()
        })
        .unwrap();

        assert_eq!(store.get_or_compute("x"), Some(&Vec::new()));
        assert_eq!(store.get_or_compute("x"), Some(&Vec::new()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        store.get_or_compute("y");
        store.get_or_compute("z");
        assert_eq!(store.len(), 2);
        assert!(!store.contains(&"x"));
    }

    #[test]
    fn test_get_or_compute_with_keyed_default() {
        let mut store = LruStore::with_keyed_default(4, |key: &u32| key * 10).unwrap();
        assert_eq!(store.get_or_compute(7), Some(&70));
        assert_eq!(store.peek(&7), Some(&70));
    }

    #[test]
    fn test_get_or_compute_without_default() {
        let mut store: LruStore<u32, u32> = LruStore::new(4).unwrap();
        assert_eq!(store.get_or_compute(7), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_transaction_store_refresh() {
        let database = Arc::new(InMemoryDatabase::new("erp"));
        let transaction = Transaction::new(database, Instant::now());
        let mut store = TransactionLruStore::new(8, &transaction).unwrap();
        store.set("k", 1);

        store.refresh();
        assert_eq!(store.peek(&"k"), Some(&1));

        transaction.bump_generation();
        store.refresh();
        assert!(store.is_empty());

        store.set("k", 2);
        store.refresh();
        assert_eq!(store.peek(&"k"), Some(&2));
    }
}
