//! Process-wide registry of named caches.
//!
//! The registry owns the settings, the clock and the invalidation
//! coordinator, and dispatches the transaction lifecycle hooks to the
//! configured [`CacheBackend`]. Handles are cheap to clone.

use std::fmt;
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use trellis_core::{CacheBackendKind, CacheSettings, ConfigError, TrellisResult};
use uuid::Uuid;

use crate::backend::{Database, ModuleRegistry};
use crate::clock::{Clock, SystemClock};
use crate::coordinator::{CacheBackend, DisabledBackend, MemoryBackend};
use crate::instance::CacheHandle;
use crate::modules::ModuleTracker;
use crate::stats::CacheStats;
use crate::transaction::Transaction;

static GLOBAL: Lazy<CacheRegistry> = Lazy::new(|| {
    let settings = CacheSettings::from_env();
    let settings = match settings.validate() {
        Ok(()) => settings,
        Err(e) => {
            tracing::warn!(error = %e, "Invalid cache settings in environment, using defaults");
            CacheSettings::default()
        }
    };
    CacheRegistry::assemble(settings, Arc::new(SystemClock))
});

pub(crate) struct RegistryInner {
    settings: CacheSettings,
    clock: Arc<dyn Clock>,
    process_id: Uuid,
    caches: DashMap<String, Arc<dyn CacheHandle>>,
    modules: ModuleTracker,
    backend: Box<dyn CacheBackend>,
}

/// Registry of the named caches of one process.
#[derive(Clone)]
pub struct CacheRegistry {
    inner: Arc<RegistryInner>,
}

impl CacheRegistry {
    /// Create a registry running on the system clock.
    pub fn new(settings: CacheSettings) -> TrellisResult<Self> {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    /// Create a registry running on `clock`.
    pub fn with_clock(settings: CacheSettings, clock: Arc<dyn Clock>) -> TrellisResult<Self> {
        settings.validate()?;
        Ok(Self::assemble(settings, clock))
    }

    /// The registry shared by the whole process, configured from the
    /// `TRELLIS_CACHE_*` environment variables on first use.
    pub fn global() -> &'static CacheRegistry {
        &GLOBAL
    }

    fn assemble(settings: CacheSettings, clock: Arc<dyn Clock>) -> Self {
        let backend: Box<dyn CacheBackend> = match settings.backend {
            CacheBackendKind::Memory => Box::new(MemoryBackend::new()),
            CacheBackendKind::Disabled => Box::new(DisabledBackend),
        };
        let process_id = Uuid::now_v7();
        tracing::debug!(
            process_id = %process_id,
            backend = ?settings.backend,
            "Cache registry created"
        );
        Self {
            inner: Arc::new(RegistryInner {
                settings,
                clock,
                process_id,
                caches: DashMap::new(),
                modules: ModuleTracker::default(),
                backend,
            }),
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.inner.settings
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.inner.clock)
    }

    /// Identifier of this process in `refresh pool` notifications.
    pub fn process_id(&self) -> Uuid {
        self.inner.process_id
    }

    pub fn backend_kind(&self) -> CacheBackendKind {
        self.inner.backend.kind()
    }

    /// Install the framework's class registry, refreshed when the activated
    /// modules change.
    pub fn set_module_registry(&self, registry: Arc<dyn ModuleRegistry>) {
        self.inner.modules.set_registry(registry);
    }

    /// Start a transaction on `database` now.
    pub fn begin(&self, database: Arc<dyn Database>) -> Transaction {
        Transaction::new(database, self.inner.clock.monotonic())
    }

    /// Registered cache names, sorted.
    pub fn cache_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .caches
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Clear every registered cache in `transaction`.
    pub fn clear_all(&self, transaction: &Transaction) {
        for handle in self.handles() {
            handle.clear(transaction);
        }
    }

    /// Hit and miss counts of every cache, sorted by name.
    pub fn stats(&self) -> Vec<CacheStats> {
        let mut stats: Vec<CacheStats> = self.handles().iter().map(|handle| handle.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Apply invalidations from other processes. Call when a transaction starts.
    pub fn sync(&self, transaction: &Transaction) {
        self.inner.backend.sync(self, transaction);
    }

    /// Publish the invalidations staged by `transaction`. Call when it commits.
    pub fn commit(&self, transaction: &Transaction) {
        self.inner.backend.commit(self, transaction);
    }

    /// Discard the invalidations staged by `transaction`.
    pub fn rollback(&self, transaction: &Transaction) {
        self.inner.backend.rollback(self, transaction);
    }

    /// Stop listening to `database` and forget everything cached for it.
    pub fn drop_database(&self, database: &str) {
        self.inner.backend.drop_database(self, database);
    }

    /// Ask the other processes to reload their class registry.
    pub fn refresh_pool(&self, transaction: &Transaction) {
        self.inner.backend.refresh_pool(self, transaction);
    }

    /// Whether a channel listener is running for `database`.
    pub fn is_listening(&self, database: &str) -> bool {
        self.inner.backend.is_listening(database)
    }

    /// Stop every listener. Cached values stay usable.
    pub fn shutdown(&self) {
        self.inner.backend.shutdown();
    }

    pub(crate) fn stores_values(&self) -> bool {
        self.inner.backend.stores_values()
    }

    pub(crate) fn modules(&self) -> &ModuleTracker {
        &self.inner.modules
    }

    pub(crate) fn register(&self, handle: Arc<dyn CacheHandle>) -> TrellisResult<()> {
        match self.inner.caches.entry(handle.name().to_string()) {
            Entry::Occupied(entry) => Err(ConfigError::DuplicateCacheName {
                name: entry.key().clone(),
            }
            .into()),
            Entry::Vacant(entry) => {
                entry.insert(handle);
                Ok(())
            }
        }
    }

    pub(crate) fn handle(&self, name: &str) -> Option<Arc<dyn CacheHandle>> {
        self.inner
            .caches
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn handles(&self) -> Vec<Arc<dyn CacheHandle>> {
        self.inner
            .caches
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub(crate) fn downgrade(&self) -> Weak<RegistryInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<RegistryInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }
}

impl fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheRegistry")
            .field("process_id", &self.inner.process_id)
            .field("backend", &self.inner.backend.kind())
            .field("caches", &self.inner.caches.len())
            .finish()
    }
}
