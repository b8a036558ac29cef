//! Channel listeners.
//!
//! One background thread per database applies the notifications published by
//! other processes. A listener is registered in the [`ListenerSet`] under a
//! unique id; it keeps running while that registration is current. Stopping
//! removes the registration and publishes an empty payload so a blocked wait
//! returns and the thread sees it is no longer wanted.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use trellis_core::{BackendError, TrellisResult};
use uuid::Uuid;

use crate::backend::{ChannelListener, Database, NotificationChannel};
use crate::message::Payload;
use crate::registry::{CacheRegistry, RegistryInner};

struct ListenerHandle {
    id: Uuid,
    channel: Arc<dyn NotificationChannel>,
    thread: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    fn stop(mut self, database: &str) {
        if let Err(e) = self.channel.publish(&Payload::Wake.encode()) {
            tracing::warn!(
                database = %database,
                error = %e,
                "Failed to wake cache listener, waiting for its timeout"
            );
        }
        let Some(thread) = self.thread.take() else {
            return;
        };
        if thread.thread().id() == thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            tracing::error!(database = %database, "Cache listener panicked");
        }
    }
}

/// Active listeners by database name.
#[derive(Default)]
pub(crate) struct ListenerSet {
    active: Mutex<HashMap<String, ListenerHandle>>,
}

impl ListenerSet {
    pub(crate) fn is_active(&self, database: &str) -> bool {
        self.active.lock().contains_key(database)
    }

    /// Stop the listener of `database` and wait for its thread.
    pub(crate) fn stop(&self, database: &str) {
        let handle = self.active.lock().remove(database);
        if let Some(handle) = handle {
            handle.stop(database);
        }
    }

    pub(crate) fn stop_all(&self) {
        let handles: Vec<(String, ListenerHandle)> = self.active.lock().drain().collect();
        for (database, handle) in handles {
            handle.stop(&database);
        }
    }

    fn is_current(&self, database: &str, id: Uuid) -> bool {
        self.active
            .lock()
            .get(database)
            .map(|handle| handle.id == id)
            .unwrap_or(false)
    }

    /// Deregister `id` if it is still the listener of `database`.
    fn release(&self, database: &str, id: Uuid) {
        let mut active = self.active.lock();
        if active.get(database).map(|handle| handle.id == id).unwrap_or(false) {
            active.remove(database);
        }
    }
}

/// Start the listener of the database unless one is running.
///
/// Subscribing happens here, so a failure is reported to the caller which
/// falls back to polling. Every store of the database is reset once
/// subscribed because notifications sent while nobody listened are lost.
pub(crate) fn start(
    listeners: &Arc<ListenerSet>,
    registry: &CacheRegistry,
    database: &Arc<dyn Database>,
) -> TrellisResult<()> {
    let dbname = database.name().to_string();
    if listeners.is_active(&dbname) {
        return Ok(());
    }

    let channel = database.channel().ok_or_else(|| BackendError::Unsupported {
        database: dbname.clone(),
        capability: "notification channel".to_string(),
    })?;
    let subscription = channel.listen()?;

    // Runs without the set locked: module registries may call back into the
    // cache registry.
    registry.modules().refresh(database.as_ref(), true);
    for handle in registry.handles() {
        handle.reset(&dbname, None);
    }

    let mut active = listeners.active.lock();
    if active.contains_key(&dbname) {
        // another sync won the race, drop our subscription
        return Ok(());
    }

    let id = Uuid::now_v7();
    let worker = Listener {
        id,
        database: Arc::clone(database),
        registry: registry.downgrade(),
        listeners: Arc::clone(listeners),
        timeout: registry.settings().listener_timeout,
    };
    let thread = thread::Builder::new()
        .name(format!("cache-listener-{}", dbname))
        .spawn(move || worker.run(subscription))
        .map_err(|e| BackendError::ChannelFailed {
            database: dbname.clone(),
            reason: format!("cannot spawn listener thread: {}", e),
        })?;

    active.insert(
        dbname.clone(),
        ListenerHandle {
            id,
            channel,
            thread: Some(thread),
        },
    );
    tracing::info!(database = %dbname, listener = %id, "Cache listener started");
    Ok(())
}

/// Deregisters a listener when its thread ends, including by a panic.
struct Registration {
    listeners: Arc<ListenerSet>,
    database: String,
    id: Uuid,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if thread::panicking() {
            tracing::error!(
                database = %self.database,
                listener = %self.id,
                "Cache listener panicked"
            );
        }
        self.listeners.release(&self.database, self.id);
        tracing::info!(database = %self.database, listener = %self.id, "Cache listener stopped");
    }
}

struct Listener {
    id: Uuid,
    database: Arc<dyn Database>,
    registry: Weak<RegistryInner>,
    listeners: Arc<ListenerSet>,
    timeout: Duration,
}

impl Listener {
    fn run(self, mut subscription: Box<dyn ChannelListener>) {
        let dbname = self.database.name().to_string();
        let _registration = Registration {
            listeners: Arc::clone(&self.listeners),
            database: dbname.clone(),
            id: self.id,
        };
        while self.listeners.is_current(&dbname, self.id) {
            let payloads = match subscription.wait(self.timeout) {
                Ok(payloads) => payloads,
                Err(e) => {
                    tracing::error!(
                        database = %dbname,
                        error = %e,
                        "Cache listener crashed"
                    );
                    break;
                }
            };
            let Some(registry) = CacheRegistry::upgrade(&self.registry) else {
                break;
            };
            if !self.listeners.is_current(&dbname, self.id) {
                break;
            }
            for raw in &payloads {
                apply_payload(&registry, self.database.as_ref(), raw);
            }
        }
    }
}

/// Apply one notification received for `database`.
pub(crate) fn apply_payload(registry: &CacheRegistry, database: &dyn Database, raw: &str) {
    match Payload::parse(raw) {
        Ok(Payload::Wake) => {}
        Ok(Payload::RefreshPool { process_id }) => {
            let own = registry.process_id().to_string();
            if process_id.as_deref() != Some(own.as_str()) {
                registry.modules().refresh(database, true);
            }
        }
        Ok(Payload::Invalidate(names)) => {
            for name in names {
                if let Some(handle) = registry.handle(&name) {
                    handle.reset(database.name(), None);
                }
            }
        }
        Err(e) => tracing::warn!(
            database = %database.name(),
            error = %e,
            "Ignoring cache notification"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::InMemoryDatabase;
    use crate::backend::ModuleRegistry;
    use crate::clock::ManualClock;
    use crate::instance::{Cache, CacheOptions};
    use std::time::Instant;
    use trellis_core::CacheSettings;

    #[derive(Default)]
    struct Counter {
        refreshes: Mutex<usize>,
    }

    impl ModuleRegistry for Counter {
        fn refresh(&self, _database: &str, _modules: &[String]) {
            *self.refreshes.lock() += 1;
        }
    }

    fn eventually(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    fn listening_registry() -> CacheRegistry {
        CacheRegistry::with_clock(CacheSettings::listening(), Arc::new(ManualClock::new())).unwrap()
    }

    #[test]
    fn test_apply_invalidate_payload() {
        let registry = listening_registry();
        let cache: Cache<i32> = Cache::new(&registry, CacheOptions::new("ir.rule")).unwrap();
        let db = Arc::new(InMemoryDatabase::new("erp"));
        cache.set(&registry.begin(db.clone()), "k", 1);

        apply_payload(&registry, db.as_ref(), r#"["unknown.cache","ir.rule"]"#);
        assert_eq!(cache.len("erp"), 0);
    }

    #[test]
    fn test_apply_ignores_own_refresh_and_garbage() {
        let registry = listening_registry();
        let counter = Arc::new(Counter::default());
        registry.set_module_registry(counter.clone());
        let db = InMemoryDatabase::new("erp");

        let own = format!("refresh pool {}", registry.process_id());
        apply_payload(&registry, &db, &own);
        apply_payload(&registry, &db, "not json");
        apply_payload(&registry, &db, "");
        assert_eq!(*counter.refreshes.lock(), 0);

        apply_payload(&registry, &db, "refresh pool someone-else");
        assert_eq!(*counter.refreshes.lock(), 1);
    }

    #[test]
    fn test_start_is_idempotent_and_stop_joins() {
        let registry = listening_registry();
        let db: Arc<dyn Database> = Arc::new(InMemoryDatabase::new("erp"));
        let listeners = Arc::new(ListenerSet::default());

        start(&listeners, &registry, &db).unwrap();
        start(&listeners, &registry, &db).unwrap();
        assert!(listeners.is_active("erp"));

        listeners.stop("erp");
        assert!(!listeners.is_active("erp"));
    }

    #[test]
    fn test_start_fails_without_channel() {
        let registry = listening_registry();
        let db: Arc<dyn Database> = Arc::new(InMemoryDatabase::new("erp").without_channel());
        let listeners = Arc::new(ListenerSet::default());
        assert!(start(&listeners, &registry, &db).is_err());
        assert!(!listeners.is_active("erp"));
    }

    #[test]
    fn test_crashed_listener_deregisters() {
        let registry = listening_registry();
        let memory = Arc::new(InMemoryDatabase::new("erp"));
        let db: Arc<dyn Database> = memory.clone();
        let listeners = Arc::new(ListenerSet::default());

        start(&listeners, &registry, &db).unwrap();
        memory.notifications().unwrap().break_subscriptions();
        assert!(eventually(|| !listeners.is_active("erp")));

        start(&listeners, &registry, &db).unwrap();
        assert!(listeners.is_active("erp"));
        listeners.stop_all();
        assert!(!listeners.is_active("erp"));
    }

    #[test]
    fn test_listener_exits_when_registry_is_gone() {
        let registry = listening_registry();
        let memory = Arc::new(InMemoryDatabase::new("erp"));
        let db: Arc<dyn Database> = memory.clone();
        let listeners = Arc::new(ListenerSet::default());

        start(&listeners, &registry, &db).unwrap();
        drop(registry);
        memory.notifications().unwrap().publish("").unwrap();
        assert!(eventually(|| !listeners.is_active("erp")));
    }
}
