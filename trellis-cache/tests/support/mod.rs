//! Shared fixtures: each `Process` is a registry of its own, standing for a
//! separate server process on the same database.

#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use trellis_cache::{
    Cache, CacheOptions, CacheRegistry, CacheSettings, InMemoryDatabase, ManualClock, Transaction,
};

static TRACING: Once = Once::new();

/// Route `tracing` output to the test harness, filtered by `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Poll `condition` until it holds or five seconds pass.
pub fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

pub struct Process {
    pub registry: CacheRegistry,
    pub rules: Cache<i64>,
}

impl Process {
    pub fn start(settings: CacheSettings, clock: &Arc<ManualClock>) -> Self {
        let registry =
            CacheRegistry::with_clock(settings, clock.clone()).expect("valid cache settings");
        let rules = Cache::new(&registry, CacheOptions::new("ir.rule")).expect("cache registered");
        Self { registry, rules }
    }

    /// Begin a transaction and sync it, the way the framework does.
    pub fn begin(&self, database: &Arc<InMemoryDatabase>) -> Transaction {
        let transaction = self.registry.begin(database.clone());
        self.registry.sync(&transaction);
        transaction
    }
}

pub fn polling() -> CacheSettings {
    CacheSettings::new().with_clean_timeout(Duration::from_secs(5))
}

pub fn listening() -> CacheSettings {
    CacheSettings::listening()
}
