//! In-process database double.
//!
//! One [`InMemoryDatabase`] can be shared by several registries, each standing
//! for a separate process: they see the same invalidation table and the same
//! notification channel, the way processes share a PostgreSQL database.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use trellis_core::{BackendError, Timestamp, TrellisResult};

use super::{ChannelListener, Database, InvalidationRecord, InvalidationTable, NotificationChannel};
use crate::clock::{Clock, SystemClock};

// ============================================================================
// DATABASE
// ============================================================================

/// Database double with an invalidation table and a broadcast channel.
pub struct InMemoryDatabase {
    name: String,
    table: InMemoryTable,
    channel: Option<Arc<InMemoryChannel>>,
    modules: RwLock<Vec<String>>,
    modules_failing: AtomicBool,
}

impl InMemoryDatabase {
    /// Database stamping rows with the system clock.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_clock(name, Arc::new(SystemClock))
    }

    /// Database stamping rows with `clock`.
    pub fn with_clock(name: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        let name = name.into();
        Self {
            table: InMemoryTable::new(name.clone(), clock),
            channel: Some(Arc::new(InMemoryChannel::new(name.clone()))),
            modules: RwLock::new(Vec::new()),
            modules_failing: AtomicBool::new(false),
            name,
        }
    }

    /// Disable the native upsert; writers fall back to select then write.
    pub fn without_upsert(mut self) -> Self {
        self.table.upsert = false;
        self
    }

    /// Remove the notification channel; processes must poll.
    pub fn without_channel(mut self) -> Self {
        self.channel = None;
        self
    }

    /// Concrete table, for inspection.
    pub fn invalidations(&self) -> &InMemoryTable {
        &self.table
    }

    /// Concrete channel, for inspection and failure injection.
    pub fn notifications(&self) -> Option<&Arc<InMemoryChannel>> {
        self.channel.as_ref()
    }

    /// Replace the activated module list.
    pub fn set_active_modules<I, S>(&self, modules: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.modules.write() = modules.into_iter().map(Into::into).collect();
    }

    /// Make reads of the module list fail.
    pub fn fail_modules(&self, failing: bool) {
        self.modules_failing.store(failing, Ordering::SeqCst);
    }
}

impl Database for InMemoryDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn table(&self) -> &dyn InvalidationTable {
        &self.table
    }

    fn channel(&self) -> Option<Arc<dyn NotificationChannel>> {
        self.channel
            .as_ref()
            .map(|channel| Arc::clone(channel) as Arc<dyn NotificationChannel>)
    }

    fn active_modules(&self) -> TrellisResult<Vec<String>> {
        if self.modules_failing.load(Ordering::SeqCst) {
            return Err(BackendError::ConnectionFailed {
                database: self.name.clone(),
                reason: "module list unavailable".to_string(),
            }
            .into());
        }
        Ok(self.modules.read().clone())
    }
}

// ============================================================================
// TABLE
// ============================================================================

/// Invalidation table kept in memory.
///
/// The upsert keeps the greatest timestamp; `update` overwrites, like a
/// plain SQL `UPDATE` would.
pub struct InMemoryTable {
    database: String,
    clock: Arc<dyn Clock>,
    rows: Mutex<HashMap<String, Timestamp>>,
    upsert: bool,
    failing: AtomicBool,
}

impl InMemoryTable {
    fn new(database: String, clock: Arc<dyn Clock>) -> Self {
        Self {
            database,
            clock,
            rows: Mutex::new(HashMap::new()),
            upsert: true,
            failing: AtomicBool::new(false),
        }
    }

    /// Make every statement fail.
    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    fn check(&self) -> TrellisResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BackendError::TableFailed {
                database: self.database.clone(),
                reason: "statement failed".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

impl InvalidationTable for InMemoryTable {
    fn supports_upsert(&self) -> bool {
        self.upsert
    }

    fn upsert(&self, name: &str) -> TrellisResult<Timestamp> {
        self.check()?;
        if !self.upsert {
            return Err(BackendError::Unsupported {
                database: self.database.clone(),
                capability: "upsert".to_string(),
            }
            .into());
        }
        let now = self.clock.now();
        let mut rows = self.rows.lock();
        let stored = rows.entry(name.to_string()).or_insert(now);
        *stored = (*stored).max(now);
        Ok(*stored)
    }

    fn select(&self, name: &str) -> TrellisResult<Option<Timestamp>> {
        self.check()?;
        Ok(self.rows.lock().get(name).copied())
    }

    fn insert(&self, name: &str) -> TrellisResult<Timestamp> {
        self.check()?;
        let now = self.clock.now();
        let mut rows = self.rows.lock();
        if rows.contains_key(name) {
            return Err(BackendError::TableFailed {
                database: self.database.clone(),
                reason: format!("duplicate key value violates unique constraint on name {}", name),
            }
            .into());
        }
        rows.insert(name.to_string(), now);
        Ok(now)
    }

    fn update(&self, name: &str) -> TrellisResult<Timestamp> {
        self.check()?;
        let now = self.clock.now();
        self.rows.lock().insert(name.to_string(), now);
        Ok(now)
    }

    fn select_all(&self) -> TrellisResult<Vec<InvalidationRecord>> {
        self.check()?;
        Ok(self
            .rows
            .lock()
            .iter()
            .map(|(name, timestamp)| InvalidationRecord {
                name: name.clone(),
                timestamp: *timestamp,
            })
            .collect())
    }
}

// ============================================================================
// CHANNEL
// ============================================================================

/// Payloads kept by [`InMemoryChannel::published`].
pub const PUBLISHED_HISTORY: usize = 256;

/// Broadcast channel delivering every payload to every open subscription.
pub struct InMemoryChannel {
    database: String,
    subscribers: Mutex<Vec<Weak<Subscription>>>,
    published: Mutex<VecDeque<String>>,
    failing: AtomicBool,
}

#[derive(Default)]
struct Subscription {
    state: Mutex<SubscriptionState>,
    ready: Condvar,
}

#[derive(Default)]
struct SubscriptionState {
    payloads: VecDeque<String>,
    broken: bool,
}

impl InMemoryChannel {
    fn new(database: String) -> Self {
        Self {
            database,
            subscribers: Mutex::new(Vec::new()),
            published: Mutex::new(VecDeque::with_capacity(PUBLISHED_HISTORY)),
            failing: AtomicBool::new(false),
        }
    }

    /// Make `publish` and `listen` fail.
    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Break every open subscription: their next wait returns an error.
    pub fn break_subscriptions(&self) {
        for subscription in self.live() {
            subscription.state.lock().broken = true;
            subscription.ready.notify_all();
        }
    }

    /// Number of open subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.live().len()
    }

    /// The last [`PUBLISHED_HISTORY`] payloads published, oldest first.
    pub fn published(&self) -> Vec<String> {
        self.published.lock().iter().cloned().collect()
    }

    fn live(&self) -> Vec<Arc<Subscription>> {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|weak| weak.strong_count() > 0);
        subscribers.iter().filter_map(Weak::upgrade).collect()
    }

    fn check(&self) -> TrellisResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BackendError::ChannelFailed {
                database: self.database.clone(),
                reason: "channel unreachable".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

impl NotificationChannel for InMemoryChannel {
    fn publish(&self, payload: &str) -> TrellisResult<()> {
        self.check()?;
        {
            let mut published = self.published.lock();
            if published.len() == PUBLISHED_HISTORY {
                published.pop_front();
            }
            published.push_back(payload.to_string());
        }
        for subscription in self.live() {
            subscription
                .state
                .lock()
                .payloads
                .push_back(payload.to_string());
            subscription.ready.notify_all();
        }
        Ok(())
    }

    fn listen(&self) -> TrellisResult<Box<dyn ChannelListener>> {
        self.check()?;
        let subscription = Arc::new(Subscription::default());
        self.subscribers.lock().push(Arc::downgrade(&subscription));
        Ok(Box::new(InMemoryListener {
            database: self.database.clone(),
            subscription,
        }))
    }
}

struct InMemoryListener {
    database: String,
    subscription: Arc<Subscription>,
}

impl ChannelListener for InMemoryListener {
    fn wait(&mut self, timeout: Duration) -> TrellisResult<Vec<String>> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.subscription.state.lock();
        let mut timed_out = false;
        loop {
            if state.broken {
                return Err(BackendError::ChannelFailed {
                    database: self.database.clone(),
                    reason: "subscription lost".to_string(),
                }
                .into());
            }
            if !state.payloads.is_empty() {
                return Ok(state.payloads.drain(..).collect());
            }
            if timed_out {
                return Ok(Vec::new());
            }
            timed_out = match deadline {
                Some(deadline) => self.subscription.ready.wait_until(&mut state, deadline).timed_out(),
                None => {
                    self.subscription.ready.wait(&mut state);
                    false
                }
            };
        }
    }
}
