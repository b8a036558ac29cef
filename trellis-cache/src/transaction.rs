//! Transaction state seen by the cache.
//!
//! A [`Transaction`] carries what the cache needs from the surrounding
//! transaction manager: the database, the user and request context that are
//! part of key identity, the monotonic start instant, and a generation
//! counter. It also owns the cache state private to the transaction: the
//! names cleared but not yet committed and the overlay stores served while a
//! name is pending or the shared store is possibly stale.

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use trellis_core::{Context, UserId};
use uuid::Uuid;

use crate::backend::Database;

/// Shared handle on a transaction's generation counter.
///
/// The framework bumps the generation whenever data visible to the
/// transaction changes underneath helper caches (writes, savepoint rollback).
#[derive(Debug, Clone, Default)]
pub struct Generation(Arc<AtomicU64>);

impl Generation {
    /// Current value.
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }
}

#[derive(Default)]
struct CacheState {
    pending: BTreeSet<String>,
    overlays: HashMap<String, Box<dyn Any + Send>>,
}

/// One database transaction as seen by the cache layer.
///
/// A transaction is driven by one thread at a time; the interior lock only
/// exists so the value can be shared by reference with cache handles.
pub struct Transaction {
    id: Uuid,
    database: Arc<dyn Database>,
    user: UserId,
    context: Context,
    started_at: Instant,
    generation: Generation,
    state: Mutex<CacheState>,
}

impl Transaction {
    /// Start a transaction on `database` at the monotonic instant `started_at`.
    ///
    /// Use [`crate::CacheRegistry::begin`] to stamp the start with the
    /// registry's clock.
    pub fn new(database: Arc<dyn Database>, started_at: Instant) -> Self {
        Self {
            id: Uuid::now_v7(),
            database,
            user: 0,
            context: Context::new(),
            started_at,
            generation: Generation::default(),
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Run as the given user.
    pub fn with_user(mut self, user: UserId) -> Self {
        self.user = user;
        self
    }

    /// Attach the request context.
    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.database
    }

    pub fn database_name(&self) -> &str {
        self.database.name()
    }

    pub fn user(&self) -> UserId {
        self.user
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Handle on the generation counter.
    pub fn generation(&self) -> Generation {
        self.generation.clone()
    }

    /// Move to the next generation, returning it.
    pub fn bump_generation(&self) -> u64 {
        self.generation.advance()
    }

    /// Names cleared in this transaction and not yet committed, sorted.
    pub fn pending_invalidations(&self) -> Vec<String> {
        self.state.lock().pending.iter().cloned().collect()
    }

    /// Whether `name` was cleared in this transaction.
    pub fn is_pending(&self, name: &str) -> bool {
        self.state.lock().pending.contains(name)
    }

    pub(crate) fn mark_pending(&self, name: &str) {
        self.state.lock().pending.insert(name.to_string());
    }

    /// Take the pending set, leaving it empty.
    pub(crate) fn take_pending(&self) -> Vec<String> {
        std::mem::take(&mut self.state.lock().pending)
            .into_iter()
            .collect()
    }

    pub(crate) fn drop_overlay(&self, name: &str) {
        self.state.lock().overlays.remove(name);
    }

    pub(crate) fn drop_overlays(&self) {
        self.state.lock().overlays.clear();
    }

    /// Number of overlay stores the transaction holds.
    pub fn overlay_count(&self) -> usize {
        self.state.lock().overlays.len()
    }

    /// Run `f` on the overlay store of `name`, creating it with `create` when
    /// the transaction has none of type `S` yet.
    pub(crate) fn with_overlay<S, R>(
        &self,
        name: &str,
        create: impl FnOnce() -> S,
        f: impl FnOnce(&mut S) -> R,
    ) -> Option<R>
    where
        S: Any + Send,
    {
        let mut state = self.state.lock();
        let missing = state
            .overlays
            .get(name)
            .map(|overlay| !(**overlay).is::<S>())
            .unwrap_or(true);
        if missing {
            state
                .overlays
                .insert(name.to_string(), Box::new(create()));
        }
        state
            .overlays
            .get_mut(name)
            .and_then(|overlay| overlay.downcast_mut::<S>())
            .map(f)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("database", &self.database.name())
            .field("user", &self.user)
            .field("started_at", &self.started_at)
            .field("generation", &self.generation.current())
            .field("pending", &state.pending)
            .field("overlays", &state.overlays.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::InMemoryDatabase;

    fn transaction() -> Transaction {
        Transaction::new(Arc::new(InMemoryDatabase::new("erp")), Instant::now())
    }

    #[test]
    fn test_builder_fields() {
        let mut context = Context::new();
        context.insert("language".to_string(), serde_json::json!("fr"));
        let txn = transaction().with_user(7).with_context(context.clone());

        assert_eq!(txn.database_name(), "erp");
        assert_eq!(txn.user(), 7);
        assert_eq!(txn.context(), &context);
    }

    #[test]
    fn test_pending_set_is_taken_once() {
        let txn = transaction();
        txn.mark_pending("ir.rule");
        txn.mark_pending("ir.model");
        txn.mark_pending("ir.rule");

        assert!(txn.is_pending("ir.rule"));
        assert_eq!(txn.pending_invalidations(), vec!["ir.model", "ir.rule"]);
        assert_eq!(txn.take_pending(), vec!["ir.model", "ir.rule"]);
        assert!(txn.take_pending().is_empty());
        assert!(!txn.is_pending("ir.rule"));
    }

    #[test]
    fn test_generation_handles_share_the_counter() {
        let txn = transaction();
        let handle = txn.generation();
        assert_eq!(handle.current(), 0);
        assert_eq!(txn.bump_generation(), 1);
        assert_eq!(handle.current(), 1);
    }

    #[test]
    fn test_overlay_is_created_once() {
        let txn = transaction();
        txn.with_overlay("ir.rule", Vec::<u32>::new, |v| v.push(1));
        txn.with_overlay("ir.rule", Vec::<u32>::new, |v| v.push(2));
        let seen = txn.with_overlay("ir.rule", Vec::<u32>::new, |v| v.clone());
        assert_eq!(seen, Some(vec![1, 2]));
        assert_eq!(txn.overlay_count(), 1);

        txn.drop_overlay("ir.rule");
        let seen = txn.with_overlay("ir.rule", Vec::<u32>::new, |v| v.clone());
        assert_eq!(seen, Some(vec![]));
    }

    #[test]
    fn test_overlay_of_another_type_is_replaced() {
        let txn = transaction();
        txn.with_overlay("ir.rule", || 5u8, |_| ());
        let seen = txn.with_overlay("ir.rule", || String::from("fresh"), |s| s.clone());
        assert_eq!(seen.as_deref(), Some("fresh"));
    }
}
