//! Property-Based Tests for the Bounded LRU Store
//!
//! Property: For any sequence of reads and writes, an `LruStore` holds
//! exactly the entries a reference recency list holds, in the same order.
//!
//! This validates:
//! - The capacity is never exceeded
//! - Reads and writes both count as a use
//! - The evicted entry is always the least recently used one

use proptest::prelude::*;
use trellis_cache::LruStore;

// ============================================================================
// OPERATIONS
// ============================================================================

#[derive(Debug, Clone)]
enum Op {
    Set(u8, u32),
    Get(u8),
    Remove(u8),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u8..12, any::<u32>()).prop_map(|(k, v)| Op::Set(k, v)),
        2 => (0u8..12).prop_map(Op::Get),
        1 => (0u8..12).prop_map(Op::Remove),
    ]
}

/// Recency list, most recently used first.
struct Model {
    capacity: usize,
    entries: Vec<(u8, u32)>,
}

impl Model {
    fn touch(&mut self, key: u8) -> Option<u32> {
        let index = self.entries.iter().position(|(k, _)| *k == key)?;
        let entry = self.entries.remove(index);
        self.entries.insert(0, entry);
        Some(entry.1)
    }

    fn set(&mut self, key: u8, value: u32) -> Option<(u8, u32)> {
        if self.touch(key).is_some() {
            self.entries[0].1 = value;
            return None;
        }
        self.entries.insert(0, (key, value));
        if self.entries.len() > self.capacity {
            return self.entries.pop();
        }
        None
    }

    fn remove(&mut self, key: u8) -> Option<u32> {
        let index = self.entries.iter().position(|(k, _)| *k == key)?;
        Some(self.entries.remove(index).1)
    }

    fn keys(&self) -> Vec<u8> {
        self.entries.iter().map(|(k, _)| *k).collect()
    }
}

// ============================================================================
// PROPERTIES
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: the store behaves like the reference recency list.
    #[test]
    fn prop_store_matches_recency_model(
        capacity in 1usize..6,
        ops in prop::collection::vec(arb_op(), 0..64),
    ) {
        let mut store = LruStore::<u8, u32>::new(capacity).unwrap();
        let mut model = Model { capacity, entries: Vec::new() };

        for op in ops {
            match op {
                Op::Set(k, v) => {
                    prop_assert_eq!(store.set(k, v), model.set(k, v));
                }
                Op::Get(k) => {
                    prop_assert_eq!(store.get(&k).copied(), model.touch(k));
                }
                Op::Remove(k) => {
                    prop_assert_eq!(store.remove(&k), model.remove(k));
                }
            }
            prop_assert!(store.len() <= capacity);
            prop_assert_eq!(store.keys().copied().collect::<Vec<_>>(), model.keys());
        }
    }

    /// Property: `peek` and `contains` never change the eviction order.
    #[test]
    fn prop_peek_does_not_touch(
        keys in prop::collection::vec(0u8..8, 1..16),
    ) {
        let mut store = LruStore::<u8, u8>::new(4).unwrap();
        for k in &keys {
            store.set(*k, *k);
        }
        let before: Vec<u8> = store.keys().copied().collect();
        for k in &keys {
            let _ = store.peek(k);
            let _ = store.contains(k);
        }
        let after: Vec<u8> = store.keys().copied().collect();
        prop_assert_eq!(before, after);
    }
}
