//! Key freezing.
//!
//! Cache keys are arbitrary serialisable values: tuples of ids, nested lists,
//! mappings of domain clauses. Freezing turns them into a hashable canonical
//! form where the container type does not matter (a tuple and a list with the
//! same items freeze to the same value) and mapping order does not matter.
//!
//! Serialisation keeps the iteration order of sets, which for a `HashSet` is
//! arbitrary. Wrap sets in [`Unordered`] so equal sets freeze equal.

use std::collections::HashSet;
use std::fmt;

use serde::ser::Error as _;
use serde::{Serialize, Serializer};
use serde_json::{Map, Number, Value};
use trellis_core::{Context, UserId};

/// Canonical, hashable form of a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FrozenKey {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    /// Non-integral numbers, kept as their shortest textual form.
    Float(String),
    Str(String),
    Seq(Vec<FrozenKey>),
    /// Mapping entries sorted by key.
    Map(Vec<(String, FrozenKey)>),
}

impl FrozenKey {
    /// Empty mapping, the frozen form of an empty context.
    pub fn empty_map() -> Self {
        Self::Map(Vec::new())
    }
}

impl fmt::Display for FrozenKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", unfreeze(self))
    }
}

/// Identity of an entry inside a cache store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Key of a context-insensitive cache.
    Plain(FrozenKey),
    /// Key of a context-sensitive cache: the same key seen by another user or
    /// under another context is another entry.
    Contextual {
        key: FrozenKey,
        user: UserId,
        context: FrozenKey,
    },
}

impl CacheKey {
    /// The frozen key without its context part.
    pub fn key(&self) -> &FrozenKey {
        match self {
            Self::Plain(key) => key,
            Self::Contextual { key, .. } => key,
        }
    }
}

/// Freeze a JSON value.
pub fn freeze(value: &Value) -> FrozenKey {
    match value {
        Value::Null => FrozenKey::Null,
        Value::Bool(b) => FrozenKey::Bool(*b),
        Value::Number(n) => freeze_number(n),
        Value::String(s) => FrozenKey::Str(s.clone()),
        Value::Array(items) => FrozenKey::Seq(items.iter().map(freeze).collect()),
        Value::Object(map) => freeze_map(map.iter()),
    }
}

/// Serialise then freeze an arbitrary key.
///
/// Returns `None` when the key cannot be represented (for instance a map
/// whose keys are not strings); callers treat that as a cache miss.
pub fn try_freeze<K: Serialize + ?Sized>(key: &K) -> Option<FrozenKey> {
    serde_json::to_value(key).ok().map(|value| freeze(&value))
}

/// Set-valued key, or key part, serialised in canonical order.
///
/// Members are written sorted by their frozen form with duplicates removed,
/// so `Unordered(&a) == Unordered(&b)` as keys whenever the sets hold equal
/// members. A set and a list with the same sorted members freeze alike.
#[derive(Debug, Clone, Copy)]
pub struct Unordered<'a, C: ?Sized>(pub &'a C);

impl<C> Serialize for Unordered<'_, C>
where
    C: ?Sized,
    for<'b> &'b C: IntoIterator,
    for<'b> <&'b C as IntoIterator>::Item: Serialize,
{
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut members = Vec::new();
        for item in self.0 {
            let value = serde_json::to_value(item).map_err(S::Error::custom)?;
            members.push((freeze(&value), value));
        }
        members.sort_by(|a, b| a.0.cmp(&b.0));
        members.dedup_by(|a, b| a.0 == b.0);
        serializer.collect_seq(members.iter().map(|(_, value)| value))
    }
}

/// Freeze a transaction context, leaving out the ignored keys.
pub fn freeze_context(context: &Context, ignored: &HashSet<String>) -> FrozenKey {
    freeze_map(context.iter().filter(|(k, _)| !ignored.contains(k.as_str())))
}

/// Structural inverse of [`freeze`], for diagnostics.
pub fn unfreeze(key: &FrozenKey) -> Value {
    match key {
        FrozenKey::Null => Value::Null,
        FrozenKey::Bool(b) => Value::Bool(*b),
        FrozenKey::Int(i) => Value::from(*i),
        FrozenKey::UInt(u) => Value::from(*u),
        FrozenKey::Float(text) => text
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(text.clone())),
        FrozenKey::Str(s) => Value::String(s.clone()),
        FrozenKey::Seq(items) => Value::Array(items.iter().map(unfreeze).collect()),
        FrozenKey::Map(entries) => Value::Object(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), unfreeze(v)))
                .collect::<Map<String, Value>>(),
        ),
    }
}

fn freeze_number(n: &Number) -> FrozenKey {
    if let Some(i) = n.as_i64() {
        FrozenKey::Int(i)
    } else if let Some(u) = n.as_u64() {
        FrozenKey::UInt(u)
    } else {
        FrozenKey::Float(n.to_string())
    }
}

fn freeze_map<'a>(entries: impl Iterator<Item = (&'a String, &'a Value)>) -> FrozenKey {
    let mut frozen: Vec<(String, FrozenKey)> =
        entries.map(|(k, v)| (k.clone(), freeze(v))).collect();
    frozen.sort_by(|a, b| a.0.cmp(&b.0));
    FrozenKey::Map(frozen)
}
