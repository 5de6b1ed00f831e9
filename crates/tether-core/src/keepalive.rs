//! Heartbeat-driven lifetime guards.
//!
//! A guard holds a strong reference to an object until the session's
//! heartbeat counter reaches the guard's expiry. Re-registering keeps the
//! later of the two expiries, so a guarantee is never shortened.

use std::collections::BTreeMap;

/// Guard set keyed by object id.
#[derive(Debug)]
pub struct KeepAlive<T> {
    guards: BTreeMap<String, (T, u64)>,
}

impl<T> Default for KeepAlive<T> {
    fn default() -> Self {
        Self { guards: BTreeMap::new() }
    }
}

impl<T> KeepAlive<T> {
    /// Empty guard set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Guard `value` until the counter reaches `expiry`. Returns the
    /// effective expiry, which is the maximum of this and any earlier
    /// registration.
    pub fn register(&mut self, id: impl Into<String>, value: T, expiry: u64) -> u64 {
        let id = id.into();
        match self.guards.get_mut(&id) {
            Some((_, current)) => {
                *current = (*current).max(expiry);
                *current
            },
            None => {
                self.guards.insert(id, (value, expiry));
                expiry
            },
        }
    }

    /// Drop every guard whose expiry is `<= counter`, returning the released
    /// values.
    pub fn release_through(&mut self, counter: u64) -> Vec<T> {
        let expired: Vec<String> =
            self.guards.iter().filter(|(_, (_, expiry))| *expiry <= counter).map(|(id, _)| id.clone()).collect();
        expired.into_iter().filter_map(|id| self.guards.remove(&id)).map(|(value, _)| value).collect()
    }

    /// Expiry of the guard on `id`.
    pub fn expiry(&self, id: &str) -> Option<u64> {
        self.guards.get(id).map(|(_, expiry)| *expiry)
    }

    /// Whether `id` is guarded.
    pub fn contains(&self, id: &str) -> bool {
        self.guards.contains_key(id)
    }

    /// Number of guarded objects.
    pub fn len(&self) -> usize {
        self.guards.len()
    }

    /// Whether nothing is guarded.
    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    /// Drop all guards.
    pub fn clear(&mut self) {
        self.guards.clear();
    }
}
