use std::{
    collections::{HashMap, HashSet},
    hash::Hash,
};

/// Allows a key through at most once per `window_ms`.
///
/// Monitor-local: each monitor owns its limiter inside its own state, so
/// windows never leak across monitors or sessions.
#[derive(Debug, Clone)]
pub struct RateLimiter<K> {
    window_ms: u64,
    last_reported: HashMap<K, u64>,
}

impl<K: Hash + Eq> RateLimiter<K> {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            last_reported: HashMap::new(),
        }
    }

    /// Returns true and records `now_ms` if `key` is outside its window.
    pub fn permit(&mut self, key: K, now_ms: u64) -> bool {
        if let Some(last) = self.last_reported.get(&key) {
            if now_ms.saturating_sub(*last) < self.window_ms {
                return false;
            }
        }
        self.last_reported.insert(key, now_ms);
        true
    }

    pub fn last_reported(&self, key: &K) -> Option<u64> {
        self.last_reported.get(key).copied()
    }

    pub fn clear(&mut self) {
        self.last_reported.clear();
    }
}

/// Session-long deduplication: the first sighting of a key passes, every
/// later one is suppressed.
#[derive(Debug, Clone)]
pub struct SeenSet<K> {
    seen: HashSet<K>,
}

impl<K: Hash + Eq> SeenSet<K> {
    pub fn new() -> Self {
        Self {
            seen: HashSet::new(),
        }
    }

    pub fn first_sighting(&mut self, key: K) -> bool {
        self.seen.insert(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.seen.contains(key)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &K> {
        self.seen.iter()
    }
}

impl<K: Hash + Eq> Default for SeenSet<K> {
    fn default() -> Self {
        Self::new()
    }
}
