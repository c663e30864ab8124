//! Bounded in-memory cache tier.
//!
//! A capacity-bounded map from keys to `(bytes, absolute expiry)`. When a
//! `set` lands at capacity a 10% batch eviction runs: already-expired
//! entries go first, then arbitrary entries until the target is met. The
//! background sweeper calls [`MemoryCache::evict_expired`] once a minute.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

struct Entry {
    data: Vec<u8>,
    expires_at: Instant,
}

/// The in-memory tier.
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    capacity: usize,
}

impl MemoryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Fetch a value; expired entries are removed on access.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.data.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store a value with an absolute expiry of now + `ttl`.
    pub fn set(&self, key: &str, value: &[u8], ttl: Duration) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity && !entries.contains_key(key) {
            Self::evict_batch(&mut entries, self.capacity);
        }
        entries.insert(
            key.to_string(),
            Entry {
                data: value.to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn delete(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    /// Remove every key with the given prefix; returns how many went.
    pub fn delete_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        before - entries.len()
    }

    /// Drop expired entries; returns how many went.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(evicted, "memory cache sweep");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Evict ~10% of capacity: expired entries first, then arbitrary ones.
    fn evict_batch(entries: &mut HashMap<String, Entry>, capacity: usize) {
        let target = (capacity / 10).max(1);
        let now = Instant::now();

        let mut victims: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .take(target)
            .collect();

        if victims.len() < target {
            let needed = target - victims.len();
            let extra: Vec<String> = entries
                .keys()
                .filter(|key| !victims.contains(*key))
                .take(needed)
                .cloned()
                .collect();
            victims.extend(extra);
        }

        for key in &victims {
            entries.remove(key);
        }
        debug!(evicted = victims.len(), "memory cache batch eviction");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_set_round_trip() {
        let cache = MemoryCache::new(16);
        cache.set("a", b"1", Duration::from_secs(60));
        assert_eq!(cache.get("a"), Some(b"1".to_vec()));
        assert_eq!(cache.get("b"), None);
    }

    #[test]
    fn test_expiry_on_access() {
        let cache = MemoryCache::new(16);
        cache.set("a", b"1", Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_capacity_eviction_prefers_expired() {
        let cache = MemoryCache::new(10);
        cache.set("stale", b"x", Duration::from_millis(1));
        for i in 0..9 {
            cache.set(&format!("live-{i}"), b"x", Duration::from_secs(60));
        }
        std::thread::sleep(Duration::from_millis(5));

        // At capacity: the next set must evict, and the expired entry goes.
        cache.set("new", b"x", Duration::from_secs(60));
        assert_eq!(cache.get("stale"), None);
        assert_eq!(cache.get("new"), Some(b"x".to_vec()));
        assert!(cache.len() <= 10);
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let cache = MemoryCache::new(2);
        cache.set("a", b"1", Duration::from_secs(60));
        cache.set("b", b"2", Duration::from_secs(60));
        cache.set("a", b"3", Duration::from_secs(60));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), Some(b"3".to_vec()));
        assert_eq!(cache.get("b"), Some(b"2".to_vec()));
    }

    #[test]
    fn test_delete_prefix() {
        let cache = MemoryCache::new(16);
        cache.set("user:1:name", b"a", Duration::from_secs(60));
        cache.set("user:1:email", b"b", Duration::from_secs(60));
        cache.set("user:2:name", b"c", Duration::from_secs(60));

        assert_eq!(cache.delete_prefix("user:1:"), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_sweep() {
        let cache = MemoryCache::new(16);
        cache.set("a", b"1", Duration::from_millis(5));
        cache.set("b", b"2", Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(cache.evict_expired(), 1);
        assert_eq!(cache.len(), 1);
    }
}
