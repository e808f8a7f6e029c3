use crate::upstream::Completion;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// In-memory backend: TTL checked at read, LRU order = insertion order.
/// Re-inserting an existing key moves it to the tail without evicting.
pub struct MemoryCache {
    max_size: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    entries: HashMap<String, Entry>,
    /// Keys in insertion order; front = oldest.
    order: VecDeque<String>,
}

struct Entry {
    value: Completion,
    expires_at: Instant,
    #[allow(dead_code)]
    created_at: Instant,
}

impl MemoryCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<Completion> {
        let mut inner = self.inner.lock().unwrap();
        match inner.entries.get(key) {
            Some(entry) if Instant::now() < entry.expires_at => Some(entry.value.clone()),
            Some(_) => {
                // Expired — drop it so size reflects live entries.
                inner.entries.remove(key);
                inner.order.retain(|k| k != key);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, key: &str, value: Completion, ttl: Duration) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();

        if inner.entries.contains_key(key) {
            inner.order.retain(|k| k != key);
        } else if inner.entries.len() >= self.max_size {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
            }
        }

        inner.order.push_back(key.to_string());
        inner.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: now + ttl,
                created_at: now,
            },
        );
    }

    pub fn delete(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.remove(key).is_some() {
            inner.order.retain(|k| k != key);
        }
    }

    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let n = inner.entries.len();
        inner.entries.clear();
        inner.order.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completion(text: &str) -> Completion {
        Completion {
            model: "m".into(),
            text: text.into(),
            provider: "p".into(),
            duration_ms: 0,
            cached: false,
            prompt_tokens: None,
            completion_tokens: None,
        }
    }

    #[test]
    fn test_set_get_roundtrip() {
        let cache = MemoryCache::new(10);
        cache.set("k", completion("v"), Duration::from_secs(60));
        assert_eq!(cache.get("k").unwrap().text, "v");
    }

    #[test]
    fn test_ttl_expiry_on_read() {
        let cache = MemoryCache::new(10);
        cache.set("k", completion("v"), Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.get("k").is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_capacity_one_eviction() {
        let cache = MemoryCache::new(1);
        cache.set("a", completion("1"), Duration::from_secs(60));
        cache.set("b", completion("2"), Duration::from_secs(60));
        assert!(cache.get("a").is_none());
        assert_eq!(cache.get("b").unwrap().text, "2");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_reinsert_existing_key_never_evicts() {
        let cache = MemoryCache::new(2);
        cache.set("a", completion("1"), Duration::from_secs(60));
        cache.set("b", completion("2"), Duration::from_secs(60));
        // Overwrite at capacity: must not evict anything.
        cache.set("a", completion("1b"), Duration::from_secs(60));
        assert_eq!(cache.get("a").unwrap().text, "1b");
        assert_eq!(cache.get("b").unwrap().text, "2");
    }

    #[test]
    fn test_reinsert_moves_to_tail() {
        let cache = MemoryCache::new(2);
        cache.set("a", completion("1"), Duration::from_secs(60));
        cache.set("b", completion("2"), Duration::from_secs(60));
        // Touch "a" via set — "b" becomes the oldest.
        cache.set("a", completion("1b"), Duration::from_secs(60));
        cache.set("c", completion("3"), Duration::from_secs(60));
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_delete() {
        let cache = MemoryCache::new(10);
        cache.set("k", completion("v"), Duration::from_secs(60));
        cache.delete("k");
        assert!(cache.get("k").is_none());
        assert_eq!(cache.len(), 0);
    }
}
