//! Classification cache — LRU with TTL, keyed by normalized text plus the
//! salient chat context.
//!
//! Entries older than the TTL are evicted lazily on lookup; capacity
//! eviction drops the least recently used. Hits are counted by the router
//! separately from layer counts.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::adapters::Classification;

struct CacheEntry {
    value: Classification,
    inserted_at: Instant,
}

/// LRU+TTL cache for classifier verdicts.
pub struct ClassificationCache {
    entries: HashMap<String, CacheEntry>,
    /// Recency order, least recent at the front.
    order: VecDeque<String>,
    max_size: usize,
    max_age: Duration,
}

impl ClassificationCache {
    pub fn new(max_size: usize, max_age: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            max_size: max_size.max(1),
            max_age,
        }
    }

    /// Build the cache key from normalized text and the registered repo.
    pub fn key(text: &str, repo: Option<&str>) -> String {
        let normalized = text.trim().to_lowercase();
        let normalized = normalized.split_whitespace().collect::<Vec<_>>().join(" ");
        match repo {
            Some(repo) => format!("{repo}::{normalized}"),
            None => normalized,
        }
    }

    /// Look up a key, evicting it first when expired. A hit refreshes
    /// recency.
    pub fn get(&mut self, key: &str) -> Option<Classification> {
        let expired = match self.entries.get(key) {
            Some(entry) => {
                // TTL of zero means "no caching": everything is stale.
                self.max_age.is_zero() || entry.inserted_at.elapsed() >= self.max_age
            }
            None => return None,
        };
        if expired {
            self.remove(key);
            return None;
        }
        self.touch(key);
        self.entries.get(key).map(|e| e.value.clone())
    }

    /// Insert (or refresh) a key, evicting the least recently used entry
    /// when at capacity.
    pub fn insert(&mut self, key: String, value: Classification) {
        if self.entries.contains_key(&key) {
            self.touch(&key);
            if let Some(entry) = self.entries.get_mut(&key) {
                entry.value = value;
                entry.inserted_at = Instant::now();
            }
            return;
        }
        while self.entries.len() >= self.max_size {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            } else {
                break;
            }
        }
        self.order.push_back(key.clone());
        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            let k = self.order.remove(pos).expect("position just found");
            self.order.push_back(k);
        }
    }

    fn remove(&mut self, key: &str) {
        self.entries.remove(key);
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply new limits, trimming as needed. Existing entries keep their
    /// insertion times.
    pub fn reconfigure(&mut self, max_size: usize, max_age: Duration) {
        self.max_size = max_size.max(1);
        self.max_age = max_age;
        while self.entries.len() > self.max_size {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::RiskLevel;

    fn verdict(intent: &str) -> Classification {
        Classification {
            intent: intent.into(),
            action: None,
            project: None,
            company: None,
            confidence: 0.9,
            ambiguous: false,
            risk: RiskLevel::Low,
            requires_confirmation: false,
            alternatives: vec![],
            clarifying_questions: vec![],
            confidence_factors: HashMap::new(),
        }
    }

    #[test]
    fn test_key_normalizes_whitespace_and_case() {
        assert_eq!(
            ClassificationCache::key("  Deploy   The API ", Some("api")),
            "api::deploy the api"
        );
        assert_eq!(ClassificationCache::key("hello", None), "hello");
    }

    #[test]
    fn test_hit_within_ttl() {
        let mut cache = ClassificationCache::new(10, Duration::from_secs(60));
        cache.insert("k".into(), verdict("deploy"));
        assert_eq!(cache.get("k").unwrap().intent, "deploy");
    }

    #[test]
    fn test_expired_entry_evicted_on_lookup() {
        let mut cache = ClassificationCache::new(10, Duration::from_millis(1));
        cache.insert("k".into(), verdict("deploy"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_zero_ttl_disables_caching() {
        let mut cache = ClassificationCache::new(10, Duration::ZERO);
        cache.insert("k".into(), verdict("deploy"));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn test_lru_eviction_order() {
        let mut cache = ClassificationCache::new(2, Duration::from_secs(60));
        cache.insert("a".into(), verdict("a"));
        cache.insert("b".into(), verdict("b"));
        // Refresh "a" so "b" is now least recent.
        cache.get("a");
        cache.insert("c".into(), verdict("c"));

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_reconfigure_trims() {
        let mut cache = ClassificationCache::new(5, Duration::from_secs(60));
        for i in 0..5 {
            cache.insert(format!("k{i}"), verdict("x"));
        }
        cache.reconfigure(2, Duration::from_secs(60));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("k4").is_some());
    }
}
