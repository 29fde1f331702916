use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// Deduplication cache for inbound message ids. The platform re-pushes
/// events it considers unacknowledged for up to ~7 hours; ids seen within
/// the retention window are dropped silently.
pub struct DedupCache {
    entries: RwLock<HashMap<String, Instant>>,
    retention: Duration,
    max_entries: usize,
}

impl Default for DedupCache {
    fn default() -> Self {
        DedupCache::new(Duration::from_secs(8 * 60 * 60), 10_000)
    }
}

impl DedupCache {
    pub fn new(retention: Duration, max_entries: usize) -> DedupCache {
        DedupCache { entries: RwLock::new(HashMap::new()), retention, max_entries }
    }

    pub fn is_processed(&self, message_id: &str) -> bool {
        let seen_at = {
            let entries = self.entries.read().expect("dedup lock poisoned");
            entries.get(message_id).copied()
        };
        match seen_at {
            Some(seen_at) if seen_at.elapsed() <= self.retention => true,
            Some(_) => {
                self.entries.write().expect("dedup lock poisoned").remove(message_id);
                false
            }
            None => false,
        }
    }

    /// Records an id, evicting expired entries when the cap is exceeded.
    pub fn mark_processed(&self, message_id: &str) {
        let mut entries = self.entries.write().expect("dedup lock poisoned");
        entries.insert(message_id.to_string(), Instant::now());
        if entries.len() > self.max_entries {
            let retention = self.retention;
            entries.retain(|_, seen_at| seen_at.elapsed() <= retention);
        }
    }

    pub fn prune(&self) {
        let mut entries = self.entries.write().expect("dedup lock poisoned");
        let retention = self.retention;
        entries.retain(|_, seen_at| seen_at.elapsed() <= retention);
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("dedup lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Background prune loop, every five minutes for the process lifetime.
    pub fn spawn_pruner(self: &Arc<Self>) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5 * 60));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                cache.prune();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_id_within_retention_is_processed() {
        let cache = DedupCache::default();
        assert!(!cache.is_processed("m1"));
        cache.mark_processed("m1");
        assert!(cache.is_processed("m1"));
        assert!(!cache.is_processed("m2"));
    }

    #[test]
    fn expired_ids_are_forgotten() {
        let cache = DedupCache::new(Duration::from_millis(0), 10);
        cache.mark_processed("m1");
        std::thread::sleep(Duration::from_millis(2));
        assert!(!cache.is_processed("m1"));
        assert!(cache.is_empty(), "expired lookup also evicts");
    }

    #[test]
    fn over_capacity_insert_evicts_expired_entries() {
        let cache = DedupCache::new(Duration::from_millis(0), 2);
        cache.mark_processed("m1");
        cache.mark_processed("m2");
        std::thread::sleep(Duration::from_millis(2));
        cache.mark_processed("m3");
        assert!(cache.len() <= 1, "expired entries evicted on overflow");
    }
}
