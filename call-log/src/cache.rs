// Bounded in-process cache of recent call records, used by the invocation
// framework to answer "what happened to call X" without going to the server.
//
// Eviction policy: least frequently used first; among equally used entries the
// one with the oldest last access goes first.
use crate::record::CallRecord;
use parking_lot::Mutex;
use std::collections::HashMap;

pub struct CallLogCache {
    capacity: usize,
    entries: Mutex<HashMap<String, CallRecord>>,
}

impl CallLogCache {
    pub fn new(capacity: usize) -> Self {
        CallLogCache {
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, record: CallRecord) -> Option<CallRecord> {
        self.insert_at(record, crate::now_epoch_ms())
    }

    /// Inserts `record`, returning the entry evicted to make room, if any.
    /// Re-inserting a known call id replaces the record but keeps its
    /// access frequency.
    pub fn insert_at(&self, mut record: CallRecord, now_ms: u64) -> Option<CallRecord> {
        let mut entries = self.entries.lock();

        if let Some(existing) = entries.get(&record.call_id) {
            record.frequency = existing.frequency;
        }
        record.last_access_time = now_ms;

        let mut evicted = None;
        if !entries.contains_key(&record.call_id) && entries.len() >= self.capacity {
            evicted = Self::victim(&entries).and_then(|key| entries.remove(&key));
        }

        entries.insert(record.call_id.clone(), record);
        evicted
    }

    pub fn get(&self, call_id: &str) -> Option<CallRecord> {
        self.get_at(call_id, crate::now_epoch_ms())
    }

    /// Returns a copy of the record and counts the access.
    pub fn get_at(&self, call_id: &str, now_ms: u64) -> Option<CallRecord> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(call_id)?;
        entry.frequency += 1;
        entry.last_access_time = now_ms;
        Some(entry.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn victim(entries: &HashMap<String, CallRecord>) -> Option<String> {
        entries
            .values()
            .min_by(|a, b| {
                a.frequency
                    .cmp(&b.frequency)
                    .then(a.last_access_time.cmp(&b.last_access_time))
                    .then_with(|| a.call_id.cmp(&b.call_id))
            })
            .map(|r| r.call_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::CallStatus;

    fn record(id: &str) -> CallRecord {
        let mut r = CallRecord::new("op", "model", CallStatus::Success);
        r.call_id = id.to_string();
        r
    }

    #[test]
    fn test_evicts_least_frequently_used() {
        let cache = CallLogCache::new(2);
        cache.insert_at(record("a"), 1);
        cache.insert_at(record("b"), 2);

        // "a" is read twice, "b" once, so "b" is the victim despite being newer.
        cache.get_at("a", 3);
        cache.get_at("a", 4);
        cache.get_at("b", 5);

        let evicted = cache.insert_at(record("c"), 6).unwrap();
        assert_eq!(evicted.call_id, "b");
        assert!(cache.get_at("a", 7).is_some());
        assert!(cache.get_at("c", 8).is_some());
    }

    #[test]
    fn test_frequency_tie_evicts_oldest_access() {
        let cache = CallLogCache::new(2);
        cache.insert_at(record("a"), 10);
        cache.insert_at(record("b"), 20);
        cache.get_at("b", 30);
        cache.get_at("a", 40);

        // Same frequency; "b" was last touched at 30, before "a" at 40.
        let evicted = cache.insert_at(record("c"), 50).unwrap();
        assert_eq!(evicted.call_id, "b");
    }

    #[test]
    fn test_reinsert_keeps_frequency() {
        let cache = CallLogCache::new(1);
        cache.insert_at(record("a"), 1);
        cache.get_at("a", 2);

        assert!(cache.insert_at(record("a"), 3).is_none());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get_at("a", 4).unwrap().frequency, 2);
    }
}
