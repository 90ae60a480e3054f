//! Interned string table with dense 32-bit ids.
//!
//! Buckets are locked individually so concurrent samplers can intern in
//! parallel; the id counter is a single atomic, which keeps ids dense and
//! assignment order global. Id 0 is reserved for "absent".

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::recording::counters::{self, Counter};

const BUCKET_COUNT: usize = 16;

/// Hard cap on distinct entries. Lookups past it return the null id and
/// bump a counter instead of growing without bound.
const DEFAULT_CAPACITY: u32 = 1 << 20;

pub struct Dictionary {
    buckets: [Mutex<HashMap<Box<str>, u32>>; BUCKET_COUNT],
    next_id: AtomicU32,
    capacity: u32,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::bounded(DEFAULT_CAPACITY)
    }

    pub fn bounded(capacity: u32) -> Self {
        Self {
            buckets: std::array::from_fn(|_| Mutex::new(HashMap::new())),
            next_id: AtomicU32::new(1),
            capacity,
        }
    }

    fn bucket(&self, s: &str) -> &Mutex<HashMap<Box<str>, u32>> {
        let mut hasher = DefaultHasher::new();
        s.hash(&mut hasher);
        &self.buckets[hasher.finish() as usize % BUCKET_COUNT]
    }

    /// Intern `s`, returning its id. Equal byte sequences always resolve to
    /// the same id for the lifetime of the dictionary.
    pub fn lookup(&self, s: &str) -> u32 {
        let mut map = self.bucket(s).lock().unwrap();
        if let Some(&id) = map.get(s) {
            return id;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if id > self.capacity {
            counters::increment(Counter::DictionaryOverflow);
            return 0;
        }
        map.insert(Box::from(s), id);
        id
    }

    pub fn len(&self) -> usize {
        let assigned = self.next_id.load(Ordering::Relaxed) - 1;
        assigned.min(self.capacity) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bulk-collect id to string for constant pool emission, ordered by id.
    pub fn collect(&self) -> BTreeMap<u32, Box<str>> {
        let mut out = BTreeMap::new();
        for bucket in &self.buckets {
            for (s, &id) in bucket.lock().unwrap().iter() {
                out.insert(id, s.clone());
            }
        }
        out
    }
}

impl Default for Dictionary {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_idempotent() {
        let dict = Dictionary::new();
        let a = dict.lookup("java/lang/String");
        let b = dict.lookup("java/lang/String");
        assert_eq!(a, b);
        assert_ne!(a, 0);
    }

    #[test]
    fn test_distinct_strings_get_distinct_ids() {
        let dict = Dictionary::new();
        let a = dict.lookup("a");
        let b = dict.lookup("b");
        assert_ne!(a, b);
        assert_eq!(dict.len(), 2);
    }

    #[test]
    fn test_collect_is_ordered_and_complete() {
        let dict = Dictionary::new();
        let ids: Vec<u32> = ["x", "y", "z"].iter().map(|s| dict.lookup(s)).collect();
        let collected = dict.collect();
        assert_eq!(collected.len(), 3);
        for (s, id) in ["x", "y", "z"].iter().zip(ids) {
            assert_eq!(collected.get(&id).map(|b| &**b), Some(*s));
        }
        let keys: Vec<u32> = collected.keys().copied().collect();
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_bounded_overflow_returns_null_id() {
        let dict = Dictionary::bounded(2);
        assert_ne!(dict.lookup("a"), 0);
        assert_ne!(dict.lookup("b"), 0);
        assert_eq!(dict.lookup("c"), 0);
        // already interned entries keep resolving
        assert_ne!(dict.lookup("a"), 0);
        assert_eq!(dict.collect().len(), 2);
    }

    #[test]
    fn test_concurrent_interning_agrees() {
        use std::sync::Arc;
        let dict = Arc::new(Dictionary::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let d = dict.clone();
            handles.push(std::thread::spawn(move || {
                (0..100).map(|i| d.lookup(&format!("s{i}"))).collect::<Vec<_>>()
            }));
        }
        let results: Vec<Vec<u32>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for ids in &results[1..] {
            assert_eq!(ids, &results[0]);
        }
        assert_eq!(dict.len(), 100);
    }
}
