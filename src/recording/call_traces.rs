//! Deduplicating registry of sampled call traces.
//!
//! Collaborators register a resolved stack once per sample and get back a
//! dense trace id to carry in the event record. Registration marks the
//! trace as referenced; the chunk writer consumes the marks when it dumps
//! the stack-trace constant pool section, so each chunk defines exactly the
//! traces its events point at.
//!
//! Buckets are keyed by content hash with a short collision chain, so the
//! common re-registration of an already-known trace costs a hash and a
//! slice compare, no allocation.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use smallvec::SmallVec;

use crate::recording::frames::CallFrame;

const TRACE_BUCKETS: usize = 16;

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CallTrace {
    pub frames: Box<[CallFrame]>,
    pub truncated: bool,
}

struct TraceSlot {
    id: u32,
    marked: bool,
    trace: Arc<CallTrace>,
}

type Chain = SmallVec<[TraceSlot; 1]>;

pub struct CallTraceStorage {
    buckets: [Mutex<HashMap<u64, Chain>>; TRACE_BUCKETS],
    next_id: AtomicU32,
}

impl CallTraceStorage {
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| Mutex::new(HashMap::new())),
            next_id: AtomicU32::new(1),
        }
    }

    fn content_hash(frames: &[CallFrame], truncated: bool) -> u64 {
        let mut hasher = DefaultHasher::new();
        truncated.hash(&mut hasher);
        frames.hash(&mut hasher);
        hasher.finish()
    }

    /// Register a trace and mark it referenced, returning its id. Equal
    /// frame sequences dedup to one id for the storage lifetime.
    pub fn register(&self, frames: &[CallFrame], truncated: bool) -> u32 {
        let hash = Self::content_hash(frames, truncated);
        let mut map = self.buckets[hash as usize % TRACE_BUCKETS].lock().unwrap();
        let chain = map.entry(hash).or_default();
        for slot in chain.iter_mut() {
            if slot.trace.truncated == truncated && *slot.trace.frames == *frames {
                slot.marked = true;
                return slot.id;
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        chain.push(TraceSlot {
            id,
            marked: true,
            trace: Arc::new(CallTrace {
                frames: frames.to_vec().into_boxed_slice(),
                truncated,
            }),
        });
        id
    }

    /// Traces referenced since the previous collection, ordered by id.
    /// Clears the marks, so the next chunk starts fresh.
    pub fn collect_marked(&self) -> BTreeMap<u32, Arc<CallTrace>> {
        let mut out = BTreeMap::new();
        for bucket in &self.buckets {
            for chain in bucket.lock().unwrap().values_mut() {
                for slot in chain.iter_mut() {
                    if slot.marked {
                        slot.marked = false;
                        out.insert(slot.id, slot.trace.clone());
                    }
                }
            }
        }
        out
    }
}

impl Default for CallTraceStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::frames::CallFrame;

    fn frames(names: &[&str]) -> Vec<CallFrame> {
        names.iter().map(|n| CallFrame::native(*n)).collect()
    }

    #[test]
    fn test_register_dedups_equal_traces() {
        let storage = CallTraceStorage::new();
        let a = storage.register(&frames(&["a", "b"]), false);
        let b = storage.register(&frames(&["a", "b"]), false);
        assert_eq!(a, b);
        let c = storage.register(&frames(&["a", "b"]), true);
        assert_ne!(a, c, "truncation is part of identity");
    }

    #[test]
    fn test_collect_clears_marks() {
        let storage = CallTraceStorage::new();
        let id = storage.register(&frames(&["x"]), false);
        let first = storage.collect_marked();
        assert!(first.contains_key(&id));
        assert!(storage.collect_marked().is_empty());
        // a re-registration in the next chunk marks it again
        assert_eq!(storage.register(&frames(&["x"]), false), id);
        assert!(storage.collect_marked().contains_key(&id));
    }

    #[test]
    fn test_collect_is_ordered() {
        let storage = CallTraceStorage::new();
        for i in 0..20 {
            storage.register(&frames(&[&format!("f{i}")]), false);
        }
        let ids: Vec<u32> = storage.collect_marked().keys().copied().collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
        assert_eq!(ids.len(), 20);
    }

    #[test]
    fn test_concurrent_registration_agrees() {
        let storage = std::sync::Arc::new(CallTraceStorage::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let storage = storage.clone();
            handles.push(std::thread::spawn(move || {
                (0..50)
                    .map(|i| storage.register(&frames(&[&format!("f{i}")]), false))
                    .collect::<Vec<u32>>()
            }));
        }
        let results: Vec<Vec<u32>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for ids in &results[1..] {
            assert_eq!(ids, &results[0]);
        }
        assert_eq!(storage.collect_marked().len(), 50);
    }
}
