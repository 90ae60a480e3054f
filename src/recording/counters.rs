//! Process-wide drop and overflow counters.
//!
//! Sample-plane failures never surface as errors; they are visible only
//! here. Control-plane failures go through `RecorderError` instead.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum Counter {
    DictionaryOverflow = 0,
    LivenessTableFull = 1,
    LivenessWeakRefFailed = 2,
    ContextStoragePages = 3,
    ContextStorageBytes = 4,
    DroppedSamples = 5,
}

const COUNTER_COUNT: usize = 6;
const NAMES: [&str; COUNTER_COUNT] = [
    "dictionary_overflow",
    "liveness_table_full",
    "liveness_weak_ref_failed",
    "context_storage_pages",
    "context_storage_bytes",
    "dropped_samples",
];

const ZERO: AtomicU64 = AtomicU64::new(0);
static COUNTERS: [AtomicU64; COUNTER_COUNT] = [ZERO; COUNTER_COUNT];

pub fn increment(counter: Counter) {
    add(counter, 1);
}

pub fn add(counter: Counter, delta: u64) {
    COUNTERS[counter as usize].fetch_add(delta, Ordering::Relaxed);
}

pub fn value(counter: Counter) -> u64 {
    COUNTERS[counter as usize].load(Ordering::Relaxed)
}

pub fn snapshot() -> Vec<(&'static str, u64)> {
    NAMES
        .iter()
        .zip(COUNTERS.iter())
        .map(|(name, c)| (*name, c.load(Ordering::Relaxed)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_and_snapshot() {
        let before = value(Counter::ContextStoragePages);
        increment(Counter::ContextStoragePages);
        add(Counter::ContextStoragePages, 2);
        assert_eq!(value(Counter::ContextStoragePages), before + 3);
        let snap = snapshot();
        assert!(snap
            .iter()
            .any(|(name, v)| *name == "context_storage_pages" && *v >= before + 3));
    }
}
