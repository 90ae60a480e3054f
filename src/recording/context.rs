//! Per-thread trace correlation pages.
//!
//! Pages are shared with collaborator code that tags threads with span ids,
//! so readers cannot take a lock. A read is validated instead: the stored
//! checksum is `span_id XOR root_span_id`, and a snapshot whose fields do
//! not satisfy it is discarded as torn.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use serde::Serialize;

use crate::recording::counters::{self, Counter};

pub const CONTEXT_PAGE_SHIFT: usize = 10;
pub const CONTEXT_PAGE_SIZE: usize = 1 << CONTEXT_PAGE_SHIFT;
const CONTEXT_PAGE_MASK: usize = CONTEXT_PAGE_SIZE - 1;
const MAX_PAGES: usize = 1024;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ContextSnapshot {
    pub span_id: u64,
    pub root_span_id: u64,
    pub parallelism: u64,
}

#[derive(Default)]
struct ContextSlot {
    span_id: AtomicU64,
    root_span_id: AtomicU64,
    parallelism: AtomicU64,
    checksum: AtomicU64,
}

pub struct ContextStorage {
    pages: Box<[OnceLock<Box<[ContextSlot]>>]>,
}

impl ContextStorage {
    pub fn new() -> Self {
        Self {
            pages: (0..MAX_PAGES).map(|_| OnceLock::new()).collect(),
        }
    }

    fn indices(tid: i32) -> Option<(usize, usize)> {
        if tid < 0 {
            return None;
        }
        let page = tid as usize >> CONTEXT_PAGE_SHIFT;
        if page >= MAX_PAGES {
            return None;
        }
        Some((page, tid as usize & CONTEXT_PAGE_MASK))
    }

    fn slot_init(&self, tid: i32) -> Option<&ContextSlot> {
        let (page, index) = Self::indices(tid)?;
        let page = self.pages[page].get_or_init(|| {
            counters::increment(Counter::ContextStoragePages);
            counters::add(
                Counter::ContextStorageBytes,
                (CONTEXT_PAGE_SIZE * std::mem::size_of::<ContextSlot>()) as u64,
            );
            (0..CONTEXT_PAGE_SIZE).map(|_| ContextSlot::default()).collect()
        });
        Some(&page[index])
    }

    pub fn set(&self, tid: i32, span_id: u64, root_span_id: u64, parallelism: u64) {
        let Some(slot) = self.slot_init(tid) else {
            return;
        };
        slot.parallelism.store(parallelism, Ordering::Relaxed);
        slot.span_id.store(span_id, Ordering::Relaxed);
        slot.root_span_id.store(root_span_id, Ordering::Relaxed);
        slot.checksum.store(span_id ^ root_span_id, Ordering::Release);
    }

    pub fn clear(&self, tid: i32) {
        self.set(tid, 0, 0, 0);
    }

    /// Lockless read. Torn or never-written slots yield the empty snapshot.
    pub fn get(&self, tid: i32) -> ContextSnapshot {
        let Some((page, index)) = Self::indices(tid) else {
            return ContextSnapshot::default();
        };
        let Some(page) = self.pages[page].get() else {
            return ContextSnapshot::default();
        };
        let slot = &page[index];
        let checksum = slot.checksum.load(Ordering::Acquire);
        let span_id = slot.span_id.load(Ordering::Relaxed);
        let root_span_id = slot.root_span_id.load(Ordering::Relaxed);
        if span_id ^ root_span_id == checksum {
            ContextSnapshot {
                span_id,
                root_span_id,
                parallelism: slot.parallelism.load(Ordering::Relaxed),
            }
        } else {
            ContextSnapshot::default()
        }
    }
}

impl Default for ContextStorage {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide context pages. These outlive recordings: span tags applied
/// before `start` must be visible to the first samples.
pub fn contexts() -> &'static ContextStorage {
    static CONTEXTS: OnceLock<ContextStorage> = OnceLock::new();
    CONTEXTS.get_or_init(ContextStorage::new)
}
