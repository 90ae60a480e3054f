//! Set of thread ids observed during the current recording.
//!
//! A paged atomic bitmap: pages materialize on first touch, bits are set
//! with `fetch_or`, so `add` and `accept` are safe from any event path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

const BITS_PER_WORD: usize = 64;
const PAGE_WORDS: usize = 1024;
const TIDS_PER_PAGE: usize = PAGE_WORDS * BITS_PER_WORD;
const MAX_PAGES: usize = 16;

type Page = Box<[AtomicU64]>;

pub struct ThreadFilter {
    pages: [OnceLock<Page>; MAX_PAGES],
}

impl ThreadFilter {
    pub fn new() -> Self {
        Self {
            pages: std::array::from_fn(|_| OnceLock::new()),
        }
    }

    fn split(tid: i32) -> Option<(usize, usize, u32)> {
        if tid < 0 {
            return None;
        }
        let tid = tid as usize;
        let page = tid / TIDS_PER_PAGE;
        if page >= MAX_PAGES {
            return None;
        }
        let word = (tid % TIDS_PER_PAGE) / BITS_PER_WORD;
        let bit = (tid % BITS_PER_WORD) as u32;
        Some((page, word, bit))
    }

    pub fn add(&self, tid: i32) {
        let Some((page, word, bit)) = Self::split(tid) else {
            return;
        };
        let page = self.pages[page]
            .get_or_init(|| (0..PAGE_WORDS).map(|_| AtomicU64::new(0)).collect());
        page[word].fetch_or(1 << bit, Ordering::Relaxed);
    }

    pub fn accept(&self, tid: i32) -> bool {
        let Some((page, word, bit)) = Self::split(tid) else {
            return false;
        };
        match self.pages[page].get() {
            Some(page) => page[word].load(Ordering::Relaxed) & (1 << bit) != 0,
            None => false,
        }
    }

    /// All accepted tids in ascending order.
    pub fn collect(&self) -> Vec<i32> {
        let mut out = Vec::new();
        for (pi, page) in self.pages.iter().enumerate() {
            let Some(page) = page.get() else { continue };
            for (wi, word) in page.iter().enumerate() {
                let mut bits = word.load(Ordering::Relaxed);
                while bits != 0 {
                    let bit = bits.trailing_zeros() as usize;
                    out.push((pi * TIDS_PER_PAGE + wi * BITS_PER_WORD + bit) as i32);
                    bits &= bits - 1;
                }
            }
        }
        out
    }
}

impl Default for ThreadFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_then_accept() {
        let f = ThreadFilter::new();
        assert!(!f.accept(42));
        f.add(42);
        assert!(f.accept(42));
        assert!(!f.accept(43));
    }

    #[test]
    fn test_collect_sorted_across_pages() {
        let f = ThreadFilter::new();
        for tid in [70000, 3, 64, 65535, 0] {
            f.add(tid);
        }
        assert_eq!(f.collect(), vec![0, 3, 64, 65535, 70000]);
    }

    #[test]
    fn test_out_of_range_tids_ignored() {
        let f = ThreadFilter::new();
        f.add(-1);
        f.add(i32::MAX);
        assert!(!f.accept(-1));
        assert!(!f.accept(i32::MAX));
        assert!(f.collect().is_empty());
    }

    #[test]
    fn test_duplicate_add_is_single_entry() {
        let f = ThreadFilter::new();
        f.add(7);
        f.add(7);
        assert_eq!(f.collect(), vec![7]);
    }
}
