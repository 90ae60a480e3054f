//! Spin locks for the recording fast path.
//!
//! Event encoders can run from signal handlers, so nothing here allocates or
//! parks a thread. Exclusive acquisitions spin; they are taken only on the
//! control plane where the longest wait is one in-flight event emission.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// Read-biased spin lock with the recorder's idle/active protocol.
///
/// State: 0 free, -1 exclusive, n > 0 shared holders. `new_locked`
/// constructs the lock already held exclusively; the guarded resource stays
/// invisible to `try_lock_shared` until the owner releases it.
pub struct RwSpinLock {
    state: AtomicI32,
}

impl RwSpinLock {
    pub const fn new() -> Self {
        Self {
            state: AtomicI32::new(0),
        }
    }

    pub const fn new_locked() -> Self {
        Self {
            state: AtomicI32::new(-1),
        }
    }

    /// Spin until exclusive. Waits out all shared holders.
    pub fn lock(&self) {
        loop {
            if self
                .state
                .compare_exchange_weak(0, -1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            std::hint::spin_loop();
        }
    }

    pub fn unlock(&self) {
        self.state.store(0, Ordering::Release);
    }

    /// Non-blocking shared acquisition. Fails while the lock is held
    /// exclusively, which on the event path means the recorder is inactive
    /// and the sample must be dropped.
    pub fn try_lock_shared(&self) -> bool {
        let mut s = self.state.load(Ordering::Relaxed);
        while s >= 0 {
            match self
                .state
                .compare_exchange_weak(s, s + 1, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(cur) => s = cur,
            }
        }
        false
    }

    pub fn lock_shared(&self) {
        while !self.try_lock_shared() {
            std::hint::spin_loop();
        }
    }

    pub fn unlock_shared(&self) {
        self.state.fetch_sub(1, Ordering::Release);
    }
}

impl Default for RwSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Minimal spin mutex used for the per-lane buffers.
pub struct SpinLock<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

// SAFETY: the guard hands out at most one &mut T at a time.
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> SpinGuard<'_, T> {
        while self.locked.swap(true, Ordering::Acquire) {
            std::hint::spin_loop();
        }
        SpinGuard { lock: self }
    }
}

pub struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: holding the guard means the swap above observed false.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above, the guard is the unique holder.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_starts_locked_rejects_readers() {
        let lock = RwSpinLock::new_locked();
        assert!(!lock.try_lock_shared());
        lock.unlock();
        assert!(lock.try_lock_shared());
        lock.unlock_shared();
    }

    #[test]
    fn test_shared_holders_stack() {
        let lock = RwSpinLock::new();
        assert!(lock.try_lock_shared());
        assert!(lock.try_lock_shared());
        lock.unlock_shared();
        lock.unlock_shared();
        lock.lock();
        assert!(!lock.try_lock_shared());
        lock.unlock();
    }

    #[test]
    fn test_exclusive_waits_for_readers() {
        let lock = Arc::new(RwSpinLock::new());
        assert!(lock.try_lock_shared());
        let l2 = lock.clone();
        let t = std::thread::spawn(move || {
            l2.lock();
            l2.unlock();
        });
        // give the writer a moment to start spinning, then release
        std::thread::sleep(std::time::Duration::from_millis(10));
        lock.unlock_shared();
        t.join().unwrap();
    }

    #[test]
    fn test_spin_mutex_counts() {
        let lock = Arc::new(SpinLock::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let l = lock.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    *l.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 4000);
    }
}
