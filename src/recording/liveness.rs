//! Object-liveness tracking.
//!
//! Allocation samples are pinned with weak global references and reconciled
//! against GC notifications: the notification hook only bumps an epoch
//! counter, and the next cleanup pass ages survivors by the number of
//! epochs that went by and drops entries whose referent was collected. The
//! tracker is a process singleton that survives recordings, because the
//! weak references stay valid only while they are not discarded.
//!
//! Insertion reserves a slot with a CAS on the table size under the shared
//! table lock, so reservation order equals insertion order; resize and
//! compaction take the lock exclusively and never invalidate reservations
//! in flight.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use tracing::{debug, warn};

use crate::recording::args::Arguments;
use crate::recording::chunk::{Recording, LIVENESS_LANE};
use crate::recording::context::contexts;
use crate::recording::counters::{self, Counter};
use crate::recording::events::{AllocEvent, EventPayload, ObjectLivenessEvent};
use crate::recording::frames::CallFrame;
use crate::recording::os;
use crate::recording::runtime::{self, ObjectRef, WeakRef};
use crate::recording::spinlock::RwSpinLock;

pub const MAX_TRACKING_TABLE_SIZE: u32 = 131_072;
const INITIAL_TABLE_CAPACITY: u32 = 2048;
const MIN_RUNTIME_VERSION: u32 = 11;

struct TrackingEntry {
    tid: i32,
    time_ticks: u64,
    weak: WeakRef,
    /// Allocation snapshot; its context field carries the thread's trace
    /// correlation ids captured at sample time.
    alloc: AllocEvent,
    age: u64,
    frames: Box<[CallFrame]>,
}

type Slot = Mutex<Option<TrackingEntry>>;

pub struct LivenessTracker {
    lock: RwSpinLock,
    /// Reallocated only under the exclusive lock; slots are individually
    /// locked so a reader never observes a half-written entry.
    slots: UnsafeCell<Vec<Slot>>,
    size: AtomicU32,
    capacity: AtomicU32,
    /// 0 means the tracker is disabled.
    max_capacity: AtomicU32,
    gc_epoch: AtomicU64,
    last_gc_epoch: AtomicU64,
    used_after_last_gc: AtomicU64,
    record_heap_usage: AtomicBool,
    initialized: AtomicBool,
}

// SAFETY: the slot vector is reallocated only under the exclusive lock and
// indexed under at least the shared lock; entry contents are behind
// per-slot mutexes.
unsafe impl Sync for LivenessTracker {}
unsafe impl Send for LivenessTracker {}

impl LivenessTracker {
    pub fn new() -> Self {
        Self {
            lock: RwSpinLock::new(),
            slots: UnsafeCell::new(Vec::new()),
            size: AtomicU32::new(0),
            capacity: AtomicU32::new(0),
            max_capacity: AtomicU32::new(0),
            gc_epoch: AtomicU64::new(0),
            last_gc_epoch: AtomicU64::new(0),
            used_after_last_gc: AtomicU64::new(0),
            record_heap_usage: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn instance() -> &'static LivenessTracker {
        static INSTANCE: OnceLock<LivenessTracker> = OnceLock::new();
        INSTANCE.get_or_init(LivenessTracker::new)
    }

    pub fn is_enabled(&self) -> bool {
        self.max_capacity.load(Ordering::Acquire) > 0
    }

    pub fn tracked_count(&self) -> u32 {
        self.size.load(Ordering::Acquire)
    }

    /// Sticky first-call initialization: later recordings reuse whatever
    /// the first one decided, so tracked objects stay valid across them.
    fn initialize(&self, args: &Arguments) {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return;
        }
        if args.memleak <= 0 {
            return;
        }
        let Some(bridge) = runtime::bridge() else {
            warn!("liveness tracking requires a runtime bridge");
            return;
        };
        if bridge.runtime_version() < MIN_RUNTIME_VERSION {
            warn!(
                version = bridge.runtime_version(),
                required = MIN_RUNTIME_VERSION,
                "liveness tracking disabled: runtime too old"
            );
            return;
        }
        let Some(max_heap) = bridge.max_heap_bytes() else {
            warn!("liveness tracking disabled: no heap size information");
            return;
        };

        let interval = (args.memleak as u64).max(1);
        let required = (max_heap / interval).min(u64::from(u32::MAX)) as u32;
        if required > MAX_TRACKING_TABLE_SIZE {
            warn!(
                interval,
                "liveness tracking table cannot cover the full heap at this interval"
            );
        }
        let mut max_cap = required.clamp(1, MAX_TRACKING_TABLE_SIZE);
        if args.memleak_cap > 0 {
            max_cap = max_cap.min(args.memleak_cap as u32);
        }
        let cap = INITIAL_TABLE_CAPACITY.min(max_cap);

        self.lock.lock();
        // SAFETY: exclusive lock, sole access to the slot vector.
        unsafe {
            (*self.slots.get()).resize_with(cap as usize, || Mutex::new(None));
        }
        self.capacity.store(cap, Ordering::Release);
        self.lock.unlock();

        self.size.store(0, Ordering::Release);
        self.gc_epoch.store(0, Ordering::Release);
        self.last_gc_epoch.store(0, Ordering::Release);
        self.record_heap_usage
            .store(args.record_heap_usage, Ordering::Relaxed);
        self.max_capacity.store(max_cap, Ordering::Release);
    }

    pub fn start(&self, args: &Arguments) {
        self.initialize(args);
        if self.is_enabled() {
            if let Some(bridge) = runtime::bridge() {
                if !bridge.enable_gc_notifications() {
                    warn!("could not enable GC notifications, disabling liveness tracking");
                    self.max_capacity.store(0, Ordering::Release);
                }
            }
        }
    }

    /// Emit what is still live, then leave the table intact: GC
    /// notifications stay enabled because the tracker spans recordings.
    pub fn stop(&self, rec: &Recording) {
        self.cleanup();
        self.flush(rec);
    }

    /// Pin an allocation sample. The frames are deep-copied; the caller
    /// keeps ownership of its scratch.
    pub fn track(&self, tid: i32, mut event: AllocEvent, object: ObjectRef, frames: &[CallFrame]) {
        if !self.is_enabled() {
            return;
        }
        let Some(bridge) = runtime::bridge() else {
            return;
        };
        let Some(weak) = bridge.new_weak_ref(object) else {
            counters::increment(Counter::LivenessWeakRefFailed);
            return;
        };
        event.context = contexts().get(tid);

        let mut weak = Some(weak);
        let mut retried = false;
        loop {
            if !self.lock.try_lock_shared() {
                if let Some(w) = weak.take() {
                    bridge.release_weak(w);
                }
                counters::increment(Counter::DroppedSamples);
                return;
            }
            let cap = self.capacity.load(Ordering::Acquire);
            let mut idx = self.size.load(Ordering::Relaxed);
            loop {
                if idx >= cap {
                    break;
                }
                match self.size.compare_exchange_weak(
                    idx,
                    idx + 1,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(current) => idx = current,
                }
            }
            if idx < cap {
                if let Some(weak_ref) = weak.take() {
                    let entry = TrackingEntry {
                        tid,
                        time_ticks: os::ticks(),
                        weak: weak_ref,
                        alloc: event,
                        age: 0,
                        frames: frames.to_vec().into_boxed_slice(),
                    };
                    // SAFETY: shared lock held, so the vector is stable;
                    // the CAS above reserved this index exclusively.
                    let slots = unsafe { &*self.slots.get() };
                    *slots[idx as usize].lock().unwrap() = Some(entry);
                }
                self.lock.unlock_shared();
                return;
            }
            self.lock.unlock_shared();

            if retried {
                break;
            }
            retried = true;
            // cleanup has a good chance of freeing slots without a resize
            self.cleanup();
            let cap = self.capacity.load(Ordering::Acquire);
            let max = self.max_capacity.load(Ordering::Acquire);
            if cap >= max {
                break;
            }
            self.lock.lock();
            let new_cap = (cap * 2).min(max);
            if self.capacity.load(Ordering::Relaxed) < new_cap {
                // SAFETY: exclusive lock, no reservations in flight.
                unsafe {
                    (*self.slots.get()).resize_with(new_cap as usize, || Mutex::new(None));
                }
                self.capacity.store(new_cap, Ordering::Release);
                debug!(capacity = new_cap, "grew liveness tracking table");
            }
            self.lock.unlock();
        }

        if let Some(w) = weak.take() {
            bridge.release_weak(w);
        }
        counters::increment(Counter::LivenessTableFull);
    }

    /// GC-notification hook: cheap by design, the heavy lifting waits for
    /// the next cleanup pass.
    pub fn on_gc(&self) {
        if !self.initialized.load(Ordering::Acquire) {
            return;
        }
        self.gc_epoch.fetch_add(1, Ordering::AcqRel);
        if let Some(bridge) = runtime::bridge() {
            if bridge.used_after_last_gc().is_none() {
                self.used_after_last_gc
                    .store(bridge.heap_used_bytes(), Ordering::Release);
            }
        }
    }

    /// Reconcile the table with completed GC epochs. The CAS on
    /// `last_gc_epoch` serializes concurrent cleanups; losers return.
    pub fn cleanup(&self) {
        let current = self.last_gc_epoch.load(Ordering::Acquire);
        let target = self.gc_epoch.load(Ordering::Acquire);
        if target == current
            || self
                .last_gc_epoch
                .compare_exchange(current, target, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
        {
            return;
        }
        let Some(bridge) = runtime::bridge() else {
            return;
        };
        let started = os::ticks();

        self.lock.lock();
        let epoch_delta = target - current;
        let size = self.size.load(Ordering::Acquire) as usize;
        // SAFETY: exclusive lock, sole access to slots and entries.
        let slots = unsafe { &mut *self.slots.get() };
        let mut kept = 0usize;
        for i in 0..size {
            let Some(mut entry) = slots[i].get_mut().unwrap().take() else {
                continue;
            };
            if let Some(local) = bridge.promote(&entry.weak) {
                bridge.release_local(local);
                entry.age += epoch_delta;
                *slots[kept].get_mut().unwrap() = Some(entry);
                kept += 1;
            } else {
                let TrackingEntry { weak, .. } = entry;
                bridge.release_weak(weak);
            }
        }
        self.size.store(kept as u32, Ordering::Release);
        self.lock.unlock();

        debug!(
            scanned = size,
            kept,
            elapsed_ns = os::ticks().saturating_sub(started),
            "liveness cleanup"
        );
    }

    /// Emit a HeapLiveObject event for every still-live tracked object,
    /// cleaning up first so as few stale entries as possible slip through.
    pub fn flush(&self, rec: &Recording) {
        if !self.is_enabled() {
            return;
        }
        let Some(bridge) = runtime::bridge() else {
            return;
        };
        self.cleanup();
        let started = os::ticks();

        self.lock.lock_shared();
        let size = self.size.load(Ordering::Acquire) as usize;
        // SAFETY: shared lock held, so the vector is stable; entry access
        // goes through the per-slot mutex.
        let slots = unsafe { &*self.slots.get() };
        for slot in slots.iter().take(size) {
            let guard = slot.lock().unwrap();
            let Some(entry) = guard.as_ref() else { continue };
            let Some(local) = bridge.promote(&entry.weak) else {
                continue;
            };
            let class_id = bridge
                .object_class_name(&local)
                .map(|name| rec.intern_class(&name))
                .unwrap_or(0);
            bridge.release_local(local);
            let trace_id = rec.register_call_trace(&entry.frames, false);
            let event = ObjectLivenessEvent {
                start_ticks: entry.time_ticks,
                age: entry.age,
                class_id,
                instance_size: entry.alloc.instance_size,
                interval: entry.alloc.total_size,
            };
            rec.record_event(LIVENESS_LANE, entry.tid, trace_id, &EventPayload::Liveness(event));
        }
        self.lock.unlock_shared();

        if self.record_heap_usage.load(Ordering::Relaxed) {
            let (used, after_last_gc) = match bridge.used_after_last_gc() {
                Some(used) if used > 0 => (used, true),
                _ => {
                    let snapshot = self.used_after_last_gc.load(Ordering::Acquire);
                    if snapshot > 0 {
                        (snapshot, true)
                    } else {
                        (bridge.heap_used_bytes(), false)
                    }
                }
            };
            rec.record_heap_usage(used, after_last_gc);
        }

        debug!(
            elapsed_ns = os::ticks().saturating_sub(started),
            "liveness flush"
        );
    }
}

impl Default for LivenessTracker {
    fn default() -> Self {
        Self::new()
    }
}
