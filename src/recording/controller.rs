//! Process-wide recording controller.
//!
//! One read-biased spin lock arbitrates the control plane against the
//! sampling paths. The lock is born held: while no recording is active it
//! stays exclusively owned, so `try_lock_shared` on every event path
//! doubles as the activity check and failing it means "drop the sample".
//! `start` releases the lock once the recording exists; `stop` and `dump`
//! re-acquire it exclusively, which waits out in-flight samplers (each
//! bounded by one event emission) before touching the recording.
//!
//! Control-plane calls (`start`, `stop`, `dump`, `flush`) come from the one
//! controller thread; the sampling API and `timer_tick` may come from
//! anywhere, including signal handlers.

use std::cell::UnsafeCell;
use std::fs::OpenOptions;
use std::sync::OnceLock;

use tracing::warn;

use crate::recording::args::Arguments;
use crate::recording::chunk::Recording;
use crate::recording::error::{RecorderError, Result};
use crate::recording::events::{
    EventPayload, LogLevel, QueueTimeEvent, TraceRootEvent, WallClockEpochEvent,
};
use crate::recording::frames::CallFrame;
use crate::recording::liveness::LivenessTracker;
use crate::recording::spinlock::RwSpinLock;

struct RecState {
    rec: Option<Recording>,
    filename: Option<String>,
    args: Arguments,
}

pub struct FlightRecorder {
    lock: RwSpinLock,
    state: UnsafeCell<RecState>,
}

// SAFETY: `state` is read under the shared lock and mutated only under the
// exclusive lock; the lock protocol below upholds that.
unsafe impl Sync for FlightRecorder {}

impl FlightRecorder {
    pub fn instance() -> &'static FlightRecorder {
        static INSTANCE: OnceLock<FlightRecorder> = OnceLock::new();
        INSTANCE.get_or_init(|| FlightRecorder {
            lock: RwSpinLock::new_locked(),
            state: UnsafeCell::new(RecState {
                rec: None,
                filename: None,
                args: Arguments::default(),
            }),
        })
    }

    /// Run `f` against the active recording under a shared acquisition.
    /// Returns None without blocking when no recording is active.
    fn with_shared<R>(&self, f: impl FnOnce(&Recording) -> R) -> Option<R> {
        if !self.lock.try_lock_shared() {
            return None;
        }
        // SAFETY: shared holders only read; mutation requires the
        // exclusive lock, which cannot be taken while we hold shared.
        let state = unsafe { &*self.state.get() };
        let out = state.rec.as_ref().map(f);
        self.lock.unlock_shared();
        out
    }

    /// Open or create the output file and build a recording into it.
    fn new_recording(state: &mut RecState, reset: bool) -> Result<()> {
        let path = state
            .filename
            .clone()
            .ok_or(RecorderError::MissingOutputFile)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(reset)
            .open(&path)
            .map_err(|source| RecorderError::OutputFile {
                path: path.clone(),
                source,
            })?;
        let rec = Recording::new(file, &state.args).map_err(|source| {
            RecorderError::OutputFile { path, source }
        })?;
        state.rec = Some(rec);
        Ok(())
    }

    /// Begin recording. Fails if the output file is unspecified or
    /// unopenable, or when a recording is already active.
    pub fn start(&self, args: Arguments, reset: bool) -> Result<()> {
        if args.file.as_deref().unwrap_or("").is_empty() {
            return Err(RecorderError::MissingOutputFile);
        }
        // SAFETY: the exclusive lock has been held since construction or
        // the last stop; if it is not (active recording), bail out before
        // touching the state.
        if self.lock.try_lock_shared() {
            self.lock.unlock_shared();
            return Err(RecorderError::AlreadyRecording);
        }
        let state = unsafe { &mut *self.state.get() };
        state.filename = args.file.clone();
        state.args = args;

        LivenessTracker::instance().start(&state.args);

        Self::new_recording(state, reset)?;
        // the recording becomes visible to event paths here
        self.lock.unlock();
        Ok(())
    }

    /// Stop recording: wait out samplers, flush liveness, finish the chunk,
    /// close the file. The lock stays held, marking the recorder inactive.
    pub fn stop(&self) -> Result<()> {
        if !self.lock.try_lock_shared() {
            return Err(RecorderError::NotRecording);
        }
        self.lock.unlock_shared();
        self.lock.lock();
        // SAFETY: exclusive lock held.
        let state = unsafe { &mut *self.state.get() };
        if let Some(rec) = state.rec.as_ref() {
            LivenessTracker::instance().stop(rec);
        }
        if let Some(mut rec) = state.rec.take() {
            rec.finish();
        }
        Ok(())
    }

    /// Rotate the current chunk in place.
    pub fn flush(&self) -> Result<()> {
        if !self.lock.try_lock_shared() {
            return Err(RecorderError::NotRecording);
        }
        self.lock.unlock_shared();
        self.lock.lock();
        // SAFETY: exclusive lock held.
        let state = unsafe { &mut *self.state.get() };
        let result = match state.rec.as_mut() {
            Some(rec) => {
                rec.switch_chunk();
                Ok(())
            }
            None => Err(RecorderError::NotRecording),
        };
        self.lock.unlock();
        result
    }

    /// Dump the recording. With a foreign path, the bytes recorded so far
    /// move there and the recording restarts into a truncated original
    /// file; with the same path or none, the chunk is rotated in place.
    pub fn dump(&self, filename: Option<&str>) -> Result<()> {
        if !self.lock.try_lock_shared() {
            return Err(RecorderError::NotRecording);
        }
        self.lock.unlock_shared();
        self.lock.lock();
        // SAFETY: exclusive lock held.
        let state = unsafe { &mut *self.state.get() };
        let result = Self::dump_locked(state, filename);
        if state.rec.is_some() {
            self.lock.unlock();
        } else {
            // reopening failed; stay exclusively held, i.e. inactive
            warn!("recording could not be restarted after dump");
        }
        result
    }

    fn dump_locked(state: &mut RecState, filename: Option<&str>) -> Result<()> {
        match filename {
            Some(target) if state.filename.as_deref() != Some(target) => {
                let target_file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(target)
                    .map_err(|source| RecorderError::OutputFile {
                        path: target.to_string(),
                        source,
                    })?;
                match state.rec.as_mut() {
                    Some(rec) => {
                        let _ = rec.copy_to(&target_file);
                    }
                    None => return Err(RecorderError::NotRecording),
                }
                state.rec = None;
                Self::new_recording(state, true)
            }
            _ => match state.rec.as_mut() {
                Some(rec) => {
                    rec.switch_chunk();
                    Ok(())
                }
                None => Err(RecorderError::NotRecording),
            },
        }
    }

    /// Controller tick: advance the CPU-load monitor and report whether the
    /// rotation policy wants a chunk switch. Returns false when inactive.
    pub fn timer_tick(&self, wall_now_micros: u64) -> bool {
        self.with_shared(|rec| {
            rec.cpu_monitor_cycle();
            rec.need_switch_chunk(wall_now_micros)
        })
        .unwrap_or(false)
    }

    // ---- sampling collaborator API; all drop the event when inactive ----

    pub fn record_event(&self, lane: usize, tid: i32, call_trace_id: u32, event: &EventPayload) {
        self.with_shared(|rec| rec.record_event(lane, tid, call_trace_id, event));
    }

    pub fn record_trace_root(&self, lane: usize, tid: i32, event: &TraceRootEvent) {
        self.with_shared(|rec| rec.record_trace_root(lane, tid, event));
    }

    pub fn record_queue_time(&self, lane: usize, tid: i32, event: &QueueTimeEvent) {
        self.with_shared(|rec| rec.record_queue_time(lane, tid, event));
    }

    pub fn record_wallclock_epoch(&self, lane: usize, event: &WallClockEpochEvent) {
        self.with_shared(|rec| rec.record_wallclock_epoch(lane, event));
    }

    pub fn record_log(&self, level: LogLevel, message: &str) {
        self.with_shared(|rec| rec.record_log(level, message));
    }

    /// Register a resolved stack, returning the trace id to carry in
    /// events. None when no recording is active.
    pub fn register_call_trace(&self, frames: &[CallFrame], truncated: bool) -> Option<u32> {
        self.with_shared(|rec| rec.register_call_trace(frames, truncated))
    }

    /// Intern a class name for allocation and lock event payloads.
    pub fn intern_class(&self, name: &str) -> Option<u32> {
        self.with_shared(|rec| rec.intern_class(name))
    }

    /// Intern a label for trace-root and queue-time event payloads.
    pub fn intern_string(&self, s: &str) -> Option<u32> {
        self.with_shared(|rec| rec.intern_string(s))
    }

    /// GC-notification entry point for runtime callback threads.
    pub fn on_gc(&self) {
        LivenessTracker::instance().on_gc();
    }
}
