//! Event payloads supplied by sampling collaborators.
//!
//! The event set is closed: every sample-plane record the recorder can emit
//! is a variant of `EventPayload`, dispatched by the chunk writer to its
//! encoder. Payload structs carry already-resolved data only (dictionary
//! ids, ticks, context snapshots), so encoding never allocates.

use crate::recording::context::ContextSnapshot;
use crate::recording::jfr::THREAD_RUNNING;

#[derive(Clone, Copy, Debug)]
pub struct ExecutionEvent {
    pub thread_state: u32,
    /// Number of samples this event stands for.
    pub weight: u64,
    pub context: ContextSnapshot,
}

impl Default for ExecutionEvent {
    fn default() -> Self {
        Self {
            thread_state: THREAD_RUNNING,
            weight: 1,
            context: ContextSnapshot::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AllocEvent {
    /// Class dictionary id of the allocated type.
    pub class_id: u32,
    pub instance_size: u64,
    /// Bytes covered by this sample (TLAB size or sampling interval).
    pub total_size: u64,
    pub context: ContextSnapshot,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LockEvent {
    pub start_ticks: u64,
    pub end_ticks: u64,
    /// Class dictionary id of the monitor or parked object.
    pub class_id: u32,
    pub timeout_nanos: u64,
    pub address: u64,
    pub context: ContextSnapshot,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ObjectLivenessEvent {
    pub start_ticks: u64,
    /// GC epochs survived since the allocation was sampled.
    pub age: u64,
    pub class_id: u32,
    pub instance_size: u64,
    /// Bytes covered by the originating allocation sample.
    pub interval: u64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct WallClockEpochEvent {
    pub start_ticks: u64,
    pub duration_millis: u64,
    pub num_samplable_threads: u64,
    pub num_successful_samples: u64,
    pub num_failed_samples: u64,
    pub num_exited_threads: u64,
    pub num_permission_denied: u64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TraceRootEvent {
    /// String dictionary id of the endpoint label.
    pub label: u32,
    pub local_root_span_id: u64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct QueueTimeEvent {
    pub start_ticks: u64,
    pub end_ticks: u64,
    /// String dictionary ids describing the queued work.
    pub task: u32,
    pub scheduler: u32,
    pub origin: u32,
    pub queue_length: u64,
}

/// Closed set of sample-plane events routed through one recording call.
#[derive(Clone, Copy, Debug)]
pub enum EventPayload {
    Execution(ExecutionEvent),
    /// Wall-clock sample; same shape as Execution plus parallelism.
    Method(ExecutionEvent),
    AllocInNewTlab(AllocEvent),
    AllocOutsideTlab(AllocEvent),
    Liveness(ObjectLivenessEvent),
    MonitorEnter(LockEvent),
    ThreadPark(LockEvent),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum LogLevel {
    Trace = 1,
    Debug = 2,
    Info = 3,
    Warn = 4,
    Error = 5,
}

pub const LOG_LEVELS: [LogLevel; 5] = [
    LogLevel::Trace,
    LogLevel::Debug,
    LogLevel::Info,
    LogLevel::Warn,
    LogLevel::Error,
];

impl LogLevel {
    pub fn name(self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<LogLevel> {
        LOG_LEVELS
            .into_iter()
            .find(|l| l.name().eq_ignore_ascii_case(s))
    }
}
