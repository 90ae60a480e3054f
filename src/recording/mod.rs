pub mod args;
pub mod buffer;
pub mod call_traces;
pub mod chunk;
pub mod context;
pub mod controller;
pub mod counters;
pub mod cpu_monitor;
pub mod dictionary;
pub mod error;
pub mod events;
pub mod frames;
pub mod jfr;
pub mod liveness;
pub mod lookup;
pub mod metadata;
pub mod method_map;
pub mod os;
pub mod reader;
pub mod runtime;
pub mod spinlock;
pub mod thread_filter;

pub use args::{Arguments, CStackMode, RingMode};
pub use chunk::{CONCURRENCY_LEVEL, LIVENESS_LANE};
pub use context::{contexts, ContextSnapshot, ContextStorage};
pub use controller::FlightRecorder;
pub use error::{RecorderError, Result};
pub use events::{
    AllocEvent, EventPayload, ExecutionEvent, LockEvent, LogLevel, ObjectLivenessEvent,
    QueueTimeEvent, TraceRootEvent, WallClockEpochEvent,
};
pub use frames::{CallFrame, FrameType, MethodId, BCI_ERROR, BCI_NATIVE_FRAME};
pub use liveness::LivenessTracker;
pub use reader::{ChunkSummary, TraceReader};
pub use runtime::{
    install_bridge, LineNumberEntry, LocalRef, MethodDetails, NativeLibrary, ObjectRef,
    RuntimeBridge, RuntimeQueryError, ThreadDetails, VmDetails, WeakRef,
};
