//! Flight-recording wire constants: chunk layout, record type ids, and the
//! constant pool section list.

pub const MAGIC: &[u8; 4] = b"FLR\0";
pub const VERSION_MAJOR: u16 = 2;
pub const VERSION_MINOR: u16 = 0;

/// Fixed chunk header length; the cpool/meta/duration fields are patched in
/// place once the chunk is finished.
pub const CHUNK_HEADER_SIZE: u64 = 68;

/// Written into the size field while a chunk is still open so readers skip
/// the incomplete tail instead of mis-parsing it.
pub const CHUNK_SIZE_PLACEHOLDER: u64 = 1024 * 1024 * 1024;

pub const MAX_STRING_LENGTH: usize = 8191;

pub const MAX_JLONG: u64 = 0x7fff_ffff_ffff_ffff;
pub const MIN_JLONG: u64 = 0x8000_0000_0000_0000;

/// Per-chunk bias OR'd into dictionary-backed ids so cross-chunk ids never
/// collide in downstream tools.
pub const BASE_ID_STEP: u64 = 0x100_0000;

pub const CHUNK_SIZE_FLOOR: u64 = 262_144;
pub const CHUNK_TIME_FLOOR_MICROS: u64 = 5_000_000;

// Record type ids. 0 and 1 are fixed by the format; the rest are assigned
// here and described by the metadata tree at the head of every chunk.
pub const T_METADATA: u32 = 0;
pub const T_CPOOL: u32 = 1;

// Field type ids used by the metadata tree.
pub const T_BOOLEAN: u32 = 4;
pub const T_FLOAT: u32 = 6;
pub const T_INT: u32 = 10;
pub const T_LONG: u32 = 11;

// Constant pool types. These double as field type ids for pool references.
pub const T_FRAME_TYPE: u32 = 24;
pub const T_THREAD_STATE: u32 = 25;
pub const T_THREAD: u32 = 26;
pub const T_STACK_TRACE: u32 = 27;
pub const T_METHOD: u32 = 28;
pub const T_CLASS: u32 = 29;
pub const T_PACKAGE: u32 = 30;
pub const T_SYMBOL: u32 = 31;
pub const T_STRING: u32 = 32;
pub const T_LOG_LEVEL: u32 = 33;
pub const T_STACK_FRAME: u32 = 34;

// Event types.
pub const T_EXECUTION_SAMPLE: u32 = 100;
pub const T_METHOD_SAMPLE: u32 = 101;
pub const T_ALLOC_IN_NEW_TLAB: u32 = 102;
pub const T_ALLOC_OUTSIDE_TLAB: u32 = 103;
pub const T_HEAP_LIVE_OBJECT: u32 = 104;
pub const T_MONITOR_ENTER: u32 = 105;
pub const T_THREAD_PARK: u32 = 106;
pub const T_CPU_LOAD: u32 = 107;
pub const T_LOG: u32 = 108;
pub const T_ACTIVE_RECORDING: u32 = 109;
pub const T_ACTIVE_SETTING: u32 = 110;
pub const T_OS_INFORMATION: u32 = 111;
pub const T_CPU_INFORMATION: u32 = 112;
pub const T_VM_INFORMATION: u32 = 113;
pub const T_INITIAL_SYSTEM_PROPERTY: u32 = 114;
pub const T_NATIVE_LIBRARY: u32 = 115;
pub const T_ENDPOINT: u32 = 116;
pub const T_QUEUE_TIME: u32 = 117;
pub const T_WALLCLOCK_SAMPLE_EPOCH: u32 = 118;
pub const T_HEAP_USAGE: u32 = 119;

/// Constant pool sections in emission order. The count byte written into the
/// cpool header is derived from this list, never hand-maintained.
pub const CPOOL_SECTIONS: [u32; 10] = [
    T_FRAME_TYPE,
    T_THREAD_STATE,
    T_THREAD,
    T_STACK_TRACE,
    T_METHOD,
    T_CLASS,
    T_PACKAGE,
    T_SYMBOL,
    T_STRING,
    T_LOG_LEVEL,
];
pub const CPOOL_SECTION_COUNT: u8 = CPOOL_SECTIONS.len() as u8;

// Thread states.
pub const THREAD_RUNNING: u32 = 1;
pub const THREAD_SLEEPING: u32 = 2;
