//! Trace decoding.
//!
//! Used by the test suites to prove each chunk is independently decodable
//! and closed over its constant pool, and handy for dumping a recording as
//! JSON. Decoding is schema-driven: each event type maps to the field list
//! its encoder writes.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use thiserror::Error;

use crate::recording::jfr::*;

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("bad magic at offset {0}")]
    BadMagic(u64),
    #[error("unsupported version {0}.{1}")]
    BadVersion(u16, u16),
    #[error("truncated record at offset {0}")]
    Truncated(u64),
    #[error("malformed constant pool at offset {0}")]
    BadConstantPool(u64),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// LEB128 low-7-first with the 9th byte carrying eight raw bits.
pub fn read_var64(data: &[u8], pos: &mut usize) -> Option<u64> {
    let mut value = 0u64;
    for i in 0..8 {
        let byte = *data.get(*pos)?;
        *pos += 1;
        value |= ((byte & 0x7f) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            return Some(value);
        }
    }
    let byte = *data.get(*pos)?;
    *pos += 1;
    Some(value | (byte as u64) << 56)
}

fn read_string(data: &[u8], pos: &mut usize) -> Option<Option<String>> {
    let tag = *data.get(*pos)?;
    *pos += 1;
    match tag {
        0 => Some(None),
        3 => {
            let len = read_var64(data, pos)? as usize;
            let bytes = data.get(*pos..*pos + len)?;
            *pos += len;
            Some(Some(String::from_utf8_lossy(bytes).into_owned()))
        }
        _ => None,
    }
}

fn read_u16_at(data: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_be_bytes(data.get(at..at + 2)?.try_into().ok()?))
}

fn read_u64_at(data: &[u8], at: usize) -> Option<u64> {
    Some(u64::from_be_bytes(data.get(at..at + 8)?.try_into().ok()?))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolKind {
    Thread,
    StackTrace,
    ThreadState,
    Class,
    StringPool,
    LogLevel,
}

#[derive(Clone, Copy)]
enum FieldKind {
    Var,
    F32,
    Str,
}

struct FieldSpec {
    kind: FieldKind,
    pool: Option<PoolKind>,
}

const fn v() -> FieldSpec {
    FieldSpec {
        kind: FieldKind::Var,
        pool: None,
    }
}

const fn p(pool: PoolKind) -> FieldSpec {
    FieldSpec {
        kind: FieldKind::Var,
        pool: Some(pool),
    }
}

const fn f() -> FieldSpec {
    FieldSpec {
        kind: FieldKind::F32,
        pool: None,
    }
}

const fn s() -> FieldSpec {
    FieldSpec {
        kind: FieldKind::Str,
        pool: None,
    }
}

const EXECUTION_SAMPLE_SCHEMA: &[FieldSpec] = &[
    v(),
    p(PoolKind::Thread),
    p(PoolKind::StackTrace),
    p(PoolKind::ThreadState),
    v(),
    v(),
    v(),
];
const METHOD_SAMPLE_SCHEMA: &[FieldSpec] = &[
    v(),
    p(PoolKind::Thread),
    p(PoolKind::StackTrace),
    p(PoolKind::ThreadState),
    v(),
    v(),
    v(),
    v(),
];
const ALLOC_IN_NEW_TLAB_SCHEMA: &[FieldSpec] = &[
    v(),
    p(PoolKind::Thread),
    p(PoolKind::StackTrace),
    p(PoolKind::Class),
    v(),
    v(),
    v(),
    v(),
];
const ALLOC_OUTSIDE_TLAB_SCHEMA: &[FieldSpec] = &[
    v(),
    p(PoolKind::Thread),
    p(PoolKind::StackTrace),
    p(PoolKind::Class),
    v(),
    v(),
    v(),
];
const HEAP_LIVE_OBJECT_SCHEMA: &[FieldSpec] = &[
    v(),
    p(PoolKind::Thread),
    p(PoolKind::StackTrace),
    p(PoolKind::Class),
    v(),
    v(),
    v(),
];
const MONITOR_ENTER_SCHEMA: &[FieldSpec] = &[
    v(),
    v(),
    p(PoolKind::Thread),
    p(PoolKind::StackTrace),
    p(PoolKind::Class),
    v(),
    v(),
    v(),
    v(),
];
const THREAD_PARK_SCHEMA: &[FieldSpec] = &[
    v(),
    v(),
    p(PoolKind::Thread),
    p(PoolKind::StackTrace),
    p(PoolKind::Class),
    v(),
    v(),
    v(),
];
const CPU_LOAD_SCHEMA: &[FieldSpec] = &[v(), f(), f(), f()];
const LOG_SCHEMA: &[FieldSpec] = &[v(), p(PoolKind::LogLevel), s()];
const ACTIVE_RECORDING_SCHEMA: &[FieldSpec] = &[
    v(),
    v(),
    p(PoolKind::Thread),
    v(),
    v(),
    s(),
    s(),
    v(),
    v(),
    v(),
    v(),
];
const ACTIVE_SETTING_SCHEMA: &[FieldSpec] = &[v(), v(), p(PoolKind::Thread), v(), v(), s(), s()];
const OS_INFORMATION_SCHEMA: &[FieldSpec] = &[v(), s()];
const CPU_INFORMATION_SCHEMA: &[FieldSpec] = &[v(), s(), s(), v(), v(), v()];
const VM_INFORMATION_SCHEMA: &[FieldSpec] = &[v(), s(), s(), s(), s(), s(), v(), v()];
const INITIAL_SYSTEM_PROPERTY_SCHEMA: &[FieldSpec] = &[v(), s(), s()];
const NATIVE_LIBRARY_SCHEMA: &[FieldSpec] = &[v(), s(), v(), v()];
const ENDPOINT_SCHEMA: &[FieldSpec] = &[v(), v(), p(PoolKind::Thread), p(PoolKind::StringPool), v()];
const QUEUE_TIME_SCHEMA: &[FieldSpec] = &[
    v(),
    v(),
    p(PoolKind::Thread),
    p(PoolKind::StringPool),
    p(PoolKind::StringPool),
    p(PoolKind::StringPool),
    v(),
];
const WALLCLOCK_SAMPLE_EPOCH_SCHEMA: &[FieldSpec] = &[v(), v(), v(), v(), v(), v(), v()];
const HEAP_USAGE_SCHEMA: &[FieldSpec] = &[v(), v(), v()];

fn event_schema(type_id: u32) -> Option<&'static [FieldSpec]> {
    Some(match type_id {
        T_EXECUTION_SAMPLE => EXECUTION_SAMPLE_SCHEMA,
        T_METHOD_SAMPLE => METHOD_SAMPLE_SCHEMA,
        T_ALLOC_IN_NEW_TLAB => ALLOC_IN_NEW_TLAB_SCHEMA,
        T_ALLOC_OUTSIDE_TLAB => ALLOC_OUTSIDE_TLAB_SCHEMA,
        T_HEAP_LIVE_OBJECT => HEAP_LIVE_OBJECT_SCHEMA,
        T_MONITOR_ENTER => MONITOR_ENTER_SCHEMA,
        T_THREAD_PARK => THREAD_PARK_SCHEMA,
        T_CPU_LOAD => CPU_LOAD_SCHEMA,
        T_LOG => LOG_SCHEMA,
        T_ACTIVE_RECORDING => ACTIVE_RECORDING_SCHEMA,
        T_ACTIVE_SETTING => ACTIVE_SETTING_SCHEMA,
        T_OS_INFORMATION => OS_INFORMATION_SCHEMA,
        T_CPU_INFORMATION => CPU_INFORMATION_SCHEMA,
        T_VM_INFORMATION => VM_INFORMATION_SCHEMA,
        T_INITIAL_SYSTEM_PROPERTY => INITIAL_SYSTEM_PROPERTY_SCHEMA,
        T_NATIVE_LIBRARY => NATIVE_LIBRARY_SCHEMA,
        T_ENDPOINT => ENDPOINT_SCHEMA,
        T_QUEUE_TIME => QUEUE_TIME_SCHEMA,
        T_WALLCLOCK_SAMPLE_EPOCH => WALLCLOCK_SAMPLE_EPOCH_SCHEMA,
        T_HEAP_USAGE => HEAP_USAGE_SCHEMA,
        _ => return None,
    })
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(u64),
    Float(f32),
    Text(Option<String>),
}

#[derive(Debug, Serialize)]
pub struct DecodedEvent {
    pub type_id: u32,
    pub fields: Vec<FieldValue>,
    /// Constant pool references carried by this event.
    #[serde(skip)]
    pub refs: Vec<(PoolKind, u64)>,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct DecodedFrame {
    pub method: u64,
    pub line: u64,
    pub bci: u64,
    pub frame_type: u8,
}

#[derive(Debug, Serialize)]
pub struct DecodedStackTrace {
    pub truncated: bool,
    pub frames: Vec<DecodedFrame>,
}

#[derive(Debug, Serialize)]
pub struct DecodedMethod {
    pub class_id: u64,
    pub name_id: u64,
    pub sig_id: u64,
    pub modifiers: u64,
    pub hidden: bool,
}

#[derive(Debug, Serialize)]
pub struct DecodedClass {
    pub symbol_id: u64,
    pub package_id: u64,
}

#[derive(Debug, Default, Serialize)]
pub struct ConstantPool {
    pub frame_types: BTreeMap<u64, String>,
    pub thread_states: BTreeMap<u64, String>,
    pub threads: BTreeMap<u64, String>,
    pub stack_traces: BTreeMap<u64, DecodedStackTrace>,
    pub methods: BTreeMap<u64, DecodedMethod>,
    pub classes: BTreeMap<u64, DecodedClass>,
    pub packages: BTreeMap<u64, u64>,
    pub symbols: BTreeMap<u64, String>,
    pub strings: BTreeMap<u64, String>,
    pub log_levels: BTreeMap<u64, String>,
}

#[derive(Debug, Serialize)]
pub struct ChunkSummary {
    pub start_offset: u64,
    pub size: u64,
    pub cpool_offset: u64,
    pub start_nanos: u64,
    pub duration_nanos: u64,
    pub start_ticks: u64,
    pub ticks_per_sec: u64,
    pub events: Vec<DecodedEvent>,
    pub pool: ConstantPool,
}

impl ChunkSummary {
    /// Every id referenced from events or from inside the pool that the
    /// pool does not define. Empty means the chunk is closed.
    pub fn undefined_ids(&self) -> Vec<String> {
        let mut missing = Vec::new();
        let pool = &self.pool;
        let mut check = |kind: PoolKind, id: u64, what: &str| {
            if id == 0 {
                return;
            }
            let defined = match kind {
                PoolKind::Thread => pool.threads.contains_key(&id),
                PoolKind::StackTrace => pool.stack_traces.contains_key(&id),
                PoolKind::ThreadState => pool.thread_states.contains_key(&id),
                PoolKind::Class => pool.classes.contains_key(&id),
                PoolKind::StringPool => pool.strings.contains_key(&id),
                PoolKind::LogLevel => pool.log_levels.contains_key(&id),
            };
            if !defined {
                missing.push(format!("{what} references undefined {kind:?} {id}"));
            }
        };

        for event in &self.events {
            for (kind, id) in &event.refs {
                check(*kind, *id, &format!("event {}", event.type_id));
            }
        }
        for (id, trace) in &pool.stack_traces {
            for frame in &trace.frames {
                if !pool.methods.contains_key(&frame.method) {
                    missing.push(format!(
                        "stack trace {id} references undefined method {}",
                        frame.method
                    ));
                }
                if !pool.frame_types.contains_key(&(frame.frame_type as u64)) {
                    missing.push(format!(
                        "stack trace {id} references undefined frame type {}",
                        frame.frame_type
                    ));
                }
            }
        }
        for (id, method) in &pool.methods {
            if method.class_id != 0 && !pool.classes.contains_key(&method.class_id) {
                missing.push(format!("method {id} references undefined class {}", method.class_id));
            }
            if method.name_id != 0 && !pool.symbols.contains_key(&method.name_id) {
                missing.push(format!("method {id} references undefined symbol {}", method.name_id));
            }
            if method.sig_id != 0 && !pool.symbols.contains_key(&method.sig_id) {
                missing.push(format!("method {id} references undefined symbol {}", method.sig_id));
            }
        }
        for (id, class) in &pool.classes {
            if class.symbol_id != 0 && !pool.symbols.contains_key(&class.symbol_id) {
                missing.push(format!("class {id} references undefined symbol {}", class.symbol_id));
            }
            if class.package_id != 0 && !pool.packages.contains_key(&class.package_id) {
                missing.push(format!(
                    "class {id} references undefined package {}",
                    class.package_id
                ));
            }
        }
        for (id, symbol_id) in &pool.packages {
            if *symbol_id != 0 && !pool.symbols.contains_key(symbol_id) {
                missing.push(format!("package {id} references undefined symbol {symbol_id}"));
            }
        }
        missing
    }
}

pub struct TraceReader {
    data: Vec<u8>,
}

impl TraceReader {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self {
            data: std::fs::read(path)?,
        })
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// All finished chunks in the file. An unfinished tail chunk (size
    /// still the placeholder) is ignored, as readers are meant to.
    pub fn chunks(&self) -> Result<Vec<ChunkSummary>, ReadError> {
        let mut chunks = Vec::new();
        let mut offset = 0u64;
        let len = self.data.len() as u64;
        while offset + CHUNK_HEADER_SIZE <= len {
            let at = offset as usize;
            if &self.data[at..at + 4] != MAGIC {
                return Err(ReadError::BadMagic(offset));
            }
            let major = read_u16_at(&self.data, at + 4).ok_or(ReadError::Truncated(offset))?;
            let minor = read_u16_at(&self.data, at + 6).ok_or(ReadError::Truncated(offset))?;
            if major != VERSION_MAJOR {
                return Err(ReadError::BadVersion(major, minor));
            }
            let size = read_u64_at(&self.data, at + 8).ok_or(ReadError::Truncated(offset))?;
            let cpool_offset =
                read_u64_at(&self.data, at + 16).ok_or(ReadError::Truncated(offset))?;
            let start_nanos =
                read_u64_at(&self.data, at + 32).ok_or(ReadError::Truncated(offset))?;
            let duration_nanos =
                read_u64_at(&self.data, at + 40).ok_or(ReadError::Truncated(offset))?;
            let start_ticks =
                read_u64_at(&self.data, at + 48).ok_or(ReadError::Truncated(offset))?;
            let ticks_per_sec =
                read_u64_at(&self.data, at + 56).ok_or(ReadError::Truncated(offset))?;

            if size == CHUNK_SIZE_PLACEHOLDER
                || size < CHUNK_HEADER_SIZE
                || cpool_offset == 0
                || offset + size > len
            {
                break;
            }

            let events = self.parse_events(
                at + CHUNK_HEADER_SIZE as usize,
                at + cpool_offset as usize,
            )?;
            let pool = self.parse_cpool(at + cpool_offset as usize, at + size as usize)?;

            chunks.push(ChunkSummary {
                start_offset: offset,
                size,
                cpool_offset,
                start_nanos,
                duration_nanos,
                start_ticks,
                ticks_per_sec,
                events,
                pool,
            });
            offset += size;
        }
        Ok(chunks)
    }

    fn parse_events(&self, start: usize, end: usize) -> Result<Vec<DecodedEvent>, ReadError> {
        let data = &self.data[..end];
        let mut events = Vec::new();
        let mut pos = start;
        while pos < end {
            let record_start = pos;
            let size =
                read_var64(data, &mut pos).ok_or(ReadError::Truncated(record_start as u64))? as usize;
            if size == 0 || record_start + size > end {
                return Err(ReadError::Truncated(record_start as u64));
            }
            let type_id = read_var64(data, &mut pos)
                .ok_or(ReadError::Truncated(record_start as u64))? as u32;
            if let Some(schema) = event_schema(type_id) {
                let mut fields = Vec::with_capacity(schema.len());
                let mut refs = Vec::new();
                let mut ok = true;
                for spec in schema {
                    match spec.kind {
                        FieldKind::Var => match read_var64(data, &mut pos) {
                            Some(value) => {
                                if let Some(pool) = spec.pool {
                                    refs.push((pool, value));
                                }
                                fields.push(FieldValue::Int(value));
                            }
                            None => {
                                ok = false;
                                break;
                            }
                        },
                        FieldKind::F32 => match data.get(pos..pos + 4) {
                            Some(bytes) => {
                                pos += 4;
                                fields.push(FieldValue::Float(f32::from_be_bytes(
                                    bytes.try_into().unwrap_or([0; 4]),
                                )));
                            }
                            None => {
                                ok = false;
                                break;
                            }
                        },
                        FieldKind::Str => match read_string(data, &mut pos) {
                            Some(text) => fields.push(FieldValue::Text(text)),
                            None => {
                                ok = false;
                                break;
                            }
                        },
                    }
                }
                if !ok {
                    return Err(ReadError::Truncated(record_start as u64));
                }
                events.push(DecodedEvent {
                    type_id,
                    fields,
                    refs,
                });
            }
            pos = record_start + size;
        }
        Ok(events)
    }

    fn parse_cpool(&self, start: usize, end: usize) -> Result<ConstantPool, ReadError> {
        let data = &self.data[..end];
        let err = || ReadError::BadConstantPool(start as u64);
        let mut pos = start;
        let size = read_var64(data, &mut pos).ok_or_else(err)? as usize;
        if start + size != end {
            return Err(err());
        }
        let type_id = read_var64(data, &mut pos).ok_or_else(err)? as u32;
        if type_id != T_CPOOL {
            return Err(err());
        }
        read_var64(data, &mut pos).ok_or_else(err)?; // start ticks
        pos += 3; // delta, flags
        let section_count = *data.get(pos).ok_or_else(err)?;
        pos += 1;

        let mut pool = ConstantPool::default();
        for _ in 0..section_count {
            let section = read_var64(data, &mut pos).ok_or_else(err)? as u32;
            let count = read_var64(data, &mut pos).ok_or_else(err)? as usize;
            match section {
                T_FRAME_TYPE | T_THREAD_STATE | T_SYMBOL | T_STRING | T_LOG_LEVEL => {
                    for _ in 0..count {
                        let id = read_var64(data, &mut pos).ok_or_else(err)?;
                        let value = read_string(data, &mut pos)
                            .ok_or_else(err)?
                            .unwrap_or_default();
                        match section {
                            T_FRAME_TYPE => pool.frame_types.insert(id, value),
                            T_THREAD_STATE => pool.thread_states.insert(id, value),
                            T_SYMBOL => pool.symbols.insert(id, value),
                            T_STRING => pool.strings.insert(id, value),
                            _ => pool.log_levels.insert(id, value),
                        };
                    }
                }
                T_THREAD => {
                    for _ in 0..count {
                        let id = read_var64(data, &mut pos).ok_or_else(err)?;
                        let os_name = read_string(data, &mut pos)
                            .ok_or_else(err)?
                            .unwrap_or_default();
                        read_var64(data, &mut pos).ok_or_else(err)?; // os tid
                        read_string(data, &mut pos).ok_or_else(err)?; // java name
                        read_var64(data, &mut pos).ok_or_else(err)?; // java id
                        pool.threads.insert(id, os_name);
                    }
                }
                T_STACK_TRACE => {
                    for _ in 0..count {
                        let id = read_var64(data, &mut pos).ok_or_else(err)?;
                        let truncated = *data.get(pos).ok_or_else(err)? != 0;
                        pos += 1;
                        let num_frames = read_var64(data, &mut pos).ok_or_else(err)? as usize;
                        let mut frames = Vec::with_capacity(num_frames);
                        for _ in 0..num_frames {
                            let method = read_var64(data, &mut pos).ok_or_else(err)?;
                            let line = read_var64(data, &mut pos).ok_or_else(err)?;
                            let bci = read_var64(data, &mut pos).ok_or_else(err)?;
                            let frame_type = *data.get(pos).ok_or_else(err)?;
                            pos += 1;
                            frames.push(DecodedFrame {
                                method,
                                line,
                                bci,
                                frame_type,
                            });
                        }
                        pool.stack_traces
                            .insert(id, DecodedStackTrace { truncated, frames });
                    }
                }
                T_METHOD => {
                    for _ in 0..count {
                        let id = read_var64(data, &mut pos).ok_or_else(err)?;
                        let class_id = read_var64(data, &mut pos).ok_or_else(err)?;
                        let name_id = read_var64(data, &mut pos).ok_or_else(err)?;
                        let sig_id = read_var64(data, &mut pos).ok_or_else(err)?;
                        let modifiers = read_var64(data, &mut pos).ok_or_else(err)?;
                        let hidden = read_var64(data, &mut pos).ok_or_else(err)? != 0;
                        pool.methods.insert(
                            id,
                            DecodedMethod {
                                class_id,
                                name_id,
                                sig_id,
                                modifiers,
                                hidden,
                            },
                        );
                    }
                }
                T_CLASS => {
                    for _ in 0..count {
                        let id = read_var64(data, &mut pos).ok_or_else(err)?;
                        read_var64(data, &mut pos).ok_or_else(err)?; // class loader
                        let symbol_id = read_var64(data, &mut pos).ok_or_else(err)?;
                        let package_id = read_var64(data, &mut pos).ok_or_else(err)?;
                        read_var64(data, &mut pos).ok_or_else(err)?; // modifiers
                        pool.classes.insert(
                            id,
                            DecodedClass {
                                symbol_id,
                                package_id,
                            },
                        );
                    }
                }
                T_PACKAGE => {
                    for _ in 0..count {
                        let id = read_var64(data, &mut pos).ok_or_else(err)?;
                        let symbol_id = read_var64(data, &mut pos).ok_or_else(err)?;
                        pool.packages.insert(id, symbol_id);
                    }
                }
                _ => return Err(err()),
            }
        }
        Ok(pool)
    }
}
