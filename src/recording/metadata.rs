//! The metadata tree written at the head of every chunk.
//!
//! A chunk is self-describing: the tree names every record type and field
//! the chunk can contain, so a reader needs nothing but the file. The tree
//! is a string pool plus nested elements, each element encoded as name
//! index, attribute pairs, and children.

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::recording::buffer::Buffer;
use crate::recording::jfr::*;

struct FieldDesc {
    name: &'static str,
    type_id: u32,
    constant_pool: bool,
    array: bool,
}

const fn field(name: &'static str, type_id: u32) -> FieldDesc {
    FieldDesc {
        name,
        type_id,
        constant_pool: false,
        array: false,
    }
}

const fn pool_field(name: &'static str, type_id: u32) -> FieldDesc {
    FieldDesc {
        name,
        type_id,
        constant_pool: true,
        array: false,
    }
}

const fn array_field(name: &'static str, type_id: u32) -> FieldDesc {
    FieldDesc {
        name,
        type_id,
        constant_pool: false,
        array: true,
    }
}

struct ClassDesc {
    name: &'static str,
    id: u32,
    super_type: Option<&'static str>,
    simple: bool,
    fields: &'static [FieldDesc],
}

const fn primitive(name: &'static str, id: u32) -> ClassDesc {
    ClassDesc {
        name,
        id,
        super_type: None,
        simple: true,
        fields: &[],
    }
}

const fn pool_type(name: &'static str, id: u32, fields: &'static [FieldDesc]) -> ClassDesc {
    ClassDesc {
        name,
        id,
        super_type: None,
        simple: false,
        fields,
    }
}

const fn event(name: &'static str, id: u32, fields: &'static [FieldDesc]) -> ClassDesc {
    ClassDesc {
        name,
        id,
        super_type: Some("jdk.jfr.Event"),
        simple: false,
        fields,
    }
}

const CLASSES: &[ClassDesc] = &[
    primitive("boolean", T_BOOLEAN),
    primitive("float", T_FLOAT),
    primitive("int", T_INT),
    primitive("long", T_LONG),
    pool_type("java.lang.String", T_STRING, &[field("value", T_STRING)]),
    pool_type("jdk.types.FrameType", T_FRAME_TYPE, &[field("description", T_STRING)]),
    pool_type("jdk.types.ThreadState", T_THREAD_STATE, &[field("name", T_STRING)]),
    pool_type(
        "java.lang.Thread",
        T_THREAD,
        &[
            field("osName", T_STRING),
            field("osThreadId", T_LONG),
            field("javaName", T_STRING),
            field("javaThreadId", T_LONG),
        ],
    ),
    pool_type(
        "jdk.types.StackFrame",
        T_STACK_FRAME,
        &[
            pool_field("method", T_METHOD),
            field("lineNumber", T_INT),
            field("bytecodeIndex", T_INT),
            pool_field("type", T_FRAME_TYPE),
        ],
    ),
    pool_type(
        "jdk.types.StackTrace",
        T_STACK_TRACE,
        &[field("truncated", T_BOOLEAN), array_field("frames", T_STACK_FRAME)],
    ),
    pool_type(
        "jdk.types.Method",
        T_METHOD,
        &[
            pool_field("type", T_CLASS),
            pool_field("name", T_SYMBOL),
            pool_field("descriptor", T_SYMBOL),
            field("modifiers", T_INT),
            field("hidden", T_BOOLEAN),
        ],
    ),
    pool_type(
        "java.lang.Class",
        T_CLASS,
        &[
            field("classLoader", T_LONG),
            pool_field("name", T_SYMBOL),
            pool_field("package", T_PACKAGE),
            field("modifiers", T_LONG),
        ],
    ),
    pool_type("jdk.types.Package", T_PACKAGE, &[pool_field("name", T_SYMBOL)]),
    pool_type("jdk.types.Symbol", T_SYMBOL, &[field("string", T_STRING)]),
    pool_type("jdk.types.LogLevel", T_LOG_LEVEL, &[field("name", T_STRING)]),
    event(
        "datadog.ExecutionSample",
        T_EXECUTION_SAMPLE,
        &[
            field("startTime", T_LONG),
            pool_field("sampledThread", T_THREAD),
            pool_field("stackTrace", T_STACK_TRACE),
            pool_field("state", T_THREAD_STATE),
            field("spanId", T_LONG),
            field("rootSpanId", T_LONG),
            field("weight", T_LONG),
        ],
    ),
    event(
        "datadog.MethodSample",
        T_METHOD_SAMPLE,
        &[
            field("startTime", T_LONG),
            pool_field("sampledThread", T_THREAD),
            pool_field("stackTrace", T_STACK_TRACE),
            pool_field("state", T_THREAD_STATE),
            field("spanId", T_LONG),
            field("rootSpanId", T_LONG),
            field("weight", T_LONG),
            field("parallelism", T_LONG),
        ],
    ),
    event(
        "jdk.ObjectAllocationInNewTLAB",
        T_ALLOC_IN_NEW_TLAB,
        &[
            field("startTime", T_LONG),
            pool_field("eventThread", T_THREAD),
            pool_field("stackTrace", T_STACK_TRACE),
            pool_field("objectClass", T_CLASS),
            field("allocationSize", T_LONG),
            field("tlabSize", T_LONG),
            field("spanId", T_LONG),
            field("rootSpanId", T_LONG),
        ],
    ),
    event(
        "jdk.ObjectAllocationOutsideTLAB",
        T_ALLOC_OUTSIDE_TLAB,
        &[
            field("startTime", T_LONG),
            pool_field("eventThread", T_THREAD),
            pool_field("stackTrace", T_STACK_TRACE),
            pool_field("objectClass", T_CLASS),
            field("allocationSize", T_LONG),
            field("spanId", T_LONG),
            field("rootSpanId", T_LONG),
        ],
    ),
    event(
        "datadog.HeapLiveObject",
        T_HEAP_LIVE_OBJECT,
        &[
            field("startTime", T_LONG),
            pool_field("eventThread", T_THREAD),
            pool_field("stackTrace", T_STACK_TRACE),
            pool_field("objectClass", T_CLASS),
            field("age", T_LONG),
            field("objectSize", T_LONG),
            field("allocationInterval", T_LONG),
        ],
    ),
    event(
        "jdk.JavaMonitorEnter",
        T_MONITOR_ENTER,
        &[
            field("startTime", T_LONG),
            field("duration", T_LONG),
            pool_field("eventThread", T_THREAD),
            pool_field("stackTrace", T_STACK_TRACE),
            pool_field("monitorClass", T_CLASS),
            field("previousOwner", T_LONG),
            field("address", T_LONG),
            field("spanId", T_LONG),
            field("rootSpanId", T_LONG),
        ],
    ),
    event(
        "jdk.ThreadPark",
        T_THREAD_PARK,
        &[
            field("startTime", T_LONG),
            field("duration", T_LONG),
            pool_field("eventThread", T_THREAD),
            pool_field("stackTrace", T_STACK_TRACE),
            pool_field("parkedClass", T_CLASS),
            field("timeout", T_LONG),
            field("until", T_LONG),
            field("address", T_LONG),
        ],
    ),
    event(
        "jdk.CPULoad",
        T_CPU_LOAD,
        &[
            field("startTime", T_LONG),
            field("jvmUser", T_FLOAT),
            field("jvmSystem", T_FLOAT),
            field("machineTotal", T_FLOAT),
        ],
    ),
    event(
        "datadog.ProfilerLog",
        T_LOG,
        &[
            field("startTime", T_LONG),
            pool_field("level", T_LOG_LEVEL),
            field("message", T_STRING),
        ],
    ),
    event(
        "jdk.ActiveRecording",
        T_ACTIVE_RECORDING,
        &[
            field("startTime", T_LONG),
            field("duration", T_LONG),
            pool_field("eventThread", T_THREAD),
            field("stackTrace", T_LONG),
            field("id", T_LONG),
            field("name", T_STRING),
            field("destination", T_STRING),
            field("maxAge", T_LONG),
            field("maxSize", T_LONG),
            field("recordingStart", T_LONG),
            field("recordingDuration", T_LONG),
        ],
    ),
    event(
        "jdk.ActiveSetting",
        T_ACTIVE_SETTING,
        &[
            field("startTime", T_LONG),
            field("duration", T_LONG),
            pool_field("eventThread", T_THREAD),
            field("stackTrace", T_LONG),
            field("settingFor", T_LONG),
            field("name", T_STRING),
            field("value", T_STRING),
        ],
    ),
    event(
        "jdk.OSInformation",
        T_OS_INFORMATION,
        &[field("startTime", T_LONG), field("osVersion", T_STRING)],
    ),
    event(
        "jdk.CPUInformation",
        T_CPU_INFORMATION,
        &[
            field("startTime", T_LONG),
            field("cpu", T_STRING),
            field("description", T_STRING),
            field("sockets", T_INT),
            field("cores", T_INT),
            field("hwThreads", T_INT),
        ],
    ),
    event(
        "jdk.JVMInformation",
        T_VM_INFORMATION,
        &[
            field("startTime", T_LONG),
            field("jvmName", T_STRING),
            field("jvmVersion", T_STRING),
            field("jvmArguments", T_STRING),
            field("jvmFlags", T_STRING),
            field("javaArguments", T_STRING),
            field("jvmStartTime", T_LONG),
            field("pid", T_LONG),
        ],
    ),
    event(
        "jdk.InitialSystemProperty",
        T_INITIAL_SYSTEM_PROPERTY,
        &[
            field("startTime", T_LONG),
            field("key", T_STRING),
            field("value", T_STRING),
        ],
    ),
    event(
        "jdk.NativeLibrary",
        T_NATIVE_LIBRARY,
        &[
            field("startTime", T_LONG),
            field("name", T_STRING),
            field("baseAddress", T_LONG),
            field("topAddress", T_LONG),
        ],
    ),
    event(
        "datadog.Endpoint",
        T_ENDPOINT,
        &[
            field("startTime", T_LONG),
            field("duration", T_LONG),
            pool_field("eventThread", T_THREAD),
            pool_field("endpoint", T_STRING),
            field("localRootSpanId", T_LONG),
        ],
    ),
    event(
        "datadog.QueueTime",
        T_QUEUE_TIME,
        &[
            field("startTime", T_LONG),
            field("duration", T_LONG),
            pool_field("eventThread", T_THREAD),
            pool_field("task", T_STRING),
            pool_field("scheduler", T_STRING),
            pool_field("origin", T_STRING),
            field("queueLength", T_LONG),
        ],
    ),
    event(
        "datadog.WallClockEpoch",
        T_WALLCLOCK_SAMPLE_EPOCH,
        &[
            field("startTime", T_LONG),
            field("duration", T_LONG),
            field("samplableThreads", T_LONG),
            field("successfulSamples", T_LONG),
            field("failedSamples", T_LONG),
            field("exitedThreads", T_LONG),
            field("permissionDenied", T_LONG),
        ],
    ),
    event(
        "datadog.HeapUsage",
        T_HEAP_USAGE,
        &[
            field("startTime", T_LONG),
            field("used", T_LONG),
            field("afterLastGC", T_BOOLEAN),
        ],
    ),
];

struct Element {
    name: u32,
    attributes: Vec<(u32, u32)>,
    children: Vec<Element>,
}

#[derive(Default)]
struct StringPool {
    strings: Vec<String>,
    index: HashMap<String, u32>,
}

impl StringPool {
    fn intern(&mut self, s: &str) -> u32 {
        if let Some(&i) = self.index.get(s) {
            return i;
        }
        let i = self.strings.len() as u32;
        self.strings.push(s.to_string());
        self.index.insert(s.to_string(), i);
        i
    }
}

struct Metadata {
    strings: Vec<String>,
    root: Element,
}

fn build_metadata() -> Metadata {
    let mut pool = StringPool::default();
    let mut class_elements = Vec::with_capacity(CLASSES.len());
    for class in CLASSES {
        let mut attributes = vec![
            (pool.intern("name"), pool.intern(class.name)),
            (pool.intern("id"), pool.intern(&class.id.to_string())),
        ];
        if let Some(super_type) = class.super_type {
            attributes.push((pool.intern("superType"), pool.intern(super_type)));
        }
        if class.simple {
            attributes.push((pool.intern("simpleType"), pool.intern("true")));
        }
        let children = class
            .fields
            .iter()
            .map(|f| {
                let mut attrs = vec![
                    (pool.intern("name"), pool.intern(f.name)),
                    (pool.intern("class"), pool.intern(&f.type_id.to_string())),
                ];
                if f.constant_pool {
                    attrs.push((pool.intern("constantPool"), pool.intern("true")));
                }
                if f.array {
                    attrs.push((pool.intern("dimension"), pool.intern("1")));
                }
                Element {
                    name: pool.intern("field"),
                    attributes: attrs,
                    children: Vec::new(),
                }
            })
            .collect();
        class_elements.push(Element {
            name: pool.intern("class"),
            attributes,
            children,
        });
    }

    let metadata = Element {
        name: pool.intern("metadata"),
        attributes: Vec::new(),
        children: class_elements,
    };
    let region = Element {
        name: pool.intern("region"),
        attributes: vec![(pool.intern("locale"), pool.intern("en_US"))],
        children: Vec::new(),
    };
    let root = Element {
        name: pool.intern("root"),
        attributes: Vec::new(),
        children: vec![metadata, region],
    };
    Metadata {
        strings: pool.strings,
        root,
    }
}

fn metadata() -> &'static Metadata {
    static METADATA: OnceLock<Metadata> = OnceLock::new();
    METADATA.get_or_init(build_metadata)
}

fn write_element(buf: &mut Buffer, element: &Element) {
    buf.put_var32(element.name);
    buf.put_var32(element.attributes.len() as u32);
    for (key, value) in &element.attributes {
        buf.put_var32(*key);
        buf.put_var32(*value);
    }
    buf.put_var32(element.children.len() as u32);
    for child in &element.children {
        write_element(buf, child);
    }
}

/// Emit the metadata record: 5-byte size slot, type, ticks, string pool,
/// element tree, size patched on completion.
pub fn write_metadata(buf: &mut Buffer, start_ticks: u64) {
    let meta = metadata();
    let start = buf.skip(5);
    buf.put_var32(T_METADATA);
    buf.put_var64(start_ticks);
    buf.put_u8(0);
    buf.put_u8(1);
    buf.put_var32(meta.strings.len() as u32);
    for s in &meta.strings {
        buf.put_utf8(s);
    }
    write_element(buf, &meta.root);
    buf.patch_var32(start, (buf.offset() - start) as u32);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::reader::read_var64;

    #[test]
    fn test_every_type_id_is_unique() {
        let mut seen = std::collections::HashSet::new();
        for class in CLASSES {
            assert!(seen.insert(class.id), "duplicate type id {}", class.id);
        }
    }

    #[test]
    fn test_metadata_block_is_walkable() {
        let mut buf = Buffer::recording();
        write_metadata(&mut buf, 42);
        let data = buf.data();

        let mut pos = 0;
        let size = read_var64(data, &mut pos).unwrap() as usize;
        assert_eq!(size, data.len(), "patched size spans the whole block");
        assert_eq!(read_var64(data, &mut pos).unwrap(), T_METADATA as u64);
        assert_eq!(read_var64(data, &mut pos).unwrap(), 42);
        pos += 2;

        // string pool
        let count = read_var64(data, &mut pos).unwrap() as usize;
        let mut strings = Vec::with_capacity(count);
        for _ in 0..count {
            assert_eq!(data[pos], 3);
            pos += 1;
            let len = read_var64(data, &mut pos).unwrap() as usize;
            strings.push(std::str::from_utf8(&data[pos..pos + len]).unwrap().to_string());
            pos += len;
        }
        assert!(strings.iter().any(|s| s == "root"));
        assert!(strings.iter().any(|s| s == "jdk.types.StackTrace"));

        // element tree walk must consume the rest exactly
        fn walk(data: &[u8], pos: &mut usize) {
            let _name = read_var64(data, pos).unwrap();
            let attrs = read_var64(data, pos).unwrap();
            for _ in 0..attrs {
                read_var64(data, pos).unwrap();
                read_var64(data, pos).unwrap();
            }
            let children = read_var64(data, pos).unwrap();
            for _ in 0..children {
                walk(data, pos);
            }
        }
        walk(data, &mut pos);
        assert_eq!(pos, data.len());
    }

    #[test]
    fn test_pool_references_have_declared_classes() {
        let ids: std::collections::HashSet<u32> = CLASSES.iter().map(|c| c.id).collect();
        for class in CLASSES {
            for f in class.fields {
                assert!(
                    ids.contains(&f.type_id),
                    "{}.{} references undeclared type {}",
                    class.name,
                    f.name,
                    f.type_id
                );
            }
        }
    }
}
