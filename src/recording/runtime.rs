//! Seam to the managed runtime.
//!
//! The recording core never talks to the VM directly. An embedder installs
//! a `RuntimeBridge` once, and the core calls through it for method
//! resolution, weak references, heap facts, and the environment snapshots
//! written into each chunk's preamble. Event paths read the installed
//! handle lock-free.

use std::sync::Arc;

use arc_swap::ArcSwapOption;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineNumberEntry {
    pub start_bci: i32,
    pub line: u32,
}

/// Everything the chunk writer needs to know about one managed method.
#[derive(Clone, Debug, Default)]
pub struct MethodDetails {
    /// Internal class name, e.g. `java/lang/String`.
    pub class_name: String,
    pub method_name: String,
    pub signature: String,
    pub modifiers: u32,
    pub class_modifiers: u32,
    pub line_numbers: Vec<LineNumberEntry>,
    /// True when the declaring class is the thread base class or a subclass.
    pub extends_thread: bool,
}

/// Opaque handle to a heap object passed in by an allocation sampler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectRef(pub u64);

/// Weak global reference owned by the runtime. Must be released exactly
/// once through the bridge that issued it.
#[derive(Debug, PartialEq, Eq)]
pub struct WeakRef(pub u64);

/// Promoted strong local reference; valid until released.
#[derive(Debug)]
pub struct LocalRef(pub u64);

#[derive(Clone, Debug)]
pub struct ThreadDetails {
    pub name: String,
    pub managed_thread_id: u64,
}

#[derive(Clone, Debug)]
pub struct VmDetails {
    pub name: String,
    pub version: String,
    pub args: String,
    pub flags: String,
    pub launch_command: String,
}

#[derive(Clone, Debug)]
pub struct NativeLibrary {
    pub name: String,
    pub min_address: u64,
    pub max_address: u64,
}

/// A runtime query returned non-zero. Degraded locally by the caller; the
/// record stays structurally valid with placeholder text.
#[derive(Debug, Clone, thiserror::Error)]
#[error("runtime query failed: {0}")]
pub struct RuntimeQueryError(pub String);

pub trait RuntimeBridge: Send + Sync {
    fn method_details(&self, method: u64) -> Result<MethodDetails, RuntimeQueryError>;

    fn runtime_version(&self) -> u32;

    /// None when the runtime refuses to disclose the maximum heap size; the
    /// liveness tracker then disables itself with a clean status.
    fn max_heap_bytes(&self) -> Option<u64>;

    fn heap_used_bytes(&self) -> u64;

    /// Used bytes measured at the end of the last collection, when the
    /// runtime can report it.
    fn used_after_last_gc(&self) -> Option<u64>;

    fn enable_gc_notifications(&self) -> bool;

    fn new_weak_ref(&self, object: ObjectRef) -> Option<WeakRef>;

    /// Promote a weak reference to a strong local one. None means the
    /// referent was collected.
    fn promote(&self, weak: &WeakRef) -> Option<LocalRef>;

    fn release_weak(&self, weak: WeakRef);

    fn release_local(&self, local: LocalRef);

    fn object_class_name(&self, object: &LocalRef) -> Option<String>;

    fn thread_details(&self, tid: i32) -> Option<ThreadDetails>;

    fn system_properties(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    fn vm_details(&self) -> Option<VmDetails> {
        None
    }

    fn native_libraries(&self) -> Vec<NativeLibrary> {
        Vec::new()
    }
}

/// Shared handle to the installed bridge. The double indirection keeps the
/// pointee sized for the lock-free swap cell.
pub type BridgeRef = Arc<Box<dyn RuntimeBridge>>;

static BRIDGE: ArcSwapOption<Box<dyn RuntimeBridge>> = ArcSwapOption::const_empty();

/// Install the bridge. Replacing a previously installed bridge is allowed;
/// in-flight samples finish against the one they loaded.
pub fn install_bridge(bridge: Box<dyn RuntimeBridge>) {
    BRIDGE.store(Some(Arc::new(bridge)));
}

pub fn bridge() -> Option<BridgeRef> {
    BRIDGE.load_full()
}
