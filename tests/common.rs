//! Shared test fixtures: a scriptable mock of the managed-runtime bridge.
//!
//! Construct with [`MockRuntime::new`], tweak the public knobs, then call
//! [`install`] to make it the process bridge. Keep the `Arc` around to
//! script GC behavior (`collect`) and inspect reference accounting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use jfr_recording::recording::runtime::{
    install_bridge, LocalRef, MethodDetails, NativeLibrary, ObjectRef, RuntimeBridge,
    RuntimeQueryError, ThreadDetails, VmDetails, WeakRef,
};

/// Serializes tests that touch process-wide state (the controller
/// singleton and the installed bridge).
#[allow(dead_code)]
pub fn process_state_guard() -> MutexGuard<'static, ()> {
    static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
    GUARD
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct WeakState {
    object: u64,
    cleared: bool,
}

pub struct MockRuntime {
    pub version: u32,
    pub max_heap: Option<u64>,
    pub heap_used: AtomicU64,
    pub gc_notifications_work: bool,
    pub refuse_weak_refs: AtomicBool,
    pub methods: Mutex<HashMap<u64, MethodDetails>>,
    pub libraries: Mutex<Vec<NativeLibrary>>,
    objects: Mutex<HashMap<u64, String>>,
    weak_refs: Mutex<HashMap<u64, WeakState>>,
    next_token: AtomicU64,
    released_weak: AtomicU64,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self {
            version: 17,
            max_heap: Some(4 << 30),
            heap_used: AtomicU64::new(512 << 20),
            gc_notifications_work: true,
            refuse_weak_refs: AtomicBool::new(false),
            methods: Mutex::new(HashMap::new()),
            libraries: Mutex::new(Vec::new()),
            objects: Mutex::new(HashMap::new()),
            weak_refs: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            released_weak: AtomicU64::new(0),
        }
    }
}

#[allow(dead_code)]
impl MockRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Build a mock with the defaults adjusted, e.g.
    /// `MockRuntime::with(|m| m.max_heap = None)`.
    pub fn with(configure: impl FnOnce(&mut MockRuntime)) -> Arc<Self> {
        let mut mock = Self::default();
        configure(&mut mock);
        Arc::new(mock)
    }

    pub fn add_method(&self, id: u64, details: MethodDetails) {
        self.methods.lock().unwrap().insert(id, details);
    }

    pub fn register_object(&self, id: u64, class_name: &str) {
        self.objects.lock().unwrap().insert(id, class_name.to_string());
    }

    /// Simulate the referent of `object` being garbage collected: every
    /// weak reference taken from it stops promoting.
    pub fn collect(&self, object: ObjectRef) {
        for state in self.weak_refs.lock().unwrap().values_mut() {
            if state.object == object.0 {
                state.cleared = true;
            }
        }
    }

    /// Weak references issued and not yet released.
    pub fn live_weak_refs(&self) -> usize {
        self.weak_refs.lock().unwrap().len()
    }

    pub fn released_weak_refs(&self) -> u64 {
        self.released_weak.load(Ordering::Relaxed)
    }
}

impl RuntimeBridge for MockRuntime {
    fn method_details(&self, method: u64) -> Result<MethodDetails, RuntimeQueryError> {
        self.methods
            .lock()
            .unwrap()
            .get(&method)
            .cloned()
            .ok_or_else(|| RuntimeQueryError(format!("unknown method {method:#x}")))
    }

    fn runtime_version(&self) -> u32 {
        self.version
    }

    fn max_heap_bytes(&self) -> Option<u64> {
        self.max_heap
    }

    fn heap_used_bytes(&self) -> u64 {
        self.heap_used.load(Ordering::Relaxed)
    }

    fn used_after_last_gc(&self) -> Option<u64> {
        None
    }

    fn enable_gc_notifications(&self) -> bool {
        self.gc_notifications_work
    }

    fn new_weak_ref(&self, object: ObjectRef) -> Option<WeakRef> {
        if self.refuse_weak_refs.load(Ordering::Relaxed) {
            return None;
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.weak_refs.lock().unwrap().insert(
            token,
            WeakState {
                object: object.0,
                cleared: false,
            },
        );
        Some(WeakRef(token))
    }

    fn promote(&self, weak: &WeakRef) -> Option<LocalRef> {
        let refs = self.weak_refs.lock().unwrap();
        match refs.get(&weak.0) {
            Some(state) if !state.cleared => Some(LocalRef(weak.0)),
            _ => None,
        }
    }

    fn release_weak(&self, weak: WeakRef) {
        self.weak_refs.lock().unwrap().remove(&weak.0);
        self.released_weak.fetch_add(1, Ordering::Relaxed);
    }

    fn release_local(&self, _local: LocalRef) {}

    fn object_class_name(&self, local: &LocalRef) -> Option<String> {
        let object = self.weak_refs.lock().unwrap().get(&local.0)?.object;
        self.objects.lock().unwrap().get(&object).cloned()
    }

    fn thread_details(&self, tid: i32) -> Option<ThreadDetails> {
        Some(ThreadDetails {
            name: format!("worker-{tid}"),
            managed_thread_id: tid as u64 + 1000,
        })
    }

    fn system_properties(&self) -> Vec<(String, String)> {
        vec![("java.home".to_string(), "/opt/java".to_string())]
    }

    fn vm_details(&self) -> Option<VmDetails> {
        Some(VmDetails {
            name: "MockVM".to_string(),
            version: "17.0.2".to_string(),
            args: "-Xmx4g".to_string(),
            flags: String::new(),
            launch_command: "example.Main".to_string(),
        })
    }

    fn native_libraries(&self) -> Vec<NativeLibrary> {
        self.libraries.lock().unwrap().clone()
    }
}

/// Delegating wrapper so tests can keep the `Arc<MockRuntime>` for
/// scripting after handing the bridge to the recorder.
pub struct SharedBridge(pub Arc<MockRuntime>);

impl RuntimeBridge for SharedBridge {
    fn method_details(&self, method: u64) -> Result<MethodDetails, RuntimeQueryError> {
        self.0.method_details(method)
    }
    fn runtime_version(&self) -> u32 {
        self.0.runtime_version()
    }
    fn max_heap_bytes(&self) -> Option<u64> {
        self.0.max_heap_bytes()
    }
    fn heap_used_bytes(&self) -> u64 {
        self.0.heap_used_bytes()
    }
    fn used_after_last_gc(&self) -> Option<u64> {
        self.0.used_after_last_gc()
    }
    fn enable_gc_notifications(&self) -> bool {
        self.0.enable_gc_notifications()
    }
    fn new_weak_ref(&self, object: ObjectRef) -> Option<WeakRef> {
        self.0.new_weak_ref(object)
    }
    fn promote(&self, weak: &WeakRef) -> Option<LocalRef> {
        self.0.promote(weak)
    }
    fn release_weak(&self, weak: WeakRef) {
        self.0.release_weak(weak)
    }
    fn release_local(&self, local: LocalRef) {
        self.0.release_local(local)
    }
    fn object_class_name(&self, local: &LocalRef) -> Option<String> {
        self.0.object_class_name(local)
    }
    fn thread_details(&self, tid: i32) -> Option<ThreadDetails> {
        self.0.thread_details(tid)
    }
    fn system_properties(&self) -> Vec<(String, String)> {
        self.0.system_properties()
    }
    fn vm_details(&self) -> Option<VmDetails> {
        self.0.vm_details()
    }
    fn native_libraries(&self) -> Vec<NativeLibrary> {
        self.0.native_libraries()
    }
}

/// Install `mock` as the process bridge, keeping the handle for scripting.
#[allow(dead_code)]
pub fn install(mock: &Arc<MockRuntime>) {
    install_bridge(Box::new(SharedBridge(mock.clone())));
}

/// A managed method description with sensible defaults.
#[allow(dead_code)]
pub fn method(
    class_name: &str,
    method_name: &str,
    signature: &str,
    modifiers: u32,
) -> MethodDetails {
    MethodDetails {
        class_name: class_name.to_string(),
        method_name: method_name.to_string(),
        signature: signature.to_string(),
        modifiers,
        class_modifiers: 0,
        line_numbers: Vec::new(),
        extends_thread: false,
    }
}
