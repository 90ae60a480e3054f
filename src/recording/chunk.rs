//! Active recording state: per-lane buffers, the chunk lifecycle, event
//! encoders, and the constant pool dump.
//!
//! A chunk is a self-contained byte range: 68-byte header, metadata tree,
//! interleaved event records, and a trailing constant pool. The header's
//! size, cpool offset, and duration fields are patched with `pwrite` when
//! the chunk finishes, so a crash leaves a skippable (placeholder-sized)
//! tail instead of a corrupt file.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::collections::BTreeMap;

use crate::recording::args::Arguments;
use crate::recording::buffer::{Buffer, RECORDING_BUFFER_LIMIT};
use crate::recording::call_traces::{CallTrace, CallTraceStorage};
use crate::recording::cpu_monitor::CpuLoadMonitor;
use crate::recording::dictionary::Dictionary;
use crate::recording::events::{
    AllocEvent, EventPayload, ExecutionEvent, LockEvent, LogLevel, ObjectLivenessEvent,
    QueueTimeEvent, TraceRootEvent, WallClockEpochEvent, LOG_LEVELS,
};
use crate::recording::frames::{unpack_bci, CallFrame, FrameType, FRAME_TYPES};
use crate::recording::jfr::*;
use crate::recording::lookup::Lookup;
use crate::recording::metadata;
use crate::recording::method_map::MethodMap;
use crate::recording::os;
use crate::recording::runtime;
use crate::recording::spinlock::SpinLock;
use crate::recording::thread_filter::ThreadFilter;

/// Number of independent sampling lanes. Collaborators pick a lane by
/// thread-id hash or by the sampler lock index they already hold.
pub const CONCURRENCY_LEVEL: usize = 16;

/// Lane reserved for events emitted by the recorder itself (liveness flush).
pub const LIVENESS_LANE: usize = 1;

/// Append-side of the output file. Writes are best-effort: a failed or
/// short write only withholds the byte count, recording carries on.
pub struct Sink<'a> {
    file: &'a File,
    bytes_written: &'a AtomicU64,
}

impl Sink<'_> {
    pub fn flush(&self, buf: &mut Buffer) {
        if buf.offset() > 0 {
            let mut f = self.file;
            if let Ok(n) = f.write(buf.data()) {
                self.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
            }
        }
        buf.reset();
    }

    pub fn flush_if_needed(&self, buf: &mut Buffer, limit: usize) {
        if buf.offset() >= limit {
            self.flush(buf);
        }
    }
}

fn bias(base_id: u64, id: u32) -> u64 {
    if id == 0 {
        0
    } else {
        id as u64 | base_id
    }
}

pub struct Recording {
    file: File,
    lanes: [SpinLock<Buffer>; CONCURRENCY_LEVEL],
    cpu_monitor: CpuLoadMonitor,
    chunk_start: u64,
    thread_set: ThreadFilter,
    method_map: MethodMap,
    /// Recording-lifetime dictionaries; their ids stay stable across chunk
    /// rotations and the full contents are re-emitted into every cpool.
    classes: Dictionary,
    strings: Dictionary,
    call_traces: CallTraceStorage,
    start_time: u64,
    recording_start_time: u64,
    start_ticks: u64,
    recording_start_ticks: u64,
    stop_time: u64,
    stop_ticks: u64,
    base_id: u64,
    bytes_written: AtomicU64,
    chunk_size: u64,
    chunk_time: u64,
    tid: i32,
    available_processors: u32,
    /// Libraries already written; -1 disables the section.
    recorded_lib_count: AtomicI32,
    args: Arguments,
}

impl Recording {
    pub fn new(file: File, args: &Arguments) -> std::io::Result<Self> {
        let chunk_start = (&file).seek(SeekFrom::End(0))?;
        let start_time = os::wall_clock_micros();
        let start_ticks = os::ticks();

        let rec = Self {
            file,
            lanes: std::array::from_fn(|_| SpinLock::new(Buffer::recording())),
            cpu_monitor: CpuLoadMonitor::new(!args.no_cpu_load),
            chunk_start,
            thread_set: ThreadFilter::new(),
            method_map: MethodMap::new(),
            classes: Dictionary::new(),
            strings: Dictionary::new(),
            call_traces: CallTraceStorage::new(),
            start_time,
            recording_start_time: start_time,
            start_ticks,
            recording_start_ticks: start_ticks,
            stop_time: start_time,
            stop_ticks: start_ticks,
            base_id: 0,
            bytes_written: AtomicU64::new(0),
            chunk_size: if args.chunk_size <= 0 {
                u64::MAX
            } else {
                (args.chunk_size as u64).max(CHUNK_SIZE_FLOOR)
            },
            chunk_time: if args.chunk_time <= 0 {
                u64::MAX
            } else {
                (args.chunk_time as u64).max(CHUNK_TIME_FLOOR_MICROS)
            },
            tid: os::thread_id(),
            available_processors: os::available_processors(),
            recorded_lib_count: AtomicI32::new(if args.no_native_libs { -1 } else { 0 }),
            args: args.clone(),
        };

        rec.thread_set.add(rec.tid);
        {
            let sink = rec.sink();
            let mut buf = rec.lanes[0].lock();
            rec.write_header(&mut buf);
            metadata::write_metadata(&mut buf, rec.start_ticks);
            rec.write_settings(&sink, &mut buf);
            if !rec.args.no_system_info {
                rec.write_os_cpu_info(&sink, &mut buf);
                rec.write_vm_info(&sink, &mut buf);
            }
            if !rec.args.no_system_props {
                rec.write_system_properties(&sink, &mut buf);
            }
            rec.write_native_libraries(&sink, &mut buf);
            sink.flush(&mut buf);
        }
        Ok(rec)
    }

    fn sink(&self) -> Sink<'_> {
        Sink {
            file: &self.file,
            bytes_written: &self.bytes_written,
        }
    }

    fn position(&self) -> u64 {
        (&self.file).seek(SeekFrom::Current(0)).unwrap_or(0)
    }

    fn biased(&self, id: u32) -> u64 {
        bias(self.base_id, id)
    }

    // ---- collaborator-facing interning ----

    pub fn intern_class(&self, name: &str) -> u32 {
        self.classes.lookup(name)
    }

    pub fn intern_string(&self, s: &str) -> u32 {
        self.strings.lookup(s)
    }

    /// Register once per sample, right before recording the event that
    /// carries the id: registration marks the trace for the current
    /// chunk's constant pool.
    pub fn register_call_trace(&self, frames: &[CallFrame], truncated: bool) -> u32 {
        self.call_traces.register(frames, truncated)
    }

    // ---- chunk lifecycle ----

    pub fn need_switch_chunk(&self, wall_now_micros: u64) -> bool {
        self.bytes_written.load(Ordering::Acquire) >= self.chunk_size
            || wall_now_micros.saturating_sub(self.start_time) >= self.chunk_time
    }

    pub fn cpu_monitor_cycle(&self) {
        self.cpu_monitor.cycle(&self.sink(), self.available_processors);
    }

    /// Close out the current chunk: drain side buffers and lanes, dump the
    /// constant pool, then patch the cpool size slot and the header fields
    /// in place. Returns the file offset just past the chunk.
    pub fn finish_chunk(&mut self, end_recording: bool) -> u64 {
        self.stop_time = os::wall_clock_micros();
        self.stop_ticks = os::ticks();
        {
            let sink = self.sink();
            self.cpu_monitor.flush(&sink);
            let mut buf = self.lanes[0].lock();
            self.write_native_libraries(&sink, &mut buf);
            if end_recording {
                self.write_recording_info(&sink, &mut buf);
            }
            sink.flush(&mut buf);
            drop(buf);
            for lane in &self.lanes[1..] {
                let mut buf = lane.lock();
                sink.flush(&mut buf);
            }
        }

        let cpool_offset = self.position();
        {
            let sink = Sink {
                file: &self.file,
                bytes_written: &self.bytes_written,
            };
            let mut buf = self.lanes[0].lock();
            let traces = self.call_traces.collect_marked();
            let threads = self.thread_set.collect();
            let mut writer = CpoolWriter {
                sink,
                lookup: Lookup::new(&mut self.method_map, &self.classes, &self.strings),
                base_id: self.base_id,
                start_ticks: self.start_ticks,
            };
            writer.write_all(&mut buf, &traces, &threads);
            writer.sink.flush(&mut buf);
        }

        let chunk_end = self.position();
        {
            let mut buf = self.lanes[0].lock();
            buf.reset();
            buf.skip(5);
            buf.patch_var32(0, (chunk_end - cpool_offset) as u32);
            let _ = self.file.write_at(buf.data(), cpool_offset);

            buf.reset();
            buf.put_u64(chunk_end - self.chunk_start);
            buf.put_u64(cpool_offset - self.chunk_start);
            buf.put_u64(CHUNK_HEADER_SIZE);
            buf.put_u64(self.start_time * 1000);
            buf.put_u64(self.stop_time.saturating_sub(self.start_time) * 1000);
            buf.put_u64(self.start_ticks);
            buf.put_u64(os::ticks_per_sec());
            let _ = self.file.write_at(buf.data(), self.chunk_start + 8);
            buf.reset();
        }
        os::free_page_cache(&self.file, self.chunk_start);
        chunk_end
    }

    /// Finish the current chunk and open the next one in the same file.
    pub fn switch_chunk(&mut self) {
        let end = self.finish_chunk(false);
        self.chunk_start = end;
        self.start_time = self.stop_time;
        self.start_ticks = self.stop_ticks;
        self.base_id += BASE_ID_STEP;
        self.bytes_written.store(0, Ordering::Relaxed);

        let sink = self.sink();
        let mut buf = self.lanes[0].lock();
        self.write_header(&mut buf);
        metadata::write_metadata(&mut buf, self.start_ticks);
        sink.flush(&mut buf);
    }

    /// Finish the recording and copy everything written so far to `target`.
    pub fn copy_to(&mut self, target: &File) -> std::io::Result<u64> {
        let end = self.finish_chunk(true);
        os::copy_range(&self.file, target, 0, end)
    }

    pub fn finish(&mut self) {
        self.finish_chunk(true);
    }

    // ---- event recording (shared-lock paths) ----

    pub fn record_event(&self, lane: usize, tid: i32, call_trace_id: u32, event: &EventPayload) {
        let sink = self.sink();
        let mut buf = self.lanes[lane % CONCURRENCY_LEVEL].lock();
        match event {
            EventPayload::Execution(e) => {
                self.encode_execution(&mut buf, T_EXECUTION_SAMPLE, tid, call_trace_id, e, false)
            }
            EventPayload::Method(e) => {
                self.encode_execution(&mut buf, T_METHOD_SAMPLE, tid, call_trace_id, e, true)
            }
            EventPayload::AllocInNewTlab(e) => {
                self.encode_alloc(&mut buf, T_ALLOC_IN_NEW_TLAB, tid, call_trace_id, e, true)
            }
            EventPayload::AllocOutsideTlab(e) => {
                self.encode_alloc(&mut buf, T_ALLOC_OUTSIDE_TLAB, tid, call_trace_id, e, false)
            }
            EventPayload::Liveness(e) => self.encode_liveness(&mut buf, tid, call_trace_id, e),
            EventPayload::MonitorEnter(e) => {
                self.encode_monitor_enter(&mut buf, tid, call_trace_id, e)
            }
            EventPayload::ThreadPark(e) => self.encode_thread_park(&mut buf, tid, call_trace_id, e),
        }
        sink.flush_if_needed(&mut buf, RECORDING_BUFFER_LIMIT);
        self.thread_set.add(tid);
    }

    pub fn record_trace_root(&self, lane: usize, tid: i32, event: &TraceRootEvent) {
        let sink = self.sink();
        let mut buf = self.lanes[lane % CONCURRENCY_LEVEL].lock();
        let start = buf.skip(1);
        buf.put_var32(T_ENDPOINT);
        buf.put_var64(os::ticks());
        buf.put_var64(0);
        buf.put_var32(tid as u32);
        buf.put_var64(self.biased(event.label));
        buf.put_var64(event.local_root_span_id);
        close_record(&mut buf, start);
        sink.flush_if_needed(&mut buf, RECORDING_BUFFER_LIMIT);
        self.thread_set.add(tid);
    }

    pub fn record_queue_time(&self, lane: usize, tid: i32, event: &QueueTimeEvent) {
        let sink = self.sink();
        let mut buf = self.lanes[lane % CONCURRENCY_LEVEL].lock();
        let start = buf.skip(1);
        buf.put_var32(T_QUEUE_TIME);
        buf.put_var64(event.start_ticks);
        buf.put_var64(event.end_ticks.saturating_sub(event.start_ticks));
        buf.put_var32(tid as u32);
        buf.put_var64(self.biased(event.task));
        buf.put_var64(self.biased(event.scheduler));
        buf.put_var64(self.biased(event.origin));
        buf.put_var64(event.queue_length);
        close_record(&mut buf, start);
        sink.flush_if_needed(&mut buf, RECORDING_BUFFER_LIMIT);
        self.thread_set.add(tid);
    }

    pub fn record_wallclock_epoch(&self, lane: usize, event: &WallClockEpochEvent) {
        let sink = self.sink();
        let mut buf = self.lanes[lane % CONCURRENCY_LEVEL].lock();
        let start = buf.skip(1);
        buf.put_var32(T_WALLCLOCK_SAMPLE_EPOCH);
        buf.put_var64(event.start_ticks);
        buf.put_var64(event.duration_millis);
        buf.put_var64(event.num_samplable_threads);
        buf.put_var64(event.num_successful_samples);
        buf.put_var64(event.num_failed_samples);
        buf.put_var64(event.num_exited_threads);
        buf.put_var64(event.num_permission_denied);
        close_record(&mut buf, start);
        sink.flush_if_needed(&mut buf, RECORDING_BUFFER_LIMIT);
    }

    /// Log records bypass the lanes: the whole record goes to the file in
    /// one write, so concurrent loggers never interleave partial records.
    pub fn record_log(&self, level: LogLevel, message: &str) {
        let mut buf = Buffer::with_capacity(message.len().min(MAX_STRING_LENGTH) + 64);
        let start = buf.skip(5);
        buf.put_var32(T_LOG);
        buf.put_var64(os::ticks());
        buf.put_var64(level as u64);
        buf.put_utf8(message);
        buf.patch_var32(start, (buf.offset() - start) as u32);
        self.sink().flush(&mut buf);
    }

    pub fn record_heap_usage(&self, used: u64, after_last_gc: bool) {
        let sink = self.sink();
        let mut buf = self.lanes[LIVENESS_LANE].lock();
        let start = buf.skip(1);
        buf.put_var32(T_HEAP_USAGE);
        buf.put_var64(os::ticks());
        buf.put_var64(used);
        buf.put_u8(after_last_gc as u8);
        close_record(&mut buf, start);
        sink.flush_if_needed(&mut buf, RECORDING_BUFFER_LIMIT);
    }

    // ---- event encoders ----

    fn encode_execution(
        &self,
        buf: &mut Buffer,
        type_id: u32,
        tid: i32,
        call_trace_id: u32,
        e: &ExecutionEvent,
        with_parallelism: bool,
    ) {
        let start = buf.skip(1);
        buf.put_var32(type_id);
        buf.put_var64(os::ticks());
        buf.put_var32(tid as u32);
        buf.put_var32(call_trace_id);
        buf.put_var64(e.thread_state as u64);
        buf.put_var64(e.context.span_id);
        buf.put_var64(e.context.root_span_id);
        buf.put_var64(e.weight);
        if with_parallelism {
            buf.put_var64(e.context.parallelism);
        }
        close_record(buf, start);
    }

    fn encode_alloc(
        &self,
        buf: &mut Buffer,
        type_id: u32,
        tid: i32,
        call_trace_id: u32,
        e: &AllocEvent,
        in_tlab: bool,
    ) {
        let start = buf.skip(1);
        buf.put_var32(type_id);
        buf.put_var64(os::ticks());
        buf.put_var32(tid as u32);
        buf.put_var32(call_trace_id);
        buf.put_var32(e.class_id);
        if in_tlab {
            buf.put_var64(e.instance_size);
        }
        buf.put_var64(e.total_size);
        buf.put_var64(e.context.span_id);
        buf.put_var64(e.context.root_span_id);
        close_record(buf, start);
    }

    fn encode_liveness(
        &self,
        buf: &mut Buffer,
        tid: i32,
        call_trace_id: u32,
        e: &ObjectLivenessEvent,
    ) {
        let start = buf.skip(1);
        buf.put_var32(T_HEAP_LIVE_OBJECT);
        buf.put_var64(e.start_ticks);
        buf.put_var32(tid as u32);
        buf.put_var32(call_trace_id);
        buf.put_var32(e.class_id);
        buf.put_var64(e.age);
        buf.put_var64(e.instance_size);
        buf.put_var64(e.interval);
        close_record(buf, start);
    }

    fn encode_monitor_enter(
        &self,
        buf: &mut Buffer,
        tid: i32,
        call_trace_id: u32,
        e: &LockEvent,
    ) {
        let start = buf.skip(1);
        buf.put_var32(T_MONITOR_ENTER);
        buf.put_var64(e.start_ticks);
        buf.put_var64(e.end_ticks.saturating_sub(e.start_ticks));
        buf.put_var32(tid as u32);
        buf.put_var32(call_trace_id);
        buf.put_var32(e.class_id);
        buf.put_u8(0);
        buf.put_var64(e.address);
        buf.put_var64(e.context.span_id);
        buf.put_var64(e.context.root_span_id);
        close_record(buf, start);
    }

    fn encode_thread_park(&self, buf: &mut Buffer, tid: i32, call_trace_id: u32, e: &LockEvent) {
        let start = buf.skip(1);
        buf.put_var32(T_THREAD_PARK);
        buf.put_var64(e.start_ticks);
        buf.put_var64(e.end_ticks.saturating_sub(e.start_ticks));
        buf.put_var32(tid as u32);
        buf.put_var32(call_trace_id);
        buf.put_var32(e.class_id);
        buf.put_var64(e.timeout_nanos);
        buf.put_var64(MIN_JLONG);
        buf.put_var64(e.address);
        close_record(buf, start);
    }

    // ---- chunk preamble ----

    fn write_header(&self, buf: &mut Buffer) {
        buf.put(MAGIC);
        buf.put_u16(VERSION_MAJOR);
        buf.put_u16(VERSION_MINOR);
        buf.put_u64(CHUNK_SIZE_PLACEHOLDER);
        buf.put_u64(0); // cpool offset, patched
        buf.put_u64(0); // meta offset, patched
        buf.put_u64(self.start_time * 1000);
        buf.put_u64(0); // duration, patched
        buf.put_u64(self.start_ticks);
        buf.put_u64(os::ticks_per_sec());
        buf.put_u32(1); // features
    }

    fn write_string_setting(
        &self,
        sink: &Sink<'_>,
        buf: &mut Buffer,
        category: u32,
        key: &str,
        value: Option<&str>,
    ) {
        let start = buf.skip(5);
        buf.put_var32(T_ACTIVE_SETTING);
        buf.put_var64(self.start_ticks);
        buf.put_u8(0);
        buf.put_var32(self.tid as u32);
        buf.put_u8(0);
        buf.put_var64(category as u64);
        buf.put_utf8(key);
        buf.put_utf8_opt(value);
        buf.patch_var32(start, (buf.offset() - start) as u32);
        sink.flush_if_needed(buf, RECORDING_BUFFER_LIMIT);
    }

    fn write_bool_setting(
        &self,
        sink: &Sink<'_>,
        buf: &mut Buffer,
        category: u32,
        key: &str,
        value: bool,
    ) {
        self.write_string_setting(sink, buf, category, key, Some(if value { "true" } else { "false" }));
    }

    fn write_int_setting(
        &self,
        sink: &Sink<'_>,
        buf: &mut Buffer,
        category: u32,
        key: &str,
        value: i64,
    ) {
        self.write_string_setting(sink, buf, category, key, Some(&value.to_string()));
    }

    fn write_list_setting(
        &self,
        sink: &Sink<'_>,
        buf: &mut Buffer,
        category: u32,
        key: &str,
        values: &[String],
    ) {
        for value in values {
            self.write_string_setting(sink, buf, category, key, Some(value));
        }
    }

    fn write_settings(&self, sink: &Sink<'_>, buf: &mut Buffer) {
        let args = &self.args;
        self.write_bool_setting(sink, buf, T_ACTIVE_RECORDING, "recorder", true);
        self.write_string_setting(
            sink,
            buf,
            T_ACTIVE_RECORDING,
            "version",
            Some(env!("CARGO_PKG_VERSION")),
        );
        self.write_string_setting(sink, buf, T_ACTIVE_RECORDING, "ring", args.ring.name());
        self.write_string_setting(sink, buf, T_ACTIVE_RECORDING, "cstack", args.cstack.name());
        self.write_string_setting(sink, buf, T_ACTIVE_RECORDING, "filter", args.filter.as_deref());
        self.write_list_setting(sink, buf, T_ACTIVE_RECORDING, "include", &args.include);
        self.write_list_setting(sink, buf, T_ACTIVE_RECORDING, "exclude", &args.exclude);
        self.write_int_setting(
            sink,
            buf,
            T_ACTIVE_RECORDING,
            "jstackdepth",
            args.jstack_depth as i64,
        );
        self.write_int_setting(sink, buf, T_ACTIVE_RECORDING, "chunksize", args.chunk_size);
        self.write_int_setting(sink, buf, T_ACTIVE_RECORDING, "chunktime", args.chunk_time);
        self.write_string_setting(
            sink,
            buf,
            T_ACTIVE_RECORDING,
            "loglevel",
            Some(args.log_level.name()),
        );

        self.write_bool_setting(sink, buf, T_EXECUTION_SAMPLE, "enabled", args.cpu >= 0);
        if args.cpu >= 0 {
            self.write_int_setting(sink, buf, T_EXECUTION_SAMPLE, "interval", args.cpu);
        }

        self.write_bool_setting(sink, buf, T_METHOD_SAMPLE, "enabled", args.wall >= 0);
        if args.wall >= 0 {
            self.write_int_setting(sink, buf, T_METHOD_SAMPLE, "interval", args.wall);
        }

        self.write_bool_setting(sink, buf, T_ALLOC_IN_NEW_TLAB, "enabled", args.alloc >= 0);
        self.write_bool_setting(sink, buf, T_ALLOC_OUTSIDE_TLAB, "enabled", args.alloc >= 0);
        if args.alloc >= 0 {
            self.write_int_setting(sink, buf, T_ALLOC_IN_NEW_TLAB, "alloc", args.alloc);
        }

        self.write_bool_setting(sink, buf, T_MONITOR_ENTER, "enabled", args.lock >= 0);
        self.write_bool_setting(sink, buf, T_THREAD_PARK, "enabled", args.lock >= 0);
        if args.lock >= 0 {
            self.write_int_setting(sink, buf, T_MONITOR_ENTER, "lock", args.lock);
        }

        self.write_bool_setting(sink, buf, T_HEAP_LIVE_OBJECT, "enabled", args.memleak > 0);
        if args.memleak > 0 {
            self.write_int_setting(sink, buf, T_HEAP_LIVE_OBJECT, "memleak", args.memleak);
            self.write_int_setting(sink, buf, T_HEAP_LIVE_OBJECT, "memleak_cap", args.memleak_cap);
        }
    }

    fn write_os_cpu_info(&self, sink: &Sink<'_>, buf: &mut Buffer) {
        let Some((summary, machine)) = os::uname_info() else {
            return;
        };
        let start = buf.skip(5);
        buf.put_var32(T_OS_INFORMATION);
        buf.put_var64(self.start_ticks);
        buf.put_utf8(&summary);
        buf.patch_var32(start, (buf.offset() - start) as u32);

        let start = buf.skip(5);
        buf.put_var32(T_CPU_INFORMATION);
        buf.put_var64(self.start_ticks);
        buf.put_utf8(&machine);
        buf.put_utf8(os::cpu_description().as_deref().unwrap_or(""));
        buf.put_u8(1);
        buf.put_var32(self.available_processors);
        buf.put_var32(self.available_processors);
        buf.patch_var32(start, (buf.offset() - start) as u32);
        sink.flush_if_needed(buf, RECORDING_BUFFER_LIMIT);
    }

    fn write_vm_info(&self, sink: &Sink<'_>, buf: &mut Buffer) {
        let Some(vm) = runtime::bridge().and_then(|b| b.vm_details()) else {
            return;
        };
        sink.flush_if_needed(buf, RECORDING_BUFFER_LIMIT - 5 * MAX_STRING_LENGTH);
        let start = buf.skip(5);
        buf.put_var32(T_VM_INFORMATION);
        buf.put_var64(self.start_ticks);
        buf.put_utf8(&vm.name);
        buf.put_utf8(&vm.version);
        buf.put_utf8(&vm.args);
        buf.put_utf8(&vm.flags);
        buf.put_utf8(&vm.launch_command);
        buf.put_var64(os::process_start_time_millis());
        buf.put_var64(os::process_id() as u64);
        buf.patch_var32(start, (buf.offset() - start) as u32);
    }

    fn write_system_properties(&self, sink: &Sink<'_>, buf: &mut Buffer) {
        let Some(bridge) = runtime::bridge() else {
            return;
        };
        for (key, value) in bridge.system_properties() {
            sink.flush_if_needed(buf, RECORDING_BUFFER_LIMIT - 2 * MAX_STRING_LENGTH);
            let start = buf.skip(5);
            buf.put_var32(T_INITIAL_SYSTEM_PROPERTY);
            buf.put_var64(self.start_ticks);
            buf.put_utf8(&key);
            buf.put_utf8(&value);
            buf.patch_var32(start, (buf.offset() - start) as u32);
        }
    }

    /// Append records for libraries loaded since the last call; the count
    /// watermark survives chunk rotation so each library appears once.
    fn write_native_libraries(&self, sink: &Sink<'_>, buf: &mut Buffer) {
        let recorded = self.recorded_lib_count.load(Ordering::Relaxed);
        if recorded < 0 {
            return;
        }
        let Some(bridge) = runtime::bridge() else {
            return;
        };
        let libs = bridge.native_libraries();
        for lib in libs.iter().skip(recorded as usize) {
            sink.flush_if_needed(buf, RECORDING_BUFFER_LIMIT - MAX_STRING_LENGTH);
            let start = buf.skip(5);
            buf.put_var32(T_NATIVE_LIBRARY);
            buf.put_var64(self.start_ticks);
            buf.put_utf8(&lib.name);
            buf.put_var64(lib.min_address);
            buf.put_var64(lib.max_address);
            buf.patch_var32(start, (buf.offset() - start) as u32);
        }
        self.recorded_lib_count.store(libs.len() as i32, Ordering::Relaxed);
    }

    fn write_recording_info(&self, sink: &Sink<'_>, buf: &mut Buffer) {
        let start = buf.skip(5);
        buf.put_var32(T_ACTIVE_RECORDING);
        buf.put_var64(self.recording_start_ticks);
        buf.put_var64(self.stop_ticks.saturating_sub(self.recording_start_ticks));
        buf.put_var32(self.tid as u32);
        buf.put_u8(0);
        buf.put_u8(1);
        buf.put_utf8(concat!("jfr-recording ", env!("CARGO_PKG_VERSION")));
        buf.put_utf8(self.args.file.as_deref().unwrap_or("recording.jfr"));
        buf.put_var64(MAX_JLONG);
        buf.put_u8(0);
        buf.put_var64(self.recording_start_time / 1000);
        buf.put_var64(self.stop_time.saturating_sub(self.recording_start_time) / 1000);
        buf.patch_var32(start, (buf.offset() - start) as u32);
        sink.flush_if_needed(buf, RECORDING_BUFFER_LIMIT);
    }
}

fn close_record(buf: &mut Buffer, start: usize) {
    let size = buf.offset() - start;
    debug_assert!(size < 0x80, "sample records must fit a one-byte size slot");
    buf.put_u8_at(start, size as u8);
}

/// Writes the ten constant pool sections of one chunk. Holds the exclusive
/// borrows (`method_map` via the lookup) that the shared-phase writers must
/// not see.
struct CpoolWriter<'a> {
    sink: Sink<'a>,
    lookup: Lookup<'a>,
    base_id: u64,
    start_ticks: u64,
}

impl CpoolWriter<'_> {
    fn write_all(
        &mut self,
        buf: &mut Buffer,
        traces: &BTreeMap<u32, Arc<CallTrace>>,
        threads: &[i32],
    ) {
        // the 5-byte size slot is patched through pwrite by the caller once
        // the final flush lands, since sections may flush mid-way
        buf.skip(5);
        buf.put_var32(T_CPOOL);
        buf.put_var64(self.start_ticks);
        buf.put_u8(0);
        buf.put_u8(0);
        buf.put_u8(1);
        buf.put_u8(CPOOL_SECTION_COUNT);

        self.write_frame_types(buf);
        self.write_thread_states(buf);
        self.write_threads(buf, threads);
        self.write_stack_traces(buf, traces);
        self.write_methods(buf);
        self.write_classes(buf);
        self.write_packages(buf);
        self.write_symbols(buf);
        self.write_strings(buf);
        self.write_log_levels(buf);
    }

    fn write_frame_types(&mut self, buf: &mut Buffer) {
        buf.put_var32(T_FRAME_TYPE);
        buf.put_var32(FRAME_TYPES.len() as u32);
        for ft in FRAME_TYPES {
            buf.put_var32(ft as u32);
            buf.put_utf8(ft.name());
        }
    }

    fn write_thread_states(&mut self, buf: &mut Buffer) {
        buf.put_var32(T_THREAD_STATE);
        buf.put_var32(2);
        buf.put_var32(THREAD_RUNNING);
        buf.put_utf8("STATE_RUNNABLE");
        buf.put_var32(THREAD_SLEEPING);
        buf.put_utf8("STATE_SLEEPING");
    }

    fn write_threads(&mut self, buf: &mut Buffer, threads: &[i32]) {
        let bridge = runtime::bridge();
        buf.put_var32(T_THREAD);
        buf.put_var32(threads.len() as u32);
        for &tid in threads {
            let details = bridge.as_ref().and_then(|b| b.thread_details(tid));
            let fallback;
            let (name, managed_id): (&str, u64) = match &details {
                Some(d) => (d.name.as_str(), d.managed_thread_id),
                None => {
                    fallback = format!("[tid={tid}]");
                    (fallback.as_str(), 0)
                }
            };
            buf.put_var32(tid as u32);
            buf.put_utf8(name);
            buf.put_var32(tid as u32);
            if managed_id == 0 {
                buf.put_u8(0);
            } else {
                buf.put_utf8(name);
            }
            buf.put_var64(managed_id);
            self.sink.flush_if_needed(buf, RECORDING_BUFFER_LIMIT);
        }
    }

    fn write_stack_traces(
        &mut self,
        buf: &mut Buffer,
        traces: &BTreeMap<u32, Arc<CallTrace>>,
    ) {
        buf.put_var32(T_STACK_TRACE);
        buf.put_var32(traces.len() as u32);
        for (&id, trace) in traces {
            buf.put_var32(id);
            // the flag byte records whether the walk was cut short; a
            // managed outermost frame that is a known entry point proves it
            // bottomed out
            let flag = match trace.frames.last() {
                Some(outer) => {
                    let mi = self.lookup.resolve(outer);
                    if mi.frame_type.is_java() {
                        !mi.is_entry
                    } else {
                        trace.truncated
                    }
                }
                None => trace.truncated,
            };
            buf.put_u8(flag as u8);
            buf.put_var32(trace.frames.len() as u32);
            for frame in trace.frames.iter() {
                let (key, line, bci, frame_type) = {
                    let mi = self.lookup.resolve(frame);
                    if mi.frame_type.is_java() {
                        let bci = unpack_bci(frame.bci);
                        (mi.key, mi.line_number(bci), bci, FrameType::decode(frame.bci))
                    } else {
                        (mi.key, 0, frame.bci, mi.frame_type)
                    }
                };
                buf.put_var32(key);
                buf.put_var32(line);
                buf.put_var32(bci as u32);
                buf.put_u8(frame_type as u8);
                self.sink.flush_if_needed(buf, RECORDING_BUFFER_LIMIT);
            }
        }
    }

    fn write_methods(&mut self, buf: &mut Buffer) {
        let base_id = self.base_id;
        let sink = &self.sink;
        buf.put_var32(T_METHOD);
        buf.put_var32(self.lookup.method_map.marked_count() as u32);
        for mi in self.lookup.method_map.values_mut() {
            if !mi.mark {
                continue;
            }
            mi.mark = false;
            buf.put_var32(mi.key);
            buf.put_var64(mi.class_id as u64);
            buf.put_var64(bias(base_id, mi.name_id));
            buf.put_var64(bias(base_id, mi.sig_id));
            buf.put_var64(mi.modifiers as u64);
            buf.put_var64(mi.is_hidden() as u64);
            sink.flush_if_needed(buf, RECORDING_BUFFER_LIMIT);
        }
    }

    fn write_classes(&mut self, buf: &mut Buffer) {
        let classes = self.lookup.classes.collect();
        buf.put_var32(T_CLASS);
        buf.put_var32(classes.len() as u32);
        for (id, name) in &classes {
            buf.put_var32(*id);
            buf.put_var64(0); // classLoader
            buf.put_var64(bias(self.base_id, self.lookup.symbol_id(name)));
            buf.put_var64(bias(self.base_id, self.lookup.package_id(name)));
            buf.put_var64(0); // modifiers
            self.sink.flush_if_needed(buf, RECORDING_BUFFER_LIMIT);
        }
    }

    fn write_packages(&mut self, buf: &mut Buffer) {
        let packages = self.lookup.packages.collect();
        buf.put_var32(T_PACKAGE);
        buf.put_var32(packages.len() as u32);
        for (id, name) in &packages {
            buf.put_var64(bias(self.base_id, *id));
            buf.put_var64(bias(self.base_id, self.lookup.symbol_id(name)));
            self.sink.flush_if_needed(buf, RECORDING_BUFFER_LIMIT);
        }
    }

    fn write_symbols(&mut self, buf: &mut Buffer) {
        let symbols = self.lookup.symbols.collect();
        self.write_dictionary_section(buf, T_SYMBOL, &symbols);
    }

    fn write_strings(&mut self, buf: &mut Buffer) {
        let strings = self.lookup.strings.collect();
        self.write_dictionary_section(buf, T_STRING, &strings);
    }

    fn write_dictionary_section(
        &mut self,
        buf: &mut Buffer,
        type_id: u32,
        entries: &BTreeMap<u32, Box<str>>,
    ) {
        buf.put_var32(type_id);
        buf.put_var32(entries.len() as u32);
        for (id, value) in entries {
            buf.put_var64(bias(self.base_id, *id));
            buf.put_utf8(value);
            self.sink.flush_if_needed(buf, RECORDING_BUFFER_LIMIT);
        }
    }

    fn write_log_levels(&mut self, buf: &mut Buffer) {
        buf.put_var32(T_LOG_LEVEL);
        buf.put_var32(LOG_LEVELS.len() as u32);
        for level in LOG_LEVELS {
            buf.put_var32(level as u32);
            buf.put_utf8(level.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::events::ExecutionEvent;
    use crate::recording::frames::CallFrame;
    use crate::recording::reader::TraceReader;
    use std::fs::OpenOptions;

    fn new_recording(dir: &tempfile::TempDir, args: &Arguments) -> (Recording, std::path::PathBuf) {
        let path = dir.path().join("rec.jfr");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        (Recording::new(file, args).unwrap(), path)
    }

    #[test]
    fn test_single_chunk_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let (mut rec, path) = new_recording(&dir, &Arguments::default());

        let tid = os::thread_id();
        let trace = rec.register_call_trace(
            &[CallFrame::native("do_work"), CallFrame::native("start_thread")],
            false,
        );
        for _ in 0..10 {
            rec.record_event(0, tid, trace, &EventPayload::Execution(ExecutionEvent::default()));
        }
        rec.finish();

        let reader = TraceReader::open(&path).unwrap();
        let chunks = reader.chunks().unwrap();
        assert_eq!(chunks.len(), 1);
        let chunk = &chunks[0];
        assert!(chunk.start_nanos > 0);
        assert_eq!(chunk.size, std::fs::metadata(&path).unwrap().len());
        assert_eq!(
            chunk
                .events
                .iter()
                .filter(|e| e.type_id == T_EXECUTION_SAMPLE)
                .count(),
            10
        );
        assert!(chunk.pool.stack_traces.contains_key(&(trace as u64)));
        assert_eq!(chunk.undefined_ids(), Vec::<String>::new());
    }

    #[test]
    fn test_switch_chunk_advances_base_id_and_stays_closed() {
        let dir = tempfile::TempDir::new().unwrap();
        let (mut rec, path) = new_recording(&dir, &Arguments::default());
        let tid = os::thread_id();

        let trace = rec.register_call_trace(&[CallFrame::native("lap_one")], false);
        rec.record_event(2, tid, trace, &EventPayload::Execution(ExecutionEvent::default()));
        rec.switch_chunk();

        // the same trace sampled again in the second chunk
        let trace2 = rec.register_call_trace(&[CallFrame::native("lap_one")], false);
        assert_eq!(trace, trace2);
        rec.record_event(2, tid, trace2, &EventPayload::Execution(ExecutionEvent::default()));
        rec.finish();

        let reader = TraceReader::open(&path).unwrap();
        let chunks = reader.chunks().unwrap();
        assert_eq!(chunks.len(), 2);
        for chunk in &chunks {
            assert_eq!(chunk.undefined_ids(), Vec::<String>::new());
            assert!(chunk.pool.stack_traces.contains_key(&(trace as u64)));
        }
        // symbol ids in the second chunk carry the advanced base id
        assert!(chunks[1].pool.symbols.keys().all(|id| *id >= BASE_ID_STEP));
        // method keys stay stable across the rotation
        let key_of = |c: &crate::recording::reader::ChunkSummary| {
            c.pool.stack_traces[&(trace as u64)].frames[0].method
        };
        assert_eq!(key_of(&chunks[0]), key_of(&chunks[1]));
    }

    #[test]
    fn test_need_switch_chunk_size_floor() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut args = Arguments::default();
        args.chunk_size = 1; // below the floor, raised to 256 KiB
        let (rec, _path) = new_recording(&dir, &args);
        assert!(!rec.need_switch_chunk(os::wall_clock_micros()));
        rec.bytes_written.store(CHUNK_SIZE_FLOOR, Ordering::Relaxed);
        assert!(rec.need_switch_chunk(os::wall_clock_micros()));
    }

    #[test]
    fn test_need_switch_chunk_time_policy() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut args = Arguments::default();
        args.chunk_time = 1; // raised to the 5 s floor
        let (rec, _path) = new_recording(&dir, &args);
        let now = os::wall_clock_micros();
        assert!(!rec.need_switch_chunk(now));
        assert!(rec.need_switch_chunk(now + CHUNK_TIME_FLOOR_MICROS));
    }

    #[test]
    fn test_log_record_is_single_write() {
        let dir = tempfile::TempDir::new().unwrap();
        let (mut rec, path) = new_recording(&dir, &Arguments::default());
        rec.record_log(LogLevel::Error, "boom");
        rec.finish();

        let reader = TraceReader::open(&path).unwrap();
        let chunks = reader.chunks().unwrap();
        let logs: Vec<_> = chunks[0]
            .events
            .iter()
            .filter(|e| e.type_id == T_LOG)
            .collect();
        assert_eq!(logs.len(), 1);
        assert_eq!(chunks[0].undefined_ids(), Vec::<String>::new());
    }

    #[test]
    fn test_sample_records_fit_one_size_byte() {
        // the widest encoder with worst-case varints must stay under 128
        let mut buf = Buffer::recording();
        let rec_dir = tempfile::TempDir::new().unwrap();
        let (rec, _path) = new_recording(&rec_dir, &Arguments::default());
        let e = LockEvent {
            start_ticks: u64::MAX,
            end_ticks: u64::MAX,
            class_id: u32::MAX,
            timeout_nanos: u64::MAX,
            address: u64::MAX,
            context: Default::default(),
        };
        rec.encode_monitor_enter(&mut buf, i32::MAX, u32::MAX, &e);
        assert!(buf.offset() < 0x80);
    }
}
