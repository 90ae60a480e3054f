//! Process and machine CPU load sampling.
//!
//! Each controller tick reads process CPU time (getrusage) and machine
//! totals (/proc/stat), derives clamped load ratios from the deltas, and
//! appends a CpuLoad event to a dedicated small buffer so load samples
//! survive even when the sampling lanes are idle.

use crate::recording::buffer::{Buffer, SMALL_BUFFER_LIMIT};
use crate::recording::chunk::Sink;
use crate::recording::jfr::T_CPU_LOAD;
use crate::recording::os::{self, CpuTime};
use crate::recording::spinlock::SpinLock;

#[derive(Clone, Copy, Debug, Default)]
pub struct CpuTimes {
    pub proc: CpuTime,
    pub total: CpuTime,
}

fn ratio(value: f32) -> f32 {
    if value < 0.0 {
        0.0
    } else if value > 1.0 {
        1.0
    } else {
        value
    }
}

/// Load ratios derived from two consecutive samples. Pure so the clamping
/// rules are testable without a live /proc.
pub fn compute_load(last: &CpuTimes, current: &CpuTimes, ncpu: u32) -> (f32, f32, f32) {
    let mut proc_user = 0.0;
    let mut proc_system = 0.0;
    let mut machine_total = 0.0;

    if current.proc.real > last.proc.real {
        let delta = (current.proc.real - last.proc.real) as f32 * ncpu.max(1) as f32;
        proc_user = ratio(current.proc.user.saturating_sub(last.proc.user) as f32 / delta);
        proc_system = ratio(current.proc.system.saturating_sub(last.proc.system) as f32 / delta);
    }

    if current.total.real > last.total.real {
        let delta = (current.total.real - last.total.real) as f32;
        let busy = (current.total.user + current.total.system)
            .saturating_sub(last.total.user + last.total.system) as f32;
        machine_total = ratio(busy / delta);
        if machine_total < proc_user + proc_system {
            machine_total = ratio(proc_user + proc_system);
        }
    }

    (proc_user, proc_system, machine_total)
}

pub struct CpuLoadMonitor {
    enabled: bool,
    buf: SpinLock<Buffer>,
    last: SpinLock<CpuTimes>,
}

impl CpuLoadMonitor {
    pub fn new(enabled: bool) -> Self {
        let last = if enabled {
            CpuTimes {
                proc: os::process_cpu_time().unwrap_or_default(),
                total: os::total_cpu_time().unwrap_or_default(),
            }
        } else {
            CpuTimes::default()
        };
        Self {
            enabled,
            buf: SpinLock::new(Buffer::small()),
            last: SpinLock::new(last),
        }
    }

    /// One monitor tick: sample, derive, encode.
    pub fn cycle(&self, sink: &Sink<'_>, ncpu: u32) {
        if !self.enabled {
            return;
        }
        let current = CpuTimes {
            proc: os::process_cpu_time().unwrap_or_default(),
            total: os::total_cpu_time().unwrap_or_default(),
        };
        let (proc_user, proc_system, machine_total) = {
            let last = self.last.lock();
            compute_load(&last, &current, ncpu)
        };

        let mut buf = self.buf.lock();
        let start = buf.skip(1);
        buf.put_var32(T_CPU_LOAD);
        buf.put_var64(os::ticks());
        buf.put_f32(proc_user);
        buf.put_f32(proc_system);
        buf.put_f32(machine_total);
        let size = buf.offset() - start;
        buf.put_u8_at(start, size as u8);
        sink.flush_if_needed(&mut buf, SMALL_BUFFER_LIMIT);
        drop(buf);

        *self.last.lock() = current;
    }

    /// Drain whatever the monitor buffered; called on chunk boundaries.
    pub fn flush(&self, sink: &Sink<'_>) {
        sink.flush(&mut self.buf.lock());
    }
}
