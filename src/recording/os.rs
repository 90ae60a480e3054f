//! Thin libc wrappers: clocks, thread ids, CPU accounting, uname, and the
//! file-range copy used by `dump`.

use std::ffi::CStr;
use std::fs::File;
use std::io::{self, Write};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;

/// OS thread id of the calling thread.
pub fn thread_id() -> i32 {
    // SAFETY: SYS_gettid takes no arguments and always succeeds.
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

fn clock_micros(clock: libc::clockid_t) -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid timespec on the stack and the clock id is a
    // compile-time constant supported on Linux.
    unsafe {
        libc::clock_gettime(clock, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000 + ts.tv_nsec as u64 / 1_000
}

/// Wall clock in microseconds since the epoch.
pub fn wall_clock_micros() -> u64 {
    clock_micros(libc::CLOCK_REALTIME)
}

/// Tick source for event timestamps: CLOCK_MONOTONIC nanoseconds.
pub fn ticks() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: as in clock_micros.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

pub fn ticks_per_sec() -> u64 {
    1_000_000_000
}

pub fn available_processors() -> u32 {
    // SAFETY: sysconf is always safe to call.
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n < 1 {
        1
    } else {
        n as u32
    }
}

pub fn process_id() -> u32 {
    std::process::id()
}

/// Process start time in milliseconds since the epoch, from boot time plus
/// the starttime field of /proc/self/stat. Zero when unavailable.
pub fn process_start_time_millis() -> u64 {
    fn inner() -> Option<u64> {
        let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
        // field 22, counting from after the parenthesized comm
        let rest = stat.get(stat.rfind(')')? + 2..)?;
        let start_ticks: u64 = rest.split_whitespace().nth(19)?.parse().ok()?;
        let btime: u64 = std::fs::read_to_string("/proc/stat")
            .ok()?
            .lines()
            .find(|l| l.starts_with("btime "))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()?;
        // SAFETY: sysconf is always safe to call.
        let hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if hz <= 0 {
            return None;
        }
        Some(btime * 1000 + start_ticks * 1000 / hz as u64)
    }
    inner().unwrap_or(0)
}

/// One CPU time sample. `real` is the denominator the deltas of `user` and
/// `system` are compared against, so all three share one unit per source.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CpuTime {
    pub real: u64,
    pub user: u64,
    pub system: u64,
}

/// Process CPU time from getrusage, in microseconds, with wall-clock
/// microseconds as the denominator.
pub fn process_cpu_time() -> Option<CpuTime> {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    // SAFETY: `usage` is a zeroed rusage struct owned by this frame.
    if unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) } != 0 {
        return None;
    }
    let tv = |t: libc::timeval| t.tv_sec as u64 * 1_000_000 + t.tv_usec as u64;
    Some(CpuTime {
        real: wall_clock_micros(),
        user: tv(usage.ru_utime),
        system: tv(usage.ru_stime),
    })
}

/// Machine-wide CPU time from the aggregate line of /proc/stat, in jiffies.
/// `real` is the sum of all columns, so busy/real is already normalized
/// across CPUs.
pub fn total_cpu_time() -> Option<CpuTime> {
    let stat = std::fs::read_to_string("/proc/stat").ok()?;
    let line = stat.lines().next()?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 7 {
        return None;
    }
    let user = fields[0] + fields[1];
    let system = fields[2] + fields[5] + fields[6];
    Some(CpuTime {
        real: fields.iter().sum(),
        user,
        system,
    })
}

/// `uname` summary and machine architecture for the OS/CPU info records.
pub fn uname_info() -> Option<(String, String)> {
    let mut u: libc::utsname = unsafe { std::mem::zeroed() };
    // SAFETY: `u` is a zeroed utsname owned by this frame.
    if unsafe { libc::uname(&mut u) } != 0 {
        return None;
    }
    // SAFETY: uname NUL-terminates every field.
    let field = |f: &[libc::c_char]| unsafe {
        CStr::from_ptr(f.as_ptr()).to_string_lossy().into_owned()
    };
    let summary = format!(
        "uname: {} {} {} {}",
        field(&u.sysname),
        field(&u.release),
        field(&u.version),
        field(&u.machine)
    );
    Some((summary, field(&u.machine)))
}

/// First "model name" entry of /proc/cpuinfo, if any.
pub fn cpu_description() -> Option<String> {
    let info = std::fs::read_to_string("/proc/cpuinfo").ok()?;
    let line = info.lines().find(|l| l.starts_with("model name"))?;
    Some(line.split(':').nth(1)?.trim().to_string())
}

/// Copy `[offset, end)` of `src` into `dst` at its current position.
pub fn copy_range(src: &File, dst: &File, mut offset: u64, end: u64) -> io::Result<u64> {
    let mut buf = vec![0u8; 65536];
    let mut copied = 0u64;
    let mut out = dst;
    while offset < end {
        let want = buf.len().min((end - offset) as usize);
        let n = src.read_at(&mut buf[..want], offset)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
        offset += n as u64;
        copied += n as u64;
    }
    Ok(copied)
}

/// Tell the kernel the finished chunk range will not be re-read.
pub fn free_page_cache(file: &File, offset: u64) {
    // SAFETY: the fd is open for the lifetime of `file`; fadvise cannot
    // invalidate memory.
    unsafe {
        libc::posix_fadvise(
            file.as_raw_fd(),
            offset as libc::off_t,
            0,
            libc::POSIX_FADV_DONTNEED,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_id_is_stable_within_thread() {
        assert_eq!(thread_id(), thread_id());
        assert!(thread_id() > 0);
    }

    #[test]
    fn test_ticks_are_monotonic() {
        let a = ticks();
        let b = ticks();
        assert!(b >= a);
    }

    #[test]
    fn test_process_cpu_time_advances() {
        let t = process_cpu_time().unwrap();
        assert!(t.real > 0);
    }

    #[test]
    fn test_copy_range() {
        use std::io::{Seek, SeekFrom};
        let dir = tempfile::TempDir::new().unwrap();
        let src_path = dir.path().join("src");
        std::fs::write(&src_path, b"0123456789").unwrap();
        let src = File::open(&src_path).unwrap();
        let dst_path = dir.path().join("dst");
        let mut dst = File::create(&dst_path).unwrap();
        let copied = copy_range(&src, &dst, 2, 8).unwrap();
        assert_eq!(copied, 6);
        dst.seek(SeekFrom::Start(0)).unwrap();
        assert_eq!(std::fs::read(&dst_path).unwrap(), b"234567");
    }
}
