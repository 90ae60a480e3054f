//! Recording option parsing.
//!
//! Options arrive as one comma-separated `key=value` string, the way an
//! embedding agent passes them. Every recognized key either changes the
//! settings section of the chunk preamble or flips an event class on.

use serde::Serialize;

use crate::recording::error::RecorderError;
use crate::recording::events::LogLevel;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RingMode {
    Any,
    Kernel,
    User,
}

impl RingMode {
    pub fn name(self) -> Option<&'static str> {
        match self {
            RingMode::Any => None,
            RingMode::Kernel => Some("kernel"),
            RingMode::User => Some("user"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CStackMode {
    Default,
    No,
    Fp,
    Dwarf,
    Lbr,
}

impl CStackMode {
    pub fn name(self) -> Option<&'static str> {
        match self {
            CStackMode::Default => None,
            CStackMode::No => Some("no"),
            CStackMode::Fp => Some("fp"),
            CStackMode::Dwarf => Some("dwarf"),
            CStackMode::Lbr => Some("lbr"),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Arguments {
    pub file: Option<String>,
    /// Bytes per chunk; values below the floor are raised, <= 0 disables
    /// size-based rotation.
    pub chunk_size: i64,
    /// Microseconds per chunk; <= 0 disables time-based rotation.
    pub chunk_time: i64,
    /// Sampling intervals; -1 disables the event class.
    pub cpu: i64,
    pub wall: i64,
    pub alloc: i64,
    pub lock: i64,
    pub memleak: i64,
    pub memleak_cap: i64,
    pub ring: RingMode,
    pub cstack: CStackMode,
    pub jstack_depth: u32,
    pub filter: Option<String>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    #[serde(skip)]
    pub log_level: LogLevel,
    pub no_system_info: bool,
    pub no_system_props: bool,
    pub no_native_libs: bool,
    pub no_cpu_load: bool,
    pub record_heap_usage: bool,
}

impl Default for Arguments {
    fn default() -> Self {
        Self {
            file: None,
            chunk_size: 100 * 1024 * 1024,
            chunk_time: 0,
            cpu: -1,
            wall: -1,
            alloc: -1,
            lock: -1,
            memleak: -1,
            memleak_cap: -1,
            ring: RingMode::Any,
            cstack: CStackMode::Default,
            jstack_depth: 2048,
            filter: None,
            include: Vec::new(),
            exclude: Vec::new(),
            log_level: LogLevel::Info,
            no_system_info: false,
            no_system_props: false,
            no_native_libs: false,
            no_cpu_load: false,
            record_heap_usage: false,
        }
    }
}

impl Arguments {
    pub fn parse(options: &str) -> Result<Arguments, RecorderError> {
        let mut args = Arguments::default();
        for option in options.split(',') {
            let option = option.trim();
            if option.is_empty() {
                continue;
            }
            let (key, value) = match option.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (option, None),
            };
            match key {
                "file" => args.file = Some(required(key, value)?.to_string()),
                "chunksize" => args.chunk_size = parse_size(key, required(key, value)?)?,
                "chunktime" => args.chunk_time = parse_micros(key, required(key, value)?)?,
                "cpu" => args.cpu = parse_nanos(key, required(key, value)?)?,
                "wall" => args.wall = parse_nanos(key, required(key, value)?)?,
                "alloc" => args.alloc = parse_size(key, required(key, value)?)?,
                "lock" => args.lock = parse_nanos(key, required(key, value)?)?,
                "memleak" => args.memleak = parse_size(key, required(key, value)?)?,
                "memleak_cap" => args.memleak_cap = parse_size(key, required(key, value)?)?,
                "ring" => {
                    args.ring = match required(key, value)? {
                        "kernel" => RingMode::Kernel,
                        "user" => RingMode::User,
                        other => return Err(bad(key, other)),
                    }
                }
                "cstack" => {
                    args.cstack = match required(key, value)? {
                        "no" => CStackMode::No,
                        "fp" => CStackMode::Fp,
                        "dwarf" => CStackMode::Dwarf,
                        "lbr" => CStackMode::Lbr,
                        other => return Err(bad(key, other)),
                    }
                }
                "jstackdepth" => {
                    args.jstack_depth = required(key, value)?
                        .parse()
                        .map_err(|_| bad(key, value.unwrap_or("")))?
                }
                "filter" => args.filter = Some(required(key, value)?.to_string()),
                "include" => args.include.push(required(key, value)?.to_string()),
                "exclude" => args.exclude.push(required(key, value)?.to_string()),
                "loglevel" => {
                    let v = required(key, value)?;
                    args.log_level = LogLevel::parse(v).ok_or_else(|| bad(key, v))?
                }
                "no-system-info" => args.no_system_info = true,
                "no-system-props" => args.no_system_props = true,
                "no-native-libs" => args.no_native_libs = true,
                "no-cpu-load" => args.no_cpu_load = true,
                "heapusage" => args.record_heap_usage = true,
                _ => return Err(RecorderError::BadArgument(option.to_string())),
            }
        }
        Ok(args)
    }
}

fn required<'v>(key: &str, value: Option<&'v str>) -> Result<&'v str, RecorderError> {
    value.ok_or_else(|| RecorderError::BadArgument(format!("{key} requires a value")))
}

fn bad(key: &str, value: &str) -> RecorderError {
    RecorderError::BadArgument(format!("{key}={value}"))
}

fn split_unit(value: &str) -> (&str, &str) {
    let digits = value
        .find(|c: char| !c.is_ascii_digit() && c != '-')
        .unwrap_or(value.len());
    (&value[..digits], &value[digits..])
}

/// Byte count with an optional k/m/g suffix.
fn parse_size(key: &str, value: &str) -> Result<i64, RecorderError> {
    let (num, unit) = split_unit(value);
    let n: i64 = num.parse().map_err(|_| bad(key, value))?;
    let factor = match unit {
        "" => 1,
        "k" | "K" => 1024,
        "m" | "M" => 1024 * 1024,
        "g" | "G" => 1024 * 1024 * 1024,
        _ => return Err(bad(key, value)),
    };
    Ok(n * factor)
}

/// Duration in microseconds; bare numbers are microseconds.
fn parse_micros(key: &str, value: &str) -> Result<i64, RecorderError> {
    let (num, unit) = split_unit(value);
    let n: i64 = num.parse().map_err(|_| bad(key, value))?;
    let factor = match unit {
        "" | "us" => 1,
        "ms" => 1_000,
        "s" => 1_000_000,
        "m" => 60 * 1_000_000,
        _ => return Err(bad(key, value)),
    };
    Ok(n * factor)
}

/// Duration in nanoseconds; bare numbers are nanoseconds.
fn parse_nanos(key: &str, value: &str) -> Result<i64, RecorderError> {
    let (num, unit) = split_unit(value);
    let n: i64 = num.parse().map_err(|_| bad(key, value))?;
    let factor = match unit {
        "" | "ns" => 1,
        "us" => 1_000,
        "ms" => 1_000_000,
        "s" => 1_000_000_000,
        _ => return Err(bad(key, value)),
    };
    Ok(n * factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_option_string() {
        let args = Arguments::parse(
            "file=/tmp/rec.jfr,chunksize=1m,chunktime=5s,cpu=10ms,alloc=512k,\
             ring=kernel,cstack=dwarf,jstackdepth=64,include=main*,include=worker*,\
             exclude=gc,no-cpu-load,loglevel=warn",
        )
        .unwrap();
        assert_eq!(args.file.as_deref(), Some("/tmp/rec.jfr"));
        assert_eq!(args.chunk_size, 1024 * 1024);
        assert_eq!(args.chunk_time, 5_000_000);
        assert_eq!(args.cpu, 10_000_000);
        assert_eq!(args.alloc, 512 * 1024);
        assert_eq!(args.ring, RingMode::Kernel);
        assert_eq!(args.cstack, CStackMode::Dwarf);
        assert_eq!(args.jstack_depth, 64);
        assert_eq!(args.include, vec!["main*", "worker*"]);
        assert_eq!(args.exclude, vec!["gc"]);
        assert!(args.no_cpu_load);
        assert_eq!(args.log_level, LogLevel::Warn);
        // untouched defaults stay disabled
        assert_eq!(args.wall, -1);
        assert_eq!(args.memleak, -1);
    }

    #[test]
    fn test_negative_interval_disables() {
        let args = Arguments::parse("cpu=-1").unwrap();
        assert_eq!(args.cpu, -1);
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        assert!(matches!(
            Arguments::parse("definitely-not-an-option=1"),
            Err(RecorderError::BadArgument(_))
        ));
    }

    #[test]
    fn test_bad_suffix_is_rejected() {
        assert!(Arguments::parse("chunksize=10x").is_err());
        assert!(Arguments::parse("cpu=10h").is_err());
    }

    #[test]
    fn test_missing_value_is_rejected() {
        assert!(Arguments::parse("file").is_err());
    }

    #[test]
    fn test_empty_string_is_defaults() {
        let args = Arguments::parse("").unwrap();
        assert!(args.file.is_none());
        assert_eq!(args.memleak, -1);
    }
}
