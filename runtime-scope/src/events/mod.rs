//! Event type registry
//!
//! Translates human-readable event specs (`cpu-cycles`, `cache-misses:10000`,
//! `trace:sched:sched_switch`) into the raw `PERF_TYPE_*` / `PERF_COUNT_*`
//! pair that `perf_event_open(2)` expects, and probes the host for which
//! events the current privilege level can actually open.

use std::fmt;

use log::debug;
use perf_event_open_sys::bindings as perf;

use crate::domain::{EngineError, EventCategory, Interval};

/// Resolved, immutable descriptor of one performance event.
///
/// Produced once by [`resolve`] and shared read-only by every per-thread
/// sample source for the lifetime of an engine run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventType {
    pub name: String,
    pub category: EventCategory,
    /// Raw kernel event type (`PERF_TYPE_*`)
    pub type_code: u32,
    /// Raw kernel event config (`PERF_COUNT_*` or tracepoint id)
    pub config: u64,
    /// Interval used when the configuration does not specify one
    pub default_interval: Interval,
}

impl EventType {
    /// Unit of the sample weight reported for this event.
    ///
    /// Clock events count nanoseconds; everything else counts occurrences.
    #[must_use]
    pub fn units(&self) -> &'static str {
        match self.name.as_str() {
            "cpu-clock" | "task-clock" => "ns",
            _ => "events",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (type={}, config={})", self.name, self.type_code, self.config)
    }
}

/// Outcome of parsing a full event spec string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEvent {
    pub event: EventType,
    /// Interval override parsed from the spec suffix, if any
    pub interval: Option<Interval>,
}

struct EventDef {
    name: &'static str,
    alias: Option<&'static str>,
    category: EventCategory,
    type_code: u32,
    config: u32,
    default_interval: Interval,
}

const fn hw(
    name: &'static str,
    alias: Option<&'static str>,
    config: u32,
    default_period: u64,
) -> EventDef {
    EventDef {
        name,
        alias,
        category: EventCategory::Hardware,
        type_code: perf::PERF_TYPE_HARDWARE,
        config,
        default_interval: Interval::Period(default_period),
    }
}

const fn sw(
    name: &'static str,
    alias: Option<&'static str>,
    config: u32,
    default_period: u64,
) -> EventDef {
    EventDef {
        name,
        alias,
        category: EventCategory::Software,
        type_code: perf::PERF_TYPE_SOFTWARE,
        config,
        default_interval: Interval::Period(default_period),
    }
}

/// Supported events, in the order `list_available` reports them.
static EVENT_TABLE: &[EventDef] = &[
    hw("cpu-cycles", Some("cycles"), perf::PERF_COUNT_HW_CPU_CYCLES, 1_000_000),
    hw("instructions", None, perf::PERF_COUNT_HW_INSTRUCTIONS, 1_000_000),
    hw("cache-references", None, perf::PERF_COUNT_HW_CACHE_REFERENCES, 1_000_000),
    hw("cache-misses", None, perf::PERF_COUNT_HW_CACHE_MISSES, 1_000),
    hw(
        "branch-instructions",
        Some("branches"),
        perf::PERF_COUNT_HW_BRANCH_INSTRUCTIONS,
        1_000_000,
    ),
    hw("branch-misses", None, perf::PERF_COUNT_HW_BRANCH_MISSES, 1_000),
    hw("bus-cycles", None, perf::PERF_COUNT_HW_BUS_CYCLES, 1_000_000),
    // Clock events are measured in nanoseconds: 10ms default period
    sw("cpu-clock", None, perf::PERF_COUNT_SW_CPU_CLOCK, 10_000_000),
    sw("task-clock", None, perf::PERF_COUNT_SW_TASK_CLOCK, 10_000_000),
    sw("page-faults", Some("faults"), perf::PERF_COUNT_SW_PAGE_FAULTS, 1_000),
    sw("minor-faults", None, perf::PERF_COUNT_SW_PAGE_FAULTS_MIN, 1_000),
    sw("major-faults", None, perf::PERF_COUNT_SW_PAGE_FAULTS_MAJ, 1),
    sw("context-switches", Some("cs"), perf::PERF_COUNT_SW_CONTEXT_SWITCHES, 1_000),
    sw("cpu-migrations", None, perf::PERF_COUNT_SW_CPU_MIGRATIONS, 1),
    sw("alignment-faults", None, perf::PERF_COUNT_SW_ALIGNMENT_FAULTS, 1),
    sw("emulation-faults", None, perf::PERF_COUNT_SW_EMULATION_FAULTS, 1),
];

/// Parse an event spec of the form `<event-name>[:<interval>]`.
///
/// The interval suffix is either a plain integer (period: sample every N
/// occurrences) or an integer followed by `Hz` (frequency: N samples per
/// second). Tracepoints use the three-part form `trace:<category>:<name>`
/// and are resolved through tracefs.
///
/// # Errors
/// [`EngineError::UnsupportedEvent`] for unknown names,
/// [`EngineError::InvalidInterval`] for a malformed interval suffix.
pub fn resolve(spec: &str) -> Result<ResolvedEvent, EngineError> {
    let (name, interval) = split_interval(spec)?;

    if let Some(tracepoint) = name.strip_prefix("trace:") {
        let event = resolve_tracepoint(tracepoint)?;
        return Ok(ResolvedEvent { event, interval });
    }

    let def = EVENT_TABLE
        .iter()
        .find(|def| def.name == name || def.alias == Some(name))
        .ok_or_else(|| EngineError::UnsupportedEvent(name.to_string()))?;

    Ok(ResolvedEvent {
        event: EventType {
            name: def.name.to_string(),
            category: def.category,
            type_code: def.type_code,
            config: u64::from(def.config),
            default_interval: def.default_interval,
        },
        interval,
    })
}

/// Names of the events the current host and privilege level can open,
/// in declaration order of the supported-event table.
///
/// Each candidate is verified with a trial counter open against the
/// calling thread; the probe fd is closed immediately, so discovery
/// leaves no kernel state behind.
#[must_use]
pub fn list_available() -> Vec<&'static str> {
    EVENT_TABLE
        .iter()
        .filter(|def| probe_open(def.type_code, u64::from(def.config)))
        .map(|def| def.name)
        .collect()
}

/// Split a trailing `:<interval>` suffix off an event spec.
///
/// Only the last `:`-separated segment is considered, and only when it
/// begins with a digit — tracepoint specs legitimately contain colons.
fn split_interval(spec: &str) -> Result<(&str, Option<Interval>), EngineError> {
    let Some((head, tail)) = spec.rsplit_once(':') else {
        return Ok((spec, None));
    };
    if !tail.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        return Ok((spec, None));
    }

    let interval = if let Some(freq) = tail.strip_suffix("Hz").or_else(|| tail.strip_suffix("hz"))
    {
        Interval::Frequency(
            freq.parse().map_err(|_| EngineError::InvalidInterval(tail.to_string()))?,
        )
    } else {
        Interval::Period(
            tail.parse().map_err(|_| EngineError::InvalidInterval(tail.to_string()))?,
        )
    };

    match interval {
        Interval::Period(0) | Interval::Frequency(0) => {
            Err(EngineError::InvalidInterval(tail.to_string()))
        }
        _ => Ok((head, Some(interval))),
    }
}

/// Resolve `<category>:<name>` against tracefs.
fn resolve_tracepoint(tracepoint: &str) -> Result<EventType, EngineError> {
    let Some((category, name)) = tracepoint.split_once(':') else {
        return Err(EngineError::UnsupportedEvent(format!("trace:{tracepoint}")));
    };
    if category.is_empty() || name.is_empty() || category.contains('/') || name.contains('/') {
        return Err(EngineError::UnsupportedEvent(format!("trace:{tracepoint}")));
    }

    // Mounted at /sys/kernel/tracing on current kernels; the debugfs
    // location still exists on older ones.
    let id = [
        format!("/sys/kernel/tracing/events/{category}/{name}/id"),
        format!("/sys/kernel/debug/tracing/events/{category}/{name}/id"),
    ]
    .iter()
    .find_map(|path| std::fs::read_to_string(path).ok())
    .and_then(|text| text.trim().parse::<u64>().ok())
    .ok_or_else(|| EngineError::UnsupportedEvent(format!("trace:{tracepoint}")))?;

    Ok(EventType {
        name: format!("trace:{category}:{name}"),
        category: EventCategory::Tracepoint,
        type_code: perf::PERF_TYPE_TRACEPOINT,
        config: id,
        default_interval: Interval::Period(1),
    })
}

/// Trial-open a disabled counting event for the calling thread.
///
/// Success means the kernel supports the event and the current privilege
/// level may open it. The probe fd is closed before returning.
#[allow(unsafe_code)]
fn probe_open(type_code: u32, config: u64) -> bool {
    let mut attr = perf::perf_event_attr::default();
    attr.size = u32::try_from(std::mem::size_of_val(&attr)).unwrap_or(0);
    attr.type_ = type_code;
    attr.config = config;
    attr.set_disabled(1);
    attr.set_exclude_hv(1);
    // Match the sampling attr so discovery agrees with a later open
    // under the same privilege level
    if type_code != perf::PERF_TYPE_TRACEPOINT {
        attr.set_exclude_kernel(1);
    }

    // SAFETY: attr outlives the syscall; pid=0/cpu=-1 observes the caller
    let fd = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            std::ptr::addr_of_mut!(attr),
            0,
            -1,
            -1,
            u64::from(perf::PERF_FLAG_FD_CLOEXEC),
        )
    };
    if fd < 0 {
        debug!(
            "event probe failed for type={type_code} config={config}: {}",
            std::io::Error::last_os_error()
        );
        return false;
    }

    #[allow(clippy::cast_possible_truncation)]
    // SAFETY: fd was just returned by perf_event_open
    unsafe {
        libc::close(fd as libc::c_int);
    }
    true
}
