//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers prevent common bugs like passing a PID where a
//! TID is expected, and make function signatures more expressive.

use std::fmt;

/// Process ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

/// Kernel thread ID, as returned by `gettid(2)`.
///
/// This is the identifier perf counters and thread-directed signals are
/// keyed by. It is distinct from [`Pid`]: every thread of a process has
/// its own TID, and the main thread's TID equals the PID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tid(pub u32);

impl Tid {
    /// TID of the calling thread.
    #[must_use]
    pub fn current() -> Self {
        // SAFETY: gettid has no failure modes and touches no memory
        #[allow(unsafe_code)]
        let tid = unsafe { libc::syscall(libc::SYS_gettid) };
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Tid(tid as u32)
    }

    #[must_use]
    pub fn as_raw(self) -> libc::pid_t {
        #[allow(clippy::cast_possible_wrap)]
        {
            self.0 as libc::pid_t
        }
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TID:{}", self.0)
    }
}

/// Which kernel subsystem counts occurrences of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCategory {
    /// PMU counter (cycles, instructions, cache events)
    Hardware,
    /// Kernel software counter (clocks, faults, context switches)
    Software,
    /// Static kernel tracepoint, resolved through tracefs
    Tracepoint,
}

/// Sampling rate: either one sample every N event occurrences, or N
/// samples per second (the kernel adjusts the period dynamically).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interval {
    /// Sample every N occurrences of the event
    Period(u64),
    /// Sample N times per second
    Frequency(u64),
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interval::Period(n) => write!(f, "every {n} events"),
            Interval::Frequency(n) => write!(f, "{n}Hz"),
        }
    }
}

/// Which stack-capture facility each sample record carries.
///
/// Fixed for the lifetime of an engine run. `Kernel` asks the kernel to
/// attach its own callchain to every record; `User` records only the
/// interrupted instruction pointer and leaves stack walking to the
/// signal handler's frame-pointer unwinder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RingMode {
    /// Frame-pointer walk of the interrupted user context (default)
    #[default]
    User,
    /// Kernel-assisted callchain (`PERF_SAMPLE_CALLCHAIN`)
    Kernel,
}

impl fmt::Display for RingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RingMode::User => write!(f, "user"),
            RingMode::Kernel => write!(f, "kernel"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tid_display() {
        assert_eq!(Tid(1234).to_string(), "TID:1234");
        assert_eq!(Pid(42).to_string(), "PID:42");
    }

    #[test]
    fn test_tid_current_is_nonzero() {
        assert_ne!(Tid::current().0, 0);
    }

    #[test]
    fn test_interval_display() {
        assert_eq!(Interval::Period(1_000_000).to_string(), "every 1000000 events");
        assert_eq!(Interval::Frequency(99).to_string(), "99Hz");
    }

    #[test]
    fn test_ring_mode_default() {
        assert_eq!(RingMode::default(), RingMode::User);
    }
}
