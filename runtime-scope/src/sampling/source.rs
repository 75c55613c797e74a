//! Per-thread sample source
//!
//! One kernel counter plus its mmapped ring buffer, restricted to a single
//! thread. Overflow notifications are delivered as a thread-directed
//! SIGPROF via the `O_ASYNC`/`F_SETSIG`/`F_SETOWN_EX` fcntl triple, so the
//! handler always runs on the sampled thread's own context.

#![allow(unsafe_code)] // syscall/fcntl/mmap surface

use std::io;

use log::debug;
use perf_event_open_sys::bindings as perf;
use perf_event_open_sys::ioctls;

use super::ring::DATA_PAGES;
use super::slots::SourceInner;
use crate::domain::{EventCategory, Interval, RingMode, Tid};
use crate::events::EventType;

// Directed-signal fcntls, not exposed by the libc crate
const F_SETOWN_EX: libc::c_int = 15;
const F_SETSIG: libc::c_int = 10;
const F_OWNER_TID: libc::c_int = 0;

#[repr(C)]
struct FOwnerEx {
    type_: libc::c_int,
    pid: libc::pid_t,
}

fn sample_type(ring: RingMode) -> u64 {
    let mut bits = u64::from(perf::PERF_SAMPLE_IP)
        | u64::from(perf::PERF_SAMPLE_TID)
        | u64::from(perf::PERF_SAMPLE_TIME)
        | u64::from(perf::PERF_SAMPLE_PERIOD);
    if ring == RingMode::Kernel {
        bits |= u64::from(perf::PERF_SAMPLE_CALLCHAIN);
    }
    bits
}

fn sampling_attr(event: &EventType, interval: Interval, ring: RingMode) -> perf::perf_event_attr {
    let mut attr = perf::perf_event_attr::default();
    attr.size = u32::try_from(std::mem::size_of_val(&attr)).unwrap_or(0);
    attr.type_ = event.type_code;
    attr.config = event.config;
    attr.sample_type = sample_type(ring);
    match interval {
        Interval::Period(n) => attr.__bindgen_anon_1.sample_period = n,
        Interval::Frequency(n) => {
            attr.__bindgen_anon_1.sample_freq = n;
            attr.set_freq(1);
        }
    }
    attr.set_disabled(1); // armed only once the ring and signal are wired up
    attr.set_exclude_hv(1);
    if event.category != EventCategory::Tracepoint {
        // User-space samples only: keeps counters openable at
        // perf_event_paranoid=2. Tracepoints fire in kernel context and
        // would be suppressed by the exclusion.
        attr.set_exclude_kernel(1);
    }
    attr.__bindgen_anon_2.wakeup_events = 1; // one overflow, one signal
    attr
}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(sz).unwrap_or(4096)
}

/// Open, map and arm a counter for `tid`.
///
/// On success the counter is already enabled: the kernel will deliver a
/// thread-directed SIGPROF to `tid` on every overflow.
///
/// # Errors
/// Any failing syscall, with intermediate resources cleaned up.
pub fn open_source(tid: Tid, event: &EventType, interval: Interval, ring: RingMode) -> io::Result<SourceInner> {
    let mut attr = sampling_attr(event, interval, ring);

    // SAFETY: attr outlives the syscall
    let fd = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            std::ptr::addr_of_mut!(attr),
            tid.as_raw(),
            -1,
            -1,
            u64::from(perf::PERF_FLAG_FD_CLOEXEC),
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    #[allow(clippy::cast_possible_truncation)]
    let fd = fd as libc::c_int;

    let page_size = page_size();
    let mmap_len = (DATA_PAGES + 1) * page_size;
    // SAFETY: fresh mapping over the perf fd
    let base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            mmap_len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        let err = io::Error::last_os_error();
        // SAFETY: fd is ours and open
        unsafe { libc::close(fd) };
        return Err(err);
    }

    let mut inner = SourceInner {
        fd,
        base: base.cast::<u8>(),
        mmap_len,
        page_size,
        cursor: 0,
    };

    if let Err(err) = arm_signal_delivery(fd, tid) {
        close_source(&mut inner);
        return Err(err);
    }

    // SAFETY: fd is a valid perf event fd
    unsafe {
        ioctls::RESET(fd, 0);
        ioctls::ENABLE(fd, 0);
    }
    debug!("armed sample source for {tid} (fd {fd})");
    Ok(inner)
}

/// Route overflow notifications as SIGPROF directly to `tid`.
fn arm_signal_delivery(fd: libc::c_int, tid: Tid) -> io::Result<()> {
    let owner = FOwnerEx { type_: F_OWNER_TID, pid: tid.as_raw() };
    // SAFETY: fd is ours; owner outlives the calls
    unsafe {
        if libc::fcntl(fd, F_SETOWN_EX, std::ptr::addr_of!(owner)) == -1
            || libc::fcntl(fd, libc::F_SETFL, libc::O_RDWR | libc::O_NONBLOCK | libc::O_ASYNC) == -1
            || libc::fcntl(fd, F_SETSIG, libc::SIGPROF) == -1
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Disarm and release a source. Order matters: the counter is disabled
/// and signal ownership dropped (no further overflow signals) strictly
/// before the ring is unmapped.
pub fn close_source(inner: &mut SourceInner) {
    if inner.fd >= 0 {
        // SAFETY: fd is a valid perf event fd until the close below
        unsafe {
            ioctls::DISABLE(inner.fd, 0);
            libc::fcntl(inner.fd, libc::F_SETOWN, 0);
        }
    }
    if !inner.base.is_null() {
        // SAFETY: base/mmap_len describe our own mapping
        unsafe {
            libc::munmap(inner.base.cast::<libc::c_void>(), inner.mmap_len);
        }
        inner.base = std::ptr::null_mut();
    }
    if inner.fd >= 0 {
        // SAFETY: fd is ours and open
        unsafe {
            libc::close(inner.fd);
        }
        inner.fd = -1;
    }
}

/// Trial-open with `PERF_SAMPLE_CALLCHAIN` to learn whether this host and
/// privilege level support kernel-assisted callchains. The probe fd is
/// closed immediately.
#[must_use]
pub fn probe_callchain_support(event: &EventType) -> bool {
    let mut attr = sampling_attr(event, Interval::Period(1 << 40), RingMode::Kernel);
    // SAFETY: attr outlives the syscall; observes only the calling thread
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
        return false;
    }
    #[allow(clippy::cast_possible_truncation)]
    // SAFETY: fd was just returned by perf_event_open
    unsafe {
        libc::close(fd as libc::c_int);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;

    #[test]
    fn test_attr_period_vs_frequency() {
        let event = events::resolve("cpu-clock").unwrap().event;

        let attr = sampling_attr(&event, Interval::Period(10_000_000), RingMode::User);
        assert_eq!(unsafe { attr.__bindgen_anon_1.sample_period }, 10_000_000);
        assert_eq!(attr.freq(), 0);

        let attr = sampling_attr(&event, Interval::Frequency(99), RingMode::User);
        assert_eq!(unsafe { attr.__bindgen_anon_1.sample_freq }, 99);
        assert_eq!(attr.freq(), 1);
    }

    #[test]
    fn test_attr_callchain_only_in_kernel_mode() {
        let event = events::resolve("cpu-clock").unwrap().event;
        let chain_bit = u64::from(perf::PERF_SAMPLE_CALLCHAIN);

        let user = sampling_attr(&event, Interval::Period(1), RingMode::User);
        assert_eq!(user.sample_type & chain_bit, 0);

        let kernel = sampling_attr(&event, Interval::Period(1), RingMode::Kernel);
        assert_ne!(kernel.sample_type & chain_bit, 0);
    }

    #[test]
    fn test_attr_starts_disabled_with_single_event_wakeups() {
        let event = events::resolve("cpu-clock").unwrap().event;
        let attr = sampling_attr(&event, Interval::Period(1), RingMode::User);
        assert_eq!(attr.disabled(), 1);
        assert_eq!(unsafe { attr.__bindgen_anon_2.wakeup_events }, 1);
    }
}
