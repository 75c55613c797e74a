//! Native call-chain extraction
//!
//! Two sources of truth, tried in order: the kernel-assisted callchain
//! attached to the sample record (ring mode `kernel`), and a bounded
//! frame-pointer walk seeded from the interrupted execution context (ring
//! mode `user`, or fallback when the kernel returned nothing).
//!
//! Addresses inside the configured JIT window belong to dynamically
//! generated code. They are recorded verbatim (symbolization happens
//! upstream) and never invalidate a sample: a trace whose top frame is
//! JIT code is still a trace, it just stops there.

#![allow(unsafe_code)] // reads the interrupted context and walks raw stack memory

use std::ops::Range;

/// Values at or above this are `PERF_CONTEXT_*` markers separating
/// kernel/user portions of a kernel callchain, not return addresses.
const PERF_CONTEXT_FLOOR: u64 = (-4095i64) as u64;

/// Lowest address we accept as a plausible code address.
const MIN_CODE_ADDRESS: u64 = 0x1000;

/// How far above the interrupted stack pointer the walk may roam.
const MAX_WALK_SPAN: u64 = 2 * 1024 * 1024;

/// Program-counter, frame-pointer and stack-pointer registers of an
/// interrupted thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextRegs {
    pub pc: u64,
    pub fp: u64,
    pub sp: u64,
}

/// Produce the call chain for one sample, innermost frame first,
/// truncated to `out.len()` entries. Returns the frame count; 0 means
/// "no data this sample", never an error.
pub fn get_native_trace(
    ucontext: *mut libc::c_void,
    kernel_chain: &[u64],
    out: &mut [u64],
    jit_region: &Range<u64>,
) -> usize {
    let copied = copy_kernel_chain(kernel_chain, out);
    if copied > 0 {
        return copied;
    }

    match context_regs(ucontext) {
        Some(regs) => walk_frame_pointers(regs, out, jit_region),
        None => 0,
    }
}

/// Copy a kernel callchain, dropping `PERF_CONTEXT_*` markers.
fn copy_kernel_chain(chain: &[u64], out: &mut [u64]) -> usize {
    let mut count = 0;
    for &addr in chain {
        if count == out.len() {
            break;
        }
        if addr >= PERF_CONTEXT_FLOOR || addr < MIN_CODE_ADDRESS {
            continue;
        }
        out[count] = addr;
        count += 1;
    }
    count
}

/// Bounded frame-pointer walk. Frame 0 is always the interrupted pc
/// (recorded raw even inside the JIT window); subsequent frames follow
/// the saved-fp chain under monotonicity, alignment and span guards.
///
/// A frame inside the JIT window is recorded and ends the walk: saved
/// frame pointers laid down by generated code are untrustworthy, and
/// unwinding past them belongs to the caller's JIT-aware machinery.
pub fn walk_frame_pointers(regs: ContextRegs, out: &mut [u64], jit_region: &Range<u64>) -> usize {
    if out.is_empty() || regs.pc < MIN_CODE_ADDRESS {
        return 0;
    }

    let mut count = 0;
    out[count] = regs.pc;
    count += 1;
    if jit_region.contains(&regs.pc) {
        return count;
    }

    let bottom = regs.sp;
    let Some(top) = bottom.checked_add(MAX_WALK_SPAN) else {
        return count;
    };

    let mut fp = regs.fp;
    while count < out.len() {
        if fp < bottom || fp.saturating_add(16) > top || fp & 7 != 0 {
            break;
        }
        // SAFETY: fp is 8-aligned and inside the interrupted thread's
        // live stack span; both words are readable
        let (next_fp, ret) = unsafe {
            (
                std::ptr::read_volatile(fp as *const u64),
                std::ptr::read_volatile((fp + 8) as *const u64),
            )
        };
        if ret < MIN_CODE_ADDRESS || ret >= PERF_CONTEXT_FLOOR {
            break;
        }
        out[count] = ret;
        count += 1;
        if jit_region.contains(&ret) || next_fp <= fp {
            break;
        }
        fp = next_fp;
    }
    count
}

/// Extract pc/fp/sp from the signal ucontext. Architecture-specific;
/// unsupported targets yield `None` and the sample degrades to no data.
#[cfg(target_arch = "x86_64")]
fn context_regs(ucontext: *mut libc::c_void) -> Option<ContextRegs> {
    if ucontext.is_null() {
        return None;
    }
    // SAFETY: the kernel hands SA_SIGINFO handlers a valid ucontext_t
    let uc = unsafe { &*ucontext.cast::<libc::ucontext_t>() };
    #[allow(clippy::cast_sign_loss)]
    Some(ContextRegs {
        pc: uc.uc_mcontext.gregs[libc::REG_RIP as usize] as u64,
        fp: uc.uc_mcontext.gregs[libc::REG_RBP as usize] as u64,
        sp: uc.uc_mcontext.gregs[libc::REG_RSP as usize] as u64,
    })
}

#[cfg(target_arch = "aarch64")]
fn context_regs(ucontext: *mut libc::c_void) -> Option<ContextRegs> {
    if ucontext.is_null() {
        return None;
    }
    // SAFETY: the kernel hands SA_SIGINFO handlers a valid ucontext_t
    let uc = unsafe { &*ucontext.cast::<libc::ucontext_t>() };
    Some(ContextRegs {
        pc: uc.uc_mcontext.pc,
        fp: uc.uc_mcontext.regs[29],
        sp: uc.uc_mcontext.sp,
    })
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn context_regs(_ucontext: *mut libc::c_void) -> Option<ContextRegs> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_JIT: Range<u64> = 0..0;

    #[test]
    fn test_kernel_chain_is_copied_in_order() {
        let chain = [0x1000, 0x2000, 0x3000];
        let mut out = [0u64; 8];
        let n = get_native_trace(std::ptr::null_mut(), &chain, &mut out, &NO_JIT);
        assert_eq!(&out[..n], &[0x1000, 0x2000, 0x3000]);
    }

    #[test]
    fn test_kernel_chain_markers_are_dropped() {
        let user_marker = (-512i64) as u64; // PERF_CONTEXT_USER
        let chain = [user_marker, 0x1000, 0x2000];
        let mut out = [0u64; 8];
        let n = get_native_trace(std::ptr::null_mut(), &chain, &mut out, &NO_JIT);
        assert_eq!(&out[..n], &[0x1000, 0x2000]);
    }

    #[test]
    fn test_max_depth_truncation() {
        let chain: Vec<u64> = (1..=32).map(|i| 0x1000 * i).collect();
        let mut out = [0u64; 5];
        let n = get_native_trace(std::ptr::null_mut(), &chain, &mut out, &NO_JIT);
        assert_eq!(n, 5);
        assert_eq!(&out[..n], &chain[..5]);
    }

    #[test]
    fn test_no_chain_and_no_context_is_no_data() {
        let mut out = [0u64; 8];
        assert_eq!(get_native_trace(std::ptr::null_mut(), &[], &mut out, &NO_JIT), 0);
    }

    /// Build a synthetic stack with a saved-fp chain and walk it.
    #[test]
    fn test_frame_pointer_walk() {
        let mut stack = [0u64; 16];
        let base = stack.as_mut_ptr() as u64;
        // Frame at base: saved fp -> base+32, return 0x2000
        stack[0] = base + 32;
        stack[1] = 0x2000;
        // Frame at base+32: saved fp 0 terminates, return 0x3000
        stack[4] = 0;
        stack[5] = 0x3000;

        let regs = ContextRegs { pc: 0x1000, fp: base, sp: base };
        let mut out = [0u64; 8];
        let n = walk_frame_pointers(regs, &mut out, &NO_JIT);
        assert_eq!(&out[..n], &[0x1000, 0x2000, 0x3000]);
    }

    #[test]
    fn test_walk_rejects_misaligned_frame_pointer() {
        let mut stack = [0u64; 4];
        let base = stack.as_mut_ptr() as u64;
        stack[1] = 0x2000;
        let regs = ContextRegs { pc: 0x1000, fp: base + 4, sp: base };
        let mut out = [0u64; 8];
        // Only the pc is recorded; the bogus fp is never dereferenced
        assert_eq!(walk_frame_pointers(regs, &mut out, &NO_JIT), 1);
    }

    #[test]
    fn test_walk_stops_at_non_monotonic_chain() {
        let mut stack = [0u64; 8];
        let base = stack.as_mut_ptr() as u64;
        // Saved fp points backwards: record this frame, then stop
        stack[0] = base - 64;
        stack[1] = 0x2000;
        let regs = ContextRegs { pc: 0x1000, fp: base, sp: base };
        let mut out = [0u64; 8];
        let n = walk_frame_pointers(regs, &mut out, &NO_JIT);
        assert_eq!(&out[..n], &[0x1000, 0x2000]);
    }

    #[test]
    fn test_jit_pc_is_recorded_verbatim() {
        // Scenario: the interrupted pc falls inside the JIT window.
        // Frame 0 must equal that address exactly and the trace succeeds.
        let jit = 0x7f00_0000_0000..0x7f10_0000_0000;
        let pc = 0x7f08_1234_5678;
        let regs = ContextRegs { pc, fp: 0, sp: 0 };
        let mut out = [0u64; 8];
        let n = walk_frame_pointers(regs, &mut out, &jit);
        assert!(n >= 1);
        assert_eq!(out[0], pc);
    }

    #[test]
    fn test_jit_return_address_ends_the_walk() {
        let mut stack = [0u64; 16];
        let base = stack.as_mut_ptr() as u64;
        let jit = 0x5000..0x6000;
        // Native frame, then a JIT frame whose saved fp "continues"
        stack[0] = base + 32;
        stack[1] = 0x2000;
        stack[4] = base + 64;
        stack[5] = 0x5800; // inside the JIT window
        stack[8] = 0;
        stack[9] = 0x3000; // must not be reached

        let regs = ContextRegs { pc: 0x1000, fp: base, sp: base };
        let mut out = [0u64; 8];
        let n = walk_frame_pointers(regs, &mut out, &jit);
        assert_eq!(&out[..n], &[0x1000, 0x2000, 0x5800]);
    }

    #[test]
    fn test_depth_one_keeps_only_the_pc() {
        let mut stack = [0u64; 4];
        let base = stack.as_mut_ptr() as u64;
        stack[0] = 0;
        stack[1] = 0x2000;
        let regs = ContextRegs { pc: 0x1000, fp: base, sp: base };
        let mut out = [0u64; 1];
        let n = walk_frame_pointers(regs, &mut out, &NO_JIT);
        assert_eq!(&out[..n], &[0x1000]);
    }
}
