//! SIGPROF handler installation
//!
//! The handler itself is a thin trampoline: it loads the active engine
//! cell and forwards to [`EngineState::handle_overflow`]. Exactly one
//! engine can own the installation at a time; the cell doubles as that
//! mutual exclusion.
//!
//! The engine publishes a pointer into the cell for the duration of a run
//! and keeps the state alive (via its own `Arc`) until after the prior
//! handler has been restored, so the trampoline never dereferences freed
//! memory.

#![allow(unsafe_code)] // sigaction and the raw active-engine cell

use std::sync::atomic::{AtomicPtr, Ordering};

use super::engine::EngineState;
use crate::domain::EngineError;

static ACTIVE_ENGINE: AtomicPtr<EngineState> = AtomicPtr::new(std::ptr::null_mut());

/// The displaced signal disposition, restored by [`uninstall`].
pub(crate) struct PrevHandler {
    action: libc::sigaction,
}

/// Publish `state` as the active engine and install the SIGPROF handler.
///
/// # Errors
/// [`EngineError::AlreadyRunning`] when another engine holds the cell,
/// [`EngineError::SignalSetup`] when sigaction fails.
pub(crate) fn install(state: *const EngineState) -> Result<PrevHandler, EngineError> {
    if ACTIVE_ENGINE
        .compare_exchange(
            std::ptr::null_mut(),
            state.cast_mut(),
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_err()
    {
        return Err(EngineError::AlreadyRunning);
    }

    // SAFETY: zeroed sigaction is a valid starting point; sigemptyset
    // initializes the mask in place
    let result = unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        libc::sigemptyset(std::ptr::addr_of_mut!(action.sa_mask));
        action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        action.sa_sigaction = perf_signal_handler as *const () as usize;

        let mut prev: libc::sigaction = std::mem::zeroed();
        if libc::sigaction(libc::SIGPROF, &action, &mut prev) == 0 {
            Ok(PrevHandler { action: prev })
        } else {
            Err(EngineError::SignalSetup(std::io::Error::last_os_error().to_string()))
        }
    };

    if result.is_err() {
        ACTIVE_ENGINE.store(std::ptr::null_mut(), Ordering::Release);
    }
    result
}

/// Restore the displaced disposition and release the cell. Callers must
/// have disarmed every counter first: once the prior handler is back, a
/// stray overflow signal is no longer ours to absorb.
pub(crate) fn uninstall(prev: PrevHandler) {
    // SAFETY: prev.action came from the matching install
    unsafe {
        libc::sigaction(libc::SIGPROF, &prev.action, std::ptr::null_mut());
    }
    ACTIVE_ENGINE.store(std::ptr::null_mut(), Ordering::Release);
}

extern "C" fn perf_signal_handler(
    _signo: libc::c_int,
    _info: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    let state = ACTIVE_ENGINE.load(Ordering::Acquire);
    if state.is_null() {
        return;
    }
    // SAFETY: the owning engine keeps state alive while the cell is set
    unsafe { (*state).handle_overflow(ucontext) };
}
