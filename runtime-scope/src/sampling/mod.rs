//! Perf-event sampling core
//!
//! The pieces, leaves first:
//! - [`slots`]: fixed arena mapping thread ids to their sample sources
//! - [`source`]: one counter + ring buffer per thread, signal-armed
//! - [`ring`]: wrap-aware draining of the kernel-shared ring buffer
//! - [`callchain`]: kernel-chain extraction and frame-pointer fallback
//! - [`queue`]: signal-safe handoff to the drainer thread
//! - [`signal`]: SIGPROF trampoline and handler installation
//! - [`engine`]: the orchestrator implementing the engine contract

pub mod callchain;
pub mod engine;
pub mod queue;
pub mod ring;
pub mod slots;

mod signal;
mod source;

pub use engine::{EngineStats, PerfEngine};
