//! # runtime-scope - perf-event sampling engine
//!
//! A sampling engine that attaches to the current process, captures
//! periodic execution samples (instruction pointer plus native call
//! stack) through the kernel's `perf_event_open(2)` subsystem, and feeds
//! them to an upstream profiling pipeline.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Profiled Process                        │
//! │   thread A      thread B      thread C      ...             │
//! └──────┬─────────────┬─────────────┬─────────────────────────┘
//!        │ SIGPROF     │ SIGPROF     │  (thread-directed, one
//!        ▼             ▼             ▼   counter + ring each)
//! ┌─────────────────────────────────────────────────────────────┐
//! │                Signal Handler (this crate)                  │
//! │  validate ownership → drain one record → extract call chain │
//! └──────────────────────────┬──────────────────────────────────┘
//!                            │ fixed-size RawSample, lock-free
//!                            ▼
//! ┌─────────────────┐   ┌──────────────┐   ┌──────────────────┐
//! │  Sample Queue   │──▶│   Drainer    │──▶│   SampleSink     │
//! │  (pre-alloc'd)  │   │   thread     │   │  (the embedder)  │
//! └─────────────────┘   └──────────────┘   └──────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`engine`]: the profiling-engine contract ([`engine::ProfilingEngine`],
//!   [`engine::SampleSink`], [`engine::SamplingConfig`])
//! - [`events`]: event spec parsing and host capability discovery
//! - [`sampling`]: the perf engine itself — per-thread sources, slot
//!   arena, ring-buffer draining, call-chain extraction, SIGPROF handling
//! - [`domain`]: core domain types (`Tid`, `Interval`, `RingMode`) and
//!   structured errors
//!
//! ## Key Constraints
//!
//! - Everything on the signal path works on pre-allocated, fixed-size
//!   structures with atomics: no allocation, no locks, no blocking.
//! - Per-thread failures degrade that thread only; the engine keeps
//!   sampling everything else.
//! - Thread creation/destruction may race sampling arbitrarily; the slot
//!   arena's publish/retire protocol keeps the handler safe.
//!
//! ## Typical Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use runtime_scope::engine::{ProfilingEngine, SamplingConfig};
//! use runtime_scope::sampling::PerfEngine;
//!
//! # struct MySink;
//! # impl runtime_scope::engine::SampleSink for MySink {
//! #     fn record_sample(&self, _: &runtime_scope::engine::CallChainSample<'_>) {}
//! # }
//! let engine = PerfEngine::new(Arc::new(MySink));
//! engine.start(&SamplingConfig {
//!     event: "cpu-clock:99Hz".to_string(),
//!     ..SamplingConfig::default()
//! })?;
//! // ... workload runs, samples flow to the sink ...
//! engine.stop();
//! # Ok::<(), runtime_scope::domain::EngineError>(())
//! ```

pub mod domain;
pub mod engine;
pub mod events;
pub mod sampling;

pub use domain::{EngineError, Interval, RingMode, Tid};
pub use engine::{CallChainSample, ProfilingEngine, SampleSink, SamplingConfig};
pub use sampling::{EngineStats, PerfEngine};
