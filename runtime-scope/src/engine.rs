//! Profiling-engine contract
//!
//! The boundary between this crate and the surrounding profiler: an engine
//! exposes a lifecycle (`name`/`units`/`start`/`stop`), consumes a
//! [`SampleSink`], and is driven by the host's thread lifecycle
//! notifications. Only the perf engine implements this today, but the
//! contract keeps the upstream pipeline independent of the sampling
//! mechanism.

use std::ops::Range;

use crate::domain::{EngineError, Interval, RingMode, Tid};

/// One delivered sample: the interrupted instruction pointer plus the
/// native call chain, innermost frame first.
///
/// Borrowed view over the drained record; the sink must copy whatever it
/// wants to keep.
#[derive(Debug, Clone, Copy)]
pub struct CallChainSample<'a> {
    pub tid: Tid,
    /// Interrupted instruction pointer (equals `call_chain[0]` when a
    /// chain is present)
    pub ip: u64,
    /// Kernel timestamp of the sample, nanoseconds
    pub time: u64,
    /// Number of event occurrences this sample stands for
    pub weight: u64,
    /// Return addresses, innermost to outermost; may be empty
    pub call_chain: &'a [u64],
}

/// Consumer of delivered samples.
///
/// Invoked from the engine's drainer thread, never from signal context, so
/// implementations are free to allocate, lock, or block.
pub trait SampleSink: Send + Sync {
    fn record_sample(&self, sample: &CallChainSample<'_>);
}

/// Recognized `start` options.
#[derive(Debug, Clone)]
pub struct SamplingConfig {
    /// Event spec, `<event-name>[:<interval>]`
    pub event: String,
    /// Sampling interval; an interval suffix in `event` wins, then this,
    /// then the event's table default
    pub interval: Option<Interval>,
    /// Stack-capture facility for sample records
    pub ring: RingMode,
    /// Call-chain truncation depth (capped at [`MAX_CALL_CHAIN_DEPTH`])
    pub max_depth: usize,
    /// Address window of dynamically generated code. Frames inside it are
    /// recorded raw and left to the caller to interpret.
    pub jit_region: Option<Range<u64>>,
}

/// Hard bound on recorded call-chain length; fixes the size of the
/// signal-safe sample records.
pub const MAX_CALL_CHAIN_DEPTH: usize = 128;

impl Default for SamplingConfig {
    fn default() -> Self {
        SamplingConfig {
            event: "cpu-clock".to_string(),
            interval: None,
            ring: RingMode::default(),
            max_depth: 64,
            jit_region: None,
        }
    }
}

/// Lifecycle contract every sampling engine implements.
pub trait ProfilingEngine {
    /// Short identifier, e.g. `"perf"`.
    fn name(&self) -> &'static str;

    /// Unit of sample weights: `"events"` or `"ns"` depending on the
    /// resolved event.
    fn units(&self) -> &'static str;

    /// Begin sampling every live thread of the current process.
    ///
    /// # Errors
    /// [`EngineError::UnsupportedEvent`] for an unknown event spec,
    /// [`EngineError::PermissionDenied`] when no counter may be opened,
    /// [`EngineError::NoThreadsSampled`] when every per-thread open failed,
    /// [`EngineError::AlreadyRunning`] when a run is active.
    fn start(&self, config: &SamplingConfig) -> Result<(), EngineError>;

    /// Tear down all sampling state. Idempotent; safe after a failed
    /// `start`. After it returns no further samples reach the sink.
    fn stop(&self);
}
