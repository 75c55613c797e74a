//! Perf sampling engine
//!
//! Orchestrates the per-thread sample sources across every live thread of
//! the current process, owns the signal-handler installation and the
//! drainer thread, and implements the profiling-engine contract.
//!
//! ## Control flow
//!
//! `start()` resolves the requested event, installs the SIGPROF handler,
//! arms a source for every thread listed in `/proc/self/task`, and spawns
//! the drainer. From then on each counter overflow interrupts its thread,
//! the handler drains one ring-buffer record into the lock-free queue, and
//! the drainer hands it to the sink. The embedder forwards its own
//! thread-start/thread-end notifications to [`PerfEngine::on_thread_start`]
//! and [`PerfEngine::on_thread_end`] so threads created after `start()`
//! are armed too.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};

use super::{callchain, ring, signal, source};
use super::queue::{RawSample, SampleQueue};
use super::ring::RecordScratch;
use super::slots::{ClaimError, SlotTable};
use crate::domain::{EngineError, Interval, RingMode, Tid};
use crate::engine::{
    CallChainSample, ProfilingEngine, SampleSink, SamplingConfig, MAX_CALL_CHAIN_DEPTH,
};
use crate::events::{self, EventType};

/// Capacity of the handler-to-drainer queue.
const QUEUE_CAPACITY: usize = 4096;
/// Drainer poll interval while the queue is empty.
const DRAIN_IDLE: Duration = Duration::from_millis(10);

/// Everything the signal handler may touch: atomics and pre-allocated
/// structures only, observable from any thread without locks.
pub(crate) struct EngineState {
    slots: SlotTable,
    queue: SampleQueue,
    running: AtomicBool,
    kernel_chain: AtomicBool,
    max_depth: AtomicUsize,
    jit_lo: AtomicU64,
    jit_hi: AtomicU64,
    sampled: AtomicU64,
    empty_wakeups: AtomicU64,
    race_noops: AtomicU64,
    warned_extended: AtomicBool,
}

impl EngineState {
    fn new() -> Self {
        EngineState {
            slots: SlotTable::new(),
            queue: SampleQueue::new(QUEUE_CAPACITY),
            running: AtomicBool::new(false),
            kernel_chain: AtomicBool::new(false),
            max_depth: AtomicUsize::new(MAX_CALL_CHAIN_DEPTH),
            jit_lo: AtomicU64::new(0),
            jit_hi: AtomicU64::new(0),
            sampled: AtomicU64::new(0),
            empty_wakeups: AtomicU64::new(0),
            race_noops: AtomicU64::new(0),
            warned_extended: AtomicBool::new(false),
        }
    }

    /// One counter-overflow invocation. Runs in signal context on the
    /// sampled thread: no allocation, no locks, silent early returns.
    pub(crate) fn handle_overflow(&self, ucontext: *mut libc::c_void) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }

        // ValidateOwnership: no live source means we raced a destroy
        let Some(mut guard) = self.slots.lookup_try_lock(Tid::current()) else {
            self.race_noops.fetch_add(1, Ordering::Relaxed);
            return;
        };

        // DrainRecord
        let mut scratch = RecordScratch::new();
        let want_chain = self.kernel_chain.load(Ordering::Relaxed);
        let Some(body) = ring::next_sample(guard.inner_mut(), want_chain, &mut scratch) else {
            self.empty_wakeups.fetch_add(1, Ordering::Relaxed);
            return;
        };
        drop(guard);

        // ExtractCallChain
        let mut sample = RawSample::EMPTY;
        let depth = self.max_depth.load(Ordering::Relaxed).clamp(1, MAX_CALL_CHAIN_DEPTH);
        let jit = self.jit_lo.load(Ordering::Relaxed)..self.jit_hi.load(Ordering::Relaxed);
        let frames =
            callchain::get_native_trace(ucontext, body.call_chain, &mut sample.frames[..depth], &jit);
        if frames == 0 {
            // No data this sample; not a fault
            self.empty_wakeups.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // Deliver: hand a bounded record to the drainer
        sample.depth = frames;
        sample.tid = body.tid;
        sample.ip = body.ip;
        sample.time = body.time;
        sample.weight = body.period;
        if self.queue.push(sample) {
            self.sampled.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Why a per-thread arm attempt failed; drives the aggregate error
/// classification when every thread fails.
struct OpenFailure {
    denied: bool,
}

/// Per-run counters, exposed for observability and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Samples handed to the drainer queue
    pub sampled: u64,
    /// Samples shed because the queue was full
    pub dropped: u64,
    /// Handler invocations that found no record or no usable chain
    pub empty_wakeups: u64,
    /// Handler invocations that lost the race with thread destruction
    pub race_noops: u64,
    /// Currently armed per-thread sources
    pub live_sources: usize,
}

/// Control-path state, touched only under the engine mutex.
struct RunState {
    event: Option<EventType>,
    interval: Interval,
    ring: RingMode,
    units: &'static str,
    prev_handler: Option<signal::PrevHandler>,
    drainer: Option<std::thread::JoinHandle<()>>,
}

/// The perf profiling engine.
///
/// One instance owns at most one sampling run at a time; independent
/// instances can coexist but only one may be started, since the process
/// has a single SIGPROF disposition.
pub struct PerfEngine {
    state: Arc<EngineState>,
    sink: Arc<dyn SampleSink>,
    run: Mutex<RunState>,
}

impl PerfEngine {
    #[must_use]
    pub fn new(sink: Arc<dyn SampleSink>) -> Self {
        PerfEngine {
            state: Arc::new(EngineState::new()),
            sink,
            run: Mutex::new(RunState {
                event: None,
                interval: Interval::Period(1),
                ring: RingMode::User,
                units: "events",
                prev_handler: None,
                drainer: None,
            }),
        }
    }

    /// Event names usable on this host at the current privilege level.
    #[must_use]
    pub fn available_events() -> Vec<&'static str> {
        events::list_available()
    }

    /// Effective stack-capture mode of the current run (the configured
    /// mode may have been downgraded by capability probing).
    #[must_use]
    pub fn ring_mode(&self) -> RingMode {
        self.lock_run().ring
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            sampled: self.state.sampled.load(Ordering::Relaxed),
            dropped: self.state.queue.dropped(),
            empty_wakeups: self.state.empty_wakeups.load(Ordering::Relaxed),
            race_noops: self.state.race_noops.load(Ordering::Relaxed),
            live_sources: self.state.slots.live_count(),
        }
    }

    /// Thread-start notification from the embedder's instrumentation.
    /// Arms a source for the new thread; no-op once stopped.
    pub fn on_thread_start(&self, tid: Tid) {
        if !self.state.running.load(Ordering::Acquire) {
            return;
        }
        let run = self.lock_run();
        if !self.state.running.load(Ordering::Acquire) {
            return;
        }
        if let Some(event) = run.event.clone() {
            let _ = self.create_for_thread(tid, &event, run.interval, run.ring);
        }
    }

    /// Thread-end notification from the embedder's instrumentation.
    /// Destroys the thread's source; no-op for unknown tids or once
    /// stopped.
    pub fn on_thread_end(&self, tid: Tid) {
        if !self.state.running.load(Ordering::Acquire) {
            return;
        }
        if self.state.slots.remove(tid, source::close_source) {
            debug!("released sample source for ended thread {tid}");
        }
    }

    fn lock_run(&self) -> MutexGuard<'_, RunState> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arm one thread. Failure degrades that thread only; the first
    /// failure of a run logs an extended diagnostic hint.
    fn create_for_thread(
        &self,
        tid: Tid,
        event: &EventType,
        interval: Interval,
        ring: RingMode,
    ) -> Result<(), OpenFailure> {
        let claim = match self.state.slots.claim(tid) {
            Ok(claim) => claim,
            // A live source already exists; creation is idempotent
            Err(ClaimError::AlreadyLive) => return Ok(()),
            Err(ClaimError::TableFull) => {
                warn!("slot table exhausted, {tid} will not be sampled");
                return Err(OpenFailure { denied: false });
            }
        };

        match source::open_source(tid, event, interval, ring) {
            Ok(inner) => {
                claim.publish(inner);
                Ok(())
            }
            Err(err) => {
                drop(claim);
                let denied = matches!(
                    err.raw_os_error(),
                    Some(libc::EACCES) | Some(libc::EPERM)
                );
                self.note_open_failure(tid, event, &err);
                Err(OpenFailure { denied })
            }
        }
    }

    fn note_open_failure(&self, tid: Tid, event: &EventType, err: &std::io::Error) {
        if self.state.warned_extended.swap(true, Ordering::Relaxed) {
            debug!("perf_event_open failed for {tid}: {err}");
            return;
        }
        let paranoid = std::fs::read_to_string("/proc/sys/kernel/perf_event_paranoid")
            .map_or_else(|_| "unknown".to_string(), |s| s.trim().to_string());
        warn!(
            "Failed to open a {} counter for {tid}: {err}\n\n\
             Affected threads yield no samples; sampling continues for the rest.\n\
             Hardware counters usually require lowering the paranoid level\n\
             (current /proc/sys/kernel/perf_event_paranoid = {paranoid}):\n\
             \n    sudo sysctl kernel.perf_event_paranoid=1\n\n\
             or CAP_PERFMON/root privileges.",
            event.name
        );
    }

    /// Arm every thread currently listed in `/proc/self/task`.
    ///
    /// Returns `(created, failed, denied)`; partial failure is tolerated.
    fn create_for_all_threads(
        &self,
        event: &EventType,
        interval: Interval,
        ring: RingMode,
    ) -> Result<(usize, usize, usize), EngineError> {
        let mut created = 0;
        let mut failed = 0;
        let mut denied = 0;
        for tid in list_process_threads()? {
            match self.create_for_thread(tid, event, interval, ring) {
                Ok(()) => created += 1,
                Err(failure) => {
                    failed += 1;
                    if failure.denied {
                        denied += 1;
                    }
                }
            }
        }
        debug!("armed {created} sample sources ({failed} threads failed)");
        Ok((created, failed, denied))
    }

    fn teardown(&self, run: &mut RunState) {
        self.state.running.store(false, Ordering::Release);
        for tid in self.state.slots.live_tids() {
            self.state.slots.remove(tid, source::close_source);
        }
        if let Some(prev) = run.prev_handler.take() {
            signal::uninstall(prev);
        }
        if let Some(drainer) = run.drainer.take() {
            let _ = drainer.join();
        }
    }
}

impl ProfilingEngine for PerfEngine {
    fn name(&self) -> &'static str {
        "perf"
    }

    fn units(&self) -> &'static str {
        self.lock_run().units
    }

    fn start(&self, config: &SamplingConfig) -> Result<(), EngineError> {
        let mut run = self.lock_run();
        if self.state.running.load(Ordering::Acquire) {
            return Err(EngineError::AlreadyRunning);
        }

        let resolved = events::resolve(&config.event)?;
        let event = resolved.event;
        let interval =
            resolved.interval.or(config.interval).unwrap_or(event.default_interval);

        let mut ring = config.ring;
        if ring == RingMode::Kernel && !source::probe_callchain_support(&event) {
            warn!(
                "kernel-assisted callchains unavailable for {}, falling back to user-mode stack walks",
                event.name
            );
            ring = RingMode::User;
        }

        // Reset per-run state before anything can sample
        self.state.queue.clear();
        self.state.queue.reset_dropped();
        self.state.sampled.store(0, Ordering::Relaxed);
        self.state.empty_wakeups.store(0, Ordering::Relaxed);
        self.state.race_noops.store(0, Ordering::Relaxed);
        self.state.warned_extended.store(false, Ordering::Relaxed);
        self.state.kernel_chain.store(ring == RingMode::Kernel, Ordering::Relaxed);
        self.state
            .max_depth
            .store(config.max_depth.clamp(1, MAX_CALL_CHAIN_DEPTH), Ordering::Relaxed);
        let (jit_lo, jit_hi) =
            config.jit_region.as_ref().map_or((0, 0), |r| (r.start, r.end));
        self.state.jit_lo.store(jit_lo, Ordering::Relaxed);
        self.state.jit_hi.store(jit_hi, Ordering::Relaxed);

        run.prev_handler = Some(signal::install(Arc::as_ptr(&self.state))?);
        self.state.running.store(true, Ordering::Release);

        let result = (|| {
            let (created, failed, denied) =
                self.create_for_all_threads(&event, interval, ring)?;
            if created == 0 {
                return Err(if failed > 0 && denied == failed {
                    EngineError::PermissionDenied
                } else {
                    EngineError::NoThreadsSampled
                });
            }

            let state = Arc::clone(&self.state);
            let sink = Arc::clone(&self.sink);
            let drainer = std::thread::Builder::new()
                .name("rscope-drain".to_string())
                .spawn(move || drain_loop(&state, sink.as_ref()))?;
            run.drainer = Some(drainer);
            Ok(created)
        })();

        match result {
            Ok(created) => {
                run.units = event.units();
                run.interval = interval;
                run.ring = ring;
                info!(
                    "perf engine started: event={} interval={interval} ring={ring} threads={created}",
                    event.name
                );
                run.event = Some(event);
                Ok(())
            }
            Err(err) => {
                self.teardown(&mut run);
                Err(err)
            }
        }
    }

    fn stop(&self) {
        let mut run = self.lock_run();
        let was_running = self.state.running.load(Ordering::Acquire);
        self.teardown(&mut run);
        run.event = None;
        if was_running {
            let stats = self.stats();
            info!(
                "perf engine stopped: {} samples delivered, {} dropped, {} empty wakeups, {} destroy races",
                stats.sampled, stats.dropped, stats.empty_wakeups, stats.race_noops
            );
        }
    }
}

impl Drop for PerfEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn drain_loop(state: &EngineState, sink: &dyn SampleSink) {
    loop {
        while let Some(raw) = state.queue.pop() {
            deliver(sink, &raw);
        }
        if !state.running.load(Ordering::Acquire) {
            // Final sweep of anything the handlers pushed before teardown
            while let Some(raw) = state.queue.pop() {
                deliver(sink, &raw);
            }
            return;
        }
        std::thread::sleep(DRAIN_IDLE);
    }
}

fn deliver(sink: &dyn SampleSink, raw: &RawSample) {
    sink.record_sample(&CallChainSample {
        tid: Tid(raw.tid),
        ip: raw.ip,
        time: raw.time,
        weight: raw.weight,
        call_chain: raw.call_chain(),
    });
}

/// TIDs of every live thread of this process, from `/proc/self/task`.
fn list_process_threads() -> Result<Vec<Tid>, EngineError> {
    let entries = std::fs::read_dir("/proc/self/task")?;
    Ok(entries
        .filter_map(|entry| {
            let entry = entry.ok()?;
            entry.file_name().to_string_lossy().parse::<u32>().ok().map(Tid)
        })
        .collect())
}
