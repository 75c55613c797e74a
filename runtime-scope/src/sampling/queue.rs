//! Handoff between signal context and the drainer thread
//!
//! The signal handler must not allocate or block, so it never talks to the
//! [`crate::engine::SampleSink`] directly. Instead it pushes fixed-size
//! [`RawSample`] records into a pre-allocated lock-free queue; a drainer
//! thread pops them and invokes the sink at leisure. A full queue drops the
//! sample and bumps a counter — overload sheds samples, never correctness.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;

use crate::engine::MAX_CALL_CHAIN_DEPTH;

/// One sample in its signal-safe, fixed-size form.
#[derive(Debug, Clone, Copy)]
pub struct RawSample {
    pub tid: u32,
    pub ip: u64,
    pub time: u64,
    pub weight: u64,
    pub depth: usize,
    pub frames: [u64; MAX_CALL_CHAIN_DEPTH],
}

impl RawSample {
    pub const EMPTY: RawSample = RawSample {
        tid: 0,
        ip: 0,
        time: 0,
        weight: 0,
        depth: 0,
        frames: [0; MAX_CALL_CHAIN_DEPTH],
    };

    /// The recorded call chain, innermost frame first.
    #[must_use]
    pub fn call_chain(&self) -> &[u64] {
        &self.frames[..self.depth.min(MAX_CALL_CHAIN_DEPTH)]
    }
}

/// Bounded MPMC queue of [`RawSample`]s.
///
/// `push` is lock-free and allocation-free (the backing array is allocated
/// up front), which is what makes it legal inside the signal handler.
pub struct SampleQueue {
    inner: ArrayQueue<RawSample>,
    dropped: AtomicU64,
}

impl SampleQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        SampleQueue {
            inner: ArrayQueue::new(capacity),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a sample; sheds it when the drainer has fallen behind.
    /// Safe to call from signal context.
    pub fn push(&self, sample: RawSample) -> bool {
        if self.inner.push(sample).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            false
        } else {
            true
        }
    }

    pub fn pop(&self) -> Option<RawSample> {
        self.inner.pop()
    }

    /// Discard any residue left over from a previous run.
    pub fn clear(&self) {
        while self.inner.pop().is_some() {}
    }

    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn reset_dropped(&self) {
        self.dropped.store(0, Ordering::Relaxed);
    }
}
