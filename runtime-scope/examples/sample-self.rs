//! Self-profiling demo: samples this process's own worker threads and
//! prints a per-thread summary.
//!
//! ```bash
//! RUST_LOG=info cargo run --example sample-self
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use runtime_scope::engine::{CallChainSample, ProfilingEngine, SampleSink, SamplingConfig};
use runtime_scope::sampling::PerfEngine;
use runtime_scope::Tid;

/// Aggregates sample counts per thread.
#[derive(Default)]
struct CountingSink {
    per_thread: Mutex<HashMap<Tid, u64>>,
}

impl SampleSink for CountingSink {
    fn record_sample(&self, sample: &CallChainSample<'_>) {
        let mut counts = self.per_thread.lock().unwrap();
        *counts.entry(sample.tid).or_insert(0) += 1;
    }
}

fn spin(stop: &AtomicBool) {
    let mut x = 0u64;
    while !stop.load(Ordering::Relaxed) {
        x = x.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
        std::hint::black_box(x);
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    println!("available events: {:?}", PerfEngine::available_events());

    let sink = Arc::new(CountingSink::default());
    let engine = PerfEngine::new(sink.clone());

    engine
        .start(&SamplingConfig {
            event: "cpu-clock:99Hz".to_string(),
            ..SamplingConfig::default()
        })
        .context("failed to start the perf engine")?;

    let stop = Arc::new(AtomicBool::new(false));
    let engine = Arc::new(engine);
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let stop = Arc::clone(&stop);
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                // A host VM would deliver this notification from its
                // instrumentation layer; a plain thread does it itself.
                engine.on_thread_start(Tid::current());
                spin(&stop);
                engine.on_thread_end(Tid::current());
            })
        })
        .collect();

    std::thread::sleep(Duration::from_secs(1));
    stop.store(true, Ordering::Relaxed);
    for worker in workers {
        let _ = worker.join();
    }

    engine.stop();

    let counts = sink.per_thread.lock().unwrap();
    let total: u64 = counts.values().sum();
    println!("collected {total} samples across {} threads", counts.len());
    let mut rows: Vec<_> = counts.iter().collect();
    rows.sort();
    for (tid, count) in rows {
        println!("  {tid}: {count} samples");
    }
    println!("stats: {:?}", engine.stats());
    Ok(())
}
