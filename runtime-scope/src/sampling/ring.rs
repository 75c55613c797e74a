//! Kernel ring-buffer draining
//!
//! Each sample source maps one metadata page plus [`DATA_PAGES`] data pages
//! shared with the kernel. The kernel bumps `data_head` as it appends
//! records; we consume from our own cursor and publish it back through
//! `data_tail` so the kernel never overwrites unread data.
//!
//! Everything here runs inside the signal handler: no allocation, records
//! are copied wrap-aware into a caller-provided fixed scratch buffer.

#![allow(unsafe_code)] // raw access to the kernel-shared mapping

use std::sync::atomic::{fence, Ordering};

use perf_event_open_sys::bindings as perf;

use super::slots::SourceInner;
use crate::engine::MAX_CALL_CHAIN_DEPTH;

/// Data pages per ring buffer (must be a power of two).
pub const DATA_PAGES: usize = 8;

/// Scratch capacity in 8-byte words: header + fixed sample fields +
/// callchain length + the deepest chain we ever keep, with slack for
/// kernel-side context markers.
pub const MAX_RECORD_WORDS: usize = 16 + 2 * MAX_CALL_CHAIN_DEPTH;

/// Pre-sized buffer one record is copied into before parsing.
/// u64-backed so parsed fields are naturally aligned.
pub struct RecordScratch {
    words: [u64; MAX_RECORD_WORDS],
}

impl RecordScratch {
    #[must_use]
    pub const fn new() -> Self {
        RecordScratch { words: [0; MAX_RECORD_WORDS] }
    }
}

impl Default for RecordScratch {
    fn default() -> Self {
        Self::new()
    }
}

/// Parsed view of one `PERF_RECORD_SAMPLE`, borrowed from the scratch.
#[derive(Debug)]
pub struct SampleBody<'a> {
    pub ip: u64,
    pub pid: u32,
    pub tid: u32,
    pub time: u64,
    pub period: u64,
    /// Kernel-assisted callchain; empty unless the source was opened
    /// with `PERF_SAMPLE_CALLCHAIN`
    pub call_chain: &'a [u64],
}

/// Pop the next available sample record, skipping non-sample records
/// (`PERF_RECORD_LOST`, throttling notices). Returns `None` once the
/// buffer has no complete new record.
pub fn next_sample<'a>(
    inner: &mut SourceInner,
    with_callchain: bool,
    scratch: &'a mut RecordScratch,
) -> Option<SampleBody<'a>> {
    let data = unsafe { inner.base.add(inner.page_size) };
    let data_size = inner.mmap_len - inner.page_size;
    let page = inner.base.cast::<perf::perf_event_mmap_page>();

    let sample_len = loop {
        // SAFETY: page is the live metadata page of this mapping
        let head = unsafe { std::ptr::read_volatile(std::ptr::addr_of!((*page).data_head)) };
        fence(Ordering::Acquire);

        if inner.cursor == head {
            return None;
        }

        let mut header = [0u8; 8];
        copy_wrapped(data, data_size, inner.cursor, &mut header);
        let rec_type = u32::from_ne_bytes([header[0], header[1], header[2], header[3]]);
        let rec_size = usize::from(u16::from_ne_bytes([header[6], header[7]]));

        if rec_size < 8 {
            // Corrupt header; resynchronize to the write side
            inner.cursor = head;
            publish_tail(page, inner.cursor);
            return None;
        }

        if rec_type == perf::PERF_RECORD_SAMPLE
            && rec_size <= MAX_RECORD_WORDS * 8
        {
            let bytes = unsafe {
                std::slice::from_raw_parts_mut(scratch.words.as_mut_ptr().cast::<u8>(), rec_size)
            };
            copy_wrapped(data, data_size, inner.cursor, bytes);
            inner.cursor += rec_size as u64;
            publish_tail(page, inner.cursor);
            break rec_size / 8;
        }

        // Oversized or non-sample record: consume and move on
        inner.cursor += rec_size as u64;
        publish_tail(page, inner.cursor);
    };

    // Record layout for sample_type = IP | TID | TIME | PERIOD
    // (| CALLCHAIN): header, ip, pid/tid, time, period, [nr, ips...]
    let words = &scratch.words[..sample_len];
    if words.len() < 5 {
        return None;
    }
    #[allow(clippy::cast_possible_truncation)]
    let (pid, tid) = (words[2] as u32, (words[2] >> 32) as u32);

    let call_chain: &[u64] = if with_callchain && words.len() >= 6 {
        #[allow(clippy::cast_possible_truncation)]
        let nr = words[5] as usize;
        let available = words.len() - 6;
        &words[6..6 + nr.min(available)]
    } else {
        &[]
    };

    Some(SampleBody {
        ip: words[1],
        pid,
        tid,
        time: words[3],
        period: words[4],
        call_chain,
    })
}

fn publish_tail(page: *mut perf::perf_event_mmap_page, cursor: u64) {
    fence(Ordering::Release);
    // SAFETY: page is the live metadata page of this mapping
    unsafe {
        std::ptr::write_volatile(std::ptr::addr_of_mut!((*page).data_tail), cursor);
    }
}

/// Copy `out.len()` bytes starting at ring offset `cursor`, handling the
/// wrap at the end of the data region.
fn copy_wrapped(data: *const u8, data_size: usize, cursor: u64, out: &mut [u8]) {
    #[allow(clippy::cast_possible_truncation)]
    let offset = (cursor % data_size as u64) as usize;
    let first = out.len().min(data_size - offset);
    // SAFETY: offset + first <= data_size, and the remainder restarts at 0
    unsafe {
        std::ptr::copy_nonoverlapping(data.add(offset), out.as_mut_ptr(), first);
        if first < out.len() {
            std::ptr::copy_nonoverlapping(data, out.as_mut_ptr().add(first), out.len() - first);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 4096;

    /// In-memory stand-in for a kernel mapping: one metadata page plus one
    /// data page, aligned by virtue of the u64 backing.
    struct FakeRing {
        buf: Vec<u64>,
    }

    impl FakeRing {
        fn new() -> Self {
            FakeRing { buf: vec![0u64; 2 * PAGE / 8] }
        }

        fn inner(&mut self) -> SourceInner {
            SourceInner {
                fd: -1,
                base: self.buf.as_mut_ptr().cast::<u8>(),
                mmap_len: 2 * PAGE,
                page_size: PAGE,
                cursor: 0,
            }
        }

        fn page(&mut self) -> *mut perf::perf_event_mmap_page {
            self.buf.as_mut_ptr().cast()
        }

        /// Append a record with the given type and body words.
        fn push_record(&mut self, rec_type: u32, body: &[u64]) {
            let head = unsafe { (*self.page()).data_head };
            let size = 8 * (1 + body.len());
            let header = u64::from(rec_type) | ((size as u64) << 48);
            let data_words = PAGE / 8;
            #[allow(clippy::cast_possible_truncation)]
            let mut at = data_words + (head as usize % PAGE) / 8;
            // Write wrap-aware, word at a time
            let mut write = |w: u64| {
                let idx = data_words + (at - data_words) % data_words;
                self.buf[idx] = w;
                at += 1;
            };
            write(header);
            for &w in body {
                write(w);
            }
            unsafe { (*self.page()).data_head = head + size as u64 };
        }

        fn push_sample(&mut self, ip: u64, pid: u32, tid: u32, time: u64, period: u64, chain: &[u64]) {
            let mut body = vec![ip, u64::from(pid) | (u64::from(tid) << 32), time, period];
            if !chain.is_empty() {
                body.push(chain.len() as u64);
                body.extend_from_slice(chain);
            }
            self.push_record(perf::PERF_RECORD_SAMPLE, &body);
        }
    }

    #[test]
    fn test_empty_ring_yields_none() {
        let mut ring = FakeRing::new();
        let mut inner = ring.inner();
        let mut scratch = RecordScratch::new();
        assert!(next_sample(&mut inner, false, &mut scratch).is_none());
    }

    #[test]
    fn test_single_sample_parses() {
        let mut ring = FakeRing::new();
        ring.push_sample(0xdead_beef, 100, 101, 42, 7, &[]);
        let mut inner = ring.inner();
        let mut scratch = RecordScratch::new();

        let body = next_sample(&mut inner, false, &mut scratch).unwrap();
        assert_eq!(body.ip, 0xdead_beef);
        assert_eq!(body.pid, 100);
        assert_eq!(body.tid, 101);
        assert_eq!(body.time, 42);
        assert_eq!(body.period, 7);
        assert!(body.call_chain.is_empty());
    }

    #[test]
    fn test_fifo_order_and_tail_publication() {
        let mut ring = FakeRing::new();
        ring.push_sample(1, 0, 0, 10, 1, &[]);
        ring.push_sample(2, 0, 0, 20, 1, &[]);
        let mut inner = ring.inner();

        let mut scratch = RecordScratch::new();
        assert_eq!(next_sample(&mut inner, false, &mut scratch).unwrap().ip, 1);
        let mut scratch = RecordScratch::new();
        assert_eq!(next_sample(&mut inner, false, &mut scratch).unwrap().ip, 2);
        let mut scratch = RecordScratch::new();
        assert!(next_sample(&mut inner, false, &mut scratch).is_none());

        let tail = unsafe { (*ring.page()).data_tail };
        assert_eq!(tail, inner.cursor);
    }

    #[test]
    fn test_callchain_is_borrowed_when_requested() {
        let mut ring = FakeRing::new();
        ring.push_sample(0x10, 1, 2, 3, 4, &[0x10, 0x20, 0x30]);
        let mut inner = ring.inner();
        let mut scratch = RecordScratch::new();

        let body = next_sample(&mut inner, true, &mut scratch).unwrap();
        assert_eq!(body.call_chain, &[0x10, 0x20, 0x30]);
    }

    #[test]
    fn test_non_sample_records_are_skipped() {
        let mut ring = FakeRing::new();
        // PERF_RECORD_LOST-shaped filler, then a real sample
        ring.push_record(perf::PERF_RECORD_LOST, &[1, 2]);
        ring.push_sample(0x99, 0, 0, 0, 1, &[]);
        let mut inner = ring.inner();
        let mut scratch = RecordScratch::new();

        assert_eq!(next_sample(&mut inner, false, &mut scratch).unwrap().ip, 0x99);
    }

    #[test]
    fn test_wrapped_record_is_reassembled() {
        let mut ring = FakeRing::new();
        // Park the cursor close to the end of the data page so the next
        // record straddles the wrap point.
        let filler_words = 3usize;
        let filler_size = 8 * (1 + filler_words);
        let fillers = (PAGE - 16) / filler_size;
        for _ in 0..fillers {
            ring.push_record(perf::PERF_RECORD_LOST, &[0; 3]);
        }
        let mut inner = ring.inner();
        let mut scratch = RecordScratch::new();
        // Consume the fillers; the tail must advance with them or the
        // wrapping record below would overwrite unread data.
        assert!(next_sample(&mut inner, true, &mut scratch).is_none());
        assert_eq!(inner.cursor, (fillers * filler_size) as u64);

        ring.push_sample(0xabcd, 5, 6, 7, 8, &[0x111, 0x222]);
        let body = next_sample(&mut inner, true, &mut scratch).unwrap();
        assert_eq!(body.ip, 0xabcd);
        assert_eq!(body.call_chain, &[0x111, 0x222]);
    }
}
