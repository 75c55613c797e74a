//! Fixed-size slot arena for per-thread sample sources
//!
//! The only structure shared between thread lifecycle paths and the signal
//! handler. Slots are indexed by a hash of the thread id with bounded
//! linear probing; liveness is tracked with per-slot atomics so the signal
//! path can locate its source without ever blocking.
//!
//! Publish/retire protocol: a slot becomes visible to the signal handler
//! only after `publish` (state FREE → INIT → LIVE), and is retired
//! (LIVE → RETIRING) before any of its resources are released. The signal
//! handler therefore always observes either a fully valid source or none.
//!
//! Locking protocol: the handler *try*-locks and treats contention as a
//! race no-op; the destroyer spin-acquires the same flag. Spinning only
//! ever waits out a handler invocation on another thread, which is short
//! and cannot itself block.

#![allow(unsafe_code)] // UnsafeCell access is guarded by the slot state machine

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use crate::domain::Tid;

/// Number of slots; bounds how many threads can be sampled concurrently.
pub const SLOT_COUNT: usize = 1024;
/// Probe window after the home bucket. Lookups scan the whole window, so
/// interleaved removals cannot hide a live entry behind a freed slot.
const MAX_PROBES: usize = 64;

const FREE: u8 = 0;
const INIT: u8 = 1;
const LIVE: u8 = 2;
const RETIRING: u8 = 3;

/// The mutable per-thread resource guarded by a slot.
#[derive(Debug)]
pub struct SourceInner {
    /// Kernel counter handle
    pub fd: libc::c_int,
    /// Base of the mmapped ring buffer (metadata page + data pages)
    pub base: *mut u8,
    /// Total mapped length
    pub mmap_len: usize,
    /// Size of the metadata page (data starts right after it)
    pub page_size: usize,
    /// Monotonic ring-buffer read cursor
    pub cursor: u64,
}

const EMPTY_INNER: SourceInner = SourceInner {
    fd: -1,
    base: std::ptr::null_mut(),
    mmap_len: 0,
    page_size: 0,
    cursor: 0,
};

struct Slot {
    tid: AtomicU32,
    state: AtomicU8,
    lock: AtomicBool,
    inner: UnsafeCell<SourceInner>,
}

// SAFETY: inner is only touched while holding the slot lock (or during
// INIT, before the slot is visible), per the protocol above.
unsafe impl Sync for Slot {}
unsafe impl Send for Slot {}

impl Slot {
    fn new() -> Self {
        Slot {
            tid: AtomicU32::new(0),
            state: AtomicU8::new(FREE),
            lock: AtomicBool::new(false),
            inner: UnsafeCell::new(EMPTY_INNER),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ClaimError {
    /// A live source already exists for this thread (idempotent create)
    AlreadyLive,
    /// Probe window exhausted; the thread degrades to unsampled
    TableFull,
}

pub struct SlotTable {
    slots: Box<[Slot]>,
}

impl SlotTable {
    #[must_use]
    pub fn new() -> Self {
        let slots: Vec<Slot> = (0..SLOT_COUNT).map(|_| Slot::new()).collect();
        SlotTable { slots: slots.into_boxed_slice() }
    }

    fn bucket_of(tid: Tid) -> usize {
        // Fibonacci hashing spreads consecutive TIDs across the table
        (tid.0.wrapping_mul(0x9E37_79B9) >> 22) as usize & (SLOT_COUNT - 1)
    }

    /// Reserve a slot for `tid`. The caller fills in the source and then
    /// calls [`ClaimGuard::publish`]; dropping the guard unpublished rolls
    /// the claim back.
    ///
    /// # Errors
    /// [`ClaimError::AlreadyLive`] if the thread already has a source,
    /// [`ClaimError::TableFull`] if the probe window has no free slot.
    pub fn claim(&self, tid: Tid) -> Result<ClaimGuard<'_>, ClaimError> {
        let home = Self::bucket_of(tid);
        loop {
            let mut free: Option<usize> = None;
            for i in 0..MAX_PROBES {
                let idx = (home + i) & (SLOT_COUNT - 1);
                let slot = &self.slots[idx];
                let state = slot.state.load(Ordering::Acquire);
                if state != FREE && slot.tid.load(Ordering::Acquire) == tid.0 {
                    return Err(ClaimError::AlreadyLive);
                }
                if state == FREE && free.is_none() {
                    free = Some(idx);
                }
            }

            let Some(idx) = free else {
                return Err(ClaimError::TableFull);
            };

            let slot = &self.slots[idx];
            if slot
                .state
                .compare_exchange(FREE, INIT, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                slot.tid.store(tid.0, Ordering::Release);
                return Ok(ClaimGuard { slot, published: false });
            }
            // Lost the slot to a concurrent creator for another tid;
            // rescan, other free slots may remain in the window. Each
            // retry means a slot left FREE, so this terminates.
        }
    }

    /// Locate the live source for `tid` and try-lock it. Never blocks:
    /// contention or absence both report `None` (a race with destruction).
    /// This is the signal-handler lookup path.
    pub fn lookup_try_lock(&self, tid: Tid) -> Option<SlotGuard<'_>> {
        let home = Self::bucket_of(tid);
        for i in 0..MAX_PROBES {
            let idx = (home + i) & (SLOT_COUNT - 1);
            let slot = &self.slots[idx];
            if slot.tid.load(Ordering::Acquire) != tid.0
                || slot.state.load(Ordering::Acquire) != LIVE
            {
                continue;
            }
            if slot
                .lock
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                return None;
            }
            // Re-verify under the lock: the slot may have retired or been
            // recycled for another thread between the peek and the lock.
            if slot.state.load(Ordering::Acquire) == LIVE
                && slot.tid.load(Ordering::Acquire) == tid.0
            {
                return Some(SlotGuard { slot });
            }
            slot.lock.store(false, Ordering::Release);
            return None;
        }
        None
    }

    /// Retire the slot for `tid`, releasing its resources through
    /// `release` while holding the slot lock. No-op for an absent tid.
    /// Must not be called from signal context (it spins on the lock).
    ///
    /// Returns whether a source was actually destroyed.
    pub fn remove(&self, tid: Tid, release: impl FnOnce(&mut SourceInner)) -> bool {
        let home = Self::bucket_of(tid);
        for i in 0..MAX_PROBES {
            let idx = (home + i) & (SLOT_COUNT - 1);
            let slot = &self.slots[idx];
            if slot.tid.load(Ordering::Acquire) != tid.0
                || slot.state.load(Ordering::Acquire) != LIVE
            {
                continue;
            }
            while slot
                .lock
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                std::hint::spin_loop();
            }
            if slot.state.load(Ordering::Acquire) != LIVE
                || slot.tid.load(Ordering::Acquire) != tid.0
            {
                slot.lock.store(false, Ordering::Release);
                return false;
            }
            // Retire before releasing anything: a handler peeking at the
            // state from here on sees the slot as gone.
            slot.state.store(RETIRING, Ordering::Release);
            // SAFETY: lock held and state is RETIRING; no other accessor
            release(unsafe { &mut *slot.inner.get() });
            // SAFETY: as above
            unsafe { *slot.inner.get() = EMPTY_INNER };
            slot.tid.store(0, Ordering::Release);
            slot.state.store(FREE, Ordering::Release);
            slot.lock.store(false, Ordering::Release);
            return true;
        }
        false
    }

    /// TIDs of all currently live sources.
    #[must_use]
    pub fn live_tids(&self) -> Vec<Tid> {
        self.slots
            .iter()
            .filter(|slot| slot.state.load(Ordering::Acquire) == LIVE)
            .map(|slot| Tid(slot.tid.load(Ordering::Acquire)))
            .collect()
    }

    /// Number of live sources.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.state.load(Ordering::Acquire) == LIVE).count()
    }

    #[cfg(test)]
    fn bucket_for_test(tid: Tid) -> usize {
        Self::bucket_of(tid)
    }
}

impl Default for SlotTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Claimed-but-unpublished slot. Publishing makes it visible to the
/// signal handler; dropping without publishing rolls the claim back.
pub struct ClaimGuard<'a> {
    slot: &'a Slot,
    published: bool,
}

impl ClaimGuard<'_> {
    pub fn publish(mut self, inner: SourceInner) {
        // SAFETY: state is INIT, so no reader can reach inner yet
        unsafe { *self.slot.inner.get() = inner };
        self.slot.state.store(LIVE, Ordering::Release);
        self.published = true;
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if !self.published {
            self.slot.tid.store(0, Ordering::Release);
            self.slot.state.store(FREE, Ordering::Release);
        }
    }
}

/// Locked live slot held by the signal handler while it drains a record.
pub struct SlotGuard<'a> {
    slot: &'a Slot,
}

impl SlotGuard<'_> {
    pub fn inner_mut(&mut self) -> &mut SourceInner {
        // SAFETY: lock held and state verified LIVE at acquisition
        unsafe { &mut *self.slot.inner.get() }
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.slot.lock.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publish_dummy(table: &SlotTable, tid: Tid) {
        table.claim(tid).unwrap().publish(SourceInner { fd: -1, ..EMPTY_INNER });
    }

    #[test]
    fn test_claim_publish_lookup_remove() {
        let table = SlotTable::new();
        let tid = Tid(4242);

        assert!(table.lookup_try_lock(tid).is_none());
        publish_dummy(&table, tid);
        assert_eq!(table.live_count(), 1);

        let guard = table.lookup_try_lock(tid);
        assert!(guard.is_some());
        drop(guard);

        assert!(table.remove(tid, |_| {}));
        assert_eq!(table.live_count(), 0);
        assert!(table.lookup_try_lock(tid).is_none());
    }

    #[test]
    fn test_claim_is_idempotent_per_tid() {
        let table = SlotTable::new();
        publish_dummy(&table, Tid(7));
        match table.claim(Tid(7)) {
            Err(err) => assert_eq!(err, ClaimError::AlreadyLive),
            Ok(_) => panic!("second claim for a live tid must fail"),
        }
        assert_eq!(table.live_count(), 1);
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let table = SlotTable::new();
        let mut called = false;
        assert!(!table.remove(Tid(999), |_| called = true));
        assert!(!called);
    }

    #[test]
    fn test_unpublished_claim_rolls_back() {
        let table = SlotTable::new();
        let claim = table.claim(Tid(5)).unwrap();
        drop(claim);
        // Slot is free again and claimable
        assert!(table.claim(Tid(5)).is_ok());
    }

    #[test]
    fn test_try_lock_reports_contention_as_absent() {
        let table = SlotTable::new();
        publish_dummy(&table, Tid(11));
        let held = table.lookup_try_lock(Tid(11)).unwrap();
        // Second lookup while locked: race no-op, not a deadlock
        assert!(table.lookup_try_lock(Tid(11)).is_none());
        drop(held);
        assert!(table.lookup_try_lock(Tid(11)).is_some());
    }

    /// Find `n` distinct tids that share a home bucket.
    fn colliding_tids(n: usize) -> Vec<Tid> {
        let target = SlotTable::bucket_for_test(Tid(1));
        let mut found = vec![];
        for raw in 1..u32::MAX {
            if SlotTable::bucket_for_test(Tid(raw)) == target {
                found.push(Tid(raw));
                if found.len() == n {
                    break;
                }
            }
        }
        found
    }

    #[test]
    fn test_collisions_probe_to_free_slots() {
        let table = SlotTable::new();
        let tids = colliding_tids(8);
        for &tid in &tids {
            publish_dummy(&table, tid);
        }
        assert_eq!(table.live_count(), tids.len());
        // Every colliding entry remains reachable
        for &tid in &tids {
            assert!(table.lookup_try_lock(tid).is_some());
        }
        // Removing one in the middle must not hide the rest
        assert!(table.remove(tids[3], |_| {}));
        for (i, &tid) in tids.iter().enumerate() {
            assert_eq!(table.lookup_try_lock(tid).is_some(), i != 3);
        }
    }

    #[test]
    fn test_concurrent_claims_use_every_free_slot() {
        use std::sync::{Arc, Barrier};

        // Racing creators for distinct tids in the same probe window
        // must all succeed while free slots remain; losing the CAS for
        // one slot is not table exhaustion.
        let table = Arc::new(SlotTable::new());
        let tids = colliding_tids(16);
        let barrier = Arc::new(Barrier::new(tids.len()));
        let handles: Vec<_> = tids
            .iter()
            .map(|&tid| {
                let table = Arc::clone(&table);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    table
                        .claim(tid)
                        .map(|claim| claim.publish(SourceInner { fd: -1, ..EMPTY_INNER }))
                        .is_ok()
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert_eq!(table.live_count(), 16);
    }

    #[test]
    fn test_live_tids_matches_published_set() {
        let table = SlotTable::new();
        for raw in [10, 20, 30] {
            publish_dummy(&table, Tid(raw));
        }
        let mut live = table.live_tids();
        live.sort();
        assert_eq!(live, vec![Tid(10), Tid(20), Tid(30)]);
    }
}
