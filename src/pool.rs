//! Per-thread ready queue: a fixed-capacity ring buffer behind one packed
//! atomic state word.
//!
//! The state word is `{op, begin, count}`; `op` is a transient lock marker
//! set for the duration of a structural mutation. Competing threads retry
//! instead of blocking, so the common path is a single successful CAS plus
//! one entry store. The two-phase [`try_begin_pop`]/[`end_pop`]/[`yield_pop`]
//! protocol lets a batch task stay at the front of the queue while its
//! sub-ranges are claimed one by one, and be removed only with its last one.
//!
//! [`try_begin_pop`]: TaskPool::try_begin_pop
//! [`end_pop`]: TaskPool::end_pop
//! [`yield_pop`]: TaskPool::yield_pop

use crate::sync::{AtomicU16, AtomicU32, Ordering, spin_hint};

/// Ring capacity. Deliberately tiny: a full pool hands its entries off to the
/// scheduler's overflow queue rather than growing.
pub const POOL_CAPACITY: usize = 4;

const OP_LOCKED: u32 = 1 << 16;
const BEGIN_SHIFT: u32 = 8;
const FIELD_MASK: u32 = 0xFF;

fn pack(locked: bool, begin: u32, count: u32) -> u32 {
    (if locked { OP_LOCKED } else { 0 }) | (begin << BEGIN_SHIFT) | count
}

fn unpack(state: u32) -> (bool, u32, u32) {
    (
        state & OP_LOCKED != 0,
        (state >> BEGIN_SHIFT) & FIELD_MASK,
        state & FIELD_MASK,
    )
}

/// Fixed-capacity concurrent ring buffer of ready task ids.
#[derive(Debug)]
pub struct TaskPool {
    state: AtomicU32,
    entries: [AtomicU16; POOL_CAPACITY],
}

impl TaskPool {
    pub fn new() -> Self {
        Self {
            state: AtomicU32::new(pack(false, 0, 0)),
            entries: [
                AtomicU16::new(0),
                AtomicU16::new(0),
                AtomicU16::new(0),
                AtomicU16::new(0),
            ],
        }
    }

    /// Number of entries currently queued. Racy snapshot.
    pub fn len(&self) -> usize {
        let (_, _, count) = unpack(self.state.load(Ordering::Relaxed));
        count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a raw task id. Returns `false` when the ring is full, which is
    /// the owner's cue to hand the pool's contents off to the overflow queue.
    pub fn try_push(&self, id: u16) -> bool {
        loop {
            let state = self.state.load(Ordering::Acquire);
            let (locked, begin, count) = unpack(state);
            if locked {
                spin_hint();
                continue;
            }
            if count as usize == POOL_CAPACITY {
                return false;
            }
            if self
                .state
                .compare_exchange_weak(
                    state,
                    pack(true, begin, count),
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_err()
            {
                continue;
            }
            let slot = (begin + count) as usize % POOL_CAPACITY;
            self.entries[slot].store(id, Ordering::Relaxed);
            self.state.store(pack(false, begin, count + 1), Ordering::Release);
            return true;
        }
    }

    /// Remove and return the front entry.
    pub fn try_pop(&self) -> Option<u16> {
        let id = self.try_begin_pop()?;
        self.end_pop();
        Some(id)
    }

    /// Read the front entry without structural mutation. Racy snapshot: the
    /// entry may be gone by the time the caller acts on it.
    pub fn try_peek(&self) -> Option<u16> {
        let state = self.state.load(Ordering::Acquire);
        let (locked, begin, count) = unpack(state);
        if locked || count == 0 {
            return None;
        }
        Some(self.entries[begin as usize].load(Ordering::Relaxed))
    }

    /// First phase of a pop: lock the pool and read the front entry. The
    /// caller must follow up with exactly one of [`end_pop`] (consume) or
    /// [`yield_pop`] (leave the entry in place), promptly.
    ///
    /// [`end_pop`]: Self::end_pop
    /// [`yield_pop`]: Self::yield_pop
    pub fn try_begin_pop(&self) -> Option<u16> {
        loop {
            let state = self.state.load(Ordering::Acquire);
            let (locked, begin, count) = unpack(state);
            if locked {
                spin_hint();
                continue;
            }
            if count == 0 {
                return None;
            }
            if self
                .state
                .compare_exchange_weak(
                    state,
                    pack(true, begin, count),
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_err()
            {
                continue;
            }
            return Some(self.entries[begin as usize].load(Ordering::Relaxed));
        }
    }

    /// Second phase of a pop: consume the front entry and unlock.
    pub fn end_pop(&self) {
        let state = self.state.load(Ordering::Relaxed);
        let (locked, begin, count) = unpack(state);
        debug_assert!(locked && count > 0, "TaskPool::end_pop: not mid-pop");
        let begin = (begin + 1) % POOL_CAPACITY as u32;
        self.state.store(pack(false, begin, count - 1), Ordering::Release);
    }

    /// Second phase of a pop: keep the front entry and unlock. Used when a
    /// batch task still has unclaimed sub-ranges.
    pub fn yield_pop(&self) {
        let state = self.state.load(Ordering::Relaxed);
        let (locked, begin, count) = unpack(state);
        debug_assert!(locked && count > 0, "TaskPool::yield_pop: not mid-pop");
        self.state.store(pack(false, begin, count), Ordering::Release);
    }
}

impl Default for TaskPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn push_pop_fifo() {
        let pool = TaskPool::new();
        assert!(pool.try_pop().is_none());
        for id in 1..=4 {
            assert!(pool.try_push(id));
        }
        assert!(!pool.try_push(5));
        assert_eq!(pool.len(), 4);
        for id in 1..=4 {
            assert_eq!(pool.try_peek(), Some(id));
            assert_eq!(pool.try_pop(), Some(id));
        }
        assert!(pool.is_empty());
    }

    #[test]
    fn yield_pop_keeps_entry() {
        let pool = TaskPool::new();
        assert!(pool.try_push(7));
        assert_eq!(pool.try_begin_pop(), Some(7));
        pool.yield_pop();
        assert_eq!(pool.try_begin_pop(), Some(7));
        pool.end_pop();
        assert!(pool.try_pop().is_none());
    }

    #[test]
    fn wraps_around_the_ring() {
        let pool = TaskPool::new();
        for round in 0..10u16 {
            assert!(pool.try_push(round * 2));
            assert!(pool.try_push(round * 2 + 1));
            assert_eq!(pool.try_pop(), Some(round * 2));
            assert_eq!(pool.try_pop(), Some(round * 2 + 1));
        }
    }
}
