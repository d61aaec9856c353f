//! Bounded arena for boxed payloads crossing thread boundaries.
//!
//! Submissions that carry a boxed argument and tasks that return a boxed
//! result park the payload here instead of threading heap allocations
//! through the scheduler. Slots are tracked by 64-bit occupancy words;
//! a contiguous multi-slot borrow claims several slots atomically so a call
//! site can pass multiple boxed arguments as one unit.

use crate::sync::{AtomicU64, Ordering};
use crate::types::{BoxedValue, TaskCell};
use thiserror::Error;

const WORD_BITS: usize = 64;

/// Error produced when a pooled value is not available.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ValueError {
    /// The slot holds no value. For a task result this means the task has
    /// not completed yet, or the result was already taken.
    #[error("value slot is empty")]
    Empty,
    /// No contiguous run of free slots was available.
    #[error("value pool exhausted")]
    Exhausted,
}

/// Bitmask-indexed allocator over a fixed array of boxed payload slots.
#[derive(Debug)]
pub struct ValuePool {
    occupancy: Vec<AtomicU64>,
    slots: Vec<TaskCell<Option<BoxedValue>>>,
}

impl ValuePool {
    /// `capacity` must be a non-zero multiple of 64.
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity > 0 && capacity % WORD_BITS == 0,
            "ValuePool::new: capacity must be a non-zero multiple of 64"
        );
        Self {
            occupancy: (0..capacity / WORD_BITS).map(|_| AtomicU64::new(0)).collect(),
            slots: (0..capacity).map(|_| TaskCell::new(None)).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claim `n` contiguous slots and return the index of the first.
    ///
    /// A borrow never spans two occupancy words, so `n` is limited to 64.
    pub fn borrow(&self, n: usize) -> Option<u32> {
        assert!(n > 0 && n <= WORD_BITS, "ValuePool::borrow: bad span");
        let mask_base = if n == WORD_BITS { u64::MAX } else { (1u64 << n) - 1 };
        for (word_idx, word) in self.occupancy.iter().enumerate() {
            let mut occ = word.load(Ordering::Relaxed);
            'scan: loop {
                let mut shift = 0;
                let mask = loop {
                    if shift + n > WORD_BITS {
                        break 'scan;
                    }
                    let mask = mask_base << shift;
                    if occ & mask == 0 {
                        break mask;
                    }
                    shift += 1;
                };
                match word.compare_exchange_weak(
                    occ,
                    occ | mask,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Some((word_idx * WORD_BITS + shift) as u32),
                    Err(current) => occ = current,
                }
            }
        }
        None
    }

    /// Release `n` slots starting at `begin`, previously claimed by
    /// [`borrow`]. Any payloads still stored there are dropped.
    ///
    /// [`borrow`]: Self::borrow
    pub fn release(&self, begin: u32, n: usize) {
        assert!(n > 0 && n <= WORD_BITS, "ValuePool::release: bad span");
        let (word_idx, shift) = (begin as usize / WORD_BITS, begin as usize % WORD_BITS);
        assert!(
            shift + n <= WORD_BITS,
            "ValuePool::release: span crosses a word boundary"
        );
        for slot in begin..begin + n as u32 {
            // SAFETY: the caller owns the borrowed span until these bits are
            // cleared below, so no other thread touches these cells.
            unsafe {
                (*self.slots[slot as usize].get()) = None;
            }
        }
        let mask_base = if n == WORD_BITS { u64::MAX } else { (1u64 << n) - 1 };
        let mask = mask_base << shift;
        let prev = self.occupancy[word_idx].fetch_and(!mask, Ordering::Release);
        assert_eq!(prev & mask, mask, "ValuePool::release: slots were not borrowed");
    }

    /// Store a payload into a borrowed slot.
    pub fn store(&self, slot: u32, value: BoxedValue) {
        // SAFETY: the slot belongs to an active borrow, which confers
        // exclusive access until release.
        unsafe {
            (*self.slots[slot as usize].get()) = Some(value);
        }
    }

    /// Take the payload out of a borrowed slot.
    pub fn take(&self, slot: u32) -> Result<BoxedValue, ValueError> {
        // SAFETY: as in `store`; takers are sequenced after the storing task
        // completed (the caller observes completion through its `Handle`
        // before calling this).
        unsafe { (*self.slots[slot as usize].get()).take().ok_or(ValueError::Empty) }
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn borrow_store_take_release() {
        let pool = ValuePool::new(64);
        let slot = pool.borrow(1).unwrap();
        pool.store(slot, Box::new(42u32));
        let value = pool.take(slot).unwrap();
        assert_eq!(*value.downcast::<u32>().unwrap(), 42);
        assert!(matches!(pool.take(slot), Err(ValueError::Empty)));
        pool.release(slot, 1);
    }

    #[test]
    fn contiguous_spans_do_not_overlap() {
        let pool = ValuePool::new(128);
        let a = pool.borrow(10).unwrap();
        let b = pool.borrow(10).unwrap();
        assert!(a + 10 <= b || b + 10 <= a);
        pool.release(a, 10);
        let c = pool.borrow(60).unwrap();
        assert_eq!(pool.borrow(60), None);
        pool.release(b, 10);
        pool.release(c, 60);
    }

    #[test]
    fn exhaustion_is_a_value() {
        let pool = ValuePool::new(64);
        let full = pool.borrow(64).unwrap();
        assert_eq!(pool.borrow(1), None);
        pool.release(full, 64);
        assert!(pool.borrow(1).is_some());
    }
}
