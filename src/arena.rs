//! Fixed-size table of submitted task descriptors.
//!
//! Slots are claimed by a CAS on an atomic state tag (the descriptor itself
//! is written exactly once after the claim and read only after dispatch), and
//! probed from a rotating cursor. Exhaustion degrades to a yielding rescan
//! rather than an error: a full arena means the system is saturated and a
//! slot will free up as soon as any task completes.

use crate::handle::Handle;
use crate::sync::{AtomicU8, AtomicU32, Ordering};
use crate::types::{BoxedValue, TaskCell, TaskId};
use core::ops::Range;
use derive_more::Debug;

const STATE_EMPTY: u8 = 0;
const STATE_OCCUPIED: u8 = 1;

pub(crate) const FLAG_MAIN_THREAD: u8 = 1 << 0;
pub(crate) const FLAG_BATCH: u8 = 1 << 1;

/// The callback of a task, as a tagged union over the call shapes the
/// scheduler actually supports.
#[derive(Debug, Default)]
pub(crate) enum TaskCall {
    /// Empty slot.
    #[default]
    None,
    /// Plain closure.
    Basic(#[debug(skip)] Box<dyn FnOnce() + Send>),
    /// Closure taking an inline 32-bit value from the descriptor.
    WithU32(#[debug(skip)] Box<dyn FnOnce(u32) + Send>),
    /// Closure taking an inline 64-bit value packed into the descriptor's
    /// `data_begin`/`data_count` pair.
    WithU64(#[debug(skip)] Box<dyn FnOnce(u64) + Send>),
    /// Closure taking a boxed argument parked in the value pool at
    /// `data_begin`.
    WithValue(#[debug(skip)] Box<dyn FnOnce(BoxedValue) + Send>),
    /// Closure whose boxed result is stored into the value pool at
    /// `data_begin` before completion is propagated.
    Returning(#[debug(skip)] Box<dyn FnOnce() -> BoxedValue + Send>),
    /// Data-parallel closure, invoked once per claimed sub-range.
    Batch(#[debug(skip)] Box<dyn Fn(Range<u32>) + Send + Sync>),
}

/// A submitted task: callback, data range (or pooled-payload index), batch
/// partitioning, and the handle of its own dependency-graph node.
#[derive(Debug, Default)]
pub(crate) struct TaskDescriptor {
    pub(crate) call: TaskCall,
    pub(crate) data_begin: u32,
    pub(crate) data_count: u32,
    pub(crate) batch_shift: u32,
    pub(crate) run_count: u32,
    pub(crate) main_thread: bool,
    pub(crate) dependency: Handle,
}

#[derive(Debug)]
struct TaskSlot {
    state: AtomicU8,
    flags: AtomicU8,
    /// Next batch sub-range to claim.
    run_index: AtomicU32,
    /// Batch sub-ranges that finished running. Kept separate from
    /// `run_index` so claiming and completing stay independent.
    completed: AtomicU32,
    desc: TaskCell<TaskDescriptor>,
}

/// Fixed-size table of task descriptors addressed by probing inserts.
#[derive(Debug)]
pub(crate) struct TaskArena {
    slots: Vec<TaskSlot>,
    cursor: AtomicU32,
}

impl TaskArena {
    /// `capacity` must be a power of two no larger than `u16::MAX`.
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two() && capacity < u16::MAX as usize,
            "TaskArena::new: capacity must be a power of two below 65535"
        );
        Self {
            slots: (0..capacity)
                .map(|_| TaskSlot {
                    state: AtomicU8::new(STATE_EMPTY),
                    flags: AtomicU8::new(0),
                    run_index: AtomicU32::new(0),
                    completed: AtomicU32::new(0),
                    desc: TaskCell::new(TaskDescriptor::default()),
                })
                .collect(),
            cursor: AtomicU32::new(0),
        }
    }

    fn slot(&self, id: TaskId) -> &TaskSlot {
        &self.slots[(id.get() - 1) as usize]
    }

    /// Insert a descriptor and return its id. Spins (with OS yields) while
    /// the arena is saturated.
    pub(crate) fn allocate(&self, desc: TaskDescriptor) -> TaskId {
        let mask = self.slots.len() as u32 - 1;
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        loop {
            for offset in 0..self.slots.len() as u32 {
                let index = (start + offset) & mask;
                let slot = &self.slots[index as usize];
                if slot
                    .state
                    .compare_exchange(
                        STATE_EMPTY,
                        STATE_OCCUPIED,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_err()
                {
                    continue;
                }
                let mut flags = 0;
                if desc.main_thread {
                    flags |= FLAG_MAIN_THREAD;
                }
                if matches!(desc.call, TaskCall::Batch(_)) {
                    flags |= FLAG_BATCH;
                }
                slot.flags.store(flags, Ordering::Relaxed);
                slot.run_index.store(0, Ordering::Relaxed);
                slot.completed.store(0, Ordering::Relaxed);
                // SAFETY: the CAS above granted exclusive ownership of the
                // slot; nothing reads it before the task is dispatched, and
                // dispatch is sequenced after this write.
                unsafe {
                    *slot.desc.get() = desc;
                }
                return TaskId::new(index as u16 + 1).expect("TaskArena::allocate: [1]");
            }
            std::thread::yield_now();
        }
    }

    /// Record the handle of the task's own graph node. Must happen before
    /// the task can be dispatched; the graph's `publish` callback provides
    /// exactly that window.
    pub(crate) fn publish_handle(&self, id: TaskId, handle: Handle) {
        // SAFETY: called while the submitting thread still has exclusive
        // logical ownership (pre-dispatch).
        unsafe {
            (*self.slot(id).desc.get()).dependency = handle;
        }
    }

    /// Shared read access to a dispatched descriptor.
    ///
    /// # Safety
    /// The caller must be sequenced after the descriptor was fully written
    /// (i.e. hold the task id via a dispatch path) and must not race with
    /// [`take_call`] or [`clear`] for this id.
    ///
    /// [`take_call`]: Self::take_call
    /// [`clear`]: Self::clear
    pub(crate) unsafe fn descriptor(&self, id: TaskId) -> &TaskDescriptor {
        // SAFETY: per the function contract.
        unsafe { &*self.slot(id).desc.get() }
    }

    /// Move the callback out of the slot for a single exclusive run.
    ///
    /// # Safety
    /// The caller must hold the task's unique dispatch claim (a pool entry
    /// consumed exactly once).
    pub(crate) unsafe fn take_call(&self, id: TaskId) -> TaskCall {
        // SAFETY: per the function contract.
        unsafe { core::mem::take(&mut (*self.slot(id).desc.get()).call) }
    }

    pub(crate) fn flags(&self, id: TaskId) -> u8 {
        self.slot(id).flags.load(Ordering::Relaxed)
    }

    /// Claim the next batch sub-range index.
    pub(crate) fn claim_run(&self, id: TaskId) -> u32 {
        self.slot(id).run_index.fetch_add(1, Ordering::Relaxed)
    }

    /// Record one finished batch sub-range; returns how many have finished.
    pub(crate) fn finish_run(&self, id: TaskId) -> u32 {
        self.slot(id).completed.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Reset the descriptor and make the slot reusable. The only way a slot
    /// becomes free again.
    pub(crate) fn clear(&self, id: TaskId) {
        let slot = self.slot(id);
        // SAFETY: clearing happens after the task's single completion, when
        // no other thread holds a claim on this id.
        unsafe {
            *slot.desc.get() = TaskDescriptor::default();
        }
        slot.flags.store(0, Ordering::Relaxed);
        slot.state.store(STATE_EMPTY, Ordering::Release);
    }
}
