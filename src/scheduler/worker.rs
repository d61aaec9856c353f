//! Worker run loop: claim, steal, execute, sleep.

use crate::arena::{FLAG_BATCH, TaskCall};
use crate::batch::batch_sub_range;
use crate::pool::TaskPool;
use crate::scheduler::Shared;
use crate::sync::{Ordering, spin_hint};
use crate::types::TaskId;
use core::cell::Cell;
use crossbeam_utils::sync::Parker;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread;
use tracing::{error, trace};

/// Failed polls spent spinning before yielding the OS thread.
const SPIN_POLLS: u32 = 200;
/// Additional failed polls spent yielding before parking.
const YIELD_POLLS: u32 = 50;

thread_local! {
    /// `(shared address, worker index)` of the pool this thread belongs to,
    /// or `usize::MAX` when the thread is not a worker.
    static CURRENT_WORKER: Cell<(usize, usize)> = const { Cell::new((0, usize::MAX)) };
}

/// Index of the calling thread within `shared`'s worker pool, if any.
pub(crate) fn current_worker(shared: &Shared) -> Option<usize> {
    let (tag, index) = CURRENT_WORKER.with(Cell::get);
    (index != usize::MAX && tag == core::ptr::from_ref(shared) as usize).then_some(index)
}

/// A dispatch claim produced by popping (or partially popping) a pool entry.
enum Claim {
    /// Exclusive claim on a non-batch task.
    Whole(TaskId),
    /// One sub-range of a batch task.
    Sub { id: TaskId, run: u32 },
}

pub(crate) fn worker_main(shared: &Arc<Shared>, index: usize, parker: &Parker) {
    CURRENT_WORKER.with(|c| c.set((Arc::as_ptr(shared) as usize, index)));
    trace!(worker = index, "worker thread started");
    let bit = 1u64 << index;
    let mut idle = 0u32;
    loop {
        if run_one(shared, Some(index)) {
            idle = 0;
            continue;
        }
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        idle += 1;
        if idle < SPIN_POLLS {
            spin_hint();
        } else if idle < SPIN_POLLS + YIELD_POLLS {
            thread::yield_now();
        } else {
            shared.parked.fetch_or(bit, Ordering::SeqCst);
            // Re-check after advertising the parked bit so an enqueue that
            // missed it cannot strand us asleep.
            if shared.queued.load(Ordering::SeqCst) > 0
                || shared.shutdown.load(Ordering::SeqCst)
            {
                shared.parked.fetch_and(!bit, Ordering::SeqCst);
            } else {
                parker.park();
                shared.parked.fetch_and(!bit, Ordering::SeqCst);
            }
            idle = 0;
        }
    }
    trace!(worker = index, "worker thread stopped");
}

/// Find and run one task (or batch sub-range). Search order: own pool, the
/// overflow queue, then peer pools round-robin. `worker` is `None` for
/// helping threads that own no pool.
pub(crate) fn run_one(shared: &Shared, worker: Option<usize>) -> bool {
    if let Some(w) = worker {
        if let Some(claim) = claim_from_pool(shared, &shared.pools[w]) {
            execute(shared, claim);
            return true;
        }
        if shared.refill_from_overflow(w)
            && let Some(claim) = claim_from_pool(shared, &shared.pools[w])
        {
            execute(shared, claim);
            return true;
        }
    } else if let Some(id) = shared.pop_overflow() {
        execute_detached(shared, id);
        return true;
    }

    let pools = shared.pools.len();
    let start = worker.map_or(0, |w| w + 1);
    for offset in 0..pools {
        let peer = (start + offset) % pools;
        if Some(peer) == worker {
            continue;
        }
        if let Some(claim) = claim_from_pool(shared, &shared.pools[peer]) {
            execute(shared, claim);
            return true;
        }
    }
    false
}

/// Pop a claim from one pool. A non-batch entry is consumed outright; a
/// batch entry yields one sub-range and stays queued until its final
/// sub-range is claimed.
fn claim_from_pool(shared: &Shared, pool: &TaskPool) -> Option<Claim> {
    let raw = pool.try_begin_pop()?;
    let id = TaskId::new(raw).expect("claim_from_pool: [1]");
    if shared.arena.flags(id) & FLAG_BATCH == 0 {
        pool.end_pop();
        shared.note_dequeued();
        return Some(Claim::Whole(id));
    }
    // SAFETY: batch descriptor fields are written before publication and
    // only read concurrently afterwards.
    let run_count = unsafe { shared.arena.descriptor(id) }.run_count;
    let run = shared.arena.claim_run(id);
    // Claims on one entry are serialized by the pool's op marker and the
    // final claim removes the entry, so the index cannot overshoot.
    assert!(run < run_count, "claim_from_pool: [2]");
    if run + 1 == run_count {
        pool.end_pop();
        shared.note_dequeued();
    } else {
        pool.yield_pop();
    }
    Some(Claim::Sub { id, run })
}

/// Run a task popped straight from a queue with no pool residency (overflow
/// help path, main-thread pump). Batch tasks run all remaining sub-ranges
/// inline, since no pool entry is left for other workers to claim from.
pub(crate) fn execute_detached(shared: &Shared, id: TaskId) {
    if shared.arena.flags(id) & FLAG_BATCH == 0 {
        execute(shared, Claim::Whole(id));
        return;
    }
    // SAFETY: as in `claim_from_pool`.
    let run_count = unsafe { shared.arena.descriptor(id) }.run_count;
    loop {
        let run = shared.arena.claim_run(id);
        assert!(run < run_count, "execute_detached: [1]");
        execute(shared, Claim::Sub { id, run });
        if run + 1 == run_count {
            break;
        }
    }
}

fn execute(shared: &Shared, claim: Claim) {
    match claim {
        Claim::Whole(id) => {
            // SAFETY: a consumed pool entry is a unique dispatch claim.
            let call = unsafe { shared.arena.take_call(id) };
            match call {
                TaskCall::Basic(f) => invoke(f),
                TaskCall::WithU32(f) => {
                    // SAFETY: immutable after publication; we hold the claim.
                    let value = unsafe { shared.arena.descriptor(id) }.data_begin;
                    invoke(move || f(value));
                }
                TaskCall::WithU64(f) => {
                    // SAFETY: as above.
                    let desc = unsafe { shared.arena.descriptor(id) };
                    let value = u64::from(desc.data_begin) | (u64::from(desc.data_count) << 32);
                    invoke(move || f(value));
                }
                TaskCall::WithValue(f) => {
                    // SAFETY: as above.
                    let slot = unsafe { shared.arena.descriptor(id) }.data_begin;
                    let arg = shared
                        .values
                        .take(slot)
                        .expect("execute: pooled argument missing");
                    shared.values.release(slot, 1);
                    invoke(move || f(arg));
                }
                TaskCall::Returning(f) => {
                    // SAFETY: as above.
                    let slot = unsafe { shared.arena.descriptor(id) }.data_begin;
                    let result = invoke(f);
                    shared.values.store(slot, result);
                }
                TaskCall::None | TaskCall::Batch(_) => {
                    unreachable!("execute: bad call shape for a whole claim")
                }
            }
            finish_task(shared, id);
        }
        Claim::Sub { id, run } => {
            let run_count;
            {
                // SAFETY: shared read of a published descriptor; the batch
                // callback is `Fn` and invoked concurrently by design.
                let desc = unsafe { shared.arena.descriptor(id) };
                run_count = desc.run_count;
                let TaskCall::Batch(f) = &desc.call else {
                    unreachable!("execute: sub-range claim on a non-batch task")
                };
                let range =
                    batch_sub_range(desc.data_begin, desc.data_count, desc.batch_shift, run);
                invoke(move || f(range));
            }
            // Completion is tracked separately from claiming: the last
            // sub-range to *finish* fires the task's single completion, which
            // need not be the last one claimed.
            if shared.arena.finish_run(id) == run_count {
                finish_task(shared, id);
            }
        }
    }
}

fn finish_task(shared: &Shared, id: TaskId) {
    // SAFETY: the task has fully run; we hold the only reference to the id.
    let handle = unsafe { shared.arena.descriptor(id) }.dependency;
    shared
        .graph
        .mark_complete(handle, &mut |task| shared.enqueue(task));
    shared.arena.clear(id);
    shared.in_flight.fetch_sub(1, Ordering::Release);
}

/// Run a task callback under the crate's panic policy: a panicking callback
/// is logged and the process aborts. Dependents of a half-run task are never
/// released.
fn invoke<R>(f: impl FnOnce() -> R) -> R {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let panic_message = payload
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("opaque panic payload");
            error!(panic_message, "task callback panicked, aborting");
            std::process::abort();
        }
    }
}
