mod worker;

use crate::arena::{TaskArena, TaskCall, TaskDescriptor};
use crate::batch::{batch_run_count, batch_shift};
use crate::config::SchedulerConfig;
use crate::graph::DependencyGraph;
use crate::handle::Handle;
use crate::pool::TaskPool;
use crate::scheduler::worker::{current_worker, execute_detached, run_one, worker_main};
use crate::sync::{AtomicBool, AtomicU64, AtomicUsize, Mutex, Ordering};
use crate::types::{BoxedValue, TaskId};
use crate::value_pool::{ValueError, ValuePool};
use core::num::NonZeroUsize;
use core::ops::Range;
use crossbeam_utils::sync::{Parker, Unparker};
use derive_more::Debug;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, trace};

/// Claim on a pooled task result, produced by [`Scheduler::schedule_returning`]
/// and redeemed with [`Scheduler::take_result`] once the task's handle is
/// complete.
#[derive(Debug)]
#[must_use]
pub struct ValueTicket {
    slot: u32,
}

/// State shared between the owning [`Scheduler`] and its worker threads.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) graph: DependencyGraph,
    pub(crate) arena: TaskArena,
    pub(crate) values: ValuePool,
    /// One ready queue per worker thread.
    pub(crate) pools: Vec<TaskPool>,
    /// Spill target for full pools and landing zone for external submitters.
    pub(crate) overflow: Mutex<VecDeque<TaskId>>,
    /// Tasks restricted to the main thread. Drained only by
    /// [`Scheduler::run_main_thread_tasks`], never by workers.
    pub(crate) main_queue: Mutex<VecDeque<TaskId>>,
    #[debug(skip)]
    pub(crate) unparkers: Vec<Unparker>,
    /// Bit `i` set while worker `i` is parked.
    pub(crate) parked: AtomicU64,
    /// Tasks sitting in worker pools or the overflow queue. Drives the
    /// proportional wakeup below; an estimate, not an invariant.
    pub(crate) queued: AtomicUsize,
    /// Submitted tasks that have not yet completed (parked on a dependency,
    /// queued, or running).
    pub(crate) in_flight: AtomicUsize,
    pub(crate) shutdown: AtomicBool,
}

impl Shared {
    /// Route a runnable task to a queue: the main queue for main-thread-only
    /// tasks, the current worker's pool when called from a worker, the
    /// overflow queue otherwise.
    pub(crate) fn enqueue(&self, id: TaskId) {
        if self.arena.flags(id) & crate::arena::FLAG_MAIN_THREAD != 0 {
            self.main_queue
                .lock()
                .expect("Shared::enqueue: [1]")
                .push_back(id);
            return;
        }
        match current_worker(self) {
            Some(w) => {
                if !self.pools[w].try_push(id.get()) {
                    self.handoff(w, id);
                }
            }
            None => self
                .overflow
                .lock()
                .expect("Shared::enqueue: [2]")
                .push_back(id),
        }
        self.queued.fetch_add(1, Ordering::SeqCst);
        self.wake_workers();
    }

    /// Pool handoff: the owner's pool is full, so its entries move to the
    /// overflow queue and the pool continues empty.
    fn handoff(&self, w: usize, id: TaskId) {
        trace!(worker = w, "pool full, handing entries off to overflow");
        let mut queue = self.overflow.lock().expect("Shared::handoff: [1]");
        while let Some(raw) = self.pools[w].try_pop() {
            queue.push_back(TaskId::new(raw).expect("Shared::handoff: [2]"));
        }
        queue.push_back(id);
    }

    /// Move queued entries from the overflow queue into worker `w`'s pool.
    pub(crate) fn refill_from_overflow(&self, w: usize) -> bool {
        let mut queue = self
            .overflow
            .lock()
            .expect("Shared::refill_from_overflow: [1]");
        let mut moved = false;
        while let Some(&id) = queue.front() {
            if !self.pools[w].try_push(id.get()) {
                break;
            }
            queue.pop_front();
            moved = true;
        }
        moved
    }

    pub(crate) fn pop_overflow(&self) -> Option<TaskId> {
        let id = self
            .overflow
            .lock()
            .expect("Shared::pop_overflow: [1]")
            .pop_front();
        if id.is_some() {
            self.note_dequeued();
        }
        id
    }

    pub(crate) fn note_dequeued(&self) {
        self.queued.fetch_sub(1, Ordering::SeqCst);
    }

    /// Wake parked workers, at most as many as there are queued tasks, to
    /// parallelize bursts without a thundering herd.
    fn wake_workers(&self) {
        let mut want = self.queued.load(Ordering::SeqCst);
        let mut parked = self.parked.load(Ordering::SeqCst);
        while want > 0 && parked != 0 {
            let index = parked.trailing_zeros() as usize;
            let bit = 1u64 << index;
            if self.parked.fetch_and(!bit, Ordering::SeqCst) & bit != 0 {
                self.unparkers[index].unpark();
                want -= 1;
            }
            parked &= !bit;
        }
    }
}

/// Fine-grained dependency-aware job scheduler.
///
/// Owns a fixed pool of worker threads that pull short-lived tasks from
/// per-thread ready queues, falling back to a shared overflow queue and to
/// stealing from peers. Dependencies between tasks are expressed through
/// [`Handle`]s; completed prerequisites automatically release their
/// dependents.
///
/// The thread constructing the scheduler is its *main thread*: tasks
/// submitted through [`schedule_on_main`] run only there, inside
/// [`run_main_thread_tasks`]. The main thread must therefore never block on
/// [`complete`] for a main-thread-only task; pump the queue and use
/// [`wait_for_all`] instead.
///
/// Dropping the scheduler joins the workers after they drain every task that
/// is already runnable; tasks still parked on a never-signaled deferred
/// handle are abandoned. Call [`wait_for_all`] first when that matters.
///
/// [`schedule_on_main`]: Self::schedule_on_main
/// [`run_main_thread_tasks`]: Self::run_main_thread_tasks
/// [`complete`]: Self::complete
/// [`wait_for_all`]: Self::wait_for_all
#[must_use]
#[derive(Debug)]
pub struct Scheduler {
    shared: Arc<Shared>,
    #[debug(skip)]
    workers: Vec<JoinHandle<()>>,
    main_thread: ThreadId,
}

impl Scheduler {
    /// Spawn the worker pool described by `config`.
    ///
    /// # Panics
    /// On invalid capacities (see [`SchedulerConfig`]) or a worker count
    /// outside `1..=64`.
    pub fn new(config: SchedulerConfig) -> Self {
        let workers = config.worker_threads.unwrap_or_else(|| {
            thread::available_parallelism().map_or(4, NonZeroUsize::get)
        });
        assert!(
            (1..=64).contains(&workers),
            "Scheduler::new: worker count must be in 1..=64"
        );
        let parkers: Vec<Parker> = (0..workers).map(|_| Parker::new()).collect();
        let shared = Arc::new(Shared {
            graph: DependencyGraph::new(config.graph_pages),
            arena: TaskArena::new(config.task_capacity),
            values: ValuePool::new(config.value_capacity),
            pools: (0..workers).map(|_| TaskPool::new()).collect(),
            overflow: Mutex::new(VecDeque::new()),
            main_queue: Mutex::new(VecDeque::new()),
            unparkers: parkers.iter().map(|p| p.unparker().clone()).collect(),
            parked: AtomicU64::new(0),
            queued: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        });
        let workers = parkers
            .into_iter()
            .enumerate()
            .map(|(index, parker)| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("jobgraph-worker-{index}"))
                    .spawn(move || worker_main(&shared, index, &parker))
                    .expect("Scheduler::new: [1]")
            })
            .collect();
        debug!(workers = shared.pools.len(), "scheduler started");
        Self {
            shared,
            workers,
            main_thread: thread::current().id(),
        }
    }

    fn submit(&self, desc: TaskDescriptor, dep: Option<Handle>) -> Handle {
        let shared = &*self.shared;
        let id = shared.arena.allocate(desc);
        shared.in_flight.fetch_add(1, Ordering::AcqRel);
        match dep {
            None => {
                let handle = shared.graph.create_handle(Some(id));
                shared.arena.publish_handle(id, handle);
                shared.enqueue(id);
                handle
            }
            Some(dep) => shared.graph.create_handle_with_dependency(
                id,
                dep,
                |handle| shared.arena.publish_handle(id, handle),
                &mut |task| shared.enqueue(task),
            ),
        }
    }

    /// Submit a task with no prerequisites.
    pub fn schedule(&self, f: impl FnOnce() + Send + 'static) -> Handle {
        self.submit(
            TaskDescriptor {
                call: TaskCall::Basic(Box::new(f)),
                ..TaskDescriptor::default()
            },
            None,
        )
    }

    /// Submit a task that runs only after `dep` completes.
    pub fn schedule_after(&self, dep: Handle, f: impl FnOnce() + Send + 'static) -> Handle {
        self.submit(
            TaskDescriptor {
                call: TaskCall::Basic(Box::new(f)),
                ..TaskDescriptor::default()
            },
            Some(dep),
        )
    }

    /// Submit a task restricted to the main-thread queue. It runs during
    /// [`run_main_thread_tasks`], never on a worker.
    ///
    /// [`run_main_thread_tasks`]: Self::run_main_thread_tasks
    pub fn schedule_on_main(&self, f: impl FnOnce() + Send + 'static) -> Handle {
        self.submit(
            TaskDescriptor {
                call: TaskCall::Basic(Box::new(f)),
                main_thread: true,
                ..TaskDescriptor::default()
            },
            None,
        )
    }

    /// Main-thread-only task ordered after `dep`.
    pub fn schedule_on_main_after(
        &self,
        dep: Handle,
        f: impl FnOnce() + Send + 'static,
    ) -> Handle {
        self.submit(
            TaskDescriptor {
                call: TaskCall::Basic(Box::new(f)),
                main_thread: true,
                ..TaskDescriptor::default()
            },
            Some(dep),
        )
    }

    /// Submit a task carrying an inline 32-bit argument.
    pub fn schedule_with_u32(&self, value: u32, f: impl FnOnce(u32) + Send + 'static) -> Handle {
        self.submit(
            TaskDescriptor {
                call: TaskCall::WithU32(Box::new(f)),
                data_begin: value,
                ..TaskDescriptor::default()
            },
            None,
        )
    }

    /// Submit a task carrying an inline 64-bit argument.
    pub fn schedule_with_u64(&self, value: u64, f: impl FnOnce(u64) + Send + 'static) -> Handle {
        self.submit(
            TaskDescriptor {
                call: TaskCall::WithU64(Box::new(f)),
                data_begin: value as u32,
                data_count: (value >> 32) as u32,
                ..TaskDescriptor::default()
            },
            None,
        )
    }

    /// Submit a task taking a boxed argument, parked in the value pool until
    /// the task runs.
    ///
    /// # Errors
    /// [`ValueError::Exhausted`] when no pool slot is free.
    pub fn schedule_with_value(
        &self,
        value: BoxedValue,
        f: impl FnOnce(BoxedValue) + Send + 'static,
    ) -> Result<Handle, ValueError> {
        let slot = self.shared.values.borrow(1).ok_or(ValueError::Exhausted)?;
        self.shared.values.store(slot, value);
        Ok(self.submit(
            TaskDescriptor {
                call: TaskCall::WithValue(Box::new(f)),
                data_begin: slot,
                ..TaskDescriptor::default()
            },
            None,
        ))
    }

    /// Submit a task whose boxed result is retrievable through the returned
    /// ticket once its handle is complete.
    ///
    /// # Errors
    /// [`ValueError::Exhausted`] when no pool slot is free.
    pub fn schedule_returning(
        &self,
        f: impl FnOnce() -> BoxedValue + Send + 'static,
    ) -> Result<(Handle, ValueTicket), ValueError> {
        let slot = self.shared.values.borrow(1).ok_or(ValueError::Exhausted)?;
        let handle = self.submit(
            TaskDescriptor {
                call: TaskCall::Returning(Box::new(f)),
                data_begin: slot,
                ..TaskDescriptor::default()
            },
            None,
        );
        Ok((handle, ValueTicket { slot }))
    }

    /// Redeem a ticket for the task's boxed result and release its slot.
    ///
    /// # Errors
    /// [`ValueError::Empty`] when the task has not completed yet. The ticket
    /// is consumed and its slot abandoned in that case, so call this only
    /// after the handle reads complete.
    pub fn take_result(&self, ticket: ValueTicket) -> Result<BoxedValue, ValueError> {
        let value = self.shared.values.take(ticket.slot)?;
        self.shared.values.release(ticket.slot, 1);
        Ok(value)
    }

    /// Submit a data-parallel task over `range`, split into sub-ranges of at
    /// least `min_batch` items that workers claim independently. The handle
    /// completes once after the last sub-range finishes.
    pub fn schedule_batch(
        &self,
        range: Range<u32>,
        min_batch: u32,
        f: impl Fn(Range<u32>) + Send + Sync + 'static,
    ) -> Handle {
        self.submit_batch(range, min_batch, f, None)
    }

    /// Data-parallel task ordered after `dep`.
    pub fn schedule_batch_after(
        &self,
        dep: Handle,
        range: Range<u32>,
        min_batch: u32,
        f: impl Fn(Range<u32>) + Send + Sync + 'static,
    ) -> Handle {
        self.submit_batch(range, min_batch, f, Some(dep))
    }

    fn submit_batch(
        &self,
        range: Range<u32>,
        min_batch: u32,
        f: impl Fn(Range<u32>) + Send + Sync + 'static,
        dep: Option<Handle>,
    ) -> Handle {
        let count = range.end.saturating_sub(range.start);
        if count == 0 {
            // Nothing to run; hand back a handle that already reads complete.
            let handle = self.shared.graph.create_handle(None);
            self.shared
                .graph
                .mark_complete(handle, &mut |_| unreachable!("empty batch dispatched a task"));
            return handle;
        }
        let shift = batch_shift(count, min_batch.max(1));
        self.submit(
            TaskDescriptor {
                call: TaskCall::Batch(Box::new(f)),
                data_begin: range.start,
                data_count: count,
                batch_shift: shift,
                run_count: batch_run_count(count, shift),
                ..TaskDescriptor::default()
            },
            dep,
        )
    }

    /// Join two prerequisites without blocking: the returned handle
    /// completes once both have.
    pub fn join(&self, a: Handle, b: Handle) -> Handle {
        self.shared.graph.combine(a, b)
    }

    /// Fold any number of prerequisites into one handle. `None` for an empty
    /// slice.
    pub fn combine_dependencies(&self, handles: &[Handle]) -> Option<Handle> {
        handles
            .iter()
            .copied()
            .reduce(|a, b| self.shared.graph.combine(a, b))
    }

    /// Create a fence handle with no associated task, completed later by
    /// [`signal`]. Useful to order tasks after an event whose producer is
    /// not itself a task.
    ///
    /// [`signal`]: Self::signal
    pub fn create_deferred_handle(&self) -> Handle {
        self.shared.graph.create_handle(None)
    }

    /// Complete a deferred handle, releasing its dependents.
    ///
    /// # Panics
    /// If `handle` was already completed.
    pub fn signal(&self, handle: Handle) {
        let shared = &*self.shared;
        shared.graph.mark_complete(handle, &mut |task| shared.enqueue(task));
    }

    /// `true` once `handle`'s task (or fence) has completed. Lock-free.
    pub fn is_complete(&self, handle: Handle) -> bool {
        self.shared.graph.is_complete(handle)
    }

    /// Block until `handle` completes, running queued tasks while waiting.
    ///
    /// On the main thread this also pumps the main-thread queue; still,
    /// prefer [`run_main_thread_tasks`] + [`wait_for_all`] there to avoid
    /// waiting on a handle that transitively needs the main thread.
    ///
    /// [`run_main_thread_tasks`]: Self::run_main_thread_tasks
    /// [`wait_for_all`]: Self::wait_for_all
    pub fn complete(&self, handle: Handle) {
        let shared = &*self.shared;
        while !shared.graph.is_complete(handle) {
            if self.help() {
                continue;
            }
            thread::yield_now();
        }
    }

    /// Block until every submitted task has completed, running queued tasks
    /// while waiting. Never returns early: a task parked on an incomplete
    /// dependency still counts as in flight.
    pub fn wait_for_all(&self) {
        let shared = &*self.shared;
        while shared.in_flight.load(Ordering::Acquire) != 0 {
            if self.help() {
                continue;
            }
            thread::yield_now();
        }
    }

    /// Drain the main-thread-only queue. Must be called from the thread that
    /// constructed the scheduler; typically once per frame.
    ///
    /// # Panics
    /// When called from any other thread.
    pub fn run_main_thread_tasks(&self) {
        assert_eq!(
            thread::current().id(),
            self.main_thread,
            "Scheduler::run_main_thread_tasks: not the main thread"
        );
        while self.run_one_main() {}
    }

    fn run_one_main(&self) -> bool {
        let id = self
            .shared
            .main_queue
            .lock()
            .expect("Scheduler::run_one_main: [1]")
            .pop_front();
        match id {
            Some(id) => {
                execute_detached(&self.shared, id);
                true
            }
            None => false,
        }
    }

    fn help(&self) -> bool {
        let shared = &*self.shared;
        if thread::current().id() == self.main_thread && self.run_one_main() {
            return true;
        }
        run_one(shared, current_worker(shared))
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        for unparker in &self.shared.unparkers {
            unparker.unpark();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        debug!("scheduler stopped");
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}
