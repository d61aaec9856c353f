//! Fine-grained, dependency-aware parallel job scheduler.
//!
//! This crate decomposes per-frame work (simulation, render preparation,
//! asset processing) into short-lived tasks that run across a fixed pool of
//! worker threads with automatic dependency ordering. It:
//! - Tracks dependencies in a fixed-capacity, versioned node arena: handles
//!   to completed nodes self-detect as stale instead of dangling.
//! - Runs ready tasks through per-thread ring-buffer pools with work
//!   stealing, a shared overflow queue, and a dedicated main-thread queue.
//! - Splits data-parallel batches into independently claimable sub-ranges
//!   with a single completion once the last sub-range finishes.
//! - Avoids per-submission heap traffic with fixed arenas for task
//!   descriptors and boxed cross-thread payloads.
//!
//! Key modules:
//! - `scheduler`: the [`Scheduler`] — worker threads, queues, submission
//!   API, wake/sleep signaling.
//! - `graph`: the [`DependencyGraph`] of prerequisite counts and dependent
//!   lists, driving completion propagation.
//! - `pool`: the per-thread [`TaskPool`] ready queue behind one packed
//!   atomic state word.
//! - `value_pool`: the [`ValuePool`] arena for boxed arguments and results.
//! - `batch`: sub-range partition math for data-parallel tasks.
//!
//! Quick start:
//! 1. Build a [`Scheduler`] (usually `Scheduler::default()`).
//! 2. Submit closures with [`Scheduler::schedule`], ordering them with the
//!    returned [`Handle`]s via [`Scheduler::schedule_after`] and
//!    [`Scheduler::join`].
//! 3. On the main thread, pump [`Scheduler::run_main_thread_tasks`] once per
//!    frame and settle with [`Scheduler::wait_for_all`].
//!
//! A task is dispatched only after its prerequisite's completion has fully
//! propagated; sibling dependents of one completed node may run in any order
//! and on any thread. There is no cancellation and no priority beyond
//! main-thread affinity.

#[cfg(not(feature = "loom"))]
mod arena;
/// Sub-range partition math for data-parallel batch tasks.
pub mod batch;
/// Scheduler capacity and sizing knobs.
pub mod config;
/// The dependency-graph node arena and completion propagation.
///
/// Brains of the crate: prerequisite counting, dependent registration, and
/// the page-scoped locking that makes registration race-proof against
/// concurrent completion.
pub mod graph;
/// Versioned handles to dependency-graph nodes.
pub mod handle;
/// Per-thread ready queues (packed-word ring buffers).
pub mod pool;
/// The scheduler: worker threads, queues, and the submission API.
///
/// Not compiled under the `loom` feature: loom models exercise the graph
/// and pool primitives directly, on model threads rather than OS threads.
#[cfg(not(feature = "loom"))]
pub mod scheduler;
mod sync;
mod types;
/// Bounded arena for boxed payloads crossing thread boundaries.
pub mod value_pool;

pub use crate::config::SchedulerConfig;
pub use crate::graph::{DependencyGraph, MAX_DEPENDENTS};
pub use crate::handle::Handle;
pub use crate::pool::{POOL_CAPACITY, TaskPool};
#[cfg(not(feature = "loom"))]
pub use crate::scheduler::{Scheduler, ValueTicket};
pub use crate::types::{BoxedValue, TaskId};
pub use crate::value_pool::{ValueError, ValuePool};
