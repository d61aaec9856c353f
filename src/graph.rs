//! Fixed-capacity arena of dependency nodes and the completion-propagation
//! protocol that drives automatic task ordering.
//!
//! Nodes are addressed as `(page, index-within-page)` across a fixed number
//! of 64-node pages, each tracked by one occupancy bitmask word. The per-node
//! `dependency_count` is the whole state machine:
//!
//! - `>= 0` — number of unresolved prerequisites,
//! - `-1`   — dispatched/running, no pending prerequisites,
//! - `-2`   — completed (terminal).
//!
//! The only legal transitions are `N → N-1` (a prerequisite completed),
//! `0 → -1` (dispatched) and `-1 → -2` (finished). Cross-thread decrements
//! are plain atomics; the rarer multi-field updates (registering a new
//! dependent, draining the dependents list at completion) are serialized by
//! a lock scoped to the 64-node page. Scoping registration and the
//! completion drain to the same lock is what makes a registration racing
//! with the completion of its target either land before the drain (and be
//! drained) or observe the bumped version (and take the already-complete
//! path) — never be lost.

use crate::handle::Handle;
use crate::sync::{AtomicI32, AtomicU8, AtomicU16, AtomicU32, AtomicU64, Mutex, Ordering};
use crate::types::TaskId;

pub(crate) const NODES_PER_PAGE: usize = 64;

/// A node may have at most this many direct dependents; exceeding it is a
/// fatal capacity violation.
pub const MAX_DEPENDENTS: usize = 4;

const COUNT_DISPATCHED: i32 = -1;
const COUNT_COMPLETE: i32 = -2;

#[derive(Debug)]
struct Node {
    dependency_count: AtomicI32,
    version: AtomicU8,
    /// `TaskId` as raw `u16`; `0` means the node exists only to be waited on.
    task: AtomicU16,
    dependent_len: AtomicU8,
    /// Node indices waiting on this one. Written under the page lock only.
    dependents: [AtomicU16; MAX_DEPENDENTS],
}

impl Node {
    fn new() -> Self {
        Self {
            dependency_count: AtomicI32::new(COUNT_COMPLETE),
            version: AtomicU8::new(0),
            task: AtomicU16::new(0),
            dependent_len: AtomicU8::new(0),
            dependents: [
                AtomicU16::new(0),
                AtomicU16::new(0),
                AtomicU16::new(0),
                AtomicU16::new(0),
            ],
        }
    }
}

#[derive(Debug)]
struct Page {
    occupancy: AtomicU64,
    lock: Mutex<()>,
    nodes: Vec<Node>,
}

/// Fixed-capacity arena of dependency nodes. See the module docs for the
/// state machine and locking discipline.
#[derive(Debug)]
pub struct DependencyGraph {
    pages: Vec<Page>,
    cursor: AtomicU32,
}

impl DependencyGraph {
    /// Create a graph with `pages * 64` node slots. `pages` is capped at
    /// 1024 so node indices fit the `u16` dependents entries.
    pub fn new(pages: usize) -> Self {
        assert!(
            pages > 0 && pages <= 1024,
            "DependencyGraph::new: pages must be in 1..=1024"
        );
        Self {
            pages: (0..pages)
                .map(|_| Page {
                    occupancy: AtomicU64::new(0),
                    lock: Mutex::new(()),
                    nodes: (0..NODES_PER_PAGE).map(|_| Node::new()).collect(),
                })
                .collect(),
            cursor: AtomicU32::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.pages.len() * NODES_PER_PAGE
    }

    fn node(&self, index: u32) -> &Node {
        &self.pages[index as usize / NODES_PER_PAGE].nodes[index as usize % NODES_PER_PAGE]
    }

    fn page(&self, index: u32) -> (&Page, u64) {
        (
            &self.pages[index as usize / NODES_PER_PAGE],
            1u64 << (index as usize % NODES_PER_PAGE),
        )
    }

    /// Allocate a free slot by probing from a rotating cursor, bit-scanning
    /// the inverted occupancy word of each page.
    fn alloc(&self) -> u32 {
        let pages = self.pages.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) as usize;
        for offset in 0..pages {
            let page_idx = (start + offset) % pages;
            let page = &self.pages[page_idx];
            let mut occ = page.occupancy.load(Ordering::Relaxed);
            while occ != u64::MAX {
                let bit = (!occ).trailing_zeros();
                match page.occupancy.compare_exchange_weak(
                    occ,
                    occ | 1 << bit,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return (page_idx * NODES_PER_PAGE) as u32 + bit,
                    Err(current) => occ = current,
                }
            }
        }
        panic!("DependencyGraph: node arena exhausted ({} slots)", self.capacity());
    }

    fn init_node(&self, index: u32, task: Option<TaskId>, count: i32) -> Handle {
        let node = self.node(index);
        debug_assert_eq!(
            node.dependency_count.load(Ordering::Relaxed),
            COUNT_COMPLETE,
            "DependencyGraph::init_node: slot not terminal"
        );
        node.task
            .store(task.map_or(0, TaskId::get), Ordering::Relaxed);
        node.dependent_len.store(0, Ordering::Relaxed);
        node.dependency_count.store(count, Ordering::Release);
        Handle::new(index, node.version.load(Ordering::Relaxed))
    }

    /// Allocate a node with no pending prerequisites, marked dispatched.
    ///
    /// With `Some(task)` this is a freshly runnable task node: the caller
    /// enqueues the task and completes the handle when it has run. With
    /// `None` it is a deferred handle — a fence created before its
    /// completion source exists, finished later by an explicit
    /// [`mark_complete`].
    ///
    /// [`mark_complete`]: Self::mark_complete
    pub fn create_handle(&self, task: Option<TaskId>) -> Handle {
        let index = self.alloc();
        self.init_node(index, task, COUNT_DISPATCHED)
    }

    /// Create the node for `task`, ordered after `dep`.
    ///
    /// Three outcomes, in preference order:
    /// - `dep` is already complete: a dispatched node, `task` is handed to
    ///   `on_ready` immediately.
    /// - `dep`'s node carries no task yet (a fence): `task` rides on that
    ///   node, avoiding a second allocation.
    /// - otherwise: a fresh node with one pending prerequisite, registered
    ///   as a dependent of `dep`.
    ///
    /// `publish` receives the handle of the node the task ended up on and is
    /// invoked before the task can possibly be dispatched on any thread, so
    /// the caller can record the handle into the task's descriptor without
    /// racing the first run.
    pub fn create_handle_with_dependency(
        &self,
        task: TaskId,
        dep: Handle,
        publish: impl FnOnce(Handle),
        on_ready: &mut impl FnMut(TaskId),
    ) -> Handle {
        let mut publish = Some(publish);
        if self.is_complete(dep) {
            let handle = self.create_handle(Some(task));
            (publish.take().expect("create_handle_with_dependency: [1]"))(handle);
            on_ready(task);
            return handle;
        }

        if self.try_attach(task, dep, &mut publish, on_ready) {
            return dep;
        }

        let index = self.alloc();
        let handle = self.init_node(index, Some(task), 1);
        (publish.take().expect("create_handle_with_dependency: [2]"))(handle);
        if !self.register_dependent(dep, index as u16) {
            // The prerequisite completed while we were registering; resolve
            // the node's single pending count ourselves.
            self.resolve_one(index, on_ready);
        }
        handle
    }

    /// Try to place `task` directly onto `dep`'s node. Succeeds only if the
    /// node is live, still waiting on prerequisites, and carries no task.
    ///
    /// The transient `dependency_count` increment pins the node in the
    /// waiting state while the task id is written: the final prerequisite
    /// decrement cannot reach zero (and dispatch a half-written node) before
    /// our own matching decrement, which also makes us the dispatcher if the
    /// pin was the last thing holding the node back.
    fn try_attach(
        &self,
        task: TaskId,
        dep: Handle,
        publish: &mut Option<impl FnOnce(Handle)>,
        on_ready: &mut impl FnMut(TaskId),
    ) -> bool {
        let (page, bit) = self.page(dep.id());
        let node = self.node(dep.id());
        {
            let _guard = page.lock.lock().expect("DependencyGraph::try_attach: [1]");
            if page.occupancy.load(Ordering::Relaxed) & bit == 0
                || node.version.load(Ordering::Relaxed) != dep.version()
                || node.task.load(Ordering::Relaxed) != 0
            {
                return false;
            }
            let mut count = node.dependency_count.load(Ordering::Relaxed);
            loop {
                if count <= 0 {
                    // Dispatched, completing, or mid-resolve: too late to
                    // ride on this node.
                    return false;
                }
                match node.dependency_count.compare_exchange_weak(
                    count,
                    count + 1,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(current) => count = current,
                }
            }
            node.task.store(task.get(), Ordering::Relaxed);
        }
        (publish.take().expect("DependencyGraph::try_attach: [2]"))(dep);
        // Release the pin; if every real prerequisite resolved in the
        // meantime, this dispatches the task.
        self.resolve_one(dep.id(), on_ready);
        true
    }

    /// Register node `waiter` to be notified when `dep` completes. Returns
    /// `false` if `dep` is already complete (the normal fast path when
    /// racing a completion, not an error).
    ///
    /// # Panics
    /// If `dep` already has [`MAX_DEPENDENTS`] direct dependents.
    pub(crate) fn register_dependent(&self, dep: Handle, waiter: u16) -> bool {
        let (page, bit) = self.page(dep.id());
        let node = self.node(dep.id());
        let _guard = page
            .lock
            .lock()
            .expect("DependencyGraph::register_dependent: [1]");
        if page.occupancy.load(Ordering::Relaxed) & bit == 0
            || node.version.load(Ordering::Relaxed) != dep.version()
        {
            return false;
        }
        let len = node.dependent_len.load(Ordering::Relaxed) as usize;
        assert!(
            len < MAX_DEPENDENTS,
            "DependencyGraph: node has too many direct dependents (max {MAX_DEPENDENTS})"
        );
        node.dependents[len].store(waiter, Ordering::Relaxed);
        node.dependent_len.store(len as u8 + 1, Ordering::Relaxed);
        true
    }

    /// Join two prerequisites into a single handle that completes when both
    /// have.
    ///
    /// Allocates a fence node with its count pre-set to 2 before either
    /// registration, so the first prerequisite completing mid-call cannot
    /// drive the count to zero early. When one of the sources is already
    /// complete the surviving handle is returned directly instead of
    /// spending a node on it.
    pub fn combine(&self, a: Handle, b: Handle) -> Handle {
        if self.is_complete(a) {
            return b;
        }
        if self.is_complete(b) {
            return a;
        }
        let index = self.alloc();
        let fence = self.init_node(index, None, 2);
        // A fence this young has no task and no dependents, so resolving it
        // to zero can only free it; the sink is unreachable.
        let mut unreachable_sink =
            |_task: TaskId| unreachable!("DependencyGraph::combine: fresh fence dispatched a task");
        if !self.register_dependent(a, index as u16) {
            self.resolve_one(index, &mut unreachable_sink);
        }
        if !self.register_dependent(b, index as u16) {
            self.resolve_one(index, &mut unreachable_sink);
        }
        fence
    }

    /// `true` once the slot behind `h` is unoccupied or reused: completion
    /// bumps the version before the slot is freed, so a stale handle
    /// self-detects. Lock-free.
    pub fn is_complete(&self, h: Handle) -> bool {
        let (page, bit) = self.page(h.id());
        if page.occupancy.load(Ordering::Acquire) & bit == 0 {
            return true;
        }
        self.node(h.id()).version.load(Ordering::Acquire) != h.version()
    }

    /// Complete a dispatched node: transition `-1 → -2`, bump the version,
    /// drain the dependents exactly once, free the slot, and decrement each
    /// dependent's count. Dependents reaching zero are dispatched through
    /// `on_ready` (task nodes) or completed recursively (fences).
    ///
    /// # Panics
    /// If `h` is stale or its node is not in the dispatched state: completing
    /// a handle twice is a caller bug.
    pub fn mark_complete(&self, h: Handle, on_ready: &mut impl FnMut(TaskId)) {
        assert!(
            !self.is_complete(h),
            "DependencyGraph::mark_complete: handle already complete"
        );
        self.complete_index(h.id(), on_ready);
    }

    /// One prerequisite of the node at `index` resolved. The thread whose
    /// decrement reaches zero owns the `0 → -1` transition and either
    /// dispatches the node's task or, for a bare fence, completes it on the
    /// spot.
    pub(crate) fn resolve_one(&self, index: u32, on_ready: &mut impl FnMut(TaskId)) {
        let node = self.node(index);
        let prev = node.dependency_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "DependencyGraph::resolve_one: count underflow");
        if prev != 1 {
            return;
        }
        node.dependency_count
            .store(COUNT_DISPATCHED, Ordering::Release);
        match TaskId::new(node.task.load(Ordering::Acquire)) {
            Some(task) => on_ready(task),
            None => self.complete_index(index, on_ready),
        }
    }

    fn complete_index(&self, index: u32, on_ready: &mut impl FnMut(TaskId)) {
        let node = self.node(index);
        node.dependency_count
            .compare_exchange(
                COUNT_DISPATCHED,
                COUNT_COMPLETE,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .expect("DependencyGraph::complete_index: node not in dispatched state");

        let (page, bit) = self.page(index);
        let mut waiters = [0u16; MAX_DEPENDENTS];
        let waiter_len;
        {
            let _guard = page
                .lock
                .lock()
                .expect("DependencyGraph::complete_index: [1]");
            node.version.fetch_add(1, Ordering::Release);
            waiter_len = node.dependent_len.load(Ordering::Relaxed) as usize;
            for (dst, src) in waiters.iter_mut().zip(&node.dependents[..waiter_len]) {
                *dst = src.load(Ordering::Relaxed);
            }
            node.dependent_len.store(0, Ordering::Relaxed);
            node.task.store(0, Ordering::Relaxed);
            page.occupancy.fetch_and(!bit, Ordering::Release);
        }
        for &waiter in &waiters[..waiter_len] {
            self.resolve_one(waiter as u32, on_ready);
        }
    }
}
