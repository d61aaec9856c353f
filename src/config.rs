/// Capacity and sizing knobs for a [`Scheduler`].
///
/// [`Scheduler`]: crate::scheduler::Scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Worker thread count. `None` means the host core count. Capped at 64.
    pub worker_threads: Option<usize>,
    /// Dependency-graph pages (64 node slots each).
    pub graph_pages: usize,
    /// Task arena capacity; a power of two below 65535.
    pub task_capacity: usize,
    /// Value pool capacity; a non-zero multiple of 64.
    pub value_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            graph_pages: 64,
            task_capacity: 1024,
            value_capacity: 2048,
        }
    }
}
