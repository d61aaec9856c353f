use core::any::Any;
use core::cell::UnsafeCell;
use core::num::NonZeroU16;
use derive_more::{Deref, DerefMut};

/// Unique identifier of a submitted task.
///
/// This is the task arena slot index plus one, so `Option<TaskId>` is
/// niche-packed and an `AtomicU16` holding `0` means "no task".
pub type TaskId = NonZeroU16;

/// Boxed payload moved across thread boundaries through the [`ValuePool`].
///
/// [`ValuePool`]: crate::value_pool::ValuePool
pub type BoxedValue = Box<dyn Any + Send>;

/// An `UnsafeCell` wrapper that is `Sync` for `T: Send`.
///
/// Unlike a share-only cell this acts as a channel: a slot's contents are
/// written by whichever thread holds its exclusive claim and may be taken by
/// a different thread later. Claim protocols (arena state tags, pool entry
/// removal) guarantee that no two threads access the same slot mutably at
/// the same time.
#[derive(Debug, Deref, DerefMut)]
#[repr(transparent)]
pub(crate) struct TaskCell<T>(UnsafeCell<T>);

unsafe impl<T: Send> Sync for TaskCell<T> {}

impl<T> TaskCell<T> {
    pub(crate) fn new(val: T) -> Self {
        Self(UnsafeCell::new(val))
    }
}
