#[cfg(feature = "loom")]
mod imp {
    pub(crate) use loom::sync::{
        Mutex,
        atomic::{
            AtomicBool, AtomicI32, AtomicU8, AtomicU16, AtomicU32, AtomicU64, AtomicUsize,
            Ordering,
        },
    };

    pub(crate) fn spin_hint() {
        loom::thread::yield_now();
    }
}

#[cfg(not(feature = "loom"))]
mod imp {
    pub(crate) use core::sync::atomic::{
        AtomicBool, AtomicI32, AtomicU8, AtomicU16, AtomicU32, AtomicU64, AtomicUsize, Ordering,
    };
    pub(crate) use std::sync::Mutex;

    pub(crate) fn spin_hint() {
        core::hint::spin_loop();
    }
}

pub(crate) use imp::*;
