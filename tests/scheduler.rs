#![allow(missing_docs)]
#![cfg(not(feature = "loom"))]

use jobgraph::{Scheduler, SchedulerConfig};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

fn scheduler(workers: usize) -> Scheduler {
    Scheduler::new(SchedulerConfig {
        worker_threads: Some(workers),
        ..SchedulerConfig::default()
    })
}

#[test]
fn work_conservation_ten_thousand_tasks() {
    let scheduler = scheduler(8);
    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..10_000 {
        let ran = Arc::clone(&ran);
        scheduler.schedule(move || {
            ran.fetch_add(1, Ordering::Relaxed);
        });
    }
    scheduler.wait_for_all();
    assert_eq!(ran.load(Ordering::Relaxed), 10_000);
}

#[test]
fn dependency_orders_execution() {
    let scheduler = scheduler(4);
    for _ in 0..200 {
        let first_done = Arc::new(AtomicUsize::new(0));
        let ordered = Arc::new(AtomicUsize::new(0));
        let a = {
            let first_done = Arc::clone(&first_done);
            scheduler.schedule(move || {
                first_done.store(1, Ordering::SeqCst);
            })
        };
        let b = {
            let first_done = Arc::clone(&first_done);
            let ordered = Arc::clone(&ordered);
            scheduler.schedule_after(a, move || {
                ordered.store(first_done.load(Ordering::SeqCst), Ordering::SeqCst);
            })
        };
        scheduler.complete(b);
        assert!(scheduler.is_complete(a));
        assert!(scheduler.is_complete(b));
        assert_eq!(ordered.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn join_releases_dependent_exactly_once() {
    let scheduler = scheduler(4);
    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..200 {
        let a = scheduler.create_deferred_handle();
        let b = scheduler.create_deferred_handle();
        let joined = scheduler.join(a, b);
        {
            let ran = Arc::clone(&ran);
            scheduler.schedule_after(joined, move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        // Complete the two prerequisites from two racing threads.
        thread::scope(|scope| {
            scope.spawn(|| scheduler.signal(a));
            scope.spawn(|| scheduler.signal(b));
        });
        scheduler.wait_for_all();
    }
    assert_eq!(ran.load(Ordering::SeqCst), 200);
}

#[test]
fn combine_dependencies_folds_many_handles() {
    let scheduler = scheduler(4);
    assert!(scheduler.combine_dependencies(&[]).is_none());

    let counter = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let counter = Arc::clone(&counter);
            scheduler.schedule(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();
    let all = scheduler.combine_dependencies(&handles).unwrap();
    let seen = Arc::new(AtomicUsize::new(0));
    let after = {
        let counter = Arc::clone(&counter);
        let seen = Arc::clone(&seen);
        scheduler.schedule_after(all, move || {
            seen.store(counter.load(Ordering::SeqCst), Ordering::SeqCst);
        })
    };
    scheduler.complete(after);
    assert_eq!(seen.load(Ordering::SeqCst), 8);
}

#[test]
fn batch_covers_every_index_exactly_once() {
    let scheduler = scheduler(8);
    let hits: Arc<Vec<AtomicU32>> = Arc::new((0..1000).map(|_| AtomicU32::new(0)).collect());
    let completions = Arc::new(AtomicUsize::new(0));

    let batch = {
        let hits = Arc::clone(&hits);
        scheduler.schedule_batch(0..1000, 32, move |range| {
            for index in range {
                hits[index as usize].fetch_add(1, Ordering::Relaxed);
            }
        })
    };
    {
        let completions = Arc::clone(&completions);
        scheduler.schedule_after(batch, move || {
            completions.fetch_add(1, Ordering::SeqCst);
        });
    }
    scheduler.wait_for_all();

    for (index, hit) in hits.iter().enumerate() {
        assert_eq!(hit.load(Ordering::Relaxed), 1, "index {index} hit count");
    }
    assert_eq!(completions.load(Ordering::SeqCst), 1);
    assert!(scheduler.is_complete(batch));
}

#[test]
fn empty_batch_is_immediately_complete() {
    let scheduler = scheduler(2);
    let handle = scheduler.schedule_batch(10..10, 4, |_| panic!("empty batch must not run"));
    assert!(scheduler.is_complete(handle));
}

#[test]
fn batch_respects_dependency() {
    let scheduler = scheduler(4);
    let gate = scheduler.create_deferred_handle();
    let ran = Arc::new(AtomicUsize::new(0));
    let batch = {
        let ran = Arc::clone(&ran);
        scheduler.schedule_batch_after(gate, 0..100, 1, move |range| {
            ran.fetch_add(range.len(), Ordering::SeqCst);
        })
    };
    thread::sleep(Duration::from_millis(20));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert!(!scheduler.is_complete(batch));
    scheduler.signal(gate);
    scheduler.complete(batch);
    assert_eq!(ran.load(Ordering::SeqCst), 100);
}

#[test]
fn main_thread_isolation() {
    let scheduler = scheduler(4);
    let main_id = thread::current().id();
    let wrong_thread = Arc::new(AtomicUsize::new(0));
    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..1000 {
        let wrong_thread = Arc::clone(&wrong_thread);
        let ran = Arc::clone(&ran);
        scheduler.schedule_on_main(move || {
            if thread::current().id() != main_id {
                wrong_thread.fetch_add(1, Ordering::SeqCst);
            }
            ran.fetch_add(1, Ordering::SeqCst);
        });
    }
    scheduler.run_main_thread_tasks();
    scheduler.wait_for_all();
    assert_eq!(ran.load(Ordering::SeqCst), 1000);
    assert_eq!(wrong_thread.load(Ordering::SeqCst), 0);
}

#[test]
fn main_thread_task_after_worker_dependency() {
    let scheduler = scheduler(4);
    let main_id = thread::current().id();
    let ok = Arc::new(AtomicUsize::new(0));
    let worker_task = scheduler.schedule(|| {});
    {
        let ok = Arc::clone(&ok);
        scheduler.schedule_on_main_after(worker_task, move || {
            if thread::current().id() == main_id {
                ok.fetch_add(1, Ordering::SeqCst);
            }
        });
    }
    scheduler.wait_for_all();
    assert_eq!(ok.load(Ordering::SeqCst), 1);
}

#[test]
fn returning_task_delivers_its_value() {
    let scheduler = scheduler(2);
    let (handle, ticket) = scheduler
        .schedule_returning(|| Box::new(40u32 + 2))
        .unwrap();
    scheduler.complete(handle);
    let value = scheduler.take_result(ticket).unwrap();
    assert_eq!(*value.downcast::<u32>().unwrap(), 42);
}

#[test]
fn boxed_argument_reaches_the_task() {
    let scheduler = scheduler(2);
    let seen = Arc::new(AtomicUsize::new(0));
    let handle = {
        let seen = Arc::clone(&seen);
        scheduler
            .schedule_with_value(Box::new(123usize), move |value| {
                seen.store(*value.downcast::<usize>().unwrap(), Ordering::SeqCst);
            })
            .unwrap()
    };
    scheduler.complete(handle);
    assert_eq!(seen.load(Ordering::SeqCst), 123);
}

#[test]
fn inline_arguments_reach_the_task() {
    let scheduler = scheduler(2);
    let seen32 = Arc::new(AtomicU32::new(0));
    let seen64 = Arc::new(AtomicUsize::new(0));
    let h32 = {
        let seen32 = Arc::clone(&seen32);
        scheduler.schedule_with_u32(0xDEAD_BEEF, move |v| seen32.store(v, Ordering::SeqCst))
    };
    let h64 = {
        let seen64 = Arc::clone(&seen64);
        scheduler
            .schedule_with_u64(0x1234_5678_9ABC_DEF0, move |v| {
                seen64.store(v as usize, Ordering::SeqCst)
            })
    };
    scheduler.complete(h32);
    scheduler.complete(h64);
    assert_eq!(seen32.load(Ordering::SeqCst), 0xDEAD_BEEF);
    assert_eq!(seen64.load(Ordering::SeqCst), 0x1234_5678_9ABC_DEF0);
}

#[test]
fn stale_handles_never_report_incomplete_after_completion() {
    let scheduler = scheduler(4);
    let first = scheduler.schedule(|| {});
    scheduler.complete(first);
    // Recycle arena slots thousands of times; the old handle must keep
    // reading complete throughout.
    for _ in 0..50 {
        for _ in 0..100 {
            scheduler.schedule(|| {});
        }
        scheduler.wait_for_all();
        assert!(scheduler.is_complete(first));
    }
}

#[test]
fn complete_blocks_until_the_task_ran() {
    let scheduler = scheduler(2);
    let done = Arc::new(AtomicUsize::new(0));
    let handle = {
        let done = Arc::clone(&done);
        scheduler.schedule(move || {
            thread::sleep(Duration::from_millis(30));
            done.store(1, Ordering::SeqCst);
        })
    };
    scheduler.complete(handle);
    assert_eq!(done.load(Ordering::SeqCst), 1);
}

#[test]
fn parked_workers_wake_for_late_submissions() {
    let scheduler = scheduler(4);
    // Give every worker time to fall asleep.
    thread::sleep(Duration::from_millis(100));
    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..64 {
        let ran = Arc::clone(&ran);
        scheduler.schedule(move || {
            ran.fetch_add(1, Ordering::Relaxed);
        });
    }
    scheduler.wait_for_all();
    assert_eq!(ran.load(Ordering::Relaxed), 64);
}

#[test]
fn submissions_from_worker_tasks_use_local_pools() {
    let scheduler = Arc::new(scheduler(4));
    let ran = Arc::new(AtomicUsize::new(0));
    // Fan out from inside tasks: each root spawns children from the worker
    // thread it runs on, exercising the local-pool push and handoff paths.
    for _ in 0..32 {
        let scheduler2 = Arc::clone(&scheduler);
        let ran2 = Arc::clone(&ran);
        scheduler.schedule(move || {
            for _ in 0..16 {
                let ran3 = Arc::clone(&ran2);
                scheduler2.schedule(move || {
                    ran3.fetch_add(1, Ordering::Relaxed);
                });
            }
        });
    }
    scheduler.wait_for_all();
    assert_eq!(ran.load(Ordering::Relaxed), 32 * 16);
}

#[test]
#[should_panic(expected = "too many direct dependents")]
fn fifth_dependent_panics_through_the_scheduler_too() {
    let scheduler = scheduler(1);
    let gate = scheduler.create_deferred_handle();
    for _ in 0..5 {
        scheduler.schedule_after(gate, || {});
    }
}
