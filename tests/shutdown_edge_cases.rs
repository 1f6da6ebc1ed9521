use corofiber::{Error, Fiber, Scheduler, State};
use crossbeam::channel;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[test]
fn test_shutdown_during_task_execution() {
    let scheduler = Scheduler::new(2, false, "busy");
    scheduler.start().unwrap();
    let done = Arc::new(AtomicUsize::new(0));

    // Submit multiple tasks that take some time
    for _ in 0..10 {
        let done = done.clone();
        scheduler
            .schedule(move || {
                std::thread::sleep(Duration::from_millis(10));
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    // Stop immediately; it waits for every queued task
    let result = scheduler.stop();
    assert!(result.is_ok(), "Shutdown should succeed after tasks complete");
    assert_eq!(done.load(Ordering::SeqCst), 10);
}

#[test]
fn test_shutdown_with_no_tasks() {
    let scheduler = Scheduler::new(4, false, "empty");
    scheduler.start().unwrap();
    assert!(scheduler.stop().is_ok(), "Shutdown should succeed with no tasks");
}

#[test]
fn test_stop_before_start_with_empty_queue() {
    let scheduler = Scheduler::new(2, false, "unused");
    assert!(scheduler.stop().is_ok());
    assert!(scheduler.is_stopped());
}

#[test]
fn test_use_caller_stop_without_start() {
    let scheduler = Scheduler::new(1, true, "caller-only");
    let ran = Arc::new(AtomicUsize::new(0));
    let ran_clone = ran.clone();
    scheduler
        .schedule(move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    // The caller is a worker, so stop drains even without start.
    scheduler.stop().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn test_tasks_submitted_while_stopping_still_run() {
    let scheduler = Scheduler::new(1, false, "late");
    scheduler.start().unwrap();
    let ran = Arc::new(AtomicUsize::new(0));
    let ran_clone = ran.clone();

    scheduler
        .schedule(move || {
            std::thread::sleep(Duration::from_millis(20));
            Scheduler::current()
                .unwrap()
                .schedule(move || {
                    ran_clone.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        })
        .unwrap();

    scheduler.stop().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn test_handle_outlives_scheduler() {
    let scheduler = Scheduler::new(1, false, "gone");
    let handle = scheduler.handle();
    scheduler.start().unwrap();
    drop(scheduler);

    assert!(matches!(handle.schedule(|| {}), Err(Error::Stopped { .. })));
}

#[test]
fn test_held_fiber_does_not_block_stop() {
    let scheduler = Scheduler::new(1, false, "parked");
    scheduler.start().unwrap();

    let fiber = Fiber::new(|| Fiber::yield_to_hold());
    scheduler.schedule_fiber(fiber.clone()).unwrap();
    scheduler.stop().unwrap();

    assert_eq!(fiber.state(), State::Hold);
}

#[test]
fn test_drop_without_stop_joins_workers() {
    let done = Arc::new(AtomicUsize::new(0));
    {
        let scheduler = Scheduler::new(2, false, "dropped");
        scheduler.start().unwrap();
        for _ in 0..10 {
            let done = done.clone();
            scheduler
                .schedule(move || {
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
    }
    assert_eq!(done.load(Ordering::SeqCst), 10);
}

/// Runs `stop()` on a helper thread so a hang fails the test instead of blocking it.
fn stop_within(scheduler: Arc<Scheduler>, timeout: Duration) -> corofiber::Result<()> {
    let (tx, rx) = channel::bounded(1);
    std::thread::spawn(move || {
        let _ = tx.send(scheduler.stop());
    });
    rx.recv_timeout(timeout).expect("stop() never returned")
}

#[test]
fn test_task_pinned_to_non_worker_is_abandoned() {
    let scheduler = Arc::new(Scheduler::new(1, false, "stranded"));
    let pinned = Arc::new(AtomicUsize::new(0));
    let free = Arc::new(AtomicUsize::new(0));
    let (pinned_clone, free_clone) = (pinned.clone(), free.clone());

    scheduler
        .schedule_on(
            move || {
                pinned_clone.fetch_add(1, Ordering::SeqCst);
            },
            999_999,
        )
        .unwrap();
    scheduler
        .schedule(move || {
            free_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    scheduler.start().unwrap();

    match stop_within(scheduler, Duration::from_secs(5)) {
        Err(Error::Abandoned { count, .. }) => assert_eq!(count, 1),
        other => panic!("expected Abandoned, got {other:?}"),
    }
    assert_eq!(pinned.load(Ordering::SeqCst), 0);
    assert_eq!(free.load(Ordering::SeqCst), 1);
}

#[test]
fn test_fiber_bound_to_non_worker_is_abandoned() {
    let scheduler = Arc::new(Scheduler::new(2, false, "foreign"));

    // Started and parked here, so it is bound to this non-worker thread.
    let fiber = Fiber::new(|| Fiber::yield_to_hold());
    fiber.swap_in();
    scheduler.schedule_fiber(fiber.clone()).unwrap();
    scheduler.start().unwrap();
    assert_eq!(scheduler.pending_count(), 0);

    // Once the workers are known the same submission is refused outright.
    assert!(matches!(
        scheduler.schedule_fiber(fiber.clone()),
        Err(Error::UnknownThread { .. })
    ));

    match stop_within(scheduler, Duration::from_secs(5)) {
        Err(Error::Abandoned { count, .. }) => assert_eq!(count, 1),
        other => panic!("expected Abandoned, got {other:?}"),
    }
    assert_eq!(fiber.state(), State::Hold);
}

#[test]
fn test_use_caller_stop_without_start_drops_stranded_tasks() {
    let scheduler = Scheduler::new(1, true, "caller-stranded");
    let ran = Arc::new(AtomicUsize::new(0));
    let ran_clone = ran.clone();
    scheduler.schedule_on(|| {}, 999_999).unwrap();
    scheduler
        .schedule(move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    match scheduler.stop() {
        Err(Error::Abandoned { count, .. }) => assert_eq!(count, 1),
        other => panic!("expected Abandoned, got {other:?}"),
    }
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn test_use_caller_scheduler_dropped_on_another_thread() {
    let scheduler = Scheduler::new(2, true, "moved");
    scheduler.start().unwrap();
    scheduler.schedule(|| {}).unwrap();

    let dropped = std::thread::spawn(move || drop(scheduler)).join();
    assert!(dropped.is_ok(), "dropping away from the creating thread must not panic");
}
