use corofiber::{Fiber, Scheduler, logging, thread};
use log::info;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

fn run_in_fiber() {
    info!("run_in_fiber begin");
    Fiber::yield_to_hold();
    info!("run_in_fiber end");
    Fiber::yield_to_hold();
}

/// Reschedules itself on its own worker thread until the countdown runs out.
fn countdown(remaining: Arc<AtomicUsize>) {
    info!("countdown at {}", remaining.load(Ordering::SeqCst));
    std::thread::sleep(Duration::from_millis(100));
    if remaining.fetch_sub(1, Ordering::SeqCst) > 0 {
        if let Some(scheduler) = Scheduler::current() {
            let next = remaining.clone();
            scheduler
                .schedule_on(move || countdown(next), thread::current_thread_id())
                .expect("scheduler rejected the countdown");
        }
    }
}

fn main() {
    if let Err(err) = logging::init_from_env() {
        eprintln!("logger already installed: {err}");
    }
    thread::set_current_thread_name("main");

    // Example 1: Driving a fiber by hand
    info!("main begin");
    Fiber::get_this();
    let fiber = Fiber::new(run_in_fiber);
    fiber.swap_in();
    info!("main after first swap_in, fiber state {:?}", fiber.state());
    fiber.swap_in();
    info!("main after second swap_in, fiber state {:?}", fiber.state());
    fiber.swap_in();
    info!("main after third swap_in, fiber state {:?}", fiber.state());

    // Example 2: A task that keeps rescheduling itself
    let scheduler = Scheduler::new(1, false, "test");
    scheduler.start().expect("failed to start scheduler");
    let remaining = Arc::new(AtomicUsize::new(5));
    scheduler
        .schedule(move || countdown(remaining))
        .expect("scheduler rejected task");
    scheduler.stop().expect("Shutdown failed");

    // Example 3: Throughput across a pool
    let num_threads = 4;
    let scheduler = Scheduler::new(num_threads, true, "pool");
    scheduler.start().expect("failed to start scheduler");

    let num_tasks = 10_000;
    let done = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    for _ in 0..num_tasks {
        let done = done.clone();
        scheduler
            .schedule(move || {
                done.fetch_add(1, Ordering::Relaxed);
            })
            .expect("scheduler rejected task");
    }
    scheduler.stop().expect("Shutdown failed");

    let duration = start.elapsed();
    info!(
        "executed {} tasks in {:?} ({:.2} tasks/second)",
        done.load(Ordering::Relaxed),
        duration,
        num_tasks as f64 / duration.as_secs_f64()
    );
    info!("live fibers at exit: {}", Fiber::total_fibers());
}
