use corofiber::{Fiber, FiberError, State};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[test]
fn test_fiber_runs_to_term() {
    let ran = Arc::new(AtomicUsize::new(0));
    let ran_clone = ran.clone();
    let fiber = Fiber::new(move || {
        ran_clone.fetch_add(1, Ordering::SeqCst);
    });

    assert_eq!(fiber.state(), State::Init);
    fiber.swap_in();
    assert_eq!(fiber.state(), State::Term);
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn test_panicking_fiber_ends_in_except() {
    let fiber = Fiber::new(|| panic!("Intentional panic for testing"));
    fiber.swap_in();
    assert_eq!(fiber.state(), State::Except);
    assert_eq!(
        fiber.failure().as_deref(),
        Some("Intentional panic for testing")
    );
    // The caller is still running normally.
    assert_eq!(Fiber::current_id(), Fiber::get_this().id());
}

#[test]
fn test_two_holds_take_three_swaps() {
    let fiber = Fiber::new(|| {
        Fiber::yield_to_hold();
        Fiber::yield_to_hold();
    });

    fiber.swap_in();
    assert_eq!(fiber.state(), State::Hold);
    fiber.swap_in();
    assert_eq!(fiber.state(), State::Hold);
    fiber.swap_in();
    assert_eq!(fiber.state(), State::Term);

    let fourth = catch_unwind(AssertUnwindSafe(|| fiber.swap_in()));
    assert!(fourth.is_err(), "swapping in a finished fiber must panic");
    assert_eq!(
        fiber.try_swap_in(),
        Err(FiberError::NotResumable {
            id: fiber.id(),
            state: State::Term
        })
    );
}

#[test]
fn test_resume_continues_where_it_left_off() {
    let counter = Arc::new(AtomicUsize::new(0));
    let ids = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let (counter_clone, ids_clone) = (counter.clone(), ids.clone());

    let fiber = Fiber::new(move || {
        for _ in 0..5 {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            ids_clone.lock().push(Fiber::get_this().id());
            Fiber::yield_to_hold();
        }
    });

    for expected in 1..=5 {
        fiber.swap_in();
        assert_eq!(counter.load(Ordering::SeqCst), expected);
    }
    fiber.swap_in();
    assert_eq!(fiber.state(), State::Term);
    assert!(ids.lock().iter().all(|&id| id == fiber.id()));
}

#[test]
fn test_swap_out_outside_the_fiber_panics() {
    let fiber = Fiber::new(|| {});
    let result = catch_unwind(AssertUnwindSafe(|| fiber.swap_out()));
    assert!(result.is_err());
    assert_eq!(fiber.state(), State::Init);

    let main = Fiber::get_this();
    let result = catch_unwind(AssertUnwindSafe(|| main.swap_out()));
    assert!(result.is_err());
    assert_eq!(main.state(), State::Exec);
}

#[test]
fn test_yield_outside_a_fiber_panics() {
    let result = std::thread::spawn(Fiber::yield_to_ready).join();
    assert!(result.is_err());
}

#[test]
fn test_main_fiber_cannot_be_swapped_in() {
    let main = Fiber::get_this();
    assert_eq!(
        main.try_swap_in(),
        Err(FiberError::NotResumable {
            id: main.id(),
            state: State::Exec
        })
    );
}

#[test]
fn test_started_fiber_rejects_other_threads() {
    let fiber = Fiber::new(|| Fiber::yield_to_hold());
    fiber.swap_in();
    let bound = fiber.bound_thread().expect("fiber is bound after running");

    let remote = fiber.clone();
    let err = std::thread::spawn(move || remote.try_swap_in())
        .join()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, FiberError::WrongThread { bound: b, .. } if b == bound));

    // Still resumable at home.
    fiber.swap_in();
    assert_eq!(fiber.state(), State::Term);
}

#[test]
fn test_unstarted_fiber_moves_between_threads() {
    let fiber = Fiber::new(|| {});
    assert_eq!(fiber.bound_thread(), None);
    let state = std::thread::spawn(move || {
        fiber.swap_in();
        fiber.state()
    })
    .join()
    .unwrap();
    assert_eq!(state, State::Term);
}

#[test]
fn test_nested_fibers_return_to_their_resumer() {
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let inner_order = order.clone();
    let inner = Fiber::new(move || {
        inner_order.lock().push("inner 1");
        Fiber::yield_to_hold();
        inner_order.lock().push("inner 2");
    });

    let outer_order = order.clone();
    let inner_clone = inner.clone();
    let outer = Fiber::new(move || {
        outer_order.lock().push("outer 1");
        inner_clone.swap_in();
        outer_order.lock().push("outer 2");
        // The resumer of a nested fiber stays running.
        assert_eq!(Fiber::get_this().state(), State::Exec);
    });

    outer.swap_in();
    assert_eq!(outer.state(), State::Term);
    assert_eq!(inner.state(), State::Hold);

    inner.swap_in();
    assert_eq!(inner.state(), State::Term);
    assert_eq!(
        *order.lock(),
        vec!["outer 1", "inner 1", "outer 2", "inner 2"]
    );
}

#[test]
fn test_reset_rules() {
    let fiber = Fiber::new(|| Fiber::yield_to_hold());
    fiber.swap_in();
    assert_eq!(
        fiber.try_reset(|| {}),
        Err(FiberError::NotResettable {
            id: fiber.id(),
            state: State::Hold
        })
    );
    fiber.swap_in();

    let ran = Arc::new(AtomicUsize::new(0));
    let ran_clone = ran.clone();
    fiber.reset(move || {
        ran_clone.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(fiber.state(), State::Init);
    assert_eq!(fiber.bound_thread(), None);
    fiber.swap_in();
    assert_eq!(ran.load(Ordering::SeqCst), 1);

    let failed = Fiber::new(|| panic!("Boom"));
    failed.swap_in();
    failed.reset(|| {});
    assert_eq!(failed.failure(), None);
    failed.swap_in();
    assert_eq!(failed.state(), State::Term);
}

#[test]
fn test_dropping_a_held_fiber() {
    let ran = Arc::new(AtomicUsize::new(0));
    let fiber = Fiber::new(|| {
        let _guard = vec![0u8; 1024];
        Fiber::yield_to_hold();
    });
    fiber.swap_in();
    assert_eq!(fiber.state(), State::Hold);
    drop(fiber);

    // The thread keeps working normally afterwards.
    let ran_clone = ran.clone();
    let next = Fiber::new(move || {
        ran_clone.fetch_add(1, Ordering::SeqCst);
    });
    next.swap_in();
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}
