//! Integration tests for cooperative interruption: interruptibility
//! regions, deferred interrupts, async cancellation, and the single-winner
//! guarantee between resumption and interruption.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rstest::rstest;

use filament::{AsyncCallback, Effect, Exit, FiberId, Runtime};

/// Spins until `condition` holds, failing the test after a few seconds.
fn eventually(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[rstest]
fn test_interrupting_a_sleeping_fiber_resumes_it_promptly() {
    let runtime = Runtime::global();
    let started = Instant::now();

    let fiber = runtime.spawn::<(), String>(Effect::sleep(Duration::from_secs(60)));
    std::thread::sleep(Duration::from_millis(10));
    let exit = runtime.run(fiber.interrupt_as(FiberId::fresh()));

    let inner = match exit {
        Exit::Done(inner) => inner,
        Exit::Failure(_) => panic!("interrupt-and-await itself must not fail"),
    };
    assert!(inner.is_interrupted());
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[rstest]
fn test_uninterruptible_region_runs_to_completion() {
    let runtime = Runtime::global();
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let log2 = Arc::clone(&log);
    let log3 = Arc::clone(&log);
    let guarded: Effect<(), String> = Effect::sync(move || log2.lock().push("begin"))
        .and_then(Effect::sleep(Duration::from_millis(50)))
        .and_then(Effect::sync(move || log3.lock().push("end")))
        .uninterruptible();

    let fiber = runtime.spawn(guarded);
    {
        let log = Arc::clone(&log);
        eventually(move || log.lock().contains(&"begin"));
    }
    let exit = runtime.run(fiber.interrupt_as(FiberId::fresh()));

    // The interrupt was deferred past the whole region, then honored.
    assert_eq!(*log.lock(), vec!["begin", "end"]);
    let inner = exit.into_result().expect("await must succeed");
    assert!(inner.is_interrupted());
}

#[rstest]
fn test_innermost_region_wins() {
    let runtime = Runtime::global();
    let started = Instant::now();

    // The sleep is interruptible again despite the enclosing region.
    let fiber = runtime.spawn::<(), String>(
        Effect::sleep(Duration::from_secs(60))
            .interruptible()
            .uninterruptible(),
    );
    std::thread::sleep(Duration::from_millis(10));
    let exit = runtime.run(fiber.interrupt_as(FiberId::fresh()));

    assert!(exit.into_result().expect("await").is_interrupted());
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[rstest]
fn test_cancellation_action_runs_when_a_parked_fiber_is_interrupted() {
    let runtime = Runtime::global();
    let cancelled = Arc::new(AtomicBool::new(false));

    let cancelled2 = Arc::clone(&cancelled);
    let fiber = runtime.spawn::<i32, String>(Effect::async_effect(move |_callback| {
        Some(Effect::sync(move || {
            cancelled2.store(true, Ordering::SeqCst);
        }))
    }));
    std::thread::sleep(Duration::from_millis(10));
    let exit = runtime.run(fiber.interrupt_as(FiberId::fresh()));

    assert!(exit.into_result().expect("await").is_interrupted());
    let cancelled = Arc::clone(&cancelled);
    eventually(move || cancelled.load(Ordering::SeqCst));
}

#[rstest]
fn test_cancellation_returned_after_the_interrupt_still_runs() {
    let runtime = Runtime::global();
    let registering = Arc::new(AtomicBool::new(false));
    let gate = Arc::new(AtomicBool::new(false));
    let cancelled = Arc::new(AtomicBool::new(false));

    // The registration stalls past the interrupt, so its cancellation is
    // handed back only after the parked driver is already gone.
    let registering2 = Arc::clone(&registering);
    let gate2 = Arc::clone(&gate);
    let cancelled2 = Arc::clone(&cancelled);
    let fiber = runtime.spawn::<(), String>(Effect::async_effect(move |_callback| {
        registering2.store(true, Ordering::SeqCst);
        while !gate2.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(2));
        }
        let cancelled2 = Arc::clone(&cancelled2);
        Some(Effect::sync(move || cancelled2.store(true, Ordering::SeqCst)))
    }));
    {
        let registering = Arc::clone(&registering);
        eventually(move || registering.load(Ordering::SeqCst));
    }

    let exit = runtime.run(fiber.interrupt_as(FiberId::fresh()));
    assert!(exit.into_result().expect("await").is_interrupted());

    gate.store(true, Ordering::SeqCst);
    eventually(move || cancelled.load(Ordering::SeqCst));
}

#[rstest]
fn test_late_resumption_loses_against_interrupt() {
    let runtime = Runtime::global();
    let captured: Arc<Mutex<Option<AsyncCallback<i32, String>>>> = Arc::new(Mutex::new(None));

    let captured2 = Arc::clone(&captured);
    let fiber = runtime.spawn::<i32, String>(Effect::async_effect(move |callback| {
        *captured2.lock() = Some(callback);
        None
    }));
    {
        let captured = Arc::clone(&captured);
        eventually(move || captured.lock().is_some());
    }

    let exit = runtime.run(fiber.interrupt_as(FiberId::fresh()));
    assert!(exit.into_result().expect("await").is_interrupted());

    // The stale callback must not resurrect the fiber.
    captured.lock().take().expect("captured above").succeed(99);
    let after = runtime.run(fiber.await_exit());
    assert!(after.into_result().expect("await").is_interrupted());
}

#[rstest]
fn test_interrupting_a_fiber_aborts_its_future() {
    let runtime = Runtime::global();
    let completed = Arc::new(AtomicBool::new(false));

    let completed2 = Arc::clone(&completed);
    let fiber = runtime.spawn::<(), String>(Effect::from_future(async move {
        tokio::time::sleep(Duration::from_millis(80)).await;
        completed2.store(true, Ordering::SeqCst);
        Ok(())
    }));
    std::thread::sleep(Duration::from_millis(10));

    let exit = runtime.run(fiber.interrupt_as(FiberId::fresh()));
    assert!(exit.into_result().expect("await").is_interrupted());

    // The aborted future never reaches its tail.
    std::thread::sleep(Duration::from_millis(150));
    assert!(!completed.load(Ordering::SeqCst));
}

#[rstest]
fn test_interrupt_records_the_interrupting_fiber() {
    let runtime = Runtime::global();
    let by = FiberId::fresh();

    let fiber = runtime.spawn::<(), String>(Effect::sleep(Duration::from_secs(60)));
    std::thread::sleep(Duration::from_millis(10));
    let exit = runtime.run(fiber.interrupt_as(by));

    match exit.into_result().expect("await") {
        Exit::Failure(cause) => assert!(cause.interruptors().contains(&by)),
        Exit::Done(()) => panic!("expected interruption"),
    }
}

#[rstest]
fn test_run_exit_does_not_mask_interruption_of_interruptible_code() {
    let runtime = Runtime::global();

    // run_exit would love to materialize the failure, but an interrupt of
    // interruptible code keeps unwinding so the fiber actually stops.
    let fiber = runtime.spawn::<Exit<(), String>, String>(
        Effect::sleep(Duration::from_secs(60)).run_exit(),
    );
    std::thread::sleep(Duration::from_millis(10));
    let exit = runtime.run(fiber.interrupt_as(FiberId::fresh()));

    assert!(exit.into_result().expect("await").is_interrupted());
}
