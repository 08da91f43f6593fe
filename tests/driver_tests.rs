//! Integration tests for the core interpreter loop: pure values, failure
//! short-circuiting, defect capture, descriptors, environment scoping, and
//! exactly-once completion under concurrent interrupts.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rstest::rstest;

use filament::{Cause, Effect, Exit, FiberId, Runtime};

fn run<A>(effect: Effect<A, String>) -> Exit<A, String>
where
    A: Clone + Send + Sync + 'static,
{
    Runtime::inline().run(effect)
}

// =============================================================================
// Pure Interpretation
// =============================================================================

#[rstest]
fn test_pure_value_yields_done() {
    assert_eq!(run(Effect::succeed(42)), Exit::Done(42));
}

#[rstest]
fn test_failed_chain_never_invokes_continuation() {
    let invoked = Arc::new(AtomicUsize::new(0));
    let invoked2 = Arc::clone(&invoked);

    let exit = run::<i32>(Effect::fail("boom".to_string()).flat_map(move |n| {
        invoked2.fetch_add(1, Ordering::SeqCst);
        Effect::succeed(n)
    }));

    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    assert_eq!(exit, Exit::Failure(Cause::fail("boom".to_string())));
}

#[rstest]
fn test_deep_chain_does_not_overflow_the_stack() {
    let mut effect: Effect<i64, String> = Effect::succeed(0);
    for _ in 0..100_000 {
        effect = effect.flat_map(|n| Effect::succeed(n + 1));
    }
    assert_eq!(run(effect), Exit::Done(100_000));
}

#[rstest]
fn test_panic_in_user_code_becomes_defect() {
    let exit = run::<i32>(Effect::sync(|| panic!("torn invariant")));
    match exit {
        Exit::Failure(cause) => {
            assert!(cause.is_die());
            assert_eq!(cause.defects()[0].message(), "torn invariant");
        }
        Exit::Done(_) => panic!("expected a defect"),
    }
}

#[rstest]
fn test_defect_is_not_a_typed_error() {
    let handled = run::<i32>(
        Effect::sync(|| panic!("torn invariant")).catch_all(|_| Effect::succeed(0)),
    );
    assert!(handled.is_failure());
}

// =============================================================================
// Descriptor
// =============================================================================

#[rstest]
fn test_descriptor_id_is_stable_within_a_fiber() {
    let exit = run(
        Effect::<_, String>::descriptor()
            .zip(Effect::descriptor())
            .map(|(first, second)| first.id == second.id),
    );
    assert_eq!(exit, Exit::Done(true));
}

#[rstest]
fn test_descriptor_reports_interruptibility() {
    let exit = run(
        Effect::<_, String>::descriptor()
            .zip(Effect::descriptor().uninterruptible())
            .map(|(outer, inner)| (outer.interruptible, inner.interruptible)),
    );
    assert_eq!(exit, Exit::Done((true, false)));
}

#[rstest]
fn test_distinct_fibers_have_distinct_ids() {
    let exit = run(
        Effect::<_, String>::descriptor()
            .fork()
            .zip(Effect::descriptor().fork())
            .flat_map(|(left, right)| left.join().zip(right.join()))
            .map(|(left, right)| left.id != right.id),
    );
    assert_eq!(exit, Exit::Done(true));
}

// =============================================================================
// Environment
// =============================================================================

#[derive(Debug, PartialEq)]
struct Database {
    url: &'static str,
}

#[rstest]
fn test_provided_environment_is_visible() {
    let exit = run(
        Effect::<_, String>::access(|db: &Database| db.url)
            .provide(Database { url: "postgres://primary" }),
    );
    assert_eq!(exit, Exit::Done("postgres://primary"));
}

#[rstest]
fn test_environment_scope_is_restored_after_failure() {
    // The inner provision fails; the recovery running outside it must see
    // the outer environment again.
    let program: Effect<&'static str, String> = Effect::<&'static str, String>::fail("inner".to_string())
        .provide(Database { url: "postgres://replica" })
        .catch_all(|_| Effect::access(|db: &Database| db.url))
        .provide(Database { url: "postgres://primary" });

    assert_eq!(run(program), Exit::Done("postgres://primary"));
}

#[rstest]
fn test_forked_fiber_inherits_environment() {
    let exit = run(
        Effect::<_, String>::access(|db: &Database| db.url)
            .fork()
            .flat_map(|fiber| fiber.join())
            .provide(Database { url: "postgres://primary" }),
    );
    assert_eq!(exit, Exit::Done("postgres://primary"));
}

// =============================================================================
// Exactly-Once Completion
// =============================================================================

#[rstest]
fn test_completion_is_exactly_once_under_concurrent_interrupts() {
    let runtime = Runtime::global();
    let fiber = runtime.spawn::<i32, String>(
        Effect::sleep(Duration::from_millis(30)).and_then(Effect::succeed(1)),
    );

    let invocations = Arc::new(AtomicUsize::new(0));
    let exits: Arc<Mutex<Vec<Exit<i32, String>>>> = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..4 {
        let invocations = Arc::clone(&invocations);
        let exits = Arc::clone(&exits);
        fiber.on_exit(move |exit| {
            invocations.fetch_add(1, Ordering::SeqCst);
            exits.lock().push(exit);
        });
    }

    let interrupters: Vec<_> = (0..8)
        .map(|_| {
            let fiber = fiber.clone();
            std::thread::spawn(move || {
                let _ = Runtime::global().run(fiber.interrupt_as(FiberId::fresh()));
            })
        })
        .collect();
    for interrupter in interrupters {
        interrupter.join().expect("interrupter thread panicked");
    }

    // A listener registered after completion still fires, exactly once.
    let invocations2 = Arc::clone(&invocations);
    fiber.on_exit(move |_| {
        invocations2.fetch_add(1, Ordering::SeqCst);
    });

    assert_eq!(invocations.load(Ordering::SeqCst), 5);
    let observed = exits.lock();
    assert_eq!(observed.len(), 4);
    assert!(observed.windows(2).all(|pair| pair[0] == pair[1]));
}
