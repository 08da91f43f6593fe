//! The user-facing effect type.
//!
//! An [`Effect`] is an immutable description of a computation producing a
//! value of type `A` or failing with an error of type `E`. Building one
//! runs nothing; the description is interpreted when handed to a
//! [`Runtime`](crate::Runtime), and a single description can be run any
//! number of times.
//!
//! Failures travel as a [`Cause`], which distinguishes typed errors
//! (`fail`), defects such as panics (`die`), and interruption, and records
//! how multiple failures combined. The typed error channel is only the
//! `Fail` slice of that algebra; `fold_cause` and friends expose the rest.
//!
//! # Examples
//!
//! ```
//! use filament::{Effect, Runtime};
//!
//! let program: Effect<i32, String> = Effect::succeed(6)
//!     .map(|n| n * 7)
//!     .flat_map(|n| {
//!         if n == 42 {
//!             Effect::succeed(n)
//!         } else {
//!             Effect::fail("arithmetic is broken".to_string())
//!         }
//!     });
//!
//! let exit = Runtime::inline().run(program);
//! assert_eq!(exit.into_result(), Ok(42));
//! ```

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use static_assertions::assert_impl_all;

use crate::cause::{Cause, Defect, FiberId};
use crate::driver::{FiberDescriptor, ResumeHandle, RuntimeFiber};
use crate::exit::Exit;
use crate::fiber::Fiber;
use crate::instruction::{Instr, box_value, take_value};
use crate::runtime::tokio_handle;

/// A lazy, composable description of a computation.
///
/// `A` is the success type, `E` the typed error. Both must be `Send +
/// Sync + 'static`; `E` must additionally be `Clone` because a single
/// cause can be reported to several observers. `A: Clone` is only
/// required where a result is extracted through a shared handle, such as
/// [`Fiber::join`] or [`Effect::bracket`].
#[must_use = "effects describe computations and do nothing until run"]
pub struct Effect<A, E> {
    pub(crate) instr: Instr<E>,
    _value: PhantomData<fn() -> A>,
}

impl<A, E> std::fmt::Debug for Effect<A, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Effect").finish_non_exhaustive()
    }
}

impl<A, E> Effect<A, E>
where
    A: Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub(crate) fn from_instr(instr: Instr<E>) -> Self {
        Self {
            instr,
            _value: PhantomData,
        }
    }

    pub(crate) fn into_instr(self) -> Instr<E> {
        self.instr
    }

    // =========================================================================
    // Constructors
    // =========================================================================

    /// An effect that immediately succeeds with `value`.
    pub fn succeed(value: A) -> Self {
        Self::from_instr(Instr::Pure(box_value(value)))
    }

    /// An effect that immediately fails with the typed error `error`.
    pub fn fail(error: E) -> Self {
        Self::from_instr(Instr::Fail(Cause::fail(error)))
    }

    /// An effect that immediately fails with the given full cause.
    pub fn fail_cause(cause: Cause<E>) -> Self {
        Self::from_instr(Instr::Fail(cause))
    }

    /// An effect that dies with an unrecoverable defect.
    ///
    /// Defects bypass the typed error channel; only cause-level operators
    /// such as [`catch_all_cause`](Self::catch_all_cause) can observe them.
    pub fn die(defect: Defect) -> Self {
        Self::from_instr(Instr::Fail(Cause::die(defect)))
    }

    /// Suspends a side-effecting computation.
    ///
    /// `f` runs when the effect is interpreted, once per run. A panic in
    /// `f` is caught and becomes a defect.
    pub fn sync(f: impl FnOnce() -> A + Send + 'static) -> Self {
        Self::from_instr(Instr::Map(
            Box::new(Instr::Pure(box_value(()))),
            Box::new(move |_| box_value(f())),
        ))
    }

    /// Lifts a `Result` into an effect, succeeding or failing accordingly.
    pub fn from_result(result: Result<A, E>) -> Self {
        match result {
            Ok(value) => Self::succeed(value),
            Err(error) => Self::fail(error),
        }
    }

    /// An effect that never completes.
    ///
    /// It can still be interrupted, which is its only way to end.
    pub fn never() -> Self {
        Self::async_effect(|_| None)
    }

    /// Bridges a callback-based asynchronous operation into an effect.
    ///
    /// `register` receives an [`AsyncCallback`]; the first invocation of
    /// the callback resumes the fiber and every later one is ignored. The
    /// returned effect, if any, is the cancellation action: it runs,
    /// uninterruptibly and on its own fiber, when the suspended fiber is
    /// interrupted before being resumed.
    ///
    /// The callback may be invoked from any thread, including
    /// synchronously from within `register` itself.
    pub fn async_effect<F>(register: F) -> Self
    where
        F: FnOnce(AsyncCallback<A, E>) -> Option<Effect<(), E>> + Send + 'static,
    {
        Self::from_instr(Instr::Async(Box::new(move |handle| {
            let callback = AsyncCallback {
                handle,
                _value: PhantomData,
            };
            register(callback).map(Effect::into_instr)
        })))
    }

    /// Runs a `Send` future to completion on the timer runtime, resuming
    /// the fiber with its result.
    ///
    /// Interrupting the fiber aborts the future.
    pub fn from_future<Fut>(future: Fut) -> Self
    where
        Fut: Future<Output = Result<A, E>> + Send + 'static,
    {
        Self::async_effect(move |callback| {
            let task = tokio_handle().spawn(async move {
                match future.await {
                    Ok(value) => callback.succeed(value),
                    Err(error) => callback.fail(error),
                }
            });
            Some(Effect::sync(move || task.abort()))
        })
    }

    // =========================================================================
    // Sequencing
    // =========================================================================

    /// Transforms the success value.
    pub fn map<B>(self, f: impl FnOnce(A) -> B + Send + 'static) -> Effect<B, E>
    where
        B: Send + Sync + 'static,
    {
        Effect::from_instr(Instr::Map(
            Box::new(self.instr),
            Box::new(move |value| box_value(f(take_value::<A>(value)))),
        ))
    }

    /// Sequences a dependent effect after this one.
    ///
    /// The continuation only runs on success; failures short-circuit past
    /// it unchanged.
    pub fn flat_map<B>(self, f: impl FnOnce(A) -> Effect<B, E> + Send + 'static) -> Effect<B, E>
    where
        B: Send + Sync + 'static,
    {
        Effect::from_instr(Instr::Chain(
            Box::new(self.instr),
            Box::new(move |value| f(take_value::<A>(value)).instr),
        ))
    }

    /// Sequences an independent effect after this one, discarding this
    /// one's result.
    pub fn and_then<B>(self, that: Effect<B, E>) -> Effect<B, E>
    where
        B: Send + Sync + 'static,
    {
        self.flat_map(move |_| that)
    }

    /// Pairs this effect's result with `that`'s, in order.
    pub fn zip<B>(self, that: Effect<B, E>) -> Effect<(A, B), E>
    where
        B: Send + Sync + 'static,
    {
        self.zip_with(that, |a, b| (a, b))
    }

    /// Sequences `that` after this effect and combines both results.
    pub fn zip_with<B, C>(
        self,
        that: Effect<B, E>,
        f: impl FnOnce(A, B) -> C + Send + 'static,
    ) -> Effect<C, E>
    where
        B: Send + Sync + 'static,
        C: Send + Sync + 'static,
    {
        self.flat_map(move |a| that.map(move |b| f(a, b)))
    }

    // =========================================================================
    // Failure Handling
    // =========================================================================

    /// The fundamental failure eliminator: continues with `on_success` on
    /// success and with `on_failure` on any failure cause.
    ///
    /// Interruption is the exception: while the fiber is interruptible, an
    /// interrupt cause passes the fold by, so that only uninterruptible
    /// code (finalizers, brackets) can observe it.
    pub fn fold_cause<B>(
        self,
        on_failure: impl FnOnce(Cause<E>) -> Effect<B, E> + Send + 'static,
        on_success: impl FnOnce(A) -> Effect<B, E> + Send + 'static,
    ) -> Effect<B, E>
    where
        B: Send + Sync + 'static,
    {
        Effect::from_instr(Instr::Collapse(
            Box::new(self.instr),
            Box::new(move |cause| on_failure(cause).instr),
            Box::new(move |value| on_success(take_value::<A>(value)).instr),
        ))
    }

    /// Folds the typed error and the success value into a common result.
    ///
    /// Defects and interruption are not typed errors and keep propagating.
    pub fn fold<B>(
        self,
        on_failure: impl FnOnce(E) -> B + Send + 'static,
        on_success: impl FnOnce(A) -> B + Send + 'static,
    ) -> Effect<B, E>
    where
        B: Send + Sync + 'static,
    {
        self.fold_cause(
            move |cause| match cause.failure_or_cause() {
                Ok(error) => Effect::succeed(on_failure(error)),
                Err(cause) => Effect::fail_cause(cause),
            },
            move |value| Effect::succeed(on_success(value)),
        )
    }

    /// Recovers from a typed error with a new effect.
    ///
    /// # Examples
    ///
    /// ```
    /// use filament::{Effect, Runtime};
    ///
    /// let program: Effect<i32, String> = Effect::fail("nope".to_string())
    ///     .catch_all(|error| Effect::succeed(error.len() as i32));
    ///
    /// assert_eq!(Runtime::inline().run(program).into_result(), Ok(4));
    /// ```
    pub fn catch_all(self, handler: impl FnOnce(E) -> Effect<A, E> + Send + 'static) -> Self {
        self.fold_cause(
            move |cause| match cause.failure_or_cause() {
                Ok(error) => handler(error),
                Err(cause) => Effect::fail_cause(cause),
            },
            Effect::succeed,
        )
    }

    /// Recovers from any failure cause, defects included.
    pub fn catch_all_cause(
        self,
        handler: impl FnOnce(Cause<E>) -> Effect<A, E> + Send + 'static,
    ) -> Self {
        self.fold_cause(handler, Effect::succeed)
    }

    /// Transforms every typed error in the cause, leaving its shape,
    /// defects, and interruptions untouched.
    pub fn map_error(self, f: impl FnMut(E) -> E + Send + 'static) -> Self {
        self.catch_all_cause(move |cause| Effect::fail_cause(cause.map(f)))
    }

    /// Materializes this effect's outcome as an [`Exit`] value, making
    /// the effect itself unfailable.
    ///
    /// Interruption of an interruptible fiber is not materialized; it
    /// keeps unwinding so the fiber can actually stop.
    pub fn run_exit(self) -> Effect<Exit<A, E>, E> {
        self.fold_cause(
            |cause| Effect::succeed(Exit::Failure(cause)),
            |value| Effect::succeed(Exit::Done(value)),
        )
    }

    // =========================================================================
    // Interruptibility
    // =========================================================================

    /// Marks this effect as an interruptible region.
    pub fn interruptible(self) -> Self {
        self.with_interruptible(true)
    }

    /// Marks this effect as a non-interruptible region.
    ///
    /// Interrupt requests arriving while the region runs are deferred to
    /// its end, never lost.
    pub fn uninterruptible(self) -> Self {
        self.with_interruptible(false)
    }

    /// Sets the interruptible status of this effect explicitly. The
    /// innermost enclosing region wins; the status is restored when the
    /// region ends, on success and failure alike.
    pub fn with_interruptible(self, interruptible: bool) -> Self {
        Self::from_instr(Instr::InterruptibleRegion(
            interruptible,
            Box::new(self.instr),
        ))
    }

    // =========================================================================
    // Environment
    // =========================================================================

    /// Supplies a context value visible to every `environment` access in
    /// this effect, shadowing any outer provision for its duration.
    pub fn provide<Ctx: Send + Sync + 'static>(self, context: Ctx) -> Self {
        Self::from_instr(Instr::ProvideEnv(Arc::new(context), Box::new(self.instr)))
    }

    /// Reads the context and projects this effect's value out of it.
    pub fn access<Ctx>(f: impl FnOnce(&Ctx) -> A + Send + 'static) -> Self
    where
        Ctx: Send + Sync + 'static,
    {
        Effect::environment().map(move |context: Arc<Ctx>| f(&context))
    }

    // =========================================================================
    // Concurrency
    // =========================================================================

    /// Starts this effect on a new supervised fiber and immediately
    /// succeeds with its handle.
    ///
    /// The child inherits the parent's environment. If it is still running
    /// when the parent completes, it is interrupted, and any failure it
    /// did not get a chance to report is folded into the parent's exit.
    pub fn fork(self) -> Effect<Fiber<A, E>, E>
    where
        A: Clone,
    {
        self.fork_inner(None)
    }

    /// Like [`fork`](Self::fork), tagging the fiber with a diagnostic name.
    pub fn fork_named(self, name: impl Into<String>) -> Effect<Fiber<A, E>, E>
    where
        A: Clone,
    {
        self.fork_inner(Some(name.into()))
    }

    fn fork_inner(self, name: Option<String>) -> Effect<Fiber<A, E>, E>
    where
        A: Clone,
    {
        Effect::from_instr(Instr::Map(
            Box::new(Instr::Supervised(Box::new(self.instr), name)),
            Box::new(|value| {
                let fiber = take_value::<RuntimeFiber<E>>(value);
                box_value(Fiber::<A, E>::new(fiber.shared))
            }),
        ))
    }

    /// Runs this effect and `that` on two fibers in parallel.
    ///
    /// Succeeds with both values once both succeed. The first failure
    /// interrupts the other side, and the combined cause carries both
    /// fibers' failures side by side; interrupts injected by the loser's
    /// shutdown are not reported as failures.
    pub fn zip_par<B>(self, that: Effect<B, E>) -> Effect<(A, B), E>
    where
        A: Clone,
        B: Clone + Send + Sync + 'static,
    {
        Effect::descriptor().flat_map(move |descriptor| {
            self.fork().zip(that.fork()).flat_map(move |(left, right)| {
                both_exits(&left, &right, descriptor.id).flat_map(move |(left_exit, right_exit)| {
                    match (left_exit, right_exit) {
                        (Exit::Done(a), Exit::Done(b)) => Effect::succeed((a, b)),
                        (left_exit, right_exit) => {
                            let keep = |cause: Cause<E>| {
                                if cause.is_interrupted_only_by(descriptor.id) {
                                    Cause::Empty
                                } else {
                                    cause
                                }
                            };
                            let combined = Cause::both(
                                keep(left_exit.into_cause()),
                                keep(right_exit.into_cause()),
                            );
                            let combined = if combined.is_empty() {
                                Cause::interrupt(descriptor.id)
                            } else {
                                combined
                            };
                            Effect::fail_cause(combined)
                        }
                    }
                })
            })
        })
    }
}

impl<E> Effect<FiberDescriptor, E>
where
    E: Clone + Send + Sync + 'static,
{
    /// The [`FiberDescriptor`] of the fiber interpreting this effect.
    pub fn descriptor() -> Self {
        Self::from_instr(Instr::Descriptor(Box::new(|descriptor| {
            Instr::Pure(box_value(descriptor))
        })))
    }
}

impl<Ctx, E> Effect<Arc<Ctx>, E>
where
    Ctx: Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Reads the innermost provided context of type `Ctx`.
    ///
    /// Dies with a defect when nothing has been provided or the provided
    /// context has a different type; that is a wiring bug, not a
    /// recoverable error.
    pub fn environment() -> Self {
        Self::from_instr(Instr::AccessEnv(Box::new(|environment| {
            match environment.downcast::<Ctx>() {
                Ok(context) => Instr::Pure(box_value(context)),
                Err(_) => Instr::Fail(Cause::die(Defect::new(
                    "the provided environment has an unexpected type",
                ))),
            }
        })))
    }
}

/// Awaits two fibers at once, interrupting the other side as soon as one
/// of them fails.
fn both_exits<A, B, E>(
    left: &Fiber<A, E>,
    right: &Fiber<B, E>,
    interrupter: FiberId,
) -> Effect<(Exit<A, E>, Exit<B, E>), E>
where
    A: Clone + Send + Sync + 'static,
    B: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    let left = left.clone();
    let right = right.clone();
    Effect::async_effect(move |callback| {
        let slots: Arc<Mutex<(Option<Exit<A, E>>, Option<Exit<B, E>>)>> =
            Arc::new(Mutex::new((None, None)));
        let callback = Arc::new(Mutex::new(Some(callback)));

        let fire = move |slots: &Arc<Mutex<(Option<Exit<A, E>>, Option<Exit<B, E>>)>>,
                         callback: &Arc<Mutex<Option<AsyncCallback<(Exit<A, E>, Exit<B, E>), E>>>>| {
            let ready = {
                let mut guard = slots.lock();
                if guard.0.is_some() && guard.1.is_some() {
                    guard.0.take().zip(guard.1.take())
                } else {
                    None
                }
            };
            if let Some(exits) = ready {
                if let Some(callback) = callback.lock().take() {
                    callback.succeed(exits);
                }
            }
        };

        {
            let slots = Arc::clone(&slots);
            let callback = Arc::clone(&callback);
            let other = right.clone();
            let fire = fire.clone();
            left.on_exit(move |exit| {
                if exit.is_failure() {
                    other.interrupt_now(interrupter);
                }
                slots.lock().0 = Some(exit);
                fire(&slots, &callback);
            });
        }
        {
            let slots = Arc::clone(&slots);
            let callback = Arc::clone(&callback);
            let other = left.clone();
            right.on_exit(move |exit| {
                if exit.is_failure() {
                    other.interrupt_now(interrupter);
                }
                slots.lock().1 = Some(exit);
                fire(&slots, &callback);
            });
        }
        None
    })
}

impl<A, E> Effect<A, E>
where
    A: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    // =========================================================================
    // Resource Safety
    // =========================================================================

    /// Acquire, use, release.
    ///
    /// Acquisition and release run uninterruptibly; the use step restores
    /// the interruptibility the caller had. Once acquisition succeeds,
    /// `release` is guaranteed to run exactly once with the resource and
    /// the use step's [`Exit`], whether that step succeeded, failed, or
    /// was interrupted. A release failure after a successful use becomes
    /// the bracket's failure; after a failed use it is sequenced into the
    /// existing cause so neither is lost.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::{Arc, Mutex};
    /// use filament::{Effect, Runtime};
    ///
    /// let log = Arc::new(Mutex::new(Vec::new()));
    /// let log2 = Arc::clone(&log);
    ///
    /// let program: Effect<(), String> = Effect::succeed("resource").bracket(
    ///     |_| Effect::fail("use blew up".to_string()),
    ///     move |_, _| Effect::sync(move || log2.lock().unwrap().push("released")),
    /// );
    ///
    /// let exit = Runtime::inline().run(program);
    /// assert!(exit.is_failure());
    /// assert_eq!(*log.lock().unwrap(), vec!["released"]);
    /// ```
    pub fn bracket<B, Use, Release>(self, use_fn: Use, release: Release) -> Effect<B, E>
    where
        B: Send + Sync + 'static,
        Use: FnOnce(A) -> Effect<B, E> + Send + 'static,
        Release: FnOnce(A, &Exit<B, E>) -> Effect<(), E> + Send + 'static,
    {
        // The descriptor is read at the caller's region so the use step can
        // restore the caller's interruptibility; only the
        // acquire-use-release chain itself is protected.
        Effect::descriptor().flat_map(move |descriptor| {
            self.flat_map(move |resource| {
                let for_release = resource.clone();
                use_fn(resource)
                    .with_interruptible(descriptor.interruptible)
                    .run_exit()
                    .flat_map(move |use_exit| {
                        release(for_release, &use_exit).run_exit().flat_map(
                            move |release_exit| match (use_exit, release_exit) {
                                (Exit::Done(value), Exit::Done(())) => Effect::succeed(value),
                                (Exit::Done(_), Exit::Failure(release_cause)) => {
                                    Effect::fail_cause(release_cause)
                                }
                                (Exit::Failure(use_cause), release_exit) => Effect::fail_cause(
                                    Cause::then(use_cause, release_exit.into_cause()),
                                ),
                            },
                        )
                    })
            })
            .uninterruptible()
        })
    }

    /// Attaches a finalizer that runs whatever way this effect ends.
    ///
    /// A finalizer failure is folded into the outcome like a bracket
    /// release failure.
    pub fn ensuring(self, finalizer: Effect<(), E>) -> Self {
        Effect::succeed(()).bracket(move |()| self, move |(), _| finalizer)
    }
}

impl<E> Effect<(), E>
where
    E: Clone + Send + Sync + 'static,
{
    /// An effect that succeeds with the unit value.
    pub fn unit() -> Self {
        Self::succeed(())
    }

    /// Suspends the fiber for at least `duration` on the timer runtime.
    ///
    /// Interrupting the fiber cancels the timer immediately.
    pub fn sleep(duration: Duration) -> Self {
        Self::async_effect(move |callback| {
            let task = tokio_handle().spawn(async move {
                tokio::time::sleep(duration).await;
                callback.succeed(());
            });
            Some(Effect::sync(move || task.abort()))
        })
    }
}

// =============================================================================
// Async Callback
// =============================================================================

/// The resumption half of [`Effect::async_effect`].
///
/// Cloneable so a registration can wire it into several completion paths;
/// whichever clone fires first wins and the rest are ignored.
pub struct AsyncCallback<A, E> {
    handle: ResumeHandle<E>,
    _value: PhantomData<fn(A)>,
}

impl<A, E> Clone for AsyncCallback<A, E> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            _value: PhantomData,
        }
    }
}

impl<A, E> std::fmt::Debug for AsyncCallback<A, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncCallback").finish_non_exhaustive()
    }
}

impl<A, E> AsyncCallback<A, E>
where
    A: Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Resumes the fiber with a success value.
    pub fn succeed(self, value: A) {
        self.handle.resume(Exit::Done(box_value(value)));
    }

    /// Resumes the fiber with a typed error.
    pub fn fail(self, error: E) {
        self.handle.resume(Exit::Failure(Cause::fail(error)));
    }

    /// Resumes the fiber with a full failure cause.
    pub fn fail_cause(self, cause: Cause<E>) {
        self.handle.resume(Exit::Failure(cause));
    }

    /// Resumes the fiber with a complete exit.
    pub fn resume(self, exit: Exit<A, E>) {
        match exit {
            Exit::Done(value) => self.succeed(value),
            Exit::Failure(cause) => self.handle.resume(Exit::Failure(cause)),
        }
    }
}

assert_impl_all!(Effect<i32, String>: Send);
assert_impl_all!(AsyncCallback<i32, String>: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn run<A, E>(effect: Effect<A, E>) -> Exit<A, E>
    where
        A: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        Runtime::inline().run(effect)
    }

    // =========================================================================
    // Construction and Sequencing
    // =========================================================================

    #[rstest]
    fn test_succeed_map_flat_map() {
        let exit = run::<i32, String>(
            Effect::succeed(5)
                .map(|n| n + 1)
                .flat_map(|n| Effect::succeed(n * 10)),
        );
        assert_eq!(exit.into_result(), Ok(60));
    }

    #[rstest]
    fn test_sync_is_lazy() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = Arc::clone(&counter);
        let effect: Effect<usize, String> =
            Effect::sync(move || counter2.fetch_add(1, Ordering::SeqCst));

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        let exit = run(effect);
        assert_eq!(exit.into_result(), Ok(0));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    fn test_failure_short_circuits() {
        let touched = Arc::new(AtomicUsize::new(0));
        let touched2 = Arc::clone(&touched);
        let exit = run::<i32, String>(Effect::fail("boom".to_string()).flat_map(move |n| {
            touched2.fetch_add(1, Ordering::SeqCst);
            Effect::succeed(n)
        }));

        assert_eq!(exit.into_result(), Err(Cause::fail("boom".to_string())));
        assert_eq!(touched.load(Ordering::SeqCst), 0);
    }

    #[rstest]
    fn test_zip_sequences_in_order() {
        let exit = run::<(i32, &str), String>(
            Effect::succeed(1).zip(Effect::succeed("two")),
        );
        assert_eq!(exit.into_result(), Ok((1, "two")));
    }

    #[rstest]
    fn test_panic_becomes_defect() {
        let exit = run::<i32, String>(Effect::sync(|| panic!("broken invariant")));
        match exit {
            Exit::Failure(cause) => {
                assert_eq!(cause.defects()[0].message(), "broken invariant");
            }
            Exit::Done(_) => panic!("expected a defect"),
        }
    }

    // =========================================================================
    // Failure Handling
    // =========================================================================

    #[rstest]
    fn test_catch_all_recovers_typed_errors() {
        let exit = run::<i32, String>(
            Effect::fail("4 chars".to_string()).catch_all(|error| Effect::succeed(error.len() as i32)),
        );
        assert_eq!(exit.into_result(), Ok(7));
    }

    #[rstest]
    fn test_catch_all_does_not_recover_defects() {
        let exit = run::<i32, String>(
            Effect::die(Defect::new("fatal")).catch_all(|_| Effect::succeed(0)),
        );
        assert!(exit.is_failure());
    }

    #[rstest]
    fn test_fold_covers_both_channels() {
        let failed = run::<&str, String>(
            Effect::<i32, String>::fail("e".to_string()).fold(|_| "failed", |_| "succeeded"),
        );
        let succeeded = run::<&str, String>(
            Effect::succeed("x").fold(|_| "failed", |_| "succeeded"),
        );
        assert_eq!(failed.into_result(), Ok("failed"));
        assert_eq!(succeeded.into_result(), Ok("succeeded"));
    }

    #[rstest]
    fn test_map_error_transforms_every_failure() {
        let exit = run::<i32, String>(
            Effect::fail("boom".to_string()).map_error(|error| format!("wrapped: {error}")),
        );
        assert_eq!(
            exit.into_result(),
            Err(Cause::fail("wrapped: boom".to_string())),
        );
    }

    #[rstest]
    fn test_run_exit_materializes_failure() {
        let exit = run::<Exit<i32, String>, String>(
            Effect::fail("boom".to_string()).run_exit(),
        );
        match exit {
            Exit::Done(inner) => {
                assert_eq!(inner, Exit::Failure(Cause::fail("boom".to_string())));
            }
            Exit::Failure(_) => panic!("run_exit should not fail"),
        }
    }

    // =========================================================================
    // Environment
    // =========================================================================

    #[derive(Debug, PartialEq)]
    struct Config {
        limit: usize,
    }

    #[rstest]
    fn test_environment_round_trip() {
        let exit = run::<usize, String>(
            Effect::access(|config: &Config| config.limit).provide(Config { limit: 8 }),
        );
        assert_eq!(exit.into_result(), Ok(8));
    }

    #[rstest]
    fn test_inner_provision_shadows_outer() {
        let program: Effect<usize, String> = Effect::access(|config: &Config| config.limit)
            .provide(Config { limit: 2 })
            .zip(Effect::access(|config: &Config| config.limit))
            .map(|(inner, outer)| inner * 100 + outer)
            .provide(Config { limit: 1 });
        assert_eq!(run(program).into_result(), Ok(201));
    }

    #[rstest]
    fn test_missing_environment_is_defect() {
        let exit = run::<usize, String>(Effect::access(|config: &Config| config.limit));
        match exit {
            Exit::Failure(cause) => assert!(!cause.defects().is_empty()),
            Exit::Done(_) => panic!("expected a defect"),
        }
    }

    // =========================================================================
    // Async Bridge
    // =========================================================================

    #[rstest]
    fn test_async_effect_synchronous_resume() {
        let exit = run::<i32, String>(Effect::async_effect(|callback| {
            callback.succeed(99);
            None
        }));
        assert_eq!(exit.into_result(), Ok(99));
    }

    #[rstest]
    fn test_async_effect_second_resume_loses() {
        let exit = run::<i32, String>(Effect::async_effect(|callback| {
            let duplicate = callback.clone();
            callback.succeed(1);
            duplicate.succeed(2);
            None
        }));
        assert_eq!(exit.into_result(), Ok(1));
    }

    #[rstest]
    fn test_from_future_success() {
        let exit = run::<i32, String>(Effect::from_future(async { Ok(41 + 1) }));
        assert_eq!(exit.into_result(), Ok(42));
    }

    #[rstest]
    fn test_from_future_failure() {
        let exit = run::<i32, String>(Effect::from_future(async { Err("offline".to_string()) }));
        assert_eq!(exit.into_result(), Err(Cause::fail("offline".to_string())));
    }

    #[rstest]
    fn test_from_result() {
        assert_eq!(
            run::<i32, String>(Effect::from_result(Ok(3))).into_result(),
            Ok(3),
        );
        assert_eq!(
            run::<i32, String>(Effect::from_result(Err("no".to_string()))).into_result(),
            Err(Cause::fail("no".to_string())),
        );
    }
}
