//! Typed handles to running fibers.
//!
//! A [`Fiber`] is what [`Effect::fork`](crate::Effect::fork) returns: a
//! cheaply cloneable reference to a child fiber through which the parent
//! (or anyone holding a clone) can await, poll, or interrupt it. Dropping
//! every handle does not stop the fiber; it keeps running under its
//! parent's supervision.

use std::marker::PhantomData;
use std::sync::Arc;

use static_assertions::assert_impl_all;

use crate::cause::{Cause, Defect, FiberId};
use crate::driver::Shared;
use crate::effect::Effect;
use crate::exit::Exit;
use crate::instruction::Value;

/// A handle to a fiber producing `A` or failing with `E`.
///
/// # Examples
///
/// ```
/// use filament::{Effect, Runtime};
///
/// let runtime = Runtime::inline();
/// let exit = runtime.run::<i32, String>(
///     Effect::succeed(20)
///         .fork()
///         .flat_map(|fiber| fiber.join().map(|n| n * 2)),
/// );
/// assert_eq!(exit.into_result(), Ok(40));
/// ```
pub struct Fiber<A, E> {
    shared: Arc<Shared<E>>,
    _value: PhantomData<fn() -> A>,
}

impl<A, E> Clone for Fiber<A, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            _value: PhantomData,
        }
    }
}

impl<A, E> std::fmt::Debug for Fiber<A, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber").field("id", &self.id()).finish()
    }
}

impl<A, E> Fiber<A, E> {
    /// The fiber's unique id.
    pub fn id(&self) -> FiberId {
        self.shared.id()
    }

    /// The diagnostic name given at fork time, if any.
    pub fn name(&self) -> Option<String> {
        self.shared.name().map(str::to_owned)
    }
}

impl<A, E> Fiber<A, E>
where
    A: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(shared: Arc<Shared<E>>) -> Self {
        Self {
            shared,
            _value: PhantomData,
        }
    }

    /// Suspends the calling fiber until this fiber has completed, yielding
    /// its full [`Exit`].
    ///
    /// Never fails in the caller's error channel: failures of the awaited
    /// fiber are reported inside the exit. Awaiting marks the fiber as
    /// observed, so its cause is charged to the awaiting fiber rather than
    /// re-reported when the parent's scope closes.
    pub fn await_exit(&self) -> Effect<Exit<A, E>, E> {
        let shared = Arc::clone(&self.shared);
        Effect::async_effect(move |callback| {
            shared.mark_observed();
            shared.on_exit(Box::new(move |exit| {
                callback.succeed(materialize::<A, E>(&exit));
            }));
            None
        })
    }

    /// Awaits the fiber and unwraps its exit into the caller's own
    /// channels: success flows on, failure and interruption are re-raised
    /// with the fiber's cause.
    pub fn join(&self) -> Effect<A, E> {
        self.await_exit().flat_map(|exit| match exit {
            Exit::Done(value) => Effect::succeed(value),
            Exit::Failure(cause) => Effect::fail_cause(cause),
        })
    }

    /// Interrupts the fiber on behalf of the calling fiber and awaits the
    /// resulting exit.
    ///
    /// The exit is not necessarily an interruption: the fiber may have
    /// completed on its own first, or be forever uninterruptible.
    pub fn interrupt(&self) -> Effect<Exit<A, E>, E> {
        let this = self.clone();
        Effect::descriptor().flat_map(move |descriptor| {
            this.shared.interrupt_now(descriptor.id);
            this.await_exit()
        })
    }

    /// Interrupts the fiber on behalf of the given id and awaits the exit.
    pub fn interrupt_as(&self, by: FiberId) -> Effect<Exit<A, E>, E> {
        self.shared.interrupt_now(by);
        self.await_exit()
    }

    /// Fire-and-forget interrupt request on behalf of `by`.
    pub(crate) fn interrupt_now(&self, by: FiberId) {
        self.shared.interrupt_now(by);
    }

    /// The fiber's exit if it has already completed, without suspending.
    pub fn poll(&self) -> Effect<Option<Exit<A, E>>, E> {
        let shared = Arc::clone(&self.shared);
        Effect::sync(move || {
            let exit = shared.poll_exit().map(|exit| {
                shared.mark_observed();
                materialize::<A, E>(&exit)
            });
            exit
        })
    }

    /// Registers a callback invoked exactly once with the fiber's exit,
    /// immediately if it has already completed.
    pub fn on_exit(&self, callback: impl FnOnce(Exit<A, E>) + Send + 'static) {
        self.shared.mark_observed();
        self.shared
            .on_exit(Box::new(move |exit| callback(materialize::<A, E>(&exit))));
    }
}

/// Recovers a typed exit from the erased one a fiber stores.
///
/// The value type is pinned by the `Supervised` instruction that created
/// the fiber, so a downcast mismatch means handle misuse inside the
/// runtime itself and is reported as a defect rather than hidden.
pub(crate) fn materialize<A, E>(exit: &Exit<Value, E>) -> Exit<A, E>
where
    A: Clone + Send + Sync + 'static,
    E: Clone,
{
    match exit {
        Exit::Done(value) => match value.downcast_ref::<A>() {
            Some(value) => Exit::Done(value.clone()),
            None => Exit::Failure(Cause::die(Defect::new(
                "fiber produced a value of an unexpected type",
            ))),
        },
        Exit::Failure(cause) => Exit::Failure(cause.clone()),
    }
}

assert_impl_all!(Fiber<i32, String>: Send, Sync);
