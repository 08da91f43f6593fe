//! The instruction interpreter.
//!
//! A [`Driver`] is the mutable state machine that runs one fiber: it owns
//! the frame stack, the environment stack, and the interruptibility
//! regions, and it walks the instruction tree in a trampolined loop. The
//! few pieces of state another fiber may touch — the completion cell,
//! listeners, the interrupt request, and the parked continuation of a
//! suspended fiber — live in [`Shared`] behind a mutex.
//!
//! # Lifecycle
//!
//! A driver is created, interprets until it completes or suspends, and
//! transitions to a terminal [`Exit`] exactly once. Listeners registered
//! before completion fire when the exit is produced; listeners registered
//! after fire immediately, always exactly once each, in registration
//! order.
//!
//! # Interruption
//!
//! Interruption is cooperative. A request sets a monotonic flag that the
//! loop observes at the next instruction boundary where the fiber is
//! interruptible; a fiber suspended on an interruptible `Async` is resumed
//! immediately with an interrupt cause after its stored cancellation
//! effect is dispatched. Requests made while the fiber is non-interruptible
//! are deferred, never dropped.

use std::mem;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::cause::{Cause, Defect, FiberId};
use crate::exit::Exit;
use crate::frame::Frame;
use crate::instruction::{Env, Instr, Register, Value, box_value};
use crate::runtime::Dispatch;

/// A snapshot of the running fiber's identity and interrupt status,
/// observable from within an effect.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FiberDescriptor {
    /// The id of the fiber interpreting the current instruction.
    pub id: FiberId,
    /// Whether the fiber is currently interruptible.
    pub interruptible: bool,
}

/// The erased exit of a fiber, shared among all of its observers.
pub(crate) type SharedExit<E> = Arc<Exit<Value, E>>;

/// A completion callback, invoked exactly once with the fiber's exit.
pub(crate) type Listener<E> = Box<dyn FnOnce(SharedExit<E>) + Send>;

// =============================================================================
// Supervisor
// =============================================================================

/// A fiber forked by a parent, tracked until it is pruned or drained.
struct ChildFiber<E> {
    id: FiberId,
    shared: Arc<Shared<E>>,
}

/// Tracks the ordered set of children a parent has forked.
///
/// Created lazily on the first fork. Children that complete successfully
/// prune themselves immediately, keeping growth bounded; children that
/// fail stay tracked so their causes cannot be lost silently.
pub(crate) struct Supervisor<E> {
    children: Vec<ChildFiber<E>>,
}

impl<E> Supervisor<E> {
    fn new() -> Self {
        Self {
            children: Vec::new(),
        }
    }

    fn track(&mut self, id: FiberId, shared: Arc<Shared<E>>) {
        self.children.push(ChildFiber { id, shared });
    }

    fn prune(&mut self, id: FiberId) {
        self.children.retain(|child| child.id != id);
    }
}

/// Accumulates child exits while a completing parent drains its children.
struct Draining<E> {
    exit: Exit<Value, E>,
    remaining: usize,
    folded: Cause<E>,
}

// =============================================================================
// Shared Fiber State
// =============================================================================

struct SharedState<E> {
    completed: Option<SharedExit<E>>,
    listeners: Vec<Listener<E>>,
    interrupter: Option<FiberId>,
    /// The driver of a fiber suspended on `Async`, parked until resumed.
    parked: Option<Driver<E>>,
    /// The cancellation instruction returned by the pending `Async`
    /// registration, present only while parked.
    cancel: Option<Instr<E>>,
    /// Bumped on every suspension and on interrupt-resume, so stale resume
    /// handles can never re-enter the fiber.
    epoch: u64,
    supervisor: Option<Supervisor<E>>,
    draining: Option<Draining<E>>,
}

/// The cross-fiber face of a driver.
///
/// Everything here may be touched from a thread other than the one
/// interpreting the fiber, so mutation is mediated by the mutex (and the
/// lock is never held while user code runs).
pub(crate) struct Shared<E> {
    id: FiberId,
    name: Option<String>,
    interrupt_requested: AtomicBool,
    /// Set once this fiber's exit has been delivered through a handle
    /// (`join` and friends); an observed child's cause is not folded again
    /// into its parent.
    observed: AtomicBool,
    state: Mutex<SharedState<E>>,
}

impl<E> Shared<E> {
    pub(crate) fn id(&self) -> FiberId {
        self.id
    }

    pub(crate) fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl<E: Clone + Send + Sync + 'static> Shared<E> {
    pub(crate) fn new(name: Option<String>) -> Self {
        Self {
            id: FiberId::fresh(),
            name,
            interrupt_requested: AtomicBool::new(false),
            observed: AtomicBool::new(false),
            state: Mutex::new(SharedState {
                completed: None,
                listeners: Vec::new(),
                interrupter: None,
                parked: None,
                cancel: None,
                epoch: 0,
                supervisor: None,
                draining: None,
            }),
        }
    }

    pub(crate) fn mark_observed(&self) {
        self.observed.store(true, Ordering::SeqCst);
    }

    fn is_observed(&self) -> bool {
        self.observed.load(Ordering::SeqCst)
    }

    fn interrupt_requested(&self) -> bool {
        self.interrupt_requested.load(Ordering::SeqCst)
    }

    fn interrupter(&self) -> FiberId {
        self.state.lock().interrupter.unwrap_or(self.id)
    }

    /// Registers a completion listener.
    ///
    /// Fires immediately, on the calling thread, if the fiber has already
    /// completed; otherwise fires exactly once when it does.
    pub(crate) fn on_exit(&self, listener: Listener<E>) {
        let mut state = self.state.lock();
        if let Some(exit) = &state.completed {
            let exit = Arc::clone(exit);
            drop(state);
            listener(exit);
        } else {
            state.listeners.push(listener);
        }
    }

    /// The fiber's exit, if it has completed.
    pub(crate) fn poll_exit(&self) -> Option<SharedExit<E>> {
        self.state.lock().completed.clone()
    }

    /// Requests interruption on behalf of `by`.
    ///
    /// No-op once the fiber has completed. Sets the monotonic interrupt
    /// flag; if the fiber is parked on an interruptible `Async`, takes the
    /// parked driver, dispatches its stored cancellation, and resumes it
    /// with an interrupt cause. A running or non-interruptible fiber
    /// observes the flag at its next interruptible checkpoint instead.
    pub(crate) fn interrupt_now(&self, by: FiberId) {
        let taken = {
            let mut state = self.state.lock();
            if state.completed.is_some() {
                return;
            }
            self.interrupt_requested.store(true, Ordering::SeqCst);
            if state.interrupter.is_none() {
                state.interrupter = Some(by);
            }
            let parked_interruptible = state
                .parked
                .as_ref()
                .is_some_and(Driver::interruptible);
            if parked_interruptible {
                state.epoch += 1;
                let driver = state.parked.take();
                let cancel = state.cancel.take();
                driver.map(|driver| (driver, cancel))
            } else {
                None
            }
        };

        if let Some((driver, cancel)) = taken {
            let dispatcher = Arc::clone(&driver.dispatcher);
            if let Some(cancel) = cancel {
                // The cancellation action runs on its own detached fiber,
                // uninterruptibly.
                let cancel_driver = Driver::detached(Arc::clone(&dispatcher));
                dispatcher.dispatch(Box::new(move || {
                    cancel_driver.run(Instr::InterruptibleRegion(false, Box::new(cancel)));
                }));
            }
            let cause = Cause::interrupt(by);
            dispatcher.dispatch(Box::new(move || driver.run(Instr::Fail(cause))));
        }
    }

    fn prune_child(&self, id: FiberId) {
        let mut state = self.state.lock();
        if let Some(supervisor) = state.supervisor.as_mut() {
            supervisor.prune(id);
        }
    }

    /// Folds one drained child exit into the pending parent exit; the last
    /// child to arrive finalizes the parent.
    fn child_drained(&self, child_exit: &Exit<Value, E>, child_observed: bool) {
        let finalized = {
            let mut state = self.state.lock();
            let Some(draining) = state.draining.as_mut() else {
                return;
            };
            let contribution = match child_exit {
                Exit::Done(_) => Cause::Empty,
                Exit::Failure(_) if child_observed => Cause::Empty,
                Exit::Failure(cause) => {
                    // Children stopped purely by this scope closing are not
                    // failures of a successful parent.
                    if draining.exit.is_done() && cause.is_interrupted_only_by(self.id) {
                        Cause::Empty
                    } else {
                        cause.clone()
                    }
                }
            };
            let folded = mem::replace(&mut draining.folded, Cause::Empty);
            draining.folded = Cause::both(folded, contribution);
            draining.remaining -= 1;
            if draining.remaining == 0 {
                state.draining.take().map(|draining| {
                    let Draining { exit, folded, .. } = draining;
                    if folded.is_empty() {
                        exit
                    } else {
                        Exit::Failure(Cause::then(exit.into_cause(), folded))
                    }
                })
            } else {
                None
            }
        };

        if let Some(exit) = finalized {
            self.finalize(exit);
        }
    }

    /// The exactly-once transition to `completed`.
    pub(crate) fn finalize(&self, exit: Exit<Value, E>) {
        let (exit, listeners) = {
            let mut state = self.state.lock();
            if state.completed.is_some() {
                return;
            }
            let exit = Arc::new(exit);
            state.completed = Some(Arc::clone(&exit));
            (exit, mem::take(&mut state.listeners))
        };
        for listener in listeners {
            listener(Arc::clone(&exit));
        }
    }
}

// =============================================================================
// Resume Handle
// =============================================================================

/// Single-use re-entry point handed to an `Async` registration.
///
/// Exactly one resumption path wins: the handle's epoch is checked against
/// the fiber's, and the parked driver can only be taken once, whether the
/// race is between the registered callback and an interrupt or between two
/// copies of the callback.
pub(crate) struct ResumeHandle<E> {
    shared: Arc<Shared<E>>,
    dispatcher: Arc<dyn Dispatch>,
    epoch: u64,
}

impl<E> Clone for ResumeHandle<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            dispatcher: Arc::clone(&self.dispatcher),
            epoch: self.epoch,
        }
    }
}

impl<E: Clone + Send + Sync + 'static> ResumeHandle<E> {
    /// Re-enters the fiber with the outcome of the asynchronous operation.
    ///
    /// Loses silently against a completed resumption or an interrupt; the
    /// continuation runs on the dispatcher, not on the calling thread's
    /// stack.
    pub(crate) fn resume(&self, exit: Exit<Value, E>) {
        let parked = {
            let mut state = self.shared.state.lock();
            if state.epoch == self.epoch {
                state.cancel = None;
                state.parked.take()
            } else {
                None
            }
        };
        if let Some(driver) = parked {
            let instr = match exit {
                Exit::Done(value) => Instr::Pure(value),
                Exit::Failure(cause) => Instr::Fail(cause),
            };
            self.dispatcher.dispatch(Box::new(move || driver.run(instr)));
        }
    }
}

// =============================================================================
// Erased Fork Handle
// =============================================================================

/// The erased fiber handle a `Supervised` instruction yields as its value.
///
/// The typed [`Fiber`](crate::Fiber) wrapper is recovered by the `fork`
/// combinator.
pub(crate) struct RuntimeFiber<E> {
    pub(crate) shared: Arc<Shared<E>>,
}

// =============================================================================
// Driver
// =============================================================================

/// The outcome of parking a driver on an `Async` instruction.
enum Suspension<E> {
    /// The fiber is suspended; the loop must return.
    Parked,
    /// The registration failed before anyone resumed; keep interpreting.
    Resumed(Driver<E>, Instr<E>),
}

/// The per-fiber interpreter.
///
/// The frame, environment, and region stacks are owned exclusively by the
/// task currently running the fiber and are never touched by another
/// fiber.
pub(crate) struct Driver<E> {
    shared: Arc<Shared<E>>,
    dispatcher: Arc<dyn Dispatch>,
    frames: Vec<Frame<E>>,
    environments: Vec<Env>,
    /// Interruptibility regions, innermost last; empty means interruptible.
    regions: SmallVec<[bool; 8]>,
    /// Set once an interrupt has been injected into the loop; further
    /// requests are no-ops.
    interrupting: bool,
}

impl<E: Clone + Send + Sync + 'static> Driver<E> {
    /// A root driver for a freshly spawned fiber.
    pub(crate) fn root(shared: Arc<Shared<E>>, dispatcher: Arc<dyn Dispatch>) -> Self {
        Self {
            shared,
            dispatcher,
            frames: Vec::new(),
            environments: Vec::new(),
            regions: SmallVec::new(),
            interrupting: false,
        }
    }

    /// A driver for internal bookkeeping effects such as cancellation
    /// actions; its exit is nobody's business.
    fn detached(dispatcher: Arc<dyn Dispatch>) -> Self {
        Self::root(Arc::new(Shared::new(None)), dispatcher)
    }

    pub(crate) fn shared(&self) -> &Arc<Shared<E>> {
        &self.shared
    }

    fn interruptible(&self) -> bool {
        self.regions.last().copied().unwrap_or(true)
    }

    /// Interprets instructions until the fiber completes or suspends.
    ///
    /// Each iteration first honors a deferred interrupt if the fiber is
    /// interruptible, then dispatches on the instruction tag. Panics in
    /// user closures are caught at this boundary and become defects; no
    /// fault escapes the loop.
    pub(crate) fn run(mut self, start: Instr<E>) {
        let mut current = start;
        loop {
            if !self.interrupting && self.shared.interrupt_requested() && self.interruptible() {
                self.interrupting = true;
                let interrupt = Cause::interrupt(self.shared.interrupter());
                // An in-flight failure is never discarded; the interrupt is
                // sequenced after it.
                current = match current {
                    Instr::Fail(cause) if cause.is_interrupted() => Instr::Fail(cause),
                    Instr::Fail(cause) => Instr::Fail(Cause::then(cause, interrupt)),
                    _ => Instr::Fail(interrupt),
                };
            }

            current = match current {
                Instr::Pure(value) => match self.next(value) {
                    Some(instr) => instr,
                    None => return,
                },
                Instr::Fail(cause) => match self.unwind(cause) {
                    Some(instr) => instr,
                    None => return,
                },
                Instr::Map(inner, transform) => {
                    self.frames.push(Frame::Map(transform));
                    *inner
                }
                Instr::Chain(inner, continuation) => {
                    self.frames.push(Frame::Fold {
                        on_failure: Box::new(Instr::Fail),
                        on_success: continuation,
                    });
                    *inner
                }
                Instr::Collapse(inner, on_failure, on_success) => {
                    self.frames.push(Frame::Fold {
                        on_failure,
                        on_success,
                    });
                    *inner
                }
                Instr::AccessEnv(continuation) => match self.environments.last() {
                    Some(environment) => {
                        let environment = Arc::clone(environment);
                        attempt(move || continuation(environment))
                    }
                    None => Instr::Fail(Cause::die(Defect::new(
                        "no environment has been provided to this fiber",
                    ))),
                },
                Instr::ProvideEnv(environment, inner) => {
                    self.environments.push(environment);
                    self.frames.push(Frame::Env);
                    *inner
                }
                Instr::InterruptibleRegion(flag, inner) => {
                    self.regions.push(flag);
                    self.frames.push(Frame::Interrupt);
                    *inner
                }
                Instr::Descriptor(continuation) => {
                    let descriptor = FiberDescriptor {
                        id: self.shared.id(),
                        interruptible: self.interruptible(),
                    };
                    attempt(move || continuation(descriptor))
                }
                Instr::Supervised(inner, name) => {
                    let fiber = self.fork(*inner, name);
                    match self.next(box_value(fiber)) {
                        Some(instr) => instr,
                        None => return,
                    }
                }
                Instr::Async(register) => match self.suspend(register) {
                    Suspension::Parked => return,
                    Suspension::Resumed(driver, instr) => {
                        self = driver;
                        instr
                    }
                },
            };
        }
    }

    /// Feeds a value to the pending continuations.
    ///
    /// Pops frames until one produces a new instruction; an exhausted
    /// stack completes the fiber with `Done`.
    fn next(&mut self, mut value: Value) -> Option<Instr<E>> {
        loop {
            match self.frames.pop() {
                None => {
                    self.complete(Exit::Done(value));
                    return None;
                }
                Some(Frame::Map(transform)) => {
                    match catch_unwind(AssertUnwindSafe(move || transform(value))) {
                        Ok(transformed) => value = transformed,
                        Err(payload) => {
                            return Some(Instr::Fail(Cause::die(Defect::from_panic(payload))));
                        }
                    }
                }
                Some(Frame::Fold { on_success, .. }) => {
                    return Some(attempt(move || on_success(value)));
                }
                Some(Frame::Env) => {
                    self.environments.pop();
                }
                Some(Frame::Interrupt) => {
                    self.regions.pop();
                    // A deferred interrupt is honored the moment its
                    // protected region ends; the region's value is lost.
                    if !self.interrupting
                        && self.shared.interrupt_requested()
                        && self.interruptible()
                    {
                        self.interrupting = true;
                        return Some(Instr::Fail(Cause::interrupt(self.shared.interrupter())));
                    }
                }
            }
        }
    }

    /// Unwinds the stack with a failure cause.
    ///
    /// A `Fold` handles the cause unless the cause carries an interrupt
    /// and the fiber is interruptible at that point of the stack: only
    /// uninterruptible folds (finalizers, brackets) observe interruption.
    /// Environment and region frames are restored along the way; an
    /// exhausted stack completes the fiber with `Failure`.
    fn unwind(&mut self, mut cause: Cause<E>) -> Option<Instr<E>> {
        let mut interrupted = cause.is_interrupted();
        loop {
            match self.frames.pop() {
                None => {
                    self.complete(Exit::Failure(cause));
                    return None;
                }
                Some(Frame::Fold { on_failure, .. }) => {
                    if !(interrupted && self.interruptible()) {
                        if interrupted {
                            // The handler may swallow the interrupt; arm the
                            // loop to inject it again once the fiber leaves
                            // its protected region.
                            self.interrupting = false;
                        }
                        return Some(attempt(move || on_failure(cause)));
                    }
                }
                Some(Frame::Map(_)) => {}
                Some(Frame::Env) => {
                    self.environments.pop();
                }
                Some(Frame::Interrupt) => {
                    self.regions.pop();
                    // Fold a deferred interrupt into the cause as the
                    // protected region ends so it cannot be caught away.
                    if !self.interrupting
                        && self.shared.interrupt_requested()
                        && self.interruptible()
                    {
                        self.interrupting = true;
                        if !interrupted {
                            cause = Cause::then(cause, Cause::interrupt(self.shared.interrupter()));
                            interrupted = true;
                        }
                    }
                }
            }
        }
    }

    /// Spawns a supervised child fiber sharing the current environment.
    fn fork(&mut self, instr: Instr<E>, name: Option<String>) -> RuntimeFiber<E> {
        let child_shared = Arc::new(Shared::new(name));
        let child_id = child_shared.id();

        {
            let mut state = self.shared.state.lock();
            state
                .supervisor
                .get_or_insert_with(Supervisor::new)
                .track(child_id, Arc::clone(&child_shared));
        }

        // Cleanly finished children prune themselves so the child set
        // stays bounded.
        let parent = Arc::downgrade(&self.shared);
        child_shared.on_exit(Box::new(move |exit| {
            if exit.is_done() {
                if let Some(parent) = parent.upgrade() {
                    parent.prune_child(child_id);
                }
            }
        }));

        let driver = Driver {
            shared: Arc::clone(&child_shared),
            dispatcher: Arc::clone(&self.dispatcher),
            frames: Vec::new(),
            environments: self.environments.clone(),
            regions: SmallVec::new(),
            interrupting: false,
        };
        self.dispatcher.dispatch(Box::new(move || driver.run(instr)));

        RuntimeFiber {
            shared: child_shared,
        }
    }

    /// Parks the driver and hands a resume handle to the registration.
    fn suspend(self, register: Register<E>) -> Suspension<E> {
        let shared = Arc::clone(&self.shared);
        let dispatcher = Arc::clone(&self.dispatcher);

        // Park before registering: the registration may resume
        // synchronously on this very thread.
        let epoch = {
            let mut state = shared.state.lock();
            state.epoch += 1;
            state.parked = Some(self);
            state.epoch
        };

        let handle = ResumeHandle {
            shared: Arc::clone(&shared),
            dispatcher: Arc::clone(&dispatcher),
            epoch,
        };

        match catch_unwind(AssertUnwindSafe(move || register(handle))) {
            Ok(cancel) => {
                let unclaimed = {
                    let mut state = shared.state.lock();
                    if state.epoch != epoch {
                        // An interrupt took the parked driver while the
                        // registration was still running; its cancellation
                        // must still run.
                        cancel
                    } else {
                        // Only store the cancellation while this suspension
                        // is still pending; a completed resume has nothing
                        // left to cancel.
                        if state.parked.is_some() {
                            state.cancel = cancel;
                        }
                        None
                    }
                };
                if let Some(cancel) = unclaimed {
                    let cancel_driver = Driver::detached(Arc::clone(&dispatcher));
                    dispatcher.dispatch(Box::new(move || {
                        cancel_driver.run(Instr::InterruptibleRegion(false, Box::new(cancel)));
                    }));
                }
                Suspension::Parked
            }
            Err(payload) => {
                let reclaimed = {
                    let mut state = shared.state.lock();
                    if state.epoch == epoch {
                        state.parked.take()
                    } else {
                        None
                    }
                };
                match reclaimed {
                    Some(driver) => Suspension::Resumed(
                        driver,
                        Instr::Fail(Cause::die(Defect::from_panic(payload))),
                    ),
                    None => Suspension::Parked,
                }
            }
        }
    }

    /// Completes the fiber, draining any remaining supervised children
    /// first so no child failure is orphaned.
    fn complete(&mut self, exit: Exit<Value, E>) {
        let pending = {
            let mut state = self.shared.state.lock();
            let children = state
                .supervisor
                .take()
                .map(|supervisor| supervisor.children)
                .unwrap_or_default();
            if children.is_empty() {
                state.draining = None;
                Err(exit)
            } else {
                state.draining = Some(Draining {
                    exit,
                    remaining: children.len(),
                    folded: Cause::Empty,
                });
                Ok(children)
            }
        };

        let children = match pending {
            Ok(children) => children,
            Err(exit) => {
                self.shared.finalize(exit);
                return;
            }
        };

        let parent_id = self.shared.id();
        for child in children {
            let parent = Arc::clone(&self.shared);
            let child_shared = Arc::clone(&child.shared);
            child.shared.on_exit(Box::new(move |child_exit| {
                parent.child_drained(&child_exit, child_shared.is_observed());
            }));
            child.shared.interrupt_now(parent_id);
        }
    }
}

/// Runs a user continuation, converting a panic into a defect.
fn attempt<E>(run: impl FnOnce() -> Instr<E>) -> Instr<E> {
    match catch_unwind(AssertUnwindSafe(run)) {
        Ok(instr) => instr,
        Err(payload) => Instr::Fail(Cause::die(Defect::from_panic(payload))),
    }
}
