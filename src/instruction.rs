//! The effect instruction set.
//!
//! An [`Instr`] is an immutable description of one computation step. It is
//! owned exclusively by the driver currently interpreting it and is never
//! shared between fibers. Values flowing between instructions are
//! type-erased (`Box<dyn Any>`); the typed [`Effect`](crate::Effect)
//! surface erases on construction and downcasts on application, so a
//! mismatch is impossible for code that only uses the public constructors.

use std::any::Any;
use std::sync::Arc;

use crate::cause::Cause;
use crate::driver::{FiberDescriptor, ResumeHandle};

/// A type-erased value travelling along a fiber's continuation.
///
/// Values are linear within a driver: each continuation consumes the box
/// produced by the previous step.
pub(crate) type Value = Box<dyn Any + Send + Sync>;

/// A type-erased environment, shared down the fiber tree on fork.
pub(crate) type Env = Arc<dyn Any + Send + Sync>;

/// A continuation from a value to the next instruction.
pub(crate) type Continuation<E> = Box<dyn FnOnce(Value) -> Instr<E> + Send>;

/// A pure value-to-value transformation.
pub(crate) type Transform = Box<dyn FnOnce(Value) -> Value + Send>;

/// A continuation from a failure cause to the next instruction.
pub(crate) type FailureContinuation<E> = Box<dyn FnOnce(Cause<E>) -> Instr<E> + Send>;

/// An asynchronous registration callback.
///
/// Receives a single-use resume handle and may return a cancellation
/// instruction to run if the fiber is interrupted while suspended.
pub(crate) type Register<E> = Box<dyn FnOnce(ResumeHandle<E>) -> Option<Instr<E>> + Send>;

/// A continuation from the current environment to the next instruction.
pub(crate) type EnvContinuation<E> = Box<dyn FnOnce(Env) -> Instr<E> + Send>;

/// A continuation from the fiber's runtime descriptor.
pub(crate) type DescriptorContinuation<E> =
    Box<dyn FnOnce(FiberDescriptor) -> Instr<E> + Send>;

/// One step of an effectful computation.
///
/// Constructing an instruction has no observable effect; side effects
/// happen only when a driver interprets it.
pub(crate) enum Instr<E> {
    /// An already-computed value.
    Pure(Value),
    /// A failure with full provenance.
    Fail(Cause<E>),
    /// Suspend on an external asynchronous operation.
    Async(Register<E>),
    /// Run `inner`, then feed its value to the continuation.
    Chain(Box<Instr<E>>, Continuation<E>),
    /// Run `inner`, then transform its value.
    Map(Box<Instr<E>>, Transform),
    /// Run `inner`; collapse either outcome into a new instruction.
    Collapse(Box<Instr<E>>, FailureContinuation<E>, Continuation<E>),
    /// Read the innermost provided environment.
    AccessEnv(EnvContinuation<E>),
    /// Run `inner` with an additional environment pushed.
    ProvideEnv(Env, Box<Instr<E>>),
    /// Run `inner` with interruptibility set to `flag`.
    InterruptibleRegion(bool, Box<Instr<E>>),
    /// Fork `inner` onto a new supervised fiber, yielding its handle.
    Supervised(Box<Instr<E>>, Option<String>),
    /// Read the current fiber's descriptor.
    Descriptor(DescriptorContinuation<E>),
}

/// Erases a typed value.
pub(crate) fn box_value<A: Send + Sync + 'static>(value: A) -> Value {
    Box::new(value)
}

/// Recovers a typed value from an erased one.
///
/// Panics on a type mismatch; the public `Effect` constructors make a
/// mismatch unreachable, and the driver converts the panic into a defect
/// should one ever occur.
pub(crate) fn take_value<A: Send + Sync + 'static>(value: Value) -> A {
    match value.downcast::<A>() {
        Ok(boxed) => *boxed,
        Err(_) => panic!(
            "fiber value had an unexpected type; expected `{}`",
            std::any::type_name::<A>()
        ),
    }
}
