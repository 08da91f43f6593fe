//! The driver's explicit continuation stack.
//!
//! Effect chains can be arbitrarily long, so the interpreter never uses
//! native recursion: every pending continuation is a [`Frame`] on a
//! growable stack, interpreted in a loop. This gives O(1) unwind and no
//! stack-overflow hazard at any chain depth.

use crate::instruction::{Continuation, FailureContinuation, Transform};

/// One saved continuation on a driver's stack.
pub(crate) enum Frame<E> {
    /// Transform the incoming value and keep popping.
    Map(Transform),
    /// Branch on success or failure.
    ///
    /// A `Chain` pushes a `Fold` whose failure arm rethrows, so unwinding
    /// only ever has to look for `Fold` frames.
    Fold {
        on_failure: FailureContinuation<E>,
        on_success: Continuation<E>,
    },
    /// Restore the interruptibility region that was active before the
    /// matching `InterruptibleRegion` instruction, on success and failure
    /// alike.
    Interrupt,
    /// Pop the environment pushed by the matching `ProvideEnv`, on success
    /// and failure alike.
    Env,
}
