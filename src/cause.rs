//! Failure provenance for fibers.
//!
//! A [`Cause`] records everything that went wrong while running an effect:
//! expected typed failures, defects (caught panics and other unexpected
//! faults), and interruptions, possibly combined sequentially or in
//! parallel. Unlike a plain error value, a cause never silently drops one
//! failure in favor of another.
//!
//! # Design Philosophy
//!
//! Causes form a small algebra with two smart constructors:
//!
//! - [`Cause::then`] combines two causes that happened one after the other
//!   (non-commutative: the left cause happened first).
//! - [`Cause::both`] combines two causes that happened in parallel
//!   (commutative in its leaf set).
//!
//! Both treat [`Cause::Empty`] as identity and otherwise preserve the tree
//! structure as-is. The tree is deliberately *not* normalized or flattened:
//! diagnostics such as [`Cause::interruptors`] depend on every leaf being
//! reachable.
//!
//! # Examples
//!
//! ```rust
//! use filament::Cause;
//!
//! let cause: Cause<String> = Cause::then(
//!     Cause::fail("read failed".to_string()),
//!     Cause::fail("cleanup failed".to_string()),
//! );
//!
//! assert!(!cause.is_empty());
//! assert_eq!(cause.failures().len(), 2);
//! ```

use std::any::Any;
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// Fiber Identity
// =============================================================================

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Globally unique identifier for a fiber.
///
/// Identifiers are allocated from a process-wide atomic counter and are
/// never reused. An interruption records the id of the fiber that requested
/// it, so a [`Cause`] can report exactly who interrupted whom.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FiberId(u64);

impl FiberId {
    /// Allocates a fresh, never-before-used fiber id.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use filament::FiberId;
    ///
    /// let first = FiberId::fresh();
    /// let second = FiberId::fresh();
    /// assert_ne!(first, second);
    /// ```
    #[must_use]
    pub fn fresh() -> Self {
        Self(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "fiber-{}", self.0)
    }
}

// =============================================================================
// Defects
// =============================================================================

/// An unexpected, non-domain failure.
///
/// Defects represent faults the program did not plan for: panics caught at
/// the interpreter boundary, values of a type the runtime did not expect,
/// or failures explicitly raised with [`Effect::die`](crate::Effect::die).
/// They travel through the same [`Cause`] channel as typed failures, so
/// callers inspect, log, and recover from both uniformly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Defect {
    message: String,
}

impl Defect {
    /// Creates a defect with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Converts a caught panic payload into a defect.
    ///
    /// Panic payloads are usually `&str` or `String`; anything else is
    /// reported as an unknown panic.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "unknown panic".to_string()
        };
        Self { message }
    }

    /// The human-readable description of the defect.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "defect: {}", self.message)
    }
}

impl Error for Defect {}

// =============================================================================
// Cause
// =============================================================================

/// The full provenance of a fiber failure.
///
/// A cause is a tree whose leaves are typed failures ([`Cause::Fail`]),
/// defects ([`Cause::Die`]), and interruptions ([`Cause::Interrupt`]), and
/// whose interior nodes record whether two causes happened sequentially
/// ([`Cause::Then`]) or in parallel ([`Cause::Both`]).
///
/// # Invariants
///
/// - [`Cause::Empty`] is the identity for [`Cause::then`] and
///   [`Cause::both`].
/// - `Then` is non-commutative: the left child happened first.
/// - `Both` is commutative in its leaf set but the structure is preserved.
/// - Combining two causes never discards either of them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Cause<E> {
    /// No failure occurred.
    Empty,
    /// An expected, typed failure.
    Fail(E),
    /// An unexpected defect, including caught panics.
    Die(Defect),
    /// The fiber was interrupted by the given fiber.
    Interrupt(FiberId),
    /// Two causes that happened sequentially; the left happened first.
    Then(Box<Cause<E>>, Box<Cause<E>>),
    /// Two causes that happened in parallel.
    Both(Box<Cause<E>>, Box<Cause<E>>),
}

impl<E> Cause<E> {
    /// The empty cause.
    #[must_use]
    pub const fn empty() -> Self {
        Self::Empty
    }

    /// A typed failure leaf.
    pub const fn fail(error: E) -> Self {
        Self::Fail(error)
    }

    /// A defect leaf.
    #[must_use]
    pub const fn die(defect: Defect) -> Self {
        Self::Die(defect)
    }

    /// An interruption leaf carrying the interrupting fiber's id.
    #[must_use]
    pub const fn interrupt(interrupter: FiberId) -> Self {
        Self::Interrupt(interrupter)
    }

    /// Combines two causes sequentially: `left` happened before `right`.
    ///
    /// [`Cause::Empty`] is the identity; otherwise the structure is
    /// preserved without flattening.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use filament::Cause;
    ///
    /// let cause: Cause<&str> = Cause::then(Cause::Empty, Cause::fail("boom"));
    /// assert_eq!(cause, Cause::fail("boom"));
    /// ```
    #[must_use]
    pub fn then(left: Self, right: Self) -> Self {
        match (left, right) {
            (Self::Empty, right) => right,
            (left, Self::Empty) => left,
            (left, right) => Self::Then(Box::new(left), Box::new(right)),
        }
    }

    /// Combines two causes that happened in parallel.
    ///
    /// [`Cause::Empty`] is the identity; otherwise the structure is
    /// preserved without flattening.
    #[must_use]
    pub fn both(left: Self, right: Self) -> Self {
        match (left, right) {
            (Self::Empty, right) => right,
            (left, Self::Empty) => left,
            (left, right) => Self::Both(Box::new(left), Box::new(right)),
        }
    }

    /// True iff the cause contains no `Fail`, `Die`, or `Interrupt` leaf.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            match node {
                Self::Empty => {}
                Self::Fail(_) | Self::Die(_) | Self::Interrupt(_) => return false,
                Self::Then(left, right) | Self::Both(left, right) => {
                    stack.push(right);
                    stack.push(left);
                }
            }
        }
        true
    }

    /// True iff the cause contains at least one `Interrupt` leaf.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        !self.interruptors().is_empty()
    }

    /// True iff the cause contains at least one typed `Fail` leaf.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        !self.failures().is_empty()
    }

    /// True iff the cause contains at least one `Die` leaf.
    #[must_use]
    pub fn is_die(&self) -> bool {
        !self.defects().is_empty()
    }

    /// Collects the ids of every fiber that interrupted this one.
    ///
    /// The traversal is depth-first and visits both children of `Then` and
    /// `Both` nodes, so no interruption is lost regardless of how causes
    /// were combined.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use filament::{Cause, FiberId};
    ///
    /// let first = FiberId::fresh();
    /// let second = FiberId::fresh();
    /// let cause: Cause<&str> =
    ///     Cause::then(Cause::interrupt(first), Cause::interrupt(second));
    ///
    /// let interruptors = cause.interruptors();
    /// assert!(interruptors.contains(&first));
    /// assert!(interruptors.contains(&second));
    /// ```
    #[must_use]
    pub fn interruptors(&self) -> BTreeSet<FiberId> {
        let mut collected = BTreeSet::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            match node {
                Self::Interrupt(interrupter) => {
                    collected.insert(*interrupter);
                }
                Self::Then(left, right) | Self::Both(left, right) => {
                    stack.push(right);
                    stack.push(left);
                }
                _ => {}
            }
        }
        collected
    }

    /// Collects every typed failure leaf, leftmost first.
    #[must_use]
    pub fn failures(&self) -> Vec<&E> {
        let mut collected = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            match node {
                Self::Fail(error) => collected.push(error),
                Self::Then(left, right) | Self::Both(left, right) => {
                    stack.push(right);
                    stack.push(left);
                }
                _ => {}
            }
        }
        collected
    }

    /// Collects every defect leaf, leftmost first.
    #[must_use]
    pub fn defects(&self) -> Vec<&Defect> {
        let mut collected = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            match node {
                Self::Die(defect) => collected.push(defect),
                Self::Then(left, right) | Self::Both(left, right) => {
                    stack.push(right);
                    stack.push(left);
                }
                _ => {}
            }
        }
        collected
    }

    /// The leftmost typed failure, if any.
    #[must_use]
    pub fn first_failure(&self) -> Option<&E> {
        self.failures().into_iter().next()
    }

    /// True iff the cause consists solely of interruptions requested by
    /// `interrupter` (no typed failures, no defects, no other interrupters).
    ///
    /// Used by the supervisor to recognize children that were stopped as
    /// part of normal scope closure.
    #[must_use]
    pub fn is_interrupted_only_by(&self, interrupter: FiberId) -> bool {
        if self.is_failure() || self.is_die() {
            return false;
        }
        let interruptors = self.interruptors();
        interruptors.len() == 1 && interruptors.contains(&interrupter)
    }

    /// Maps the typed error leaves, leaving the tree shape untouched.
    pub fn map<E2>(self, mut function: impl FnMut(E) -> E2) -> Cause<E2> {
        self.map_inner(&mut function)
    }

    fn map_inner<E2>(self, function: &mut impl FnMut(E) -> E2) -> Cause<E2> {
        match self {
            Self::Empty => Cause::Empty,
            Self::Fail(error) => Cause::Fail(function(error)),
            Self::Die(defect) => Cause::Die(defect),
            Self::Interrupt(interrupter) => Cause::Interrupt(interrupter),
            Self::Then(left, right) => Cause::Then(
                Box::new(left.map_inner(function)),
                Box::new(right.map_inner(function)),
            ),
            Self::Both(left, right) => Cause::Both(
                Box::new(left.map_inner(function)),
                Box::new(right.map_inner(function)),
            ),
        }
    }

    /// Splits the cause into its leftmost typed failure or, when no typed
    /// failure exists, the untouched cause.
    ///
    /// This is the seam a typed error handler uses: it can only deal with
    /// `E` values, so defect-only and interrupt-only causes pass through.
    pub fn failure_or_cause(self) -> Result<E, Self>
    where
        E: Clone,
    {
        let first = self.first_failure().cloned();
        match first {
            Some(error) => Ok(error),
            None => Err(self),
        }
    }
}

impl<E: fmt::Display> fmt::Display for Cause<E> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(formatter, "<empty>"),
            Self::Fail(error) => write!(formatter, "fail: {error}"),
            Self::Die(defect) => write!(formatter, "{defect}"),
            Self::Interrupt(interrupter) => write!(formatter, "interrupted by {interrupter}"),
            Self::Then(left, right) => write!(formatter, "({left}) then ({right})"),
            Self::Both(left, right) => write!(formatter, "({left}) both ({right})"),
        }
    }
}
