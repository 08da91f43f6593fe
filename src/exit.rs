//! Terminal outcomes of running an effect.
//!
//! Every fiber produces exactly one [`Exit`]: either [`Exit::Done`] with a
//! value, or [`Exit::Failure`] with the full [`Cause`] of what went wrong.
//! There is no separate unchecked-exception channel; defects and
//! interruptions surface through the same value as typed failures, so
//! callers inspect all three uniformly.

use crate::cause::{Cause, Defect, FiberId};

/// The terminal, immutable outcome of running an effect.
///
/// # Examples
///
/// ```rust
/// use filament::{Cause, Exit};
///
/// let done: Exit<i32, String> = Exit::Done(42);
/// assert!(done.is_done());
///
/// let failed: Exit<i32, String> = Exit::fail("boom".to_string());
/// assert_eq!(failed.cause(), Some(&Cause::fail("boom".to_string())));
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Exit<A, E> {
    /// The effect completed with a value.
    Done(A),
    /// The effect terminated with the given cause.
    Failure(Cause<E>),
}

impl<A, E> Exit<A, E> {
    /// An exit that completed with `value`.
    pub const fn done(value: A) -> Self {
        Self::Done(value)
    }

    /// An exit that failed with the given cause.
    #[must_use]
    pub const fn failure(cause: Cause<E>) -> Self {
        Self::Failure(cause)
    }

    /// An exit that failed with a single typed error.
    pub const fn fail(error: E) -> Self {
        Self::Failure(Cause::Fail(error))
    }

    /// An exit that failed with a defect.
    #[must_use]
    pub const fn die(defect: Defect) -> Self {
        Self::Failure(Cause::Die(defect))
    }

    /// An exit that was interrupted by the given fiber.
    #[must_use]
    pub const fn interrupt(interrupter: FiberId) -> Self {
        Self::Failure(Cause::Interrupt(interrupter))
    }

    /// True iff the exit completed with a value.
    #[must_use]
    pub const fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }

    /// True iff the exit terminated with a cause.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    /// True iff the exit's cause contains an interruption.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        match self {
            Self::Done(_) => false,
            Self::Failure(cause) => cause.is_interrupted(),
        }
    }

    /// The failure cause, if any.
    #[must_use]
    pub const fn cause(&self) -> Option<&Cause<E>> {
        match self {
            Self::Done(_) => None,
            Self::Failure(cause) => Some(cause),
        }
    }

    /// Consumes the exit, yielding its cause; a successful exit yields
    /// [`Cause::Empty`].
    ///
    /// Because `Empty` is the identity for [`Cause::then`] and
    /// [`Cause::both`], successful exits vanish when causes are merged.
    #[must_use]
    pub fn into_cause(self) -> Cause<E> {
        match self {
            Self::Done(_) => Cause::Empty,
            Self::Failure(cause) => cause,
        }
    }

    /// Transforms the success value.
    pub fn map<B>(self, function: impl FnOnce(A) -> B) -> Exit<B, E> {
        match self {
            Self::Done(value) => Exit::Done(function(value)),
            Self::Failure(cause) => Exit::Failure(cause),
        }
    }

    /// Transforms the typed error leaves of the cause.
    pub fn map_error<E2>(self, function: impl FnMut(E) -> E2) -> Exit<A, E2> {
        match self {
            Self::Done(value) => Exit::Done(value),
            Self::Failure(cause) => Exit::Failure(cause.map(function)),
        }
    }

    /// Collapses the exit into a single value.
    pub fn fold<B>(
        self,
        on_failure: impl FnOnce(Cause<E>) -> B,
        on_done: impl FnOnce(A) -> B,
    ) -> B {
        match self {
            Self::Done(value) => on_done(value),
            Self::Failure(cause) => on_failure(cause),
        }
    }

    /// Converts into a `Result`, keeping the full cause on failure.
    pub fn into_result(self) -> Result<A, Cause<E>> {
        match self {
            Self::Done(value) => Ok(value),
            Self::Failure(cause) => Err(cause),
        }
    }
}

impl<A, E> From<Result<A, E>> for Exit<A, E> {
    fn from(result: Result<A, E>) -> Self {
        match result {
            Ok(value) => Self::Done(value),
            Err(error) => Self::fail(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn test_done_and_failure_predicates() {
        let done: Exit<i32, &str> = Exit::done(42);
        assert!(done.is_done());
        assert!(!done.is_failure());
        assert!(!done.is_interrupted());

        let interrupted: Exit<i32, &str> = Exit::interrupt(FiberId::fresh());
        assert!(interrupted.is_failure());
        assert!(interrupted.is_interrupted());
    }

    #[rstest]
    fn test_into_cause_of_done_is_empty() {
        let done: Exit<i32, &str> = Exit::done(1);
        assert_eq!(done.into_cause(), Cause::Empty);
    }

    #[rstest]
    fn test_map_and_map_error() {
        let done: Exit<i32, &str> = Exit::done(21);
        assert_eq!(done.map(|value| value * 2), Exit::done(42));

        let failed: Exit<i32, &str> = Exit::fail("boom");
        assert_eq!(
            failed.map_error(str::len),
            Exit::<i32, usize>::fail(4)
        );
    }

    #[rstest]
    fn test_fold() {
        let done: Exit<i32, &str> = Exit::done(2);
        assert_eq!(done.fold(|_| 0, |value| value), 2);

        let failed: Exit<i32, &str> = Exit::fail("boom");
        assert_eq!(failed.fold(|cause| cause.failures().len() as i32, |value| value), 1);
    }

    #[rstest]
    fn test_from_result() {
        assert_eq!(Exit::<i32, &str>::from(Ok(1)), Exit::done(1));
        assert_eq!(Exit::<i32, &str>::from(Err("boom")), Exit::fail("boom"));
    }
}
