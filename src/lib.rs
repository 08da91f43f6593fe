//! # filament
//!
//! A lightweight effect runtime for Rust: lazy, composable descriptions of
//! concurrent programs with typed errors, structured concurrency, and
//! resource safety.
//!
//! ## Overview
//!
//! The central type is [`Effect<A, E>`]: an immutable description of a
//! computation that produces an `A` or fails with an `E`. Nothing happens
//! when an effect is built; a [`Runtime`] interprets the description on a
//! lightweight fiber. The library includes:
//!
//! - **Typed failures**: the full [`Cause`] algebra distinguishes typed
//!   errors, defects (panics), and interruption, and records how several
//!   failures combined.
//! - **Fibers**: forked effects run on supervised child fibers with
//!   [`Fiber`] handles for joining, polling, and interrupting them.
//! - **Structured concurrency**: a fiber's children never outlive it; a
//!   completing parent interrupts its remaining children and folds their
//!   unreported failures into its own exit.
//! - **Cooperative interruption**: interrupts take effect only at effect
//!   boundaries, and `uninterruptible` regions defer them, so cleanup code
//!   always runs to completion.
//! - **Resource safety**: [`Effect::bracket`] and [`ReleaseMap`] guarantee
//!   release-after-acquire through failure and interruption.
//! - **Async bridge**: [`Effect::async_effect`] turns any callback-based
//!   operation into an effect with cancellation support; timers and
//!   futures ride on tokio.
//!
//! ## Example
//!
//! ```rust
//! use filament::{Effect, Runtime};
//!
//! let program: Effect<i32, String> = Effect::succeed(1)
//!     .map(|n| n + 1)
//!     .flat_map(|n| Effect::succeed(n * 3));
//!
//! let exit = Runtime::inline().run(program);
//! assert_eq!(exit.into_result(), Ok(6));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_panics_doc)]

mod cause;
mod driver;
mod effect;
mod exit;
mod fiber;
mod frame;
mod instruction;
mod release_map;
mod runtime;

pub use cause::{Cause, Defect, FiberId};
pub use driver::FiberDescriptor;
pub use effect::{AsyncCallback, Effect};
pub use exit::Exit;
pub use fiber::Fiber;
pub use release_map::{Finalizer, FinalizerKey, ReleaseMap, ReleaseStrategy};
pub use runtime::{Dispatch, InlineDispatcher, Runtime, TokioDispatcher};

/// Prelude module for convenient imports.
///
/// # Usage
///
/// ```rust
/// use filament::prelude::*;
/// ```
pub mod prelude {
    pub use crate::cause::{Cause, Defect, FiberId};
    pub use crate::driver::FiberDescriptor;
    pub use crate::effect::{AsyncCallback, Effect};
    pub use crate::exit::Exit;
    pub use crate::fiber::Fiber;
    pub use crate::release_map::{FinalizerKey, ReleaseMap, ReleaseStrategy};
    pub use crate::runtime::{Dispatch, InlineDispatcher, Runtime, TokioDispatcher};
}
