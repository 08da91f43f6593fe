//! Runtimes and the dispatcher boundary.
//!
//! The interpreter never creates threads of its own. Every unit of fiber
//! work is a boxed thunk handed to a [`Dispatch`] implementation, which
//! decides where it runs: [`TokioDispatcher`] spawns thunks onto a tokio
//! runtime for real concurrency, while [`InlineDispatcher`] runs them on
//! the calling thread for deterministic, single-threaded tests.
//!
//! # Examples
//!
//! ```
//! use filament::{Effect, Runtime};
//!
//! let exit = Runtime::inline().run::<_, String>(Effect::succeed("hello"));
//! assert_eq!(exit.into_result(), Ok("hello"));
//! ```

use std::cell::RefCell;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::mpsc;

use tokio::runtime::Handle;

use crate::cause::{Cause, Defect};
use crate::driver::{Driver, Shared};
use crate::effect::Effect;
use crate::exit::Exit;
use crate::fiber::Fiber;

/// Where fiber work runs.
///
/// Implementations only need FIFO-ish fairness: a dispatched thunk must
/// eventually run, and thunks dispatched from one thread should not be
/// indefinitely reordered.
pub trait Dispatch: Send + Sync {
    /// Schedules one unit of work.
    fn dispatch(&self, thunk: Box<dyn FnOnce() + Send>);
}

static GLOBAL_RUNTIME: LazyLock<tokio::runtime::Runtime> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("filament-worker")
        .enable_all()
        .build()
        .expect("failed to initialize the global runtime")
});

thread_local! {
    static CACHED_HANDLE: RefCell<Option<Handle>> = const { RefCell::new(None) };
}

/// A handle to the ambient tokio runtime: the enclosing one when called
/// from inside tokio, the process-wide shared runtime otherwise.
pub(crate) fn tokio_handle() -> Handle {
    CACHED_HANDLE.with(|cell| {
        if let Some(handle) = cell.borrow().as_ref() {
            return handle.clone();
        }
        let handle = Handle::try_current().unwrap_or_else(|_| GLOBAL_RUNTIME.handle().clone());
        *cell.borrow_mut() = Some(handle.clone());
        handle
    })
}

/// Dispatches fiber work onto a tokio runtime.
#[derive(Clone, Debug)]
pub struct TokioDispatcher {
    handle: Handle,
}

impl TokioDispatcher {
    /// A dispatcher backed by the ambient tokio runtime.
    pub fn new() -> Self {
        Self {
            handle: tokio_handle(),
        }
    }

    /// A dispatcher backed by a specific tokio handle.
    pub fn from_handle(handle: Handle) -> Self {
        Self { handle }
    }
}

impl Default for TokioDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatch for TokioDispatcher {
    fn dispatch(&self, thunk: Box<dyn FnOnce() + Send>) {
        self.handle.spawn(async move { thunk() });
    }
}

/// Runs every thunk synchronously on the dispatching thread.
///
/// Execution becomes deterministic: a forked fiber runs to its first
/// suspension point before the parent continues. Intended for tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineDispatcher;

impl Dispatch for InlineDispatcher {
    fn dispatch(&self, thunk: Box<dyn FnOnce() + Send>) {
        thunk();
    }
}

/// The entry point for running effects.
#[derive(Clone)]
pub struct Runtime {
    dispatcher: Arc<dyn Dispatch>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime").finish_non_exhaustive()
    }
}

impl Runtime {
    /// A runtime over a custom dispatcher.
    pub fn new(dispatcher: Arc<dyn Dispatch>) -> Self {
        Self { dispatcher }
    }

    /// A runtime dispatching onto the ambient tokio runtime.
    pub fn global() -> Self {
        Self::new(Arc::new(TokioDispatcher::new()))
    }

    /// A runtime running every fiber on the calling thread.
    pub fn inline() -> Self {
        Self::new(Arc::new(InlineDispatcher))
    }

    /// Starts the effect on a fresh root fiber and returns its handle
    /// without waiting for it.
    pub fn spawn<A, E>(&self, effect: Effect<A, E>) -> Fiber<A, E>
    where
        A: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        let shared = Arc::new(Shared::new(None));
        let driver = Driver::root(Arc::clone(&shared), Arc::clone(&self.dispatcher));
        let instr = effect.into_instr();
        self.dispatcher.dispatch(Box::new(move || driver.run(instr)));
        Fiber::new(shared)
    }

    /// Runs the effect to completion, blocking the calling thread until
    /// its [`Exit`] is available.
    pub fn run<A, E>(&self, effect: Effect<A, E>) -> Exit<A, E>
    where
        A: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        let fiber = self.spawn(effect);
        let (sender, receiver) = mpsc::channel();
        fiber.on_exit(move |exit| {
            let _ = sender.send(exit);
        });
        match receiver.recv() {
            Ok(exit) => exit,
            Err(_) => Exit::Failure(Cause::die(Defect::new(
                "the dispatcher dropped the fiber before it completed",
            ))),
        }
    }
}
