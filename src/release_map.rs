//! Keyed finalizer registry backing scoped resource management.
//!
//! A [`ReleaseMap`] collects finalizers as resources are acquired and runs
//! them when the owning scope closes. Registration order is remembered so
//! that teardown can run in reverse, and the map transitions permanently
//! to an exited state the first time [`release_all`](ReleaseMap::release_all)
//! runs: finalizers added afterwards run immediately against the recorded
//! exit instead of being stranded.

use std::collections::BTreeMap;
use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cause::Cause;
use crate::effect::Effect;
use crate::exit::Exit;
use crate::fiber::Fiber;

/// Identifies one registered finalizer within its map.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FinalizerKey(u64);

/// How [`ReleaseMap::release_all`] runs the remaining finalizers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReleaseStrategy {
    /// One after another, in reverse registration order; failures are
    /// merged sequentially.
    Sequential,
    /// Each on its own fiber; failures are merged side by side.
    Parallel,
}

/// A finalizer observes the exit its scope closed with.
pub type Finalizer<E> = Box<dyn FnOnce(&Exit<(), E>) -> Effect<(), E> + Send>;

enum MapState<E> {
    Running {
        next_key: u64,
        finalizers: BTreeMap<u64, Finalizer<E>>,
    },
    Exited {
        next_key: u64,
        exit: Arc<Exit<(), E>>,
    },
}

enum AddDecision<E> {
    Registered(FinalizerKey),
    RunNow(Arc<Exit<(), E>>, Finalizer<E>),
}

/// A cloneable handle to a shared finalizer registry.
///
/// All clones view the same state; the handle is cheap to pass into the
/// effects that need to register cleanup.
pub struct ReleaseMap<E> {
    inner: Arc<Mutex<MapState<E>>>,
}

impl<E> Clone for ReleaseMap<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> std::fmt::Debug for ReleaseMap<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseMap").finish_non_exhaustive()
    }
}

impl<E> Default for ReleaseMap<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> ReleaseMap<E> {
    /// An empty, running map.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MapState::Running {
                next_key: 0,
                finalizers: BTreeMap::new(),
            })),
        }
    }
}

impl<E> ReleaseMap<E>
where
    E: Clone + Send + Sync + 'static,
{
    /// Registers a finalizer to run when the scope closes.
    ///
    /// Yields the finalizer's key while the map is running. If the map has
    /// already exited, the finalizer runs right here against the recorded
    /// exit and the effect yields `None`.
    pub fn add(
        &self,
        finalizer: impl FnOnce(&Exit<(), E>) -> Effect<(), E> + Send + 'static,
    ) -> Effect<Option<FinalizerKey>, E> {
        let inner = Arc::clone(&self.inner);
        Effect::unit().flat_map(move |()| {
            let finalizer: Finalizer<E> = Box::new(finalizer);
            let decision = {
                let mut state = inner.lock();
                match &mut *state {
                    MapState::Running {
                        next_key,
                        finalizers,
                    } => {
                        let key = *next_key;
                        *next_key += 1;
                        finalizers.insert(key, finalizer);
                        AddDecision::Registered(FinalizerKey(key))
                    }
                    MapState::Exited { exit, .. } => {
                        AddDecision::RunNow(Arc::clone(exit), finalizer)
                    }
                }
            };
            match decision {
                AddDecision::Registered(key) => Effect::succeed(Some(key)),
                AddDecision::RunNow(exit, finalizer) => finalizer(&exit).map(|()| None),
            }
        })
    }

    /// Runs and removes the finalizer registered under `key` against the
    /// given exit, yielding whether it was still present.
    pub fn release(&self, key: FinalizerKey, exit: Exit<(), E>) -> Effect<bool, E> {
        let inner = Arc::clone(&self.inner);
        Effect::unit().flat_map(move |()| {
            let taken = {
                let mut state = inner.lock();
                match &mut *state {
                    MapState::Running { finalizers, .. } => finalizers.remove(&key.0),
                    MapState::Exited { .. } => None,
                }
            };
            match taken {
                Some(finalizer) => finalizer(&exit).map(|()| true),
                None => Effect::succeed(false),
            }
        })
    }

    /// Closes the scope: transitions the map to its exited state and runs
    /// every remaining finalizer against `exit`, newest first.
    ///
    /// Finalizer failures never stop the remaining finalizers; they are
    /// merged into this effect's own failure, with [`Cause::then`] under
    /// [`ReleaseStrategy::Sequential`] and [`Cause::both`] under
    /// [`ReleaseStrategy::Parallel`]. A second call finds nothing left to
    /// run and succeeds.
    pub fn release_all(&self, exit: Exit<(), E>, strategy: ReleaseStrategy) -> Effect<(), E> {
        let inner = Arc::clone(&self.inner);
        Effect::unit().flat_map(move |()| {
            let exit = Arc::new(exit);
            let drained = {
                let mut state = inner.lock();
                let placeholder = MapState::Exited {
                    next_key: 0,
                    exit: Arc::clone(&exit),
                };
                match mem::replace(&mut *state, placeholder) {
                    MapState::Running {
                        next_key,
                        finalizers,
                    } => {
                        *state = MapState::Exited {
                            next_key,
                            exit: Arc::clone(&exit),
                        };
                        finalizers
                    }
                    original @ MapState::Exited { .. } => {
                        *state = original;
                        BTreeMap::new()
                    }
                }
            };

            match strategy {
                ReleaseStrategy::Sequential => run_sequential(drained, exit),
                ReleaseStrategy::Parallel => run_parallel(drained, exit),
            }
        })
    }
}

fn run_sequential<E>(
    finalizers: BTreeMap<u64, Finalizer<E>>,
    exit: Arc<Exit<(), E>>,
) -> Effect<(), E>
where
    E: Clone + Send + Sync + 'static,
{
    let mut collected: Effect<Cause<E>, E> = Effect::succeed(Cause::Empty);
    for finalizer in finalizers.into_values().rev() {
        let exit = Arc::clone(&exit);
        collected = collected.flat_map(move |causes| {
            finalizer(&exit)
                .run_exit()
                .map(move |finalizer_exit| Cause::then(causes, finalizer_exit.into_cause()))
        });
    }
    fail_if_nonempty(collected)
}

fn run_parallel<E>(
    finalizers: BTreeMap<u64, Finalizer<E>>,
    exit: Arc<Exit<(), E>>,
) -> Effect<(), E>
where
    E: Clone + Send + Sync + 'static,
{
    let mut forked: Effect<Vec<Fiber<Exit<(), E>, E>>, E> = Effect::succeed(Vec::new());
    for finalizer in finalizers.into_values().rev() {
        let exit = Arc::clone(&exit);
        forked = forked.flat_map(move |mut fibers| {
            finalizer(&exit).run_exit().fork().map(move |fiber| {
                fibers.push(fiber);
                fibers
            })
        });
    }
    let collected = forked.flat_map(|fibers| {
        let mut collected: Effect<Cause<E>, E> = Effect::succeed(Cause::Empty);
        for fiber in fibers {
            collected = collected.flat_map(move |causes| {
                fiber
                    .join()
                    .map(move |finalizer_exit| Cause::both(causes, finalizer_exit.into_cause()))
            });
        }
        collected
    });
    fail_if_nonempty(collected)
}

fn fail_if_nonempty<E>(collected: Effect<Cause<E>, E>) -> Effect<(), E>
where
    E: Clone + Send + Sync + 'static,
{
    collected.flat_map(|causes| {
        if causes.is_empty() {
            Effect::unit()
        } else {
            Effect::fail_cause(causes)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use rstest::rstest;

    fn run<A>(effect: Effect<A, String>) -> Exit<A, String>
    where
        A: Clone + Send + Sync + 'static,
    {
        Runtime::inline().run(effect)
    }

    fn recording(log: &Arc<Mutex<Vec<&'static str>>>, label: &'static str) -> Finalizer<String> {
        let log = Arc::clone(log);
        Box::new(move |_| Effect::sync(move || log.lock().push(label)))
    }

    #[rstest]
    fn test_add_yields_distinct_keys() {
        let map: ReleaseMap<String> = ReleaseMap::new();
        let first = map.add(|_| Effect::unit());
        let second = map.add(|_| Effect::unit());
        let exit = run(first.zip(second));
        let (first, second) = exit.into_result().expect("both adds succeed");
        assert_ne!(first.expect("running"), second.expect("running"));
    }

    #[rstest]
    fn test_release_all_runs_in_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let map: ReleaseMap<String> = ReleaseMap::new();
        let program = map
            .add(recording(&log, "first"))
            .and_then(map.add(recording(&log, "second")))
            .and_then(map.release_all(Exit::Done(()), ReleaseStrategy::Sequential));

        assert!(run(program).is_done());
        assert_eq!(*log.lock(), vec!["second", "first"]);
    }

    #[rstest]
    fn test_release_all_is_idempotent() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let map: ReleaseMap<String> = ReleaseMap::new();
        let program = map
            .add(recording(&log, "only"))
            .and_then(map.release_all(Exit::Done(()), ReleaseStrategy::Sequential))
            .and_then(map.release_all(Exit::Done(()), ReleaseStrategy::Sequential));

        assert!(run(program).is_done());
        assert_eq!(*log.lock(), vec!["only"]);
    }

    #[rstest]
    fn test_add_after_exit_runs_immediately() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let map: ReleaseMap<String> = ReleaseMap::new();
        let program = map
            .release_all(Exit::Done(()), ReleaseStrategy::Sequential)
            .and_then(map.add(recording(&log, "late")));

        let exit = run(program);
        assert_eq!(exit.into_result(), Ok(None));
        assert_eq!(*log.lock(), vec!["late"]);
    }

    #[rstest]
    fn test_release_runs_once_per_key() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let map: ReleaseMap<String> = ReleaseMap::new();
        let map2 = map.clone();
        let program = map
            .add(recording(&log, "keyed"))
            .flat_map(move |key| {
                let key = key.expect("running");
                map2.release(key, Exit::Done(()))
                    .zip(map2.release(key, Exit::Done(())))
            });

        let exit = run(program);
        assert_eq!(exit.into_result(), Ok((true, false)));
        assert_eq!(*log.lock(), vec!["keyed"]);
    }

    #[rstest]
    fn test_sequential_failures_are_merged_not_discarded() {
        let map: ReleaseMap<String> = ReleaseMap::new();
        let program = map
            .add(|_| Effect::fail("first finalizer".to_string()))
            .and_then(map.add(|_| Effect::fail("second finalizer".to_string())))
            .and_then(map.release_all(Exit::Done(()), ReleaseStrategy::Sequential));

        match run(program) {
            Exit::Failure(cause) => {
                let failures: Vec<String> = cause.failures().into_iter().cloned().collect();
                assert_eq!(
                    failures,
                    vec!["second finalizer".to_string(), "first finalizer".to_string()],
                );
            }
            Exit::Done(_) => panic!("expected merged failures"),
        }
    }
}
