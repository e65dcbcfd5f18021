//! Per-key call coalescing.
//!
//! The first caller for a key becomes the leader and runs the work; callers
//! arriving while it runs wait for and share its outcome. The call is removed
//! from the map as soon as it completes, so the next caller starts a new
//! attempt, unless a successful result is held with
//! [`SingleFlight::run_with_hold`].
//!
//! A cancellable flight whose every waiter gave up stays in the map until its
//! worker returns. Callers arriving meanwhile wait for it to drain before
//! leading a new attempt, so a key never has two fetches running.
//!
//! Lock order is always map, then call.

use crate::lock::acquire_lock;
use crate::{Error, Result};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// How often a cancellable waiter re-checks its token.
const CANCEL_POLL: Duration = Duration::from_millis(5);

/// A cooperative cancellation flag.
///
/// Clones share the flag. Cancelling is permanent.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates an untriggered token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Triggers the token.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Returns `true` once [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct CallState<T> {
    result: Option<Result<T>>,
    waiters: usize,
    interested: usize,
    held_until: Option<Instant>,
}

struct Call<T> {
    state: Mutex<CallState<T>>,
    done: Condvar,
    /// Handed to cancellable work; fires once every participant gave up.
    flight: CancelToken,
}

impl<T: Clone> Call<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(CallState {
                result: None,
                waiters: 0,
                interested: 1,
                held_until: None,
            }),
            done: Condvar::new(),
            flight: CancelToken::new(),
        }
    }

    fn complete(&self, result: Result<T>, hold: Option<Duration>) {
        let mut state = acquire_lock(&self.state);
        state.held_until = match (&result, hold) {
            (Ok(_), Some(hold)) if !hold.is_zero() => Some(Instant::now() + hold),
            _ => None,
        };
        state.result = Some(result);
        let waiters = state.waiters;
        drop(state);
        self.done.notify_all();
        if waiters > 0 {
            tracing::trace!(waiters, "Released singleflight waiters");
        }
    }

    fn wait(&self) -> Result<T> {
        let mut state = acquire_lock(&self.state);
        loop {
            if let Some(result) = &state.result {
                return result.clone();
            }
            state = self
                .done
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Waits until the call completes or `token` fires.
    ///
    /// The second value is `true` when this waiter was the last one
    /// interested, in which case the flight token has been triggered.
    fn wait_cancellable(&self, key: &str, token: &CancelToken) -> (Result<T>, bool) {
        let mut state = acquire_lock(&self.state);
        loop {
            if let Some(result) = &state.result {
                return (result.clone(), false);
            }
            if token.is_cancelled() {
                state.interested = state.interested.saturating_sub(1);
                let last = state.interested == 0;
                if last {
                    self.flight.cancel();
                }
                return (Err(Error::Cancelled(key.to_string())), last);
            }
            state = self
                .done
                .wait_timeout(state, CANCEL_POLL)
                .map_or_else(|poisoned| poisoned.into_inner().0, |(guard, _)| guard);
        }
    }

    /// Blocks until the call completes. Returns `false` if `token` fires
    /// first.
    fn wait_done(&self, token: Option<&CancelToken>) -> bool {
        let mut state = acquire_lock(&self.state);
        while state.result.is_none() {
            if token.is_some_and(CancelToken::is_cancelled) {
                return false;
            }
            state = self
                .done
                .wait_timeout(state, CANCEL_POLL)
                .map_or_else(|poisoned| poisoned.into_inner().0, |(guard, _)| guard);
        }
        true
    }

    fn is_pending(&self) -> bool {
        acquire_lock(&self.state).result.is_none()
    }

    fn is_stale(&self, now: Instant) -> bool {
        let state = acquire_lock(&self.state);
        state.result.is_some() && state.held_until.is_none_or(|until| until <= now)
    }
}

enum Role<T> {
    Leader(Arc<Call<T>>),
    Follower(Arc<Call<T>>),
    /// Abandoned flight whose worker is still running.
    Draining(Arc<Call<T>>),
    Held(Result<T>),
}

type CallMap<T> = Mutex<HashMap<String, Arc<Call<T>>>>;

fn forget<T>(calls: &CallMap<T>, key: &str, call: &Arc<Call<T>>) {
    let mut calls = acquire_lock(calls);
    if calls.get(key).is_some_and(|current| Arc::ptr_eq(current, call)) {
        calls.remove(key);
    }
}

/// Coalesces concurrent work per key.
///
/// `T` is cloned once per waiter, so large values should be wrapped in an
/// `Arc` or kept as bytes.
pub struct SingleFlight<T> {
    calls: Arc<CallMap<T>>,
}

impl<T> std::fmt::Debug for SingleFlight<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight")
            .field("keys", &acquire_lock(&self.calls).len())
            .finish()
    }
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T: Clone> SingleFlight<T> {
    /// Creates an empty group.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of keys with work currently running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        acquire_lock(&self.calls)
            .values()
            .filter(|call| call.is_pending())
            .count()
    }

    fn join(&self, key: &str, sweep: bool) -> Role<T> {
        let now = Instant::now();
        let mut calls = acquire_lock(&self.calls);
        if sweep {
            calls.retain(|_, call| !call.is_stale(now));
        }

        if let Some(call) = calls.get(key) {
            let mut state = acquire_lock(&call.state);
            match &state.result {
                None if !call.flight.is_cancelled() => {
                    state.waiters += 1;
                    state.interested += 1;
                    drop(state);
                    return Role::Follower(Arc::clone(call));
                },
                None => return Role::Draining(Arc::clone(call)),
                Some(Ok(value)) if state.held_until.is_some_and(|until| until > now) => {
                    return Role::Held(Ok(value.clone()));
                },
                _ => {},
            }
        }

        let call = Arc::new(Call::new());
        calls.insert(key.to_string(), Arc::clone(&call));
        Role::Leader(call)
    }

    /// Runs `f` unless a call for `key` is already running, in which case
    /// this waits for and returns that call's outcome.
    ///
    /// If `f` panics, waiters receive [`Error::FetchFailed`] and the panic
    /// continues in the leader.
    ///
    /// # Errors
    ///
    /// Returns the (shared) error of the call.
    pub fn run<F>(&self, key: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        self.run_inner(key, None, f)
    }

    /// Like [`run`](Self::run), but a successful result keeps serving callers
    /// for `hold` after it completes. Failures are never held.
    ///
    /// # Errors
    ///
    /// Returns the (shared) error of the call.
    pub fn run_with_hold<F>(&self, key: &str, hold: Duration, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        self.run_inner(key, Some(hold), f)
    }

    fn run_inner<F>(&self, key: &str, hold: Option<Duration>, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let call = loop {
            match self.join(key, hold.is_some()) {
                Role::Held(result) => {
                    metrics::counter!("singleflight_shared_total").increment(1);
                    return result;
                },
                Role::Follower(call) => {
                    metrics::counter!("singleflight_shared_total").increment(1);
                    return call.wait();
                },
                Role::Draining(call) => {
                    tracing::debug!(key, "Waiting for abandoned flight to finish");
                    call.wait_done(None);
                },
                Role::Leader(call) => break call,
            }
        };

        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(result) => {
                let keep = result.is_ok() && hold.is_some_and(|hold| !hold.is_zero());
                call.complete(result.clone(), hold);
                if !keep {
                    forget(&self.calls, key, &call);
                }
                result
            },
            Err(payload) => {
                tracing::error!(key, "Singleflight leader panicked");
                call.complete(
                    Err(Error::FetchFailed {
                        key: key.to_string(),
                        cause: "fetch panicked".to_string(),
                    }),
                    None,
                );
                forget(&self.calls, key, &call);
                panic::resume_unwind(payload)
            },
        }
    }
}

impl<T: Clone + Send + 'static> SingleFlight<T> {
    /// Runs `f` on a worker thread, coalesced per key, and waits for it
    /// until `token` fires.
    ///
    /// A caller whose token fires stops waiting with [`Error::Cancelled`];
    /// the work keeps running for the remaining waiters. The token passed to
    /// `f` fires only when every waiter has cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] or the (shared) error of the call.
    pub fn run_cancellable<F>(&self, key: &str, token: &CancelToken, f: F) -> Result<T>
    where
        F: FnOnce(&CancelToken) -> Result<T> + Send + 'static,
    {
        let call = loop {
            match self.join(key, false) {
                Role::Held(result) => return result,
                Role::Follower(call) => {
                    metrics::counter!("singleflight_shared_total").increment(1);
                    return Self::wait_cancellable(key, token, &call);
                },
                Role::Draining(call) => {
                    tracing::debug!(key, "Waiting for abandoned flight to finish");
                    if !call.wait_done(Some(token)) {
                        return Err(Error::Cancelled(key.to_string()));
                    }
                },
                Role::Leader(call) => break call,
            }
        };

        let worker_call = Arc::clone(&call);
        let calls = Arc::clone(&self.calls);
        let owned_key = key.to_string();
        let spawned = thread::Builder::new()
            .name("poolkeeper-flight".to_string())
            .spawn(move || {
                let flight = worker_call.flight.clone();
                let result = panic::catch_unwind(AssertUnwindSafe(|| f(&flight)))
                    .unwrap_or_else(|_| {
                        tracing::error!(key = %owned_key, "Singleflight worker panicked");
                        Err(Error::FetchFailed {
                            key: owned_key.clone(),
                            cause: "fetch panicked".to_string(),
                        })
                    });
                worker_call.complete(result, None);
                forget(&calls, &owned_key, &worker_call);
            });

        if let Err(e) = spawned {
            let err = Error::operation_failed("singleflight_spawn", e);
            call.complete(Err(err.clone()), None);
            forget(&self.calls, key, &call);
            return Err(err);
        }

        Self::wait_cancellable(key, token, &call)
    }

    /// The worker removes the call when it returns, abandoned or not.
    fn wait_cancellable(key: &str, token: &CancelToken, call: &Call<T>) -> Result<T> {
        let (result, abandoned) = call.wait_cancellable(key, token);
        if abandoned {
            tracing::debug!(key, "Every waiter cancelled, abandoning flight");
        }
        result
    }
}
