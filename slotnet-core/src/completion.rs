//! Single-assignment completion cells.
//!
//! Every asynchronous channel, pool and group operation hands back a
//! [`Completion`]. The outcome is set at most once; every clone observes the
//! same outcome, by blocking, by polling, through a listener or as a
//! [`Future`].

use crate::error::{Result, SlotError};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

type Listener = Box<dyn FnOnce(&Result<()>) + Send>;

#[derive(Default)]
struct State {
    outcome: Option<Result<()>>,
    wakers: Vec<Waker>,
    listeners: Vec<Listener>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    done: Condvar,
}

/// Shared handle to the outcome of one asynchronous operation.
#[derive(Clone, Default)]
pub struct Completion {
    inner: Arc<Inner>,
}

impl Completion {
    /// A pending completion.
    pub fn new() -> Self {
        Self::default()
    }

    /// A completion that already holds `outcome`.
    pub fn ready(outcome: Result<()>) -> Self {
        let completion = Self::new();
        completion.complete(outcome);
        completion
    }

    pub fn succeeded() -> Self {
        Self::ready(Ok(()))
    }

    pub fn failed(error: SlotError) -> Self {
        Self::ready(Err(error))
    }

    /// Set the outcome. Returns `false` if it was already set, in which case
    /// `outcome` is dropped.
    pub fn complete(&self, outcome: Result<()>) -> bool {
        let (wakers, listeners) = {
            let mut state = self.inner.state.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome.clone());
            self.inner.done.notify_all();
            (
                std::mem::take(&mut state.wakers),
                std::mem::take(&mut state.listeners),
            )
        };
        for listener in listeners {
            listener(&outcome);
        }
        for waker in wakers {
            waker.wake();
        }
        true
    }

    pub fn succeed(&self) -> bool {
        self.complete(Ok(()))
    }

    pub fn fail(&self, error: SlotError) -> bool {
        self.complete(Err(error))
    }

    pub fn is_done(&self) -> bool {
        self.inner.state.lock().outcome.is_some()
    }

    /// The outcome, if set.
    pub fn try_get(&self) -> Option<Result<()>> {
        self.inner.state.lock().outcome.clone()
    }

    /// Block until the outcome is set.
    pub fn get(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            self.inner.done.wait(&mut state);
        }
    }

    /// Block up to `timeout`; fails with [`SlotError::Timeout`] if the outcome
    /// is still pending.
    pub fn get_timeout(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            if self.inner.done.wait_until(&mut state, deadline).timed_out() {
                return state.outcome.clone().unwrap_or(Err(SlotError::Timeout));
            }
        }
    }

    /// Run `listener` with the outcome once it is set. Runs immediately, on
    /// the calling thread, when the outcome is already known; otherwise on
    /// whichever thread completes the cell.
    pub fn on_complete<F>(&self, listener: F)
    where
        F: FnOnce(&Result<()>) + Send + 'static,
    {
        let outcome = {
            let mut state = self.inner.state.lock();
            match &state.outcome {
                Some(outcome) => outcome.clone(),
                None => {
                    state.listeners.push(Box::new(listener));
                    return;
                }
            }
        };
        listener(&outcome);
    }

    /// Fan-in: succeeds once every part succeeds, fails with the first
    /// failure. An empty set succeeds immediately.
    pub fn all<I>(parts: I) -> Completion
    where
        I: IntoIterator<Item = Completion>,
    {
        let parts: Vec<Completion> = parts.into_iter().collect();
        let combined = Completion::new();
        if parts.is_empty() {
            combined.succeed();
            return combined;
        }
        let remaining = Arc::new(AtomicUsize::new(parts.len()));
        for part in parts {
            let combined = combined.clone();
            let remaining = Arc::clone(&remaining);
            part.on_complete(move |outcome| match outcome {
                Ok(()) => {
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        combined.succeed();
                    }
                }
                Err(error) => {
                    combined.fail(error.clone());
                }
            });
        }
        combined
    }

    /// Whether two handles refer to the same cell.
    pub fn same(&self, other: &Completion) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Future for Completion {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.inner.state.lock();
        if let Some(outcome) = &state.outcome {
            return Poll::Ready(outcome.clone());
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_get() {
            None => f.write_str("Completion(pending)"),
            Some(Ok(())) => f.write_str("Completion(ok)"),
            Some(Err(e)) => write!(f, "Completion(err: {e})"),
        }
    }
}
