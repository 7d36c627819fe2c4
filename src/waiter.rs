//! Blocking-until-true over asynchronous DOM state.
//!
//! A [`Waiter`] re-checks its condition whenever the surface reports a
//! subtree mutation, or on a fixed interval when no mutation feed exists.
//! Every wait has a deadline and observes the run's [`StopSignal`].

use crate::surface::{ElementState, Surface};
use crate::{Error, Result};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tracing::debug;

/// Re-check interval used when a mutation feed closes mid-wait.
const FALLBACK_POLL: Duration = Duration::from_millis(200);

/// External stop request shared between a session and its active run.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

#[derive(Debug, Default)]
struct StopInner {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Resolves once `stop` has been called.
    pub async fn stopped(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }

    /// Sleep that ends early with [`Error::Cancelled`] on stop.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            _ = self.stopped() => Err(Error::Cancelled),
            _ = tokio::time::sleep(duration) => {
                if self.is_stopped() { Err(Error::Cancelled) } else { Ok(()) }
            }
        }
    }
}

/// How a waiter learns that the condition may have changed.
#[derive(Debug)]
pub enum Detection {
    /// Re-check on every subtree mutation.
    Mutations(broadcast::Receiver<()>),
    /// Re-check on a fixed interval.
    Poll(Duration),
}

impl Clone for Detection {
    fn clone(&self) -> Self {
        match self {
            Detection::Mutations(rx) => Detection::Mutations(rx.resubscribe()),
            Detection::Poll(interval) => Detection::Poll(*interval),
        }
    }
}

impl Detection {
    /// Mutation feed of `surface` when it has one, polling otherwise.
    pub fn for_surface<S: Surface>(surface: &S, poll: Duration) -> Self {
        match surface.changes() {
            Some(rx) => Detection::Mutations(rx),
            None => Detection::Poll(poll),
        }
    }
}

/// Condition waiter bound to one run's stop signal.
#[derive(Debug, Clone)]
pub struct Waiter {
    detection: Detection,
    stop: StopSignal,
}

impl Waiter {
    pub fn new(detection: Detection, stop: StopSignal) -> Self {
        Self { detection, stop }
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    /// Wait until `locate` yields a value for which `is_ready` holds.
    ///
    /// Fails with [`Error::ConditionTimeout`] once `timeout` has elapsed, or
    /// [`Error::Cancelled`] as soon as the stop signal fires.
    pub async fn wait_for<T, L, Fut, R>(
        &self,
        what: &str,
        mut locate: L,
        mut is_ready: R,
        timeout: Duration,
    ) -> Result<T>
    where
        L: FnMut() -> Fut,
        Fut: Future<Output = Option<T>>,
        R: FnMut(&T) -> bool,
    {
        let start = Instant::now();
        let deadline = start + timeout;
        let mut changes = match &self.detection {
            Detection::Mutations(rx) => Some(rx.resubscribe()),
            Detection::Poll(_) => None,
        };
        let poll = match self.detection {
            Detection::Poll(interval) => interval,
            Detection::Mutations(_) => FALLBACK_POLL,
        };

        loop {
            if self.stop.is_stopped() {
                return Err(Error::Cancelled);
            }
            if let Some(found) = locate().await {
                if is_ready(&found) {
                    debug!("wait_for '{}': ready after {:?}", what, start.elapsed());
                    return Ok(found);
                }
            }
            if Instant::now() >= deadline {
                debug!("wait_for '{}': timed out", what);
                return Err(Error::ConditionTimeout {
                    what: what.to_string(),
                    waited_ms: timeout.as_millis() as u64,
                });
            }

            let next_check = match changes {
                Some(_) => deadline,
                None => (Instant::now() + poll).min(deadline),
            };
            tokio::select! {
                _ = self.stop.stopped() => return Err(Error::Cancelled),
                _ = tokio::time::sleep_until(next_check) => {}
                closed = next_change(&mut changes) => {
                    if closed {
                        debug!("wait_for '{}': mutation feed closed, polling", what);
                        changes = None;
                    }
                }
            }
        }
    }

    /// Wait until `predicate` holds.
    pub async fn wait_for_condition<P, Fut>(
        &self,
        what: &str,
        mut predicate: P,
        timeout: Duration,
    ) -> Result<()>
    where
        P: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        self.wait_for(
            what,
            || {
                let check = predicate();
                async move { check.await.then_some(()) }
            },
            |_| true,
            timeout,
        )
        .await
    }

    /// Wait for `selector` to exist and occupy layout space.
    pub async fn wait_for_element<S: Surface>(
        &self,
        surface: &S,
        selector: &str,
        timeout: Duration,
    ) -> Result<ElementState> {
        self.wait_for(
            selector,
            || probe_quiet(surface, selector),
            |el| el.rendered,
            timeout,
        )
        .await
    }
}

/// Probe that treats protocol errors as "not there yet".
pub(crate) async fn probe_quiet<S: Surface>(surface: &S, selector: &str) -> Option<ElementState> {
    match surface.probe(selector).await {
        Ok(state) => state,
        Err(e) => {
            debug!("probe '{}' failed: {}", selector, e);
            None
        }
    }
}

/// Resolves on the next mutation. Returns `true` when the feed has closed.
/// Pends forever when there is no feed so `select!` falls to the timer.
async fn next_change(changes: &mut Option<broadcast::Receiver<()>>) -> bool {
    match changes {
        Some(rx) => match rx.recv().await {
            Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => false,
            Err(broadcast::error::RecvError::Closed) => true,
        },
        None => std::future::pending().await,
    }
}
