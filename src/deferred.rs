//! Bounded Deferred Signal
//!
//! A one-shot signal that the owner settles explicitly, or that resolves
//! itself once its timeout elapses. An elapsed timeout is a successful
//! outcome: "nobody answered" is a valid result that callers proceed from.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// How a deferred signal was settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// Settled by an explicit `resolve()`
    Resolved,
    /// Settled because the timeout elapsed first
    Elapsed,
    /// Settled by an explicit `reject()`
    Rejected(String),
}

struct Inner {
    deadline: Instant,
    slot: watch::Sender<Option<Settlement>>,
}

/// Deferred signal with an upper bound on how long anyone waits for it.
///
/// Cloning yields another handle to the same signal, so the task that
/// answers and the task that waits can hold their own copies.
#[derive(Clone)]
pub struct BoundedDeferred {
    inner: Arc<Inner>,
}

impl BoundedDeferred {
    /// Create a signal that resolves itself after `timeout`
    pub fn new(timeout: Duration) -> Self {
        let (slot, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                deadline: Instant::now() + timeout,
                slot,
            }),
        }
    }

    /// Resolve the signal. Returns false if it was already settled.
    pub fn resolve(&self) -> bool {
        self.settle(Settlement::Resolved)
    }

    /// Reject the signal. Returns false if it was already settled.
    pub fn reject(&self, reason: impl Into<String>) -> bool {
        self.settle(Settlement::Rejected(reason.into()))
    }

    /// Check whether the signal has settled, including by timeout
    pub fn is_settled(&self) -> bool {
        if self.inner.slot.borrow().is_some() {
            return true;
        }
        if Instant::now() >= self.inner.deadline {
            self.settle(Settlement::Elapsed);
            return true;
        }
        false
    }

    /// Current settlement, if any
    pub fn settlement(&self) -> Option<Settlement> {
        self.inner.slot.borrow().clone()
    }

    /// Wait until the signal settles.
    ///
    /// Returns `Err(Error::Rejected)` only for an explicit rejection; a
    /// timeout is reported as `Ok(Settlement::Elapsed)`.
    pub async fn wait(&self) -> Result<Settlement> {
        let mut rx = self.inner.slot.subscribe();

        tokio::select! {
            _ = rx.wait_for(|s| s.is_some()) => {}
            _ = tokio::time::sleep_until(self.inner.deadline) => {
                self.settle(Settlement::Elapsed);
            }
        }

        match self.settlement().unwrap_or(Settlement::Elapsed) {
            Settlement::Rejected(reason) => Err(Error::Rejected(reason)),
            other => Ok(other),
        }
    }

    fn settle(&self, outcome: Settlement) -> bool {
        self.inner.slot.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(outcome);
                true
            } else {
                false
            }
        })
    }
}

impl std::fmt::Debug for BoundedDeferred {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedDeferred")
            .field("settlement", &self.settlement())
            .finish()
    }
}
