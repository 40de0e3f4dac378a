//! Request-scoped cancellation and deadlines.
//!
//! Every catalog operation takes a [`Context`]. A context is done once it has
//! been cancelled, once its deadline has passed, or once any ancestor is done.
//! Clones share the same cancellation state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, thiserror::Error, Eq, PartialEq)]
pub enum Cancellation {
    #[error("context canceled")]
    Cancelled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Debug)]
struct Inner {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
    parent: Option<Context>,
}

#[derive(Debug, Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

/// Cancels the context it was taken from, and every child of it.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    inner: Arc<Inner>,
}

impl Context {
    /// A context that is never done unless explicitly cancelled.
    #[must_use]
    pub fn background() -> Self {
        Self::from_parts(None, None)
    }

    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::from_parts(Instant::now().checked_add(timeout), None)
    }

    #[must_use]
    pub fn with_deadline(deadline: Instant) -> Self {
        Self::from_parts(Some(deadline), None)
    }

    /// Derive a child that is done when either it or `self` is done. The
    /// child's deadline is the earlier of the two.
    #[must_use]
    pub fn child(&self) -> Self {
        Self::from_parts(self.deadline(), Some(self.clone()))
    }

    #[must_use]
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let own = Instant::now().checked_add(timeout);
        let deadline = match (own, self.deadline()) {
            (Some(own), Some(inherited)) => Some(own.min(inherited)),
            (own, inherited) => own.or(inherited),
        };
        Self::from_parts(deadline, Some(self.clone()))
    }

    fn from_parts(deadline: Option<Instant>, parent: Option<Self>) -> Self {
        Self { inner: Arc::new(Inner { cancelled: AtomicBool::new(false), deadline, parent }) }
    }

    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle { inner: Arc::clone(&self.inner) }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Why the context is done, or `None` while it is still live.
    #[must_use]
    pub fn err(&self) -> Option<Cancellation> {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            return Some(Cancellation::Cancelled);
        }
        if let Some(parent) = &self.inner.parent {
            if let Some(reason) = parent.err() {
                return Some(reason);
            }
        }
        match self.inner.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Cancellation::DeadlineExceeded),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// # Errors
    /// Returns the [`Cancellation`] reason once the context is done.
    pub fn check(&self) -> Result<(), Cancellation> {
        match self.err() {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }
}
