//! Cooperative cancellation tokens.
//!
//! A [`CancelToken`] is a lightweight handle propagated through a task's
//! scope and down to every delegated child. Cancellation is cooperative:
//! the agent loop polls the token at suspension points (between streamed
//! chunks, before tool dispatch, between iterations) and aborts with
//! [`AgentError::Cancelled`](crate::error::AgentError::Cancelled) when it
//! fires.
//!
//! Tokens form a tree via [`CancelToken::child`]: cancelling a parent
//! cancels the entire subtree, while cancelling a child leaves the parent
//! (and siblings) running.
//!
//! # Example
//!
//! ```rust
//! use agentmesh::cancel::CancelToken;
//!
//! let root = CancelToken::new();
//! let child = root.child();
//! let grandchild = child.child();
//!
//! child.cancel();
//! assert!(!root.is_cancelled());
//! assert!(child.is_cancelled());
//! assert!(grandchild.is_cancelled());  // descends through the chain
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
    parent: Option<Arc<Inner>>,
}

impl Inner {
    fn is_cancelled(&self) -> bool {
        if self.cancelled.load(Ordering::Acquire) {
            return true;
        }
        match &self.parent {
            Some(parent) => parent.is_cancelled(),
            None => false,
        }
    }
}

/// Cooperative cancellation signal shared across a task scope.
///
/// Cloning produces another handle to the *same* token; use
/// [`child`](CancelToken::child) to derive a token that observes the parent
/// but can also be cancelled independently.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    /// Create a root token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
                parent: None,
            }),
        }
    }

    /// Derive a child token.
    ///
    /// The child reports cancelled when either it or any ancestor has been
    /// cancelled. Cancelling the child does not affect the parent.
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
                parent: Some(Arc::clone(&self.inner)),
            }),
        }
    }

    /// Fire the cancellation signal.
    ///
    /// Idempotent: cancelling an already-cancelled token is a no-op.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::AcqRel) {
            self.inner.notify.notify_waiters();
        }
    }

    /// Whether this token or any ancestor has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Suspend until the token (or an ancestor) is cancelled.
    ///
    /// Ancestor cancellations are observed by polling at notify wakeups, so
    /// callers should prefer racing this against their own work with
    /// `tokio::select!` rather than awaiting it in isolation.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            // Re-check after registering interest to close the notify race.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            match &self.inner.parent {
                Some(parent) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = parent.notify.notified() => {}
                        _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => {}
                    }
                }
                None => notified.await,
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_root_cancel() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        token.cancel(); // idempotent
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_parent_cancels_subtree() {
        let root = CancelToken::new();
        let a = root.child();
        let b = root.child();
        let aa = a.child();
        root.cancel();
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
        assert!(aa.is_cancelled());
    }

    #[test]
    fn test_child_cancel_is_local() {
        let root = CancelToken::new();
        let a = root.child();
        let b = root.child();
        a.cancel();
        assert!(a.is_cancelled());
        assert!(!root.is_cancelled());
        assert!(!b.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        let woke = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(woke);
    }
}
