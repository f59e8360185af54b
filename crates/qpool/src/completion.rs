//! One-shot, multi-waiter completion signal.
//!
//! The maintenance task owns the [`CompletionLatch`] and releases it once
//! the drain finishes. Any number of [`Completion`] handles can wait on it;
//! waits after the release return immediately.
//!
//! Dropping the latch without releasing it wakes waiters too, but is never
//! reported as a release: `wait` returns [`CompletionError::Abandoned`] and
//! `wait_timeout` returns `false`.

use std::time::Duration;

use tokio::sync::watch;

use crate::error::CompletionError;

pub fn completion() -> (CompletionLatch, Completion) {
    let (tx, rx) = watch::channel(false);
    (CompletionLatch { tx }, Completion { rx })
}

#[derive(Debug)]
pub struct CompletionLatch {
    tx: watch::Sender<bool>,
}

impl CompletionLatch {
    /// Consumes the latch, so release happens at most once.
    pub fn release(self) {
        self.tx.send_replace(true);
    }

    pub fn subscribe(&self) -> Completion {
        Completion {
            rx: self.tx.subscribe(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Completion {
    rx: watch::Receiver<bool>,
}

impl Completion {
    /// Wait, without a deadline, for the latch to be released.
    ///
    /// Fails only if the latch is dropped unreleased.
    pub async fn wait(&self) -> Result<(), CompletionError> {
        let mut rx = self.rx.clone();
        let released = rx.wait_for(|released| *released).await.is_ok();
        if released {
            Ok(())
        } else {
            Err(CompletionError::Abandoned)
        }
    }

    /// Returns whether the latch was released before `timeout` elapsed.
    /// An abandoned latch reports `false` without waiting out the timeout.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        matches!(tokio::time::timeout(timeout, self.wait()).await, Ok(Ok(())))
    }

    pub fn is_released(&self) -> bool {
        *self.rx.borrow()
    }

    /// The latch was dropped without a release.
    pub fn is_abandoned(&self) -> bool {
        !self.is_released() && self.rx.has_changed().is_err()
    }
}
