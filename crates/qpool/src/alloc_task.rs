//! Maintenance task - keeps the pool stocked, recycles dead slots, drains on shutdown.
//!
//! Lifecycle: `Created` → `Running` → `Draining` → `Stopped`.
//!
//! Running:
//! 1. If fewer than `size` slots exist, allocate a new one and publish it.
//! 2. Wait up to `poll_interval` on the dead queue. A withdrawn slot is
//!    destroyed, then reallocated and republished (same slot instance).
//!
//! The dead-queue wait is the only point where cancellation is observed.
//! Allocator calls always run to completion.
//!
//! Draining: withdraw slots from the dead queue, else the live queue, and
//! destroy each until none remain. The kill pill is put back on the live
//! queue whenever it is drawn. Empty polls back off for `drain_backoff`
//! so claimants still holding slots get a chance to return them.
//!
//! The inventory count is owned by the task and published to the stats
//! only at checkpoints. Destroy errors are counted and logged at debug
//! level, never surfaced: a broken destroy path must not stop the loop.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::allocator::Allocator;
use crate::completion::{Completion, CompletionLatch, completion};
use crate::config::PoolConfig;
use crate::error::{AllocationError, ConfigError, DestroyError};
use crate::queue::{Entry, Inventory};
use crate::slot::Slot;
use crate::stats::{PoolStats, StatsCounters};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Created,
    Running,
    Draining,
    Stopped,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single maintenance actor of a pool.
pub struct AllocTask<T, A> {
    config: PoolConfig,
    allocator: A,
    inventory: Inventory<T>,
    /// Slots allocated minus slots destroyed. Only this task writes it.
    size: usize,
    stats: Arc<StatsCounters>,
    state: watch::Sender<TaskState>,
    cancel: CancellationToken,
    latch: CompletionLatch,
}

impl<T, A> AllocTask<T, A>
where
    T: Send + 'static,
    A: Allocator<T>,
{
    /// Validates `config`; an invalid config means the task never exists.
    pub fn new(
        config: PoolConfig,
        allocator: A,
        inventory: Inventory<T>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let (state, _) = watch::channel(TaskState::Created);
        let (latch, _) = completion();

        Ok(Self {
            stats: Arc::new(StatsCounters::new(config.size)),
            config,
            allocator,
            inventory,
            size: 0,
            state,
            cancel: CancellationToken::new(),
            latch,
        })
    }

    /// Use `token` (typically a child of an application-wide token) as the
    /// shutdown request.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn state(&self) -> TaskState {
        *self.state.borrow()
    }

    /// Start the task on the current tokio runtime.
    pub fn spawn(self) -> AllocHandle<T> {
        let inventory = self.inventory.clone();
        let cancel = self.cancel.clone();
        let completion = self.latch.subscribe();
        let state = self.state.subscribe();
        let stats = Arc::clone(&self.stats);

        let join = tokio::spawn(self.run());

        AllocHandle {
            inventory,
            cancel,
            completion,
            state,
            stats,
            kill_pill_sent: AtomicBool::new(false),
            join,
        }
    }

    async fn run(mut self) {
        self.transition(TaskState::Running);
        tracing::info!(
            size = self.config.size,
            ttl_ms = self.config.ttl.as_millis() as u64,
            "Allocation task started"
        );

        self.maintain().await;

        self.transition(TaskState::Draining);
        self.drain().await;

        self.transition(TaskState::Stopped);
        self.latch.release();
    }

    async fn maintain(&mut self) {
        loop {
            if self.size < self.config.size {
                let slot = Slot::new(self.inventory.live().sender());
                self.allocate_and_publish(slot).await;
            }

            let entry = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                entry = self.inventory.dead().poll_timeout(self.config.poll_interval) => entry,
            };

            match entry {
                Some(Entry::Slot(mut slot)) => {
                    tracing::trace!(slot = %slot.id(), "Recycling dead slot");
                    self.destroy(&mut slot).await;
                    self.stats.record_recycle();
                    self.allocate_and_publish(slot).await;
                }
                Some(Entry::KillPill) => {
                    tracing::debug!("Kill pill found on dead queue - moving it to live queue");
                    self.inventory.republish_kill_pill();
                }
                None => {}
            }
        }
    }

    async fn drain(&mut self) {
        tracing::debug!(allocated = self.size, "Draining inventory");

        while self.size > 0 {
            let entry = self
                .inventory
                .dead()
                .try_poll()
                .or_else(|| self.inventory.live().try_poll());

            match entry {
                Some(Entry::Slot(mut slot)) => {
                    self.destroy(&mut slot).await;
                    self.stats.set_allocated(self.size);
                }
                Some(Entry::KillPill) => {
                    tracing::debug!("Kill pill drawn during drain - republishing");
                    self.inventory.republish_kill_pill();
                    tokio::time::sleep(self.config.drain_backoff).await;
                }
                None => tokio::time::sleep(self.config.drain_backoff).await,
            }
        }

        tracing::info!("Inventory drained");
    }

    async fn allocate_and_publish(&mut self, mut slot: Box<Slot<T>>) {
        let outcome = AssertUnwindSafe(self.allocator.allocate())
            .catch_unwind()
            .await;

        let failure = match outcome {
            Ok(Ok(resource)) => match self.validate(&resource) {
                Ok(()) => {
                    slot.fill(resource);
                    None
                }
                Err(e) => Some(e),
            },
            Ok(Err(e)) => Some(e),
            Err(panic) => Some(AllocationError::from_panic(panic)),
        };

        self.stats.record_allocation(failure.is_some());
        if let Some(error) = failure {
            tracing::warn!(slot = %slot.id(), error = %error, "Allocation failed - publishing poisoned slot");
            slot.poison_with(error);
        }

        self.size += 1;
        slot.stamp(self.config.ttl);

        let id = slot.id();
        if let Err(e) = slot.claim().release() {
            // The task holds the inventory, so the live queue cannot close
            // under it.
            tracing::error!(slot = %id, error = %e, "Failed to publish slot");
            self.size -= 1;
        }
        self.stats.set_allocated(self.size);
    }

    /// A rejected (or panicking) check drops the resource without destroy.
    fn validate(&self, resource: &T) -> Result<(), AllocationError> {
        match std::panic::catch_unwind(AssertUnwindSafe(|| self.allocator.is_valid(resource))) {
            Ok(true) => Ok(()),
            Ok(false) => Err(AllocationError::invalid(
                "allocator returned a resource that failed validation",
            )),
            Err(panic) => Err(AllocationError::from_panic(panic)),
        }
    }

    async fn destroy(&mut self, slot: &mut Slot<T>) {
        debug_assert!(self.size > 0, "destroy with empty inventory");
        self.size = self.size.saturating_sub(1);

        let Some(resource) = slot.take_for_destroy() else {
            return;
        };

        let outcome = AssertUnwindSafe(self.allocator.destroy(resource))
            .catch_unwind()
            .await;

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(panic) => Some(DestroyError::from_panic(panic)),
        };

        if let Some(ref error) = failure {
            tracing::debug!(slot = %slot.id(), error = %error, "Destroy failed - ignoring");
        }
        self.stats.record_destroy(failure.is_some());
    }

    fn transition(&self, next: TaskState) {
        let prev = self.state.send_replace(next);
        tracing::debug!(from = %prev, to = %next, "Allocation task state change");
    }
}

/// Handle to a spawned [`AllocTask`].
///
/// Requesting shutdown and observing completion are independent: any
/// number of [`Completion`] clones can wait while one party cancels.
pub struct AllocHandle<T> {
    inventory: Inventory<T>,
    cancel: CancellationToken,
    completion: Completion,
    state: watch::Receiver<TaskState>,
    stats: Arc<StatsCounters>,
    kill_pill_sent: AtomicBool,
    join: JoinHandle<()>,
}

impl<T> AllocHandle<T> {
    pub fn inventory(&self) -> &Inventory<T> {
        &self.inventory
    }

    /// Request shutdown. The task finishes its current step, then drains.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn completion(&self) -> Completion {
        self.completion.clone()
    }

    pub fn state(&self) -> TaskState {
        *self.state.borrow()
    }

    /// Wait until the task has reached `target` (or a later state).
    pub async fn wait_for_state(&self, target: TaskState) -> TaskState {
        let mut rx = self.state.clone();
        let reached = rx.wait_for(|state| *state >= target).await.map(|state| *state);
        // Task gone: report whatever it last published.
        reached.unwrap_or_else(|_| *rx.borrow())
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.snapshot()
    }

    /// Cancel the task, announce shutdown on the live queue (once per
    /// handle), and wait for the drain to finish.
    ///
    /// Returns whether completion was observed (in time, with a timeout).
    /// A task that died before finishing its drain reports `false`.
    pub async fn shutdown_and_wait(&self, timeout: Option<Duration>) -> bool {
        self.shutdown();
        if !self.kill_pill_sent.swap(true, Ordering::AcqRel)
            && let Err(e) = self.inventory.publish_kill_pill()
        {
            tracing::error!(error = %e, "Failed to publish kill pill");
        }

        match timeout {
            Some(timeout) => self.completion.wait_timeout(timeout).await,
            None => self.completion.wait().await.is_ok(),
        }
    }

    /// Await the underlying tokio task.
    pub async fn join(self) -> Result<(), JoinError> {
        self.join.await
    }
}
