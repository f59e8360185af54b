//! Inventory queues.
//!
//! Two unbounded MPMC hand-off queues connect the maintenance task with
//! consumers:
//! - live: slots available for claim
//! - dead: slots consumers want recycled
//!
//! The kill pill travels on the live queue to tell blocked claimants the
//! pool is shutting down. Whoever draws it puts it back.
//!
//! Raw queue access stays inside the crate. Consumers only ever hold a
//! [`ClaimedSlot`], whose drop guard keeps every slot reachable by the drain.

use std::time::Duration;

use crate::error::SlotError;
use crate::slot::{ClaimedSlot, Slot};

/// What a queue carries: a real slot, or the shutdown sentinel.
pub(crate) enum Entry<T> {
    Slot(Box<Slot<T>>),
    KillPill,
}

impl<T> std::fmt::Debug for Entry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Entry::Slot(slot) => f.debug_tuple("Slot").field(&slot.id()).finish(),
            Entry::KillPill => f.write_str("KillPill"),
        }
    }
}

pub(crate) struct SlotQueue<T> {
    tx: async_channel::Sender<Entry<T>>,
    rx: async_channel::Receiver<Entry<T>>,
}

impl<T> Clone for SlotQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<T> SlotQueue<T> {
    pub(crate) fn unbounded() -> Self {
        let (tx, rx) = async_channel::unbounded();
        Self { tx, rx }
    }

    pub(crate) fn offer(&self, entry: Entry<T>) -> Result<(), SlotError> {
        self.tx.try_send(entry).map_err(|_| SlotError::QueueClosed)
    }

    /// Non-blocking withdrawal.
    pub(crate) fn try_poll(&self) -> Option<Entry<T>> {
        self.rx.try_recv().ok()
    }

    /// Wait up to `timeout` for an entry.
    pub(crate) async fn poll_timeout(&self, timeout: Duration) -> Option<Entry<T>> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Ok(entry)) => Some(entry),
            Ok(Err(_)) => {
                // Closed: every sender is gone. Sleep out the interval so
                // callers looping on this never spin.
                tokio::time::sleep(timeout).await;
                None
            }
            Err(_) => None,
        }
    }

    /// Wait for an entry. `None` only once the queue is closed.
    pub(crate) async fn take(&self) -> Option<Entry<T>> {
        self.rx.recv().await.ok()
    }

    pub(crate) fn len(&self) -> usize {
        self.rx.len()
    }

    pub(crate) fn sender(&self) -> async_channel::Sender<Entry<T>> {
        self.tx.clone()
    }
}

/// The live/dead queue pair shared by the maintenance task and consumers.
pub struct Inventory<T> {
    live: SlotQueue<T>,
    dead: SlotQueue<T>,
}

impl<T> Clone for Inventory<T> {
    fn clone(&self) -> Self {
        Self {
            live: self.live.clone(),
            dead: self.dead.clone(),
        }
    }
}

impl<T> Default for Inventory<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Inventory<T> {
    pub fn new() -> Self {
        Self {
            live: SlotQueue::unbounded(),
            dead: SlotQueue::unbounded(),
        }
    }

    pub(crate) fn live(&self) -> &SlotQueue<T> {
        &self.live
    }

    pub(crate) fn dead(&self) -> &SlotQueue<T> {
        &self.dead
    }

    /// Wait for an available slot.
    ///
    /// Returns `None` when the kill pill is drawn; the pill is put back so
    /// every other claimant sees it too.
    pub async fn claim(&self) -> Option<ClaimedSlot<T>> {
        match self.live.take().await? {
            Entry::Slot(slot) => Some(slot.claim()),
            Entry::KillPill => {
                self.republish_kill_pill();
                None
            }
        }
    }

    /// Like [`claim`](Self::claim) but never waits.
    pub fn try_claim(&self) -> Option<ClaimedSlot<T>> {
        match self.live.try_poll()? {
            Entry::Slot(slot) => Some(slot.claim()),
            Entry::KillPill => {
                self.republish_kill_pill();
                None
            }
        }
    }

    /// Hand a claimed slot to the maintenance task for recycling.
    pub fn retire(&self, slot: ClaimedSlot<T>) -> Result<(), SlotError> {
        match slot.into_inner() {
            Some(slot) => self.dead.offer(Entry::Slot(slot)),
            None => Ok(()),
        }
    }

    /// Announce shutdown to every claimant blocked on the live queue.
    pub fn publish_kill_pill(&self) -> Result<(), SlotError> {
        self.live.offer(Entry::KillPill)
    }

    pub fn live_len(&self) -> usize {
        self.live.len()
    }

    pub fn dead_len(&self) -> usize {
        self.dead.len()
    }

    pub(crate) fn republish_kill_pill(&self) {
        if self.live.offer(Entry::KillPill).is_err() {
            tracing::error!("Live queue closed - kill pill dropped");
        }
    }
}
