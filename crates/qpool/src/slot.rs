//! Slot - one seat of pool inventory.
//!
//! A slot pairs a resource with its lifecycle metadata. It is always owned
//! by exactly one party: the maintenance task, a queue, or a claimant.
//! Queue hand-off moves the `Box<Slot<T>>`, so nobody can touch a slot they
//! have already enqueued.
//!
//! Claiming uses typestate: `Slot::claim` turns an available slot into a
//! `ClaimedSlot`, and only a `ClaimedSlot` can be released back to the live
//! queue.

use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

use crate::error::{AllocationError, SlotError};
use crate::queue::Entry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(uuid::Uuid);

impl SlotId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for SlotId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct Slot<T> {
    id: SlotId,
    resource: Option<T>,
    poison: Option<AllocationError>,
    expires_at: Instant,
    generation: u64,
    live: async_channel::Sender<Entry<T>>,
}

impl<T> Slot<T> {
    /// An empty slot bound to the live queue it will publish itself into.
    pub(crate) fn new(live: async_channel::Sender<Entry<T>>) -> Box<Self> {
        Box::new(Self {
            id: SlotId::new(),
            resource: None,
            poison: None,
            expires_at: Instant::now(),
            generation: 0,
            live,
        })
    }

    /// Stable across recycle cycles.
    pub fn id(&self) -> SlotId {
        self.id
    }

    /// `None` when the slot is poisoned.
    pub fn resource(&self) -> Option<&T> {
        self.resource.as_ref()
    }

    pub fn resource_mut(&mut self) -> Option<&mut T> {
        self.resource.as_mut()
    }

    /// The failure marker: why the last allocation produced nothing usable.
    pub fn poison(&self) -> Option<&AllocationError> {
        self.poison.as_ref()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poison.is_some()
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Advisory. The maintenance task never evicts on age; consumers retire
    /// expired slots themselves.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Number of allocations performed on this slot instance.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn claim(self: Box<Self>) -> ClaimedSlot<T> {
        ClaimedSlot { slot: Some(self) }
    }

    pub(crate) fn fill(&mut self, resource: T) {
        self.resource = Some(resource);
        self.poison = None;
        self.generation += 1;
    }

    pub(crate) fn poison_with(&mut self, error: AllocationError) {
        self.resource = None;
        self.poison = Some(error);
        self.generation += 1;
    }

    pub(crate) fn stamp(&mut self, ttl: Duration) {
        self.expires_at = Instant::now() + ttl;
    }

    /// Hands the resource to the caller for destruction, unless the slot is
    /// poisoned. Always leaves the slot empty and unpoisoned.
    pub(crate) fn take_for_destroy(&mut self) -> Option<T> {
        let resource = self.resource.take();
        let poisoned = self.poison.take().is_some();
        if poisoned {
            None
        } else {
            resource
        }
    }
}

impl<T> std::fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("id", &self.id)
            .field("has_resource", &self.resource.is_some())
            .field("poison", &self.poison)
            .field("expires_at", &self.expires_at)
            .field("generation", &self.generation)
            .finish()
    }
}

/// A slot held by a single claimant.
///
/// Dropping a claimed slot without `release` (or retiring it through the
/// inventory) publishes it back to the live queue, so it is never lost to
/// the drain.
pub struct ClaimedSlot<T> {
    // Some until released or retired.
    slot: Option<Box<Slot<T>>>,
}

impl<T> ClaimedSlot<T> {
    /// Publish the slot into its live queue, making it available again.
    pub fn release(mut self) -> Result<(), SlotError> {
        match self.slot.take() {
            Some(slot) => publish(slot),
            None => Ok(()),
        }
    }

    pub(crate) fn into_inner(mut self) -> Option<Box<Slot<T>>> {
        self.slot.take()
    }
}

fn publish<T>(slot: Box<Slot<T>>) -> Result<(), SlotError> {
    let live = slot.live.clone();
    live.try_send(Entry::Slot(slot)).map_err(|_| SlotError::QueueClosed)
}

impl<T> Deref for ClaimedSlot<T> {
    type Target = Slot<T>;

    fn deref(&self) -> &Slot<T> {
        self.slot
            .as_deref()
            .expect("claimed slot is present until release")
    }
}

impl<T> DerefMut for ClaimedSlot<T> {
    fn deref_mut(&mut self) -> &mut Slot<T> {
        self.slot
            .as_deref_mut()
            .expect("claimed slot is present until release")
    }
}

impl<T> Drop for ClaimedSlot<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            let id = slot.id();
            tracing::warn!(slot = %id, "Claimed slot dropped without release - returning to live queue");
            if publish(slot).is_err() {
                tracing::error!(slot = %id, "Live queue closed - slot lost");
            }
        }
    }
}
