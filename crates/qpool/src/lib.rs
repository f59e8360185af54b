//! qpool: the maintenance core of a queue-based object pool.
//!
//! A single [`AllocTask`] keeps `size` slots allocated, recycles slots that
//! consumers push to the dead queue, and on shutdown drains every slot,
//! destroying each exactly once before releasing its [`Completion`].
//!
//! Consumers interact only through the [`Inventory`] queues and
//! [`ClaimedSlot`].

mod alloc_task;
mod allocator;
mod completion;
mod config;
mod error;
mod queue;
mod slot;
mod stats;

pub use alloc_task::{AllocHandle, AllocTask, TaskState};
pub use allocator::Allocator;
pub use completion::{Completion, CompletionLatch, completion};
pub use config::PoolConfig;
pub use error::{AllocationError, CompletionError, ConfigError, DestroyError, SlotError};
pub use queue::Inventory;
pub use slot::{ClaimedSlot, Slot, SlotId};
pub use stats::PoolStats;
pub use tokio_util::sync::CancellationToken;
