//! Resource construction and destruction capability.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{AllocationError, DestroyError};

/// Builds and tears down the resources a pool hands out.
///
/// Only the maintenance task calls these methods, one at a time. Both may
/// fail; neither failure stops the task. A panic is treated like an error.
#[async_trait]
pub trait Allocator<T>: Send + Sync + 'static
where
    T: Send + 'static,
{
    async fn allocate(&self) -> Result<T, AllocationError>;

    /// Never called for a slot whose last allocation failed.
    async fn destroy(&self, resource: T) -> Result<(), DestroyError>;

    /// Checked after a successful `allocate`. A rejected resource is
    /// dropped and `destroy` is never called for it, so rejected values
    /// must not need any teardown beyond their own `Drop`. The slot is
    /// poisoned. A panic here poisons the slot like a panic in `allocate`.
    fn is_valid(&self, _resource: &T) -> bool {
        true
    }
}

#[async_trait]
impl<T, A> Allocator<T> for Arc<A>
where
    T: Send + 'static,
    A: Allocator<T>,
{
    async fn allocate(&self) -> Result<T, AllocationError> {
        (**self).allocate().await
    }

    async fn destroy(&self, resource: T) -> Result<(), DestroyError> {
        (**self).destroy(resource).await
    }

    fn is_valid(&self, resource: &T) -> bool {
        (**self).is_valid(resource)
    }
}
