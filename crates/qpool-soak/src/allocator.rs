//! Synthetic allocator that fails on a fixed cadence.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use qpool::{AllocationError, Allocator, DestroyError};

#[derive(Debug)]
pub struct Conn {
    pub id: u64,
    pub uses: u64,
}

pub struct FlakyAllocator {
    fail_every: u64,
    attempts: AtomicU64,
    live: AtomicI64,
}

impl FlakyAllocator {
    pub fn new(fail_every: u64) -> Self {
        Self {
            fail_every,
            attempts: AtomicU64::new(0),
            live: AtomicI64::new(0),
        }
    }

    /// Resources allocated and not yet destroyed.
    pub fn live_resources(&self) -> i64 {
        self.live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Allocator<Conn> for FlakyAllocator {
    async fn allocate(&self) -> Result<Conn, AllocationError> {
        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        tokio::time::sleep(Duration::from_millis(2)).await;

        if self.fail_every > 0 && attempt % self.fail_every == 0 {
            return Err(AllocationError::failed(format!(
                "synthetic failure on attempt {attempt}"
            )));
        }

        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Conn {
            id: attempt,
            uses: 0,
        })
    }

    async fn destroy(&self, resource: Conn) -> Result<(), DestroyError> {
        self.live.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(conn = resource.id, uses = resource.uses, "Closing connection");
        Ok(())
    }
}
