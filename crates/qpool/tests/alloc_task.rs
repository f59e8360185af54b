//! Maintenance task behaviour: top-up, poisoning, recycling, drain.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use qpool::{
    AllocHandle, AllocTask, AllocationError, Allocator, ClaimedSlot, ConfigError, DestroyError,
    Inventory, PoolConfig, TaskState,
};

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
struct Conn {
    id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Allocate(u64),
    Destroy(u64),
}

#[derive(Default)]
struct Recorder {
    next: AtomicU64,
    events: Mutex<Vec<Event>>,
    fail_allocate: AtomicBool,
    panic_allocate: AtomicBool,
    reject_resources: AtomicBool,
    panic_validate: AtomicBool,
    fail_destroy: AtomicBool,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn allocated_ids(&self) -> BTreeSet<u64> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Allocate(id) => Some(id),
                Event::Destroy(_) => None,
            })
            .collect()
    }

    fn destroyed_ids(&self) -> Vec<u64> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Destroy(id) => Some(id),
                Event::Allocate(_) => None,
            })
            .collect()
    }
}

#[async_trait]
impl Allocator<Conn> for Recorder {
    async fn allocate(&self) -> Result<Conn, AllocationError> {
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        self.events.lock().unwrap().push(Event::Allocate(id));

        if self.panic_allocate.load(Ordering::SeqCst) {
            panic!("allocator exploded");
        }
        if self.fail_allocate.load(Ordering::SeqCst) {
            return Err(AllocationError::failed(format!("refused {id}")));
        }
        Ok(Conn { id })
    }

    async fn destroy(&self, resource: Conn) -> Result<(), DestroyError> {
        self.events.lock().unwrap().push(Event::Destroy(resource.id));

        if self.fail_destroy.load(Ordering::SeqCst) {
            return Err(DestroyError::failed(format!("cannot close {}", resource.id)));
        }
        Ok(())
    }

    fn is_valid(&self, _resource: &Conn) -> bool {
        if self.panic_validate.load(Ordering::SeqCst) {
            panic!("validator exploded");
        }
        !self.reject_resources.load(Ordering::SeqCst)
    }
}

fn config(size: usize) -> PoolConfig {
    PoolConfig::new(size).with_ttl(Duration::from_millis(1000))
}

fn spawn(size: usize, recorder: &Arc<Recorder>) -> AllocHandle<Conn> {
    AllocTask::new(config(size), Arc::clone(recorder), Inventory::new())
        .unwrap()
        .spawn()
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_allocated(handle: &AllocHandle<Conn>, n: usize) {
    eventually(&format!("{n} allocated slots"), || {
        handle.stats().allocated == n && handle.inventory().live_len() == n
    })
    .await;
}

fn claim_all(handle: &AllocHandle<Conn>) -> Vec<ClaimedSlot<Conn>> {
    std::iter::from_fn(|| handle.inventory().try_claim()).collect()
}

fn release_all(slots: Vec<ClaimedSlot<Conn>>) {
    for slot in slots {
        slot.release().unwrap();
    }
}

async fn stop(handle: AllocHandle<Conn>) {
    assert!(
        handle.shutdown_and_wait(Some(Duration::from_secs(5))).await,
        "drain did not complete"
    );
    assert_eq!(handle.state(), TaskState::Stopped);
    handle.join().await.unwrap();
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[test]
fn zero_size_never_starts() {
    let recorder = Recorder::new();
    let result = AllocTask::new(
        PoolConfig::new(0),
        Arc::clone(&recorder),
        Inventory::<Conn>::new(),
    );

    assert_eq!(result.err(), Some(ConfigError::InvalidSize { size: 0 }));
    assert!(recorder.events().is_empty());
}

// ---------------------------------------------------------------------------
// Top-up
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn inventory_stabilizes_at_target_size() {
    let recorder = Recorder::new();
    let before = Instant::now();
    let handle = spawn(3, &recorder);

    wait_for_allocated(&handle, 3).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let slots = claim_all(&handle);
    let after = Instant::now();
    assert_eq!(slots.len(), 3);
    for slot in &slots {
        assert!(!slot.is_poisoned());
        assert!(slot.resource().is_some());
        assert!(slot.expires_at() >= before + Duration::from_millis(1000));
        assert!(slot.expires_at() <= after + Duration::from_millis(1000));
    }

    assert_eq!(recorder.allocated_ids().len(), 3);
    assert_eq!(handle.stats().allocated, 3);
    assert_eq!(handle.stats().allocations, 3);

    release_all(slots);
    stop(handle).await;
}

// ---------------------------------------------------------------------------
// Allocation failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_allocation_still_occupies_a_seat() {
    let recorder = Recorder::new();
    recorder.fail_allocate.store(true, Ordering::SeqCst);
    let handle = spawn(2, &recorder);

    wait_for_allocated(&handle, 2).await;

    let slots = claim_all(&handle);
    assert_eq!(slots.len(), 2);
    for slot in &slots {
        assert!(slot.resource().is_none());
        assert!(matches!(slot.poison(), Some(AllocationError::Failed { .. })));
    }
    assert_eq!(handle.stats().allocation_failures, 2);

    release_all(slots);
    stop(handle).await;

    // Poisoned slots are never handed to destroy.
    assert!(recorder.destroyed_ids().is_empty());
}

#[tokio::test]
async fn invalid_resource_poisons_slot() {
    let recorder = Recorder::new();
    recorder.reject_resources.store(true, Ordering::SeqCst);
    let handle = spawn(1, &recorder);

    wait_for_allocated(&handle, 1).await;

    let slot = handle.inventory().try_claim().unwrap();
    assert!(matches!(slot.poison(), Some(AllocationError::Invalid { .. })));
    slot.release().unwrap();

    stop(handle).await;
    assert!(recorder.destroyed_ids().is_empty());
}

#[tokio::test]
async fn panicking_allocator_poisons_slot_and_task_keeps_running() {
    let recorder = Recorder::new();
    recorder.panic_allocate.store(true, Ordering::SeqCst);
    let handle = spawn(2, &recorder);

    wait_for_allocated(&handle, 2).await;
    assert_eq!(handle.state(), TaskState::Running);

    let slot = handle.inventory().try_claim().unwrap();
    assert_eq!(
        slot.poison(),
        Some(&AllocationError::Panicked {
            message: "allocator exploded".to_string()
        })
    );
    slot.release().unwrap();

    stop(handle).await;
}

#[tokio::test]
async fn panicking_validator_poisons_slot_and_task_keeps_running() {
    let recorder = Recorder::new();
    recorder.panic_validate.store(true, Ordering::SeqCst);
    let handle = spawn(2, &recorder);

    wait_for_allocated(&handle, 2).await;
    assert_eq!(handle.state(), TaskState::Running);
    assert!(!handle.completion().is_released());
    assert!(!handle.completion().is_abandoned());

    let slots = claim_all(&handle);
    assert_eq!(slots.len(), 2);
    for slot in &slots {
        assert!(slot.resource().is_none());
        assert_eq!(
            slot.poison(),
            Some(&AllocationError::Panicked {
                message: "validator exploded".to_string()
            })
        );
    }
    assert_eq!(handle.stats().allocation_failures, 2);
    release_all(slots);

    stop(handle).await;
    // The rejected resources were dropped, never destroyed.
    assert!(recorder.destroyed_ids().is_empty());
}

#[tokio::test]
async fn retired_poisoned_slot_is_reallocated_without_destroy() {
    let recorder = Recorder::new();
    recorder.fail_allocate.store(true, Ordering::SeqCst);
    let handle = spawn(1, &recorder);

    wait_for_allocated(&handle, 1).await;
    let slot = handle.inventory().try_claim().unwrap();
    assert!(slot.is_poisoned());
    let id = slot.id();

    recorder.fail_allocate.store(false, Ordering::SeqCst);
    handle.inventory().retire(slot).unwrap();

    eventually("recycle", || handle.stats().recycled == 1).await;
    wait_for_allocated(&handle, 1).await;

    let slot = handle.inventory().try_claim().unwrap();
    assert_eq!(slot.id(), id);
    assert!(!slot.is_poisoned());
    assert_eq!(slot.resource(), Some(&Conn { id: 1 }));
    assert_eq!(
        recorder.events(),
        vec![Event::Allocate(0), Event::Allocate(1)]
    );
    slot.release().unwrap();

    stop(handle).await;
}

// ---------------------------------------------------------------------------
// Recycling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dead_slot_is_destroyed_once_before_reallocation() {
    let recorder = Recorder::new();
    let handle = spawn(1, &recorder);

    wait_for_allocated(&handle, 1).await;
    let slot = handle.inventory().try_claim().unwrap();
    let id = slot.id();
    assert_eq!(slot.resource(), Some(&Conn { id: 0 }));
    assert_eq!(slot.generation(), 1);

    handle.inventory().retire(slot).unwrap();
    eventually("recycle", || handle.stats().recycled == 1).await;
    wait_for_allocated(&handle, 1).await;

    assert_eq!(
        recorder.events(),
        vec![Event::Allocate(0), Event::Destroy(0), Event::Allocate(1)]
    );

    // Same slot instance, fresh resource.
    let slot = handle.inventory().try_claim().unwrap();
    assert_eq!(slot.id(), id);
    assert_eq!(slot.generation(), 2);
    assert_eq!(slot.resource(), Some(&Conn { id: 1 }));
    slot.release().unwrap();

    stop(handle).await;
    assert_eq!(recorder.destroyed_ids(), vec![0, 1]);
}

#[tokio::test]
async fn failing_destroy_does_not_block_reallocation() {
    let recorder = Recorder::new();
    recorder.fail_destroy.store(true, Ordering::SeqCst);
    let handle = spawn(1, &recorder);

    wait_for_allocated(&handle, 1).await;
    let slot = handle.inventory().try_claim().unwrap();
    handle.inventory().retire(slot).unwrap();

    eventually("recycle", || handle.stats().recycled == 1).await;
    wait_for_allocated(&handle, 1).await;

    let slot = handle.inventory().try_claim().unwrap();
    assert!(!slot.is_poisoned());
    assert_eq!(slot.resource(), Some(&Conn { id: 1 }));
    assert_eq!(handle.stats().destroy_failures, 1);
    assert_eq!(handle.state(), TaskState::Running);
    slot.release().unwrap();

    // Destroy keeps failing during the drain; it still completes.
    stop(handle).await;
    assert_eq!(recorder.destroyed_ids(), vec![0, 1]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn recycling_never_dips_published_inventory() {
    let recorder = Recorder::new();
    let handle = spawn(2, &recorder);
    wait_for_allocated(&handle, 2).await;

    let done = AtomicBool::new(false);
    let lowest = AtomicUsize::new(usize::MAX);

    let churn = async {
        for cycle in 1..=5 {
            let slot = handle.inventory().claim().await.unwrap();
            handle.inventory().retire(slot).unwrap();
            eventually("recycle", || handle.stats().recycled == cycle).await;
        }
        done.store(true, Ordering::SeqCst);
    };
    let probe = async {
        while !done.load(Ordering::SeqCst) {
            lowest.fetch_min(handle.stats().allocated, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    };
    tokio::join!(churn, probe);

    assert_eq!(lowest.load(Ordering::SeqCst), 2);
    stop(handle).await;
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_destroys_every_slot_exactly_once() {
    let recorder = Recorder::new();
    let handle = spawn(3, &recorder);
    wait_for_allocated(&handle, 3).await;

    stop_keep_handle(&handle).await;

    let stats = handle.stats();
    assert_eq!(stats.allocated, 0);
    assert_eq!(stats.destroys, 3);

    let mut destroyed = recorder.destroyed_ids();
    destroyed.sort_unstable();
    assert_eq!(destroyed, vec![0, 1, 2]);
    assert_eq!(recorder.allocated_ids(), BTreeSet::from([0, 1, 2]));
}

async fn stop_keep_handle(handle: &AllocHandle<Conn>) {
    assert!(handle.shutdown_and_wait(Some(Duration::from_secs(5))).await);
    assert_eq!(handle.state(), TaskState::Stopped);
}

#[tokio::test]
async fn completion_wait_times_out_while_a_slot_is_held() {
    let recorder = Recorder::new();
    let handle = spawn(1, &recorder);
    wait_for_allocated(&handle, 1).await;

    let held = handle.inventory().try_claim().unwrap();
    handle.shutdown();
    assert_eq!(
        handle.wait_for_state(TaskState::Draining).await,
        TaskState::Draining
    );

    let completion = handle.completion();
    assert!(!completion.wait_timeout(Duration::from_millis(50)).await);
    assert!(!completion.is_released());

    held.release().unwrap();
    assert!(completion.wait_timeout(Duration::from_secs(5)).await);
    assert_eq!(handle.state(), TaskState::Stopped);
    assert_eq!(recorder.destroyed_ids(), vec![0]);
}

#[tokio::test]
async fn kill_pill_survives_the_drain() {
    let recorder = Recorder::new();
    let handle = spawn(2, &recorder);
    wait_for_allocated(&handle, 2).await;

    handle.inventory().publish_kill_pill().unwrap();
    handle.shutdown();
    assert!(handle.completion().wait_timeout(Duration::from_secs(5)).await);

    // Only the pill is left, and it was neither destroyed nor counted.
    assert_eq!(handle.inventory().live_len(), 1);
    assert!(handle.inventory().try_claim().is_none());
    assert_eq!(handle.inventory().live_len(), 1);
    assert_eq!(handle.stats().allocated, 0);
    assert_eq!(handle.stats().destroys, 2);
}

#[tokio::test]
async fn retired_slots_are_drained_from_the_dead_queue() {
    let recorder = Recorder::new();
    let handle = spawn(2, &recorder);
    wait_for_allocated(&handle, 2).await;

    let slots = claim_all(&handle);
    handle.shutdown();
    handle.wait_for_state(TaskState::Draining).await;

    for slot in slots {
        handle.inventory().retire(slot).unwrap();
    }

    assert!(handle.completion().wait_timeout(Duration::from_secs(5)).await);
    assert_eq!(handle.stats().recycled, 0);
    assert_eq!(recorder.destroyed_ids().len(), 2);
    // No reallocation after cancellation.
    assert_eq!(recorder.allocated_ids().len(), 2);
}

#[tokio::test]
async fn abandoned_claims_are_still_drained() {
    let recorder = Recorder::new();
    let handle = spawn(2, &recorder);
    wait_for_allocated(&handle, 2).await;

    // Claims dropped without release or retire, through both claim paths.
    let blocking = handle.inventory().claim().await.unwrap();
    let immediate = handle.inventory().try_claim().unwrap();
    handle.shutdown();
    handle.wait_for_state(TaskState::Draining).await;
    drop(blocking);
    drop(immediate);

    assert!(handle.completion().wait_timeout(Duration::from_secs(5)).await);
    assert_eq!(handle.stats().allocated, 0);
    assert_eq!(recorder.destroyed_ids().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn drain_completes_under_concurrent_claimers() {
    let recorder = Recorder::new();
    let handle = spawn(4, &recorder);
    wait_for_allocated(&handle, 4).await;

    let cycles = Arc::new(AtomicU64::new(0));
    let consumers: Vec<_> = (0..8)
        .map(|n| {
            let inventory = handle.inventory().clone();
            let cycles = Arc::clone(&cycles);
            tokio::spawn(async move {
                let mut i = 0_u64;
                while let Some(slot) = inventory.claim().await {
                    i += 1;
                    cycles.fetch_add(1, Ordering::Relaxed);
                    if (i + n) % 5 == 0 {
                        inventory.retire(slot).unwrap();
                    } else {
                        tokio::task::yield_now().await;
                        slot.release().unwrap();
                    }
                }
            })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        handle.shutdown_and_wait(Some(Duration::from_secs(10))).await,
        "drain stalled"
    );

    for consumer in consumers {
        tokio::time::timeout(Duration::from_secs(5), consumer)
            .await
            .expect("consumer should observe shutdown")
            .unwrap();
    }

    assert!(cycles.load(Ordering::Relaxed) > 0);
    let stats = handle.stats();
    assert_eq!(stats.allocated, 0);

    let mut allocated: Vec<u64> = recorder.allocated_ids().into_iter().collect();
    let mut destroyed = recorder.destroyed_ids();
    allocated.sort_unstable();
    destroyed.sort_unstable();
    assert_eq!(allocated, destroyed);
}

// ---------------------------------------------------------------------------
// Walkthrough: size 2, ttl 1000ms
// ---------------------------------------------------------------------------

#[tokio::test]
async fn two_slot_walkthrough() {
    let recorder = Recorder::new();
    let handle = spawn(2, &recorder);

    wait_for_allocated(&handle, 2).await;
    let slots = claim_all(&handle);
    assert!(slots.iter().all(|s| !s.is_poisoned()));
    let mut slots = slots.into_iter();
    let first = slots.next().unwrap();
    let second = slots.next().unwrap();
    second.release().unwrap();

    handle.inventory().retire(first).unwrap();
    eventually("recycle", || handle.stats().recycled == 1).await;
    wait_for_allocated(&handle, 2).await;
    assert_eq!(recorder.destroyed_ids().len(), 1);

    handle.shutdown();
    assert!(handle.completion().wait_timeout(Duration::from_secs(5)).await);
    assert_eq!(handle.stats().allocated, 0);
    assert_eq!(handle.state(), TaskState::Stopped);
}
