//! Bounded worker pool for concurrent event analysis.
//!
//! Mirrors the semaphore-gated concurrency idiom used by
//! [`crate::llm::BatchExecutor`]: a fixed number of permits bounds how many
//! perceived events are under orchestration at once, regardless of how many
//! are queued for ingestion.

use std::sync::Arc;

use tokio::sync::{Semaphore, SemaphorePermit};

/// Default worker pool size (spec.md §5: "default 4").
pub const DEFAULT_POOL_SIZE: usize = 4;

/// A bounded pool of analysis slots.
///
/// Acquiring a permit signals that one event has begun orchestration;
/// dropping it frees the slot. When the pool is saturated, callers should
/// treat that as back-pressure and pause their ingestion cursor rather than
/// buffering unboundedly (spec.md §5 "Back-pressure").
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Total configured concurrency.
    pub fn capacity(&self) -> usize {
        self.size
    }

    /// Permits currently available (an approximation under concurrent use).
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Whether the pool has no free slot right now.
    pub fn is_saturated(&self) -> bool {
        self.available_permits() == 0
    }

    /// Acquire a slot, waiting if the pool is saturated.
    pub async fn acquire(&self) -> WorkerSlot<'_> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .expect("worker pool semaphore closed unexpectedly");
        WorkerSlot { _permit: permit }
    }

    /// Try to acquire a slot without waiting; `None` means the pool is
    /// saturated and the caller should apply back-pressure.
    pub fn try_acquire(&self) -> Option<WorkerSlot<'_>> {
        self.semaphore
            .try_acquire()
            .ok()
            .map(|permit| WorkerSlot { _permit: permit })
    }
}

/// An acquired pool slot; the slot is released when this is dropped.
pub struct WorkerSlot<'a> {
    _permit: SemaphorePermit<'a>,
}
