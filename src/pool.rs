//! Admission control for top-level sessions.
//!
//! At most `workers` sessions run at once and at most `max_queue_depth` more
//! wait for a worker. A request first reserves a place (running or waiting)
//! with a single atomic counter, then waits its turn on a fair semaphore, so
//! queued requests start in arrival order. Both are released on drop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{RlmError, RlmResult};

#[derive(Debug, Clone)]
pub struct AdmissionControl {
    workers: usize,
    capacity: usize,
    in_flight: Arc<AtomicUsize>,
    permits: Arc<Semaphore>,
}

impl AdmissionControl {
    pub fn new(workers: usize, max_queue_depth: usize) -> Self {
        let workers = workers.max(1);
        Self {
            workers,
            capacity: workers + max_queue_depth,
            in_flight: Arc::new(AtomicUsize::new(0)),
            permits: Arc::new(Semaphore::new(workers)),
        }
    }

    /// Claim a place, or fail with `CapacityExceeded` when every worker is
    /// busy and the queue is full. Never blocks.
    pub fn reserve(&self) -> RlmResult<Reservation> {
        let capacity = self.capacity;
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < capacity).then_some(current + 1)
            })
            .map_err(|in_flight| RlmError::CapacityExceeded {
                in_flight,
                capacity,
            })?;
        Ok(Reservation {
            in_flight: Arc::clone(&self.in_flight),
            permits: Arc::clone(&self.permits),
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Requests holding a place, running or queued.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn running(&self) -> usize {
        self.workers - self.permits.available_permits().min(self.workers)
    }

    pub fn queued(&self) -> usize {
        self.in_flight().saturating_sub(self.running())
    }
}

/// A reserved place in the pool. Dropping it gives the place back.
#[derive(Debug)]
pub struct Reservation {
    in_flight: Arc<AtomicUsize>,
    permits: Arc<Semaphore>,
}

impl Reservation {
    /// Wait, in arrival order, for a free worker.
    pub async fn acquire(self) -> RlmResult<WorkerSlot> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| RlmError::Session("worker pool closed".into()))?;
        Ok(WorkerSlot {
            _permit: permit,
            _reservation: self,
        })
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A running worker. Dropping it frees the worker and the place.
#[derive(Debug)]
pub struct WorkerSlot {
    _permit: OwnedSemaphorePermit,
    _reservation: Reservation,
}
