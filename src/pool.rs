//! Bounded worker pool for request admission.
//!
//! The HTTP surface asks for a slot before starting a resolve; a full pool
//! answers immediately with a rejection instead of queueing, so overload
//! shows up as fast 503s rather than slow everything.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

#[derive(Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl WorkerPool {
    /// Pool bounded at `capacity` concurrent jobs.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { semaphore: Arc::new(Semaphore::new(capacity)), capacity }
    }

    /// Sized for CPU-bound-ish fan-out work: twice the core count.
    pub fn for_cpus() -> Self {
        let cores = std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4);
        Self::new(cores * 2)
    }

    /// Try to claim a slot; `None` means the pool is saturated and the
    /// caller should reject the request. The slot frees itself on drop.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) => {
                debug!(capacity = self.capacity, "worker pool saturated");
                None
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_until_capacity() {
        let pool = WorkerPool::new(2);

        let first = pool.try_acquire();
        let second = pool.try_acquire();
        assert!(first.is_some());
        assert!(second.is_some());
        assert!(pool.try_acquire().is_none());

        drop(first);
        assert!(pool.try_acquire().is_some());
    }

    #[test]
    fn test_capacity_floor() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.capacity(), 1);
        assert!(pool.try_acquire().is_some());
    }
}
