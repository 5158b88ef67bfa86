//! Admission gate - bounded concurrency for fan-out work.
//!
//! A counting gate built on a Tokio semaphore. Each unit of work holds an
//! [`AdmissionPermit`] while it runs; dropping the permit (including when the
//! task is aborted) re-opens the slot.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl AdmissionGate {
    /// Create a gate admitting at most `capacity` holders (minimum one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> AdmissionPermit {
        // The semaphore is never closed, so this only fails if that changes.
        let permit = Arc::clone(&self.semaphore).acquire_owned().await;
        AdmissionPermit {
            _permit: permit.ok(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Held while a unit of work runs.
pub struct AdmissionPermit {
    _permit: Option<OwnedSemaphorePermit>,
}
