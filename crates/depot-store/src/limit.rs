//! Concurrency ceiling for outbound requests.
//!
//! Each client owns its own limiter, so concurrent clients in one process
//! never share in-flight counters.

use crate::{DepotError, Result};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounds the number of simultaneously outstanding requests.
///
/// `acquire` suspends callers beyond the capacity; the underlying semaphore
/// is fair, so waiting callers are granted permits in arrival order.
#[derive(Debug, Clone)]
pub struct RequestLimiter {
    permits: Arc<Semaphore>,
    capacity: usize,
}

/// A held concurrency slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct RequestPermit {
    _permit: OwnedSemaphorePermit,
}

impl RequestLimiter {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity.max(1))),
            capacity: capacity.max(1),
        }
    }

    /// Suspend until a slot is free, then take it.
    pub async fn acquire(&self) -> Result<RequestPermit> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DepotError::Other("request limiter closed".to_string()))?;
        Ok(RequestPermit { _permit: permit })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}
