//! Shared outbound rate limiter

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::ToolError;

/// Bounds outbound tool calls in flight.
///
/// Cloning shares the same budget, so one limiter can be handed to every
/// worker of a request or to every request of an orchestrator.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl RateLimiter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a slot; the slot is held until the permit is dropped
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, ToolError> {
        Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| ToolError::Unavailable("rate limiter closed".into()))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}
