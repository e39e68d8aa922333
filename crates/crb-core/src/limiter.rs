use std::{sync::Arc, time::Duration};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::{errors::Error, Result};

/// Counting gate bounding how many tenants may establish a connection at once.
///
/// Waiters are served in FIFO order (tokio's semaphore is fair). A slot is held
/// by a [`LimiterPermit`] and returned when the permit is dropped, so every exit
/// path of the establishing task releases it, including panics and cancellation.
#[derive(Clone, Debug)]
pub struct ConnectionLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// Scoped slot in the [`ConnectionLimiter`].
#[derive(Debug)]
pub struct LimiterPermit {
    _permit: OwnedSemaphorePermit,
}

impl ConnectionLimiter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_use(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }

    /// Suspend the caller until a slot is free.
    pub async fn acquire(&self) -> Result<LimiterPermit> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| Error::External("connection limiter closed".to_string()))?;
        Ok(LimiterPermit { _permit: permit })
    }

    /// Like [`acquire`](Self::acquire) but gives up after `timeout`.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<LimiterPermit> {
        tokio::time::timeout(timeout, self.acquire())
            .await
            .map_err(|_| Error::LimiterTimeout)?
    }
}
