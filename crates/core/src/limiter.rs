//! Admission gate bounding simultaneous transfers

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Counting limiter over a fair (FIFO) semaphore.
///
/// Waiters are admitted in arrival order. A slot is returned when the
/// [`Permit`] is dropped, so every exit path of a worker releases it.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    counters: Arc<Counters>,
    capacity: usize,
}

#[derive(Debug, Default)]
struct Counters {
    active: AtomicUsize,
    peak: AtomicUsize,
}

/// Slot held by one active transfer
#[derive(Debug)]
pub struct Permit {
    _permit: OwnedSemaphorePermit,
    counters: Arc<Counters>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.counters.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConcurrencyLimiter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            counters: Arc::new(Counters::default()),
            capacity,
        }
    }

    /// Wait for a free slot
    pub async fn acquire(&self) -> Result<Permit> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| Error::Cancelled)?;
        Ok(self.admit(permit))
    }

    /// Wait for a free slot unless `cancel` fires first
    pub async fn acquire_cancellable(&self, cancel: &CancellationToken) -> Option<Permit> {
        if cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = self.acquire() => permit.ok(),
        }
    }

    fn admit(&self, permit: OwnedSemaphorePermit) -> Permit {
        let now = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(now, Ordering::SeqCst);
        Permit {
            _permit: permit,
            counters: Arc::clone(&self.counters),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Transfers currently holding a slot
    pub fn active(&self) -> usize {
        self.counters.active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous holders seen so far
    pub fn peak(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_never_exceeds_capacity() {
        let limiter = ConcurrencyLimiter::new(3);
        let mut handles = Vec::new();

        for _ in 0..20 {
            let l = limiter.clone();
            handles.push(tokio::spawn(async move {
                let _permit = l.acquire().await.unwrap();
                assert!(l.active() <= 3);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }));
        }

        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(limiter.peak(), 3);
        assert_eq!(limiter.active(), 0);
        assert_eq!(limiter.available(), 3);
    }

    #[tokio::test]
    async fn test_release_on_panic_path() {
        let limiter = ConcurrencyLimiter::new(1);
        let l = limiter.clone();
        let result = tokio::spawn(async move {
            let _permit = l.acquire().await.unwrap();
            panic!("worker blew up");
        })
        .await;

        assert!(result.is_err());
        assert_eq!(limiter.active(), 0);
        // The slot is free again
        let _permit = limiter.acquire().await.unwrap();
        assert_eq!(limiter.active(), 1);
    }

    #[tokio::test]
    async fn test_fifo_wakeup() {
        let limiter = ConcurrencyLimiter::new(1);
        let held = limiter.acquire().await.unwrap();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..4 {
            let l = limiter.clone();
            let o = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _permit = l.acquire().await.unwrap();
                o.lock().unwrap().push(i);
            }));
            // Let the task enqueue before spawning the next one
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        drop(held);
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_gets_nothing() {
        let limiter = ConcurrencyLimiter::new(1);
        let _held = limiter.acquire().await.unwrap();
        let cancel = CancellationToken::new();

        let l = limiter.clone();
        let c = cancel.clone();
        let waiter = tokio::spawn(async move { l.acquire_cancellable(&c).await.is_some() });

        tokio::time::sleep(Duration::from_millis(5)).await;
        cancel.cancel();

        assert!(!waiter.await.unwrap());
        assert_eq!(limiter.active(), 1);
    }

    #[test]
    fn test_acquire_waits_for_release() {
        let limiter = ConcurrencyLimiter::new(1);
        let held = tokio_test::block_on(limiter.acquire()).unwrap();

        let mut waiter = tokio_test::task::spawn(limiter.acquire());
        tokio_test::assert_pending!(waiter.poll());

        drop(held);
        assert!(waiter.is_woken());
        let _permit = tokio_test::assert_ready_ok!(waiter.poll());
        assert_eq!(limiter.active(), 1);
    }

    #[test]
    fn test_zero_capacity_clamped() {
        assert_eq!(ConcurrencyLimiter::new(0).capacity(), 1);
    }
}
