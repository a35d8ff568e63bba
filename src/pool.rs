//! Request pool and admission control
//!
//! Caps the number of generation requests driving the engine at once.
//! Admission is strict FIFO: waiters queue on a fair semaphore and are
//! admitted in arrival order as running requests complete. The guard
//! returned by [`RequestPool::acquire`] releases the slot on every exit
//! path (success, error, or task cancellation), so `active` can never
//! leak above the cap.
//!
//! Non-generation endpoints (health, metrics, tokenize) bypass the pool;
//! only requests that launch an engine handle hold a slot.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{Result, ServerError};

/// Point-in-time view of the pool, for `/metrics` and introspection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSnapshot {
    /// Requests currently holding a slot
    pub active: usize,
    /// Requests waiting for admission
    pub queued: usize,
    /// Configured concurrency cap
    pub max_active: usize,
    /// Requests admitted since startup
    pub total_processed: usize,
}

/// Bounded FIFO admission pool for generation requests
#[derive(Debug)]
pub struct RequestPool {
    semaphore: Arc<Semaphore>,
    max_active: usize,
    active: AtomicUsize,
    queued: AtomicUsize,
    total_processed: AtomicUsize,
}

impl RequestPool {
    /// Create a pool admitting at most `max_active` concurrent requests
    #[must_use]
    pub fn new(max_active: usize) -> Arc<Self> {
        let max_active = max_active.max(1);
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(max_active)),
            max_active,
            active: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            total_processed: AtomicUsize::new(0),
        })
    }

    /// Wait for admission and return the slot guard.
    ///
    /// Queued waiters are admitted in FIFO order. Dropping the returned
    /// guard releases the slot and wakes the next waiter.
    pub async fn acquire(self: &Arc<Self>) -> Result<PoolGuard> {
        struct QueueCount<'a>(&'a AtomicUsize);
        impl Drop for QueueCount<'_> {
            fn drop(&mut self) {
                self.0.fetch_sub(1, Ordering::Relaxed);
            }
        }

        self.queued.fetch_add(1, Ordering::Relaxed);
        // Decrements when admitted, and equally when the caller's future is
        // dropped while still waiting (client gone before admission).
        let queue_count = QueueCount(&self.queued);

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ServerError::Engine("request pool closed".to_string()))?;
        drop(queue_count);

        self.active.fetch_add(1, Ordering::Relaxed);
        self.total_processed.fetch_add(1, Ordering::Relaxed);
        Ok(PoolGuard {
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    /// Current pool state
    #[must_use]
    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            active: self.active.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            max_active: self.max_active,
            total_processed: self.total_processed.load(Ordering::Relaxed),
        }
    }

    /// Configured concurrency cap
    #[must_use]
    pub fn max_active(&self) -> usize {
        self.max_active
    }
}

/// Slot held by one admitted request; releasing is automatic on drop
#[derive(Debug)]
pub struct PoolGuard {
    pool: Arc<RequestPool>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        self.pool.active.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let pool = RequestPool::new(2);
        let guard = pool.acquire().await.unwrap();
        assert_eq!(pool.snapshot().active, 1);
        assert_eq!(pool.snapshot().total_processed, 1);
        drop(guard);
        assert_eq!(pool.snapshot().active, 0);
    }

    #[tokio::test]
    async fn test_active_never_exceeds_cap() {
        let pool = RequestPool::new(2);
        let g1 = pool.acquire().await.unwrap();
        let g2 = pool.acquire().await.unwrap();
        assert_eq!(pool.snapshot().active, 2);

        let pool_clone = Arc::clone(&pool);
        let third = tokio::spawn(async move { pool_clone.acquire().await.unwrap() });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let snap = pool.snapshot();
        assert_eq!(snap.active, 2);
        assert_eq!(snap.queued, 1);
        assert!(!third.is_finished());

        drop(g1);
        let g3 = third.await.unwrap();
        let snap = pool.snapshot();
        assert_eq!(snap.active, 2);
        assert_eq!(snap.queued, 0);
        assert_eq!(snap.total_processed, 3);
        drop(g2);
        drop(g3);
        assert_eq!(pool.snapshot().active, 0);
    }

    #[tokio::test]
    async fn test_admission_is_fifo() {
        let pool = RequestPool::new(1);
        let gate = pool.acquire().await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for i in 0..3 {
            let pool_clone = Arc::clone(&pool);
            let tx = tx.clone();
            tokio::spawn(async move {
                let guard = pool_clone.acquire().await.unwrap();
                tx.send(i).unwrap();
                drop(guard);
            });
            // Wait until this waiter is queued before spawning the next so
            // arrival order is deterministic.
            while pool.snapshot().queued <= i {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }

        drop(gate);
        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(rx.recv().await.unwrap());
        }
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_leaves_queue() {
        let pool = RequestPool::new(1);
        let gate = pool.acquire().await.unwrap();

        let pool_clone = Arc::clone(&pool);
        let waiter = tokio::spawn(async move {
            let _ = pool_clone.acquire().await;
        });
        while pool.snapshot().queued == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        waiter.abort();
        let _ = waiter.await;
        assert_eq!(pool.snapshot().queued, 0);

        // The slot is still usable after the cancelled wait.
        drop(gate);
        let guard = pool.acquire().await.unwrap();
        drop(guard);
    }

    #[tokio::test]
    async fn test_zero_cap_is_clamped_to_one() {
        let pool = RequestPool::new(0);
        assert_eq!(pool.max_active(), 1);
        let guard = pool.acquire().await.unwrap();
        drop(guard);
    }
}
