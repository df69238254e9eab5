//! Bounded worker pools, one per transition index
//!
//! A pool is a semaphore: each migration holds a permit while it runs, so
//! the pool size caps in-flight migrations at that index no matter how many
//! PVs are scheduled. Closing a pool (manual control, shutdown) makes
//! later work run inline on the caller instead of queueing.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

/// Permit pool for one transition index
#[derive(Debug)]
pub struct WorkerPool {
    index: usize,
    size: usize,
    inflight: Arc<Semaphore>,
}

impl WorkerPool {
    /// Pool for `index` allowing `size` concurrent migrations
    #[must_use]
    pub fn new(index: usize, size: usize) -> Self {
        let size = size.max(1);
        Self {
            index,
            size,
            inflight: Arc::new(Semaphore::new(size)),
        }
    }

    /// Pools for indices `0..count`
    #[must_use]
    pub fn for_transitions(count: usize, size: usize) -> Vec<Arc<Self>> {
        (0..count).map(|i| Arc::new(Self::new(i, size))).collect()
    }

    /// Transition index served
    #[inline]
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Configured size
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Permits not currently held
    #[inline]
    #[must_use]
    pub fn available(&self) -> usize {
        self.inflight.available_permits()
    }

    /// Whether the pool has been closed
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inflight.is_closed()
    }

    /// Run `work` while holding a permit
    ///
    /// Waits for a free permit. On a closed pool the work runs inline.
    pub async fn run<F: Future>(&self, work: F) -> F::Output {
        match self.inflight.acquire().await {
            Ok(_permit) => work.await,
            Err(_) => {
                debug!(index = self.index, "pool closed; running inline");
                work.await
            }
        }
    }

    /// Stop handing out permits; work already running keeps its permit
    pub fn close(&self) {
        self.inflight.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn caps_concurrency() {
        let pool = Arc::new(WorkerPool::new(0, 2));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                pool.run(async {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                })
                .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn closed_pool_runs_inline() {
        let pool = WorkerPool::new(1, 1);
        pool.close();
        assert!(pool.is_closed());
        assert_eq!(pool.run(async { 7 }).await, 7);
    }
}
