//! Bounded-concurrency guard for fan-out work
//!
//! Two admission modes: `execute` rejects immediately when the limit is
//! reached (hot-path protection), `run` queues on the semaphore (batch
//! fan-out, where waiting is the point).

use crate::FabricError;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Clone)]
pub struct BulkheadPolicy {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl std::fmt::Debug for BulkheadPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkheadPolicy").field("max_concurrent", &self.max_concurrent).finish()
    }
}

impl BulkheadPolicy {
    pub fn new(max_concurrent: usize) -> Self {
        Self { semaphore: Arc::new(Semaphore::new(max_concurrent)), max_concurrent }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Run the operation if a slot is free, otherwise reject with a
    /// rate-limit error.
    pub async fn execute<T, Fut, Op>(&self, mut operation: Op) -> Result<T, FabricError>
    where
        T: Send,
        Fut: Future<Output = Result<T, FabricError>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let available = self.semaphore.available_permits();
        let in_flight = self.max_concurrent.saturating_sub(available);

        let permit = self.semaphore.try_acquire().map_err(|_| {
            FabricError::rate_limit(format!(
                "bulkhead rejected request ({} in-flight, max {})",
                in_flight, self.max_concurrent
            ))
        })?;

        let result = operation().await;
        drop(permit);
        result
    }

    /// Wait for a slot, then run the operation. Used by batch paths that cap
    /// concurrency without shedding load.
    pub async fn run<T, Fut, Op>(&self, mut operation: Op) -> Result<T, FabricError>
    where
        T: Send,
        Fut: Future<Output = Result<T, FabricError>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| FabricError::system("bulkhead semaphore closed"))?;
        let result = operation().await;
        drop(permit);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn allows_operations_within_limit() {
        let bulkhead = BulkheadPolicy::new(3);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter_clone = counter.clone();
            let result = bulkhead
                .execute(|| {
                    let counter = counter_clone.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, FabricError>(42)
                    }
                })
                .await;
            assert!(result.is_ok());
        }
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rejects_when_at_capacity() {
        let bulkhead = BulkheadPolicy::new(1);
        let gate = Arc::new(tokio::sync::Semaphore::new(0));

        let holder_bulkhead = bulkhead.clone();
        let holder_gate = gate.clone();
        let holder = tokio::spawn(async move {
            holder_bulkhead
                .execute(move || {
                    let gate = holder_gate.clone();
                    async move {
                        let _permit = gate.acquire().await.expect("gate closed");
                        Ok::<_, FabricError>(())
                    }
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;

        let rejected = bulkhead.execute(|| async { Ok::<_, FabricError>(()) }).await;
        assert!(rejected.unwrap_err().is_rate_limit());

        gate.add_permits(1);
        holder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn run_waits_instead_of_rejecting() {
        let bulkhead = BulkheadPolicy::new(2);
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let bulkhead = bulkhead.clone();
            let peak = peak.clone();
            let current = current.clone();
            handles.push(tokio::spawn(async move {
                bulkhead
                    .run(move || {
                        let peak = peak.clone();
                        let current = current.clone();
                        async move {
                            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            current.fetch_sub(1, Ordering::SeqCst);
                            Ok::<_, FabricError>(())
                        }
                    })
                    .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2, "concurrency exceeded the cap");
    }
}
