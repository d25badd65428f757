use std::{
    ops::{Deref, DerefMut},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};

use crossbeam_utils::CachePadded;

use super::operation::OperationContext;

/// Snapshot of the operation pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct PoolStats {
    /// Number of contexts allocated since the pool was created.
    pub allocated: usize,
    /// Number of contexts currently idle in the pool.
    pub idle: usize,
    /// Number of contexts currently owned by an operation.
    pub in_flight: usize,
}

struct Free {
    contexts: Vec<OperationContext>,
    shutdown: bool,
}

/// Recycles [`OperationContext`]s to avoid a per-datagram allocation.
///
/// The pool is a mutex-guarded free list. [`OperationPool::acquire`] pops an
/// idle context or allocates a new one. A context goes back to the pool when
/// its [`Lease`] is dropped, whatever the outcome of the operation it served.
///
/// After [`OperationPool::shutdown`] the idle contexts are disposed, and
/// contexts still in flight dispose themselves when their lease is dropped.
pub(crate) struct OperationPool {
    free: Mutex<Free>,
    buffer_size: usize,
    allocated: CachePadded<AtomicUsize>,
    in_flight: CachePadded<AtomicUsize>,
}

impl OperationPool {
    pub(crate) fn new(buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Free {
                contexts: Vec::new(),
                shutdown: false,
            }),
            buffer_size,
            allocated: CachePadded::new(AtomicUsize::new(0)),
            in_flight: CachePadded::new(AtomicUsize::new(0)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Free> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes an idle context, allocating one if the pool is empty.
    pub(crate) fn acquire(self: &Arc<Self>) -> Lease {
        let ctx = self.lock().contexts.pop().unwrap_or_else(|| {
            let id = self.allocated.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(id, "Allocating socket operation context");
            OperationContext::new(id, self.buffer_size)
        });
        debug_assert!(!ctx.is_disposed());
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        Lease {
            pool: self.clone(),
            ctx: Some(ctx),
        }
    }

    fn release(&self, mut ctx: OperationContext) {
        ctx.reset();
        self.in_flight.fetch_sub(1, Ordering::Relaxed);

        let mut free = self.lock();
        if free.shutdown {
            drop(free);
            tracing::trace!(id = ctx.id(), "Disposing context released after shutdown");
            ctx.dispose();
            return;
        }
        free.contexts.push(ctx);
    }

    /// Disposes every idle context and makes later releases dispose theirs.
    ///
    /// Returns the number of contexts disposed by this call. Calling it again
    /// is a no-op.
    pub(crate) fn shutdown(&self) -> usize {
        let mut idle = {
            let mut free = self.lock();
            free.shutdown = true;
            std::mem::take(&mut free.contexts)
        };
        idle.iter_mut().map(OperationContext::dispose).filter(|disposed| *disposed).count()
    }

    pub(crate) fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            idle: self.lock().contexts.len(),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}

/// Exclusive ownership of a pooled [`OperationContext`].
///
/// Dropping the lease resets the context and hands it back to its pool.
pub(crate) struct Lease {
    pool: Arc<OperationPool>,
    ctx: Option<OperationContext>,
}

impl Deref for Lease {
    type Target = OperationContext;

    fn deref(&self) -> &Self::Target {
        // Only taken in `drop`
        self.ctx.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for Lease {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.ctx.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            self.pool.release(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, time::Duration};

    use super::*;

    #[test]
    fn test_recycle() {
        let pool = OperationPool::new(32);
        let id = {
            let lease = pool.acquire();
            assert_eq!(pool.stats().in_flight, 1);
            lease.id()
        };
        assert_eq!(
            pool.stats(),
            PoolStats {
                allocated: 1,
                idle: 1,
                in_flight: 0
            }
        );

        // The same context is handed out again
        let lease = pool.acquire();
        assert_eq!(lease.id(), id);
        assert_eq!(pool.stats().allocated, 1);
    }

    #[test]
    fn test_shutdown_disposes_idle_and_in_flight() {
        let pool = OperationPool::new(32);
        let a = pool.acquire();
        let b = pool.acquire();
        drop(a);

        assert_eq!(pool.shutdown(), 1);
        assert_eq!(pool.shutdown(), 0);

        // In-flight context is disposed on release, not pooled again
        drop(b);
        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_context_shared_under_load() {
        const TASKS: usize = 16;
        const ROUNDS: usize = 500;

        let pool = OperationPool::new(8);
        let in_use = Arc::new(Mutex::new(HashSet::new()));

        let handles: Vec<_> = (0..TASKS)
            .map(|_| {
                let pool = pool.clone();
                let in_use = in_use.clone();
                tokio::spawn(async move {
                    for _ in 0..ROUNDS {
                        let lease = pool.acquire();
                        assert!(in_use.lock().unwrap().insert(lease.id()), "Context handed out twice");
                        tokio::task::yield_now().await;
                        assert!(in_use.lock().unwrap().remove(&lease.id()));
                    }
                })
            })
            .collect();

        for h in handles {
            tokio::time::timeout(Duration::from_secs(10), h).await.unwrap().unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.in_flight, 0);
        assert!(stats.allocated <= TASKS);
        assert_eq!(stats.idle, stats.allocated);
    }
}
