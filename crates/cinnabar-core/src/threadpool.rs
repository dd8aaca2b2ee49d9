//! Fork-join task pool for bulk numeric loops.
//!
//! Kernels decompose work into independent units and hand the pool a total
//! unit count plus an estimated compute cost per unit; the pool decides the
//! grain size. Cheap loops run inline on the calling thread with no thread
//! handoff, which keeps single-threaded hosts deterministic.

use crate::{Error, Result};
use std::ops::Range;

/// Total estimated cost (units × cost-per-unit) below which a loop runs
/// inline rather than forking to workers.
const PARALLEL_COST_THRESHOLD: f64 = 20_000.0;

/// Fixed-size worker pool executing partitioned parallel-for loops.
///
/// Execution is synchronous fork-join: `parallel_for` blocks the invoking
/// thread until every range completes. There is no ordering guarantee
/// between ranges.
pub struct TaskPool {
    pool: Option<rayon::ThreadPool>,
}

impl TaskPool {
    /// Create a pool with the given worker count.
    ///
    /// A count of 1 disables forking entirely; every loop runs inline. A
    /// count of 0 sizes the pool to the machine's available parallelism.
    pub fn new(threads: usize) -> Result<Self> {
        if threads == 1 {
            return Ok(Self::inline());
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("cinnabar-worker-{}", i))
            .build()
            .map_err(|e| Error::RuntimeFault(format!("failed to build thread pool: {}", e)))?;
        Ok(Self { pool: Some(pool) })
    }

    /// A pool that always executes inline on the calling thread.
    pub fn inline() -> Self {
        Self { pool: None }
    }

    /// Number of workers available for forking (1 for an inline pool).
    pub fn degree(&self) -> usize {
        self.pool.as_ref().map_or(1, |p| p.current_num_threads())
    }

    /// Invoke `work` over an exact partition of `[0, total)`.
    ///
    /// Every unit index is covered by exactly one invoked range. If the
    /// total estimated cost (`total * cost_per_unit`) is below an internal
    /// threshold, or the pool is inline, the whole range is executed on the
    /// calling thread with no suspension. Otherwise the units are split into
    /// contiguous ranges balanced across workers, and the call blocks until
    /// all ranges complete.
    ///
    /// `cost_per_unit` is an estimated compute cost (roughly, scalar
    /// operations per unit), not a wall-clock measurement.
    pub fn parallel_for<F>(&self, total: usize, cost_per_unit: f64, work: F)
    where
        F: Fn(Range<usize>) + Sync,
    {
        if total == 0 {
            return;
        }
        let pool = match &self.pool {
            Some(pool) if total as f64 * cost_per_unit >= PARALLEL_COST_THRESHOLD => pool,
            _ => {
                work(0..total);
                return;
            }
        };

        let workers = pool.current_num_threads().max(1).min(total);
        let chunk = total.div_ceil(workers);
        pool.scope(|scope| {
            let work = &work;
            let mut start = 0;
            while start < total {
                let end = (start + chunk).min(total);
                scope.spawn(move |_| work(start..end));
                start = end;
            }
        });
    }
}

impl std::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPool")
            .field("degree", &self.degree())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Every index in [0, total) must be visited exactly once, with no gaps
    /// and no overlaps.
    fn check_exact_partition(pool: &TaskPool, total: usize, cost: f64) {
        let marks: Vec<AtomicUsize> = (0..total).map(|_| AtomicUsize::new(0)).collect();
        pool.parallel_for(total, cost, |range| {
            for i in range {
                marks[i].fetch_add(1, Ordering::SeqCst);
            }
        });
        for (i, mark) in marks.iter().enumerate() {
            assert_eq!(mark.load(Ordering::SeqCst), 1, "index {} visited", i);
        }
    }

    #[test]
    fn test_exact_partition_inline() {
        let pool = TaskPool::inline();
        for total in [0, 1, 7, 1024] {
            check_exact_partition(&pool, total, 1.0);
        }
    }

    #[test]
    fn test_exact_partition_parallel() {
        let pool = TaskPool::new(4).unwrap();
        // High per-unit cost forces the forking path even for small totals.
        for total in [0, 1, 3, 4, 7, 100, 10_000] {
            check_exact_partition(&pool, total, 1e6);
        }
    }

    #[test]
    fn test_cheap_loop_runs_inline() {
        let pool = TaskPool::new(4).unwrap();
        let caller = std::thread::current().id();
        let ran_on_caller = std::sync::atomic::AtomicBool::new(true);
        pool.parallel_for(8, 1.0, |_range| {
            if std::thread::current().id() != caller {
                ran_on_caller.store(false, Ordering::SeqCst);
            }
        });
        assert!(ran_on_caller.load(Ordering::SeqCst));
    }

    #[test]
    fn test_single_thread_pool_is_inline() {
        let pool = TaskPool::new(1).unwrap();
        assert_eq!(pool.degree(), 1);
        check_exact_partition(&pool, 100, 1e9);
    }

    #[test]
    fn test_blocks_until_complete() {
        let pool = TaskPool::new(2).unwrap();
        let counter = AtomicUsize::new(0);
        pool.parallel_for(1000, 1e6, |range| {
            counter.fetch_add(range.len(), Ordering::SeqCst);
        });
        // Fork-join: by the time the call returns, all units ran.
        assert_eq!(counter.load(Ordering::SeqCst), 1000);
    }
}
