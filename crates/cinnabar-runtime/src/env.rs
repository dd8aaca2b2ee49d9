//! Process environment: the worker pool and the ambient log level.

use cinnabar_core::{Result, TaskPool};
use std::sync::Arc;

/// Shared process state created once by `Init` and referenced by every
/// session.
pub struct Env {
    task_pool: TaskPool,
    log_level: i32,
}

impl Env {
    /// Create the environment with a worker pool of `threads` workers
    /// (0 = machine parallelism, 1 = inline execution).
    pub fn new(threads: usize, log_level: i32) -> Result<Arc<Self>> {
        let task_pool = TaskPool::new(threads)?;
        tracing::debug!(threads = task_pool.degree(), log_level, "environment ready");
        Ok(Arc::new(Self {
            task_pool,
            log_level,
        }))
    }

    /// The shared worker pool.
    pub fn task_pool(&self) -> &TaskPool {
        &self.task_pool
    }

    /// The log level requested at initialization.
    pub fn log_level(&self) -> i32 {
        self.log_level
    }
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Env")
            .field("threads", &self.task_pool.degree())
            .field("log_level", &self.log_level)
            .finish()
    }
}
