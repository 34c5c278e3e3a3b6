//! Execution strategies for fetch jobs.
//!
//! A fetch job calls the [crate::Provider] and hands its result to a channel owned by the
//! collection. Jobs never touch the cache or collection state, so they may run on any thread.
//!
//! Two implementations are provided:
//!
//! - [Inline]: runs each job immediately on the calling thread. Completions still wait in the
//!   collection's channel until they are processed, so ordering is identical to a pool.
//! - [Pool]: runs jobs on a rayon thread pool.

use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use std::{num::NonZeroUsize, sync::Arc};

/// Runs fetch jobs off the consumer context.
pub trait Workers: Clone + Send + 'static {
    /// Schedules `job` for execution.
    fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static;
}

/// Runs each job on the calling thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct Inline;

impl Workers for Inline {
    fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        job();
    }
}

/// Runs jobs on a shared rayon [ThreadPool].
#[derive(Clone, Debug)]
pub struct Pool {
    thread_pool: Arc<ThreadPool>,
}

impl Pool {
    /// Creates a new [Pool] with the given [ThreadPool].
    pub const fn new(thread_pool: Arc<ThreadPool>) -> Self {
        Self { thread_pool }
    }

    /// Creates a new [Pool] backed by a dedicated thread pool with `threads` workers.
    pub fn with_threads(threads: NonZeroUsize) -> Result<Self, ThreadPoolBuildError> {
        let thread_pool = ThreadPoolBuilder::new()
            .num_threads(threads.get())
            .thread_name(|index| format!("pager-fetch-{index}"))
            .build()?;
        Ok(Self::new(Arc::new(thread_pool)))
    }
}

impl From<Arc<ThreadPool>> for Pool {
    fn from(thread_pool: Arc<ThreadPool>) -> Self {
        Self::new(thread_pool)
    }
}

impl Workers for Pool {
    fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.thread_pool.spawn(job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_inline_runs_immediately() {
        let (sender, receiver) = mpsc::channel();
        Inline.execute(move || sender.send(7).unwrap());
        assert_eq!(receiver.try_recv(), Ok(7));
    }

    #[test]
    fn test_pool_runs_off_thread() {
        let pool = Pool::with_threads(NonZeroUsize::new(2).unwrap()).unwrap();
        let caller = std::thread::current().id();
        let (sender, receiver) = mpsc::channel();
        for _ in 0..4 {
            let sender = sender.clone();
            pool.execute(move || sender.send(std::thread::current().id()).unwrap());
        }
        for _ in 0..4 {
            assert_ne!(receiver.recv().unwrap(), caller);
        }
    }
}
