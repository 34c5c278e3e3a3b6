use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

type Job = Box<dyn FnOnce() + Send>;

/// [crate::Workers] that queue jobs until a test runs them.
///
/// Running jobs out of submission order simulates fetches completing out of order.
#[derive(Clone, Default)]
pub struct Queue {
    jobs: Arc<Mutex<VecDeque<Job>>>,
}

impl Queue {
    /// The number of queued jobs.
    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs the oldest queued job, returning false if there was none.
    pub fn run_next(&self) -> bool {
        let job = self.jobs.lock().unwrap().pop_front();
        match job {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Runs the newest queued job, returning false if there was none.
    pub fn run_last(&self) -> bool {
        let job = self.jobs.lock().unwrap().pop_back();
        match job {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Runs queued jobs (including any they queue) until none remain, returning how many ran.
    pub fn run_all(&self) -> usize {
        let mut ran = 0;
        while self.run_next() {
            ran += 1;
        }
        ran
    }
}

impl crate::Workers for Queue {
    fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.jobs.lock().unwrap().push_back(Box::new(job));
    }
}
