use commonware_pager::{Fetched, Provider, Query};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};
use thiserror::Error;
use tracing::trace;

/// A row of the demo dataset.
#[derive(Clone, Debug)]
pub struct Customer {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Error)]
#[error("customer store offline")]
pub struct Offline;

/// Generates customers on demand after a fixed delay, simulating a remote store.
///
/// Clones share the same count, so the store can grow or shrink while a collection reads from it.
#[derive(Clone)]
pub struct Customers {
    count: Arc<AtomicU64>,
    offline: Arc<AtomicBool>,
    delay: Duration,
}

impl Customers {
    pub fn new(count: u64, delay: Duration) -> Self {
        Self {
            count: Arc::new(AtomicU64::new(count)),
            offline: Arc::new(AtomicBool::new(false)),
            delay,
        }
    }

    /// Adds a customer at the end of the store.
    pub fn insert(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    /// Removes the last customer, if any.
    pub fn remove(&self) {
        let _ = self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                count.checked_sub(1)
            });
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn wait(&self) -> Result<u64, Offline> {
        thread::sleep(self.delay);
        if self.offline.load(Ordering::SeqCst) {
            return Err(Offline);
        }
        Ok(self.count.load(Ordering::SeqCst))
    }
}

impl Provider for Customers {
    type Item = Customer;
    type Filter = ();
    type Error = Offline;

    fn fetch_count(&self, _: &Query<()>) -> Result<u64, Offline> {
        let count = self.wait()?;
        trace!(count, "served count");
        Ok(count)
    }

    fn fetch_range(
        &self,
        _: &Query<()>,
        start: u64,
        len: usize,
    ) -> Result<Fetched<Customer>, Offline> {
        let total = self.wait()?;
        let end = start.saturating_add(len as u64).min(total);
        trace!(start, end, "served range");
        let items = (start..end)
            .map(|index| Customer {
                id: index + 1,
                name: format!("Customer {}", index + 1),
            })
            .collect();
        Ok(Fetched { items, total })
    }
}
