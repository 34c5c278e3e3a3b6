use crate::{Direction, Fetched, Query, SortDescription};
use std::{
    cmp::Ordering,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};
use thiserror::Error;

/// An item served by the mock [Provider].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Customer {
    pub id: u64,
    pub name: String,
}

impl Customer {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            name: format!("Customer {id}"),
        }
    }
}

/// The filter type accepted by the mock [Provider].
pub type Predicate = Arc<dyn Fn(&Customer) -> bool + Send + Sync>;

/// The error returned by a failing mock [Provider].
#[derive(Clone, Debug, Error)]
#[error("provider unavailable")]
pub struct Failure;

struct Inner {
    customers: Vec<Customer>,
    next: u64,
    failing: bool,
    delay: Option<Duration>,

    /// `(start, len)` of every range fetch, in call order.
    ranges: Vec<(u64, usize)>,
    counts: usize,
}

/// An in-memory [crate::Provider] of [Customer]s.
///
/// Clones share the same dataset and fetch log, so a test can keep a handle after moving the
/// provider into a collection. Customers initially have ids `0..count`. Filters are applied before
/// sort descriptions, which understand the fields `id` and `name`.
#[derive(Clone)]
pub struct Provider {
    inner: Arc<Mutex<Inner>>,
}

impl Provider {
    /// Creates a provider of `count` customers.
    pub fn new(count: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                customers: (0..count).map(Customer::new).collect(),
                next: count,
                failing: false,
                delay: None,
                ranges: Vec::new(),
                counts: 0,
            })),
        }
    }

    /// Makes every subsequent fetch fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.inner.lock().unwrap().failing = failing;
    }

    /// Sleeps for `delay` before serving each fetch.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.inner.lock().unwrap().delay = delay;
    }

    /// Grows or shrinks the dataset to `count` customers.
    pub fn set_count(&self, count: u64) {
        let mut inner = self.inner.lock().unwrap();
        let count = count as usize;
        if count <= inner.customers.len() {
            inner.customers.truncate(count);
            return;
        }
        while inner.customers.len() < count {
            let id = inner.next;
            inner.next += 1;
            inner.customers.push(Customer::new(id));
        }
    }

    /// Appends a new customer, returning its id.
    pub fn insert(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next;
        inner.next += 1;
        inner.customers.push(Customer::new(id));
        id
    }

    /// Removes the last customer, if any.
    pub fn remove(&self) -> Option<Customer> {
        self.inner.lock().unwrap().customers.pop()
    }

    /// The `(start, len)` of every range fetch served so far.
    pub fn ranges(&self) -> Vec<(u64, usize)> {
        self.inner.lock().unwrap().ranges.clone()
    }

    /// The number of range fetches served so far.
    pub fn range_fetches(&self) -> usize {
        self.inner.lock().unwrap().ranges.len()
    }

    /// The number of count fetches served so far.
    pub fn count_fetches(&self) -> usize {
        self.inner.lock().unwrap().counts
    }

    /// Clears the fetch log.
    pub fn clear_log(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.ranges.clear();
        inner.counts = 0;
    }

    fn pause(&self) {
        let delay = self.inner.lock().unwrap().delay;
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
    }
}

fn compare(a: &Customer, b: &Customer, sort: &[SortDescription]) -> Ordering {
    for description in sort {
        let ordering = match description.field.as_str() {
            "name" => a.name.cmp(&b.name),
            _ => a.id.cmp(&b.id),
        };
        let ordering = match description.direction {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn select(customers: &[Customer], query: &Query<Predicate>) -> Vec<Customer> {
    let mut selected: Vec<Customer> = match &query.filter {
        Some(filter) => customers.iter().filter(|c| filter(c)).cloned().collect(),
        None => customers.to_vec(),
    };
    if !query.sort.is_empty() {
        selected.sort_by(|a, b| compare(a, b, &query.sort));
    }
    selected
}

impl crate::Provider for Provider {
    type Item = Customer;
    type Filter = Predicate;
    type Error = Failure;

    fn fetch_count(&self, query: &Query<Predicate>) -> Result<u64, Failure> {
        self.pause();
        let mut inner = self.inner.lock().unwrap();
        inner.counts += 1;
        if inner.failing {
            return Err(Failure);
        }
        let count = match &query.filter {
            Some(filter) => inner.customers.iter().filter(|c| filter(c)).count(),
            None => inner.customers.len(),
        };
        Ok(count as u64)
    }

    fn fetch_range(
        &self,
        query: &Query<Predicate>,
        start: u64,
        len: usize,
    ) -> Result<Fetched<Customer>, Failure> {
        self.pause();
        let mut inner = self.inner.lock().unwrap();
        inner.ranges.push((start, len));
        if inner.failing {
            return Err(Failure);
        }
        let selected = select(&inner.customers, query);
        let total = selected.len() as u64;
        let items = selected
            .into_iter()
            .skip(start as usize)
            .take(len)
            .collect();
        Ok(Fetched { items, total })
    }
}
