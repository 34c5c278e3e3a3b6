use crate::{Fetched, Metrics, Provider, Query, Workers};
use futures::channel::mpsc;
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, trace};

/// The result of a fetch job, delivered to the consumer context.
pub(crate) enum Completion<T, E> {
    Count {
        epoch: u64,
        result: Result<u64, E>,
    },
    Page {
        epoch: u64,
        page: u64,
        result: Result<Fetched<T>, E>,
    },
}

/// Tracks fetches in flight and dispatches new ones to [Workers].
///
/// Every fetch is tagged with the epoch it was issued in. The epoch advances whenever the query is
/// replaced or the collection is refreshed, and results from earlier epochs are stale.
///
/// At most one page fetch per page index (and one count fetch) is in flight per epoch: requesting a
/// page that is already being fetched does nothing, and the caller observes the existing fetch's
/// completion instead.
pub(crate) struct Fetcher<P: Provider> {
    provider: Arc<P>,

    /// The current epoch.
    epoch: u64,

    /// Page fetches in flight, mapped to the epoch they were issued in.
    pages: HashMap<u64, u64>,

    /// The epoch of the count fetch in flight, if any.
    count: Option<u64>,

    /// Jobs dispatched but not yet delivered, including stale ones.
    outstanding: usize,

    sender: mpsc::UnboundedSender<Completion<P::Item, P::Error>>,

    metrics: Metrics,
}

impl<P: Provider> Fetcher<P> {
    /// Creates a new fetcher and the receiver its completions are delivered on.
    pub(crate) fn new(
        provider: Arc<P>,
        metrics: Metrics,
    ) -> (Self, mpsc::UnboundedReceiver<Completion<P::Item, P::Error>>) {
        let (sender, receiver) = mpsc::unbounded();
        (
            Self {
                provider,
                epoch: 0,
                pages: HashMap::new(),
                count: None,
                outstanding: 0,
                sender,
                metrics,
            },
            receiver,
        )
    }

    /// Starts a new epoch, making every fetch in flight stale.
    pub(crate) fn advance(&mut self) -> u64 {
        self.epoch += 1;
        debug!(epoch = self.epoch, "advanced fetch epoch");
        self.epoch
    }

    /// Returns true if a fetch for `page` was issued in the current epoch and has not completed.
    pub(crate) fn is_fetching(&self, page: u64) -> bool {
        self.pages.get(&page) == Some(&self.epoch)
    }

    /// Returns true if any page fetch of the current epoch is in flight.
    pub(crate) fn is_loading(&self) -> bool {
        self.pages.values().any(|epoch| *epoch == self.epoch)
    }

    /// Returns true if a count fetch of the current epoch is in flight.
    pub(crate) fn is_counting(&self) -> bool {
        self.count == Some(self.epoch)
    }

    /// The number of jobs dispatched but not yet delivered.
    pub(crate) const fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Fetches `len` items of `page` unless a fetch for it is already in flight.
    ///
    /// Returns true if a new fetch was dispatched.
    pub(crate) fn fetch_page<W: Workers>(
        &mut self,
        workers: &W,
        query: &Query<P::Filter>,
        page: u64,
        len: usize,
    ) -> bool {
        if self.is_fetching(page) {
            trace!(page, "page fetch already in flight");
            return false;
        }
        self.pages.insert(page, self.epoch);
        self.dispatched();
        self.metrics.fetches.inc();

        let start = page.saturating_mul(len as u64);
        let epoch = self.epoch;
        debug!(page, start, len, epoch, "dispatching page fetch");
        let provider = self.provider.clone();
        let sender = self.sender.clone();
        let query = query.clone();
        workers.execute(move || {
            let result = provider.fetch_range(&query, start, len);
            let _ = sender.unbounded_send(Completion::Page {
                epoch,
                page,
                result,
            });
        });
        true
    }

    /// Fetches the count unless a count fetch is already in flight.
    ///
    /// Returns true if a new fetch was dispatched.
    pub(crate) fn fetch_count<W: Workers>(&mut self, workers: &W, query: &Query<P::Filter>) -> bool {
        if self.is_counting() {
            trace!("count fetch already in flight");
            return false;
        }
        self.count = Some(self.epoch);
        self.dispatched();
        self.metrics.count_fetches.inc();

        let epoch = self.epoch;
        debug!(epoch, "dispatching count fetch");
        let provider = self.provider.clone();
        let sender = self.sender.clone();
        let query = query.clone();
        workers.execute(move || {
            let result = provider.fetch_count(&query);
            let _ = sender.unbounded_send(Completion::Count { epoch, result });
        });
        true
    }

    /// Records the delivery of `completion`, returning true if it belongs to the current epoch.
    pub(crate) fn complete(&mut self, completion: &Completion<P::Item, P::Error>) -> bool {
        self.outstanding = self.outstanding.saturating_sub(1);
        self.metrics.inflight.set(self.outstanding as i64);
        let epoch = match completion {
            Completion::Count { epoch, .. } => {
                if self.count == Some(*epoch) {
                    self.count = None;
                }
                *epoch
            }
            Completion::Page { epoch, page, .. } => {
                if self.pages.get(page) == Some(epoch) {
                    self.pages.remove(page);
                }
                *epoch
            }
        };
        if epoch != self.epoch {
            self.metrics.discarded.inc();
            debug!(epoch, current = self.epoch, "discarding stale fetch result");
            return false;
        }
        true
    }

    fn dispatched(&mut self) {
        self.outstanding += 1;
        self.metrics.inflight.set(self.outstanding as i64);
    }
}
