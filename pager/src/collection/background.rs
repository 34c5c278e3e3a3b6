use super::Core;
use crate::{
    cache::{Cache, Lookup},
    fetcher::{Completion, Fetcher},
    Clock, Collection, Config, Error, Event, Identity, Metrics, Provider, Query, Slot, SystemClock,
    Workers,
};
use futures::{channel::mpsc, StreamExt};
use std::sync::Arc;
use tracing::debug;

/// A [Collection] that never blocks its owner.
///
/// A miss dispatches a fetch of the owning page to [Workers] (unless one is already in flight) and
/// reads as [Slot::Pending]. Completed fetches queue up until the owner applies them, one at a time
/// and in delivery order, with [Collection::process], [Background::step] or [Background::settle].
/// Applying a completion installs its page and publishes any resulting [Event]s before the next
/// completion is considered.
///
/// Until the authoritative count arrives, [Collection::count] reports the previous count (or 0) and
/// indices at or beyond it read as [Slot::Vacant].
pub struct Background<P: Provider, W: Workers, C: Clock = SystemClock> {
    core: Core<P, C>,
    fetcher: Fetcher<P>,
    completions: mpsc::UnboundedReceiver<Completion<P::Item, P::Error>>,
    workers: W,
}

impl<P: Provider, W: Workers> Background<P, W> {
    /// Creates a new collection over `provider` using the system clock and unregistered metrics.
    pub fn new(provider: P, workers: W, cfg: Config) -> Self {
        Self::with_context(provider, workers, SystemClock, Metrics::default(), cfg)
    }
}

impl<P: Provider, W: Workers, C: Clock> Background<P, W, C> {
    /// Creates a new collection over `provider` with an explicit clock and metrics.
    pub fn with_context(provider: P, workers: W, clock: C, metrics: Metrics, cfg: Config) -> Self {
        let provider = Arc::new(provider);
        let (fetcher, completions) = Fetcher::new(provider.clone(), metrics.clone());
        Self {
            core: Core::new(provider, clock, metrics, cfg),
            fetcher,
            completions,
            workers,
        }
    }

    /// Returns true while any page fetch is in flight.
    pub fn is_loading(&self) -> bool {
        self.core.loading
    }

    /// Returns true while the authoritative count is being fetched.
    pub fn is_initializing(&self) -> bool {
        self.core.initializing
    }

    /// The most recent fetch failure, if no fetch has succeeded since.
    pub fn error(&self) -> Option<&Error> {
        self.core.error.as_ref()
    }

    /// The query currently forwarded to the provider.
    pub fn query(&self) -> &Query<P::Filter> {
        &self.core.query
    }

    pub fn cache(&self) -> &Cache<P::Item> {
        &self.core.cache
    }

    /// The number of dispatched fetches whose completions have not been applied, including stale
    /// ones.
    pub fn outstanding(&self) -> usize {
        self.fetcher.outstanding()
    }

    /// Waits for the next completion and applies it.
    ///
    /// Returns false immediately if nothing is outstanding.
    pub async fn step(&mut self) -> bool {
        if self.fetcher.outstanding() == 0 {
            return false;
        }
        let Some(completion) = self.completions.next().await else {
            return false;
        };
        self.complete(completion);
        true
    }

    /// Applies completions until nothing is outstanding, returning how many were applied.
    pub async fn settle(&mut self) -> usize {
        let mut applied = 0;
        while self.step().await {
            applied += 1;
        }
        applied
    }

    fn request_count(&mut self) {
        if self.core.count.is_some() {
            return;
        }
        self.fetcher.fetch_count(&self.workers, &self.core.query);
        self.sync();
    }

    fn complete(&mut self, completion: Completion<P::Item, P::Error>) {
        if self.fetcher.complete(&completion) {
            let changed = match completion {
                Completion::Count { result, .. } => match result {
                    Ok(total) => {
                        debug!(total, "received count");
                        self.core.observe(total, true)
                    }
                    Err(err) => {
                        self.core.fail(err);
                        false
                    }
                },
                Completion::Page { page, result, .. } => match result {
                    Ok(fetched) => self.core.install(page, fetched, true),
                    Err(err) => {
                        self.core.fail(err);
                        false
                    }
                },
            };

            // Fetches still in flight were served against the previous shape.
            if changed {
                self.fetcher.advance();
            }
        }
        self.sync();
    }

    /// Publishes any change to the loading and initializing flags.
    fn sync(&mut self) {
        self.core.set_loading(self.fetcher.is_loading());
        self.core
            .set_initializing(self.fetcher.is_counting() && self.core.count.is_none());
    }
}

impl<P: Provider, W: Workers, C: Clock> Collection for Background<P, W, C> {
    type Item = P::Item;
    type Filter = P::Filter;

    fn identity(&self) -> &Identity {
        &self.core.identity
    }

    fn count(&mut self) -> Result<u64, Error> {
        self.request_count();
        Ok(self.core.best_count())
    }

    fn get(&mut self, index: u64) -> Result<Slot<&P::Item>, Error> {
        self.request_count();
        match self.core.probe(index) {
            Lookup::Hit(()) => {}
            Lookup::Vacant => return Ok(Slot::Vacant),
            Lookup::Miss { page } => {
                let len = self.core.cache.page_size();
                self.fetcher
                    .fetch_page(&self.workers, &self.core.query, page, len);
                self.sync();
                return Ok(Slot::Pending);
            }
        }
        Ok(self.core.cache.item(index).map_or(Slot::Vacant, Slot::Ready))
    }

    fn apply(&mut self, query: Query<P::Filter>) {
        self.core.query = query;
        self.refresh();
    }

    fn refresh(&mut self) {
        self.fetcher.advance();
        self.core.invalidate();
        self.sync();
    }

    fn subscribe(&mut self) -> mpsc::UnboundedReceiver<Event> {
        self.core.subscribe()
    }

    fn process(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(Some(completion)) = self.completions.try_next() {
            self.complete(completion);
            applied += 1;
        }
        applied
    }
}
