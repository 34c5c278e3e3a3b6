use super::Core;
use crate::{
    cache::{Cache, Lookup},
    Clock, Collection, Config, Error, Event, Identity, Metrics, Provider, Query, Slot, SystemClock,
};
use futures::channel::mpsc;
use std::sync::Arc;
use tracing::debug;

/// A [Collection] that serves misses on the caller's thread.
///
/// There is only one thread of control, so no fetch deduplication is needed: a miss calls the
/// [Provider] and returns once the page is installed.
pub struct Blocking<P: Provider, C: Clock = SystemClock> {
    core: Core<P, C>,
}

impl<P: Provider> Blocking<P> {
    /// Creates a new collection over `provider` using the system clock and unregistered metrics.
    pub fn new(provider: P, cfg: Config) -> Self {
        Self::with_context(provider, SystemClock, Metrics::default(), cfg)
    }
}

impl<P: Provider, C: Clock> Blocking<P, C> {
    /// Creates a new collection over `provider` with an explicit clock and metrics.
    pub fn with_context(provider: P, clock: C, metrics: Metrics, cfg: Config) -> Self {
        Self {
            core: Core::new(Arc::new(provider), clock, metrics, cfg),
        }
    }

    /// Returns true while a page is being fetched.
    pub fn is_loading(&self) -> bool {
        self.core.loading
    }

    /// Returns true while the count is being fetched.
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

    fn fetch_count(&mut self) -> Result<u64, Error> {
        self.core.metrics.count_fetches.inc();
        self.core.set_initializing(true);
        debug!(query = ?self.core.query, "fetching count");
        let result = self.core.provider.fetch_count(&self.core.query);
        self.core.set_initializing(false);
        match result {
            Ok(total) => {
                self.core.observe(total, false);
                Ok(total)
            }
            Err(err) => Err(self.core.fail(err)),
        }
    }

    fn fetch_page(&mut self, page: u64) -> Result<(), Error> {
        let start = self.core.cache.start_of(page);
        let len = self.core.cache.page_size();
        self.core.metrics.fetches.inc();
        self.core.set_loading(true);
        debug!(page, start, len, "fetching page");
        let result = self.core.provider.fetch_range(&self.core.query, start, len);
        self.core.set_loading(false);
        match result {
            Ok(fetched) => {
                self.core.install(page, fetched, false);
                Ok(())
            }
            Err(err) => Err(self.core.fail(err)),
        }
    }
}

impl<P: Provider, C: Clock> Collection for Blocking<P, C> {
    type Item = P::Item;
    type Filter = P::Filter;

    fn identity(&self) -> &Identity {
        &self.core.identity
    }

    fn count(&mut self) -> Result<u64, Error> {
        match self.core.count {
            Some(count) => Ok(count),
            None => self.fetch_count(),
        }
    }

    fn get(&mut self, index: u64) -> Result<Slot<&P::Item>, Error> {
        self.count()?;
        match self.core.probe(index) {
            Lookup::Hit(()) => {}
            Lookup::Vacant => return Ok(Slot::Vacant),
            Lookup::Miss { page } => {
                self.fetch_page(page)?;

                // The fetch may have reported a smaller count.
                if index >= self.core.best_count() {
                    return Ok(Slot::Vacant);
                }
            }
        }
        Ok(self.core.cache.item(index).map_or(Slot::Vacant, Slot::Ready))
    }

    fn apply(&mut self, query: Query<P::Filter>) {
        self.core.query = query;
        self.core.invalidate();
    }

    fn refresh(&mut self) {
        self.core.invalidate();
    }

    fn subscribe(&mut self) -> mpsc::UnboundedReceiver<Event> {
        self.core.subscribe()
    }
}
