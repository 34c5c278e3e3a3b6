//! Indexed access to a virtualized dataset.
//!
//! Two [crate::Collection]s are provided, sharing the same cache and reset semantics:
//!
//! - [Blocking]: misses are served on the caller's thread. Reading an index whose page is not
//!   resident stalls the caller until the [crate::Provider] responds.
//! - [Background]: misses are dispatched to [crate::Workers] and the read returns
//!   [crate::Slot::Pending]. Completions wait in a channel until the owner applies them with
//!   [Background::process], [Background::step] or [Background::settle].
//!
//! # Count
//!
//! The count starts unknown. [Blocking] fetches it on first use and adopts it silently. [Background]
//! reports a provisional value (the previous count, or 0) until the authoritative count arrives and
//! publishes [crate::Event::Reset] if the two differ.
//!
//! Every range fetch also reports the overall count. If it differs from the known count, the shape
//! of the index space has changed: every resident page is dropped, the new count is adopted, a
//! reset is published and only then is the fetched page installed.

use crate::{
    cache::{Cache, Lookup},
    notify::Listeners,
    Clock, Config, Error, Event, Fetched, Identity, Metrics, Provider, Query,
};
use futures::channel::mpsc;
use std::sync::Arc;
use tracing::{debug, warn};

mod background;
pub use background::Background;
mod blocking;
pub use blocking::Blocking;

/// State shared by both collection variants.
///
/// Only the owner of the collection touches this.
struct Core<P: Provider, C: Clock> {
    provider: Arc<P>,
    cache: Cache<P::Item>,
    query: Query<P::Filter>,
    clock: C,
    metrics: Metrics,
    identity: Identity,
    listeners: Listeners,

    /// The authoritative count, if known.
    count: Option<u64>,

    /// The count reported while the authoritative count is unknown.
    provisional: u64,

    loading: bool,
    initializing: bool,

    /// The most recent fetch failure, cleared by the next successful fetch.
    error: Option<Error>,
}

impl<P: Provider, C: Clock> Core<P, C> {
    fn new(provider: Arc<P>, clock: C, metrics: Metrics, cfg: Config) -> Self {
        Self {
            provider,
            cache: Cache::new(
                cfg.page_size,
                cfg.cache_pages,
                cfg.page_timeout,
                metrics.clone(),
            ),
            query: Query::default(),
            clock,
            metrics,
            identity: Identity::default(),
            listeners: Listeners::default(),
            count: None,
            provisional: 0,
            loading: false,
            initializing: false,
            error: None,
        }
    }

    /// The authoritative count if known, otherwise the provisional one.
    fn best_count(&self) -> u64 {
        self.count.unwrap_or(self.provisional)
    }

    /// Classifies `index` against the best-known count and the cache.
    fn probe(&mut self, index: u64) -> Lookup<()> {
        if index >= self.best_count() {
            return Lookup::Vacant;
        }
        let now = self.clock.current();
        self.cache.probe(index, now)
    }

    fn subscribe(&mut self) -> mpsc::UnboundedReceiver<Event> {
        self.listeners.subscribe()
    }

    fn set_loading(&mut self, loading: bool) {
        if self.loading == loading {
            return;
        }
        self.loading = loading;
        self.listeners.publish(Event::Loading(loading));
    }

    fn set_initializing(&mut self, initializing: bool) {
        if self.initializing == initializing {
            return;
        }
        self.initializing = initializing;
        self.listeners.publish(Event::Initializing(initializing));
    }

    /// Records a provider failure.
    fn fail(&mut self, err: P::Error) -> Error {
        warn!(?err, "provider fetch failed");
        self.metrics.failures.inc();
        let err = Error::provider(err);
        self.error = Some(err.clone());
        self.listeners.publish(Event::Failed(err.clone()));
        err
    }

    /// Drops every resident page and forgets the count, keeping it as the provisional value.
    fn invalidate(&mut self) {
        self.provisional = self.best_count();
        self.count = None;
        self.cache.invalidate();
        self.metrics.resets.inc();
        debug!(provisional = self.provisional, "reset collection");
        self.listeners.publish(Event::Reset);
    }

    /// Adopts `total` as the authoritative count, returning true if the shape changed.
    ///
    /// If the count was known and differs, or was unknown and `announce` is set and `total` differs
    /// from the provisional count, every page is dropped and a reset is published.
    fn observe(&mut self, total: u64, announce: bool) -> bool {
        self.error = None;
        let changed = match self.count {
            Some(count) => count != total,
            None => announce && total != self.provisional,
        };
        if !changed {
            self.count = Some(total);
            return false;
        }
        debug!(previous = self.best_count(), total, "count changed");
        self.cache.invalidate();
        self.count = Some(total);
        self.metrics.resets.inc();
        self.listeners.publish(Event::Reset);
        true
    }

    /// Reconciles the count carried by `fetched` and installs its items as `page`, returning true if
    /// the shape changed.
    fn install(&mut self, page: u64, fetched: Fetched<P::Item>, announce: bool) -> bool {
        let changed = self.observe(fetched.total, announce);
        let now = self.clock.current();
        debug!(page, len = fetched.items.len(), "installing page");
        self.cache.install(page, fetched.items, now);
        changed
    }
}
