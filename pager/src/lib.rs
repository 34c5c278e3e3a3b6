//! Page a large or remote dataset through a bounded in-memory window.
//!
//! A virtualized collection exposes indexable, sequential and cursor-based access to a dataset
//! that is too large (or too slow) to materialize. Items are fetched from a [Provider] one page at
//! a time, at most [Config::cache_pages] pages stay resident, and the whole window is discarded
//! whenever the shape of the dataset (its count, filter or sort order) changes.
//!
//! # Components
//!
//! - [cache::Cache]: a bounded, recency-ordered page store with optional timeout eviction.
//! - [Blocking]: a [Collection] that fetches on the caller's thread, stalling it on a cache miss.
//! - [Background]: a [Collection] that never blocks. Misses are dispatched to [Workers] and
//!   completions are applied, strictly one at a time, when the owner calls
//!   [Background::process] (or awaits [Background::step]/[Background::settle]).
//! - [View]: current-item tracking, filtering, sorting and deferred refresh over any [Collection].
//!
//! # Consumer Context
//!
//! The owner of a collection is its consumer context: every mutation of cached pages and of
//! observable state happens through `&mut self`. Workers only call the [Provider] and hand back
//! immutable results, so no page can be observed half-installed.
//!
//! # Resets
//!
//! The collection never emits fine-grained add/remove notifications. Whenever the count reported by
//! the provider changes, or the query is replaced, or [Collection::refresh] is called, every page is
//! dropped and a single [Event::Reset] is published to subscribers.
//!
//! # Status
//!
//! `commonware-pager` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.
//!
//! # Example
//!
//! ```rust
//! use commonware_pager::{Blocking, Collection, Config, Fetched, Provider, Query, Slot};
//! use std::{convert::Infallible, num::NonZeroUsize};
//!
//! struct Squares;
//!
//! impl Provider for Squares {
//!     type Item = u64;
//!     type Filter = ();
//!     type Error = Infallible;
//!
//!     fn fetch_count(&self, _: &Query<()>) -> Result<u64, Infallible> {
//!         Ok(1_000)
//!     }
//!
//!     fn fetch_range(&self, _: &Query<()>, start: u64, len: usize) -> Result<Fetched<u64>, Infallible> {
//!         let end = (start + len as u64).min(1_000);
//!         Ok(Fetched {
//!             items: (start..end).map(|i| i * i).collect(),
//!             total: 1_000,
//!         })
//!     }
//! }
//!
//! let cfg = Config {
//!     page_size: NonZeroUsize::new(100).unwrap(),
//!     cache_pages: NonZeroUsize::new(3).unwrap(),
//!     page_timeout: None,
//! };
//! let mut squares = Blocking::new(Squares, cfg);
//! assert_eq!(squares.count().unwrap(), 1_000);
//! assert_eq!(squares.get(12).unwrap(), Slot::Ready(&144));
//! assert_eq!(squares.get(1_000).unwrap(), Slot::Vacant);
//! ```

#![doc(
    html_logo_url = "https://commonware.xyz/imgs/rustdoc_logo.svg",
    html_favicon_url = "https://commonware.xyz/favicon.ico"
)]

use futures::channel::mpsc;
use std::{
    fmt,
    hash::{Hash, Hasher},
    num::NonZeroUsize,
    sync::Arc,
    time::{Duration, SystemTime},
};
use thiserror::Error;

pub mod cache;
pub mod collection;
mod fetcher;
mod metrics;
#[cfg(any(test, feature = "mocks"))]
pub mod mocks;
mod notify;
pub mod view;
pub mod workers;

pub use collection::{Background, Blocking};
pub use metrics::Metrics;
pub use view::{Cursor, Deferral, View};
pub use workers::{Inline, Pool, Workers};

/// Errors that can occur when reading from a virtualized collection.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The [Provider] failed to serve a count or a range. The affected page stays absent and is
    /// fetched again on the next access.
    #[error("provider failed: {0}")]
    Provider(Arc<dyn std::error::Error + Send + Sync>),
    /// The [View] is inside a [Deferral] and its cursor is not valid until the refresh runs.
    #[error("refresh is deferred")]
    RefreshDeferred,
}

impl Error {
    pub(crate) fn provider<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        Self::Provider(Arc::new(err))
    }
}

/// A notification published to subscribers of a collection or view.
#[derive(Clone, Debug)]
pub enum Event {
    /// All previously observed items and the count must be considered stale.
    Reset,
    /// At least one page fetch is (or no page fetch is any longer) outstanding.
    Loading(bool),
    /// The authoritative count is (or is no longer) outstanding.
    Initializing(bool),
    /// A fetch failed.
    Failed(Error),
    /// The current item of a [View] moved.
    CurrentChanged(Cursor),
}

/// The order in which a sort field is applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Ascending,
    Descending,
}

/// A single level of sorting, forwarded to the [Provider].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SortDescription {
    /// The name of the field to sort by (interpreted by the provider).
    pub field: String,
    /// The direction of the sort.
    pub direction: Direction,
}

impl SortDescription {
    /// Sorts by `field`, smallest first.
    pub fn ascending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Ascending,
        }
    }

    /// Sorts by `field`, largest first.
    pub fn descending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Descending,
        }
    }
}

/// The filter and sort order a [Provider] should apply when serving counts and ranges.
///
/// Both are opaque to the collection: it only forwards them and invalidates its pages whenever they
/// change.
#[derive(Clone)]
pub struct Query<F> {
    /// An optional filter, interpreted by the provider.
    pub filter: Option<F>,
    /// Sort levels, most significant first.
    pub sort: Vec<SortDescription>,
}

impl<F> Default for Query<F> {
    fn default() -> Self {
        Self {
            filter: None,
            sort: Vec::new(),
        }
    }
}

impl<F> fmt::Debug for Query<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("filtered", &self.filter.is_some())
            .field("sort", &self.sort)
            .finish()
    }
}

/// A range of items returned by a [Provider], along with the overall count observed while serving
/// it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fetched<T> {
    /// The items starting at the requested index. May be shorter than requested at the end of the
    /// dataset.
    pub items: Vec<T>,
    /// The overall number of items matching the query.
    pub total: u64,
}

/// Supplies counts and ranges of items.
///
/// Implementations may be slow (disk or network) and must be callable from any thread.
pub trait Provider: Send + Sync + 'static {
    /// The type of item served.
    type Item: Send + 'static;

    /// The filter type forwarded through [Query].
    type Filter: Clone + Send + Sync + 'static;

    /// The error returned when a fetch fails.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Returns the number of items matching `query`.
    fn fetch_count(&self, query: &Query<Self::Filter>) -> Result<u64, Self::Error>;

    /// Returns up to `len` items starting at `start`, along with the overall count.
    fn fetch_range(
        &self,
        query: &Query<Self::Filter>,
        start: u64,
        len: usize,
    ) -> Result<Fetched<Self::Item>, Self::Error>;
}

/// The result of reading an index from a collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Slot<T> {
    /// The item is resident.
    Ready(T),
    /// The owning page is being fetched. The item becomes available after a later completion.
    Pending,
    /// There is no item at this index.
    Vacant,
}

impl<T> Slot<T> {
    /// Returns the item, if ready.
    pub fn ready(self) -> Option<T> {
        match self {
            Self::Ready(item) => Some(item),
            Self::Pending | Self::Vacant => None,
        }
    }

    /// Returns true if the owning page is still being fetched.
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Maps a ready item, preserving [Slot::Pending] and [Slot::Vacant].
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Slot<U> {
        match self {
            Self::Ready(item) => Slot::Ready(f(item)),
            Self::Pending => Slot::Pending,
            Self::Vacant => Slot::Vacant,
        }
    }
}

/// Identifies a single collection instance.
///
/// Equality is by instance, not by value: two collections over the same provider have different
/// identities.
#[derive(Clone, Default)]
pub struct Identity(Arc<()>);

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Identity {}

impl Hash for Identity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state);
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({:p})", Arc::as_ptr(&self.0))
    }
}

/// A handle to the item at some index of some collection.
///
/// The referenced item need not be loaded. Resolving the handle through its collection
/// ([Collection::resolve]) loads it on demand.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ItemRef {
    identity: Identity,
    index: u64,
}

impl ItemRef {
    /// The referenced index.
    pub const fn index(&self) -> u64 {
        self.index
    }

    /// Returns true if this handle was issued by the collection with the given identity.
    pub fn belongs_to(&self, identity: &Identity) -> bool {
        &self.identity == identity
    }
}

/// A source of wall-clock time, used for page timeouts.
pub trait Clock: Clone + Send + 'static {
    /// Returns the current time.
    fn current(&self) -> SystemTime;
}

/// A [Clock] backed by [SystemTime::now].
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn current(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Configuration for a virtualized collection.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// The number of items fetched (and cached) together.
    pub page_size: NonZeroUsize,

    /// The maximum number of pages resident at once.
    pub cache_pages: NonZeroUsize,

    /// If set, pages untouched for longer than this are dropped on the next access.
    pub page_timeout: Option<Duration>,
}

/// Indexed, read-only access to a virtualized dataset.
///
/// All methods must be called from the collection's consumer context (its owner).
pub trait Collection {
    /// The type of item served.
    type Item;

    /// The filter type forwarded to the provider.
    type Filter: Clone;

    /// Returns the identity of this collection.
    fn identity(&self) -> &Identity;

    /// Returns the best-known number of items.
    fn count(&mut self) -> Result<u64, Error>;

    /// Reads the item at `index`.
    ///
    /// Indices at or beyond the best-known count resolve to [Slot::Vacant].
    fn get(&mut self, index: u64) -> Result<Slot<&Self::Item>, Error>;

    /// Replaces the query forwarded to the provider, dropping every resident page.
    fn apply(&mut self, query: Query<Self::Filter>);

    /// Drops every resident page and the known count.
    fn refresh(&mut self);

    /// Subscribes to [Event]s published by this collection.
    fn subscribe(&mut self) -> mpsc::UnboundedReceiver<Event>;

    /// Applies any completed fetches, returning how many were applied.
    ///
    /// Collections that fetch on the caller's thread have nothing to apply.
    fn process(&mut self) -> usize {
        0
    }

    /// Returns a handle to the item at `index`.
    fn item_ref(&self, index: u64) -> ItemRef {
        ItemRef {
            identity: self.identity().clone(),
            index,
        }
    }

    /// Returns the index referenced by `item`, if it was issued by this collection.
    fn index_of(&self, item: &ItemRef) -> Option<u64> {
        item.belongs_to(self.identity()).then_some(item.index)
    }

    /// Returns true if `item` references an index of this collection within its best-known count.
    fn contains(&mut self, item: &ItemRef) -> Result<bool, Error> {
        match self.index_of(item) {
            Some(index) => Ok(index < self.count()?),
            None => Ok(false),
        }
    }

    /// Reads the item referenced by `item`.
    fn resolve(&mut self, item: &ItemRef) -> Result<Slot<&Self::Item>, Error> {
        match self.index_of(item) {
            Some(index) => self.get(index),
            None => Ok(Slot::Vacant),
        }
    }

    /// Returns handles to every index within the best-known count, without loading any item.
    fn refs(&mut self) -> Result<Vec<ItemRef>, Error> {
        let count = self.count()?;
        Ok((0..count).map(|index| self.item_ref(index)).collect())
    }
}
