//! Current-item tracking, filtering and sorting over a [Collection].
//!
//! A [View] wraps a collection and adds a cursor, a filter and an ordered list of
//! [SortDescription]s. The filter and sort order are forwarded to the [crate::Provider] (which does
//! the actual filtering and sorting); changing either refreshes the view, which drops every page of
//! the underlying collection and re-derives the cursor against the new count.
//!
//! # Deferred Refresh
//!
//! Configuring several properties at once would refresh once per change. Holding a [Deferral]
//! (from [View::defer_refresh]) suspends refreshes: mutations only mark the view dirty, and exactly
//! one refresh runs when the outermost deferral is dropped. While deferred, the cursor is stale and
//! reading or moving it returns [Error::RefreshDeferred].
//!
//! # Example
//!
//! ```rust
//! use commonware_pager::{
//!     Blocking, Config, Cursor, Direction, Fetched, Provider, Query, SortDescription, View,
//! };
//! use std::{convert::Infallible, num::NonZeroUsize};
//!
//! /// The numbers below 1000, optionally only the multiples of a filter value.
//! struct Numbers;
//!
//! impl Numbers {
//!     fn select(query: &Query<u64>) -> Vec<u64> {
//!         let step = query.filter.unwrap_or(1);
//!         let mut numbers: Vec<u64> = (0..1_000).filter(|n| n % step == 0).collect();
//!         if query.sort.first().map(|s| s.direction) == Some(Direction::Descending) {
//!             numbers.reverse();
//!         }
//!         numbers
//!     }
//! }
//!
//! impl Provider for Numbers {
//!     type Item = u64;
//!     type Filter = u64;
//!     type Error = Infallible;
//!
//!     fn fetch_count(&self, query: &Query<u64>) -> Result<u64, Infallible> {
//!         Ok(Self::select(query).len() as u64)
//!     }
//!
//!     fn fetch_range(&self, query: &Query<u64>, start: u64, len: usize) -> Result<Fetched<u64>, Infallible> {
//!         let numbers = Self::select(query);
//!         Ok(Fetched {
//!             total: numbers.len() as u64,
//!             items: numbers.into_iter().skip(start as usize).take(len).collect(),
//!         })
//!     }
//! }
//!
//! let cfg = Config {
//!     page_size: NonZeroUsize::new(50).unwrap(),
//!     cache_pages: NonZeroUsize::new(4).unwrap(),
//!     page_timeout: None,
//! };
//! let mut view = View::new(Blocking::new(Numbers, cfg)).unwrap();
//! assert_eq!(view.cursor().unwrap(), Cursor::InView(0));
//!
//! // One refresh for both changes.
//! {
//!     let mut deferral = view.defer_refresh();
//!     deferral.set_filter(2).unwrap();
//!     deferral.add_sort(SortDescription::descending("value")).unwrap();
//! }
//!
//! assert!(view.move_to_last().unwrap());
//! assert_eq!(view.cursor().unwrap(), Cursor::InView(499));
//! assert_eq!(view.current_item().unwrap().ready(), Some(&0));
//! ```

use crate::{notify::Listeners, Collection, Error, Event, ItemRef, Query, Slot, SortDescription};
use futures::channel::mpsc;
use std::ops::{Deref, DerefMut};
use tracing::{debug, warn};

/// The position of a [View]'s cursor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Cursor {
    /// Before the first item.
    BeforeFirst,
    /// On the item at the given index.
    InView(u64),
    /// After the last item.
    AfterLast,
    /// The collection has no items.
    Empty,
}

/// A pending move of the cursor, offered to guards before it is committed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Changing {
    pub from: Cursor,
    pub to: Cursor,
}

type Guard = Box<dyn FnMut(&Changing) -> bool + Send>;

/// A cursor, filter and sort order over a [Collection].
pub struct View<S: Collection> {
    collection: S,

    cursor: Cursor,
    current: Option<ItemRef>,

    filter: Option<S::Filter>,
    sort: Vec<SortDescription>,

    /// The number of live [Deferral]s.
    deferrals: usize,

    /// Whether a refresh is owed, either because a mutation happened while deferred or because the
    /// last refresh failed.
    dirty: bool,

    guards: Vec<Guard>,
    listeners: Listeners,
}

impl<S: Collection> View<S> {
    /// Wraps `collection`, placing the cursor on the first item if there is one.
    pub fn new(collection: S) -> Result<Self, Error> {
        let mut view = Self {
            collection,
            cursor: Cursor::BeforeFirst,
            current: None,
            filter: None,
            sort: Vec::new(),
            deferrals: 0,
            dirty: false,
            guards: Vec::new(),
            listeners: Listeners::default(),
        };
        view.rederive()?;
        Ok(view)
    }

    /// The wrapped collection.
    pub fn collection(&self) -> &S {
        &self.collection
    }

    /// The wrapped collection, for reads that bypass the cursor.
    ///
    /// Changing its query directly is overwritten by the next refresh of the view.
    pub fn collection_mut(&mut self) -> &mut S {
        &mut self.collection
    }

    pub fn into_inner(self) -> S {
        self.collection
    }

    /// Subscribes to [Event::CurrentChanged] notifications.
    ///
    /// Collection events are published by the collection itself (see [View::collection_mut]).
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<Event> {
        self.listeners.subscribe()
    }

    /// Registers a guard consulted before every move of the cursor. If any guard returns false, the
    /// move is cancelled.
    pub fn on_current_changing<G>(&mut self, guard: G)
    where
        G: FnMut(&Changing) -> bool + Send + 'static,
    {
        self.guards.push(Box::new(guard));
    }

    /// The current filter.
    pub fn filter(&self) -> Option<&S::Filter> {
        self.filter.as_ref()
    }

    /// The current sort levels, most significant first.
    pub fn sort_descriptions(&self) -> &[SortDescription] {
        &self.sort
    }

    /// Returns true while at least one [Deferral] is alive.
    pub fn is_refresh_deferred(&self) -> bool {
        self.deferrals > 0
    }

    /// Suspends refreshes until the returned [Deferral] (and any nested in it) is dropped.
    pub fn defer_refresh(&mut self) -> Deferral<'_, S> {
        self.deferrals += 1;
        Deferral { view: self }
    }

    /// The best-known number of items.
    pub fn count(&mut self) -> Result<u64, Error> {
        self.collection.count()
    }

    pub fn is_empty(&mut self) -> Result<bool, Error> {
        Ok(self.collection.count()? == 0)
    }

    pub fn cursor(&mut self) -> Result<Cursor, Error> {
        self.check()?;
        Ok(self.cursor)
    }

    /// The index of the current item, -1 before the first item (or when empty), or the count after
    /// the last.
    pub fn current_position(&mut self) -> Result<i64, Error> {
        self.check()?;
        self.position()
    }

    /// A handle to the current item, if the cursor is on one.
    pub fn current(&mut self) -> Result<Option<&ItemRef>, Error> {
        self.check()?;
        Ok(self.current.as_ref())
    }

    /// Reads the current item through the collection.
    pub fn current_item(&mut self) -> Result<Slot<&S::Item>, Error> {
        self.check()?;
        match self.cursor {
            Cursor::InView(index) => self.collection.get(index),
            Cursor::BeforeFirst | Cursor::AfterLast | Cursor::Empty => Ok(Slot::Vacant),
        }
    }

    pub fn is_before_first(&mut self) -> Result<bool, Error> {
        self.check()?;
        Ok(matches!(self.cursor, Cursor::BeforeFirst | Cursor::Empty))
    }

    pub fn is_after_last(&mut self) -> Result<bool, Error> {
        self.check()?;
        Ok(matches!(self.cursor, Cursor::AfterLast | Cursor::Empty))
    }

    /// Moves the cursor to `position`, returning true if it is then on an item.
    ///
    /// Negative positions move before the first item and positions at or past the count move
    /// after the last. The item at the new position is requested from the collection. Over an empty
    /// collection the cursor stays [Cursor::Empty].
    pub fn move_to_position(&mut self, position: i64) -> Result<bool, Error> {
        self.check()?;
        let count = self.collection.count()?;
        let target = if count == 0 {
            Cursor::Empty
        } else if position < 0 {
            Cursor::BeforeFirst
        } else if position as u64 >= count {
            Cursor::AfterLast
        } else {
            Cursor::InView(position as u64)
        };
        if target != self.cursor {
            let changing = Changing {
                from: self.cursor,
                to: target,
            };
            if !self.consult(&changing) {
                debug!(?changing, "cursor move cancelled");
                return Ok(self.in_view());
            }
            self.commit(target)?;
        }
        Ok(self.in_view())
    }

    pub fn move_to_first(&mut self) -> Result<bool, Error> {
        self.move_to_position(0)
    }

    pub fn move_to_last(&mut self) -> Result<bool, Error> {
        self.check()?;
        let count = self.collection.count()?;
        self.move_to_position(count as i64 - 1)
    }

    /// Moves to the next position. Does nothing once after the last item.
    pub fn move_to_next(&mut self) -> Result<bool, Error> {
        self.check()?;
        let count = self.collection.count()? as i64;
        let position = self.position()?;
        if position + 1 > count {
            return Ok(false);
        }
        self.move_to_position(position + 1)
    }

    /// Moves to the previous position. Does nothing once before the first item.
    pub fn move_to_previous(&mut self) -> Result<bool, Error> {
        self.check()?;
        let position = self.position()?;
        if position - 1 < -1 {
            return Ok(false);
        }
        self.move_to_position(position - 1)
    }

    /// Moves to the item referenced by `item`. A handle issued by another collection moves the
    /// cursor before the first item.
    pub fn move_to(&mut self, item: &ItemRef) -> Result<bool, Error> {
        match self.collection.index_of(item) {
            Some(index) => self.move_to_position(index as i64),
            None => self.move_to_position(-1),
        }
    }

    pub fn set_filter(&mut self, filter: S::Filter) -> Result<(), Error> {
        self.filter = Some(filter);
        self.invalidate()
    }

    pub fn clear_filter(&mut self) -> Result<(), Error> {
        if self.filter.take().is_none() {
            return Ok(());
        }
        self.invalidate()
    }

    /// Appends a sort level (least significant).
    pub fn add_sort(&mut self, description: SortDescription) -> Result<(), Error> {
        self.sort.push(description);
        self.invalidate()
    }

    /// Inserts a sort level at `index`, clamped to the number of levels.
    pub fn insert_sort(&mut self, index: usize, description: SortDescription) -> Result<(), Error> {
        let index = index.min(self.sort.len());
        self.sort.insert(index, description);
        self.invalidate()
    }

    /// Removes the sort level at `index`, if any.
    pub fn remove_sort(&mut self, index: usize) -> Result<Option<SortDescription>, Error> {
        if index >= self.sort.len() {
            return Ok(None);
        }
        let removed = self.sort.remove(index);
        self.invalidate()?;
        Ok(Some(removed))
    }

    pub fn clear_sort(&mut self) -> Result<(), Error> {
        if self.sort.is_empty() {
            return Ok(());
        }
        self.sort.clear();
        self.invalidate()
    }

    /// Pushes the filter and sort order into the collection (dropping its pages) and re-derives the
    /// cursor against the new count.
    pub fn refresh(&mut self) -> Result<(), Error> {
        self.check()?;
        self.reload()
    }

    /// Applies completed fetches of the collection and moves the cursor back within bounds if the
    /// count changed underneath it.
    ///
    /// A refresh that previously failed is retried first.
    pub fn process(&mut self) -> Result<usize, Error> {
        let applied = self.collection.process();
        if self.deferrals > 0 {
            return Ok(applied);
        }
        if self.dirty {
            self.reload()?;
            return Ok(applied);
        }
        let count = self.collection.count()?;
        let target = match self.cursor {
            Cursor::InView(index) if index >= count => {
                if count == 0 {
                    Cursor::Empty
                } else {
                    Cursor::BeforeFirst
                }
            }
            Cursor::Empty if count > 0 => Cursor::InView(0),
            Cursor::BeforeFirst | Cursor::AfterLast if count == 0 => Cursor::Empty,
            cursor => cursor,
        };
        if target != self.cursor {
            debug!(from = ?self.cursor, to = ?target, count, "reconciling cursor");
            self.commit(target)?;
        }
        Ok(applied)
    }

    /// Fails while deferred, and otherwise runs any refresh still owed.
    fn check(&mut self) -> Result<(), Error> {
        if self.deferrals > 0 {
            return Err(Error::RefreshDeferred);
        }
        if self.dirty {
            self.reload()?;
        }
        Ok(())
    }

    fn in_view(&self) -> bool {
        matches!(self.cursor, Cursor::InView(_))
    }

    fn position(&mut self) -> Result<i64, Error> {
        Ok(match self.cursor {
            Cursor::BeforeFirst | Cursor::Empty => -1,
            Cursor::InView(index) => index as i64,
            Cursor::AfterLast => self.collection.count()? as i64,
        })
    }

    fn consult(&mut self, changing: &Changing) -> bool {
        let mut proceed = true;
        for guard in &mut self.guards {
            proceed &= guard(changing);
        }
        proceed
    }

    /// Refreshes now or, while deferred, marks the view dirty.
    fn invalidate(&mut self) -> Result<(), Error> {
        if self.deferrals > 0 {
            self.dirty = true;
            return Ok(());
        }
        self.reload()
    }

    /// Pushes the query into the collection and re-derives the cursor. The view stays dirty until
    /// both succeed.
    fn reload(&mut self) -> Result<(), Error> {
        self.dirty = true;
        let query = Query {
            filter: self.filter.clone(),
            sort: self.sort.clone(),
        };
        debug!(?query, "refreshing view");
        self.collection.apply(query);
        self.rederive()?;
        self.dirty = false;
        Ok(())
    }

    /// Re-derives the cursor after the collection was invalidated.
    fn rederive(&mut self) -> Result<(), Error> {
        let count = self.collection.count()?;
        let target = match self.cursor {
            Cursor::BeforeFirst | Cursor::Empty if count > 0 => Cursor::InView(0),
            Cursor::InView(index) if index < count => Cursor::InView(index),
            Cursor::InView(_) if count > 0 => Cursor::BeforeFirst,
            Cursor::AfterLast if count > 0 => Cursor::AfterLast,
            _ => Cursor::Empty,
        };
        self.commit(target)
    }

    /// Moves the cursor to `target` and publishes the change.
    ///
    /// Loading the target item may reveal that the collection shrank past it, in which case the
    /// cursor lands after the last item (or on [Cursor::Empty]) instead.
    fn commit(&mut self, mut target: Cursor) -> Result<(), Error> {
        let current = match target {
            Cursor::InView(index) => {
                self.collection.get(index)?;
                let count = self.collection.count()?;
                if index < count {
                    Some(self.collection.item_ref(index))
                } else {
                    target = if count == 0 {
                        Cursor::Empty
                    } else {
                        Cursor::AfterLast
                    };
                    debug!(index, count, ?target, "collection shrank past target");
                    None
                }
            }
            Cursor::BeforeFirst | Cursor::AfterLast | Cursor::Empty => None,
        };
        self.cursor = target;
        self.current = current;
        self.listeners.publish(Event::CurrentChanged(target));
        Ok(())
    }
}

/// Suspends refreshes of a [View] while alive.
///
/// Dereferences to the view, so it can be mutated (and deferred again) through the guard. When the
/// outermost deferral is dropped and any mutation happened, the view refreshes once.
pub struct Deferral<'a, S: Collection> {
    view: &'a mut View<S>,
}

impl<S: Collection> Deref for Deferral<'_, S> {
    type Target = View<S>;

    fn deref(&self) -> &View<S> {
        self.view
    }
}

impl<S: Collection> DerefMut for Deferral<'_, S> {
    fn deref_mut(&mut self) -> &mut View<S> {
        self.view
    }
}

impl<S: Collection> Drop for Deferral<'_, S> {
    fn drop(&mut self) {
        self.view.deferrals -= 1;
        if self.view.deferrals > 0 || !self.view.dirty {
            return;
        }
        if let Err(err) = self.view.reload() {
            warn!(?err, "deferred refresh failed, retrying on next access");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mocks::{self, Customer, Predicate, Queue},
        Background, Blocking, Config, Inline, Metrics, SystemClock,
    };
    use commonware_macros::test_traced;
    use std::{
        num::NonZeroUsize,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };
    use test_case::test_case;

    fn config() -> Config {
        Config {
            page_size: NonZeroUsize::new(100).unwrap(),
            cache_pages: NonZeroUsize::new(3).unwrap(),
            page_timeout: None,
        }
    }

    fn view(count: u64) -> (View<Blocking<mocks::Provider>>, mocks::Provider, Metrics) {
        let provider = mocks::Provider::new(count);
        let metrics = Metrics::default();
        let collection =
            Blocking::with_context(provider.clone(), SystemClock, metrics.clone(), config());
        (View::new(collection).unwrap(), provider, metrics)
    }

    /// A view over a [Background] collection whose count and first page have arrived.
    fn background(
        count: u64,
    ) -> (
        View<Background<mocks::Provider, Queue>>,
        mocks::Provider,
        Queue,
        Metrics,
    ) {
        let provider = mocks::Provider::new(count);
        let queue = Queue::default();
        let metrics = Metrics::default();
        let collection = Background::with_context(
            provider.clone(),
            queue.clone(),
            SystemClock,
            metrics.clone(),
            config(),
        );
        let mut view = View::new(collection).unwrap();
        queue.run_all();
        view.process().unwrap();
        queue.run_all();
        view.process().unwrap();
        assert_eq!(view.current_item().unwrap(), Slot::Ready(&Customer::new(0)));
        (view, provider, queue, metrics)
    }

    fn changes(receiver: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Cursor> {
        let mut cursors = Vec::new();
        while let Ok(Some(event)) = receiver.try_next() {
            if let Event::CurrentChanged(cursor) = event {
                cursors.push(cursor);
            }
        }
        cursors
    }

    #[test_case(-5 => Cursor::BeforeFirst; "far before first")]
    #[test_case(-1 => Cursor::BeforeFirst; "before first")]
    #[test_case(0 => Cursor::InView(0); "first")]
    #[test_case(420 => Cursor::InView(420); "middle")]
    #[test_case(999 => Cursor::InView(999); "last")]
    #[test_case(1_000 => Cursor::AfterLast; "after last")]
    #[test_case(i64::MAX => Cursor::AfterLast; "far after last")]
    fn test_move_to_position_bounds(position: i64) -> Cursor {
        let (mut view, _, _) = view(1_000);
        let in_view = view.move_to_position(position).unwrap();
        let cursor = view.cursor().unwrap();
        assert_eq!(in_view, matches!(cursor, Cursor::InView(_)));
        if let Cursor::InView(index) = cursor {
            let item = view.current().unwrap().cloned().unwrap();
            assert_eq!(item.index(), index);
            assert_eq!(
                view.collection_mut().resolve(&item).unwrap(),
                Slot::Ready(&Customer::new(index))
            );
        } else {
            assert!(view.current().unwrap().is_none());
            assert_eq!(view.current_item().unwrap(), Slot::Vacant);
        }
        cursor
    }

    #[test_traced]
    fn test_initial_cursor() {
        let (mut view, _, _) = view(10);
        assert_eq!(view.cursor().unwrap(), Cursor::InView(0));
        assert_eq!(view.current_position().unwrap(), 0);
        assert_eq!(view.current_item().unwrap(), Slot::Ready(&Customer::new(0)));

        let (mut empty, _, _) = self::view(0);
        assert_eq!(empty.cursor().unwrap(), Cursor::Empty);
        assert!(empty.is_empty().unwrap());
        assert!(empty.is_before_first().unwrap());
        assert!(empty.is_after_last().unwrap());
        assert_eq!(empty.current_position().unwrap(), -1);
    }

    #[test_traced]
    fn test_next_and_previous() {
        let (mut view, _, _) = view(3);
        assert!(view.move_to_next().unwrap());
        assert!(view.move_to_next().unwrap());
        assert_eq!(view.cursor().unwrap(), Cursor::InView(2));
        assert!(!view.move_to_next().unwrap());
        assert_eq!(view.cursor().unwrap(), Cursor::AfterLast);
        assert_eq!(view.current_position().unwrap(), 3);

        // Past the end, next is a no-op.
        assert!(!view.move_to_next().unwrap());
        assert_eq!(view.cursor().unwrap(), Cursor::AfterLast);

        assert!(view.move_to_previous().unwrap());
        assert_eq!(view.cursor().unwrap(), Cursor::InView(2));
        assert!(view.move_to_first().unwrap());
        assert!(!view.move_to_previous().unwrap());
        assert!(view.is_before_first().unwrap());
        assert!(!view.move_to_previous().unwrap());
        assert_eq!(view.current_position().unwrap(), -1);

        assert!(view.move_to_last().unwrap());
        assert_eq!(view.cursor().unwrap(), Cursor::InView(2));
    }

    #[test_traced]
    fn test_move_to_item_ref() {
        let (mut view, _, _) = view(500);
        let item = view.collection().item_ref(321);
        assert!(view.move_to(&item).unwrap());
        assert_eq!(view.current().unwrap(), Some(&item));

        let (other, _, _) = self::view(500);
        let foreign = other.collection().item_ref(5);
        assert!(!view.move_to(&foreign).unwrap());
        assert_eq!(view.cursor().unwrap(), Cursor::BeforeFirst);
    }

    #[test_traced]
    fn test_move_publishes_changes() {
        let (mut view, _, _) = view(10);
        let mut events = view.subscribe();
        view.move_to_position(4).unwrap();
        view.move_to_position(4).unwrap();
        view.move_to_position(20).unwrap();
        assert_eq!(
            changes(&mut events),
            vec![Cursor::InView(4), Cursor::AfterLast]
        );
    }

    #[test_traced]
    fn test_cancelled_move() {
        let (mut view, provider, _) = view(1_000);
        let consulted = Arc::new(AtomicUsize::new(0));
        view.on_current_changing({
            let consulted = consulted.clone();
            move |_| {
                consulted.fetch_add(1, Ordering::SeqCst);
                true
            }
        });
        view.on_current_changing(|changing| {
            !matches!(changing.to, Cursor::InView(index) if index >= 500)
        });
        let mut events = view.subscribe();

        assert!(view.move_to_position(10).unwrap());
        assert!(view.move_to_position(700).unwrap());
        assert_eq!(view.cursor().unwrap(), Cursor::InView(10));
        assert_eq!(changes(&mut events), vec![Cursor::InView(10)]);

        // Every guard is consulted even when one cancels.
        assert_eq!(consulted.load(Ordering::SeqCst), 2);

        // The cancelled move never loaded its page.
        assert_eq!(provider.ranges(), vec![(0, 100)]);
    }

    #[test_traced]
    fn test_deferred_refresh_coalesces() {
        let (mut view, provider, metrics) = view(1_000);
        provider.clear_log();
        let resets = metrics.resets.get();
        {
            let mut deferral = view.defer_refresh();
            let even: Predicate = Arc::new(|c: &Customer| c.id % 2 == 0);
            deferral.set_filter(even).unwrap();
            deferral.add_sort(SortDescription::descending("name")).unwrap();
            deferral.add_sort(SortDescription::ascending("id")).unwrap();

            assert!(deferral.is_refresh_deferred());
            assert_eq!(deferral.sort_descriptions().len(), 2);
            assert!(matches!(deferral.cursor(), Err(Error::RefreshDeferred)));
            assert!(matches!(
                deferral.move_to_next(),
                Err(Error::RefreshDeferred)
            ));
            assert!(matches!(deferral.refresh(), Err(Error::RefreshDeferred)));
            assert_eq!(metrics.resets.get(), resets);
            assert_eq!(provider.count_fetches(), 0);
            assert_eq!(provider.range_fetches(), 0);
        }
        assert!(!view.is_refresh_deferred());
        assert_eq!(metrics.resets.get(), resets + 1);
        assert_eq!(provider.count_fetches(), 1);
        assert_eq!(provider.range_fetches(), 1);
        assert_eq!(view.count().unwrap(), 500);
        assert_eq!(view.cursor().unwrap(), Cursor::InView(0));
        assert_eq!(view.collection().query().sort.len(), 2);
    }

    #[test_traced]
    fn test_nested_deferral() {
        let (mut view, _, metrics) = view(1_000);
        let resets = metrics.resets.get();
        {
            let mut outer = view.defer_refresh();
            outer.add_sort(SortDescription::ascending("name")).unwrap();
            {
                let mut inner = outer.defer_refresh();
                inner.clear_sort().unwrap();
                inner.add_sort(SortDescription::descending("id")).unwrap();
            }
            assert_eq!(metrics.resets.get(), resets);
            assert!(outer.cursor().is_err());
        }
        assert_eq!(metrics.resets.get(), resets + 1);
        assert_eq!(
            view.current_item().unwrap(),
            Slot::Ready(&Customer::new(999))
        );
    }

    #[test_traced]
    fn test_clean_deferral_skips_refresh() {
        let (mut view, provider, metrics) = view(1_000);
        provider.clear_log();
        let resets = metrics.resets.get();
        drop(view.defer_refresh());

        // Clearing what is already clear is not a change.
        view.clear_filter().unwrap();
        view.clear_sort().unwrap();
        assert_eq!(view.remove_sort(3).unwrap(), None);
        assert_eq!(metrics.resets.get(), resets);
        assert_eq!(provider.count_fetches(), 0);
    }

    #[test_traced]
    fn test_sort_mutators_refresh() {
        let (mut view, _, metrics) = view(100);
        let resets = metrics.resets.get();
        view.add_sort(SortDescription::ascending("id")).unwrap();
        view.insert_sort(0, SortDescription::descending("name"))
            .unwrap();
        view.insert_sort(99, SortDescription::ascending("name"))
            .unwrap();
        assert_eq!(
            view.sort_descriptions(),
            &[
                SortDescription::descending("name"),
                SortDescription::ascending("id"),
                SortDescription::ascending("name"),
            ]
        );
        assert_eq!(
            view.remove_sort(0).unwrap(),
            Some(SortDescription::descending("name"))
        );
        assert_eq!(metrics.resets.get(), resets + 4);
        assert_eq!(view.collection().query().sort.len(), 2);
    }

    #[test_traced]
    fn test_refresh_keeps_addressable_current() {
        let (mut view, provider, _) = view(1_000);
        view.move_to_position(500).unwrap();
        provider.set_count(800);
        view.refresh().unwrap();
        assert_eq!(view.cursor().unwrap(), Cursor::InView(500));
        assert_eq!(view.current().unwrap().map(ItemRef::index), Some(500));

        view.move_to_position(700).unwrap();
        provider.set_count(600);
        view.refresh().unwrap();
        assert_eq!(view.cursor().unwrap(), Cursor::BeforeFirst);
        assert_eq!(view.current_position().unwrap(), -1);
        assert!(view.current().unwrap().is_none());
    }

    #[test_traced]
    fn test_refresh_rederives_edges() {
        let (mut view, provider, _) = view(10);
        view.move_to_position(-1).unwrap();
        view.refresh().unwrap();
        assert_eq!(view.cursor().unwrap(), Cursor::InView(0));

        view.move_to_position(10).unwrap();
        view.refresh().unwrap();
        assert_eq!(view.cursor().unwrap(), Cursor::AfterLast);

        provider.set_count(0);
        view.refresh().unwrap();
        assert_eq!(view.cursor().unwrap(), Cursor::Empty);

        provider.set_count(4);
        view.refresh().unwrap();
        assert_eq!(view.cursor().unwrap(), Cursor::InView(0));
    }

    #[test_traced]
    fn test_background_view_reconciles() {
        let provider = mocks::Provider::new(1_000);
        let collection = Background::new(provider.clone(), Inline, config());
        let mut view = View::new(collection).unwrap();
        assert_eq!(view.cursor().unwrap(), Cursor::Empty);
        let mut events = view.subscribe();

        // The count arrives and the cursor lands on the first item, whose page is then requested.
        assert_eq!(view.process().unwrap(), 1);
        assert_eq!(view.cursor().unwrap(), Cursor::InView(0));
        assert!(view.current_item().unwrap().is_pending());
        assert_eq!(view.process().unwrap(), 1);
        assert_eq!(view.current_item().unwrap(), Slot::Ready(&Customer::new(0)));

        // The dataset shrinks underneath the cursor.
        view.move_to_position(900).unwrap();
        view.process().unwrap();
        provider.set_count(850);
        view.refresh().unwrap();
        assert_eq!(view.cursor().unwrap(), Cursor::InView(900));
        view.process().unwrap();
        assert_eq!(view.cursor().unwrap(), Cursor::BeforeFirst);
        assert_eq!(
            changes(&mut events),
            vec![
                Cursor::InView(0),
                Cursor::InView(900),
                Cursor::InView(900),
                Cursor::BeforeFirst
            ]
        );
    }

    #[test_traced]
    fn test_moves_over_empty_collection() {
        let (mut view, _, _) = view(0);
        let mut events = view.subscribe();
        assert!(!view.move_to_next().unwrap());
        assert!(!view.move_to_last().unwrap());
        assert!(!view.move_to_previous().unwrap());
        assert!(!view.move_to_position(3).unwrap());
        assert!(!view.move_to_first().unwrap());
        assert_eq!(view.cursor().unwrap(), Cursor::Empty);
        assert!(view.is_before_first().unwrap());
        assert!(view.is_after_last().unwrap());
        assert!(changes(&mut events).is_empty());
    }

    #[test_traced]
    fn test_move_past_shrunk_collection() {
        let (mut view, provider, metrics) = view(1_000);
        let resets = metrics.resets.get();
        let mut events = view.subscribe();

        // The shrink is only discovered when the target page is fetched.
        provider.set_count(800);
        assert!(!view.move_to_position(900).unwrap());
        assert_eq!(view.cursor().unwrap(), Cursor::AfterLast);
        assert_eq!(view.count().unwrap(), 800);
        assert_eq!(view.current_position().unwrap(), 800);
        assert!(view.current().unwrap().is_none());
        assert_eq!(view.current_item().unwrap(), Slot::Vacant);
        assert_eq!(metrics.resets.get(), resets + 1);
        assert_eq!(changes(&mut events), vec![Cursor::AfterLast]);

        assert!(view.move_to_position(799).unwrap());
        assert_eq!(
            view.current_item().unwrap(),
            Slot::Ready(&Customer::new(799))
        );
    }

    #[test_traced]
    fn test_process_reconciles_blocking() {
        let (mut view, provider, _) = view(1_000);
        view.move_to_position(900).unwrap();

        // A read that bypasses the cursor discovers the shrink.
        provider.set_count(800);
        assert_eq!(view.collection_mut().get(850).unwrap(), Slot::Vacant);
        assert_eq!(view.process().unwrap(), 0);
        assert_eq!(view.cursor().unwrap(), Cursor::BeforeFirst);
        assert!(view.current().unwrap().is_none());
    }

    #[test_traced]
    fn test_failed_deferred_refresh_retried() {
        let (mut view, provider, _) = view(1_000);
        view.move_to_position(500).unwrap();
        provider.set_failing(true);
        {
            let mut deferral = view.defer_refresh();
            let even: Predicate = Arc::new(|c: &Customer| c.id % 2 == 0);
            deferral.set_filter(even).unwrap();
        }
        assert!(view.dirty);

        // Every access retries the refresh until it succeeds.
        assert!(matches!(view.cursor(), Err(Error::Provider(_))));
        assert!(matches!(view.process(), Err(Error::Provider(_))));
        assert!(view.dirty);

        provider.set_failing(false);
        assert_eq!(view.cursor().unwrap(), Cursor::BeforeFirst);
        assert!(!view.dirty);
        assert_eq!(view.count().unwrap(), 500);
        assert!(view.move_to_position(499).unwrap());
        assert_eq!(
            view.current_item().unwrap(),
            Slot::Ready(&Customer::new(998))
        );
    }

    #[test_traced]
    fn test_failed_refresh_retried() {
        let (mut view, provider, _) = view(1_000);
        provider.set_failing(true);
        view.add_sort(SortDescription::descending("id")).unwrap_err();
        assert!(view.dirty);

        provider.set_failing(false);
        assert_eq!(view.cursor().unwrap(), Cursor::InView(0));
        assert_eq!(
            view.current_item().unwrap(),
            Slot::Ready(&Customer::new(999))
        );
    }

    #[test_traced]
    fn test_background_deferred_refresh_coalesces() {
        let (mut view, provider, queue, metrics) = background(1_000);
        provider.clear_log();
        let resets = metrics.resets.get();
        {
            let mut deferral = view.defer_refresh();
            let even: Predicate = Arc::new(|c: &Customer| c.id % 2 == 0);
            deferral.set_filter(even).unwrap();
            deferral.add_sort(SortDescription::descending("id")).unwrap();
            deferral.add_sort(SortDescription::ascending("name")).unwrap();
            assert!(queue.is_empty());
            assert_eq!(metrics.resets.get(), resets);
        }

        // One invalidation, then one count fetch and one fetch of the current item's page.
        assert_eq!(metrics.resets.get(), resets + 1);
        assert_eq!(queue.len(), 2);
        queue.run_all();
        assert_eq!(provider.count_fetches(), 1);
        assert_eq!(provider.range_fetches(), 1);

        // The filtered count differs from the provisional one, so the page fetched against the
        // provisional shape is discarded.
        let discarded = metrics.discarded.get();
        assert_eq!(view.process().unwrap(), 2);
        assert_eq!(metrics.resets.get(), resets + 2);
        assert_eq!(metrics.discarded.get(), discarded + 1);
        assert_eq!(view.count().unwrap(), 500);
        assert_eq!(view.cursor().unwrap(), Cursor::InView(0));

        assert!(view.current_item().unwrap().is_pending());
        queue.run_all();
        view.process().unwrap();
        assert_eq!(
            view.current_item().unwrap(),
            Slot::Ready(&Customer::new(998))
        );
        assert_eq!(provider.count_fetches(), 1);
        assert_eq!(provider.range_fetches(), 2);
    }

    #[test_traced]
    fn test_background_move_past_shrunk_collection() {
        let (mut view, provider, queue, metrics) = background(1_000);
        let resets = metrics.resets.get();

        // The known count still admits the move until the target page arrives.
        provider.set_count(800);
        assert!(view.move_to_position(900).unwrap());
        assert_eq!(view.cursor().unwrap(), Cursor::InView(900));
        assert!(view.current_item().unwrap().is_pending());

        queue.run_all();
        assert_eq!(view.process().unwrap(), 1);
        assert_eq!(metrics.resets.get(), resets + 1);
        assert_eq!(view.count().unwrap(), 800);
        assert_eq!(view.cursor().unwrap(), Cursor::BeforeFirst);
        assert!(view.current().unwrap().is_none());
        assert_eq!(view.current_item().unwrap(), Slot::Vacant);
    }
}
