//! A bounded cache of fixed-size pages of items.
//!
//! Items are grouped into pages of `page_size` consecutive indices, and page `p` covers indices
//! `[p * page_size, (p + 1) * page_size)`. A page is fetched and cached as one unit. A page at the
//! end of the dataset may hold fewer than `page_size` items; indices past its valid length resolve
//! to [Lookup::Vacant] rather than a miss.
//!
//! # Eviction
//!
//! Pages are kept in recency order (most recently used first). Reading from a page or installing it
//! moves it to the front, and installing a page into a full cache evicts the page at the back.
//!
//! If a `timeout` is configured, any page untouched for longer than the timeout is dropped the next
//! time the cache is read, bounding memory held for viewports that were abandoned.

use crate::Metrics;
use std::{
    collections::{HashMap, VecDeque},
    num::NonZeroUsize,
    time::{Duration, SystemTime},
};
use tracing::{debug, trace};

/// The result of a [Cache] lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lookup<T> {
    /// The owning page is resident and holds the item.
    Hit(T),
    /// The owning page is resident but ends before the index.
    Vacant,
    /// The owning page is not resident and must be fetched.
    Miss { page: u64 },
}

struct Page<T> {
    /// The index of the first item in the page.
    start: u64,

    /// The items of the page. Never longer than the page size.
    items: Vec<T>,

    /// The last time the page was read or installed.
    touched: SystemTime,
}

/// A bounded, recency-ordered store of pages.
pub struct Cache<T> {
    /// Resident pages, keyed by page index.
    ///
    /// # Invariants
    ///
    /// Each `pages` entry has exactly one `recency` entry and vice versa.
    pages: HashMap<u64, Page<T>>,

    /// Resident page indices, most recently used first.
    recency: VecDeque<u64>,

    /// The number of items per page.
    page_size: usize,

    /// The maximum number of resident pages.
    capacity: usize,

    /// How long a page may go untouched before it is dropped.
    timeout: Option<Duration>,

    metrics: Metrics,
}

impl<T> Cache<T> {
    /// Returns a new empty cache holding up to `capacity` pages of `page_size` items.
    pub fn new(
        page_size: NonZeroUsize,
        capacity: NonZeroUsize,
        timeout: Option<Duration>,
        metrics: Metrics,
    ) -> Self {
        Self {
            pages: HashMap::with_capacity(capacity.get()),
            recency: VecDeque::with_capacity(capacity.get()),
            page_size: page_size.get(),
            capacity: capacity.get(),
            timeout,
            metrics,
        }
    }

    /// The number of items per page.
    #[inline]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    /// The maximum number of resident pages.
    #[inline]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the index of the page holding `index`.
    #[inline]
    pub const fn page_of(&self, index: u64) -> u64 {
        index / self.page_size as u64
    }

    /// Returns the index of the first item of `page`.
    #[inline]
    pub const fn start_of(&self, page: u64) -> u64 {
        page.saturating_mul(self.page_size as u64)
    }

    /// The number of resident pages.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Returns true if `page` is resident.
    pub fn contains(&self, page: u64) -> bool {
        self.pages.contains_key(&page)
    }

    /// Returns the resident page indices, most recently used first.
    pub fn pages(&self) -> impl Iterator<Item = u64> + '_ {
        self.recency.iter().copied()
    }

    /// Returns the items of a resident page without touching it.
    pub fn peek(&self, page: u64) -> Option<&[T]> {
        self.pages.get(&page).map(|page| page.items.as_slice())
    }

    /// Looks up `index`, marking its page as most recently used.
    pub fn get(&mut self, index: u64, now: SystemTime) -> Lookup<&T> {
        match self.probe(index, now) {
            Lookup::Hit(()) => self.item(index).map_or(Lookup::Vacant, Lookup::Hit),
            Lookup::Vacant => Lookup::Vacant,
            Lookup::Miss { page } => Lookup::Miss { page },
        }
    }

    /// Classifies `index` like [Cache::get] without borrowing the item, marking its page as most
    /// recently used.
    ///
    /// Expired pages are dropped before the lookup.
    pub fn probe(&mut self, index: u64, now: SystemTime) -> Lookup<()> {
        self.expire(now);
        self.metrics.requests.inc();

        let page_index = self.page_of(index);
        let Some(page) = self.pages.get_mut(&page_index) else {
            self.metrics.misses.inc();
            trace!(index, page = page_index, "cache miss");
            return Lookup::Miss { page: page_index };
        };
        page.touched = now;
        let offset = (index - page.start) as usize;
        let lookup = if offset < page.items.len() {
            Lookup::Hit(())
        } else {
            Lookup::Vacant
        };
        promote(&mut self.recency, page_index);
        lookup
    }

    /// Returns the resident item at `index` without touching its page.
    pub fn item(&self, index: u64) -> Option<&T> {
        let page = self.pages.get(&self.page_of(index))?;
        page.items.get((index - page.start) as usize)
    }

    /// Installs `items` as the contents of `page`, replacing any resident copy.
    ///
    /// If the cache is full, the least recently used page is evicted first. Items beyond the page
    /// size are dropped.
    pub fn install(&mut self, page: u64, mut items: Vec<T>, now: SystemTime) {
        if items.len() > self.page_size {
            debug!(
                page,
                len = items.len(),
                page_size = self.page_size,
                "truncating oversized page"
            );
            items.truncate(self.page_size);
        }

        if let Some(existing) = self.pages.get_mut(&page) {
            debug!(page, "replacing resident page");
            existing.items = items;
            existing.touched = now;
            promote(&mut self.recency, page);
            return;
        }

        while self.pages.len() >= self.capacity {
            let Some(victim) = self.recency.pop_back() else {
                break;
            };
            self.pages.remove(&victim);
            self.metrics.evictions.inc();
            debug!(page = victim, "evicted least recently used page");
        }

        let start = self.start_of(page);
        self.pages.insert(
            page,
            Page {
                start,
                items,
                touched: now,
            },
        );
        self.recency.push_front(page);
        self.metrics.pages.set(self.pages.len() as i64);
    }

    /// Drops every resident page, returning how many were dropped.
    pub fn invalidate(&mut self) -> usize {
        let dropped = self.pages.len();
        self.pages.clear();
        self.recency.clear();
        self.metrics.pages.set(0);
        if dropped > 0 {
            debug!(dropped, "invalidated cache");
        }
        dropped
    }

    /// Drops every page untouched for longer than the configured timeout, returning how many were
    /// dropped.
    pub fn expire(&mut self, now: SystemTime) -> usize {
        let Some(timeout) = self.timeout else {
            return 0;
        };
        let before = self.pages.len();
        self.pages.retain(|page_index, page| {
            let idle = now.duration_since(page.touched).unwrap_or_default();
            if idle <= timeout {
                return true;
            }
            debug!(page = page_index, ?idle, "expired idle page");
            false
        });
        let expired = before - self.pages.len();
        if expired > 0 {
            self.recency.retain(|page| self.pages.contains_key(page));
            self.metrics.evictions.inc_by(expired as u64);
            self.metrics.pages.set(self.pages.len() as i64);
        }
        expired
    }
}

/// Moves `page` to the front of `recency`.
fn promote(recency: &mut VecDeque<u64>, page: u64) {
    if recency.front() == Some(&page) {
        return;
    }
    if let Some(position) = recency.iter().position(|resident| *resident == page) {
        recency.remove(position);
    }
    recency.push_front(page);
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    const PAGE_SIZE: usize = 100;

    fn cache(capacity: usize, timeout: Option<Duration>) -> Cache<u64> {
        Cache::new(
            NonZeroUsize::new(PAGE_SIZE).unwrap(),
            NonZeroUsize::new(capacity).unwrap(),
            timeout,
            Metrics::default(),
        )
    }

    fn page(index: u64, len: usize) -> Vec<u64> {
        let start = index * PAGE_SIZE as u64;
        (start..start + len as u64).collect()
    }

    #[test_traced]
    fn test_cache_basic() {
        let mut cache = cache(3, None);
        let now = SystemTime::UNIX_EPOCH;

        assert_eq!(cache.get(150, now), Lookup::Miss { page: 1 });
        cache.install(1, page(1, PAGE_SIZE), now);
        assert_eq!(cache.get(150, now), Lookup::Hit(&150));
        assert_eq!(cache.get(199, now), Lookup::Hit(&199));
        assert_eq!(cache.get(200, now), Lookup::Miss { page: 2 });

        // Replacing a resident page keeps a single copy.
        cache.install(1, vec![7; PAGE_SIZE], now);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(150, now), Lookup::Hit(&7));

        assert_eq!(cache.metrics.requests.get(), 5);
        assert_eq!(cache.metrics.misses.get(), 2);
    }

    #[test_traced]
    fn test_cache_lru_eviction() {
        let mut cache = cache(3, None);
        let now = SystemTime::UNIX_EPOCH;
        for index in [0, 1, 2] {
            cache.install(index, page(index, PAGE_SIZE), now);
        }
        assert_eq!(cache.pages().collect::<Vec<_>>(), vec![2, 1, 0]);

        // Touch page 0 so page 1 becomes the least recently used.
        assert_eq!(cache.get(50, now), Lookup::Hit(&50));
        assert_eq!(cache.pages().collect::<Vec<_>>(), vec![0, 2, 1]);

        cache.install(9, page(9, PAGE_SIZE), now);
        assert!(!cache.contains(1));
        assert_eq!(cache.pages().collect::<Vec<_>>(), vec![9, 0, 2]);
        assert_eq!(cache.metrics.evictions.get(), 1);
        assert_eq!(cache.metrics.pages.get(), 3);
    }

    #[test_traced]
    fn test_cache_short_page() {
        let mut cache = cache(2, None);
        let now = SystemTime::UNIX_EPOCH;
        cache.install(9, page(9, 40), now);

        assert_eq!(cache.get(939, now), Lookup::Hit(&939));
        assert_eq!(cache.get(940, now), Lookup::Vacant);
        assert_eq!(cache.get(999, now), Lookup::Vacant);
        assert_eq!(cache.peek(9).map(<[u64]>::len), Some(40));
    }

    #[test_traced]
    fn test_cache_truncates_oversized_page() {
        let mut cache = cache(2, None);
        let now = SystemTime::UNIX_EPOCH;
        cache.install(0, (0..PAGE_SIZE as u64 + 5).collect(), now);
        assert_eq!(cache.peek(0).map(<[u64]>::len), Some(PAGE_SIZE));
        assert_eq!(cache.get(100, now), Lookup::Miss { page: 1 });
    }

    #[test_traced]
    fn test_cache_invalidate() {
        let mut cache = cache(3, None);
        let now = SystemTime::UNIX_EPOCH;
        cache.install(0, page(0, PAGE_SIZE), now);
        cache.install(4, page(4, PAGE_SIZE), now);

        assert_eq!(cache.invalidate(), 2);
        assert!(cache.is_empty());
        assert_eq!(cache.pages().count(), 0);
        assert_eq!(cache.get(0, now), Lookup::Miss { page: 0 });
        assert_eq!(cache.metrics.pages.get(), 0);
    }

    #[test_traced]
    fn test_cache_timeout() {
        let timeout = Duration::from_secs(10);
        let mut cache = cache(3, Some(timeout));
        let start = SystemTime::UNIX_EPOCH;
        cache.install(0, page(0, PAGE_SIZE), start);
        cache.install(1, page(1, PAGE_SIZE), start);

        // Keep page 1 alive.
        let later = start + Duration::from_secs(8);
        assert_eq!(cache.get(100, later), Lookup::Hit(&100));

        // Page 0 has now been idle for longer than the timeout.
        let expired = start + Duration::from_secs(11);
        assert_eq!(cache.get(150, expired), Lookup::Hit(&150));
        assert!(!cache.contains(0));
        assert_eq!(cache.pages().collect::<Vec<_>>(), vec![1]);
        assert_eq!(cache.metrics.evictions.get(), 1);

        // A clock moving backwards never expires anything.
        assert_eq!(cache.expire(start), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test_traced]
    fn test_cache_bound_random_access() {
        let mut rng = StdRng::seed_from_u64(0);
        let capacity = 4;
        let mut cache = cache(capacity, None);
        let now = SystemTime::UNIX_EPOCH;
        for _ in 0..10_000 {
            let index = rng.gen_range(0..5_000u64);
            if let Lookup::Miss { page: missing } = cache.get(index, now) {
                cache.install(missing, page(missing, PAGE_SIZE), now);
                assert_eq!(cache.get(index, now), Lookup::Hit(&index));
            }
            assert!(cache.len() <= capacity);
            assert_eq!(cache.pages().count(), cache.len());
        }
    }
}
