use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

/// Metrics for a virtualized collection.
///
/// Cloning shares the underlying counters, so a clone handed to the cache and the fetcher reports
/// into the same series.
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    /// Number of item lookups
    pub requests: Counter,
    /// Number of lookups that missed the cache
    pub misses: Counter,
    /// Number of range fetches issued to the provider
    pub fetches: Counter,
    /// Number of count fetches issued to the provider
    pub count_fetches: Counter,
    /// Number of failed fetches
    pub failures: Counter,
    /// Number of pages evicted (by capacity or timeout)
    pub evictions: Counter,
    /// Number of full invalidations
    pub resets: Counter,
    /// Number of fetch results discarded as stale
    pub discarded: Counter,
    /// Current number of resident pages
    pub pages: Gauge,
    /// Current number of fetches in flight
    pub inflight: Gauge,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given registry.
    pub fn init(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "requests",
            "Number of item lookups",
            metrics.requests.clone(),
        );
        registry.register(
            "misses",
            "Number of lookups that missed the cache",
            metrics.misses.clone(),
        );
        registry.register(
            "fetches",
            "Number of range fetches issued to the provider",
            metrics.fetches.clone(),
        );
        registry.register(
            "count_fetches",
            "Number of count fetches issued to the provider",
            metrics.count_fetches.clone(),
        );
        registry.register(
            "failures",
            "Number of failed fetches",
            metrics.failures.clone(),
        );
        registry.register(
            "evictions",
            "Number of pages evicted",
            metrics.evictions.clone(),
        );
        registry.register(
            "resets",
            "Number of full invalidations",
            metrics.resets.clone(),
        );
        registry.register(
            "discarded",
            "Number of fetch results discarded as stale",
            metrics.discarded.clone(),
        );
        registry.register(
            "pages",
            "Current number of resident pages",
            metrics.pages.clone(),
        );
        registry.register(
            "inflight",
            "Current number of fetches in flight",
            metrics.inflight.clone(),
        );
        metrics
    }
}
