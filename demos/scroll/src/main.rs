//! Scroll a viewport over a slow, paged dataset.
//!
//! The demo serves generated customers through a provider that sleeps before every fetch, then
//! drives a [commonware_pager::View] through a random walk of scrolls and jumps. Midway through,
//! customers are added and removed upstream to show the collection resetting itself, and the store
//! briefly goes offline to show failures being surfaced and retried.
//!
//! In `blocking` mode every miss stalls the walk until the page arrives. In `background` mode
//! misses are fetched by a thread pool while the walk continues to render placeholders.
//!
//! # Usage
//!
//! ```sh
//! cargo run --release --bin commonware-pager-scroll -- --mode background --fetch-delay 50
//! ```
//!
//! Metrics are printed in the Prometheus text format when the walk ends.

mod customers;

use clap::{value_parser, Arg, ArgAction, Command};
use commonware_pager::{
    Background, Blocking, Collection, Config, Error, Event, Metrics, Pool, Slot, SystemClock, View,
};
use customers::{Customer, Customers};
use prometheus_client::{encoding::text::encode, registry::Registry};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{num::NonZeroUsize, thread, time::Duration};
use tracing::{debug, info, warn};

/// How long to wait between polls for background completions.
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// How many polls to wait for a viewport before rendering it incomplete.
const MAX_POLLS: usize = 500;

/// Parameters of the scroll walk.
struct Walk {
    steps: usize,
    viewport: u64,
    seed: u64,
}

fn main() {
    // Parse arguments
    let matches = Command::new("commonware-pager-scroll")
        .about("scroll a viewport over a slow, paged dataset")
        .arg(
            Arg::new("items")
                .long("items")
                .default_value("10000")
                .value_parser(value_parser!(u64))
                .help("Number of customers in the store"),
        )
        .arg(
            Arg::new("page-size")
                .long("page-size")
                .default_value("100")
                .value_parser(value_parser!(usize))
                .help("Number of customers fetched together"),
        )
        .arg(
            Arg::new("cache-pages")
                .long("cache-pages")
                .default_value("5")
                .value_parser(value_parser!(usize))
                .help("Maximum number of resident pages"),
        )
        .arg(
            Arg::new("page-timeout")
                .long("page-timeout")
                .required(false)
                .value_parser(value_parser!(u64))
                .help("Milliseconds a page may go untouched before it is dropped"),
        )
        .arg(
            Arg::new("fetch-delay")
                .long("fetch-delay")
                .default_value("20")
                .value_parser(value_parser!(u64))
                .help("Milliseconds the store sleeps before serving a fetch"),
        )
        .arg(
            Arg::new("threads")
                .long("threads")
                .default_value("4")
                .value_parser(value_parser!(usize))
                .help("Fetch threads (background mode)"),
        )
        .arg(
            Arg::new("mode")
                .long("mode")
                .default_value("blocking")
                .value_parser(["blocking", "background"]),
        )
        .arg(
            Arg::new("steps")
                .long("steps")
                .default_value("40")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("viewport")
                .long("viewport")
                .default_value("20")
                .value_parser(value_parser!(u64))
                .help("Rows visible at once"),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .default_value("0")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Log every fetch"),
        )
        .get_matches();

    // Create logger
    let level = if matches.get_flag("verbose") {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    // Configure collection
    let page_size = *matches.get_one::<usize>("page-size").unwrap();
    let cache_pages = *matches.get_one::<usize>("cache-pages").unwrap();
    let cfg = Config {
        page_size: NonZeroUsize::new(page_size).expect("page size must be non-zero"),
        cache_pages: NonZeroUsize::new(cache_pages).expect("cache pages must be non-zero"),
        page_timeout: matches
            .get_one::<u64>("page-timeout")
            .map(|ms| Duration::from_millis(*ms)),
    };
    let items = *matches.get_one::<u64>("items").unwrap();
    let delay = Duration::from_millis(*matches.get_one::<u64>("fetch-delay").unwrap());
    let customers = Customers::new(items, delay);
    let walk = Walk {
        steps: *matches.get_one::<usize>("steps").unwrap(),
        viewport: *matches.get_one::<u64>("viewport").unwrap(),
        seed: *matches.get_one::<u64>("seed").unwrap(),
    };
    info!(items, ?cfg, ?delay, "configured store");

    // Register metrics
    let mut registry = Registry::default();
    let metrics = Metrics::init(registry.sub_registry_with_prefix("pager"));

    // Run walk
    let mode = matches.get_one::<String>("mode").unwrap();
    let result = match mode.as_str() {
        "blocking" => {
            let collection =
                Blocking::with_context(customers.clone(), SystemClock, metrics, cfg);
            View::new(collection).and_then(|mut view| run(&mut view, &customers, &walk))
        }
        "background" => {
            let threads = *matches.get_one::<usize>("threads").unwrap();
            let threads = NonZeroUsize::new(threads).expect("threads must be non-zero");
            let pool = Pool::with_threads(threads).expect("failed to build thread pool");
            let collection =
                Background::with_context(customers.clone(), pool, SystemClock, metrics, cfg);
            View::new(collection).and_then(|mut view| run(&mut view, &customers, &walk))
        }
        _ => unreachable!("mode is validated by clap"),
    };
    if let Err(err) = result {
        warn!(?err, "walk aborted");
    }

    // Print metrics
    let mut buffer = String::new();
    encode(&mut buffer, &registry).expect("failed to encode metrics");
    println!("{buffer}");
}

/// Walks the viewport through random scrolls and jumps, changing the store along the way.
fn run<S>(view: &mut View<S>, customers: &Customers, walk: &Walk) -> Result<(), Error>
where
    S: Collection<Item = Customer>,
{
    let mut events = view.collection_mut().subscribe();

    // Wait for the first count (background collections start out empty)
    for _ in 0..MAX_POLLS {
        view.process()?;
        if !view.is_empty()? {
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }
    let count = view.count()?;
    info!(count, "store ready");

    let mut rng = StdRng::seed_from_u64(walk.seed);
    let mut resets = 0;
    for step in 0..walk.steps {
        // Change the store upstream
        if step == walk.steps / 2 {
            for _ in 0..3 {
                customers.insert();
            }
            customers.remove();
            info!(step, "store changed upstream");
        }
        if step == walk.steps / 3 {
            customers.set_offline(true);
            info!(step, "store went offline");
        }
        if step == walk.steps / 3 + 1 {
            customers.set_offline(false);
            info!(step, "store back online");
        }

        // Scroll or jump
        let count = view.count()?;
        let top = if rng.gen_bool(0.8) {
            let scrolled = view.current_position()?.max(0) + rng.gen_range(1..=3) as i64;
            scrolled.min(count.saturating_sub(1) as i64)
        } else {
            rng.gen_range(0..count.max(1)) as i64
        };
        match view.move_to_position(top) {
            Ok(_) => {}
            Err(Error::Provider(err)) => {
                warn!(step, %err, "move failed, retrying next step");
                continue;
            }
            Err(err) => return Err(err),
        }

        // Render the viewport
        let rows = settle(view, top, walk.viewport)?;
        let count = view.count()?;
        let first = rows.first().map(|c| c.id);
        let last = rows.last().map(|c| c.name.as_str()).unwrap_or("-");
        info!(step, top, count, ?first, last, rows = rows.len(), "rendered viewport");

        // Report collection events
        while let Ok(Some(event)) = events.try_next() {
            match event {
                Event::Reset => resets += 1,
                Event::Failed(err) => warn!(step, %err, "fetch failed"),
                event => debug!(step, ?event, "collection event"),
            }
        }
    }
    info!(resets, "walk complete");
    Ok(())
}

/// Reads the rows of the viewport starting at `top`, waiting (for a bounded number of polls) for
/// pending pages to arrive.
fn settle<S>(view: &mut View<S>, top: i64, viewport: u64) -> Result<Vec<Customer>, Error>
where
    S: Collection<Item = Customer>,
{
    let top = top.max(0) as u64;
    let mut polls = 0;
    loop {
        let mut rows = Vec::new();
        let mut pending = 0;
        for index in top..top.saturating_add(viewport) {
            match view.collection_mut().get(index) {
                Ok(Slot::Ready(customer)) => rows.push(customer.clone()),
                Ok(Slot::Pending) => pending += 1,
                Ok(Slot::Vacant) => break,
                Err(err @ Error::Provider(_)) => {
                    warn!(index, %err, "row unavailable");
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        if pending == 0 {
            return Ok(rows);
        }
        if polls == MAX_POLLS {
            warn!(pending, "viewport incomplete");
            return Ok(rows);
        }
        polls += 1;
        debug!(pending, "waiting for pages");
        thread::sleep(POLL_INTERVAL);
        view.process()?;
    }
}
