use tracing::trace;

// Lightweight metrics helpers that are safe in demo builds.
// These intentionally avoid pulling in metrics macros to keep deps stable.

pub fn inc_requests(route: &'static str) {
    trace!(target = "sync.metrics", route = route, "requests_total_inc");
}

pub fn pages_fetched(source: &str, pages: u32) {
    trace!(
        target = "sync.metrics",
        source = source,
        pages = pages,
        "feed_pages_fetched"
    );
}

pub fn images_cached(source: &str, count: u64) {
    trace!(
        target = "sync.metrics",
        source = source,
        count = count,
        "images_cached_total"
    );
}

pub fn run_elapsed(source: &str, elapsed_ms: u128) {
    trace!(
        target = "sync.metrics",
        source = source,
        elapsed_ms = elapsed_ms as u64,
        "run_elapsed"
    );
}
