use tracing::trace;

// Lightweight metrics helpers that stay safe when no recorder is installed.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "magpie.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "magpie.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn price_cache(outcome: &'static str) {
    trace!(
        target = "magpie.metrics",
        outcome = outcome,
        "price_cache_lookup"
    );
}
