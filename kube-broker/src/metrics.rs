//! Metric names and recording helpers.
//!
//! Recorded through the [`metrics`] facade; wiring an exporter is the
//! embedding server's concern. Labels are kept low-cardinality: clusters and
//! eviction reasons are bounded sets, and callers are reduced to the domain
//! part of their identifier.

/// Cache hits, labeled by cluster.
pub const CLIENT_CACHE_HITS: &str = "client_cache_hits_total";
/// Cache misses, labeled by cluster.
pub const CLIENT_CACHE_MISSES: &str = "client_cache_misses_total";
/// Cache evictions, labeled by reason (`expired`, `capacity`, `manual`).
pub const CLIENT_CACHE_EVICTIONS: &str = "client_cache_evictions_total";
/// Current number of cache entries.
pub const CLIENT_CACHE_ENTRIES: &str = "client_cache_entries";
/// Privileged secret access attempts, labeled by caller domain and result
/// (`success`, `error`, `rate_limited`, `fallback`).
pub const PRIVILEGED_SECRET_ACCESS: &str = "privileged_secret_access_total";

pub(crate) fn record_cache_hit(cluster: &str) {
    metrics::counter!(CLIENT_CACHE_HITS, "cluster" => cluster.to_string()).increment(1);
}

pub(crate) fn record_cache_miss(cluster: &str) {
    metrics::counter!(CLIENT_CACHE_MISSES, "cluster" => cluster.to_string()).increment(1);
}

pub(crate) fn record_cache_eviction(reason: &'static str) {
    metrics::counter!(CLIENT_CACHE_EVICTIONS, "reason" => reason).increment(1);
}

pub(crate) fn record_cache_size(entries: usize) {
    metrics::gauge!(CLIENT_CACHE_ENTRIES).set(entries as f64);
}

pub(crate) fn record_privileged_access(user: &str, result: &'static str) {
    metrics::counter!(
        PRIVILEGED_SECRET_ACCESS,
        "user_domain" => user_domain(user).to_string(),
        "result" => result,
    )
    .increment(1);
}

/// The domain part of an address-shaped identifier, used as a metric label
/// to keep cardinality bounded by tenant rather than by user.
pub fn user_domain(user: &str) -> &str {
    match user.rsplit_once('@') {
        Some((_, domain)) if !domain.is_empty() => domain,
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_domain_extraction() {
        assert_eq!(user_domain("alice@example.com"), "example.com");
        assert_eq!(user_domain("bob@x"), "x");
        assert_eq!(user_domain("not-an-address"), "unknown");
        assert_eq!(user_domain("trailing@"), "unknown");
        assert_eq!(user_domain(""), "unknown");
    }
}
