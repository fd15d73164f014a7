//! Thin adapter over the `metrics` facade.
//!
//! Everything the resolver measures funnels through here so the metric
//! names and label sets stay in one place. Whether anything listens is
//! the embedding application's concern; installing an exporter is out of
//! scope for the core.

use std::time::Duration;

use metrics::{decrement_gauge, gauge, histogram, increment_counter, increment_gauge};

use crate::protocols::protocol::QueryType;

pub fn query_received(qtype: QueryType) {
    increment_counter!("dns_queries_total");
    increment_counter!("dns_queries_by_type", "type" => qtype.label());
}

pub fn query_duration(duration: Duration) {
    histogram!("dns_query_duration", duration.as_secs_f64() * 1000.0);
}

pub fn query_blocked(stage: &'static str, rule: Option<&str>, source: Option<&str>, qtype: QueryType) {
    increment_counter!(
        "dns_blocked_queries",
        "stage" => stage,
        "rule" => rule.unwrap_or("").to_string(),
        "source" => source.unwrap_or("").to_string(),
        "type" => qtype.label()
    );
}

pub fn query_forwarded(path: &'static str, upstream: &str, qtype: QueryType) {
    increment_counter!(
        "dns_forwarded_queries",
        "path" => path,
        "upstream" => upstream.to_string(),
        "type" => qtype.label()
    );
}

pub fn query_whitelisted() {
    increment_counter!("dns_whitelisted_queries");
}

pub fn rate_limit_violation(label: &str) {
    increment_counter!("rate_limit_violations", "limiter" => label.to_string());
}

pub fn rate_limit_dropped() {
    increment_counter!("rate_limit_dropped");
}

pub fn cache_hit() {
    increment_counter!("cache_hits");
}

pub fn cache_miss() {
    increment_counter!("cache_misses");
}

pub fn cache_set() {
    increment_counter!("cache_sets");
}

pub fn cache_evictions(count: u64) {
    if count > 0 {
        metrics::counter!("cache_evictions", count);
    }
}

pub fn query_log_dropped() {
    increment_counter!("query_log_dropped");
}

pub fn query_log_buffered(depth: usize) {
    gauge!("query_log_buffered", depth as f64);
}

pub fn client_connected() {
    increment_gauge!("active_clients", 1.0);
}

pub fn client_disconnected() {
    decrement_gauge!("active_clients", 1.0);
}
