//! Blocklist membership checks against an atomically swappable snapshot.
//!
//! List ingestion happens elsewhere; this module only answers "is this
//! domain blocked right now, and by which list". Readers always see one
//! consistent snapshot for the duration of a lookup, and a reload swaps
//! the whole snapshot in a single atomic store.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::metrics::recorder;

fn canonical(domain: &str) -> String {
    domain.trim_end_matches('.').to_lowercase()
}

/// True when `domain` equals `suffix` or sits below it on a label
/// boundary, so `ads.example` covers `ads.example` and `x.ads.example`
/// but not `bads.example`.
fn suffix_matches(domain: &str, suffix: &str) -> bool {
    if domain == suffix {
        return true;
    }
    domain.len() > suffix.len()
        && domain.ends_with(suffix)
        && domain.as_bytes()[domain.len() - suffix.len() - 1] == b'.'
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    None,
    Exact,
    Pattern,
    Whitelisted,
}

#[derive(Debug, Clone)]
pub struct MatchResult {
    pub blocked: bool,
    pub kind: MatchKind,
    pub pattern: String,
    pub sources: Vec<String>,
}

impl MatchResult {
    fn clean() -> MatchResult {
        MatchResult {
            blocked: false,
            kind: MatchKind::None,
            pattern: String::new(),
            sources: Vec::new(),
        }
    }

    fn whitelisted() -> MatchResult {
        MatchResult {
            blocked: false,
            kind: MatchKind::Whitelisted,
            pattern: String::new(),
            sources: Vec::new(),
        }
    }
}

/// An immutable blocklist epoch: exact names plus suffix patterns, each
/// attributed to the lists it came from.
#[derive(Debug, Default)]
pub struct BlocklistSnapshot {
    exact: HashMap<String, Vec<String>>,
    patterns: Vec<(String, Vec<String>)>,
}

impl BlocklistSnapshot {
    pub fn new() -> BlocklistSnapshot {
        BlocklistSnapshot::default()
    }

    pub fn add_exact(&mut self, domain: &str, source: &str) {
        self.exact
            .entry(canonical(domain))
            .or_default()
            .push(source.to_string());
    }

    /// Adds a suffix pattern; `*.ads.example` and `ads.example` mean the
    /// same thing here.
    pub fn add_pattern(&mut self, pattern: &str, source: &str) {
        let suffix = canonical(pattern.trim_start_matches("*."));
        if let Some((_, sources)) = self
            .patterns
            .iter_mut()
            .find(|(existing, _)| *existing == suffix)
        {
            sources.push(source.to_string());
        } else {
            self.patterns.push((suffix, vec![source.to_string()]));
        }
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.patterns.is_empty()
    }

    fn lookup(&self, domain: &str) -> MatchResult {
        if let Some(sources) = self.exact.get(domain) {
            return MatchResult {
                blocked: true,
                kind: MatchKind::Exact,
                pattern: domain.to_string(),
                sources: sources.clone(),
            };
        }

        for (suffix, sources) in &self.patterns {
            if suffix_matches(domain, suffix) {
                return MatchResult {
                    blocked: true,
                    kind: MatchKind::Pattern,
                    pattern: format!("*.{}", suffix),
                    sources: sources.clone(),
                };
            }
        }

        MatchResult::clean()
    }
}

/// Domains that are never blocked, consulted before the blocklist.
#[derive(Debug, Default)]
pub struct Whitelist {
    exact: HashSet<String>,
    patterns: Vec<String>,
}

impl Whitelist {
    pub fn new() -> Whitelist {
        Whitelist::default()
    }

    pub fn add_exact(&mut self, domain: &str) {
        self.exact.insert(canonical(domain));
    }

    pub fn add_pattern(&mut self, pattern: &str) {
        self.patterns
            .push(canonical(pattern.trim_start_matches("*.")));
    }

    fn contains(&self, domain: &str) -> bool {
        if self.exact.contains(domain) {
            return true;
        }
        self.patterns
            .iter()
            .any(|suffix| suffix_matches(domain, suffix))
    }
}

/// The runtime matcher: one swappable blocklist snapshot, one swappable
/// whitelist, and a counter for whitelist saves.
pub struct Matcher {
    snapshot: ArcSwap<BlocklistSnapshot>,
    whitelist: ArcSwap<Whitelist>,
    whitelist_hits: AtomicU64,
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Matcher {
    pub fn new() -> Matcher {
        Matcher {
            snapshot: ArcSwap::from_pointee(BlocklistSnapshot::new()),
            whitelist: ArcSwap::from_pointee(Whitelist::new()),
            whitelist_hits: AtomicU64::new(0),
        }
    }

    /// Installs a freshly ingested blocklist epoch.
    pub fn publish(&self, snapshot: BlocklistSnapshot) {
        self.snapshot.store(Arc::new(snapshot));
    }

    pub fn publish_whitelist(&self, whitelist: Whitelist) {
        self.whitelist.store(Arc::new(whitelist));
    }

    pub fn whitelist_hits(&self) -> u64 {
        self.whitelist_hits.load(Ordering::Relaxed)
    }

    /// Checks a domain. A whitelisted domain always comes back clean,
    /// whatever the blocklist says.
    pub fn matches(&self, domain: &str) -> MatchResult {
        let domain = canonical(domain);

        if self.whitelist.load().contains(&domain) {
            self.whitelist_hits.fetch_add(1, Ordering::Relaxed);
            recorder::query_whitelisted();
            return MatchResult::whitelisted();
        }

        self.snapshot.load().lookup(&domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher_with(entries: &[(&str, bool)]) -> Matcher {
        let matcher = Matcher::new();
        let mut snapshot = BlocklistSnapshot::new();
        for (domain, is_pattern) in entries {
            if *is_pattern {
                snapshot.add_pattern(domain, "test-list");
            } else {
                snapshot.add_exact(domain, "test-list");
            }
        }
        matcher.publish(snapshot);
        matcher
    }

    #[test]
    fn test_exact_match() {
        let matcher = matcher_with(&[("ads.example.com", false)]);

        let result = matcher.matches("ads.example.com");
        assert!(result.blocked);
        assert_eq!(result.kind, MatchKind::Exact);
        assert_eq!(result.sources, vec!["test-list".to_string()]);

        assert!(!matcher.matches("example.com").blocked);
    }

    #[test]
    fn test_match_is_case_insensitive() {
        let matcher = matcher_with(&[("Ads.Example.COM", false)]);
        assert!(matcher.matches("ADS.example.com.").blocked);
    }

    #[test]
    fn test_pattern_match_respects_label_boundary() {
        let matcher = matcher_with(&[("tracker.net", true)]);

        assert!(matcher.matches("tracker.net").blocked);
        assert!(matcher.matches("cdn.tracker.net").blocked);
        assert!(matcher.matches("a.b.tracker.net").blocked);
        assert!(!matcher.matches("nottracker.net").blocked);
    }

    #[test]
    fn test_whitelist_wins() {
        let matcher = matcher_with(&[("allowed.test", false), ("tracker.net", true)]);

        let mut whitelist = Whitelist::new();
        whitelist.add_exact("allowed.test");
        whitelist.add_pattern("*.tracker.net");
        matcher.publish_whitelist(whitelist);

        let result = matcher.matches("allowed.test");
        assert!(!result.blocked);
        assert_eq!(result.kind, MatchKind::Whitelisted);

        assert!(!matcher.matches("cdn.tracker.net").blocked);
        assert_eq!(matcher.whitelist_hits(), 2);
    }

    #[test]
    fn test_snapshot_swap_takes_effect() {
        let matcher = matcher_with(&[("old.example", false)]);
        assert!(matcher.matches("old.example").blocked);

        let mut fresh = BlocklistSnapshot::new();
        fresh.add_exact("new.example", "v2");
        matcher.publish(fresh);

        assert!(!matcher.matches("old.example").blocked);
        assert!(matcher.matches("new.example").blocked);
    }

    #[test]
    fn test_sources_accumulate_per_pattern() {
        let mut snapshot = BlocklistSnapshot::new();
        snapshot.add_pattern("*.ads.example", "list-a");
        snapshot.add_pattern("ads.example", "list-b");

        let matcher = Matcher::new();
        matcher.publish(snapshot);

        let result = matcher.matches("x.ads.example");
        assert_eq!(
            result.sources,
            vec!["list-a".to_string(), "list-b".to_string()]
        );
    }
}
