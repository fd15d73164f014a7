//! Configuration snapshots.
//!
//! Loading and hot-reload mechanics live outside the core; what arrives
//! here is a fully formed [`Settings`] value. The pipeline reads exactly
//! one snapshot per request, so a reload mid-query can never produce a
//! half-old, half-new decision. Two runtime kill-switches layer on top
//! of the snapshot for emergency operator use.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde_derive::Deserialize;

use crate::cache::response_cache::CacheLimits;
use crate::forward::conditional::{ConditionalRule, DomainPattern};
use crate::forward::forwarder::Upstream;
use crate::network_utilities::netutil::IpPrefix;
use crate::protocols::protocol::QueryType;
use crate::ratelimit::limiter::LimitAction;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub max_entries: usize,
    pub min_ttl: u32,
    pub max_ttl: u32,
    pub negative_ttl: u32,
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            enabled: true,
            max_entries: 10_000,
            min_ttl: 0,
            max_ttl: 86_400,
            negative_ttl: 300,
        }
    }
}

impl CacheSettings {
    pub fn limits(&self) -> CacheLimits {
        CacheLimits {
            max_entries: self.max_entries,
            min_ttl: self.min_ttl,
            max_ttl: self.max_ttl,
            negative_ttl: self.negative_ttl,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub per_second: f64,
    pub burst: f64,
    pub action: LimitAction,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        RateLimitSettings {
            enabled: false,
            per_second: 20.0,
            burst: 50.0,
            action: LimitAction::Drop,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConditionalRuleSettings {
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    pub domain: String,
    #[serde(default)]
    pub clients: Option<Vec<IpPrefix>>,
    #[serde(default)]
    pub qtypes: Option<Vec<QueryType>>,
    pub upstreams: Vec<Upstream>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ConditionalRuleSettings {
    pub fn compile(&self) -> ConditionalRule {
        ConditionalRule {
            name: self.name.clone(),
            priority: self.priority,
            domain: DomainPattern::parse(&self.domain),
            clients: self.clients.clone(),
            qtypes: self.qtypes.clone(),
            upstreams: self.upstreams.clone(),
            enabled: self.enabled,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConditionalForwardingSettings {
    pub rules: Vec<ConditionalRuleSettings>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub enable_policies: bool,
    pub enable_blocklist: bool,
    pub decision_trace: bool,
    pub cache: CacheSettings,
    pub udp_enabled: bool,
    pub tcp_enabled: bool,
    pub dot_enabled: bool,
    pub udp_bind: String,
    pub tcp_bind: String,
    pub dot_bind: String,
    pub upstream_dns_servers: Vec<Upstream>,
    pub conditional_forwarding: ConditionalForwardingSettings,
    pub rate_limit: RateLimitSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            enable_policies: true,
            enable_blocklist: true,
            decision_trace: false,
            cache: CacheSettings::default(),
            udp_enabled: true,
            tcp_enabled: true,
            dot_enabled: false,
            udp_bind: "0.0.0.0:53".to_string(),
            tcp_bind: "0.0.0.0:53".to_string(),
            dot_bind: "0.0.0.0:853".to_string(),
            upstream_dns_servers: Vec::new(),
            conditional_forwarding: ConditionalForwardingSettings::default(),
            rate_limit: RateLimitSettings::default(),
        }
    }
}

/// The live configuration: an atomically swappable snapshot plus the
/// runtime kill-switches that override it.
pub struct ConfigHandle {
    current: ArcSwap<Settings>,
    blocklist_disabled: AtomicBool,
    policies_disabled: AtomicBool,
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

impl ConfigHandle {
    pub fn new(settings: Settings) -> ConfigHandle {
        ConfigHandle {
            current: ArcSwap::from_pointee(settings),
            blocklist_disabled: AtomicBool::new(false),
            policies_disabled: AtomicBool::new(false),
        }
    }

    /// One consistent view for the duration of a request.
    pub fn snapshot(&self) -> Arc<Settings> {
        self.current.load_full()
    }

    pub fn replace(&self, settings: Settings) {
        self.current.store(Arc::new(settings));
    }

    pub fn disable_blocklist(&self, disabled: bool) {
        self.blocklist_disabled.store(disabled, Ordering::SeqCst);
    }

    pub fn is_blocklist_disabled(&self) -> bool {
        self.blocklist_disabled.load(Ordering::SeqCst)
    }

    pub fn disable_policies(&self, disabled: bool) {
        self.policies_disabled.store(disabled, Ordering::SeqCst);
    }

    pub fn is_policies_disabled(&self) -> bool {
        self.policies_disabled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert!(settings.enable_policies);
        assert!(settings.enable_blocklist);
        assert!(!settings.decision_trace);
        assert!(settings.cache.enabled);
        assert_eq!(settings.cache.max_entries, 10_000);
        assert_eq!(settings.cache.negative_ttl, 300);
        assert!(!settings.rate_limit.enabled);
    }

    #[test]
    fn test_kill_switches_default_off() {
        let handle = ConfigHandle::default();
        assert!(!handle.is_blocklist_disabled());
        assert!(!handle.is_policies_disabled());

        handle.disable_blocklist(true);
        assert!(handle.is_blocklist_disabled());
        handle.disable_blocklist(false);
        assert!(!handle.is_blocklist_disabled());
    }

    #[test]
    fn test_snapshot_swap() {
        let handle = ConfigHandle::default();
        let before = handle.snapshot();

        let mut next = Settings::default();
        next.decision_trace = true;
        handle.replace(next);

        assert!(!before.decision_trace, "old snapshot stays consistent");
        assert!(handle.snapshot().decision_trace);
    }

    #[test]
    fn test_conditional_rule_compiles() {
        let rule = ConditionalRuleSettings {
            name: "lab".to_string(),
            priority: 40,
            domain: "*.lab.local".to_string(),
            clients: None,
            qtypes: None,
            upstreams: vec!["10.0.0.1:53".parse().unwrap()],
            enabled: true,
        };

        let compiled = rule.compile();
        assert!(compiled.domain.matches("a.lab.local"));
        assert_eq!(compiled.upstreams.len(), 1);
    }
}
