//! Conditional forwarding: upstream selection by domain, client and
//! query type, against a priority-ordered rule list.

use std::net::IpAddr;

use arc_swap::ArcSwap;
use std::sync::Arc;

use crate::forward::forwarder::Upstream;
use crate::network_utilities::netutil::IpPrefix;
use crate::protocols::protocol::QueryType;

/// Matches a domain exactly, or any proper child of a suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainPattern {
    Exact(String),
    Wildcard(String),
}

impl DomainPattern {
    /// Builds a pattern from its configuration form: `*.zone` becomes a
    /// wildcard, anything else an exact name.
    pub fn parse(raw: &str) -> DomainPattern {
        let raw = raw.trim_end_matches('.').to_lowercase();
        match raw.strip_prefix("*.") {
            Some(zone) => DomainPattern::Wildcard(zone.to_string()),
            None => DomainPattern::Exact(raw),
        }
    }

    pub fn matches(&self, domain: &str) -> bool {
        let domain = domain.trim_end_matches('.').to_lowercase();
        match self {
            DomainPattern::Exact(name) => domain == *name,
            DomainPattern::Wildcard(zone) => {
                domain.len() > zone.len()
                    && domain.ends_with(zone.as_str())
                    && domain.as_bytes()[domain.len() - zone.len() - 1] == b'.'
            }
        }
    }
}

/// One conditional forwarding rule. `clients` and `qtypes` are optional
/// narrowing conditions; absent means "any".
#[derive(Debug, Clone)]
pub struct ConditionalRule {
    pub name: String,
    pub priority: i32,
    pub domain: DomainPattern,
    pub clients: Option<Vec<IpPrefix>>,
    pub qtypes: Option<Vec<QueryType>>,
    pub upstreams: Vec<Upstream>,
    pub enabled: bool,
}

impl ConditionalRule {
    fn matches(&self, domain: &str, client: IpAddr, qtype: QueryType) -> bool {
        if !self.enabled || !self.domain.matches(domain) {
            return false;
        }

        if let Some(clients) = &self.clients {
            if !clients.iter().any(|prefix| prefix.contains(client)) {
                return false;
            }
        }

        if let Some(qtypes) = &self.qtypes {
            if !qtypes.contains(&qtype) {
                return false;
            }
        }

        true
    }
}

/// Holds the rule list sorted by priority, highest first. Ties keep
/// their configured order. Swapped wholesale on reload.
pub struct ConditionalResolver {
    rules: ArcSwap<Vec<ConditionalRule>>,
}

impl Default for ConditionalResolver {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl ConditionalResolver {
    pub fn new(mut rules: Vec<ConditionalRule>) -> ConditionalResolver {
        rules.sort_by_key(|rule| std::cmp::Reverse(rule.priority));
        ConditionalResolver {
            rules: ArcSwap::from_pointee(rules),
        }
    }

    pub fn replace(&self, mut rules: Vec<ConditionalRule>) {
        rules.sort_by_key(|rule| std::cmp::Reverse(rule.priority));
        self.rules.store(Arc::new(rules));
    }

    pub fn rule_count(&self) -> usize {
        self.rules.load().len()
    }

    /// The first matching rule's name and upstream set, or `None` when
    /// no rule claims this query.
    pub fn upstreams_for(
        &self,
        domain: &str,
        client: IpAddr,
        qtype: QueryType,
    ) -> Option<(String, Vec<Upstream>)> {
        let rules = self.rules.load();
        rules
            .iter()
            .find(|rule| rule.matches(domain, client, qtype))
            .map(|rule| (rule.name.clone(), rule.upstreams.clone()))
    }
}
