//! The policy engine: programmable per-query rules evaluated before the
//! blocklist, so operators can allow, redirect, forward or throttle with
//! precedence over list-based blocking.
//!
//! Expression parsing happens outside the core; rules arrive here
//! already compiled into [`RuleExpression`] trees.

use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::forward::forwarder::Upstream;
use crate::network_utilities::netutil::IpPrefix;
use crate::protocols::protocol::QueryType;
use crate::ratelimit::limiter::{LimitAction, RateLimiter};

/// What a rule matched against: the query and who asked it.
#[derive(Debug, Clone, Copy)]
pub struct PolicyContext<'a> {
    pub domain: &'a str,
    pub client: IpAddr,
    pub qtype: QueryType,
}

/// A compiled rule predicate.
#[derive(Debug, Clone)]
pub enum RuleExpression {
    Always,
    DomainEquals(String),
    /// The name itself or anything below it.
    DomainSuffix(String),
    ClientEquals(IpAddr),
    ClientInPrefix(IpPrefix),
    QtypeIs(QueryType),
    AllOf(Vec<RuleExpression>),
    AnyOf(Vec<RuleExpression>),
    Not(Box<RuleExpression>),
}

impl RuleExpression {
    pub fn matches(&self, ctx: &PolicyContext<'_>) -> bool {
        let domain = ctx.domain.trim_end_matches('.').to_lowercase();
        self.matches_canonical(&domain, ctx)
    }

    fn matches_canonical(&self, domain: &str, ctx: &PolicyContext<'_>) -> bool {
        match self {
            RuleExpression::Always => true,
            RuleExpression::DomainEquals(name) => domain == name.as_str(),
            RuleExpression::DomainSuffix(suffix) => {
                domain == suffix.as_str()
                    || (domain.len() > suffix.len()
                        && domain.ends_with(suffix.as_str())
                        && domain.as_bytes()[domain.len() - suffix.len() - 1] == b'.')
            }
            RuleExpression::ClientEquals(addr) => ctx.client == *addr,
            RuleExpression::ClientInPrefix(prefix) => prefix.contains(ctx.client),
            RuleExpression::QtypeIs(qtype) => ctx.qtype == *qtype,
            RuleExpression::AllOf(parts) => {
                parts.iter().all(|part| part.matches_canonical(domain, ctx))
            }
            RuleExpression::AnyOf(parts) => {
                parts.iter().any(|part| part.matches_canonical(domain, ctx))
            }
            RuleExpression::Not(inner) => !inner.matches_canonical(domain, ctx),
        }
    }
}

/// The action a matched rule dispatches. Data rides with the variant.
#[derive(Clone)]
pub enum Action {
    /// Answer NXDOMAIN.
    Block,
    /// Skip the blocklist and resolve upstream as if never listed.
    Allow,
    /// Synthesize an address answer pointing at `target`.
    Redirect { target: String },
    /// Resolve through this rule's own upstream set.
    Forward { upstreams: Vec<Upstream> },
    /// Throttle matching clients; below the limit the rule is inert and
    /// evaluation falls through to later rules.
    RateLimit {
        limiter: Arc<RateLimiter>,
        on_limit: LimitAction,
    },
}

/// Discriminant-only view of [`Action`] for capability checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Block,
    Allow,
    Redirect,
    Forward,
    RateLimit,
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Block => ActionKind::Block,
            Action::Allow => ActionKind::Allow,
            Action::Redirect { .. } => ActionKind::Redirect,
            Action::Forward { .. } => ActionKind::Forward,
            Action::RateLimit { .. } => ActionKind::RateLimit,
        }
    }
}

#[derive(Clone)]
pub struct Rule {
    pub name: String,
    pub priority: i32,
    pub expression: RuleExpression,
    pub action: Action,
    pub enabled: bool,
    /// Operator opt-in: let a Block result be stored in the response
    /// cache. Off by default so policy edits bite immediately.
    pub cache_blocked: bool,
}

impl Rule {
    pub fn new(name: &str, priority: i32, expression: RuleExpression, action: Action) -> Rule {
        Rule {
            name: name.to_string(),
            priority,
            expression,
            action,
            enabled: true,
            cache_blocked: false,
        }
    }
}

pub struct PolicyEngine {
    rules: ArcSwap<Vec<Arc<Rule>>>,
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl PolicyEngine {
    pub fn new(rules: Vec<Rule>) -> PolicyEngine {
        PolicyEngine {
            rules: ArcSwap::from_pointee(Self::sorted(rules)),
        }
    }

    pub fn replace(&self, rules: Vec<Rule>) {
        self.rules.store(Arc::new(Self::sorted(rules)));
    }

    fn sorted(rules: Vec<Rule>) -> Vec<Arc<Rule>> {
        let mut rules: Vec<Arc<Rule>> = rules.into_iter().map(Arc::new).collect();
        rules.sort_by_key(|rule| std::cmp::Reverse(rule.priority));
        rules
    }

    /// Number of enabled rules. The pipeline skips the policy stage
    /// entirely when this is zero.
    pub fn count(&self) -> usize {
        self.rules.load().iter().filter(|rule| rule.enabled).count()
    }

    /// Whether any enabled rule carries the given action kind. Used to
    /// hand rate limiting over to policy-scoped limiters.
    pub fn has_action(&self, kind: ActionKind) -> bool {
        self.rules
            .load()
            .iter()
            .any(|rule| rule.enabled && rule.action.kind() == kind)
    }

    /// Walks the rules by priority and returns the first that decides
    /// the query. A rate-limit rule whose client is under its limit
    /// consumes a token but does not decide; evaluation continues.
    pub fn evaluate(&self, ctx: &PolicyContext<'_>) -> Option<Arc<Rule>> {
        let rules = self.rules.load();

        for rule in rules.iter() {
            if !rule.enabled || !rule.expression.matches(ctx) {
                continue;
            }

            if let Action::RateLimit { limiter, .. } = &rule.action {
                let decision = limiter.allow(ctx.client);
                if !decision.limited {
                    continue;
                }
            }

            return Some(Arc::clone(rule));
        }

        None
    }
}
