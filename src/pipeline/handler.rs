//! The per-query decision pipeline.
//!
//! Stages run in a fixed order and the first one that produces an answer
//! wins: local records, then policies, then the blocklist and overrides,
//! then the response cache, then conditional forwarding, then the
//! default upstream. Policy and blocklist decisions are always taken
//! fresh; only upstream-derived content is ever served from the cache,
//! so an operator edit is live on the very next query.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use chrono::Local;
use tracing::warn;

use crate::blocklist::matcher::{MatchKind, Matcher};
use crate::blocklist::overrides::Overrides;
use crate::cache::response_cache::ResponseCache;
use crate::config::settings::{ConfigHandle, Settings};
use crate::forward::conditional::ConditionalResolver;
use crate::forward::forwarder::{ForwardError, Forwarder, Upstream};
use crate::logging::query_log::{QueryLog, TraceEntry};
use crate::logging::query_logger::QueryLogger;
use crate::metrics::recorder;
use crate::pipeline::outcome::{OutcomePool, QueryOutcome, TracePool, TraceRecorder};
use crate::policy::engine::{Action, ActionKind, PolicyContext, PolicyEngine, Rule};
use crate::protocols::edns::{self, EdnsInfo};
use crate::protocols::protocol::{
    DnsPacket, DnsQuestion, DnsRecord, QueryType, ResultCode, TransientTtl,
};
use crate::ratelimit::limiter::{LimitAction, RateLimiter};
use crate::records::local_records::LocalRecords;

/// TTL for answers synthesized by redirects and overrides.
const SYNTHESIZED_TTL: u32 = 300;

/// Everything the pipeline consults, owned as shared handles.
pub struct HandlerServices {
    pub records: Arc<LocalRecords>,
    pub policy: Arc<PolicyEngine>,
    pub matcher: Arc<Matcher>,
    pub overrides: Arc<Overrides>,
    pub cache: Arc<ResponseCache>,
    pub conditional: Arc<ConditionalResolver>,
    pub forwarder: Option<Arc<dyn Forwarder>>,
    pub limiter: Option<Arc<RateLimiter>>,
    pub logger: Arc<QueryLogger>,
    pub config: Arc<ConfigHandle>,
}

pub struct QueryHandler {
    services: HandlerServices,
    outcomes: OutcomePool,
    traces: TracePool,
}

impl QueryHandler {
    pub fn new(services: HandlerServices) -> QueryHandler {
        QueryHandler {
            services,
            outcomes: OutcomePool::new(1024),
            traces: TracePool::new(1024),
        }
    }

    pub fn config(&self) -> &Arc<ConfigHandle> {
        &self.services.config
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.services.cache
    }

    pub fn limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.services.limiter.as_ref()
    }

    /// Runs one request through the pipeline and returns the response to
    /// write. Exactly one response comes back for every call; errors are
    /// absorbed into response codes.
    pub async fn handle(&self, client_ip: IpAddr, request: DnsPacket) -> DnsPacket {
        let started = Instant::now();
        let snapshot = self.services.config.snapshot();
        let edns = EdnsInfo::extract(&request);

        let mut outcome = self.outcomes.acquire();
        let mut trace = self.traces.recorder(snapshot.decision_trace);

        let question = request.questions.first().cloned();
        if let Some(question) = &question {
            recorder::query_received(question.qtype);
        }

        let mut response = match &question {
            None => {
                trace.record(TraceEntry::new("guard", "formerr"));
                self.base_response(&request, ResultCode::FORMERR)
            }
            Some(question) => {
                self.decide(
                    client_ip,
                    &request,
                    question,
                    &edns,
                    &snapshot,
                    &mut outcome,
                    &mut trace,
                )
                .await
            }
        };

        edns::apply(&mut response, &edns);
        response.header.id = request.header.id;
        outcome.response_code = response.header.rescode;

        let elapsed = started.elapsed();
        recorder::query_duration(elapsed);

        self.services.logger.log_async(QueryLog {
            timestamp: Local::now(),
            client_ip: client_ip.to_string(),
            domain: question
                .as_ref()
                .map(|q| q.name.clone())
                .unwrap_or_default(),
            qtype: question
                .as_ref()
                .map(|q| q.qtype.label())
                .unwrap_or_default(),
            response_code: format!("{:?}", response.header.rescode),
            blocked: outcome.blocked,
            cached: outcome.cached,
            response_time_ms: elapsed.as_secs_f64() * 1000.0,
            upstream_time_ms: outcome.upstream_duration.as_secs_f64() * 1000.0,
            upstream: outcome.upstream.clone(),
            trace: trace.snapshot(),
        });

        self.traces.release(trace);
        self.outcomes.release(outcome);

        response
    }

    /// Responds to a datagram that would not decode at all. The caller
    /// salvages the transaction ID when the first two bytes survived.
    pub fn handle_malformed(&self, client_ip: IpAddr, id: u16) -> DnsPacket {
        let mut response = DnsPacket::new();
        response.header.id = id;
        response.header.response = true;
        response.header.recursion_available = true;
        response.header.rescode = ResultCode::FORMERR;

        self.services.logger.log_async(QueryLog {
            timestamp: Local::now(),
            client_ip: client_ip.to_string(),
            domain: String::new(),
            qtype: String::new(),
            response_code: format!("{:?}", ResultCode::FORMERR),
            blocked: false,
            cached: false,
            response_time_ms: 0.0,
            upstream_time_ms: 0.0,
            upstream: None,
            trace: None,
        });

        response
    }

    #[allow(clippy::too_many_arguments)]
    async fn decide(
        &self,
        client_ip: IpAddr,
        request: &DnsPacket,
        question: &DnsQuestion,
        edns: &EdnsInfo,
        snapshot: &Settings,
        outcome: &mut QueryOutcome,
        trace: &mut TraceRecorder,
    ) -> DnsPacket {
        let domain = question.name.trim_end_matches('.').to_lowercase();
        let qtype = question.qtype;

        // Authoritative local data is final; nothing below outranks it.
        let local = self.services.records.query(&domain, qtype);
        if !local.is_empty() {
            trace.record(TraceEntry::new("local_records", "answered"));
            let mut response = self.base_response(request, ResultCode::NOERROR);
            response.header.authoritative_answer = true;
            response.answers = local;
            return response;
        }

        let enable_policies =
            snapshot.enable_policies && !self.services.config.is_policies_disabled();
        let enable_blocklist =
            snapshot.enable_blocklist && !self.services.config.is_blocklist_disabled();

        // The global limiter stands down when any enabled policy rule
        // carries its own limiter.
        if snapshot.rate_limit.enabled {
            if let Some(limiter) = &self.services.limiter {
                let policy_scoped =
                    enable_policies && self.services.policy.has_action(ActionKind::RateLimit);
                if !policy_scoped {
                    let decision = limiter.allow(client_ip);
                    if decision.limited {
                        trace.record(
                            TraceEntry::new("rate_limit", "limited").with_detail(decision.label),
                        );
                        return self.limited_response(request, decision.action);
                    }
                }
            }
        }

        if enable_policies && self.services.policy.count() > 0 {
            let ctx = PolicyContext {
                domain: &domain,
                client: client_ip,
                qtype,
            };
            if let Some(rule) = self.services.policy.evaluate(&ctx) {
                return self
                    .dispatch_policy(rule, request, question, &domain, edns, snapshot, outcome, trace)
                    .await;
            }
        }

        if enable_blocklist {
            let result = self.services.matcher.matches(&domain);
            if result.kind == MatchKind::Whitelisted {
                trace.record(TraceEntry::new("blocklist", "whitelisted"));
            } else if result.blocked {
                // Never cached: a blocklist edit must bite instantly.
                outcome.blocked = true;
                trace.record(
                    TraceEntry::new("blocklist", "block")
                        .with_source(result.sources.join(","))
                        .with_detail(result.pattern.clone()),
                );
                recorder::query_blocked(
                    "blocklist",
                    None,
                    result.sources.first().map(String::as_str),
                    qtype,
                );
                return self.base_response(request, ResultCode::NXDOMAIN);
            }

            if let Some(response) = self.apply_overrides(request, &domain, qtype, trace) {
                return response;
            }
        }

        if snapshot.cache.enabled {
            let (hit, stored_trace) = self.services.cache.get_with_trace(request);
            if let Some(mut cached) = hit {
                outcome.cached = true;
                trace.record(TraceEntry::new("cache", "hit"));
                if let Some(stored) = stored_trace {
                    trace.extend(stored);
                }
                cached.header.id = request.header.id;
                cached.header.response = true;
                cached.header.recursion_available = true;
                cached.header.recursion_desired = request.header.recursion_desired;
                return cached;
            }
        }

        if let Some((rule_name, upstreams)) =
            self.services
                .conditional
                .upstreams_for(&domain, client_ip, qtype)
        {
            trace.record(TraceEntry::new("conditional_forward", "match").with_rule(rule_name));
            return match &self.services.forwarder {
                Some(forwarder) => {
                    self.forward_and_cache(
                        forwarder,
                        request,
                        question,
                        edns,
                        Some(&upstreams),
                        "conditional",
                        ResultCode::SERVFAIL,
                        snapshot,
                        outcome,
                        trace,
                    )
                    .await
                }
                None => self.base_response(request, ResultCode::SERVFAIL),
            };
        }

        if let Some(forwarder) = &self.services.forwarder {
            trace.record(TraceEntry::new("forward", "default"));
            return self
                .forward_and_cache(
                    forwarder,
                    request,
                    question,
                    edns,
                    None,
                    "default",
                    ResultCode::SERVFAIL,
                    snapshot,
                    outcome,
                    trace,
                )
                .await;
        }

        trace.record(TraceEntry::new("fallthrough", "nxdomain"));
        self.base_response(request, ResultCode::NXDOMAIN)
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_policy(
        &self,
        rule: Arc<Rule>,
        request: &DnsPacket,
        question: &DnsQuestion,
        domain: &str,
        edns: &EdnsInfo,
        snapshot: &Settings,
        outcome: &mut QueryOutcome,
        trace: &mut TraceRecorder,
    ) -> DnsPacket {
        match &rule.action {
            Action::Block => {
                outcome.blocked = true;
                trace.record(TraceEntry::new("policy", "block").with_rule(rule.name.clone()));
                recorder::query_blocked("policy", Some(&rule.name), None, question.qtype);

                let response = self.base_response(request, ResultCode::NXDOMAIN);
                if rule.cache_blocked && snapshot.cache.enabled {
                    if let Err(err) =
                        self.services
                            .cache
                            .set_blocked(request, &response, trace.snapshot())
                    {
                        warn!(error = %err, "failed to cache blocked response");
                    }
                }
                response
            }
            Action::Allow => {
                warn!(%domain, rule = %rule.name, "policy allow bypasses blocklist");
                trace.record(TraceEntry::new("policy", "allow").with_rule(rule.name.clone()));

                match &self.services.forwarder {
                    Some(forwarder) => {
                        self.forward_and_cache(
                            forwarder,
                            request,
                            question,
                            edns,
                            None,
                            "policy_allow",
                            ResultCode::NXDOMAIN,
                            snapshot,
                            outcome,
                            trace,
                        )
                        .await
                    }
                    // Allowed but nowhere to resolve it.
                    None => self.base_response(request, ResultCode::NXDOMAIN),
                }
            }
            Action::Redirect { target } => {
                trace.record(
                    TraceEntry::new("policy", "redirect")
                        .with_rule(rule.name.clone())
                        .with_detail(target.clone()),
                );
                self.redirect(request, question, target)
            }
            Action::Forward { upstreams } => {
                trace.record(TraceEntry::new("policy", "forward").with_rule(rule.name.clone()));

                if upstreams.is_empty() {
                    return self.base_response(request, ResultCode::SERVFAIL);
                }
                match &self.services.forwarder {
                    Some(forwarder) => {
                        self.forward_and_cache(
                            forwarder,
                            request,
                            question,
                            edns,
                            Some(upstreams),
                            "policy_forward",
                            ResultCode::SERVFAIL,
                            snapshot,
                            outcome,
                            trace,
                        )
                        .await
                    }
                    None => self.base_response(request, ResultCode::SERVFAIL),
                }
            }
            // Evaluate only returns a rate-limit rule when the client is
            // over its limit; under the limit it falls through inside
            // the engine.
            Action::RateLimit { on_limit, .. } => {
                trace.record(TraceEntry::new("policy", "rate_limited").with_rule(rule.name.clone()));
                self.limited_response(request, *on_limit)
            }
        }
    }

    /// REDIRECT synthesis: an address answer when the target family
    /// matches the question, NODATA when it does not, NXDOMAIN when the
    /// target is not an address at all.
    fn redirect(&self, request: &DnsPacket, question: &DnsQuestion, target: &str) -> DnsPacket {
        let owner = question.name.trim_end_matches('.').to_lowercase();

        match target.parse::<IpAddr>() {
            Ok(IpAddr::V4(addr)) if question.qtype == QueryType::A => {
                let mut response = self.base_response(request, ResultCode::NOERROR);
                response.answers.push(DnsRecord::A {
                    domain: owner,
                    addr,
                    ttl: TransientTtl(SYNTHESIZED_TTL),
                });
                response
            }
            Ok(IpAddr::V6(addr)) if question.qtype == QueryType::AAAA => {
                let mut response = self.base_response(request, ResultCode::NOERROR);
                response.answers.push(DnsRecord::AAAA {
                    domain: owner,
                    addr,
                    ttl: TransientTtl(SYNTHESIZED_TTL),
                });
                response
            }
            // A valid address of the wrong family answers NODATA.
            Ok(_) => self.base_response(request, ResultCode::NOERROR),
            Err(_) => self.base_response(request, ResultCode::NXDOMAIN),
        }
    }

    /// IP and CNAME overrides for a domain the blocklist left alone.
    fn apply_overrides(
        &self,
        request: &DnsPacket,
        domain: &str,
        qtype: QueryType,
        trace: &mut TraceRecorder,
    ) -> Option<DnsPacket> {
        if matches!(qtype, QueryType::A | QueryType::AAAA) {
            if let Some(addr) = self.services.overrides.lookup_ip(domain) {
                trace.record(
                    TraceEntry::new("override", "ip").with_detail(addr.to_string()),
                );

                let mut response = self.base_response(request, ResultCode::NOERROR);
                match (qtype, addr) {
                    (QueryType::A, IpAddr::V4(v4)) => response.answers.push(DnsRecord::A {
                        domain: domain.to_string(),
                        addr: v4,
                        ttl: TransientTtl(SYNTHESIZED_TTL),
                    }),
                    (QueryType::AAAA, IpAddr::V6(v6)) => response.answers.push(DnsRecord::AAAA {
                        domain: domain.to_string(),
                        addr: v6,
                        ttl: TransientTtl(SYNTHESIZED_TTL),
                    }),
                    // Family mismatch stays NODATA, not NXDOMAIN.
                    _ => {}
                }
                return Some(response);
            }
        }

        if matches!(qtype, QueryType::CNAME | QueryType::A | QueryType::AAAA) {
            if let Some(target) = self.services.overrides.lookup_cname(domain) {
                trace.record(TraceEntry::new("override", "cname").with_detail(target.clone()));

                let mut response = self.base_response(request, ResultCode::NOERROR);
                response.answers.push(DnsRecord::CNAME {
                    domain: domain.to_string(),
                    host: target,
                    ttl: TransientTtl(SYNTHESIZED_TTL),
                });
                return Some(response);
            }
        }

        None
    }

    #[allow(clippy::too_many_arguments)]
    async fn forward_and_cache(
        &self,
        forwarder: &Arc<dyn Forwarder>,
        request: &DnsPacket,
        question: &DnsQuestion,
        edns: &EdnsInfo,
        upstreams: Option<&[Upstream]>,
        path: &'static str,
        on_no_upstreams: ResultCode,
        snapshot: &Settings,
        outcome: &mut QueryOutcome,
        trace: &mut TraceRecorder,
    ) -> DnsPacket {
        let started = Instant::now();
        let result = match upstreams {
            Some(set) => forwarder.forward_with(question, edns, set).await,
            None => forwarder.forward(question, edns).await,
        };
        outcome.upstream_duration = started.elapsed();

        match result {
            Ok(forwarded) => {
                let upstream = forwarded.upstream.to_string();
                outcome.upstream = Some(upstream.clone());
                recorder::query_forwarded(path, &upstream, question.qtype);
                trace.record(TraceEntry::new("forward", "answered").with_source(upstream));

                if snapshot.cache.enabled {
                    if let Err(err) = self.services.cache.set(request, &forwarded.response) {
                        warn!(error = %err, "failed to cache upstream response");
                    }
                }

                self.adopt_upstream(request, forwarded.response)
            }
            Err(err) => {
                warn!(error = %err, name = %question.name, "forwarding failed");
                trace.record(TraceEntry::new("forward", "failed").with_detail(err.to_string()));
                let rescode = if matches!(err, ForwardError::NoUpstreams) {
                    on_no_upstreams
                } else {
                    ResultCode::SERVFAIL
                };
                self.base_response(request, rescode)
            }
        }
    }

    /// Re-frames an upstream response as our answer to this client.
    fn adopt_upstream(&self, request: &DnsPacket, mut response: DnsPacket) -> DnsPacket {
        response.header.id = request.header.id;
        response.header.response = true;
        response.header.recursion_available = true;
        response.header.recursion_desired = request.header.recursion_desired;
        response.questions = request.questions.clone();
        response
    }

    fn limited_response(&self, request: &DnsPacket, action: LimitAction) -> DnsPacket {
        match action {
            LimitAction::Drop => {
                recorder::rate_limit_dropped();
                self.base_response(request, ResultCode::REFUSED)
            }
            LimitAction::Nxdomain => self.base_response(request, ResultCode::NXDOMAIN),
        }
    }

    fn base_response(&self, request: &DnsPacket, rescode: ResultCode) -> DnsPacket {
        let mut response = DnsPacket::new();
        response.header.id = request.header.id;
        response.header.response = true;
        response.header.recursion_available = true;
        response.header.recursion_desired = request.header.recursion_desired;
        response.header.rescode = rescode;
        response.questions = request.questions.clone();
        response
    }
}
