//! End-to-end exercises of the decision pipeline with a mock upstream.

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use sinkhole_dns::blocklist::{BlocklistSnapshot, Matcher, Overrides, Whitelist};
use sinkhole_dns::cache::{CacheEntryKind, CacheLimits, ResponseCache};
use sinkhole_dns::config::{ConfigHandle, Settings};
use sinkhole_dns::forward::{
    ConditionalResolver, ConditionalRule, DomainPattern, ForwardError, Forwarded, Forwarder,
    Upstream,
};
use sinkhole_dns::logging::{LoggerError, QueryLog, QueryLogSink, QueryLogger};
use sinkhole_dns::pipeline::{HandlerServices, QueryHandler};
use sinkhole_dns::policy::{Action, PolicyEngine, Rule, RuleExpression};
use sinkhole_dns::protocols::edns::EdnsInfo;
use sinkhole_dns::protocols::protocol::{
    DnsPacket, DnsQuestion, DnsRecord, QueryType, ResultCode, TransientTtl,
};
use sinkhole_dns::ratelimit::{LimitAction, RateLimiter};
use sinkhole_dns::records::{LocalRecord, LocalRecordData, LocalRecords};

struct NullSink;

#[async_trait]
impl QueryLogSink for NullSink {
    async fn log_query(&self, _entry: QueryLog) -> Result<(), LoggerError> {
        Ok(())
    }
}

/// A deterministic upstream: answers every question with a fixed A
/// record (or a canned response), recording what was forwarded where.
struct MockForwarder {
    calls: AtomicUsize,
    forwarded_to: Mutex<Vec<Vec<Upstream>>>,
    canned: Mutex<Option<DnsPacket>>,
    fail: bool,
}

impl MockForwarder {
    fn new() -> Arc<MockForwarder> {
        Arc::new(MockForwarder {
            calls: AtomicUsize::new(0),
            forwarded_to: Mutex::new(Vec::new()),
            canned: Mutex::new(None),
            fail: false,
        })
    }

    fn failing() -> Arc<MockForwarder> {
        Arc::new(MockForwarder {
            calls: AtomicUsize::new(0),
            forwarded_to: Mutex::new(Vec::new()),
            canned: Mutex::new(None),
            fail: true,
        })
    }

    fn with_canned(response: DnsPacket) -> Arc<MockForwarder> {
        let forwarder = MockForwarder::new();
        *forwarder.canned.lock().unwrap() = Some(response);
        forwarder
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn answer(&self, question: &DnsQuestion, upstream: Upstream) -> Forwarded {
        let response = match self.canned.lock().unwrap().clone() {
            Some(canned) => canned,
            None => {
                let mut response = DnsPacket::new();
                response.header.response = true;
                response.questions.push(question.clone());
                response.answers.push(DnsRecord::A {
                    domain: question.name.clone(),
                    addr: "9.9.9.9".parse().unwrap(),
                    ttl: TransientTtl(600),
                });
                response
            }
        };
        Forwarded { response, upstream }
    }
}

#[async_trait]
impl Forwarder for MockForwarder {
    async fn forward(
        &self,
        question: &DnsQuestion,
        _edns: &EdnsInfo,
    ) -> Result<Forwarded, ForwardError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ForwardError::NoUpstreams);
        }
        Ok(self.answer(question, Upstream::new("upstream.test", 53)))
    }

    async fn forward_with(
        &self,
        question: &DnsQuestion,
        _edns: &EdnsInfo,
        upstreams: &[Upstream],
    ) -> Result<Forwarded, ForwardError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.forwarded_to.lock().unwrap().push(upstreams.to_vec());
        if self.fail {
            return Err(ForwardError::NoUpstreams);
        }
        Ok(self.answer(question, upstreams[0].clone()))
    }
}

/// Test fixture: the handler plus direct handles to the pieces the
/// assertions poke at.
struct Bed {
    handler: QueryHandler,
    cache: Arc<ResponseCache>,
    forwarder: Arc<MockForwarder>,
}

struct BedBuilder {
    settings: Settings,
    records: Arc<LocalRecords>,
    rules: Vec<Rule>,
    blocked: Vec<String>,
    whitelisted: Vec<String>,
    conditional: Vec<ConditionalRule>,
    overrides: Arc<Overrides>,
    forwarder: Option<Arc<MockForwarder>>,
    limiter: Option<Arc<RateLimiter>>,
}

impl BedBuilder {
    fn new() -> BedBuilder {
        BedBuilder {
            settings: Settings::default(),
            records: Arc::new(LocalRecords::new()),
            rules: Vec::new(),
            blocked: Vec::new(),
            whitelisted: Vec::new(),
            conditional: Vec::new(),
            overrides: Arc::new(Overrides::new()),
            forwarder: None,
            limiter: None,
        }
    }

    fn local_a(self, domain: &str, ip: &str) -> Self {
        self.records.insert(LocalRecord {
            domain: domain.to_string(),
            data: LocalRecordData::A {
                ips: vec![ip.parse().unwrap()],
                ttl: 300,
            },
            wildcard: false,
            enabled: true,
        });
        self
    }

    fn rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    fn block(mut self, domain: &str) -> Self {
        self.blocked.push(domain.to_string());
        self
    }

    fn whitelist(mut self, domain: &str) -> Self {
        self.whitelisted.push(domain.to_string());
        self
    }

    fn conditional(mut self, rule: ConditionalRule) -> Self {
        self.conditional.push(rule);
        self
    }

    fn forwarder(mut self, forwarder: Arc<MockForwarder>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    fn limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    fn settings(mut self, mutate: impl FnOnce(&mut Settings)) -> Self {
        mutate(&mut self.settings);
        self
    }

    fn build(self) -> Bed {
        let matcher = Arc::new(Matcher::new());
        let mut snapshot = BlocklistSnapshot::new();
        for domain in &self.blocked {
            snapshot.add_exact(domain, "test-list");
        }
        matcher.publish(snapshot);

        let mut whitelist = Whitelist::new();
        for domain in &self.whitelisted {
            whitelist.add_exact(domain);
        }
        matcher.publish_whitelist(whitelist);

        let cache = Arc::new(ResponseCache::new(CacheLimits::default()));
        let forwarder = self.forwarder.unwrap_or_else(MockForwarder::new);
        let dyn_forwarder: Arc<dyn Forwarder> = forwarder.clone();
        let logger = QueryLogger::new(Arc::new(NullSink), 64, 1);

        let handler = QueryHandler::new(HandlerServices {
            records: self.records,
            policy: Arc::new(PolicyEngine::new(self.rules)),
            matcher,
            overrides: self.overrides,
            cache: Arc::clone(&cache),
            conditional: Arc::new(ConditionalResolver::new(self.conditional)),
            forwarder: Some(dyn_forwarder),
            limiter: self.limiter,
            logger,
            config: Arc::new(ConfigHandle::new(self.settings)),
        });

        Bed {
            handler,
            cache,
            forwarder,
        }
    }
}

fn client() -> IpAddr {
    "192.168.1.50".parse().unwrap()
}

fn request(name: &str, qtype: QueryType) -> DnsPacket {
    let mut packet = DnsPacket::new();
    packet.header.id = 4242;
    packet.header.recursion_desired = true;
    packet
        .questions
        .push(DnsQuestion::new(name.to_string(), qtype));
    packet
}

fn request_with_opt(name: &str, qtype: QueryType, udp_size: u16, do_bit: bool) -> DnsPacket {
    let mut packet = request(name, qtype);
    packet.resources.push(DnsRecord::OPT {
        udp_size,
        version: 0,
        do_bit,
    });
    packet
}

// S1: a local record beats the blocklist.
#[tokio::test]
async fn local_record_wins_over_blocklist() {
    let bed = BedBuilder::new()
        .block("test.local")
        .local_a("test.local", "192.168.1.100")
        .build();

    let response = bed.handler.handle(client(), request("test.local", QueryType::A)).await;

    assert_eq!(response.header.rescode, ResultCode::NOERROR);
    assert!(response.header.authoritative_answer);
    assert_eq!(
        response.answers,
        vec![DnsRecord::A {
            domain: "test.local".to_string(),
            addr: "192.168.1.100".parse().unwrap(),
            ttl: TransientTtl(300),
        }]
    );
    assert_eq!(bed.forwarder.calls(), 0);
}

// S2: a policy block overrides a cached upstream answer, and the cache
// entry survives untouched.
#[tokio::test]
async fn policy_block_beats_cache() {
    let bed = BedBuilder::new()
        .rule(Rule::new(
            "block-ads",
            50,
            RuleExpression::DomainEquals("ads.example".to_string()),
            Action::Block,
        ))
        .build();

    let req = request("ads.example", QueryType::A);
    let mut cached = req.clone();
    cached.header.response = true;
    cached.answers.push(DnsRecord::A {
        domain: "ads.example".to_string(),
        addr: "1.2.3.4".parse().unwrap(),
        ttl: TransientTtl(600),
    });
    bed.cache.set(&req, &cached).unwrap();

    let response = bed.handler.handle(client(), req.clone()).await;

    assert_eq!(response.header.rescode, ResultCode::NXDOMAIN);
    assert_eq!(response.answers.len(), 0);
    assert_eq!(
        bed.cache.kind_of(&req),
        Some(CacheEntryKind::Positive),
        "the cached entry is still present, just not returned"
    );
}

// Invariant 3: a fresh blocklist entry overrides a cached upstream reply.
#[tokio::test]
async fn blocklist_beats_cache() {
    let bed = BedBuilder::new().block("tracker.example").build();

    let req = request("tracker.example", QueryType::A);
    let mut cached = req.clone();
    cached.header.response = true;
    cached.answers.push(DnsRecord::A {
        domain: "tracker.example".to_string(),
        addr: "1.2.3.4".parse().unwrap(),
        ttl: TransientTtl(600),
    });
    bed.cache.set(&req, &cached).unwrap();

    let response = bed.handler.handle(client(), req).await;
    assert_eq!(response.header.rescode, ResultCode::NXDOMAIN);
}

// S3: redirect with an IPv4 target answers an AAAA query with NODATA.
#[tokio::test]
async fn redirect_family_mismatch_yields_nodata() {
    let bed = BedBuilder::new()
        .rule(Rule::new(
            "portal",
            50,
            RuleExpression::DomainEquals("portal.test".to_string()),
            Action::Redirect {
                target: "192.168.1.250".to_string(),
            },
        ))
        .build();

    let response = bed
        .handler
        .handle(client(), request("portal.test", QueryType::AAAA))
        .await;

    assert_eq!(response.header.rescode, ResultCode::NOERROR);
    assert!(response.answers.is_empty());

    // The matching family gets the synthesized answer.
    let response = bed
        .handler
        .handle(client(), request("portal.test", QueryType::A))
        .await;
    assert_eq!(
        response.answers,
        vec![DnsRecord::A {
            domain: "portal.test".to_string(),
            addr: "192.168.1.250".parse().unwrap(),
            ttl: TransientTtl(300),
        }]
    );
}

// An unparseable redirect target answers NXDOMAIN.
#[tokio::test]
async fn redirect_invalid_target_yields_nxdomain() {
    let bed = BedBuilder::new()
        .rule(Rule::new(
            "broken",
            50,
            RuleExpression::DomainEquals("broken.test".to_string()),
            Action::Redirect {
                target: "not-an-address".to_string(),
            },
        ))
        .build();

    let response = bed
        .handler
        .handle(client(), request("broken.test", QueryType::A))
        .await;
    assert_eq!(response.header.rescode, ResultCode::NXDOMAIN);
}

// S4: ALLOW bypasses the blocklist, forwards, and caches the result.
#[tokio::test]
async fn allow_bypasses_blocklist_and_caches() {
    let bed = BedBuilder::new()
        .block("allowed.test")
        .rule(Rule::new(
            "allow-it",
            50,
            RuleExpression::DomainEquals("allowed.test".to_string()),
            Action::Allow,
        ))
        .build();

    let req = request("allowed.test", QueryType::A);
    let response = bed.handler.handle(client(), req.clone()).await;

    assert_eq!(response.header.rescode, ResultCode::NOERROR);
    assert_eq!(bed.forwarder.calls(), 1, "forwarder was invoked");
    assert!(
        bed.cache.get(&req).is_some(),
        "upstream response landed in the cache"
    );
}

// Invariant 4: ALLOW always reaches the forwarder because policy runs
// before the cache.
#[tokio::test]
async fn allow_never_serves_from_cache() {
    let bed = BedBuilder::new()
        .rule(Rule::new(
            "allow-it",
            50,
            RuleExpression::DomainEquals("fresh.test".to_string()),
            Action::Allow,
        ))
        .build();

    let req = request("fresh.test", QueryType::A);
    bed.handler.handle(client(), req.clone()).await;
    bed.handler.handle(client(), req).await;

    assert_eq!(bed.forwarder.calls(), 2, "each query goes upstream");
}

// S5: conditional forwarding rules resolve by priority.
#[tokio::test]
async fn conditional_forwarding_priority() {
    let u1 = Upstream::new("10.0.0.1", 53);
    let u2 = Upstream::new("10.0.0.2", 53);

    let bed = BedBuilder::new()
        .conditional(ConditionalRule {
            name: "nas-pin".to_string(),
            priority: 90,
            domain: DomainPattern::parse("nas.local"),
            clients: None,
            qtypes: None,
            upstreams: vec![u1.clone()],
            enabled: true,
        })
        .conditional(ConditionalRule {
            name: "local-zone".to_string(),
            priority: 10,
            domain: DomainPattern::parse("*.local"),
            clients: None,
            qtypes: None,
            upstreams: vec![u2.clone()],
            enabled: true,
        })
        .build();

    bed.handler.handle(client(), request("nas.local", QueryType::A)).await;
    bed.handler
        .handle(client(), request("router.local", QueryType::A))
        .await;

    let forwarded = bed.forwarder.forwarded_to.lock().unwrap().clone();
    assert_eq!(forwarded, vec![vec![u1], vec![u2]]);
}

// S6: EDNS negotiation end to end.
#[tokio::test]
async fn edns_negotiation() {
    let bed = BedBuilder::new().build();

    // Advertised 2048 with DO set comes back as 2048 with DO set.
    let response = bed
        .handler
        .handle(client(), request_with_opt("a.example", QueryType::A, 2048, true))
        .await;
    match response.resources.as_slice() {
        [DnsRecord::OPT {
            udp_size, do_bit, ..
        }] => {
            assert_eq!(*udp_size, 2048);
            assert!(*do_bit);
        }
        other => panic!("expected one OPT record, got {:?}", other),
    }

    // A tiny advertisement clamps up to 512.
    let response = bed
        .handler
        .handle(client(), request_with_opt("b.example", QueryType::A, 256, false))
        .await;
    match response.resources.as_slice() {
        [DnsRecord::OPT { udp_size, .. }] => assert_eq!(*udp_size, 512),
        other => panic!("expected one OPT record, got {:?}", other),
    }
}

// S6, second half: no request OPT means no response OPT, even when the
// upstream answer carried one.
#[tokio::test]
async fn no_opt_in_means_no_opt_out() {
    let mut canned = DnsPacket::new();
    canned.header.response = true;
    canned
        .questions
        .push(DnsQuestion::new("c.example".to_string(), QueryType::A));
    canned.answers.push(DnsRecord::A {
        domain: "c.example".to_string(),
        addr: "9.9.9.9".parse().unwrap(),
        ttl: TransientTtl(600),
    });
    canned.resources.push(DnsRecord::OPT {
        udp_size: 1232,
        version: 0,
        do_bit: false,
    });

    let bed = BedBuilder::new()
        .forwarder(MockForwarder::with_canned(canned))
        .build();

    let response = bed
        .handler
        .handle(client(), request("c.example", QueryType::A))
        .await;

    assert_eq!(response.answers.len(), 1);
    assert!(
        response.resources.is_empty(),
        "upstream OPT stripped for a plain client"
    );
}

// Invariant 1: zero questions answer FORMERR with nothing else.
#[tokio::test]
async fn empty_question_is_formerr() {
    let bed = BedBuilder::new().build();

    let mut req = DnsPacket::new();
    req.header.id = 77;

    let response = bed.handler.handle(client(), req).await;
    assert_eq!(response.header.rescode, ResultCode::FORMERR);
    assert_eq!(response.answers.len(), 0);
    assert_eq!(response.header.id, 77);
}

// Invariant 2: cache hits answer under the current request's ID.
#[tokio::test]
async fn cache_hit_rewrites_id() {
    let bed = BedBuilder::new().build();

    let mut first = request("repeat.example", QueryType::A);
    first.header.id = 1000;
    bed.handler.handle(client(), first).await;

    let mut second = request("repeat.example", QueryType::A);
    second.header.id = 2000;
    let response = bed.handler.handle(client(), second).await;

    assert_eq!(response.header.id, 2000);
    assert_eq!(bed.forwarder.calls(), 1, "second query served from cache");
}

// Whitelisted domains sail past the blocklist into normal resolution.
#[tokio::test]
async fn whitelist_overrides_blocklist() {
    let bed = BedBuilder::new()
        .block("cdn.example")
        .whitelist("cdn.example")
        .build();

    let response = bed
        .handler
        .handle(client(), request("cdn.example", QueryType::A))
        .await;

    assert_eq!(response.header.rescode, ResultCode::NOERROR);
    assert_eq!(bed.forwarder.calls(), 1);
}

// Disabling the blocklist via the kill-switch lets blocked names through.
#[tokio::test]
async fn blocklist_kill_switch() {
    let bed = BedBuilder::new().block("oops.example").build();

    bed.handler.config().disable_blocklist(true);
    let response = bed
        .handler
        .handle(client(), request("oops.example", QueryType::A))
        .await;
    assert_eq!(response.header.rescode, ResultCode::NOERROR);

    bed.handler.config().disable_blocklist(false);
    let response = bed
        .handler
        .handle(client(), request("oops.example", QueryType::A))
        .await;
    assert_eq!(response.header.rescode, ResultCode::NXDOMAIN);
}

// Upstream failure surfaces as SERVFAIL, not an error.
#[tokio::test]
async fn upstream_failure_is_servfail() {
    let bed = BedBuilder::new().forwarder(MockForwarder::failing()).build();

    let response = bed
        .handler
        .handle(client(), request("down.example", QueryType::A))
        .await;
    assert_eq!(response.header.rescode, ResultCode::SERVFAIL);
}

// A policy FORWARD with an empty upstream set answers SERVFAIL.
#[tokio::test]
async fn policy_forward_without_upstreams_is_servfail() {
    let bed = BedBuilder::new()
        .rule(Rule::new(
            "misconfigured",
            50,
            RuleExpression::DomainEquals("broken.test".to_string()),
            Action::Forward {
                upstreams: Vec::new(),
            },
        ))
        .build();

    let response = bed
        .handler
        .handle(client(), request("broken.test", QueryType::A))
        .await;
    assert_eq!(response.header.rescode, ResultCode::SERVFAIL);
    assert_eq!(bed.forwarder.calls(), 0);
}

// Global rate limiting: over the burst, DROP answers REFUSED.
#[tokio::test]
async fn global_rate_limit_refuses() {
    let bed = BedBuilder::new()
        .limiter(Arc::new(RateLimiter::new(
            0.0,
            2.0,
            LimitAction::Drop,
            "global",
        )))
        .settings(|settings| settings.rate_limit.enabled = true)
        .build();

    for _ in 0..2 {
        let response = bed
            .handler
            .handle(client(), request("ok.example", QueryType::A))
            .await;
        assert_eq!(response.header.rescode, ResultCode::NOERROR);
    }

    let response = bed
        .handler
        .handle(client(), request("ok.example", QueryType::A))
        .await;
    assert_eq!(response.header.rescode, ResultCode::REFUSED);
}

// Per-rule rate limiting takes over from the global limiter and applies
// its own sub-action.
#[tokio::test]
async fn policy_rate_limit_applies_sub_action() {
    let bed = BedBuilder::new()
        .rule(Rule::new(
            "throttle-lab",
            50,
            RuleExpression::DomainSuffix("lab.test".to_string()),
            Action::RateLimit {
                limiter: Arc::new(RateLimiter::new(0.0, 1.0, LimitAction::Nxdomain, "lab")),
                on_limit: LimitAction::Nxdomain,
            },
        ))
        .build();

    // First query consumes the burst and falls through to forwarding.
    let response = bed
        .handler
        .handle(client(), request("x.lab.test", QueryType::A))
        .await;
    assert_eq!(response.header.rescode, ResultCode::NOERROR);

    // Second query is over the limit: NXDOMAIN per the sub-action.
    let response = bed
        .handler
        .handle(client(), request("x.lab.test", QueryType::A))
        .await;
    assert_eq!(response.header.rescode, ResultCode::NXDOMAIN);
}

// S7: a saturated logger drops entries without ever blocking a handler.
#[tokio::test]
async fn log_buffer_saturation_drops() {
    use tokio::sync::Notify;

    struct HangingSink {
        release: Notify,
    }

    #[async_trait]
    impl QueryLogSink for HangingSink {
        async fn log_query(&self, _entry: QueryLog) -> Result<(), LoggerError> {
            self.release.notified().await;
            Ok(())
        }
    }

    let capacity = 4;
    let workers = 1;
    let logger = QueryLogger::new(
        Arc::new(HangingSink {
            release: Notify::new(),
        }),
        capacity,
        workers,
    );

    fn entry(i: usize) -> QueryLog {
        QueryLog {
            timestamp: chrono::Local::now(),
            client_ip: "127.0.0.1".to_string(),
            domain: format!("host{}.example", i),
            qtype: "A".to_string(),
            response_code: "NOERROR".to_string(),
            blocked: false,
            cached: false,
            response_time_ms: 0.0,
            upstream_time_ms: 0.0,
            upstream: None,
            trace: None,
        }
    }

    // Park the worker inside the sink.
    logger.log_async(entry(0));
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let overflow = 3;
    for i in 0..capacity + overflow {
        logger.log_async(entry(i + 1));
    }

    assert_eq!(logger.dropped_total(), overflow as u64);
}

// Overrides: IP override answers the matching family, NODATA otherwise,
// and the CNAME override covers address queries too.
#[tokio::test]
async fn overrides_apply_after_blocklist() {
    let builder = BedBuilder::new();
    builder
        .overrides
        .set_ip("pinned.example", "10.1.2.3".parse().unwrap());
    builder.overrides.set_cname("alias.example", "real.example");
    let bed = builder.build();

    let response = bed
        .handler
        .handle(client(), request("pinned.example", QueryType::A))
        .await;
    assert_eq!(
        response.answers,
        vec![DnsRecord::A {
            domain: "pinned.example".to_string(),
            addr: "10.1.2.3".parse().unwrap(),
            ttl: TransientTtl(300),
        }]
    );

    // IPv4 override asked for AAAA: NODATA, not NXDOMAIN.
    let response = bed
        .handler
        .handle(client(), request("pinned.example", QueryType::AAAA))
        .await;
    assert_eq!(response.header.rescode, ResultCode::NOERROR);
    assert!(response.answers.is_empty());

    let response = bed
        .handler
        .handle(client(), request("alias.example", QueryType::A))
        .await;
    assert_eq!(
        response.answers,
        vec![DnsRecord::CNAME {
            domain: "alias.example".to_string(),
            host: "real.example".to_string(),
            ttl: TransientTtl(300),
        }]
    );
}
