//! Authoritative store for locally configured names.
//!
//! Lookups here run before any policy, blocklist or upstream stage: a
//! configured local answer is final. The store is keyed by lowercased
//! domain; wildcard entries live in a second table keyed by the zone
//! below the `*` label.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use dashmap::DashMap;
use serde_derive::{Deserialize, Serialize};

use crate::protocols::protocol::{DnsRecord, QueryType, TransientTtl};

/// Upper bound on CNAME chain traversal.
pub const MAX_CNAME_HOPS: usize = 10;

/// The data half of a local record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LocalRecordData {
    A {
        ips: Vec<Ipv4Addr>,
        ttl: u32,
    },
    Aaaa {
        ips: Vec<Ipv6Addr>,
        ttl: u32,
    },
    Cname {
        target: String,
        ttl: u32,
    },
    Txt {
        strings: Vec<String>,
        ttl: u32,
    },
    Mx {
        target: String,
        preference: u16,
        ttl: u32,
    },
    Srv {
        target: String,
        priority: u16,
        weight: u16,
        port: u16,
        ttl: u32,
    },
    Ns {
        target: String,
        ttl: u32,
    },
    Ptr {
        target: String,
        ttl: u32,
    },
    Soa {
        m_name: String,
        r_name: String,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
        ttl: u32,
    },
    Caa {
        flag: u8,
        tag: String,
        value: String,
        ttl: u32,
    },
}

impl LocalRecordData {
    fn querytype(&self) -> QueryType {
        match self {
            LocalRecordData::A { .. } => QueryType::A,
            LocalRecordData::Aaaa { .. } => QueryType::AAAA,
            LocalRecordData::Cname { .. } => QueryType::CNAME,
            LocalRecordData::Txt { .. } => QueryType::TXT,
            LocalRecordData::Mx { .. } => QueryType::MX,
            LocalRecordData::Srv { .. } => QueryType::SRV,
            LocalRecordData::Ns { .. } => QueryType::NS,
            LocalRecordData::Ptr { .. } => QueryType::PTR,
            LocalRecordData::Soa { .. } => QueryType::SOA,
            LocalRecordData::Caa { .. } => QueryType::CAA,
        }
    }

    fn ttl(&self) -> u32 {
        match self {
            LocalRecordData::A { ttl, .. }
            | LocalRecordData::Aaaa { ttl, .. }
            | LocalRecordData::Cname { ttl, .. }
            | LocalRecordData::Txt { ttl, .. }
            | LocalRecordData::Mx { ttl, .. }
            | LocalRecordData::Srv { ttl, .. }
            | LocalRecordData::Ns { ttl, .. }
            | LocalRecordData::Ptr { ttl, .. }
            | LocalRecordData::Soa { ttl, .. }
            | LocalRecordData::Caa { ttl, .. } => *ttl,
        }
    }

    /// Emits wire records for this data, owned by `owner` (the queried
    /// name, so wildcard answers carry the name that was asked for).
    fn to_wire(&self, owner: &str) -> Vec<DnsRecord> {
        match self {
            LocalRecordData::A { ips, ttl } => ips
                .iter()
                .map(|addr| DnsRecord::A {
                    domain: owner.to_string(),
                    addr: *addr,
                    ttl: TransientTtl(*ttl),
                })
                .collect(),
            LocalRecordData::Aaaa { ips, ttl } => ips
                .iter()
                .map(|addr| DnsRecord::AAAA {
                    domain: owner.to_string(),
                    addr: *addr,
                    ttl: TransientTtl(*ttl),
                })
                .collect(),
            LocalRecordData::Cname { target, ttl } => vec![DnsRecord::CNAME {
                domain: owner.to_string(),
                host: target.clone(),
                ttl: TransientTtl(*ttl),
            }],
            LocalRecordData::Txt { strings, ttl } => strings
                .iter()
                .map(|data| DnsRecord::TXT {
                    domain: owner.to_string(),
                    data: data.clone(),
                    ttl: TransientTtl(*ttl),
                })
                .collect(),
            LocalRecordData::Mx {
                target,
                preference,
                ttl,
            } => vec![DnsRecord::MX {
                domain: owner.to_string(),
                priority: *preference,
                host: target.clone(),
                ttl: TransientTtl(*ttl),
            }],
            LocalRecordData::Srv {
                target,
                priority,
                weight,
                port,
                ttl,
            } => vec![DnsRecord::SRV {
                domain: owner.to_string(),
                priority: *priority,
                weight: *weight,
                port: *port,
                host: target.clone(),
                ttl: TransientTtl(*ttl),
            }],
            LocalRecordData::Ns { target, ttl } => vec![DnsRecord::NS {
                domain: owner.to_string(),
                host: target.clone(),
                ttl: TransientTtl(*ttl),
            }],
            LocalRecordData::Ptr { target, ttl } => vec![DnsRecord::PTR {
                domain: owner.to_string(),
                host: target.clone(),
                ttl: TransientTtl(*ttl),
            }],
            LocalRecordData::Soa {
                m_name,
                r_name,
                serial,
                refresh,
                retry,
                expire,
                minimum,
                ttl,
            } => vec![DnsRecord::SOA {
                domain: owner.to_string(),
                m_name: m_name.clone(),
                r_name: r_name.clone(),
                serial: *serial,
                refresh: *refresh,
                retry: *retry,
                expire: *expire,
                minimum: *minimum,
                ttl: TransientTtl(*ttl),
            }],
            LocalRecordData::Caa {
                flag,
                tag,
                value,
                ttl,
            } => vec![DnsRecord::CAA {
                domain: owner.to_string(),
                flag: *flag,
                tag: tag.clone(),
                value: value.clone(),
                ttl: TransientTtl(*ttl),
            }],
        }
    }
}

/// One configured local record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRecord {
    pub domain: String,
    pub data: LocalRecordData,
    #[serde(default)]
    pub wildcard: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Result of chasing a CNAME chain to its terminal addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedChain {
    pub addrs: Vec<IpAddr>,
    pub min_ttl: u32,
}

/// Normalize a domain for lookup: lowercase, no trailing dot.
fn canonical(name: &str) -> String {
    name.trim_end_matches('.').to_lowercase()
}

#[derive(Default)]
pub struct LocalRecords {
    exact: DashMap<String, Vec<LocalRecord>>,
    /// Keyed by the zone below the `*`, e.g. `*.lab.local` lives under
    /// `lab.local`.
    wildcards: DashMap<String, Vec<LocalRecord>>,
}

impl LocalRecords {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, mut record: LocalRecord) {
        let name = canonical(&record.domain);

        if record.wildcard || name.starts_with("*.") {
            let zone = name.strip_prefix("*.").unwrap_or(&name).to_string();
            record.wildcard = true;
            record.domain = format!("*.{}", zone);
            self.wildcards.entry(zone).or_default().push(record);
        } else {
            record.domain = name.clone();
            self.exact.entry(name).or_default().push(record);
        }
    }

    /// Replaces the entire record set, e.g. on config reload.
    pub fn replace_all(&self, records: Vec<LocalRecord>) {
        self.exact.clear();
        self.wildcards.clear();
        for record in records {
            self.insert(record);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.wildcards.is_empty()
    }

    /// Collects the enabled record data for `name` matching `pred`.
    /// Exact entries win; wildcards are only consulted when no exact
    /// entry of the wanted shape exists.
    fn matching(
        &self,
        name: &str,
        pred: impl Fn(&LocalRecordData) -> bool,
    ) -> Vec<LocalRecordData> {
        let name = canonical(name);

        if let Some(records) = self.exact.get(&name) {
            let found: Vec<LocalRecordData> = records
                .iter()
                .filter(|rec| rec.enabled && pred(&rec.data))
                .map(|rec| rec.data.clone())
                .collect();
            if !found.is_empty() {
                return found;
            }
        }

        // Walk up the label boundaries: a.b.zone is covered by *.b.zone
        // and by *.zone.
        let mut rest = name.as_str();
        while let Some(idx) = rest.find('.') {
            let zone = &rest[idx + 1..];
            if let Some(records) = self.wildcards.get(zone) {
                let found: Vec<LocalRecordData> = records
                    .iter()
                    .filter(|rec| rec.enabled && pred(&rec.data))
                    .map(|rec| rec.data.clone())
                    .collect();
                if !found.is_empty() {
                    return found;
                }
            }
            rest = zone;
        }

        Vec::new()
    }

    fn lookup_type(&self, name: &str, qtype: QueryType) -> Vec<DnsRecord> {
        let owner = canonical(name);
        self.matching(name, |data| data.querytype() == qtype)
            .iter()
            .flat_map(|data| data.to_wire(&owner))
            .collect()
    }

    pub fn lookup_a(&self, name: &str) -> Vec<DnsRecord> {
        self.lookup_type(name, QueryType::A)
    }

    pub fn lookup_aaaa(&self, name: &str) -> Vec<DnsRecord> {
        self.lookup_type(name, QueryType::AAAA)
    }

    pub fn lookup_cname(&self, name: &str) -> Vec<DnsRecord> {
        self.lookup_type(name, QueryType::CNAME)
    }

    pub fn lookup_txt(&self, name: &str) -> Vec<DnsRecord> {
        self.lookup_type(name, QueryType::TXT)
    }

    /// MX answers are emitted in ascending preference order.
    pub fn lookup_mx(&self, name: &str) -> Vec<DnsRecord> {
        let mut records = self.lookup_type(name, QueryType::MX);
        records.sort_by_key(|rec| match rec {
            DnsRecord::MX { priority, .. } => *priority,
            _ => u16::MAX,
        });
        records
    }

    /// SRV answers are emitted ascending by priority, heaviest weight
    /// first within a priority band.
    pub fn lookup_srv(&self, name: &str) -> Vec<DnsRecord> {
        let mut records = self.lookup_type(name, QueryType::SRV);
        records.sort_by_key(|rec| match rec {
            DnsRecord::SRV {
                priority, weight, ..
            } => (*priority, u16::MAX - *weight),
            _ => (u16::MAX, u16::MAX),
        });
        records
    }

    pub fn lookup_ns(&self, name: &str) -> Vec<DnsRecord> {
        self.lookup_type(name, QueryType::NS)
    }

    pub fn lookup_soa(&self, name: &str) -> Vec<DnsRecord> {
        self.lookup_type(name, QueryType::SOA)
    }

    pub fn lookup_ptr(&self, name: &str) -> Vec<DnsRecord> {
        self.lookup_type(name, QueryType::PTR)
    }

    pub fn lookup_caa(&self, name: &str) -> Vec<DnsRecord> {
        self.lookup_type(name, QueryType::CAA)
    }

    /// Follows a CNAME chain from `name` to terminal A/AAAA records.
    /// Stops after `max_hops` substitutions; a cycle yields `None`.
    pub fn resolve_cname(&self, name: &str, max_hops: usize) -> Option<ResolvedChain> {
        let mut current = canonical(name);
        let mut visited = vec![current.clone()];
        let mut min_ttl = u32::MAX;

        for _ in 0..max_hops {
            let cnames = self.matching(&current, |data| {
                matches!(data, LocalRecordData::Cname { .. })
            });
            let target = match cnames.first() {
                Some(LocalRecordData::Cname { target, ttl }) => {
                    min_ttl = min_ttl.min(*ttl);
                    canonical(target)
                }
                _ => break,
            };

            if visited.contains(&target) {
                return None;
            }
            visited.push(target.clone());
            current = target;

            let mut addrs: Vec<IpAddr> = Vec::new();
            for data in self.matching(&current, |data| {
                matches!(
                    data,
                    LocalRecordData::A { .. } | LocalRecordData::Aaaa { .. }
                )
            }) {
                match data {
                    LocalRecordData::A { ips, ttl } => {
                        min_ttl = min_ttl.min(ttl);
                        addrs.extend(ips.iter().copied().map(IpAddr::V4));
                    }
                    LocalRecordData::Aaaa { ips, ttl } => {
                        min_ttl = min_ttl.min(ttl);
                        addrs.extend(ips.iter().copied().map(IpAddr::V6));
                    }
                    _ => {}
                }
            }

            if !addrs.is_empty() {
                return Some(ResolvedChain {
                    addrs,
                    min_ttl,
                });
            }
        }

        None
    }

    /// Builds the CNAME chain records from `name`, ending in terminal
    /// records of `want` (A or AAAA). Used when an address query lands on
    /// a name that only has a CNAME configured.
    fn chase_chain(&self, name: &str, want: QueryType) -> Vec<DnsRecord> {
        let mut answers = Vec::new();
        let mut current = canonical(name);
        let mut visited = vec![current.clone()];

        for _ in 0..MAX_CNAME_HOPS {
            let cnames = self.matching(&current, |data| {
                matches!(data, LocalRecordData::Cname { .. })
            });
            let (target, ttl) = match cnames.first() {
                Some(LocalRecordData::Cname { target, ttl }) => (canonical(target), *ttl),
                _ => break,
            };

            if visited.contains(&target) {
                return Vec::new();
            }

            answers.push(DnsRecord::CNAME {
                domain: current.clone(),
                host: target.clone(),
                ttl: TransientTtl(ttl),
            });
            visited.push(target.clone());
            current = target;

            let terminal = self.lookup_type(&current, want);
            if !terminal.is_empty() {
                answers.extend(terminal);
                return answers;
            }
        }

        // Chain never reached an address of the wanted family.
        Vec::new()
    }

    /// The pipeline entry point: answers for (name, qtype), or an empty
    /// vector when local data has nothing to say.
    pub fn query(&self, name: &str, qtype: QueryType) -> Vec<DnsRecord> {
        match qtype {
            QueryType::A | QueryType::AAAA => {
                let direct = self.lookup_type(name, qtype);
                if !direct.is_empty() {
                    return direct;
                }
                self.chase_chain(name, qtype)
            }
            QueryType::CNAME => self.lookup_cname(name),
            QueryType::TXT => self.lookup_txt(name),
            QueryType::MX => self.lookup_mx(name),
            QueryType::SRV => self.lookup_srv(name),
            QueryType::NS => self.lookup_ns(name),
            QueryType::SOA => self.lookup_soa(name),
            QueryType::PTR => self.lookup_ptr(name),
            QueryType::CAA => self.lookup_caa(name),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a_record(domain: &str, ip: &str, ttl: u32) -> LocalRecord {
        LocalRecord {
            domain: domain.to_string(),
            data: LocalRecordData::A {
                ips: vec![ip.parse().unwrap()],
                ttl,
            },
            wildcard: false,
            enabled: true,
        }
    }

    fn cname_record(domain: &str, target: &str, ttl: u32) -> LocalRecord {
        LocalRecord {
            domain: domain.to_string(),
            data: LocalRecordData::Cname {
                target: target.to_string(),
                ttl,
            },
            wildcard: false,
            enabled: true,
        }
    }

    #[test]
    fn test_exact_lookup() {
        let records = LocalRecords::new();
        records.insert(a_record("test.local", "192.168.1.100", 300));

        let answers = records.query("test.local", QueryType::A);
        assert_eq!(answers.len(), 1);
        assert_eq!(
            answers[0],
            DnsRecord::A {
                domain: "test.local".to_string(),
                addr: "192.168.1.100".parse().unwrap(),
                ttl: TransientTtl(300),
            }
        );
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let records = LocalRecords::new();
        records.insert(a_record("Test.Local", "10.0.0.1", 60));

        assert_eq!(records.query("TEST.LOCAL", QueryType::A).len(), 1);
        assert_eq!(records.query("test.local.", QueryType::A).len(), 1);
    }

    #[test]
    fn test_disabled_record_never_matches() {
        let records = LocalRecords::new();
        let mut rec = a_record("off.local", "10.0.0.1", 60);
        rec.enabled = false;
        records.insert(rec);

        assert!(records.query("off.local", QueryType::A).is_empty());
    }

    #[test]
    fn test_wildcard_matches_multi_label_children() {
        let records = LocalRecords::new();
        records.insert(LocalRecord {
            domain: "*.lab.local".to_string(),
            data: LocalRecordData::A {
                ips: vec!["10.1.1.1".parse().unwrap()],
                ttl: 120,
            },
            wildcard: true,
            enabled: true,
        });

        assert_eq!(records.query("a.lab.local", QueryType::A).len(), 1);
        assert_eq!(records.query("a.b.lab.local", QueryType::A).len(), 1);
        // The zone apex itself is not covered by the wildcard.
        assert!(records.query("lab.local", QueryType::A).is_empty());

        // Answers carry the queried name, not the wildcard owner.
        let answers = records.query("deep.a.lab.local", QueryType::A);
        assert_eq!(
            answers[0].get_domain().as_deref(),
            Some("deep.a.lab.local")
        );
    }

    #[test]
    fn test_exact_beats_wildcard() {
        let records = LocalRecords::new();
        records.insert(LocalRecord {
            domain: "*.lab.local".to_string(),
            data: LocalRecordData::A {
                ips: vec!["10.1.1.1".parse().unwrap()],
                ttl: 120,
            },
            wildcard: true,
            enabled: true,
        });
        records.insert(a_record("pinned.lab.local", "10.9.9.9", 120));

        let answers = records.query("pinned.lab.local", QueryType::A);
        assert_eq!(answers.len(), 1);
        match &answers[0] {
            DnsRecord::A { addr, .. } => assert_eq!(addr.to_string(), "10.9.9.9"),
            other => panic!("expected A record, got {:?}", other),
        }
    }

    #[test]
    fn test_mx_sorted_by_preference() {
        let records = LocalRecords::new();
        for (pref, host) in [(20, "backup.mail.local"), (5, "primary.mail.local")] {
            records.insert(LocalRecord {
                domain: "mail.local".to_string(),
                data: LocalRecordData::Mx {
                    target: host.to_string(),
                    preference: pref,
                    ttl: 300,
                },
                wildcard: false,
                enabled: true,
            });
        }

        let answers = records.query("mail.local", QueryType::MX);
        let prefs: Vec<u16> = answers
            .iter()
            .map(|rec| match rec {
                DnsRecord::MX { priority, .. } => *priority,
                _ => panic!("expected MX"),
            })
            .collect();
        assert_eq!(prefs, vec![5, 20]);
    }

    #[test]
    fn test_srv_sorted_by_priority_then_weight() {
        let records = LocalRecords::new();
        for (priority, weight) in [(10, 1), (5, 2), (5, 10)] {
            records.insert(LocalRecord {
                domain: "_sip._tcp.local".to_string(),
                data: LocalRecordData::Srv {
                    target: "sip.local".to_string(),
                    priority,
                    weight,
                    port: 5060,
                    ttl: 300,
                },
                wildcard: false,
                enabled: true,
            });
        }

        let answers = records.query("_sip._tcp.local", QueryType::SRV);
        let order: Vec<(u16, u16)> = answers
            .iter()
            .map(|rec| match rec {
                DnsRecord::SRV {
                    priority, weight, ..
                } => (*priority, *weight),
                _ => panic!("expected SRV"),
            })
            .collect();
        assert_eq!(order, vec![(5, 10), (5, 2), (10, 1)]);
    }

    #[test]
    fn test_address_query_chases_cname_chain() {
        let records = LocalRecords::new();
        records.insert(cname_record("www.site.local", "site.local", 600));
        records.insert(a_record("site.local", "10.2.2.2", 300));

        let answers = records.query("www.site.local", QueryType::A);
        assert_eq!(answers.len(), 2);
        assert!(matches!(answers[0], DnsRecord::CNAME { .. }));
        assert!(matches!(answers[1], DnsRecord::A { .. }));
    }

    #[test]
    fn test_resolve_cname_reports_min_ttl() {
        let records = LocalRecords::new();
        records.insert(cname_record("a.local", "b.local", 600));
        records.insert(cname_record("b.local", "c.local", 60));
        records.insert(a_record("c.local", "10.3.3.3", 300));

        let chain = records.resolve_cname("a.local", MAX_CNAME_HOPS).unwrap();
        assert_eq!(chain.addrs, vec!["10.3.3.3".parse::<IpAddr>().unwrap()]);
        assert_eq!(chain.min_ttl, 60);
    }

    #[test]
    fn test_cname_cycle_yields_nothing() {
        let records = LocalRecords::new();
        records.insert(cname_record("x.local", "y.local", 60));
        records.insert(cname_record("y.local", "x.local", 60));

        assert!(records.resolve_cname("x.local", MAX_CNAME_HOPS).is_none());
        assert!(records.query("x.local", QueryType::A).is_empty());
    }

    #[test]
    fn test_cname_hop_limit() {
        let records = LocalRecords::new();
        for i in 0..12 {
            records.insert(cname_record(
                &format!("hop{}.local", i),
                &format!("hop{}.local", i + 1),
                60,
            ));
        }
        records.insert(a_record("hop12.local", "10.4.4.4", 60));

        // Twelve hops exceed the limit of ten.
        assert!(records.resolve_cname("hop0.local", MAX_CNAME_HOPS).is_none());
        // A short suffix of the same chain resolves fine.
        assert!(records.resolve_cname("hop8.local", MAX_CNAME_HOPS).is_some());
    }
}
