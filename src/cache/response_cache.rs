//! Sharded, TTL-bounded cache for upstream responses.
//!
//! The cache is keyed by a fingerprint of the question, never by the
//! message ID. Only upstream-derived content belongs here; policy and
//! blocklist decisions stay fresh so operator edits take effect on the
//! very next query. Each shard carries its own lock and its own atomic
//! counters, so hot-path statistics never contend with writers.

use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Local};

use crate::logging::query_log::TraceEntry;
use crate::metrics::recorder;
use crate::protocols::edns;
use crate::protocols::protocol::{DnsPacket, ResultCode};

pub const SHARD_COUNT: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("poisoned lock")]
    PoisonedLock,
}

/// The question fingerprint: lowercased name, class, type and the DO bit.
/// DNSSEC-aware answers are segregated from plain ones; the message ID is
/// deliberately absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    qname: String,
    qclass: u16,
    qtype: u16,
    do_bit: bool,
    hash: u64,
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl CacheKey {
    pub fn new(qname: &str, qclass: u16, qtype: u16, do_bit: bool) -> CacheKey {
        let qname = qname.trim_end_matches('.').to_lowercase();

        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        qname.hash(&mut hasher);
        qclass.hash(&mut hasher);
        qtype.hash(&mut hasher);
        do_bit.hash(&mut hasher);
        let hash = hasher.finish();

        CacheKey {
            qname,
            qclass,
            qtype,
            do_bit,
            hash,
        }
    }

    /// Fingerprint for a request packet, or `None` when it carries no
    /// question.
    pub fn from_request(request: &DnsPacket) -> Option<CacheKey> {
        let question = request.questions.first()?;
        let do_bit = edns::EdnsInfo::extract(request).do_bit;
        Some(CacheKey::new(
            &question.name,
            question.class,
            question.qtype.to_num(),
            do_bit,
        ))
    }

    fn shard_index(&self) -> usize {
        (self.hash % SHARD_COUNT as u64) as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEntryKind {
    Positive,
    Negative,
    Blocked,
}

#[derive(Clone)]
struct CacheEntry {
    response: DnsPacket,
    expires_at: DateTime<Local>,
    kind: CacheEntryKind,
    trace: Option<Vec<TraceEntry>>,
}

struct StoredEntry {
    entry: CacheEntry,
    seq: u64,
}

#[derive(Default)]
struct ShardMap {
    entries: HashMap<CacheKey, StoredEntry>,
    order: VecDeque<(u64, CacheKey)>,
    next_seq: u64,
}

struct CacheShard {
    map: Mutex<ShardMap>,
    len: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    evictions: AtomicU64,
}

impl CacheShard {
    fn new() -> CacheShard {
        CacheShard {
            map: Mutex::new(ShardMap::default()),
            len: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }
}

/// TTL clamps and sizing for the cache.
#[derive(Debug, Clone, Copy)]
pub struct CacheLimits {
    pub max_entries: usize,
    pub min_ttl: u32,
    pub max_ttl: u32,
    pub negative_ttl: u32,
}

impl Default for CacheLimits {
    fn default() -> Self {
        CacheLimits {
            max_entries: 10_000,
            min_ttl: 0,
            max_ttl: 86_400,
            negative_ttl: 300,
        }
    }
}

/// Aggregated, lock-free statistics snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: u64,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
}

pub struct ResponseCache {
    shards: Vec<CacheShard>,
    capacity_per_shard: usize,
    limits: CacheLimits,
}

impl ResponseCache {
    pub fn new(limits: CacheLimits) -> ResponseCache {
        let capacity_per_shard = (limits.max_entries / SHARD_COUNT).max(1);
        ResponseCache {
            shards: (0..SHARD_COUNT).map(|_| CacheShard::new()).collect(),
            capacity_per_shard,
            limits,
        }
    }

    fn shard(&self, key: &CacheKey) -> &CacheShard {
        &self.shards[key.shard_index()]
    }

    /// Looks up a stored response for this request. Expired entries are
    /// treated as absent and removed on the spot. The caller still owns
    /// ID rewriting and EDNS re-application.
    pub fn get(&self, request: &DnsPacket) -> Option<DnsPacket> {
        self.get_with_trace(request).0
    }

    /// Same as [`get`](Self::get), also yielding the decision trace that
    /// was stored with the entry, if any.
    pub fn get_with_trace(
        &self,
        request: &DnsPacket,
    ) -> (Option<DnsPacket>, Option<Vec<TraceEntry>>) {
        let key = match CacheKey::from_request(request) {
            Some(key) => key,
            None => return (None, None),
        };

        let shard = self.shard(&key);
        let mut map = match shard.map.lock() {
            Ok(map) => map,
            Err(_) => return (None, None),
        };

        let now = Local::now();
        let expired = match map.entries.get(&key) {
            Some(stored) => stored.entry.expires_at <= now,
            None => {
                shard.misses.fetch_add(1, Ordering::Relaxed);
                recorder::cache_miss();
                return (None, None);
            }
        };

        if expired {
            map.entries.remove(&key);
            shard.len.store(map.entries.len() as u64, Ordering::Relaxed);
            shard.misses.fetch_add(1, Ordering::Relaxed);
            recorder::cache_miss();
            return (None, None);
        }

        let stored = &map.entries[&key];
        let mut response = stored.entry.response.clone();
        let trace = stored.entry.trace.clone();

        // Decay TTLs to the remaining lifetime before handing it out.
        let remaining = (stored.entry.expires_at - now).num_seconds().max(0) as u32;
        for record in response
            .answers
            .iter_mut()
            .chain(response.authorities.iter_mut())
            .chain(response.resources.iter_mut())
        {
            record.set_ttl(remaining);
        }

        shard.hits.fetch_add(1, Ordering::Relaxed);
        recorder::cache_hit();
        (Some(response), trace)
    }

    /// Stores an upstream-derived response under the request fingerprint.
    pub fn set(&self, request: &DnsPacket, response: &DnsPacket) -> Result<(), CacheError> {
        let (kind, ttl) = self.classify(response);
        self.insert(request, response, kind, ttl, None)
    }

    /// Stores a blocked response. Reachable only from policy actions
    /// where the operator explicitly opted into caching block decisions;
    /// the blocklist stage never calls this.
    pub fn set_blocked(
        &self,
        request: &DnsPacket,
        response: &DnsPacket,
        trace: Option<Vec<TraceEntry>>,
    ) -> Result<(), CacheError> {
        let ttl = self.limits.negative_ttl;
        self.insert(request, response, CacheEntryKind::Blocked, ttl, trace)
    }

    fn classify(&self, response: &DnsPacket) -> (CacheEntryKind, u32) {
        if response.header.rescode == ResultCode::NXDOMAIN || response.answers.is_empty() {
            return (CacheEntryKind::Negative, self.limits.negative_ttl);
        }

        let ttl = response
            .min_record_ttl()
            .unwrap_or(self.limits.negative_ttl)
            .clamp(self.limits.min_ttl, self.limits.max_ttl);
        (CacheEntryKind::Positive, ttl)
    }

    fn insert(
        &self,
        request: &DnsPacket,
        response: &DnsPacket,
        kind: CacheEntryKind,
        ttl: u32,
        trace: Option<Vec<TraceEntry>>,
    ) -> Result<(), CacheError> {
        let key = match CacheKey::from_request(request) {
            Some(key) => key,
            None => return Ok(()),
        };

        // Entries are stored without an OPT record; every hit negotiates
        // EDNS against the request that is being answered.
        let mut response = response.clone();
        edns::strip(&mut response);

        let entry = CacheEntry {
            response,
            expires_at: Local::now() + Duration::seconds(ttl as i64),
            kind,
            trace,
        };

        let shard = self.shard(&key);
        let mut map = shard.map.lock().map_err(|_| CacheError::PoisonedLock)?;

        let seq = map.next_seq;
        map.next_seq += 1;
        map.order.push_back((seq, key.clone()));
        map.entries.insert(key, StoredEntry { entry, seq });

        // Evict least-recently-inserted entries over capacity. Stale
        // order slots from overwrites are skipped by the seq check.
        let mut evicted = 0u64;
        while map.entries.len() > self.capacity_per_shard {
            let (old_seq, old_key) = match map.order.pop_front() {
                Some(front) => front,
                None => break,
            };
            if map.entries.get(&old_key).map(|stored| stored.seq) == Some(old_seq) {
                map.entries.remove(&old_key);
                evicted += 1;
            }
        }

        shard.len.store(map.entries.len() as u64, Ordering::Relaxed);
        shard.sets.fetch_add(1, Ordering::Relaxed);
        shard.evictions.fetch_add(evicted, Ordering::Relaxed);
        recorder::cache_set();
        recorder::cache_evictions(evicted);

        Ok(())
    }

    /// The stored entry kind for a request, mainly for diagnostics.
    pub fn kind_of(&self, request: &DnsPacket) -> Option<CacheEntryKind> {
        let key = CacheKey::from_request(request)?;
        let shard = self.shard(&key);
        let map = shard.map.lock().ok()?;
        map.entries.get(&key).map(|stored| stored.entry.kind)
    }

    /// Sweeps expired entries from every shard. Shards are processed as
    /// independent tasks; a slow shard never holds up the others.
    pub async fn cleanup(self: Arc<Self>) {
        let mut handles = Vec::with_capacity(SHARD_COUNT);

        for index in 0..SHARD_COUNT {
            let cache = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                cache.cleanup_shard(index);
            }));
        }

        for handle in handles {
            if handle.await.is_err() {
                tracing::warn!("cache cleanup task failed");
            }
        }
    }

    fn cleanup_shard(&self, index: usize) {
        let shard = &self.shards[index];
        let mut map = match shard.map.lock() {
            Ok(map) => map,
            Err(_) => {
                tracing::warn!(shard = index, "skipping poisoned cache shard");
                return;
            }
        };

        let now = Local::now();
        let before = map.entries.len();
        map.entries.retain(|_, stored| stored.entry.expires_at > now);
        let removed = (before - map.entries.len()) as u64;

        // Drop order slots whose entry is gone so the ring does not grow
        // without bound across overwrites and expiries.
        let entries = &map.entries;
        let order: VecDeque<(u64, CacheKey)> = map
            .order
            .iter()
            .filter(|(seq, key)| entries.get(key).map(|stored| stored.seq) == Some(*seq))
            .cloned()
            .collect();
        map.order = order;

        shard.len.store(map.entries.len() as u64, Ordering::Relaxed);
        shard.evictions.fetch_add(removed, Ordering::Relaxed);
        recorder::cache_evictions(removed);
    }

    /// Statistics snapshot assembled purely from atomic loads.
    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for shard in &self.shards {
            stats.entries += shard.len.load(Ordering::Relaxed);
            stats.hits += shard.hits.load(Ordering::Relaxed);
            stats.misses += shard.misses.load(Ordering::Relaxed);
            stats.sets += shard.sets.load(Ordering::Relaxed);
            stats.evictions += shard.evictions.load(Ordering::Relaxed);
        }
        stats
    }
}
