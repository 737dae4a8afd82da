use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use lazy_static::lazy_static;
use lru::LruCache;
use tracing::{debug, instrument, warn};

use crate::question::Question;

lazy_static! {
    // number of record sets in the shared cache
    static ref CACHE_SIZE: NonZeroUsize = NonZeroUsize::new(100_000).unwrap();
}

/// TTL applied to synthesized failures so repeated failures don't
/// re-cost the full walk.
const FAILURE_TTL: Duration = Duration::from_secs(30);
/// How long past expiry an entry may still be served when the caller
/// asks for stale data.
const STALE_WINDOW: Duration = Duration::from_secs(300);
/// TTL handed out with records served stale.
const STALE_TTL: Duration = Duration::from_secs(30);
/// Longest CNAME chain assembled out of cached sets.
const MAX_CHAIN: usize = 8;

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheLookup {
    pub serve_stale: bool,
    pub find_closest_name_servers: bool,
    pub reset_expiry: bool,
}

/// The shared record cache as the resolver sees it. Lookups honor
/// name/type/class; with `find_closest_name_servers` set, a miss may
/// instead return a referral carrying the closest cached NS set.
#[async_trait]
pub trait DnsCache: Debug + Send + Sync {
    async fn lookup(&self, question: &Question, opts: CacheLookup) -> Option<Message>;
    async fn store(&self, response: &Message, dnssec_bad: bool);
}

struct ValueWithTtl<V> {
    value: V,
    valid_before: Instant,
    ttl: Duration,
}

/// An LRU cache with per-entry TTL, locked for concurrent readers and
/// writers from parallel resolutions.
#[derive(Debug)]
struct LruTtlCache<K: Hash + Eq, V> {
    lru: Mutex<LruCache<K, ValueWithTtl<V>>>,
}

impl<K: Hash + Eq + Debug, V: Clone> LruTtlCache<K, V> {
    fn new(capacity: NonZeroUsize) -> LruTtlCache<K, V> {
        LruTtlCache { lru: Mutex::new(LruCache::new(capacity)) }
    }

    fn store_with_ttl(&self, key: K, value: V, ttl: Duration, now: Instant) {
        self.lru.lock().unwrap().put(key, ValueWithTtl { value, valid_before: now + ttl, ttl });
    }

    fn get(&self, key: &K, now: Instant, opts: CacheLookup) -> Option<(V, Duration)> {
        let mut guard = self.lru.lock().unwrap();
        let with_ttl = guard.get_mut(key)?;
        if with_ttl.valid_before < now {
            if opts.serve_stale && now < with_ttl.valid_before + STALE_WINDOW {
                return Some((with_ttl.value.clone(), STALE_TTL));
            }
            guard.pop(key);
            return None;
        }
        if opts.reset_expiry {
            with_ttl.valid_before = now + with_ttl.ttl;
        }
        Some((with_ttl.value.clone(), with_ttl.valid_before - now))
    }

    fn len(&self) -> usize {
        self.lru.lock().unwrap().len()
    }
}

#[derive(Debug, Hash, Eq, PartialEq, Clone)]
struct CacheKey {
    name: Name,
    record_type: RecordType,
}

impl CacheKey {
    fn new(name: &Name, record_type: RecordType) -> CacheKey {
        CacheKey { name: name.to_lowercase(), record_type }
    }
}

#[derive(Debug, Clone)]
enum Entry {
    Records(Vec<Record>),
    Negative(Message),
}

/// The default cache implementation: record sets and negative responses
/// in one LRU, keyed by owner and type.
#[derive(Debug)]
pub struct LruDnsCache {
    inner: LruTtlCache<CacheKey, Entry>,
}

impl Default for LruDnsCache {
    fn default() -> Self {
        Self::new(*CACHE_SIZE)
    }
}

impl LruDnsCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        LruDnsCache { inner: LruTtlCache::new(capacity) }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn store_record_sets(&self, records: &[Record], now: Instant) {
        for (key, set) in group_by_owner_and_type(records) {
            let min_ttl = set.iter().map(Record::ttl).min().unwrap_or(0);
            if min_ttl == 0 {
                continue;
            }
            self.inner.store_with_ttl(
                key,
                Entry::Records(set),
                Duration::from_secs(min_ttl as u64),
                now,
            );
        }
    }

    fn store_negative(&self, question_key: CacheKey, response: &Message, ttl: Duration, now: Instant) {
        self.inner.store_with_ttl(question_key, Entry::Negative(response.clone()), ttl, now);
    }

    fn positive_response(&self, question: &Question, records: Vec<Record>, now: Instant, opts: CacheLookup) -> Message {
        let mut answers = records;
        // stitch a cached CNAME chain together until the queried type
        // shows up or the chain dead-ends
        let mut hops = 0;
        while hops < MAX_CHAIN {
            let Some(last) = answers.last() else { break };
            let target = match (last.record_type(), last.data()) {
                (RecordType::CNAME, RData::CNAME(target))
                    if question.record_type != RecordType::CNAME =>
                {
                    target.0.clone()
                }
                _ => break,
            };
            let key = CacheKey::new(&target, question.record_type);
            match self.inner.get(&key, now, opts) {
                Some((Entry::Records(set), remaining)) => {
                    answers.extend(update_ttl((set, remaining)));
                    break;
                }
                _ => {
                    let chain_key = CacheKey::new(&target, RecordType::CNAME);
                    match self.inner.get(&chain_key, now, opts) {
                        Some((Entry::Records(set), remaining)) => {
                            answers.extend(update_ttl((set, remaining)));
                            hops += 1;
                        }
                        _ => break,
                    }
                }
            }
        }
        let mut response = response_shell(question, ResponseCode::NoError);
        response.insert_answers(answers);
        response
    }

    fn closest_referral(&self, question: &Question, now: Instant, opts: CacheLookup) -> Option<Message> {
        for parent in parents(&question.name) {
            let key = CacheKey::new(&parent, RecordType::NS);
            if let Some((Entry::Records(ns_set), remaining)) = self.inner.get(&key, now, opts) {
                let ns_set = update_ttl((ns_set, remaining));
                let glue = self.fetch_glue(&ns_set, now, opts);
                let mut response = response_shell(question, ResponseCode::NoError);
                response.insert_name_servers(ns_set);
                response.insert_additionals(glue);
                return Some(response);
            }
        }
        None
    }

    fn fetch_glue(&self, name_servers: &[Record], now: Instant, opts: CacheLookup) -> Vec<Record> {
        let mut result = Vec::with_capacity(name_servers.len());
        for ns in name_servers {
            let RData::NS(target) = ns.data() else {
                warn!(%ns, "Invalid NS record retrieved from cache");
                continue;
            };
            for record_type in [RecordType::A, RecordType::AAAA] {
                let key = CacheKey::new(&target.0, record_type);
                if let Some((Entry::Records(set), remaining)) = self.inner.get(&key, now, opts) {
                    result.extend(update_ttl((set, remaining)));
                }
            }
        }
        result
    }
}

#[async_trait]
impl DnsCache for LruDnsCache {
    #[instrument(name = "cache-get", skip(self, opts), fields(hit = false))]
    async fn lookup(&self, question: &Question, opts: CacheLookup) -> Option<Message> {
        let now = Instant::now();
        let key = CacheKey::new(&question.name, question.record_type);
        let direct = self.inner.get(&key, now, opts);
        let response = match direct {
            Some((Entry::Records(records), remaining)) => {
                Some(self.positive_response(question, update_ttl((records, remaining)), now, opts))
            }
            Some((Entry::Negative(message), _remaining)) => {
                let mut message = message;
                replace_question(&mut message, question);
                Some(message)
            }
            None => {
                // a cached CNAME may still lead to the queried type
                let chain_key = CacheKey::new(&question.name, RecordType::CNAME);
                match self.inner.get(&chain_key, now, opts) {
                    Some((Entry::Records(records), remaining))
                        if question.record_type != RecordType::CNAME =>
                    {
                        Some(self.positive_response(
                            question,
                            update_ttl((records, remaining)),
                            now,
                            opts,
                        ))
                    }
                    _ => None,
                }
            }
        };
        if let Some(response) = response {
            tracing::Span::current().record("hit", true);
            return Some(response);
        }
        if opts.find_closest_name_servers {
            return self.closest_referral(question, now, opts);
        }
        None
    }

    #[instrument(name = "cache-store", skip_all, fields(rcode = %response.response_code(), dnssec_bad))]
    async fn store(&self, response: &Message, dnssec_bad: bool) {
        let Some(query) = response.queries().first() else {
            return;
        };
        let now = Instant::now();
        let question_key = CacheKey::new(query.name(), query.query_type());

        if dnssec_bad {
            self.store_negative(question_key, response, FAILURE_TTL, now);
            return;
        }
        match response.response_code() {
            ResponseCode::NoError if !response.answers().is_empty() => {
                self.store_record_sets(response.answers(), now);
                if eligible(response.name_servers(), response.additionals(), query.name()) {
                    self.store_record_sets(
                        &referral_records(response.name_servers(), response.additionals()),
                        now,
                    );
                }
            }
            ResponseCode::NoError
                if response.name_servers().iter().any(|r| r.record_type() == RecordType::NS) =>
            {
                if eligible(response.name_servers(), response.additionals(), query.name()) {
                    self.store_record_sets(
                        &referral_records(response.name_servers(), response.additionals()),
                        now,
                    );
                } else {
                    debug!(query = %query.name(), "dropping ineligible referral");
                }
            }
            ResponseCode::NoError | ResponseCode::NXDomain => {
                let ttl = negative_ttl(response);
                self.store_negative(question_key, response, ttl, now);
            }
            _ => {
                self.store_negative(question_key, response, FAILURE_TTL, now);
            }
        }
    }
}

fn response_shell(question: &Question, rcode: ResponseCode) -> Message {
    let mut response = Message::new();
    response.set_message_type(MessageType::Response);
    response.set_op_code(OpCode::Query);
    response.set_response_code(rcode);
    response.add_query(question.to_query());
    response
}

fn replace_question(message: &mut Message, question: &Question) {
    message.take_queries();
    message.add_query(question.to_query());
}

fn parents(name: &Name) -> Vec<Name> {
    let mut result = Vec::new();
    // the zero label name is a special case with no parents
    let mut name = name.base_name();
    while name.num_labels() > 0 {
        let another = name.base_name();
        result.push(name);
        name = another;
    }
    result.push(Name::root());
    result
}

fn group_by_owner_and_type(records: &[Record]) -> HashMap<CacheKey, Vec<Record>> {
    let mut result: HashMap<CacheKey, Vec<Record>> = HashMap::new();
    for record in records {
        if record.record_type() == RecordType::OPT {
            continue;
        }
        let key = CacheKey::new(record.name(), record.record_type());
        result.entry(key).or_default().push(record.clone());
    }
    result
}

fn referral_records(name_servers: &[Record], additionals: &[Record]) -> Vec<Record> {
    let mut records: Vec<Record> =
        name_servers.iter().filter(|r| r.record_type() == RecordType::NS).cloned().collect();
    records.extend(
        additionals
            .iter()
            .filter(|r| matches!(r.record_type(), RecordType::A | RecordType::AAAA))
            .cloned(),
    );
    records
}

/// Only referral data relevant to the resolved name may enter the
/// cache; a misconfigured or malicious server handing out unrelated NS
/// or glue poisons nothing. Any wrong record skips all caching.
fn eligible(name_servers: &[Record], additionals: &[Record], to_resolve: &Name) -> bool {
    let mut targets = Vec::new();
    for name_server in name_servers {
        if name_server.record_type() != RecordType::NS {
            continue;
        }
        if let RData::NS(target) = name_server.data() {
            targets.push(target.0.clone());
        }
        if !name_server.name().zone_of(to_resolve) {
            debug!(%to_resolve, %name_server, "Received out of zone ns record");
            return false;
        }
    }
    for glue in additionals {
        if !matches!(glue.record_type(), RecordType::A | RecordType::AAAA) {
            continue;
        }
        if !targets.iter().any(|target| target == glue.name()) {
            debug!(%glue, "Glue record without matching NS");
            return false;
        }
    }
    true
}

fn negative_ttl(response: &Message) -> Duration {
    response
        .name_servers()
        .iter()
        .filter_map(|record| match record.data() {
            RData::SOA(soa) => Some(Duration::from_secs(
                u64::from(soa.minimum().min(record.ttl())),
            )),
            _ => None,
        })
        .min()
        .unwrap_or(FAILURE_TTL)
}

/// Creates and returns a copy of the records, replacing each TTL with
/// the remaining cache lifetime.
fn update_ttl(item: (Vec<Record>, Duration)) -> Vec<Record> {
    item.0
        .iter()
        .map(|record| {
            let mut record = record.clone();
            record.set_ttl(item.1.as_secs() as u32);
            record
        })
        .collect()
}
