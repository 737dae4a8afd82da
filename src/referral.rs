use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Mutex;

use hickory_proto::op::Message;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use rand::seq::SliceRandom;
use rand::thread_rng;
use tracing::{debug, instrument};

use crate::cache::{CacheLookup, DnsCache};
use crate::context::Frame;
use crate::dnssec::{ds_lookup, DsLookupResult};
use crate::iterator::NameServerAddress;
use crate::options::ResolverOptions;
use crate::question::Question;

/// Upper bound on concurrently in-flight speculative glue lookups.
pub const MAX_SPECULATIVE: usize = 4;

/// Registry of speculative glue lookups, keyed by lower-case NS
/// hostname so the same server is never resolved twice concurrently.
#[derive(Debug, Default)]
pub struct SpeculativeGlue {
    inflight: Mutex<HashSet<String>>,
}

impl SpeculativeGlue {
    pub fn try_register(&self, host: &Name) -> bool {
        let key = host.to_lowercase().to_string();
        let mut inflight = self.inflight.lock().unwrap();
        if inflight.len() >= MAX_SPECULATIVE || inflight.contains(&key) {
            return false;
        }
        inflight.insert(key);
        true
    }

    pub fn complete(&self, host: &Name) {
        self.inflight.lock().unwrap().remove(&host.to_lowercase().to_string());
    }

    pub fn len(&self) -> usize {
        self.inflight.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of attempting a delegation transition.
#[derive(Debug)]
pub struct TransitionOutcome {
    /// False when the referral produced no usable servers and the
    /// caller should advance to the next server instead.
    pub committed: bool,
    /// Hostnames registered for speculative background resolution.
    pub speculative: Vec<Name>,
}

/// Commits a delegation transition onto the head frame: extracts the
/// NS set with its glue, fills endpoints from the cache, applies the
/// delegation-signer outcome, reorders the servers, and advances the
/// frame to the child zone.
#[instrument(skip_all, fields(question = %frame.question))]
pub async fn commit_transition(
    frame: &mut Frame,
    response: &Message,
    cache: &dyn DnsCache,
    options: &ResolverOptions,
    speculative: &SpeculativeGlue,
) -> TransitionOutcome {
    let aborted = TransitionOutcome { committed: false, speculative: Vec::new() };
    let Some(new_cut) = first_ns_owner(response) else {
        return aborted;
    };

    let mut servers = extract_servers(response);
    if servers.is_empty() {
        debug!(cut = %new_cut, "referral names no usable servers");
        return aborted;
    }

    for server in servers.iter_mut() {
        if server.is_resolved() {
            continue;
        }
        if let Some(addr) = cached_address(cache, &server.host, options.prefer_ipv6).await {
            *server = server.with_endpoint(addr);
        }
    }

    if options.dnssec_validation && frame.dnssec_validation {
        match ds_lookup(cache, &new_cut, response).await {
            DsLookupResult::UnsignedZone => {
                frame.dnssec_validation = false;
                frame.last_ds_records = None;
            }
            DsLookupResult::HasRecords(records) => {
                frame.last_ds_records = Some(records);
            }
            DsLookupResult::NoDecision => {}
        }
    }

    servers.shuffle(&mut thread_rng());
    // stable partition: resolved before unresolved, and IPv6 before
    // IPv4 among the resolved when preferred
    servers.sort_by_key(|server| {
        (!server.is_resolved(), options.prefer_ipv6 && !server.is_ipv6())
    });

    let mut registered = Vec::new();
    if options.async_ns_resolution {
        for server in servers.iter().filter(|server| !server.is_resolved()) {
            let host = server.host.to_lowercase();
            if speculative.try_register(&host) {
                registered.push(host);
            }
        }
    }

    debug!(cut = %new_cut, servers = servers.len(), "committing delegation transition");
    frame.set_zone_cut(new_cut.clone());
    if options.qname_minimization {
        frame.question.set_zone_cut(Some(new_cut));
    }
    frame.name_servers = servers;
    frame.name_server_index = 0;
    frame.hop_count += 1;
    frame.last_response = None;

    TransitionOutcome { committed: true, speculative: registered }
}

fn first_ns_owner(response: &Message) -> Option<Name> {
    response
        .name_servers()
        .iter()
        .find(|record| record.record_type() == RecordType::NS)
        .map(|record| record.name().to_lowercase())
}

fn extract_servers(response: &Message) -> Vec<NameServerAddress> {
    let mut servers = Vec::new();
    let mut seen_hosts: Vec<Name> = Vec::new();
    for record in response.name_servers() {
        let RData::NS(target) = record.data() else {
            continue;
        };
        let host = target.0.to_lowercase();
        if seen_hosts.iter().any(|seen| seen == &host) {
            continue;
        }
        seen_hosts.push(host.clone());

        let glue: Vec<IpAddr> = response
            .additionals()
            .iter()
            .filter(|glue| glue.name() == &host)
            .filter_map(record_ip)
            .collect();
        if glue.is_empty() {
            servers.push(NameServerAddress::named(host));
        } else {
            for addr in glue {
                if addr.is_loopback() {
                    debug!(%host, %addr, "dropping loopback glue");
                    continue;
                }
                servers.push(NameServerAddress::resolved(host.clone(), addr));
            }
        }
    }
    servers
}

pub(crate) fn record_ip(record: &Record) -> Option<IpAddr> {
    match record.data() {
        RData::A(a) => Some(IpAddr::V4(a.0)),
        RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
        _ => None,
    }
}

async fn cached_address(cache: &dyn DnsCache, host: &Name, prefer_ipv6: bool) -> Option<IpAddr> {
    let record_type = if prefer_ipv6 { RecordType::AAAA } else { RecordType::A };
    let question = Question::new(host.clone(), record_type);
    let response = cache.lookup(&question, CacheLookup::default()).await?;
    response.answers().iter().filter_map(record_ip).find(|addr| !addr.is_loopback())
}
