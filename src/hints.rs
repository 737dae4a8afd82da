use std::io::{self, BufRead};
use std::net::IpAddr;
use std::path::Path;

use hickory_proto::dnssec::rdata::{DNSSECRData, DS};
use hickory_proto::dnssec::{Algorithm, DigestType};
use hickory_proto::rr::{Name, RData, Record};
use lazy_static::lazy_static;
use rand::seq::SliceRandom;
use rand::thread_rng;
use tracing::warn;

use crate::iterator::NameServerAddress;

// a.root-servers.net through m.root-servers.net, v4 and v6
const ROOT_SERVERS: [(&str, &str, &str); 13] = [
    ("a.root-servers.net.", "198.41.0.4", "2001:503:ba3e::2:30"),
    ("b.root-servers.net.", "170.247.170.2", "2801:1b8:10::b"),
    ("c.root-servers.net.", "192.33.4.12", "2001:500:2::c"),
    ("d.root-servers.net.", "199.7.91.13", "2001:500:2d::d"),
    ("e.root-servers.net.", "192.203.230.10", "2001:500:a8::e"),
    ("f.root-servers.net.", "192.5.5.241", "2001:500:2f::f"),
    ("g.root-servers.net.", "192.112.36.4", "2001:500:12::d0d"),
    ("h.root-servers.net.", "198.97.190.53", "2001:500:1::53"),
    ("i.root-servers.net.", "192.36.148.17", "2001:7fe::53"),
    ("j.root-servers.net.", "192.58.128.30", "2001:503:c27::2:30"),
    ("k.root-servers.net.", "193.0.14.129", "2001:7fd::1"),
    ("l.root-servers.net.", "199.7.83.42", "2001:500:9f::42"),
    ("m.root-servers.net.", "202.12.27.33", "2001:dc3::35"),
];

// the root KSK-2017 and KSK-2024 delegation signers
const ROOT_ANCHORS: [(u16, &str); 2] = [
    (20326, "e06d44b80b8f1d39a95c0b0d7c65d08458e880409bbc683457104237c7f8ec8d"),
    (38696, "683d2d0acb8c9b712a1948b27f741219298d0a450d612c483af444a4c0fb2b16"),
];

lazy_static! {
    static ref BUILT_IN: Vec<NameServerAddress> = ROOT_SERVERS
        .iter()
        .flat_map(|(host, v4, v6)| {
            let name: Name = host.parse().unwrap();
            [
                NameServerAddress::resolved(name.clone(), v4.parse::<IpAddr>().unwrap()),
                NameServerAddress::resolved(name, v6.parse::<IpAddr>().unwrap()),
            ]
        })
        .collect();
    static ref TRUST_ANCHORS: Vec<Record> = ROOT_ANCHORS
        .iter()
        .map(|(tag, digest)| {
            Record::from_rdata(
                Name::root(),
                172_800,
                RData::DNSSEC(DNSSECRData::DS(DS::new(
                    *tag,
                    Algorithm::RSASHA256,
                    DigestType::SHA256,
                    hex::decode(digest).unwrap(),
                ))),
            )
        })
        .collect();
}

/// Provides the servers a resolution primes with, and the trust
/// anchors a validating resolution starts from. Hints loaded from a
/// roots file replace the built-in list; the built-ins guarantee an
/// empty cache can always start walking.
#[derive(Debug, Clone, Default)]
pub struct RootHints {
    from_file: Option<Vec<NameServerAddress>>,
}

impl RootHints {
    pub fn built_in() -> Self {
        RootHints { from_file: None }
    }

    #[cfg(test)]
    pub(crate) fn fixed(servers: Vec<NameServerAddress>) -> Self {
        RootHints { from_file: Some(servers) }
    }

    /// Reads a `named.root` style hints file: whitespace separated
    /// `NAME TTL [CLASS] TYPE DATA` entries, `;` comments. Unparseable
    /// lines are skipped with a warning.
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let file = std::fs::File::open(path)?;
        let mut servers = Vec::new();
        for line in io::BufReader::new(file).lines() {
            let line = line?;
            let line = line.split(';').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            let (host, record_type, data) = match fields.as_slice() {
                [host, _ttl, record_type, data] => (host, record_type, data),
                [host, _ttl, _class, record_type, data] => (host, record_type, data),
                _ => continue,
            };
            if !matches!(*record_type, "A" | "AAAA") {
                continue;
            }
            let parsed: Result<(Name, IpAddr), _> = host
                .parse::<Name>()
                .map_err(io::Error::other)
                .and_then(|name| Ok((name, data.parse::<IpAddr>().map_err(io::Error::other)?)));
            match parsed {
                Ok((name, addr)) => servers.push(NameServerAddress::resolved(name, addr)),
                Err(e) => warn!(%line, "skipping unparseable root hint: {e}"),
            }
        }
        if servers.is_empty() {
            return Err(io::Error::other("no usable root hints in file"));
        }
        Ok(RootHints { from_file: Some(servers) })
    }

    fn servers(&self) -> &[NameServerAddress] {
        self.from_file.as_deref().unwrap_or(&BUILT_IN)
    }

    /// The priming list: shuffled, and with IPv6 preferred the v6
    /// servers lead while one v4 server is kept near the top as a
    /// fallback for v6-broken paths.
    pub fn get_shuffled(&self, prefer_ipv6: bool) -> Vec<NameServerAddress> {
        let mut servers: Vec<NameServerAddress> = self.servers().to_vec();
        servers.shuffle(&mut thread_rng());
        if prefer_ipv6 {
            servers.sort_by_key(|server| !server.is_ipv6());
            if let Some(first_v4) = servers.iter().position(|server| !server.is_ipv6()) {
                if first_v4 > 1 {
                    let v4 = servers.remove(first_v4);
                    servers.insert(1, v4);
                }
            }
        }
        servers
    }

    /// The DS set anchoring the chain of trust at the root.
    pub fn root_trust_anchors(&self) -> Vec<Record> {
        TRUST_ANCHORS.clone()
    }
}
