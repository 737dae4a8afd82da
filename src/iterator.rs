use std::net::{IpAddr, SocketAddr};

use hickory_proto::rr::Name;

use crate::context::Frame;

/// At most this many servers are ever tried per referral, however many
/// the delegation names (NXNSAttack mitigation).
pub const MAX_SERVERS_PER_REFERRAL: usize = 16;

pub const DNS_PORT: u16 = 53;

/// A name server as learned from a referral: a hostname, plus an
/// endpoint once glue (or a cache hit, or a sub-resolution) supplied
/// one. A server without an endpoint requires glue resolution before it
/// can be queried. `aaaa_attempted` marks a deferred IPv4 retry entry
/// left behind after an AAAA glue attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameServerAddress {
    pub host: Name,
    pub endpoint: Option<SocketAddr>,
    pub aaaa_attempted: bool,
}

impl NameServerAddress {
    pub fn named(host: Name) -> Self {
        NameServerAddress { host, endpoint: None, aaaa_attempted: false }
    }

    pub fn resolved(host: Name, addr: IpAddr) -> Self {
        NameServerAddress { host, endpoint: Some(SocketAddr::new(addr, DNS_PORT)), aaaa_attempted: false }
    }

    pub fn with_endpoint(&self, addr: IpAddr) -> Self {
        NameServerAddress {
            host: self.host.clone(),
            endpoint: Some(SocketAddr::new(addr, DNS_PORT)),
            aaaa_attempted: self.aaaa_attempted,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.endpoint.is_some()
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self.endpoint, Some(addr) if addr.is_ipv6())
    }

    pub fn is_loopback(&self) -> bool {
        matches!(self.endpoint, Some(addr) if addr.ip().is_loopback())
    }
}

impl std::fmt::Display for NameServerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.endpoint {
            Some(addr) => write!(f, "{} ({})", self.host, addr),
            None => write!(f, "{} (unresolved)", self.host),
        }
    }
}

/// What the iterator hands the driver next: a batch of servers with
/// known endpoints to race, or a single server that needs glue first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerSelection {
    Batch(Vec<NameServerAddress>),
    NeedsGlue(NameServerAddress),
}

/// Walks the head frame's server list. Starting at the frame's current
/// index it collects contiguous resolved entries into a batch; with no
/// resolved entry at the cursor it yields the unresolved one so glue
/// resolution can run. Selecting a batch leaves the index on the batch's
/// last member, so `move_next` lands on the first untried server.
#[derive(Debug)]
pub struct NameServerIterator<'a> {
    frame: &'a mut Frame,
}

impl<'a> NameServerIterator<'a> {
    pub fn new(frame: &'a mut Frame) -> Self {
        let window = Self::window_of(frame);
        frame.name_server_index = frame.name_server_index.min(window);
        NameServerIterator { frame }
    }

    fn window_of(frame: &Frame) -> usize {
        frame.name_servers.len().min(MAX_SERVERS_PER_REFERRAL)
    }

    fn window(&self) -> usize {
        Self::window_of(self.frame)
    }

    pub fn has_more(&self) -> bool {
        self.frame.name_server_index < self.window()
    }

    pub fn select_next_batch(&mut self) -> Option<ServerSelection> {
        if !self.has_more() {
            return None;
        }
        let start = self.frame.name_server_index;
        let window = self.window();
        let batch: Vec<NameServerAddress> = self.frame.name_servers[start..window]
            .iter()
            .take_while(|server| server.is_resolved())
            .cloned()
            .collect();
        if batch.is_empty() {
            return Some(ServerSelection::NeedsGlue(self.frame.name_servers[start].clone()));
        }
        self.frame.name_server_index = start + batch.len() - 1;
        Some(ServerSelection::Batch(batch))
    }

    pub fn move_next(&mut self) {
        self.frame.name_server_index = (self.frame.name_server_index + 1).min(self.window());
    }

    /// Steps back onto the server that just answered, for retrying it
    /// with an adjusted question.
    pub fn rewind_to_current(&mut self) {
        self.frame.name_server_index = self.frame.name_server_index.saturating_sub(1);
    }
}
