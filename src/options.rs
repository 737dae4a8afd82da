use std::net::IpAddr;
use std::time::Duration;

use crate::errors::ResolveError;

/// EDNS Client Subnet prefix attached to outgoing queries and replayed on
/// synthesized failure responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSubnet {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl ClientSubnet {
    /// Wire form per RFC 7871: family, source prefix, scope prefix, then
    /// the address truncated to the prefix.
    pub fn to_wire(&self) -> Vec<u8> {
        let (family, octets): (u16, Vec<u8>) = match self.addr {
            IpAddr::V4(v4) => (1, v4.octets().to_vec()),
            IpAddr::V6(v6) => (2, v6.octets().to_vec()),
        };
        let keep = usize::from(self.prefix).div_ceil(8).min(octets.len());
        let mut wire = Vec::with_capacity(4 + keep);
        wire.extend_from_slice(&family.to_be_bytes());
        wire.push(self.prefix);
        wire.push(0);
        wire.extend_from_slice(&octets[..keep]);
        wire
    }
}

/// Per-query knobs. The resolver validates these once, up front;
/// violations surface as [`ResolveError::Configuration`] and are never
/// cached.
#[derive(Debug, Clone)]
pub struct ResolverOptions {
    pub prefer_ipv6: bool,
    pub randomize_name: bool,
    pub qname_minimization: bool,
    pub dnssec_validation: bool,
    pub udp_payload_size: u16,
    pub edns_client_subnet: Option<ClientSubnet>,
    pub retries: u32,
    pub timeout: Duration,
    pub concurrency: usize,
    pub max_stack_count: usize,
    pub max_total_frames: usize,
    pub max_hops: u32,
    pub minimal_response: bool,
    pub async_ns_resolution: bool,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        ResolverOptions {
            prefer_ipv6: false,
            randomize_name: false,
            qname_minimization: true,
            dnssec_validation: false,
            udp_payload_size: 1232,
            edns_client_subnet: None,
            retries: 2,
            timeout: Duration::from_secs(2),
            concurrency: 2,
            max_stack_count: 32,
            max_total_frames: 128,
            max_hops: 64,
            minimal_response: false,
            async_ns_resolution: false,
        }
    }
}

impl ResolverOptions {
    pub fn validate(&self) -> Result<(), ResolveError> {
        if self.udp_payload_size < 512
            && (self.dnssec_validation || self.edns_client_subnet.is_some())
        {
            return Err(ResolveError::Configuration(format!(
                "udp payload size {} is below the 512 octet minimum required with DNSSEC or client subnet",
                self.udp_payload_size
            )));
        }
        if self.timeout.is_zero() {
            return Err(ResolveError::Configuration("timeout must be non-zero".to_string()));
        }
        if self.concurrency == 0 {
            return Err(ResolveError::Configuration("concurrency must be at least 1".to_string()));
        }
        if self.max_stack_count == 0 {
            return Err(ResolveError::Configuration(
                "max stack count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{ClientSubnet, ResolverOptions};
    use crate::errors::ResolveError;

    #[test]
    fn test_defaults_are_valid() {
        ResolverOptions::default().validate().unwrap();
    }

    #[test]
    fn test_small_payload_rejected_with_dnssec() {
        let mut options = ResolverOptions { udp_payload_size: 500, ..Default::default() };
        options.validate().unwrap();

        options.dnssec_validation = true;
        assert!(matches!(options.validate(), Err(ResolveError::Configuration(_))));

        options.dnssec_validation = false;
        options.edns_client_subnet =
            Some(ClientSubnet { addr: "192.0.2.0".parse().unwrap(), prefix: 24 });
        assert!(matches!(options.validate(), Err(ResolveError::Configuration(_))));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let options = ResolverOptions { concurrency: 0, ..Default::default() };
        assert!(matches!(options.validate(), Err(ResolveError::Configuration(_))));
    }

    #[test]
    fn test_client_subnet_wire() {
        let subnet = ClientSubnet { addr: "192.0.2.7".parse().unwrap(), prefix: 24 };
        assert_eq!(vec![0, 1, 24, 0, 192, 0, 2], subnet.to_wire());

        let subnet = ClientSubnet { addr: "2001:db8::1".parse().unwrap(), prefix: 32 };
        assert_eq!(vec![0, 2, 32, 0, 0x20, 0x01, 0x0d, 0xb8], subnet.to_wire());
    }
}
