use hickory_proto::ProtoError;
use thiserror::Error;

/// The failure taxonomy of a resolution. Transport failures of individual
/// servers are recorded on the current frame and the walk moves on; only
/// terminal outcomes surface to the caller, either as a synthesized
/// SERVFAIL response or as one of these errors.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("resolution cancelled")]
    Cancelled,
    #[error("recursion stack limit reached for {0}")]
    StackLimitExceeded(String),
    #[error("no reachable authority for {0}")]
    NoReachableAuthority(String),
    #[error("request timed out")]
    Timeout,
    #[error("no usable response from server")]
    NoResponse,
    #[error("failure in underlying io: {0}")]
    Network(#[from] std::io::Error),
    #[error("protocol error (likely serde related): {0}")]
    Protocol(#[from] ProtoError),
    #[error("DNSSEC validation failed: {0}")]
    DnssecValidation(String),
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("server failure: {0}")]
    ServFail(String),
}

impl ResolveError {
    /// Cancellation and configuration errors propagate as-is and must
    /// never end up cached as a synthesized failure.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ResolveError::Cancelled | ResolveError::Configuration(_))
    }
}

#[cfg(test)]
mod tests {
    use super::ResolveError;

    #[test]
    fn test_display() {
        let e = ResolveError::StackLimitExceeded("example.com. A".to_string());
        assert_eq!("recursion stack limit reached for example.com. A", e.to_string());
        assert!(ResolveError::Cancelled.is_fatal());
        assert!(!ResolveError::Timeout.is_fatal());
    }
}
