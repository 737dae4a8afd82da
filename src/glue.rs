use hickory_proto::rr::RecordType;
use tracing::debug;

use crate::context::Frame;
use crate::errors::ResolveError;
use crate::iterator::NameServerAddress;
use crate::options::ResolverOptions;
use crate::question::Question;

/// Builds the child frame that resolves an unresolved name server's
/// address. The child inherits the parent's zone cut, trust-chain state
/// and hop count, and starts with an empty server list so the cache
/// stage (or root priming) seeds it — seeding it with the very server
/// being resolved would just re-enter glue resolution.
///
/// With IPv6 preferred the first attempt asks for AAAA and a deferred
/// IPv4 retry entry is appended to the parent's list, so a later pass
/// can still try A.
pub fn prepare_glue_frame(
    parent: &mut Frame,
    server: &NameServerAddress,
    options: &ResolverOptions,
) -> Result<Frame, ResolveError> {
    let attempt_aaaa = options.prefer_ipv6 && !server.aaaa_attempted;
    let record_type = if attempt_aaaa { RecordType::AAAA } else { RecordType::A };
    if attempt_aaaa {
        let mut fallback = server.clone();
        fallback.aaaa_attempted = true;
        parent.name_servers.push(fallback);
    }
    debug!(host = %server.host, %record_type, "pushing glue resolution frame");

    let question = Question::new(server.host.clone(), record_type);
    let mut child = Frame::new(
        question,
        parent.zone_cut.clone(),
        parent.dnssec_validation,
        parent.last_ds_records.clone(),
    )?;
    child.hop_count = parent.hop_count;
    Ok(child)
}
