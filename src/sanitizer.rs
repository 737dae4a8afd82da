use hickory_proto::op::Message;
use hickory_proto::dnssec::rdata::DNSSECRData;
use hickory_proto::dnssec::Proof;
use hickory_proto::rr::{Name, RData, Record, RecordType};

/// Normalizes a raw upstream response before classification. Every
/// stage is a filter, so running the pipeline twice yields the same
/// datagram as running it once.
///
/// The zone cut rules: records outside the current cut are attacker-
/// controllable bait and get dropped. The root cut is the one place
/// where everything is in-zone, so no trimming applies there.
pub fn sanitize(
    mut response: Message,
    qname: &Name,
    qtype: RecordType,
    zone_cut: Option<&Name>,
) -> Message {
    let answers = trim_answers(response.take_answers(), qname, qtype);
    let authority = trim_authority(response.take_name_servers(), zone_cut);
    let additionals = filter_additionals(dedup_opt(response.take_additionals()), zone_cut);
    response.insert_answers(answers);
    response.insert_name_servers(authority);
    response.insert_additionals(additionals);
    response
}

/// Removes records whose DNSSEC proof came back indeterminate, keeping
/// authority NS so referrals survive in insecure zones. Only meaningful
/// after the validation controller has tagged the response.
pub fn prune_indeterminate(mut response: Message) -> Message {
    let answers = response
        .take_answers()
        .into_iter()
        .filter(|record| record.proof() != Proof::Indeterminate)
        .collect();
    let authority = response
        .take_name_servers()
        .into_iter()
        .filter(|record| {
            record.record_type() == RecordType::NS || record.proof() != Proof::Indeterminate
        })
        .collect();
    response.insert_answers(answers);
    response.insert_name_servers(authority);
    response
}

fn dedup_opt(additionals: Vec<Record>) -> Vec<Record> {
    let mut seen_opt = false;
    additionals
        .into_iter()
        .filter(|record| {
            if record.record_type() != RecordType::OPT {
                return true;
            }
            if seen_opt {
                return false;
            }
            seen_opt = true;
            true
        })
        .collect()
}

fn filter_additionals(additionals: Vec<Record>, zone_cut: Option<&Name>) -> Vec<Record> {
    let Some(cut) = zone_cut else { return additionals };
    if cut.is_root() {
        return additionals;
    }
    additionals
        .into_iter()
        .filter(|record| {
            record.record_type() == RecordType::OPT || cut.zone_of(record.name())
        })
        .collect()
}

/// Keeps only the CNAME chain leading from the query name: records at
/// the current chain head that either extend the chain, match the
/// queried type, or sign it. The answer section is truncated at the
/// first stray record so nothing after a mismatch survives.
fn trim_answers(answers: Vec<Record>, qname: &Name, qtype: RecordType) -> Vec<Record> {
    let mut kept = Vec::with_capacity(answers.len());
    let mut current = qname.to_lowercase();
    for record in answers {
        let owner = record.name().to_lowercase();
        let keep = if owner == current {
            match record.record_type() {
                RecordType::CNAME => {
                    if let RData::CNAME(target) = record.data() {
                        current = target.0.to_lowercase();
                    }
                    true
                }
                RecordType::RRSIG => true,
                found => found == qtype || qtype == RecordType::ANY,
            }
        } else {
            record.record_type() == RecordType::DNAME && owner.zone_of(&current)
        };
        if !keep {
            break;
        }
        kept.push(record);
    }
    kept
}

fn trim_authority(authority: Vec<Record>, zone_cut: Option<&Name>) -> Vec<Record> {
    let Some(cut) = zone_cut else { return authority };
    if cut.is_root() {
        return authority;
    }
    authority
        .into_iter()
        .filter(|record| {
            let judged = match record.data() {
                RData::DNSSEC(DNSSECRData::RRSIG(sig)) => sig.type_covered(),
                _ => record.record_type(),
            };
            match judged {
                RecordType::SOA | RecordType::NS => cut.zone_of(record.name()),
                _ => true,
            }
        })
        .collect()
}
