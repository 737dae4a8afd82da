use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::dnssec::rdata::DNSSECRData;
use hickory_proto::dnssec::Proof;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tracing::{debug, instrument, warn};

use crate::cache::{CacheLookup, DnsCache};
use crate::context::Frame;
use crate::errors::ResolveError;
use crate::failure::{add_extended_error, ExtendedErrorCode};
use crate::question::Question;

/// NSEC3 iteration counts above this are treated as insecure rather
/// than computed (CVE-2023-50868).
pub const MAX_NSEC3_ITERATIONS: u16 = 100;
/// At most this many DNSKEYs may share a key tag (CVE-2023-50387).
pub const MAX_KEYS_PER_TAG: usize = 4;
/// Work units between cooperative suspensions.
const BATCH_SIZE: usize = 8;
/// Suspensions allowed while processing a single response.
const MAX_SUSPENSIONS: usize = 16;

/// Outcome of deciding the delegation-signer status for a zone cut.
#[derive(Debug, Clone, PartialEq)]
pub enum DsLookupResult {
    NoDecision,
    UnsignedZone,
    HasRecords(Vec<Record>),
}

/// Tags each record in a response with its DNSSEC proof status. The
/// controller interprets the tags; implementations carry the actual
/// cryptography (or a presence heuristic) and must enforce the
/// iteration and key-tag caps.
#[async_trait]
pub trait DnssecValidator: Debug + Send + Sync {
    async fn annotate(
        &self,
        response: &mut Message,
        ds_records: Option<&[Record]>,
    ) -> Result<(), ResolveError>;
}

/// The default collaborator: decides proof status from the presence of
/// signatures rather than verifying them, while still enforcing the
/// resource caps a verifying implementation needs.
#[derive(Debug, Default)]
pub struct PresenceValidator;

#[async_trait]
impl DnssecValidator for PresenceValidator {
    async fn annotate(
        &self,
        response: &mut Message,
        ds_records: Option<&[Record]>,
    ) -> Result<(), ResolveError> {
        check_key_tag_collisions(response.answers())?;
        if nsec3_iterations_excessive(response) {
            warn!("nsec3 iteration count over cap, downgrading to insecure");
            mark_insecure(response);
            return Ok(());
        }
        if ds_records.is_none() {
            return Ok(());
        }
        let signed_types = covered_types(response.answers());
        let mut suspensions = 0;
        let mut processed = 0;
        let mut answers = response.take_answers();
        for record in answers.iter_mut() {
            if signed_types.iter().any(|(owner, covered)| {
                owner == record.name() && *covered == record.record_type()
            }) {
                record.set_proof(Proof::Secure);
            }
            processed += 1;
            if processed % BATCH_SIZE == 0 {
                if suspensions >= MAX_SUSPENSIONS {
                    break;
                }
                suspensions += 1;
                tokio::task::yield_now().await;
            }
        }
        response.insert_answers(answers);
        Ok(())
    }
}

fn covered_types(records: &[Record]) -> Vec<(Name, RecordType)> {
    records
        .iter()
        .filter_map(|record| match record.data() {
            RData::DNSSEC(DNSSECRData::RRSIG(sig)) => {
                Some((record.name().clone(), sig.type_covered()))
            }
            _ => None,
        })
        .collect()
}

fn check_key_tag_collisions(records: &[Record]) -> Result<(), ResolveError> {
    let mut tags: Vec<u16> = Vec::new();
    for record in records {
        if let RData::DNSSEC(DNSSECRData::DNSKEY(key)) = record.data() {
            if let Ok(tag) = key.calculate_key_tag() {
                tags.push(tag);
            }
        }
    }
    for tag in &tags {
        if tags.iter().filter(|t| *t == tag).count() > MAX_KEYS_PER_TAG {
            return Err(ResolveError::DnssecValidation(format!(
                "more than {MAX_KEYS_PER_TAG} DNSKEYs share key tag {tag}"
            )));
        }
    }
    Ok(())
}

fn nsec3_iterations_excessive(response: &Message) -> bool {
    response
        .answers()
        .iter()
        .chain(response.name_servers().iter())
        .any(|record| match record.data() {
            RData::DNSSEC(DNSSECRData::NSEC3(nsec3)) => {
                nsec3.iterations() > MAX_NSEC3_ITERATIONS
            }
            _ => false,
        })
}

fn mark_insecure(response: &mut Message) {
    let mut answers = response.take_answers();
    for record in answers.iter_mut() {
        record.set_proof(Proof::Insecure);
    }
    response.insert_answers(answers);
    let mut authority = response.take_name_servers();
    for record in authority.iter_mut() {
        record.set_proof(Proof::Insecure);
    }
    response.insert_name_servers(authority);
}

fn has_proof_material(response: &Message) -> bool {
    let answer_proof = response.answers().iter().any(|record| {
        matches!(record.record_type(), RecordType::RRSIG | RecordType::DNSKEY | RecordType::DS)
    });
    let authority_proof = response.name_servers().iter().any(|record| {
        matches!(
            record.record_type(),
            RecordType::RRSIG | RecordType::NSEC | RecordType::NSEC3 | RecordType::DS
        )
    });
    answer_proof || authority_proof
}

/// Tracks the chain of trust across delegations. Applied to every
/// sanitized response while validation is enabled; mutates the head
/// frame's trust state and annotates the response on the way through.
#[derive(Debug, Clone)]
pub struct DnssecValidationController {
    validator: Arc<dyn DnssecValidator>,
}

impl DnssecValidationController {
    pub fn new(validator: Arc<dyn DnssecValidator>) -> Self {
        DnssecValidationController { validator }
    }

    #[instrument(skip_all, fields(question = %frame.question))]
    pub async fn apply(&self, frame: &mut Frame, mut response: Message, enabled: bool) -> Message {
        if !enabled {
            return response;
        }
        if !frame.dnssec_validation {
            // the chain was already severed higher up; everything below
            // the insecure cut stays insecure
            mark_insecure(&mut response);
            return response;
        }
        if let Err(e) = self
            .validator
            .annotate(&mut response, frame.last_ds_records.as_deref())
            .await
        {
            add_extended_error(&mut response, ExtendedErrorCode::DnssecBogus, &e.to_string());
            frame.last_error = Some(e);
            frame.dnssec_validation = false;
            return response;
        }
        if response.answers().iter().any(|record| record.proof() != Proof::Indeterminate) {
            return response;
        }

        let authority = response.name_servers();
        let has_ns = authority.iter().any(|r| r.record_type() == RecordType::NS);
        let only_ns = !authority.is_empty()
            && authority.iter().all(|r| r.record_type() == RecordType::NS);
        let ds: Vec<Record> =
            authority.iter().filter(|r| r.record_type() == RecordType::DS).cloned().collect();
        let has_denial = authority
            .iter()
            .any(|r| matches!(r.record_type(), RecordType::NSEC | RecordType::NSEC3));

        if frame.last_ds_records.is_some() {
            if only_ns {
                debug!("unsigned delegation, leaving the chain of trust");
                frame.dnssec_validation = false;
                frame.last_ds_records = None;
                mark_insecure(&mut response);
            } else if !ds.is_empty() {
                frame.last_ds_records = Some(ds);
            } else if has_denial {
                // authenticated denial of the DS: provably unsigned
                frame.dnssec_validation = false;
                frame.last_ds_records = None;
                mark_insecure(&mut response);
            } else if has_ns {
                let detail = format!(
                    "delegation for {} carries neither DS nor denial proof",
                    frame.question
                );
                add_extended_error(&mut response, ExtendedErrorCode::DnssecBogus, &detail);
                frame.last_error = Some(ResolveError::DnssecValidation(detail));
                frame.dnssec_validation = false;
                // an unprovable delegation must not be followed
                response.take_name_servers();
            } else {
                // not a delegation and nothing came back verified: an
                // unsigned answer below an established DS chain is the
                // injection shape and must fail closed
                let detail = format!(
                    "response for {} carries no signatures below a signed cut",
                    frame.question
                );
                add_extended_error(&mut response, ExtendedErrorCode::DnssecBogus, &detail);
                frame.last_error = Some(ResolveError::DnssecValidation(detail));
                frame.dnssec_validation = false;
            }
        } else if !has_proof_material(&response) {
            add_extended_error(
                &mut response,
                ExtendedErrorCode::DnssecIndeterminate,
                "no trust anchor covers this response",
            );
            frame.dnssec_validation = false;
        }
        response
    }
}

/// Decides the DS outcome for `owner` from a referral response, falling
/// back to the shared cache.
pub async fn ds_lookup(cache: &dyn DnsCache, owner: &Name, response: &Message) -> DsLookupResult {
    let ds: Vec<Record> = response
        .name_servers()
        .iter()
        .filter(|r| r.record_type() == RecordType::DS && r.name() == owner)
        .cloned()
        .collect();
    if !ds.is_empty() {
        return DsLookupResult::HasRecords(ds);
    }
    let denied = response.name_servers().iter().any(|r| {
        matches!(r.record_type(), RecordType::NSEC | RecordType::NSEC3)
            && owner.zone_of(r.name())
    });
    if denied {
        return DsLookupResult::UnsignedZone;
    }

    let question = Question::new(owner.clone(), RecordType::DS);
    match cache.lookup(&question, CacheLookup::default()).await {
        Some(cached) => {
            let denial = cached.name_servers().iter().any(|r| {
                matches!(
                    r.record_type(),
                    RecordType::SOA | RecordType::NSEC | RecordType::NSEC3
                )
            });
            if denial {
                return DsLookupResult::UnsignedZone;
            }
            let ds: Vec<Record> = cached
                .answers()
                .iter()
                .filter(|r| r.record_type() == RecordType::DS)
                .cloned()
                .collect();
            if ds.is_empty() {
                DsLookupResult::NoDecision
            } else {
                DsLookupResult::HasRecords(ds)
            }
        }
        None => DsLookupResult::NoDecision,
    }
}
