use hickory_proto::op::{Edns, Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::opt::{EdnsCode, EdnsOption};
use hickory_proto::rr::{Record, RecordType};
use tracing::debug;

use crate::cache::DnsCache;
use crate::context::Frame;
use crate::errors::ResolveError;
use crate::options::ResolverOptions;
use crate::question::Question;

/// EDNS option code for extended DNS errors (RFC 8914).
pub const EDE_OPTION_CODE: u16 = 15;
/// EDNS option code for client subnet (RFC 7871).
pub const CLIENT_SUBNET_OPTION_CODE: u16 = 8;

/// The extended-error codes this resolver emits, with their IANA
/// assigned values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendedErrorCode {
    Other = 0,
    DnssecIndeterminate = 5,
    DnssecBogus = 6,
    NoReachableAuthority = 22,
    NetworkError = 23,
}

/// Appends an extended DNS error option: a two octet info code followed
/// by UTF-8 diagnostic text.
pub fn add_extended_error(message: &mut Message, code: ExtendedErrorCode, text: &str) {
    let mut payload = Vec::with_capacity(2 + text.len());
    payload.extend_from_slice(&(code as u16).to_be_bytes());
    payload.extend_from_slice(text.as_bytes());
    let edns = message.extensions_mut().get_or_insert_with(Edns::new);
    edns.options_mut().insert(EdnsOption::Unknown(EDE_OPTION_CODE, payload));
}

/// Decodes the extended-error option, if any.
pub fn extended_error(message: &Message) -> Option<(u16, String)> {
    let edns = message.extensions().as_ref()?;
    match edns.options().get(EdnsCode::Unknown(EDE_OPTION_CODE)) {
        Some(EdnsOption::Unknown(_, payload)) if payload.len() >= 2 => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            Some((code, String::from_utf8_lossy(&payload[2..]).to_string()))
        }
        _ => None,
    }
}

/// Builds a SERVFAIL for the caller's question, carrying the extended
/// error and replaying the client-subnet shadow option when one was
/// configured for the query.
pub fn synthesize_servfail(
    question: &Question,
    code: ExtendedErrorCode,
    text: &str,
    options: &ResolverOptions,
) -> Message {
    let mut response = Message::new();
    response.set_message_type(MessageType::Response);
    response.set_op_code(OpCode::Query);
    response.set_response_code(ResponseCode::ServFail);
    response.add_query(question.to_query());
    add_extended_error(&mut response, code, text);
    if let Some(subnet) = &options.edns_client_subnet {
        let edns = response.extensions_mut().get_or_insert_with(Edns::new);
        edns.options_mut()
            .insert(EdnsOption::Unknown(CLIENT_SUBNET_OPTION_CODE, subnet.to_wire()));
    }
    response
}

/// Strips authority and additional data, keeping only the OPT record.
pub fn trim_minimal(mut response: Message) -> Message {
    response.take_name_servers();
    let additionals: Vec<Record> = response
        .take_additionals()
        .into_iter()
        .filter(|record| record.record_type() == RecordType::OPT)
        .collect();
    response.insert_additionals(additionals);
    response
}

fn question_matches(response: &Message, question: &Question) -> bool {
    match response.queries().first() {
        Some(echoed) => {
            echoed.name() == &question.name
                && echoed.query_type() == question.record_type
                && echoed.query_class() == question.query_class
        }
        None => false,
    }
}

async fn cached_servfail(
    question: &Question,
    code: ExtendedErrorCode,
    text: &str,
    cache: &dyn DnsCache,
    options: &ResolverOptions,
) -> Message {
    let response = synthesize_servfail(question, code, text, options);
    cache.store(&response, false).await;
    response
}

/// Produces the terminal outcome once no transition is possible for the
/// head frame: the last usable response if it answers the caller's
/// question, otherwise a cached SERVFAIL classified from the last
/// error. DNSSEC failures are raised after caching the offending
/// response as DNSSEC-bad.
pub async fn synthesize(
    frame: &mut Frame,
    cache: &dyn DnsCache,
    options: &ResolverOptions,
) -> Result<Message, ResolveError> {
    let question = frame.question.clone();
    let dnssec_failed =
        matches!(frame.last_error, Some(ResolveError::DnssecValidation(_)));
    if !dnssec_failed {
        if let Some(last) = frame.last_response.take() {
            if question_matches(&last, &question) {
                if last.response_code() != ResponseCode::NoError {
                    cache.store(&last, false).await;
                }
                debug!(%question, "returning last upstream response as terminal outcome");
                return Ok(if options.minimal_response { trim_minimal(last) } else { last });
            }
            frame.last_response = Some(last);
        }
    }
    match frame.last_error.take() {
        Some(ResolveError::DnssecValidation(detail)) => {
            match frame.last_response.take() {
                Some(bad) => {
                    cache.store(&bad, true).await;
                    if !question_matches(&bad, &question) {
                        let mirror = synthesize_servfail(
                            &question,
                            ExtendedErrorCode::DnssecBogus,
                            &detail,
                            options,
                        );
                        cache.store(&mirror, false).await;
                    }
                }
                None => {
                    let mirror = synthesize_servfail(
                        &question,
                        ExtendedErrorCode::DnssecBogus,
                        &detail,
                        options,
                    );
                    cache.store(&mirror, false).await;
                }
            }
            Err(ResolveError::DnssecValidation(detail))
        }
        Some(ResolveError::Cancelled) => Err(ResolveError::Cancelled),
        Some(ResolveError::Timeout) => Ok(cached_servfail(
            &question,
            ExtendedErrorCode::NoReachableAuthority,
            &format!("no authority answered for {question} before the timeout"),
            cache,
            options,
        )
        .await),
        Some(ResolveError::Network(e)) => Ok(cached_servfail(
            &question,
            ExtendedErrorCode::NetworkError,
            &e.to_string(),
            cache,
            options,
        )
        .await),
        Some(ResolveError::NoResponse) => Ok(cached_servfail(
            &question,
            ExtendedErrorCode::NoReachableAuthority,
            &format!("no usable response for {question}"),
            cache,
            options,
        )
        .await),
        Some(other) => Ok(cached_servfail(
            &question,
            ExtendedErrorCode::Other,
            &other.to_string(),
            cache,
            options,
        )
        .await),
        None => {
            let cut = frame
                .zone_cut
                .as_ref()
                .map(|c| c.to_string())
                .unwrap_or_else(|| ".".to_string());
            Ok(cached_servfail(
                &question,
                ExtendedErrorCode::NoReachableAuthority,
                &format!("no response at zone cut {cut}"),
                cache,
                options,
            )
            .await)
        }
    }
}
