use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::RecordType;

use crate::question::Question;

/// What the driver should do with a sanitized, validated response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverDecision {
    ReturnAnswer,
    UnwindStack,
    DelegationTransition,
    RetryWithQNameMinimization,
    ContinueNextServer,
}

/// Pure decision function over (response, question, stack emptiness).
/// The rules are ordered; the first that matches wins:
///
/// 1. a suspended parent exists and the answer satisfies a glue or DS
///    child lookup: unwind,
/// 2. an answer or an authoritative name error: return it,
/// 3. NS in authority: follow the delegation,
/// 4. the wire question is still minimized: reveal more and retry,
/// 5. nothing usable: try the next server.
pub fn classify(response: &Message, question: &Question, stack_empty: bool) -> ResolverDecision {
    if !stack_empty
        && response.answers().iter().any(|record| {
            matches!(record.record_type(), RecordType::A | RecordType::AAAA | RecordType::DS)
        })
    {
        return ResolverDecision::UnwindStack;
    }
    if !response.answers().is_empty() || response.response_code() == ResponseCode::NXDomain {
        return ResolverDecision::ReturnAnswer;
    }
    if response
        .name_servers()
        .first()
        .is_some_and(|record| record.record_type() == RecordType::NS)
    {
        return ResolverDecision::DelegationTransition;
    }
    if question.is_minimized() {
        return ResolverDecision::RetryWithQNameMinimization;
    }
    ResolverDecision::ContinueNextServer
}
