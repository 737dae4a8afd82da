use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::{Name, RecordType};
use tracing::{debug, field::Empty, instrument};

use crate::cache::{CacheLookup, DnsCache, LruDnsCache};
use crate::cancel::CancelToken;
use crate::classifier::{classify, ResolverDecision};
use crate::context::{ContextLimits, Frame, QueryContext, QueryContextStore, StoreGuard};
use crate::dnssec::{DnssecValidationController, DnssecValidator, PresenceValidator};
use crate::errors::ResolveError;
use crate::failure::{self, ExtendedErrorCode};
use crate::glue;
use crate::hints::RootHints;
use crate::iterator::{NameServerAddress, NameServerIterator, ServerSelection};
use crate::options::ResolverOptions;
use crate::qmin;
use crate::question::Question;
use crate::referral::{self, commit_transition, SpeculativeGlue};
use crate::sanitizer::{prune_indeterminate, sanitize};
use crate::transport::{DispatchRequest, Dispatcher, UdpDispatcher};

/// What one step of the iterator+classifier pipeline asks the driver
/// to do next.
#[derive(Debug)]
enum ResolverEvent {
    /// An internal transition was applied; iterate again.
    Continue,
    /// A glue or DS sub-resolution is required.
    PushFrame(Frame),
    /// The head frame received its terminal response.
    FrameAnswered(Message),
    /// Every server at the current cut has been tried.
    Exhausted,
}

/// The iterative resolver: walks the delegation hierarchy from the
/// root downward on an explicit frame stack. Glue and DS
/// sub-resolutions push frames instead of recursing, which bounds
/// memory and keeps the depth limits enforceable in one place.
#[derive(Debug, Clone)]
pub struct Resolver {
    dispatcher: Arc<dyn Dispatcher>,
    cache: Arc<dyn DnsCache>,
    validator: Arc<dyn DnssecValidator>,
    contexts: Arc<QueryContextStore>,
    speculative: Arc<SpeculativeGlue>,
    hints: RootHints,
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolver {
    pub fn new() -> Self {
        Resolver {
            dispatcher: Arc::new(UdpDispatcher::new()),
            cache: Arc::new(LruDnsCache::default()),
            validator: Arc::new(PresenceValidator),
            contexts: Arc::new(QueryContextStore::with_default_capacity()),
            speculative: Arc::new(SpeculativeGlue::default()),
            hints: RootHints::built_in(),
        }
    }

    pub fn with_parts(
        dispatcher: Arc<dyn Dispatcher>,
        cache: Arc<dyn DnsCache>,
        validator: Arc<dyn DnssecValidator>,
        hints: RootHints,
    ) -> Self {
        Resolver {
            dispatcher,
            cache,
            validator,
            contexts: Arc::new(QueryContextStore::with_default_capacity()),
            speculative: Arc::new(SpeculativeGlue::default()),
            hints,
        }
    }

    pub fn with_hints(mut self, hints: RootHints) -> Self {
        self.hints = hints;
        self
    }

    pub fn cache(&self) -> &Arc<dyn DnsCache> {
        &self.cache
    }

    /// Resolves the question iteratively and returns the final
    /// datagram. Failures representable as DNS responses come back as
    /// `Ok` SERVFAILs carrying extended error codes; DNSSEC validation
    /// failures, cancellation, and configuration errors are raised.
    #[instrument(skip_all, fields(otel.kind = "server", otel.status_code = Empty, otel.status_message = Empty, %question))]
    pub async fn resolve(
        &self,
        question: Question,
        options: &ResolverOptions,
        cancel: &CancelToken,
    ) -> Result<Message, ResolveError> {
        let result = self.resolve_inner(question, options, cancel).await;
        if let Err(e) = &result {
            let span = tracing::Span::current();
            span.record("otel.status_code", "Error");
            span.record("otel.status_message", e.to_string());
        }
        result
    }

    async fn resolve_inner(
        &self,
        question: Question,
        options: &ResolverOptions,
        cancel: &CancelToken,
    ) -> Result<Message, ResolveError> {
        options.validate()?;
        let caller_question = question.clone();
        let anchors =
            if options.dnssec_validation { Some(self.hints.root_trust_anchors()) } else { None };
        let head = Frame::new(question, None, options.dnssec_validation, anchors)?;
        let (id, _guard) = self.register_context(&head.question)?;
        let limits = ContextLimits {
            max_stack_depth: options.max_stack_count,
            max_total_frames: options.max_total_frames,
        };
        let mut ctx = QueryContext::new(id, head, limits);
        let controller = DnssecValidationController::new(self.validator.clone());

        loop {
            if cancel.is_cancelled() {
                return Err(ResolveError::Cancelled);
            }

            if let Some(answer) = self.cache_stage(&mut ctx, options, &caller_question).await? {
                return Ok(answer);
            }

            let head = ctx.head_mut();
            if head.name_servers.is_empty() {
                if head.hop_count >= options.max_hops {
                    return Ok(self.hop_limit_failure(&caller_question, options).await);
                }
                debug!(question = %head.question, "priming with root hints");
                head.name_servers = self.hints.get_shuffled(options.prefer_ipv6);
                head.set_zone_cut(Name::root());
                if options.qname_minimization {
                    head.question.set_zone_cut(Some(Name::root()));
                }
                head.name_server_index = 0;
                head.hop_count += 1;
            }

            if let Some(ds_frame) = self.ds_prerequisite(ctx.head())? {
                if let Some(answer) =
                    self.push_frame(&mut ctx, ds_frame, options, &caller_question).await?
                {
                    return Ok(answer);
                }
                continue;
            }

            match self.step(&mut ctx, options, cancel, &controller).await? {
                ResolverEvent::Continue => {}
                ResolverEvent::PushFrame(frame) => {
                    if let Some(answer) =
                        self.push_frame(&mut ctx, frame, options, &caller_question).await?
                    {
                        return Ok(answer);
                    }
                }
                ResolverEvent::FrameAnswered(response) => {
                    if ctx.stack_is_empty() {
                        return Ok(self.finalize(response, &caller_question, options));
                    }
                    ctx.head_mut().last_response = Some(response);
                    self.unwind(&mut ctx, options).await?;
                }
                ResolverEvent::Exhausted => {
                    if ctx.stack_is_empty() {
                        let outcome =
                            failure::synthesize(ctx.head_mut(), &*self.cache, options).await?;
                        return Ok(self.finalize(outcome, &caller_question, options));
                    }
                    match failure::synthesize(ctx.head_mut(), &*self.cache, options).await {
                        Ok(outcome) => ctx.head_mut().last_response = Some(outcome),
                        Err(ResolveError::Cancelled) => return Err(ResolveError::Cancelled),
                        Err(e) => {
                            debug!("sub-resolution failed terminally: {e}");
                            ctx.head_mut().last_response = None;
                        }
                    }
                    self.unwind(&mut ctx, options).await?;
                }
            }
        }
    }

    /// Asks the cache to answer or advance the head question. Returns
    /// the final datagram when the cache settles the whole query.
    async fn cache_stage(
        &self,
        ctx: &mut QueryContext,
        options: &ResolverOptions,
        caller_question: &Question,
    ) -> Result<Option<Message>, ResolveError> {
        let lookup = CacheLookup { find_closest_name_servers: true, ..Default::default() };
        let Some(cached) = self.cache.lookup(&ctx.head().question, lookup).await else {
            return Ok(None);
        };
        let is_referral = cached.answers().is_empty()
            && cached.response_code() == ResponseCode::NoError
            && cached.name_servers().iter().any(|r| r.record_type() == RecordType::NS);
        if !is_referral {
            debug!(question = %ctx.head().question, "cache settled the question");
            if ctx.stack_is_empty() {
                return Ok(Some(self.finalize(cached, caller_question, options)));
            }
            ctx.head_mut().last_response = Some(cached);
            self.unwind(ctx, options).await?;
            return Ok(None);
        }

        let head = ctx.head_mut();
        let advances = head.name_servers.is_empty()
            || match (&head.zone_cut, referral_cut(&cached)) {
                (Some(current), Some(new_cut)) => new_cut.num_labels() > current.num_labels(),
                (None, Some(_)) => true,
                _ => false,
            };
        if !advances {
            return Ok(None);
        }
        if head.hop_count >= options.max_hops {
            return Ok(Some(self.hop_limit_failure(caller_question, options).await));
        }
        let outcome =
            commit_transition(head, &cached, &*self.cache, options, &self.speculative).await;
        if outcome.committed {
            self.spawn_speculative(outcome.speculative, options);
        }
        Ok(None)
    }

    /// A validating walk may still carry DS records for a zone above
    /// the current cut; the cut's own DS set must be fetched before
    /// its servers are queried.
    fn ds_prerequisite(&self, head: &Frame) -> Result<Option<Frame>, ResolveError> {
        if !head.dnssec_validation {
            return Ok(None);
        }
        let Some(ds_records) = &head.last_ds_records else {
            return Ok(None);
        };
        let Some(owner) = ds_records.first().map(|record| record.name()) else {
            return Ok(None);
        };
        let Some(cut) = &head.zone_cut else {
            return Ok(None);
        };
        if owner == cut {
            return Ok(None);
        }
        debug!(%owner, %cut, "inserting DS prerequisite lookup");
        let question = Question::new(cut.clone(), RecordType::DS);
        let mut child = Frame::new(
            question,
            Some(cut.clone()),
            head.dnssec_validation,
            head.last_ds_records.clone(),
        )?;
        child.hop_count = head.hop_count;
        Ok(Some(child))
    }

    /// One pipeline step: select servers, query them, sanitize,
    /// validate and classify the response, and apply the resulting
    /// transition.
    async fn step(
        &self,
        ctx: &mut QueryContext,
        options: &ResolverOptions,
        cancel: &CancelToken,
        controller: &DnssecValidationController,
    ) -> Result<ResolverEvent, ResolveError> {
        let stack_empty = ctx.stack_is_empty();
        let head = ctx.head_mut();
        let selection = {
            let mut iterator = NameServerIterator::new(head);
            iterator.select_next_batch()
        };
        let Some(selection) = selection else {
            return Ok(ResolverEvent::Exhausted);
        };
        match selection {
            ServerSelection::NeedsGlue(server) => {
                if let Some(addr) =
                    cached_glue_address(&*self.cache, &server.host, options.prefer_ipv6).await
                {
                    let index = head.name_server_index;
                    if let Some(entry) = head.name_servers.get_mut(index) {
                        *entry = entry.with_endpoint(addr);
                    }
                    return Ok(ResolverEvent::Continue);
                }
                // a frame must not glue-resolve its own question
                if head.question.name == server.host
                    && matches!(head.question.record_type, RecordType::A | RecordType::AAAA)
                {
                    debug!(host = %server.host, "skipping self-referential glue");
                    NameServerIterator::new(head).move_next();
                    return Ok(ResolverEvent::Continue);
                }
                let child = glue::prepare_glue_frame(head, &server, options)?;
                Ok(ResolverEvent::PushFrame(child))
            }
            ServerSelection::Batch(batch) => {
                let request = DispatchRequest {
                    question: head.question.clone(),
                    randomize_name: options.randomize_name,
                    dnssec: options.dnssec_validation,
                    udp_payload_size: options.udp_payload_size,
                    client_subnet: options.edns_client_subnet.clone(),
                    retries: options.retries,
                    timeout: options.timeout,
                };
                let result = self.race(batch, &request, options, cancel).await;
                NameServerIterator::new(head).move_next();
                let response = match result {
                    Err(ResolveError::Cancelled) => return Err(ResolveError::Cancelled),
                    Err(e) => {
                        debug!(question = %head.question, "server batch failed: {e}");
                        head.last_error = Some(e);
                        return Ok(ResolverEvent::Continue);
                    }
                    Ok(response) => response,
                };

                let qname = head.question.effective_name().clone();
                let qtype = head.question.effective_type();
                let response = sanitize(response, &qname, qtype, head.zone_cut.as_ref());
                let response = controller.apply(head, response, options.dnssec_validation).await;
                let response = if options.dnssec_validation {
                    prune_indeterminate(response)
                } else {
                    response
                };
                // only the validated, pruned shape may survive as the
                // frame's last response; an earlier snapshot could hand
                // an unvalidated answer to the failure synthesizer
                head.last_response = Some(response.clone());

                let decision = classify(&response, &head.question, stack_empty);
                debug!(question = %head.question, ?decision, "classified response");
                if matches!(
                    decision,
                    ResolverDecision::ReturnAnswer
                        | ResolverDecision::UnwindStack
                        | ResolverDecision::DelegationTransition
                ) {
                    self.cache.store(&response, false).await;
                }
                match decision {
                    ResolverDecision::ReturnAnswer | ResolverDecision::UnwindStack => {
                        Ok(ResolverEvent::FrameAnswered(response))
                    }
                    ResolverDecision::DelegationTransition => {
                        if head.hop_count >= options.max_hops {
                            let question = head.question.clone();
                            let terminal = self.hop_limit_failure(&question, options).await;
                            return Ok(ResolverEvent::FrameAnswered(terminal));
                        }
                        let outcome = commit_transition(
                            head,
                            &response,
                            &*self.cache,
                            options,
                            &self.speculative,
                        )
                        .await;
                        if outcome.committed {
                            self.spawn_speculative(outcome.speculative, options);
                        }
                        Ok(ResolverEvent::Continue)
                    }
                    ResolverDecision::RetryWithQNameMinimization => {
                        qmin::apply_fallback(head);
                        Ok(ResolverEvent::Continue)
                    }
                    ResolverDecision::ContinueNextServer => Ok(ResolverEvent::Continue),
                }
            }
        }
    }

    /// Races the batch against up to `concurrency` servers at a time;
    /// the first successful response wins and the rest are dropped.
    async fn race(
        &self,
        batch: Vec<NameServerAddress>,
        request: &DispatchRequest,
        options: &ResolverOptions,
        cancel: &CancelToken,
    ) -> Result<Message, ResolveError> {
        let mut pending = batch.into_iter().filter_map(|server| server.endpoint);
        let mut in_flight = FuturesUnordered::new();
        let mut last_error = ResolveError::NoResponse;
        loop {
            while in_flight.len() < options.concurrency {
                match pending.next() {
                    Some(endpoint) => in_flight
                        .push(async move { self.dispatcher.query(endpoint, request, cancel).await }),
                    None => break,
                }
            }
            match in_flight.next().await {
                None => return Err(last_error),
                Some(Ok(response)) => return Ok(response),
                Some(Err(ResolveError::Cancelled)) => return Err(ResolveError::Cancelled),
                Some(Err(e)) => last_error = e,
            }
        }
    }

    /// Pops the finished child and applies its outcome to the parent:
    /// a glue child installs the endpoint (or skips the server), a DS
    /// child updates the chain of trust (or fails validation).
    async fn unwind(
        &self,
        ctx: &mut QueryContext,
        options: &ResolverOptions,
    ) -> Result<(), ResolveError> {
        let popped = ctx
            .pop()
            .ok_or_else(|| ResolveError::ServFail("unwind with an empty stack".to_string()))?;
        let parent = ctx.head_mut();
        match popped.question.record_type {
            RecordType::DS => {
                let mut settled = false;
                if let Some(response) = &popped.last_response {
                    let ds: Vec<_> = response
                        .answers()
                        .iter()
                        .filter(|r| r.record_type() == RecordType::DS)
                        .cloned()
                        .collect();
                    if !ds.is_empty() {
                        debug!(cut = %popped.question.name, "DS prerequisite resolved");
                        parent.last_ds_records = Some(ds);
                        settled = true;
                    } else if matches!(
                        response.response_code(),
                        ResponseCode::NoError | ResponseCode::NXDomain
                    ) {
                        debug!(cut = %popped.question.name, "no DS records, continuing insecure");
                        parent.dnssec_validation = false;
                        parent.last_ds_records = None;
                        settled = true;
                    }
                }
                if !settled {
                    let detail =
                        format!("failed to resolve DS records for {}", popped.question.name);
                    parent.last_error = Some(ResolveError::DnssecValidation(detail.clone()));
                    return match failure::synthesize(parent, &*self.cache, options).await {
                        Ok(_response) => Err(ResolveError::DnssecValidation(detail)),
                        Err(e) => Err(e),
                    };
                }
                Ok(())
            }
            _ => {
                let addr = popped.last_response.as_ref().and_then(|response| {
                    response
                        .answers()
                        .iter()
                        .filter_map(referral::record_ip)
                        .find(|addr| !addr.is_loopback())
                });
                let index = parent.name_server_index;
                match addr {
                    Some(addr) => {
                        let installed = match parent.name_servers.get_mut(index) {
                            Some(entry) if entry.host == popped.question.name => {
                                *entry = entry.with_endpoint(addr);
                                true
                            }
                            _ => false,
                        };
                        if !installed {
                            parent.name_server_index = index + 1;
                        }
                    }
                    None => {
                        debug!(host = %popped.question.name, "glue lookup failed, skipping server");
                        parent.name_server_index = index + 1;
                    }
                }
                Ok(())
            }
        }
    }

    /// Installs a pushed frame, or converts a stack breach into the
    /// cached terminal SERVFAIL.
    async fn push_frame(
        &self,
        ctx: &mut QueryContext,
        frame: Frame,
        options: &ResolverOptions,
        caller_question: &Question,
    ) -> Result<Option<Message>, ResolveError> {
        match ctx.push(frame) {
            Ok(()) => Ok(None),
            Err(ResolveError::StackLimitExceeded(_)) => {
                let servfail = failure::synthesize_servfail(
                    caller_question,
                    ExtendedErrorCode::NoReachableAuthority,
                    &format!("Recursion stack limit reached for {caller_question}"),
                    options,
                );
                self.cache.store(&servfail, false).await;
                Ok(Some(self.finalize(servfail, caller_question, options)))
            }
            Err(e) => Err(e),
        }
    }

    async fn hop_limit_failure(&self, question: &Question, options: &ResolverOptions) -> Message {
        let servfail = failure::synthesize_servfail(
            question,
            ExtendedErrorCode::NoReachableAuthority,
            &format!("Delegation hop limit ({}) reached for {question}", options.max_hops),
            options,
        );
        self.cache.store(&servfail, false).await;
        self.finalize(servfail, question, options)
    }

    /// Reshapes a terminal response for the caller: the question
    /// section becomes the caller's full question and the minimal
    /// trim applies when configured.
    fn finalize(
        &self,
        mut response: Message,
        question: &Question,
        options: &ResolverOptions,
    ) -> Message {
        response.set_message_type(MessageType::Response);
        response.set_op_code(OpCode::Query);
        response.take_queries();
        response.add_query(question.to_query());
        if options.minimal_response {
            failure::trim_minimal(response)
        } else {
            response
        }
    }

    fn register_context(&self, question: &Question) -> Result<(u16, StoreGuard), ResolveError> {
        let mut last = ResolveError::ServFail("could not allocate a query id".to_string());
        for _attempt in 0..8 {
            let id: u16 = rand::random();
            match self.contexts.register(id, question) {
                Ok(guard) => return Ok((id, guard)),
                Err(e) => last = e,
            }
        }
        Err(last)
    }

    /// Kicks off background address lookups for unresolved servers of
    /// a freshly committed delegation. Results only ever land in the
    /// shared cache.
    fn spawn_speculative(&self, hosts: Vec<Name>, options: &ResolverOptions) {
        if hosts.is_empty() {
            return;
        }
        let record_type = if options.prefer_ipv6 { RecordType::AAAA } else { RecordType::A };
        let mut background_options = options.clone();
        background_options.async_ns_resolution = false;
        background_options.dnssec_validation = false;
        for host in hosts {
            let background = self.clone();
            let background_options = background_options.clone();
            let task: Pin<Box<dyn Future<Output = ()> + Send>> = Box::pin(async move {
                let question = Question::new(host.clone(), record_type);
                if let Err(e) = background
                    .resolve(question, &background_options, &CancelToken::never())
                    .await
                {
                    debug!(%host, "speculative glue lookup failed: {e}");
                }
                background.speculative.complete(&host);
            });
            tokio::spawn(task);
        }
    }
}

async fn cached_glue_address(
    cache: &dyn DnsCache,
    host: &Name,
    prefer_ipv6: bool,
) -> Option<std::net::IpAddr> {
    let record_type = if prefer_ipv6 { RecordType::AAAA } else { RecordType::A };
    let question = Question::new(host.clone(), record_type);
    let response = cache.lookup(&question, CacheLookup::default()).await?;
    response
        .answers()
        .iter()
        .filter_map(referral::record_ip)
        .find(|addr| !addr.is_loopback())
}

fn referral_cut(response: &Message) -> Option<Name> {
    response
        .name_servers()
        .iter()
        .find(|record| record.record_type() == RecordType::NS)
        .map(|record| record.name().to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::Resolver;
    use crate::cache::{CacheLookup, DnsCache, LruDnsCache};
    use crate::cancel::{CancelSource, CancelToken};
    use crate::dnssec::PresenceValidator;
    use crate::errors::ResolveError;
    use crate::failure::{extended_error, ExtendedErrorCode};
    use crate::fake_dispatcher::FakeDispatcher;
    use crate::hints::RootHints;
    use crate::iterator::NameServerAddress;
    use crate::options::ResolverOptions;
    use crate::question::Question;
    use crate::{a, answer, ds, ns, nsec, refer, soa};
    use anyhow::Result;
    use hickory_proto::op::{Header, Message, ResponseCode};
    use hickory_proto::dnssec::rdata::{DNSSECRData, DS, NSEC};
    use hickory_proto::dnssec::{Algorithm, DigestType};
    use hickory_proto::rr::{rdata, Name, RData, Record, RecordType};
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tracing::Level;
    use tracing_subscriber::FmtSubscriber;

    #[ctor::ctor]
    fn init() {
        let subscriber = FmtSubscriber::builder().with_max_level(Level::DEBUG).finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }

    fn hints(root: &str) -> Result<RootHints> {
        Ok(RootHints::fixed(vec![NameServerAddress::resolved(
            Name::from_str("root.invalid.")?,
            root.parse()?,
        )]))
    }

    fn resolver(
        fake: FakeDispatcher,
        root: &str,
    ) -> Result<(Resolver, Arc<LruDnsCache>, Arc<AtomicUsize>)> {
        let counter = fake.query_counter();
        let cache = Arc::new(LruDnsCache::default());
        let resolver = Resolver::with_parts(
            Arc::new(fake),
            cache.clone(),
            Arc::new(PresenceValidator),
            hints(root)?,
        );
        Ok((resolver, cache, counter))
    }

    fn plain_options() -> ResolverOptions {
        ResolverOptions { qname_minimization: false, ..Default::default() }
    }

    fn question(name: &str) -> Result<Question> {
        Ok(Question::new(Name::from_str(name)?, RecordType::A))
    }

    #[tokio::test]
    async fn test_pure_cache_hit_uses_no_transport() -> Result<()> {
        let (resolver, cache, counter) = resolver(FakeDispatcher::new(), "10.0.0.1")?;
        let mut seeded = Message::new();
        seeded.add_query(question("example.com.")?.to_query());
        seeded.add_answer(a!("example.com.", "93.184.216.34"));
        cache.store(&seeded, false).await;

        let response = resolver
            .resolve(question("example.com.")?, &plain_options(), &CancelToken::never())
            .await?;
        assert_eq!(1, response.answers().len());
        assert_eq!(&Name::from_str("example.com.")?, response.answers()[0].name());
        assert_eq!(0, counter.load(Ordering::SeqCst));
        Ok(())
    }

    #[tokio::test]
    async fn test_two_step_iterative_walk() -> Result<()> {
        let mut fake = FakeDispatcher::new();
        fake.add(
            "10.0.0.1",
            "foo.test.",
            RecordType::A,
            refer!(ns!("test.", "ns.test."), a!("ns.test.", "10.0.0.2")),
        )?;
        fake.add("10.0.0.2", "foo.test.", RecordType::A, answer!(a!("foo.test.", "192.0.2.42")))?;
        let (resolver, _cache, counter) = resolver(fake, "10.0.0.1")?;

        let response = resolver
            .resolve(question("foo.test.")?, &plain_options(), &CancelToken::never())
            .await?;
        assert_eq!(1, response.answers().len());
        let record = &response.answers()[0];
        assert_eq!(&Name::from_str("foo.test.")?, record.name());
        if let Some(RData::A(addr)) = record.data() {
            assert_eq!(addr.0, "192.0.2.42".parse::<std::net::Ipv4Addr>()?);
        } else {
            panic!("expected an A record in the answer");
        }
        // the question section is the caller's question
        assert_eq!(&Name::from_str("foo.test.")?, response.queries()[0].name());
        assert_eq!(2, counter.load(Ordering::SeqCst));
        Ok(())
    }

    #[tokio::test]
    async fn test_nxdomain_is_terminal() -> Result<()> {
        let mut fake = FakeDispatcher::new();
        let mut nx = Message::new();
        nx.set_response_code(ResponseCode::NXDomain);
        nx.insert_name_servers(vec![soa!("test.")]);
        fake.add("10.0.0.1", "gone.test.", RecordType::A, nx)?;
        let (resolver, _cache, counter) = resolver(fake, "10.0.0.1")?;

        let response = resolver
            .resolve(question("gone.test.")?, &plain_options(), &CancelToken::never())
            .await?;
        assert_eq!(ResponseCode::NXDomain, response.response_code());
        assert_eq!(1, counter.load(Ordering::SeqCst));
        Ok(())
    }

    #[tokio::test]
    async fn test_glue_resolution_via_child_frame() -> Result<()> {
        let mut fake = FakeDispatcher::new();
        // referral without glue forces a glue sub-resolution
        fake.add("10.0.0.1", "foo.test.", RecordType::A, refer!(ns!("test.", "ns1.example.")))?;
        fake.add(
            "10.0.0.1",
            "ns1.example.",
            RecordType::A,
            answer!(a!("ns1.example.", "10.0.0.2")),
        )?;
        fake.add("10.0.0.2", "foo.test.", RecordType::A, answer!(a!("foo.test.", "192.0.2.10")))?;
        let (resolver, cache, _counter) = resolver(fake, "10.0.0.1")?;

        let response = resolver
            .resolve(question("foo.test.")?, &plain_options(), &CancelToken::never())
            .await?;
        assert_eq!(1, response.answers().len());
        // the glue answer went through the shared cache
        let glue_question = question("ns1.example.")?;
        assert!(cache.lookup(&glue_question, CacheLookup::default()).await.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_qname_minimization_walk() -> Result<()> {
        let mut fake = FakeDispatcher::new();
        fake.add(
            "10.0.0.1",
            "test.",
            RecordType::NS,
            refer!(ns!("test.", "ns.test."), a!("ns.test.", "10.0.0.2")),
        )?;
        // the minimized probe at the full name comes back empty
        let mut nodata = Message::new();
        nodata.insert_name_servers(vec![soa!("test.")]);
        fake.add("10.0.0.2", "foo.test.", RecordType::NS, nodata)?;
        fake.add("10.0.0.2", "foo.test.", RecordType::A, answer!(a!("foo.test.", "192.0.2.7")))?;
        let (resolver, _cache, _counter) = resolver(fake, "10.0.0.1")?;

        let options = ResolverOptions::default();
        let response =
            resolver.resolve(question("foo.test.")?, &options, &CancelToken::never()).await?;
        assert_eq!(1, response.answers().len());
        // the caller's full question survives minimization
        assert_eq!(&Name::from_str("foo.test.")?, response.queries()[0].name());
        assert_eq!(RecordType::A, response.queries()[0].query_type());
        Ok(())
    }

    #[tokio::test]
    async fn test_stack_limit_returns_cached_servfail() -> Result<()> {
        let mut fake = FakeDispatcher::new();
        // every referral names a glueless server in yet another zone,
        // so each glue lookup needs a frame of its own
        fake.add("10.0.0.1", "a.loop.", RecordType::A, refer!(ns!("loop.", "ns.gluehost.")))?;
        fake.add(
            "10.0.0.1",
            "ns.gluehost.",
            RecordType::A,
            refer!(ns!("gluehost.", "ns.other.")),
        )?;
        let (resolver, cache, _counter) = resolver(fake, "10.0.0.1")?;

        let options = ResolverOptions { max_stack_count: 1, ..plain_options() };
        let response =
            resolver.resolve(question("a.loop.")?, &options, &CancelToken::never()).await?;
        assert_eq!(ResponseCode::ServFail, response.response_code());
        let (code, text) = extended_error(&response).expect("extended error expected");
        assert_eq!(ExtendedErrorCode::NoReachableAuthority as u16, code);
        assert!(text.contains("Recursion stack limit reached"));
        // the failure is cached under the caller's question
        assert!(cache.lookup(&question("a.loop.")?, CacheLookup::default()).await.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_unsigned_referral_downgrades_to_insecure() -> Result<()> {
        let mut fake = FakeDispatcher::new();
        fake.add(
            "10.0.0.1",
            "foo.test.",
            RecordType::A,
            refer!(ns!("test.", "ns.test."), a!("ns.test.", "10.0.0.2")),
        )?;
        fake.add("10.0.0.2", "foo.test.", RecordType::A, answer!(a!("foo.test.", "192.0.2.9")))?;
        let (resolver, _cache, _counter) = resolver(fake, "10.0.0.1")?;

        let options = ResolverOptions { dnssec_validation: true, ..plain_options() };
        let response =
            resolver.resolve(question("foo.test.")?, &options, &CancelToken::never()).await?;
        assert_eq!(1, response.answers().len());
        assert_eq!(ResponseCode::NoError, response.response_code());
        Ok(())
    }

    #[tokio::test]
    async fn test_forged_answer_below_signed_cut_never_reaches_caller() -> Result<()> {
        let mut fake = FakeDispatcher::new();
        // a secure delegation establishes the DS chain for test.
        let mut referral = Message::new();
        referral.insert_name_servers(vec![ns!("test.", "ns.test."), ds!("test.", 4711)]);
        referral.insert_additionals(vec![a!("ns.test.", "10.0.0.2")]);
        fake.add("10.0.0.1", "foo.test.", RecordType::A, referral)?;
        // the zone then answers with a bare unsigned record
        fake.add(
            "10.0.0.2",
            "foo.test.",
            RecordType::A,
            answer!(a!("foo.test.", "203.0.113.66")),
        )?;
        let (resolver, cache, _counter) = resolver(fake, "10.0.0.1")?;

        let options = ResolverOptions { dnssec_validation: true, ..plain_options() };
        let result =
            resolver.resolve(question("foo.test.")?, &options, &CancelToken::never()).await;
        assert!(matches!(result, Err(ResolveError::DnssecValidation(_))));
        // the offending response is cached as DNSSEC-bad, not served
        let cached = cache
            .lookup(&question("foo.test.")?, CacheLookup::default())
            .await
            .expect("the bad outcome should be cached");
        assert!(cached.answers().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_bogus_delegation_raises_after_exhaustion() -> Result<()> {
        let mut fake = FakeDispatcher::new();
        // a delegation that looks signed but proves nothing: neither DS
        // nor denial alongside the NS set
        let mut bogus = Message::new();
        bogus.insert_name_servers(vec![ns!("test.", "ns.test."), rrsig_ns()?]);
        fake.add("10.0.0.1", "foo.test.", RecordType::A, bogus)?;
        let (resolver, cache, _counter) = resolver(fake, "10.0.0.1")?;

        let options = ResolverOptions { dnssec_validation: true, ..plain_options() };
        let result =
            resolver.resolve(question("foo.test.")?, &options, &CancelToken::never()).await;
        assert!(matches!(result, Err(ResolveError::DnssecValidation(_))));
        // the offending response is cached so the walk is not repeated
        assert!(cache.lookup(&question("foo.test.")?, CacheLookup::default()).await.is_some());
        Ok(())
    }

    fn rrsig_ns() -> Result<Record> {
        use hickory_proto::dnssec::rdata::{DNSSECRData, RRSIG};
        use hickory_proto::dnssec::Algorithm;
        Ok(Record::from_rdata(
            Name::from_str("test.")?,
            300,
            RData::DNSSEC(DNSSECRData::RRSIG(RRSIG::new(
                RecordType::NS,
                Algorithm::RSASHA256,
                2,
                300,
                0,
                0,
                12345,
                Name::from_str("test.")?,
                vec![0u8; 64],
            ))),
        ))
    }

    #[tokio::test]
    async fn test_ds_prerequisite_resolved_through_child_frame() -> Result<()> {
        let mut fake = FakeDispatcher::new();
        // the DS probe goes to the parent zone and gets a NODATA with
        // denial proof: provably no DS, continue insecure
        let mut nodata = Message::new();
        nodata.insert_name_servers(vec![soa!("test."), nsec!("test.")]);
        fake.add("10.0.0.1", "test.", RecordType::DS, nodata)?;
        fake.add("10.0.0.2", "foo.test.", RecordType::A, answer!(a!("foo.test.", "192.0.2.9")))?;
        let (resolver, cache, _counter) = resolver(fake, "10.0.0.1")?;

        // a cached referral seeds the walk below the root, leaving the
        // trust anchors behind the zone cut
        let mut referral = Message::new();
        referral.add_query(question("foo.test.")?.to_query());
        referral.insert_name_servers(vec![ns!("test.", "ns.test.")]);
        referral.insert_additionals(vec![a!("ns.test.", "10.0.0.2")]);
        cache.store(&referral, false).await;

        let options = ResolverOptions { dnssec_validation: true, ..plain_options() };
        let response =
            resolver.resolve(question("foo.test.")?, &options, &CancelToken::never()).await?;
        assert_eq!(1, response.answers().len());
        assert_eq!(ResponseCode::NoError, response.response_code());
        Ok(())
    }

    #[tokio::test]
    async fn test_exhausted_servers_synthesize_servfail() -> Result<()> {
        // the fake knows no answers at all, so every query fails
        let (resolver, _cache, _counter) = resolver(FakeDispatcher::new(), "10.0.0.1")?;
        let response = resolver
            .resolve(question("foo.test.")?, &plain_options(), &CancelToken::never())
            .await?;
        assert_eq!(ResponseCode::ServFail, response.response_code());
        let (code, _text) = extended_error(&response).expect("extended error expected");
        assert_eq!(ExtendedErrorCode::NoReachableAuthority as u16, code);
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_is_served_from_cache_afterwards() -> Result<()> {
        let (resolver, _cache, counter) = resolver(FakeDispatcher::new(), "10.0.0.1")?;
        let options = plain_options();
        resolver.resolve(question("foo.test.")?, &options, &CancelToken::never()).await?;
        let after_first = counter.load(Ordering::SeqCst);

        let response =
            resolver.resolve(question("foo.test.")?, &options, &CancelToken::never()).await?;
        assert_eq!(ResponseCode::ServFail, response.response_code());
        assert_eq!(after_first, counter.load(Ordering::SeqCst));
        Ok(())
    }

    #[tokio::test]
    async fn test_cancellation_preempts_resolution() -> Result<()> {
        let (resolver, _cache, _counter) = resolver(FakeDispatcher::new(), "10.0.0.1")?;
        let (source, token) = CancelSource::new();
        source.cancel();
        let result = resolver.resolve(question("foo.test.")?, &plain_options(), &token).await;
        assert!(matches!(result, Err(ResolveError::Cancelled)));
        Ok(())
    }

    #[tokio::test]
    async fn test_configuration_error_is_synchronous() -> Result<()> {
        let (resolver, _cache, _counter) = resolver(FakeDispatcher::new(), "10.0.0.1")?;
        let options = ResolverOptions {
            dnssec_validation: true,
            udp_payload_size: 500,
            ..Default::default()
        };
        let result =
            resolver.resolve(question("foo.test.")?, &options, &CancelToken::never()).await;
        assert!(matches!(result, Err(ResolveError::Configuration(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_case_insensitive_walk() -> Result<()> {
        let mut fake = FakeDispatcher::new();
        fake.add(
            "10.0.0.1",
            "foo.test.",
            RecordType::A,
            refer!(ns!("test.", "ns.test."), a!("ns.test.", "10.0.0.2")),
        )?;
        fake.add("10.0.0.2", "foo.test.", RecordType::A, answer!(a!("foo.test.", "192.0.2.42")))?;
        let (resolver, _cache, _counter) = resolver(fake, "10.0.0.1")?;

        let response = resolver
            .resolve(question("FOO.Test.")?, &plain_options(), &CancelToken::never())
            .await?;
        assert_eq!(1, response.answers().len());
        Ok(())
    }
}
