use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use hickory_proto::op::{Message, Query};
use hickory_proto::rr::{Name, RecordType};

use crate::cancel::CancelToken;
use crate::errors::ResolveError;
use crate::transport::{DispatchRequest, Dispatcher};

/// A scripted transport for tests: responses keyed by target address
/// and wire question. Unknown queries fail like a dead server.
pub struct FakeDispatcher {
    answers: HashMap<QueryKey, Message>,
    queries: Arc<AtomicUsize>,
}

impl Debug for FakeDispatcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeDispatcher").field("answer_count", &self.answers.len()).finish()
    }
}

#[derive(PartialEq, Eq, Hash)]
struct QueryKey {
    target: IpAddr,
    name: Name,
    record_type: RecordType,
}

impl FakeDispatcher {
    pub fn new() -> Self {
        FakeDispatcher { answers: HashMap::new(), queries: Arc::new(AtomicUsize::new(0)) }
    }

    pub fn add(
        &mut self,
        ip: &str,
        name: &str,
        record_type: RecordType,
        message: Message,
    ) -> Result<()> {
        let key = QueryKey {
            target: ip.parse()?,
            name: name.parse::<Name>()?.to_lowercase(),
            record_type,
        };
        self.answers.insert(key, message);
        Ok(())
    }

    /// Shared counter of queries the resolver actually dispatched.
    pub fn query_counter(&self) -> Arc<AtomicUsize> {
        self.queries.clone()
    }
}

#[async_trait]
impl Dispatcher for FakeDispatcher {
    async fn query(
        &self,
        endpoint: SocketAddr,
        request: &DispatchRequest,
        _cancel: &CancelToken,
    ) -> Result<Message, ResolveError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let key = QueryKey {
            target: endpoint.ip(),
            name: request.question.effective_name().to_lowercase(),
            record_type: request.question.effective_type(),
        };
        match self.answers.get(&key) {
            Some(message) => {
                let mut message = message.clone();
                // echo the wire question like a real server would
                message.take_queries();
                let mut query = Query::new();
                query
                    .set_name(request.question.effective_name().clone())
                    .set_query_type(request.question.effective_type())
                    .set_query_class(request.question.query_class);
                message.add_query(query);
                Ok(message)
            }
            None => Err(ResolveError::NoResponse),
        }
    }
}
