use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use hickory_proto::op::Message;
use hickory_proto::rr::{Name, Record};
use lazy_static::lazy_static;
use tracing::debug;

use crate::errors::ResolveError;
use crate::iterator::NameServerAddress;
use crate::question::Question;

/// Hard ceiling on delegation hops within a single resolution.
pub const MAX_HOPS: u32 = 64;

lazy_static! {
    // number of concurrently active queries the store will admit
    static ref STORE_CAPACITY: usize = 4096;
}

/// The per-frame resolution state: one frame per in-flight question on
/// the stack. The head frame is the question currently being worked;
/// suspended parents wait below it.
#[derive(Debug)]
pub struct Frame {
    pub question: Question,
    pub zone_cut: Option<Name>,
    pub dnssec_validation: bool,
    pub last_ds_records: Option<Vec<Record>>,
    pub name_servers: Vec<NameServerAddress>,
    pub name_server_index: usize,
    pub hop_count: u32,
    pub last_response: Option<Message>,
    pub last_error: Option<ResolveError>,
}

impl Frame {
    /// Builds a frame, refusing the DNSSEC downgrade shape: a validating
    /// frame below a zone cut with no DS records for an owner other than
    /// the cut itself has lost its chain of trust.
    pub fn new(
        question: Question,
        zone_cut: Option<Name>,
        dnssec_validation: bool,
        last_ds_records: Option<Vec<Record>>,
    ) -> Result<Frame, ResolveError> {
        if dnssec_validation && last_ds_records.is_none() {
            if let Some(cut) = &zone_cut {
                if cut != &question.name {
                    return Err(ResolveError::DnssecValidation(format!(
                        "refusing frame for {question} below {cut} without DS records"
                    )));
                }
            }
        }
        Ok(Frame {
            question,
            zone_cut: zone_cut.map(|c| c.to_lowercase()),
            dnssec_validation,
            last_ds_records,
            name_servers: Vec::new(),
            name_server_index: 0,
            hop_count: 0,
            last_response: None,
            last_error: None,
        })
    }

    pub fn set_zone_cut(&mut self, cut: Name) {
        self.zone_cut = Some(cut.to_lowercase());
    }

    /// Copies the durable parts of the frame. The last response and last
    /// error are transient query-progress state and are never cloned.
    pub fn deep_clone(&self) -> Frame {
        Frame {
            question: self.question.clone(),
            zone_cut: self.zone_cut.clone(),
            dnssec_validation: self.dnssec_validation,
            last_ds_records: self.last_ds_records.clone(),
            name_servers: self.name_servers.clone(),
            name_server_index: self.name_server_index,
            hop_count: self.hop_count,
            last_response: None,
            last_error: None,
        }
    }
}

/// Capacity bounds for one query's frame stack.
#[derive(Debug, Clone, Copy)]
pub struct ContextLimits {
    pub max_stack_depth: usize,
    pub max_total_frames: usize,
}

impl Default for ContextLimits {
    fn default() -> Self {
        ContextLimits { max_stack_depth: 32, max_total_frames: 128 }
    }
}

/// The per-query frame stack. Exactly one head frame exists at all
/// times; pushing installs a new head and suspends the old one, popping
/// restores the most recently suspended frame. Every head replacement
/// bumps the generation counter so a stale head is detectable.
#[derive(Debug)]
pub struct QueryContext {
    id: u16,
    head: Frame,
    stack: Vec<Frame>,
    head_generation: u64,
    frames_created: usize,
    limits: ContextLimits,
}

impl QueryContext {
    pub fn new(id: u16, head: Frame, limits: ContextLimits) -> Self {
        QueryContext { id, head, stack: Vec::new(), head_generation: 1, frames_created: 1, limits }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn head(&self) -> &Frame {
        &self.head
    }

    pub fn head_mut(&mut self) -> &mut Frame {
        &mut self.head
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    pub fn stack_is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn head_generation(&self) -> u64 {
        self.head_generation
    }

    /// Suspends the head and installs `frame` in its place.
    pub fn push(&mut self, frame: Frame) -> Result<(), ResolveError> {
        if self.stack.len() + 1 > self.limits.max_stack_depth
            || self.frames_created + 1 > self.limits.max_total_frames
        {
            return Err(ResolveError::StackLimitExceeded(self.head.question.to_string()));
        }
        let parent = std::mem::replace(&mut self.head, frame);
        self.stack.push(parent);
        self.head_generation += 1;
        self.frames_created += 1;
        Ok(())
    }

    /// Restores the most recently suspended frame as head and returns the
    /// frame that was head, or `None` when the stack is empty.
    pub fn pop(&mut self) -> Option<Frame> {
        let parent = self.stack.pop()?;
        let child = std::mem::replace(&mut self.head, parent);
        self.head_generation += 1;
        Some(child)
    }
}

#[derive(Debug, Clone)]
pub struct ActiveQuery {
    pub question: String,
    pub started: Instant,
}

/// Process-wide registry of live queries, keyed by query id. Insertion
/// requires uniqueness; entries are only removed when their query
/// reaches a terminal outcome (the guard drops), never evicted.
#[derive(Debug)]
pub struct QueryContextStore {
    active: Mutex<HashMap<u16, ActiveQuery>>,
    capacity: usize,
}

impl QueryContextStore {
    pub fn new(capacity: usize) -> Self {
        QueryContextStore { active: Mutex::new(HashMap::new()), capacity }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(*STORE_CAPACITY)
    }

    pub fn len(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers a query id, returning a guard that deregisters it on
    /// drop. Fails when the id is already live or the store is full.
    pub fn register(
        self: &Arc<Self>,
        id: u16,
        question: &Question,
    ) -> Result<StoreGuard, ResolveError> {
        let mut active = self.active.lock().unwrap();
        if active.len() >= self.capacity {
            return Err(ResolveError::ServFail(format!(
                "query context store is at capacity ({})",
                self.capacity
            )));
        }
        if active.contains_key(&id) {
            return Err(ResolveError::ServFail(format!("query id {id} is already active")));
        }
        active.insert(id, ActiveQuery { question: question.to_string(), started: Instant::now() });
        debug!(id, %question, "registered query context");
        Ok(StoreGuard { store: Arc::clone(self), id })
    }

    fn remove(&self, id: u16) {
        self.active.lock().unwrap().remove(&id);
    }
}

/// RAII registration of a live query id.
#[derive(Debug)]
pub struct StoreGuard {
    store: Arc<QueryContextStore>,
    id: u16,
}

impl Drop for StoreGuard {
    fn drop(&mut self) {
        self.store.remove(self.id);
    }
}
