use super::classify::{classify, Routed};
use super::record::{EvalRecord, EvalStatus};
use crate::config::ConnectionConfig;
use crate::error::{ReplError, Result};
use crate::events::{EvalEvent, EvalEventKind};
use crate::protocol::{Request, Response};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, warn};

/// A record removed by [`EvalRegistry::discard`].
#[derive(Debug)]
pub struct Discarded {
    pub record: EvalRecord,
    /// Interrupt to send when the eval was still running under a session.
    pub interrupt: Option<Request>,
}

/// What [`EvalRegistry::mark_interrupted`] found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterruptState {
    /// Still running; the interrupt goes to `session` when it is known.
    Running { session: Option<String> },
    /// The outcome is already in, so there is nothing to interrupt.
    Finished,
}

/// In-flight evaluations keyed by request id.
///
/// Shared between the caller and the reader task. Ids are handed out from an
/// atomic counter; the map sits behind a mutex that is never held across an
/// await.
#[derive(Debug)]
pub struct EvalRegistry {
    next_id: AtomicU64,
    records: Mutex<HashMap<u64, EvalRecord>>,
}

impl Default for EvalRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EvalRegistry {
    pub fn new() -> Self {
        Self::starting_at(ConnectionConfig::FIRST_EVAL_ID)
    }

    /// Registry whose first id is `first`.
    pub fn starting_at(first: u64) -> Self {
        Self {
            next_id: AtomicU64::new(first),
            records: Mutex::new(HashMap::new()),
        }
    }

    /// A fresh, strictly increasing id.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register(&self, record: EvalRecord) -> Result<()> {
        let mut records = self.records.lock().expect("eval registry lock poisoned");
        if records.contains_key(&record.id) {
            return Err(ReplError::DuplicateEval { id: record.id });
        }
        debug!("Registered eval {} ({:?})", record.id, record.kind);
        records.insert(record.id, record);
        Ok(())
    }

    pub fn lookup(&self, id: u64) -> Option<EvalRecord> {
        let records = self.records.lock().expect("eval registry lock poisoned");
        records.get(&id).cloned()
    }

    pub fn contains(&self, id: u64) -> bool {
        let records = self.records.lock().expect("eval registry lock poisoned");
        records.contains_key(&id)
    }

    /// Remove a record. A still-pending record with a session yields the
    /// interrupt request the caller must send.
    pub fn discard(&self, id: u64) -> Option<Discarded> {
        let mut records = self.records.lock().expect("eval registry lock poisoned");
        let record = records.remove(&id)?;
        let interrupt = match (&record.status, &record.session) {
            (EvalStatus::Pending, Some(session)) => Some(Request::interrupt(id, session)),
            _ => None,
        };
        Some(Discarded { record, interrupt })
    }

    /// Mark a running eval interrupted. Returns its session, if any.
    pub fn mark_interrupted(&self, id: u64) -> Result<InterruptState> {
        let mut records = self.records.lock().expect("eval registry lock poisoned");
        let record = records
            .get_mut(&id)
            .ok_or(ReplError::UnknownEval { id })?;
        if !record.status.is_running() {
            return Ok(InterruptState::Finished);
        }
        record.status = EvalStatus::Interrupted;
        Ok(InterruptState::Running {
            session: record.session.clone(),
        })
    }

    /// Ids of records still waiting on the server, in id order.
    pub fn pending_ids(&self) -> Vec<u64> {
        let records = self.records.lock().expect("eval registry lock poisoned");
        let mut ids: Vec<u64> = records
            .values()
            .filter(|r| r.status == EvalStatus::Pending)
            .map(|r| r.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Ids of records that have not finished, interrupted ones included.
    pub fn running_ids(&self) -> Vec<u64> {
        let records = self.records.lock().expect("eval registry lock poisoned");
        let mut ids: Vec<u64> = records
            .values()
            .filter(|r| r.status.is_running())
            .map(|r| r.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn has_pending(&self) -> bool {
        let records = self.records.lock().expect("eval registry lock poisoned");
        records.values().any(|r| r.status == EvalStatus::Pending)
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("eval registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every record without interrupts. Used when the connection is gone.
    pub fn clear(&self) -> usize {
        let mut records = self.records.lock().expect("eval registry lock poisoned");
        let count = records.len();
        records.clear();
        count
    }

    /// Drop records that already have an outcome. Returns their ids.
    pub fn clear_finished(&self) -> Vec<u64> {
        let mut records = self.records.lock().expect("eval registry lock poisoned");
        let mut finished: Vec<u64> = records
            .values()
            .filter(|r| r.status.has_outcome())
            .map(|r| r.id)
            .collect();
        finished.sort_unstable();
        for id in &finished {
            records.remove(id);
        }
        finished
    }

    /// Apply one response to the record it belongs to and return the events
    /// to publish. Responses for unknown ids are ignored.
    pub fn route(&self, resp: &Response, namespace: &str) -> Vec<EvalEvent> {
        let Some(id) = resp.id() else {
            return Vec::new();
        };
        let mut records = self.records.lock().expect("eval registry lock poisoned");
        let Some(record) = records.get_mut(&id) else {
            debug!("Ignoring response for unknown eval {}", id);
            return Vec::new();
        };

        let mut events = Vec::new();
        match classify(resp, record, namespace) {
            Routed::NewSession(session) => {
                debug!("Eval {} runs in session {}", id, session);
                record.session = Some(session);
            }
            Routed::Value { value, elapsed } => {
                record.status = EvalStatus::Succeeded;
                record.value = Some(value.clone());
                record.elapsed = elapsed;
                events.push(EvalEvent::new(id, EvalEventKind::Succeeded { value, elapsed }));
            }
            Routed::Exception(failure) => {
                record.status = EvalStatus::Failed;
                record.failure = Some(failure.clone());
                events.push(EvalEvent::new(id, EvalEventKind::Failed(failure)));
            }
            Routed::Lookup(info) => {
                record.status = EvalStatus::LookupComplete;
                record.lookup = info.clone();
                events.push(EvalEvent::new(id, EvalEventKind::LookupComplete(info)));
            }
            Routed::DoneWithoutOutcome => {
                if record.status == EvalStatus::Pending {
                    warn!("Eval {} finished without a result", id);
                }
                records.remove(&id);
                events.push(EvalEvent::new(id, EvalEventKind::Canceled));
                return events;
            }
            Routed::Ignored => {}
        }

        let acknowledged = resp.is_done() && record.status.has_outcome();
        if acknowledged {
            records.remove(&id);
        }
        events
    }
}
