use std::collections::{HashMap, VecDeque};

use tracing::{debug, warn};

use crate::types::{Candidate, CallId};

/// Candidates that arrived before their attempt had a remote description.
///
/// Entries for call ids no attempt owns yet (orphans) are limited in number;
/// a new orphan beyond the limit evicts the oldest one.
#[derive(Debug)]
pub struct CandidateBuffer {
    pending: HashMap<CallId, VecDeque<Candidate>>,
    capacity: usize,
    orphans: VecDeque<CallId>,
    orphan_limit: usize,
}

impl CandidateBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: HashMap::new(),
            capacity,
            orphans: VecDeque::new(),
            orphan_limit: usize::MAX,
        }
    }

    pub fn with_orphan_limit(mut self, limit: usize) -> Self {
        self.orphan_limit = limit;
        self
    }

    /// Buffer for a live attempt. Returns false when the per-call bound is
    /// reached and the candidate was dropped.
    pub fn append(&mut self, call_id: &CallId, candidate: Candidate) -> bool {
        self.orphans.retain(|id| id != call_id);
        self.push(call_id, candidate)
    }

    /// Buffer for a call id no attempt owns. Returns false when the candidate
    /// was dropped.
    pub fn append_orphan(&mut self, call_id: &CallId, candidate: Candidate) -> bool {
        if !self.orphans.contains(call_id) {
            if self.orphan_limit == 0 {
                return false;
            }
            while self.orphans.len() >= self.orphan_limit {
                let Some(evicted) = self.orphans.pop_front() else {
                    break;
                };
                debug!(
                    target = "call::candidates",
                    call_id = %evicted,
                    "evicting oldest orphan candidates"
                );
                self.pending.remove(&evicted);
            }
            self.orphans.push_back(call_id.clone());
        }
        self.push(call_id, candidate)
    }

    fn push(&mut self, call_id: &CallId, candidate: Candidate) -> bool {
        let queue = self.pending.entry(call_id.clone()).or_default();
        if queue.len() >= self.capacity {
            warn!(
                target = "call::candidates",
                call_id = %call_id,
                capacity = self.capacity,
                "candidate buffer full; dropping candidate"
            );
            return false;
        }
        queue.push_back(candidate);
        true
    }

    /// Arrival order, after which the entry is gone.
    pub fn drain(&mut self, call_id: &CallId) -> Vec<Candidate> {
        self.orphans.retain(|id| id != call_id);
        self.pending
            .remove(call_id)
            .map(Vec::from)
            .unwrap_or_default()
    }

    pub fn discard(&mut self, call_id: &CallId) {
        self.orphans.retain(|id| id != call_id);
        self.pending.remove(call_id);
    }

    pub fn discard_all(&mut self) {
        self.orphans.clear();
        self.pending.clear();
    }

    pub fn len(&self, call_id: &CallId) -> usize {
        self.pending.get(call_id).map_or(0, VecDeque::len)
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.values().all(VecDeque::is_empty)
    }
}
