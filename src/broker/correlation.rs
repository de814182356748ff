//! CorrelationTable - one-shot requests waiting for a reply
//!
//! Owned exclusively by the broker actor. Entries leave the table either when
//! a reply with their id arrives or when an idle sweep finds them older than
//! the request timeout.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::error::RuntimeError;

use super::messages::{ExchangeResponse, PendingRequest};

#[derive(Debug, Default)]
pub struct CorrelationTable {
    pending: HashMap<u64, PendingRequest>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn insert(&mut self, pending: PendingRequest) {
        self.pending.insert(pending.id, pending);
    }

    /// Deliver `response` to the waiter registered under its id.
    ///
    /// Returns false when no such waiter exists; the response is dropped and
    /// no other entry is touched.
    pub fn complete(&mut self, response: &ExchangeResponse) -> bool {
        let Some(pending) = self.pending.remove(&response.id) else {
            trace!("no waiter for request {}", response.id);
            return false;
        };

        // the caller may have given up already
        let _ = pending.reply.send(response.clone());
        true
    }

    /// Fail `id` with `error`, if it is still pending
    pub fn fail(&mut self, id: u64, error: &RuntimeError) -> bool {
        let Some(pending) = self.pending.remove(&id) else {
            return false;
        };

        let _ = pending.reply.send(ExchangeResponse::from_error(
            pending.request.channel_name,
            id,
            error.clone(),
        ));
        true
    }

    /// Remove every entry older than `timeout` and hand each a timeout error.
    ///
    /// Returns the number of expired entries.
    pub fn sweep(&mut self, now: Instant, timeout: Duration) -> usize {
        if self.pending.is_empty() {
            return 0;
        }

        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.created_at) > timeout)
            .map(|(id, _)| *id)
            .collect();

        let error = RuntimeError::timeout();
        for id in &expired {
            self.fail(*id, &error);
        }
        expired.len()
    }

    /// Fail every entry, used when the broker shuts down
    pub fn drain(&mut self, error: &RuntimeError) {
        let ids: Vec<u64> = self.pending.keys().copied().collect();
        for id in ids {
            self.fail(id, error);
        }
    }
}
