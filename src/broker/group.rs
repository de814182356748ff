//! Channel groups - named subscriber sets with a coalescing window
//!
//! Every subscriber of a channel receives every reply published under that
//! channel name, no matter who triggered the request. Triggers that arrive
//! within the coalescing window of the group's last request or last reply are
//! suppressed.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{SamplingError, SamplingResult};

use super::messages::{ExchangeResponse, ReplySink};

#[derive(Debug)]
pub struct ChannelGroup {
    pub name: String,
    subscribers: HashMap<String, ReplySink>,
    last_request_at: Option<Instant>,
    last_reply_at: Option<Instant>,
}

impl ChannelGroup {
    fn new(name: String) -> Self {
        Self {
            name,
            subscribers: HashMap::new(),
            last_request_at: None,
            last_reply_at: None,
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    fn within(at: Option<Instant>, now: Instant, window: Duration) -> bool {
        at.is_some_and(|at| now.saturating_duration_since(at) < window)
    }

    /// True if a new outbound request may be issued now
    pub fn is_due(&self, now: Instant, window: Duration) -> bool {
        !Self::within(self.last_request_at, now, window)
            && !Self::within(self.last_reply_at, now, window)
    }
}

#[derive(Debug, Default)]
pub struct ChannelGroups {
    groups: HashMap<String, ChannelGroup>,
}

impl ChannelGroups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn get(&self, channel_name: &str) -> Option<&ChannelGroup> {
        self.groups.get(channel_name)
    }

    /// Add a subscriber, creating the group on first use
    pub fn subscribe(
        &mut self,
        channel_name: &str,
        subscriber_id: &str,
        sink: ReplySink,
    ) -> SamplingResult<()> {
        let group = self
            .groups
            .entry(channel_name.to_string())
            .or_insert_with(|| ChannelGroup::new(channel_name.to_string()));

        if group.subscribers.contains_key(subscriber_id) {
            return Err(SamplingError::AlreadyExists);
        }

        group.subscribers.insert(subscriber_id.to_string(), sink);
        debug!(
            "'{subscriber_id}' subscribed to '{channel_name}' ({} subscribers)",
            group.len()
        );
        Ok(())
    }

    /// Remove a subscriber, dropping the group once it is empty
    pub fn unsubscribe(&mut self, channel_name: &str, subscriber_id: &str) -> bool {
        let Some(group) = self.groups.get_mut(channel_name) else {
            return false;
        };

        let removed = group.subscribers.remove(subscriber_id).is_some();
        if group.is_empty() {
            self.groups.remove(channel_name);
            debug!("channel '{channel_name}' has no subscribers left");
        }
        removed
    }

    /// Decide whether a trigger for `channel_name` goes out in this round.
    ///
    /// Marks the group as requested when it does. Triggers for channels that
    /// no longer exist are dropped.
    pub fn begin_request(&mut self, channel_name: &str, now: Instant, window: Duration) -> bool {
        let Some(group) = self.groups.get_mut(channel_name) else {
            return false;
        };

        if !group.is_due(now, window) {
            return false;
        }

        group.last_request_at = Some(now);
        true
    }

    /// Send to one subscriber only, e.g. a transport error for its own trigger
    pub fn reply_to(&mut self, channel_name: &str, subscriber_id: &str, response: &ExchangeResponse) {
        let Some(group) = self.groups.get(channel_name) else {
            return;
        };

        let Some(sink) = group.subscribers.get(subscriber_id) else {
            return;
        };

        if let Err(TrySendError::Closed(_)) = sink.try_send(response.clone()) {
            self.unsubscribe(channel_name, subscriber_id);
        }
    }

    /// Fan `response` out to every subscriber of its channel.
    ///
    /// Closed sinks are pruned, and the group goes away with its last
    /// subscriber. Returns the number of subscribers reached.
    pub fn publish(&mut self, response: &ExchangeResponse, now: Instant) -> usize {
        let Some(group) = self.groups.get_mut(&response.channel_name) else {
            return 0;
        };

        group.last_reply_at = Some(now);

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, sink) in &group.subscribers {
            match sink.try_send(response.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!("subscriber '{id}' of '{}' is lagging, reply dropped", group.name);
                }
                Err(TrySendError::Closed(_)) => closed.push(id.clone()),
            }
        }

        for id in closed {
            debug!("subscriber '{id}' of '{}' is gone", group.name);
            group.subscribers.remove(&id);
        }

        if group.is_empty() {
            self.groups.remove(&response.channel_name);
        }
        delivered
    }
}
