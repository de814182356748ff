//! Client handles created by the broker
//!
//! - [`Client`]: one request, one reply (or a timeout)
//! - [`ChannelClient`]: a subscription whose replies arrive on the caller's sink

use std::time::Duration;

use tokio::sync::oneshot;
use tracing::trace;

use crate::error::{SamplingError, SamplingResult};

use super::SamplingBroker;
use super::messages::{Exchange, ExchangeRequest, ExchangeResponse};

/// One-shot request bound to a broker
#[derive(Clone)]
pub struct Client {
    id: String,
    broker: SamplingBroker,
    request: ExchangeRequest,
}

impl Client {
    pub(super) fn new(id: String, broker: SamplingBroker, request: ExchangeRequest) -> Self {
        Self { id, broker, request }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn request(&self) -> &ExchangeRequest {
        &self.request
    }

    /// Send the request and wait up to `timeout` for its reply.
    ///
    /// Errors reported by the collector come back inside the response; only
    /// local failures (closed broker, timeout) are returned as `Err`.
    pub async fn invoke(&self, timeout: Duration) -> SamplingResult<ExchangeResponse> {
        if self.broker.is_closed() {
            return Err(SamplingError::Closed);
        }

        let (tx, rx) = oneshot::channel();
        self.broker
            .enqueue(Exchange::Invoke {
                request: self.request.clone(),
                reply: tx,
            })
            .await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            // the actor went away with our request still queued
            Ok(Err(_)) => Err(SamplingError::Closed),
            Err(_) => {
                trace!("client '{}' timed out after {timeout:?}", self.id);
                Err(SamplingError::Timeout)
            }
        }
    }
}

/// Subscription to a channel group
pub struct ChannelClient {
    id: String,
    broker: SamplingBroker,
    request: ExchangeRequest,
    cached_timeout: Duration,
}

impl std::fmt::Debug for ChannelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelClient")
            .field("id", &self.id)
            .field("request", &self.request)
            .field("cached_timeout", &self.cached_timeout)
            .finish_non_exhaustive()
    }
}

impl ChannelClient {
    pub(super) fn new(
        id: String,
        broker: SamplingBroker,
        request: ExchangeRequest,
        cached_timeout: Duration,
    ) -> Self {
        Self {
            id,
            broker,
            request,
            cached_timeout,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn channel_name(&self) -> &str {
        &self.request.channel_name
    }

    /// Ask for a fresh reading, unless one was requested or received within
    /// the coalescing window. Replies arrive on the subscription sink.
    pub async fn send(&self) -> SamplingResult<()> {
        if self.broker.is_closed() {
            return Err(SamplingError::Closed);
        }

        self.broker
            .enqueue(Exchange::Subscribed {
                subscriber_id: self.id.clone(),
                request: self.request.clone(),
                cached_timeout: self.cached_timeout,
            })
            .await
    }

    /// Unsubscribe
    pub async fn close(self) {
        self.broker
            .unsubscribe(&self.request.channel_name, &self.id)
            .await;
    }
}
