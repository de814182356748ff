//! Message types for the sampling broker
//!
//! Public wire types (`ExchangeRequest`, `ExchangeResponse`) travel to and from
//! the collector as JSON. Internal command types travel from handles to the
//! broker actor.
//!
//! ## Wire format
//!
//! ```text
//! → [{"channel":"cpu/5/","request_id":7,"action":"GET","metric-name":"cpu",
//!     "managed_type":"network_device","managed_id":"5","paths":[["port","1"]]}]
//! ← [{"channel":"cpu/5/","request_id":7,"created_at":"...","value":{...}}]
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::error::{RuntimeError, SamplingError, SamplingResult};

/// Where replies for a subscription are delivered
pub type ReplySink = mpsc::Sender<ExchangeResponse>;

/// Channel name shared by every subscriber interested in the same reading
pub fn make_channel_name(metric: &str, managed_id: &str, path: &str) -> String {
    format!("{metric}/{managed_id}/{path}")
}

/// Which device a request reads from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Target {
    /// A device known to the data store
    Managed {
        managed_type: String,
        managed_id: String,
    },

    /// A bare network address
    Address { address: String },
}

impl Default for Target {
    fn default() -> Self {
        Target::Address {
            address: String::new(),
        }
    }
}

/// One metric read, as sent to the collector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRequest {
    #[serde(rename = "channel")]
    pub channel_name: String,

    /// Correlation id, assigned by the broker right before dispatch
    #[serde(rename = "request_id")]
    pub id: u64,

    pub action: String,

    #[serde(rename = "metric-name")]
    pub metric_name: String,

    #[serde(flatten)]
    pub target: Target,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<(String, String)>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl ExchangeRequest {
    pub fn new(
        channel_name: impl Into<String>,
        action: impl Into<String>,
        metric_name: impl Into<String>,
    ) -> Self {
        Self {
            channel_name: channel_name.into(),
            id: 0,
            action: action.into(),
            metric_name: metric_name.into(),
            target: Target::default(),
            paths: Vec::new(),
            params: BTreeMap::new(),
            body: None,
        }
    }

    pub fn managed(mut self, managed_type: impl Into<String>, managed_id: impl Into<String>) -> Self {
        self.target = Target::Managed {
            managed_type: managed_type.into(),
            managed_id: managed_id.into(),
        };
        self
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.target = Target::Address {
            address: address.into(),
        };
        self
    }

    /// Parse `"k1/v1/k2/v2"` into key/value path pairs
    pub fn paths_from_str(mut self, path: &str) -> SamplingResult<Self> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            self.paths.clear();
            return Ok(self);
        }

        let segments: Vec<&str> = trimmed.split('/').collect();
        if segments.len() % 2 != 0 {
            return Err(SamplingError::BadRequest(format!(
                "paths is style error - `{trimmed}`"
            )));
        }

        self.paths = segments
            .chunks(2)
            .map(|pair| (pair[0].to_string(), pair[1].to_string()))
            .collect();
        Ok(self)
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// One reply from the collector, or a synthetic error produced by the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeResponse {
    #[serde(rename = "channel", default)]
    pub channel_name: String,

    #[serde(rename = "request_id", default)]
    pub id: u64,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RuntimeError>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl ExchangeResponse {
    /// Synthetic error reply
    pub fn from_error(channel_name: impl Into<String>, id: u64, error: RuntimeError) -> Self {
        Self {
            channel_name: channel_name.into(),
            id,
            created_at: Utc::now(),
            error: Some(error),
            value: None,
        }
    }

    pub fn has_error(&self) -> bool {
        self.error.as_ref().is_some_and(|e| !e.is_empty())
    }

    /// Error code, -1 when the reply carries no error
    pub fn error_code(&self) -> i32 {
        match &self.error {
            Some(e) if !e.is_empty() => e.code,
            _ => -1,
        }
    }

    pub fn error_message(&self) -> &str {
        self.error.as_ref().map(|e| e.message.as_str()).unwrap_or_default()
    }

    /// Collapse into the value or the relayed error
    pub fn into_result(self) -> SamplingResult<Value> {
        match self.error {
            Some(e) if !e.is_empty() => Err(SamplingError::Transport(e)),
            _ => Ok(self.value.unwrap_or(Value::Null)),
        }
    }

    /// `{created_at, error?, value?}` as returned to HTTP callers
    pub fn to_map(&self) -> serde_json::Map<String, Value> {
        let mut res = serde_json::Map::new();
        res.insert("created_at".into(), Value::String(self.created_at.to_rfc3339()));
        if let Some(e) = &self.error {
            res.insert(
                "error".into(),
                serde_json::json!({"code": e.code, "message": e.message}),
            );
        }
        if let Some(v) = &self.value {
            res.insert("value".into(), v.clone());
        }
        res
    }
}

/// A one-shot request waiting for its reply
#[derive(Debug)]
pub struct PendingRequest {
    pub id: u64,
    pub created_at: Instant,
    pub reply: oneshot::Sender<ExchangeResponse>,
    pub request: ExchangeRequest,
}

/// Work items for the broker's exchange queue
#[derive(Debug)]
pub(crate) enum Exchange {
    /// One-shot request answered through `reply`
    Invoke {
        request: ExchangeRequest,
        reply: oneshot::Sender<ExchangeResponse>,
    },

    /// Trigger for a subscription, possibly coalesced
    Subscribed {
        subscriber_id: String,
        request: ExchangeRequest,
        cached_timeout: Duration,
    },

    /// Drain whatever is queued
    Flush,
}

/// Control messages for the broker actor
#[derive(Debug)]
pub(crate) enum BrokerCommand {
    Subscribe {
        channel_name: String,
        subscriber_id: String,
        sink: ReplySink,
        respond_to: oneshot::Sender<SamplingResult<()>>,
    },

    /// Fire-and-forget removal
    Unsubscribe {
        channel_name: String,
        subscriber_id: String,
    },

    GetStats {
        respond_to: oneshot::Sender<BrokerStats>,
    },

    Shutdown,
}

/// Broker statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct BrokerStats {
    pub name: String,

    /// Requests waiting in the exchange queue
    pub queued: usize,

    /// One-shot requests waiting for a reply
    pub pending: usize,

    /// Live channel groups
    pub groups: usize,

    /// Outbound exchange calls made so far
    pub exchanges: u64,

    pub last_error: Option<String>,
}
