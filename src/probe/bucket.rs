//! Probe state - buckets, pending echoes and the scan plan
//!
//! `ProbeTable` is plain data: every method takes the current time, so the
//! scheduling rules can be exercised without a clock or a socket. The worker
//! wraps it in a mutex shared between its actor and `call()`.
//!
//! ```text
//! ProbeTable
//!   └─ "10.0.0.1:161" TargetEntry ── pending: [PendingEcho; 32]
//!        ├─ "v2c/public"  ProbeBucket ── history: [ProbeResult; buffer_size]
//!        └─ "v1/private"  ProbeBucket
//! ```

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, trace};

use crate::config::ProbeConfig;
use crate::error::{SamplingError, SamplingResult};
use crate::ring_buffer::{Flow, RingBuffer};

use super::transport::EchoReply;

/// Echo ids are scoped to one address; this many may be outstanding
pub const PENDING_ECHO_CAPACITY: usize = 32;

/// Scans only happen on the first few sub-ticks of a poll interval
const SCAN_SUB_TICKS: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SnmpVersion {
    V1,
    V2c,
    V3,
}

impl SnmpVersion {
    pub fn parse(s: &str) -> SamplingResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "v1" | "1" => Ok(SnmpVersion::V1),
            "v2" | "v2c" | "2" | "2c" => Ok(SnmpVersion::V2c),
            "v3" | "3" => Ok(SnmpVersion::V3),
            other => Err(SamplingError::BadRequest(format!(
                "'{other}' is not a snmp version."
            ))),
        }
    }
}

impl fmt::Display for SnmpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnmpVersion::V1 => f.write_str("v1"),
            SnmpVersion::V2c => f.write_str("v2c"),
            SnmpVersion::V3 => f.write_str("v3"),
        }
    }
}

/// What a probe looks like on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProbeVariant {
    Icmp,
    Snmp {
        version: SnmpVersion,
        community: String,
    },
}

impl ProbeVariant {
    /// Bucket key, unique per address
    pub fn key(&self) -> String {
        match self {
            ProbeVariant::Icmp => String::from("icmp"),
            ProbeVariant::Snmp { version, community } => format!("{version}/{community}"),
        }
    }
}

/// One successful round trip
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProbeResult {
    pub result: bool,
    pub sent_at: DateTime<Utc>,
    pub recv_at: DateTime<Utc>,
    pub elapsed_ms: i64,
}

/// An echo that went out and has not come back yet
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingEcho {
    pub id: u64,
    pub key: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct ProbeBucket {
    pub key: String,
    pub variant: ProbeVariant,
    pub history: RingBuffer<ProbeResult>,
    pub created_at: DateTime<Utc>,

    /// Refreshed by callers only, never by probe results
    pub updated_at: DateTime<Utc>,
}

impl ProbeBucket {
    fn new(variant: ProbeVariant, buffer_size: usize, now: DateTime<Utc>) -> Self {
        Self {
            key: variant.key(),
            variant,
            history: RingBuffer::with_capacity(buffer_size),
            created_at: now,
            updated_at: now,
        }
    }

    /// Nobody asked for this bucket in `expired_secs`
    pub fn is_expired(&self, now: DateTime<Utc>, expired_secs: i64) -> bool {
        (now - self.updated_at).num_seconds() > expired_secs
    }

    /// The newest result (or creation, without results) is older than
    /// `timeout_secs`
    pub fn is_timed_out(&self, now: DateTime<Utc>, timeout_secs: i64) -> bool {
        let last = self
            .history
            .last()
            .map(|r| r.recv_at)
            .unwrap_or(self.created_at);
        (now - last).num_seconds() > timeout_secs
    }
}

/// All buckets of one address, plus the echoes in flight to it
#[derive(Debug)]
pub struct TargetEntry {
    pub buckets: HashMap<String, ProbeBucket>,
    pub pending: RingBuffer<PendingEcho>,
}

impl TargetEntry {
    fn new() -> Self {
        Self {
            buckets: HashMap::new(),
            pending: RingBuffer::with_capacity(PENDING_ECHO_CAPACITY),
        }
    }
}

/// One probe to send
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeJob {
    pub id: u64,
    pub address: String,
    pub key: String,
    pub variant: ProbeVariant,
}

/// What a caller gets back
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ProbeOutcome {
    /// No result yet, ask again shortly
    Pending,

    Ready { result: bool, list: Vec<ProbeResult> },
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct BucketStats {
    pub address: String,
    pub key: String,
}

#[derive(Debug)]
pub struct ProbeTable {
    buffer_size: usize,
    expired_secs: i64,
    timeout_secs: i64,
    targets: HashMap<String, TargetEntry>,
    /// Echo ids are unique across addresses, several may share one peer
    next_id: u64,
    /// Addresses removed since the last `take_evicted`
    evicted: Vec<String>,
}

impl ProbeTable {
    pub fn new(config: &ProbeConfig) -> Self {
        Self {
            buffer_size: config.buffer_size,
            expired_secs: config.expired_secs,
            timeout_secs: config.timeout_secs,
            targets: HashMap::new(),
            next_id: 0,
            evicted: Vec::new(),
        }
    }

    fn next_echo_id(&mut self) -> u64 {
        self.next_id = self.next_id.wrapping_add(1);
        if self.next_id == 0 {
            self.next_id = 1;
        }
        self.next_id
    }

    /// Addresses evicted since the last call, so their peers can be released
    pub fn take_evicted(&mut self) -> Vec<String> {
        std::mem::take(&mut self.evicted)
    }

    pub fn len(&self) -> usize {
        self.targets.values().map(|t| t.buckets.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn target(&self, address: &str) -> Option<&TargetEntry> {
        self.targets.get(address)
    }

    pub fn bucket(&self, address: &str, key: &str) -> Option<&ProbeBucket> {
        self.targets.get(address)?.buckets.get(key)
    }

    pub fn bucket_mut(&mut self, address: &str, key: &str) -> Option<&mut ProbeBucket> {
        self.targets.get_mut(address)?.buckets.get_mut(key)
    }

    /// Read a bucket on behalf of a caller, creating it on first use.
    ///
    /// Returns the outcome and whether the bucket was just created.
    pub fn call(
        &mut self,
        address: &str,
        variant: &ProbeVariant,
        now: DateTime<Utc>,
    ) -> (ProbeOutcome, bool) {
        let key = variant.key();
        let buffer_size = self.buffer_size;
        let entry = self
            .targets
            .entry(address.to_string())
            .or_insert_with(TargetEntry::new);

        let mut created = false;
        let bucket = entry.buckets.entry(key).or_insert_with_key(|key| {
            debug!("add '{address}' and '{key}' to scan list");
            created = true;
            ProbeBucket::new(variant.clone(), buffer_size, now)
        });

        bucket.updated_at = now;

        let timed_out = bucket.is_timed_out(now, self.timeout_secs);
        let list = bucket.history.all();
        let outcome = if list.is_empty() && !timed_out {
            ProbeOutcome::Pending
        } else {
            ProbeOutcome::Ready {
                result: !timed_out,
                list,
            }
        };
        (outcome, created)
    }

    /// Drop buckets nobody asked for in time, and addresses left without any
    pub fn evict_expired(&mut self, now: DateTime<Utc>) -> usize {
        let expired_secs = self.expired_secs;
        let mut evicted = 0;
        let removed = &mut self.evicted;

        self.targets.retain(|address, entry| {
            entry.buckets.retain(|key, bucket| {
                let keep = !bucket.is_expired(now, expired_secs);
                if !keep {
                    debug!(
                        "'{address}/{key}' with updated_at was '{}' is expired",
                        bucket.updated_at
                    );
                    evicted += 1;
                }
                keep
            });

            if entry.buckets.is_empty() {
                debug!("'{address}' is expired");
                removed.push(address.clone());
                return false;
            }
            true
        });

        evicted
    }

    /// Decide what to probe on this sub-tick of the poll interval.
    ///
    /// Sub-tick 0 probes every live bucket, sub-ticks 1 to 3 only the ones
    /// that timed out, later sub-ticks do nothing at all.
    pub fn plan_probes(&mut self, now: DateTime<Utc>, sub_tick: u64) -> Vec<ProbeJob> {
        if sub_tick > SCAN_SUB_TICKS {
            return Vec::new();
        }

        self.evict_expired(now);

        let timeout_secs = self.timeout_secs;
        let due: Vec<(String, String, ProbeVariant)> = self
            .targets
            .iter()
            .flat_map(|(address, entry)| {
                entry
                    .buckets
                    .values()
                    .filter(move |b| sub_tick == 0 || b.is_timed_out(now, timeout_secs))
                    .map(move |b| (address.clone(), b.key.clone(), b.variant.clone()))
            })
            .collect();

        due.into_iter()
            .map(|(address, key, variant)| ProbeJob {
                id: self.next_echo_id(),
                address,
                key,
                variant,
            })
            .collect()
    }

    /// A probe for one bucket right away, if it still exists
    pub fn probe_now(&mut self, address: &str, key: &str) -> Option<ProbeJob> {
        let variant = self.bucket(address, key)?.variant.clone();
        Some(ProbeJob {
            id: self.next_echo_id(),
            address: address.to_string(),
            key: key.to_string(),
            variant,
        })
    }

    /// Remember that `job` went out at `sent_at`
    pub fn record_pending(&mut self, job: &ProbeJob, sent_at: DateTime<Utc>) {
        let Some(entry) = self.targets.get_mut(&job.address) else {
            return;
        };
        entry.pending.push(PendingEcho {
            id: job.id,
            key: job.key.clone(),
            sent_at,
        });
    }

    /// Match an echo reply against the pending echoes of its address.
    ///
    /// Everything sent before the matched echo is presumed lost and dropped.
    /// Returns false when the reply matched nothing.
    pub fn record_reply(&mut self, reply: &EchoReply) -> bool {
        let Some(entry) = self.targets.get_mut(&reply.address) else {
            trace!("'{}' is not exists", reply.address);
            return false;
        };

        if entry.pending.is_empty() {
            trace!("'{}' is not pending, pendings is empty", reply.address);
            return false;
        }

        let found = entry.pending.scan::<(), _>(|_, echo| {
            if echo.id == reply.id {
                Flow::Stop
            } else {
                Flow::Continue
            }
        });
        let Ok(Some(idx)) = found else {
            trace!(
                "'{}' is not pending, id {} is not in list, current id is {}",
                reply.address, reply.id, self.next_id
            );
            return false;
        };

        let Some(echo) = entry.pending.get(idx).cloned() else {
            return false;
        };
        entry.pending.drop_front(idx + 1);

        let Some(bucket) = entry.buckets.get_mut(&echo.key) else {
            trace!("'{}' and '{}' is not pending, it may expired", reply.address, echo.key);
            return false;
        };

        let slot = bucket.history.begin_push();
        slot.result = true;
        slot.sent_at = echo.sent_at;
        slot.recv_at = reply.timestamp;
        slot.elapsed_ms = (reply.timestamp - echo.sent_at).num_milliseconds();
        bucket.history.commit_push();
        true
    }

    pub fn stats(&self) -> Vec<BucketStats> {
        let mut stats: Vec<BucketStats> = self
            .targets
            .iter()
            .flat_map(|(address, entry)| {
                entry.buckets.keys().map(move |key| BucketStats {
                    address: address.clone(),
                    key: key.clone(),
                })
            })
            .collect();
        stats.sort();
        stats
    }
}
