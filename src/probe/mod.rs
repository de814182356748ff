//! Reachability probes (ICMP-style echo and SNMP test)
//!
//! - [`bucket`]: per-target state and scheduling rules
//! - [`transport`]: sending echoes and collecting replies
//! - [`worker`]: the actor tying both together

pub mod bucket;
pub mod transport;
pub mod worker;

pub use bucket::{ProbeOutcome, ProbeResult, ProbeTable, ProbeVariant, SnmpVersion};
pub use transport::{EchoReply, EchoTransport, UdpEchoTransport};
pub use worker::{ProbeKind, ProbeWorker, WorkerStats};
