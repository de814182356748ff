//! Network-device metric sampling engine
//!
//! - [`broker`]: batches metric reads into few collector round trips and fans
//!   replies out to subscribers
//! - [`probe`]: continuous reachability probes with bounded per-target history
//! - [`registry`]: background workers and sampling methods
//! - [`ring_buffer`]: the bounded-history container both build on

pub mod broker;
pub mod config;
pub mod error;
pub mod params;
pub mod probe;
pub mod registry;
pub mod ring_buffer;
pub mod supervise;

pub use error::{RuntimeError, SamplingError, SamplingResult};
pub use params::Params;
pub use ring_buffer::RingBuffer;
