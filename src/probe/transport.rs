//! Echo transport - sends id-tagged probes, reports replies on a channel
//!
//! `UdpEchoTransport` carries the echo id as an 8-byte big-endian payload and
//! expects the peer to send the same bytes back (RFC 862 echo). Replies are
//! reported under the address string the probe was sent to, so the worker can
//! find its target without resolving anything. Several addresses may resolve
//! to one peer; a reply from it is reported once for each of them and the echo
//! id decides which one it belongs to.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{INTERNAL_CODE, RuntimeError};

use super::bucket::ProbeVariant;

/// Port used when an address carries none
pub const DEFAULT_ECHO_PORT: u16 = 7;

const REPLY_QUEUE_SIZE: usize = 1024;

type PeerMap = HashMap<SocketAddr, Vec<String>>;

/// One completed round trip
#[derive(Debug, Clone, PartialEq)]
pub struct EchoReply {
    pub id: u64,
    pub address: String,
    pub timestamp: DateTime<Utc>,

    /// Set when the medium reported a failure instead of a reply
    pub error: Option<String>,
}

#[async_trait]
pub trait EchoTransport: Send + Sync {
    async fn send(&self, id: u64, address: &str, variant: &ProbeVariant) -> Result<(), RuntimeError>;

    /// Drop whatever the transport keeps for an address that is no longer probed
    fn forget(&self, _address: &str) {}

    /// Release the underlying socket
    fn close(&self) {}
}

pub struct UdpEchoTransport {
    socket: Arc<UdpSocket>,
    /// Resolved peer -> addresses as given by the caller
    peers: Arc<Mutex<PeerMap>>,
    receiver: JoinHandle<()>,
}

impl UdpEchoTransport {
    /// Open the socket and start the receive loop
    pub async fn bind(local: SocketAddr) -> std::io::Result<(Self, mpsc::Receiver<EchoReply>)> {
        let socket = Arc::new(UdpSocket::bind(local).await?);
        debug!("echo socket bound to {}", socket.local_addr()?);

        let peers = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = mpsc::channel(REPLY_QUEUE_SIZE);
        let receiver = tokio::spawn(receive_loop(socket.clone(), peers.clone(), tx));

        Ok((
            Self {
                socket,
                peers,
                receiver,
            },
            rx,
        ))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Number of peers replies are currently expected from
    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    async fn resolve(address: &str) -> Result<SocketAddr, RuntimeError> {
        if let Ok(ip) = address.parse::<std::net::IpAddr>() {
            return Ok(SocketAddr::new(ip, DEFAULT_ECHO_PORT));
        }

        let target = if address.contains(':') {
            address.to_string()
        } else {
            format!("{address}:{DEFAULT_ECHO_PORT}")
        };

        tokio::net::lookup_host(target.as_str())
            .await
            .map_err(|e| RuntimeError::new(INTERNAL_CODE, format!("resolve '{address}' failed, {e}")))?
            .next()
            .ok_or_else(|| RuntimeError::new(INTERNAL_CODE, format!("resolve '{address}' failed")))
    }
}

#[async_trait]
impl EchoTransport for UdpEchoTransport {
    async fn send(&self, id: u64, address: &str, _variant: &ProbeVariant) -> Result<(), RuntimeError> {
        let peer = Self::resolve(address).await?;
        {
            let mut peers = self.peers.lock();
            let names = peers.entry(peer).or_default();
            if !names.iter().any(|n| n == address) {
                names.push(address.to_string());
            }
        }

        self.socket
            .send_to(&id.to_be_bytes(), peer)
            .await
            .map_err(|e| RuntimeError::new(INTERNAL_CODE, format!("send to '{address}' failed, {e}")))?;

        trace!("echo {id} sent to {peer}");
        Ok(())
    }

    fn forget(&self, address: &str) {
        self.peers.lock().retain(|_, names| {
            names.retain(|n| n != address);
            !names.is_empty()
        });
    }

    fn close(&self) {
        self.receiver.abort();
    }
}

impl Drop for UdpEchoTransport {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    peers: Arc<Mutex<PeerMap>>,
    tx: mpsc::Sender<EchoReply>,
) {
    let mut buf = [0u8; 1500];
    loop {
        let replies = match socket.recv_from(&mut buf).await {
            Ok((n, from)) => {
                let Ok(payload) = <[u8; 8]>::try_from(&buf[..n.min(8)]) else {
                    trace!("short echo from {from} ({n} bytes)");
                    continue;
                };
                let id = u64::from_be_bytes(payload);
                let timestamp = Utc::now();
                let addresses = peers
                    .lock()
                    .get(&from)
                    .cloned()
                    .unwrap_or_else(|| vec![from.to_string()]);

                addresses
                    .into_iter()
                    .map(|address| EchoReply {
                        id,
                        address,
                        timestamp,
                        error: None,
                    })
                    .collect()
            }
            Err(e) => {
                warn!("recv error on echo socket: {e}");
                vec![EchoReply {
                    id: 0,
                    address: String::new(),
                    timestamp: Utc::now(),
                    error: Some(e.to_string()),
                }]
            }
        };

        for reply in replies {
            if tx.send(reply).await.is_err() {
                debug!("echo reply receiver is gone");
                return;
            }
        }
    }
}
