/**
 * nat_traversal/hole_punching.rs
 *
 * UDP hole punching with punch/ack probe packets
 */

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, trace};

use super::types::{NatResult, NatTraversalError};

const PROBE_MAGIC: &[u8; 4] = b"SBHP";
const PROBE_LEN: usize = 13;

/// Probe packet kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Punch,
    Ack,
}

impl ProbeKind {
    fn to_byte(self) -> u8 {
        match self {
            ProbeKind::Punch => 0x01,
            ProbeKind::Ack => 0x02,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(ProbeKind::Punch),
            0x02 => Some(ProbeKind::Ack),
            _ => None,
        }
    }
}

/// UDP probe packet structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePacket {
    pub kind: ProbeKind,
    pub nonce: u64,
}

impl ProbePacket {
    pub fn punch(nonce: u64) -> Self {
        Self {
            kind: ProbeKind::Punch,
            nonce,
        }
    }

    /// Ack echoing the nonce of a received punch
    pub fn ack_for(&self) -> Self {
        Self {
            kind: ProbeKind::Ack,
            nonce: self.nonce,
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> [u8; PROBE_LEN] {
        let mut bytes = [0u8; PROBE_LEN];

        // Magic marker (4 bytes)
        bytes[0..4].copy_from_slice(PROBE_MAGIC);

        // Kind (1 byte)
        bytes[4] = self.kind.to_byte();

        // Nonce (8 bytes)
        bytes[5..13].copy_from_slice(&self.nonce.to_be_bytes());

        bytes
    }

    /// Deserialize from bytes
    pub fn from_bytes(data: &[u8]) -> NatResult<Self> {
        if data.len() != PROBE_LEN {
            return Err(NatTraversalError::Protocol(format!(
                "Invalid probe packet length: {}",
                data.len()
            )));
        }

        // Check magic marker
        if &data[0..4] != PROBE_MAGIC {
            return Err(NatTraversalError::Protocol("Invalid probe packet magic".into()));
        }

        let kind = ProbeKind::from_byte(data[4])
            .ok_or_else(|| NatTraversalError::Protocol(format!("Invalid probe kind: {}", data[4])))?;

        let mut nonce = [0u8; 8];
        nonce.copy_from_slice(&data[5..13]);

        Ok(Self {
            kind,
            nonce: u64::from_be_bytes(nonce),
        })
    }

    /// Cheap check used by listeners before attempting a full decode
    pub fn looks_like_probe(data: &[u8]) -> bool {
        data.len() == PROBE_LEN && &data[0..4] == PROBE_MAGIC
    }
}

/// UDP hole puncher
pub struct UdpHolePuncher {
    socket: Arc<UdpSocket>,
}

impl UdpHolePuncher {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }

    /// Bind a fresh puncher on `local_port` (0 for random)
    pub async fn bind(local_port: u16) -> NatResult<Self> {
        let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], local_port))).await?;
        Ok(Self::new(Arc::new(socket)))
    }

    pub fn local_addr(&self) -> NatResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Send punches to `targets` every `send_interval` until one of them
    /// acks our nonce or sends its own punch. Returns the address that
    /// answered.
    pub async fn punch(
        &self,
        targets: &[SocketAddr],
        nonce: u64,
        send_interval: Duration,
        timeout: Duration,
        cancel: &mut watch::Receiver<bool>,
    ) -> NatResult<SocketAddr> {
        if targets.is_empty() {
            return Err(NatTraversalError::ConnectionFailed("no punch targets".into()));
        }
        if *cancel.borrow() {
            return Err(NatTraversalError::ConnectionCancelled);
        }

        let probe_bytes = ProbePacket::punch(nonce).to_bytes();
        debug!("Starting UDP hole punching to {} addresses", targets.len());

        let mut ticker = interval(send_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let deadline = sleep(timeout);
        tokio::pin!(deadline);

        let mut buffer = [0u8; 64];
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    return Err(NatTraversalError::Timeout("UDP hole punching".into()));
                }
                changed = cancel.changed() => {
                    // A dropped sender also ends the attempt
                    if changed.is_err() || *cancel.borrow() {
                        return Err(NatTraversalError::ConnectionCancelled);
                    }
                }
                _ = ticker.tick() => {
                    for addr in targets {
                        if let Err(e) = self.socket.send_to(&probe_bytes, addr).await {
                            trace!("Probe to {} failed: {}", addr, e);
                        }
                    }
                }
                received = self.socket.recv_from(&mut buffer) => {
                    let (len, from) = match received {
                        Ok(r) => r,
                        Err(e) => {
                            return Err(NatTraversalError::ConnectionFailed(e.to_string()));
                        }
                    };
                    if !targets.contains(&from) {
                        trace!("Ignoring datagram from unexpected {}", from);
                        continue;
                    }
                    match ProbePacket::from_bytes(&buffer[..len]) {
                        Ok(probe) if probe.kind == ProbeKind::Ack && probe.nonce == nonce => {
                            debug!("Punch acknowledged by {}", from);
                            return Ok(from);
                        }
                        Ok(probe) if probe.kind == ProbeKind::Punch => {
                            // Simultaneous punch: the path is open in both directions
                            let _ = self.socket.send_to(&probe.ack_for().to_bytes(), from).await;
                            debug!("Peer punch received from {}", from);
                            return Ok(from);
                        }
                        Ok(_) => trace!("Stale ack from {}", from),
                        Err(e) => trace!("Invalid probe from {}: {}", from, e),
                    }
                }
            }
        }
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }
}
