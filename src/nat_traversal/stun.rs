/**
 * nat_traversal/stun.rs
 *
 * STUN client for NAT discovery (RFC 5389 binding requests, RFC 3489
 * CHANGE-REQUEST for filtering tests)
 */

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace};

use super::types::{NatResult, NatTraversalError};

/// STUN message types
const STUN_BINDING_REQUEST: u16 = 0x0001;
const STUN_BINDING_RESPONSE: u16 = 0x0101;
const STUN_BINDING_ERROR: u16 = 0x0111;

/// STUN magic cookie
const STUN_MAGIC_COOKIE: u32 = 0x2112A442;

/// STUN attribute types
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_CHANGE_REQUEST: u16 = 0x0003;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_RESPONSE_ORIGIN: u16 = 0x802b;
const ATTR_OTHER_ADDRESS: u16 = 0x802c;

const CHANGE_IP_FLAG: u32 = 0x04;
const CHANGE_PORT_FLAG: u32 = 0x02;

/// STUN query response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunResponse {
    /// Our address as seen by the reflector
    pub mapped_address: SocketAddr,
    pub response_origin: Option<SocketAddr>,
    /// Alternate reflector address advertised for NAT tests
    pub other_address: Option<SocketAddr>,
}

/// STUN client
pub struct StunClient {
    socket: Arc<UdpSocket>,
    timeout: Duration,
}

impl StunClient {
    /// Create a new STUN client on `local_port` (0 for random)
    pub async fn bind(local_port: u16, timeout: Duration) -> NatResult<Self> {
        let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], local_port))).await?;
        Ok(Self::with_socket(Arc::new(socket), timeout))
    }

    /// Run queries over an existing socket. Nothing else may read from it
    /// while the client is in use.
    pub fn with_socket(socket: Arc<UdpSocket>, timeout: Duration) -> Self {
        Self { socket, timeout }
    }

    /// Plain binding request
    pub async fn query(&self, server: SocketAddr) -> NatResult<StunResponse> {
        let (response, _) = self.query_with_change(server, false, false).await?;
        Ok(response)
    }

    /// Binding request, optionally asking the reflector to answer from a
    /// different IP and/or port. Also returns the address the reply came
    /// from, since reflectors that ignore CHANGE-REQUEST still answer.
    pub async fn query_with_change(
        &self,
        server: SocketAddr,
        change_ip: bool,
        change_port: bool,
    ) -> NatResult<(StunResponse, SocketAddr)> {
        let transaction_id: [u8; 12] = rand::random();
        let request = build_binding_request(&transaction_id, change_ip, change_port);

        self.socket.send_to(&request, server).await?;
        debug!(
            "Sent STUN request to {} (change_ip={}, change_port={})",
            server, change_ip, change_port
        );

        // Replies to change requests come from another address, so accept
        // any source and match on the transaction id.
        let deadline = Instant::now() + self.timeout;
        let mut buffer = [0u8; 576];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let (len, from) = timeout(remaining, self.socket.recv_from(&mut buffer))
                .await
                .map_err(|_| NatTraversalError::Timeout(format!("STUN request to {}", server)))??;

            if !is_stun_message(&buffer[..len]) {
                trace!("Ignoring non-STUN datagram from {}", from);
                continue;
            }
            match parse_binding_response(&buffer[..len], &transaction_id) {
                Ok(response) => {
                    debug!("STUN response from {}: mapped {}", from, response.mapped_address);
                    return Ok((response, from));
                }
                Err(NatTraversalError::Protocol(reason)) if reason == TRANSACTION_MISMATCH => {
                    trace!("Ignoring stray datagram from {}", from);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Get local socket address
    pub fn local_addr(&self) -> NatResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Hand the socket over for hole punching; its NAT mapping is the one
    /// the queries learned
    pub fn into_socket(self) -> Arc<UdpSocket> {
        self.socket
    }
}

/// Resolve a `host:port` reflector, bounded by `limit`
pub async fn resolve_server(server: &str, limit: Duration) -> NatResult<SocketAddr> {
    if let Ok(addr) = server.parse() {
        return Ok(addr);
    }
    timeout(limit, tokio::net::lookup_host(server))
        .await
        .map_err(|_| NatTraversalError::Timeout(format!("resolving {}", server)))??
        .find(|a| a.is_ipv4())
        .ok_or_else(|| NatTraversalError::InvalidEndpoint(server.to_string()))
}

/// Source IP the OS would route from towards `server`
pub async fn local_ip_towards(server: SocketAddr) -> NatResult<IpAddr> {
    let probe = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0))).await?;
    probe.connect(server).await?;
    Ok(probe.local_addr()?.ip())
}

const TRANSACTION_MISMATCH: &str = "Transaction ID mismatch";

/// Header-level check: long enough and carries the magic cookie
fn is_stun_message(data: &[u8]) -> bool {
    data.len() >= 20 && data[4..8] == STUN_MAGIC_COOKIE.to_be_bytes()
}

/// Build a STUN binding request
pub(crate) fn build_binding_request(
    transaction_id: &[u8; 12],
    change_ip: bool,
    change_port: bool,
) -> Vec<u8> {
    let mut request = Vec::with_capacity(28);

    // Message type (16 bits)
    request.extend_from_slice(&STUN_BINDING_REQUEST.to_be_bytes());

    // Message length (16 bits), patched below
    request.extend_from_slice(&0u16.to_be_bytes());

    // Magic cookie (32 bits)
    request.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());

    // Transaction ID (96 bits)
    request.extend_from_slice(transaction_id);

    if change_ip || change_port {
        let mut flags = 0u32;
        if change_ip {
            flags |= CHANGE_IP_FLAG;
        }
        if change_port {
            flags |= CHANGE_PORT_FLAG;
        }
        request.extend_from_slice(&ATTR_CHANGE_REQUEST.to_be_bytes());
        request.extend_from_slice(&4u16.to_be_bytes());
        request.extend_from_slice(&flags.to_be_bytes());
    }

    let body_len = (request.len() - 20) as u16;
    request[2..4].copy_from_slice(&body_len.to_be_bytes());
    request
}

/// Parse STUN binding response
pub(crate) fn parse_binding_response(
    data: &[u8],
    expected_transaction_id: &[u8; 12],
) -> NatResult<StunResponse> {
    if data.len() < 20 {
        return Err(NatTraversalError::Protocol("STUN response too short".into()));
    }

    // Check magic cookie
    let magic = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if magic != STUN_MAGIC_COOKIE {
        return Err(NatTraversalError::Protocol("Invalid magic cookie".into()));
    }

    // Check transaction ID
    if &data[8..20] != expected_transaction_id {
        return Err(NatTraversalError::Protocol(TRANSACTION_MISMATCH.into()));
    }

    // Check message type
    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    if msg_type == STUN_BINDING_ERROR {
        return Err(NatTraversalError::Protocol("STUN binding error response".into()));
    }
    if msg_type != STUN_BINDING_RESPONSE {
        return Err(NatTraversalError::Protocol(format!(
            "Invalid STUN response type: 0x{:04x}",
            msg_type
        )));
    }

    // Parse message length
    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    if data.len() < 20 + msg_len {
        return Err(NatTraversalError::Protocol("STUN response truncated".into()));
    }

    let mut mapped_address = None;
    let mut xor_mapped_address = None;
    let mut response_origin = None;
    let mut other_address = None;

    // Parse attributes
    let mut offset = 20;
    while offset + 4 <= 20 + msg_len {
        let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let attr_len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        offset += 4;

        if offset + attr_len > 20 + msg_len {
            break;
        }

        let attr_data = &data[offset..offset + attr_len];
        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => {
                xor_mapped_address = parse_xor_mapped_address(attr_data, expected_transaction_id)
            }
            ATTR_MAPPED_ADDRESS => mapped_address = parse_mapped_address(attr_data),
            ATTR_RESPONSE_ORIGIN => response_origin = parse_mapped_address(attr_data),
            ATTR_OTHER_ADDRESS => other_address = parse_mapped_address(attr_data),
            _ => {}
        }

        // Attributes are padded to 4-byte boundaries
        offset += (attr_len + 3) & !3;
    }

    // XOR-MAPPED-ADDRESS wins over the legacy attribute
    let mapped_address = xor_mapped_address.or(mapped_address).ok_or_else(|| {
        NatTraversalError::Protocol("No address attribute found in STUN response".into())
    })?;

    Ok(StunResponse {
        mapped_address,
        response_origin,
        other_address,
    })
}

/// Parse XOR-MAPPED-ADDRESS attribute
fn parse_xor_mapped_address(data: &[u8], transaction_id: &[u8; 12]) -> Option<SocketAddr> {
    if data.len() < 8 {
        return None;
    }

    let family = data[1];
    let port = u16::from_be_bytes([data[2], data[3]]) ^ (STUN_MAGIC_COOKIE >> 16) as u16;

    let ip = match family {
        0x01 => {
            let xor_addr = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
            IpAddr::V4(Ipv4Addr::from(xor_addr ^ STUN_MAGIC_COOKIE))
        }
        0x02 => {
            if data.len() < 20 {
                return None;
            }
            // XOR with magic cookie + transaction ID
            let mut xor_key = [0u8; 16];
            xor_key[0..4].copy_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
            xor_key[4..16].copy_from_slice(transaction_id);

            let mut addr_bytes = [0u8; 16];
            for (i, byte) in addr_bytes.iter_mut().enumerate() {
                *byte = data[4 + i] ^ xor_key[i];
            }
            IpAddr::V6(Ipv6Addr::from(addr_bytes))
        }
        _ => return None,
    };

    Some(SocketAddr::new(ip, port))
}

/// Parse MAPPED-ADDRESS style attribute (also OTHER-ADDRESS, RESPONSE-ORIGIN)
fn parse_mapped_address(data: &[u8]) -> Option<SocketAddr> {
    if data.len() < 8 {
        return None;
    }

    let family = data[1];
    let port = u16::from_be_bytes([data[2], data[3]]);

    let ip = match family {
        0x01 => IpAddr::from([data[4], data[5], data[6], data[7]]),
        0x02 => {
            if data.len() < 20 {
                return None;
            }
            let mut addr_bytes = [0u8; 16];
            addr_bytes.copy_from_slice(&data[4..20]);
            IpAddr::from(addr_bytes)
        }
        _ => return None,
    };

    Some(SocketAddr::new(ip, port))
}

/// Minimal reflector used by tests
#[cfg(test)]
pub(crate) mod test_reflector {
    use super::*;

    /// Encode a binding success response carrying XOR-MAPPED-ADDRESS (IPv4)
    pub fn build_binding_response(transaction_id: &[u8], mapped: SocketAddr) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        out.extend_from_slice(&STUN_BINDING_RESPONSE.to_be_bytes());
        out.extend_from_slice(&12u16.to_be_bytes());
        out.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
        out.extend_from_slice(transaction_id);

        out.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
        out.extend_from_slice(&8u16.to_be_bytes());
        out.push(0);
        out.push(0x01);
        let port = mapped.port() ^ (STUN_MAGIC_COOKIE >> 16) as u16;
        out.extend_from_slice(&port.to_be_bytes());
        let ip = match mapped.ip() {
            IpAddr::V4(v4) => u32::from(v4) ^ STUN_MAGIC_COOKIE,
            IpAddr::V6(_) => 0,
        };
        out.extend_from_slice(&ip.to_be_bytes());
        out
    }

    /// How the reflector treats CHANGE-REQUEST
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ChangeReplies {
        /// Drop change requests, like a NAT filtering everything unsolicited
        Ignore,
        /// Answer them from the primary address, like most RFC 5389 servers
        FromPrimary,
        /// Answer port changes from a second port; drop IP changes
        PortOnly,
        /// Answer IP changes from 127.0.0.2, port changes from a second port
        Full,
    }

    /// Spawn a reflector on loopback. `mapped` overrides the reported
    /// address.
    pub async fn spawn(mapped: Option<SocketAddr>, change: ChangeReplies) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let other_port = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let other_ip = match change {
            ChangeReplies::Full => Some(UdpSocket::bind("127.0.0.2:0").await.unwrap()),
            _ => None,
        };

        tokio::spawn(async move {
            let mut buf = [0u8; 576];
            while let Ok((len, from)) = socket.recv_from(&mut buf).await {
                if len < 20 {
                    continue;
                }
                let flags = if len >= 28 { u32::from(buf[27]) } else { 0 };
                let change_ip = flags & CHANGE_IP_FLAG != 0;

                let sender = if flags == 0 {
                    Some(&socket)
                } else {
                    match change {
                        ChangeReplies::Ignore => None,
                        ChangeReplies::FromPrimary => Some(&socket),
                        ChangeReplies::PortOnly if change_ip => None,
                        ChangeReplies::PortOnly => Some(&other_port),
                        ChangeReplies::Full if change_ip => other_ip.as_ref(),
                        ChangeReplies::Full => Some(&other_port),
                    }
                };

                let reply = build_binding_response(&buf[8..20], mapped.unwrap_or(from));
                if let Some(sender) = sender {
                    let _ = sender.send_to(&reply, from).await;
                }
            }
        });

        addr
    }
}
