/**
 * nat_traversal/mod.rs
 *
 * NAT traversal module implementing:
 * - STUN client and NAT type classification
 * - Hole punching sessions and direct UDP connection attempts
 * - Punch listener handing accepted peers to the caller
 */

mod hole_punching;
mod stun;
mod types;

pub use hole_punching::{ProbeKind, ProbePacket, UdpHolePuncher};
pub use stun::{local_ip_towards, resolve_server, StunClient, StunResponse};
pub use types::{
    DiscoveredDevice, Endpoint, HolePunchingSession, NatResult, NatTraversalConfig,
    NatTraversalError, NatType, TraversalState, TraversalStatistics, DEFAULT_STUN_SERVERS,
};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Queue depth for accepted peers waiting on the caller
const INCOMING_QUEUE: usize = 64;

/// Upper bound on STUN round trips in one detection cycle
const MAX_DETECTION_STEPS: u32 = 6;

/// Peers the listener remembers before evicting the oldest
const MAX_RECENT_PEERS: usize = 1024;

/// Hole-punched UDP path to a peer
#[derive(Debug, Clone)]
pub struct DirectConnection {
    pub session_id: Uuid,
    pub device_id: String,
    pub peer: SocketAddr,
    /// Connected to `peer`
    pub socket: Arc<UdpSocket>,
}

/// Peer that punched through to our listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingPeer {
    pub addr: SocketAddr,
    pub accepted_at: DateTime<Utc>,
}

struct Detection {
    nat_type: NatType,
    public_endpoint: Option<SocketAddr>,
}

struct SessionEntry {
    session: HolePunchingSession,
    cancel: watch::Sender<bool>,
}

struct Listener {
    local_addr: SocketAddr,
    socket: Arc<UdpSocket>,
    task: JoinHandle<()>,
}

impl Listener {
    fn spawn(
        socket: Arc<UdpSocket>,
        incoming: mpsc::Sender<IncomingPeer>,
        linger: Duration,
    ) -> NatResult<Self> {
        let local_addr = socket.local_addr()?;
        let task = tokio::spawn(accept_loop(Arc::clone(&socket), incoming, linger));
        Ok(Self {
            local_addr,
            socket,
            task,
        })
    }

    /// Stop the accept loop and wait until it has released the socket
    async fn halt(&mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
    }

    fn resume(&mut self, incoming: mpsc::Sender<IncomingPeer>, linger: Duration) {
        self.task = tokio::spawn(accept_loop(Arc::clone(&self.socket), incoming, linger));
    }
}

/// NAT traversal manager
pub struct NatTraversalManager {
    config: NatTraversalConfig,
    state: RwLock<TraversalState>,
    detection: RwLock<Detection>,
    sessions: Mutex<HashMap<Uuid, SessionEntry>>,
    statistics: Mutex<TraversalStatistics>,
    listener: Mutex<Option<Listener>>,
    /// Socket the last detection ran on, while nothing else owns it
    prepared: Mutex<Option<Arc<UdpSocket>>>,
    incoming_tx: mpsc::Sender<IncomingPeer>,
    incoming_rx: Mutex<Option<mpsc::Receiver<IncomingPeer>>>,
}

impl NatTraversalManager {
    /// Create a new NAT traversal manager
    pub fn new(config: NatTraversalConfig) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE);
        Self {
            config,
            state: RwLock::new(TraversalState::Idle),
            detection: RwLock::new(Detection {
                nat_type: NatType::Unknown,
                public_endpoint: None,
            }),
            sessions: Mutex::new(HashMap::new()),
            statistics: Mutex::new(TraversalStatistics::default()),
            listener: Mutex::new(None),
            prepared: Mutex::new(None),
            incoming_tx,
            incoming_rx: Mutex::new(Some(incoming_rx)),
        }
    }

    pub fn config(&self) -> &NatTraversalConfig {
        &self.config
    }

    pub async fn state(&self) -> TraversalState {
        self.state.read().await.clone()
    }

    /// Classify the local NAT. Never fails: any error or timeout yields
    /// `NatType::Unknown`. The result and public endpoint are cached.
    ///
    /// Runs over the listener's socket when listening (pausing its accept
    /// loop), otherwise over a socket that is kept afterwards so the next
    /// listener or punch reuses the learned mapping.
    pub async fn detect_nat_type(&self) -> NatType {
        *self.state.write().await = TraversalState::Detecting;
        info!("Detecting NAT type");

        let mut listener = self.listener.lock().await;
        let existing = match listener.as_mut() {
            Some(running) => {
                running.halt().await;
                Some(Arc::clone(&running.socket))
            }
            None => self.prepared.lock().await.take(),
        };
        let client = match existing {
            Some(socket) => Ok(StunClient::with_socket(socket, self.config.stun_timeout)),
            None => StunClient::bind(self.config.local_port, self.config.stun_timeout).await,
        };

        let (nat_type, public_endpoint) = match client {
            Ok(client) => {
                let result = self.classify_within_budget(&client).await;
                match listener.as_mut() {
                    Some(running) => {
                        running.resume(self.incoming_tx.clone(), self.config.punch_timeout)
                    }
                    None => *self.prepared.lock().await = Some(client.into_socket()),
                }
                result
            }
            Err(e) => {
                warn!("NAT detection could not bind: {}", e);
                (NatType::Unknown, None)
            }
        };
        drop(listener);

        {
            let mut detection = self.detection.write().await;
            detection.nat_type = nat_type;
            detection.public_endpoint = public_endpoint;
        }
        *self.state.write().await = TraversalState::Idle;

        info!("NAT type: {:?}, public endpoint: {:?}", nat_type, public_endpoint);
        nat_type
    }

    /// Last detected NAT type
    pub async fn nat_type(&self) -> NatType {
        self.detection.read().await.nat_type
    }

    /// Last learned public endpoint
    pub async fn public_endpoint(&self) -> Option<SocketAddr> {
        self.detection.read().await.public_endpoint
    }

    async fn classify_within_budget(&self, client: &StunClient) -> (NatType, Option<SocketAddr>) {
        let budget = self.config.stun_timeout * MAX_DETECTION_STEPS;
        match timeout(budget, self.classify(client)).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!("NAT detection failed: {}", e);
                (NatType::Unknown, None)
            }
            Err(_) => {
                warn!("NAT detection timed out after {:?}", budget);
                (NatType::Unknown, None)
            }
        }
    }

    async fn classify(&self, client: &StunClient) -> NatResult<(NatType, Option<SocketAddr>)> {
        let mut servers = Vec::new();
        for server in &self.config.stun_servers {
            match resolve_server(server, self.config.stun_timeout).await {
                Ok(addr) => servers.push(addr),
                Err(e) => debug!("Skipping STUN server {}: {}", server, e),
            }
        }
        if servers.is_empty() {
            return Err(NatTraversalError::NoEndpointsAvailable("STUN reflectors".into()));
        }

        // Test I: first reflector that answers
        let mut primary = None;
        for (index, server) in servers.iter().enumerate() {
            match client.query(*server).await {
                Ok(response) => {
                    primary = Some((index, *server, response));
                    break;
                }
                Err(e) => debug!("STUN server {} did not answer: {}", server, e),
            }
        }
        let Some((index, server, first)) = primary else {
            return Ok((NatType::Unknown, None));
        };
        let mapped = first.mapped_address;

        let local_port = client.local_addr()?.port();
        let local_ip = local_ip_towards(server).await?;
        if mapped == SocketAddr::new(local_ip, local_port) {
            return Ok((NatType::NoNat, Some(mapped)));
        }

        // Test I against a second reflector: a different mapping means the
        // NAT allocates per destination
        let alternate = first
            .other_address
            .filter(|addr| *addr != server)
            .or_else(|| servers.get(index + 1).copied());
        if let Some(alternate) = alternate {
            match client.query(alternate).await {
                Ok(response) if response.mapped_address != mapped => {
                    debug!(
                        "Mapping changed between reflectors: {} vs {}",
                        mapped, response.mapped_address
                    );
                    return Ok((NatType::Symmetric, Some(mapped)));
                }
                Ok(_) => {}
                Err(e) => debug!("Alternate reflector {} did not answer: {}", alternate, e),
            }
        }

        // Test II: reply from another IP and port. A reply from the
        // reflector's own address means it ignored CHANGE-REQUEST.
        match client.query_with_change(server, true, true).await {
            Ok((_, source)) if source.ip() != server.ip() => {
                return Ok((NatType::FullCone, Some(mapped)));
            }
            Ok((_, source)) => debug!("{} answered change request from {}", server, source),
            Err(e) => debug!("Test II: {}", e),
        }

        // Test III: reply from another port only
        match client.query_with_change(server, false, true).await {
            Ok((_, source)) if source.ip() == server.ip() && source.port() != server.port() => {
                return Ok((NatType::RestrictedCone, Some(mapped)));
            }
            Ok((_, source)) => debug!("{} answered port change from {}", server, source),
            Err(e) => debug!("Test III: {}", e),
        }

        // Nothing proved looser filtering
        Ok((NatType::PortRestrictedCone, Some(mapped)))
    }

    /// Open a session for `device`, superseding any previous session for
    /// the same device id
    pub async fn create_session(&self, device: DiscoveredDevice) -> HolePunchingSession {
        let session = HolePunchingSession::new(device);
        let (cancel, _) = watch::channel(false);

        let mut sessions = self.sessions.lock().await;
        let superseded: Vec<Uuid> = sessions
            .iter()
            .filter(|(_, e)| e.session.target.device_id == session.target.device_id)
            .map(|(id, _)| *id)
            .collect();
        for id in superseded {
            if let Some(old) = sessions.remove(&id) {
                let _ = old.cancel.send(true);
                debug!("Session {} superseded by {}", id, session.session_id);
            }
        }

        sessions.insert(
            session.session_id,
            SessionEntry {
                session: session.clone(),
                cancel,
            },
        );
        *self.state.write().await = TraversalState::Idle;
        session
    }

    /// Snapshot of a live session
    pub async fn session(&self, session_id: Uuid) -> Option<HolePunchingSession> {
        self.sessions
            .lock()
            .await
            .get(&session_id)
            .map(|entry| entry.session.clone())
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Punch a direct UDP path to the session's target device
    pub async fn perform_direct_connection(&self, session_id: Uuid) -> NatResult<DirectConnection> {
        let (target, mut cancel) = {
            let mut sessions = self.sessions.lock().await;
            let entry = sessions
                .get_mut(&session_id)
                .ok_or(NatTraversalError::SessionNotFound(session_id))?;
            entry.session.state = TraversalState::Connecting;
            (entry.session.target.clone(), entry.cancel.subscribe())
        };
        *self.state.write().await = TraversalState::Connecting;
        self.statistics.lock().await.last_attempt_at = Some(Utc::now());

        let result = self.connect_to(&target, &mut cancel).await;

        let state = match &result {
            Ok(_) => TraversalState::Connected,
            Err(e) => TraversalState::Failed(e.to_string()),
        };
        {
            let mut statistics = self.statistics.lock().await;
            match &result {
                Ok(_) => statistics.successful_connections += 1,
                Err(NatTraversalError::ConnectionCancelled) => {}
                Err(_) => statistics.failed_connections += 1,
            }
        }
        // Completed sessions leave the table
        self.sessions.lock().await.remove(&session_id);
        *self.state.write().await = state;

        let (peer, socket) = result?;
        info!("Direct connection to {} via {}", target.device_id, peer);
        Ok(DirectConnection {
            session_id,
            device_id: target.device_id,
            peer,
            socket,
        })
    }

    async fn connect_to(
        &self,
        target: &DiscoveredDevice,
        cancel: &mut watch::Receiver<bool>,
    ) -> NatResult<(SocketAddr, Arc<UdpSocket>)> {
        if target.endpoints.is_empty() {
            return Err(NatTraversalError::NoEndpointsAvailable(target.device_id.clone()));
        }
        let endpoints = target
            .endpoints
            .iter()
            .map(|raw| Endpoint::parse(raw))
            .collect::<NatResult<Vec<_>>>()?;

        let mut addrs = Vec::new();
        for endpoint in &endpoints {
            let lookup = tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port));
            match timeout(self.config.stun_timeout, lookup).await {
                Ok(Ok(resolved)) => addrs.extend(resolved.filter(|a| a.is_ipv4())),
                Ok(Err(e)) => debug!("Could not resolve {}: {}", endpoint, e),
                Err(_) => debug!("Resolving {} timed out", endpoint),
            }
        }
        if addrs.is_empty() {
            return Err(NatTraversalError::ConnectionFailed(format!(
                "no endpoint of {} resolved",
                target.device_id
            )));
        }

        // Punch from the socket detection learned the mapping on, if free
        let prepared = self.prepared.lock().await.take();
        let reused = prepared.is_some();
        let puncher = match prepared {
            Some(socket) => UdpHolePuncher::new(socket),
            None => UdpHolePuncher::bind(0).await?,
        };
        debug!("Punching from {}", puncher.local_addr()?);

        let nonce = rand::random::<u64>();
        let punched = puncher
            .punch(
                &addrs,
                nonce,
                self.config.punch_interval,
                self.config.punch_timeout,
                cancel,
            )
            .await;
        let peer = match punched {
            Ok(peer) => peer,
            Err(e) => {
                if reused {
                    let mut slot = self.prepared.lock().await;
                    if slot.is_none() {
                        *slot = Some(puncher.socket());
                    }
                }
                return Err(match e {
                    NatTraversalError::ConnectionCancelled => e,
                    other => NatTraversalError::ConnectionFailed(other.to_string()),
                });
            }
        };

        let socket = puncher.socket();
        socket
            .connect(peer)
            .await
            .map_err(|e| NatTraversalError::ConnectionFailed(e.to_string()))?;
        Ok((peer, socket))
    }

    /// Cancel an in-flight or pending session
    pub async fn cancel(&self, session_id: Uuid) -> NatResult<()> {
        let entry = self
            .sessions
            .lock()
            .await
            .remove(&session_id)
            .ok_or(NatTraversalError::SessionNotFound(session_id))?;
        let _ = entry.cancel.send(true);
        debug!("Session {} cancelled", session_id);
        Ok(())
    }

    /// Start the punch listener. A second call while running is a no-op
    /// returning the bound address. Takes over the detection socket when
    /// there is one.
    pub async fn start_listener(&self) -> NatResult<SocketAddr> {
        let mut listener = self.listener.lock().await;
        if let Some(running) = listener.as_ref() {
            debug!("Punch listener already running on {}", running.local_addr);
            return Ok(running.local_addr);
        }

        let socket = match self.prepared.lock().await.take() {
            Some(socket) => socket,
            None => Arc::new(
                UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], self.config.local_port))).await?,
            ),
        };
        let running = Listener::spawn(socket, self.incoming_tx.clone(), self.config.punch_timeout)?;
        let local_addr = running.local_addr;

        info!("Punch listener started on {}", local_addr);
        *listener = Some(running);
        Ok(local_addr)
    }

    /// Stop the punch listener; no-op when not listening. Returns once the
    /// port is released.
    pub async fn stop_listener(&self) {
        let stopped = self.listener.lock().await.take();
        if let Some(mut running) = stopped {
            running.halt().await;
            info!("Punch listener on {} stopped", running.local_addr);
        }
    }

    pub async fn listener_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().await.as_ref().map(|l| l.local_addr)
    }

    /// Receiver for peers accepted by the listener. Only the first caller
    /// gets it.
    pub async fn take_incoming(&self) -> Option<mpsc::Receiver<IncomingPeer>> {
        self.incoming_rx.lock().await.take()
    }

    pub async fn statistics(&self) -> TraversalStatistics {
        self.statistics.lock().await.clone()
    }

    /// Reinitialize: cancel sessions, stop listening, forget detection
    /// results and zero the counters
    pub async fn reset(&self) {
        for (_, entry) in self.sessions.lock().await.drain() {
            let _ = entry.cancel.send(true);
        }
        self.stop_listener().await;
        self.prepared.lock().await.take();
        {
            let mut detection = self.detection.write().await;
            detection.nat_type = NatType::Unknown;
            detection.public_endpoint = None;
        }
        *self.statistics.lock().await = TraversalStatistics::default();
        *self.state.write().await = TraversalState::Idle;
        info!("NAT traversal manager reset");
    }
}

impl Drop for NatTraversalManager {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.task.abort();
        }
    }
}

/// Peers announced recently, forgotten once they go quiet for `linger`
struct RecentPeers {
    linger: Duration,
    last_seen: HashMap<SocketAddr, Instant>,
}

impl RecentPeers {
    fn new(linger: Duration) -> Self {
        Self {
            linger,
            last_seen: HashMap::new(),
        }
    }

    /// True when `addr` is new to the window
    fn admit(&mut self, addr: SocketAddr, now: Instant) -> bool {
        let linger = self.linger;
        self.last_seen
            .retain(|_, last| now.saturating_duration_since(*last) < linger);

        if let Some(last) = self.last_seen.get_mut(&addr) {
            *last = now;
            return false;
        }

        if self.last_seen.len() >= MAX_RECENT_PEERS {
            let oldest = self
                .last_seen
                .iter()
                .min_by_key(|(_, last)| **last)
                .map(|(addr, _)| *addr);
            if let Some(oldest) = oldest {
                self.last_seen.remove(&oldest);
            }
        }
        self.last_seen.insert(addr, now);
        true
    }

    fn len(&self) -> usize {
        self.last_seen.len()
    }
}

/// Ack punches and announce each new peer without waiting on the consumer
async fn accept_loop(
    socket: Arc<UdpSocket>,
    incoming: mpsc::Sender<IncomingPeer>,
    linger: Duration,
) {
    let mut recent = RecentPeers::new(linger);
    let mut buffer = [0u8; 64];

    loop {
        let (len, from) = match socket.recv_from(&mut buffer).await {
            Ok(r) => r,
            Err(e) => {
                warn!("Punch listener receive error: {}", e);
                continue;
            }
        };

        let probe = match ProbePacket::from_bytes(&buffer[..len]) {
            Ok(probe) if probe.kind == ProbeKind::Punch => probe,
            _ => continue,
        };
        if let Err(e) = socket.send_to(&probe.ack_for().to_bytes(), from).await {
            debug!("Ack to {} failed: {}", from, e);
            continue;
        }

        if recent.admit(from, Instant::now()) {
            trace!("{} peers in the announce window", recent.len());
            let peer = IncomingPeer {
                addr: from,
                accepted_at: Utc::now(),
            };
            if let Err(e) = incoming.try_send(peer) {
                warn!("Dropping incoming peer {}: {}", from, e);
            }
        }
    }
}
