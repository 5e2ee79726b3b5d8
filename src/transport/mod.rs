/**
 * transport/mod.rs
 *
 * P2P transport session manager:
 * - Listener socket with port fallback and per-peer demultiplexing
 * - Dialed connections, one receive loop per connection
 * - Connection table and aggregate service state behind one lock
 * - Single dispatcher task delivering decoded events to the handler
 */

mod binding;
mod connection;
mod events;
mod types;

pub use events::AppEvent;
pub use types::{
    ConnectionId, ConnectionInfo, ConnectionState, Role, ServiceState, TransportConfig,
    TransportError, TransportResult, DEFAULT_LISTEN_PORT, MAX_DATAGRAM_SIZE, PORT_FALLBACK_SPAN,
};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::nat_traversal::{DirectConnection, ProbeKind, ProbePacket};
use connection::{ConnectionEntry, Inbound, Link};

/// Receives every decoded event, always from the same dispatcher task
pub type EventHandler = Arc<dyn Fn(ConnectionId, AppEvent) + Send + Sync>;

struct ListenerHandle {
    port: u16,
    socket: Arc<UdpSocket>,
    task: JoinHandle<()>,
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Table {
    role: Option<Role>,
    listener: Option<ListenerHandle>,
    connections: HashMap<ConnectionId, ConnectionEntry>,
    by_peer: HashMap<SocketAddr, ConnectionId>,
    state: ServiceState,
}

impl Table {
    fn new() -> Self {
        Self {
            role: None,
            listener: None,
            connections: HashMap::new(),
            by_peer: HashMap::new(),
            state: ServiceState::Idle,
        }
    }

    fn idle_state(&self) -> ServiceState {
        match &self.listener {
            Some(listener) => ServiceState::Listening(listener.port),
            None => ServiceState::Idle,
        }
    }

    /// Recompute the aggregate after a transition. `Failed` is only left
    /// when the table empties.
    fn recompute(&mut self) {
        let next = if self.connections.is_empty() {
            self.idle_state()
        } else if matches!(self.state, ServiceState::Failed(_)) {
            return;
        } else if self.connections.values().any(ConnectionEntry::is_ready) {
            ServiceState::Connected
        } else {
            self.idle_state()
        };

        if next != self.state {
            debug!("Service state {} -> {}", self.state, next);
            self.state = next;
        }
    }

    fn insert(&mut self, entry: ConnectionEntry) {
        self.by_peer.insert(entry.info.peer, entry.id());
        self.connections.insert(entry.id(), entry);
    }

    fn mark_ready(&mut self, id: ConnectionId) {
        if let Some(entry) = self.connections.get_mut(&id) {
            if entry.info.state == ConnectionState::Setup {
                entry.info.state = ConnectionState::Ready;
                info!("Connection {} to {} ready", id, entry.info.peer);
            }
        }
        self.recompute();
    }

    fn remove(&mut self, id: ConnectionId) -> Option<ConnectionEntry> {
        let mut entry = self.connections.remove(&id)?;
        if self.by_peer.get(&entry.info.peer) == Some(&id) {
            self.by_peer.remove(&entry.info.peer);
        }
        entry.cancel();
        self.recompute();
        Some(entry)
    }
}

struct Delivery {
    connection: ConnectionId,
    event: AppEvent,
}

struct Inner {
    config: TransportConfig,
    table: Mutex<Table>,
    dispatch: RwLock<Option<mpsc::UnboundedSender<Delivery>>>,
}

/// Single owner of every UDP connection in the process
pub struct TransportManager {
    inner: Arc<Inner>,
}

impl TransportManager {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                table: Mutex::new(Table::new()),
                dispatch: RwLock::new(None),
            }),
        }
    }

    /// Register the event handler, replacing any previous one. Events are
    /// delivered in arrival order from one dispatcher task.
    pub async fn set_event_handler(&self, handler: EventHandler) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                handler(delivery.connection, delivery.event);
            }
        });
        // Dropping the old sender ends the old dispatcher
        *self.inner.dispatch.write().await = Some(tx);
    }

    /// Tear down any prior session, then start in `role`. Listeners bind
    /// `listen_port` (or the configured port) with fallback.
    pub async fn start(&self, role: Role, listen_port: Option<u16>) -> TransportResult<()> {
        let mut table = self.inner.table.lock().await;
        teardown(&mut table).await;
        table.role = Some(role);

        if role == Role::Listener {
            let requested = listen_port.unwrap_or(self.inner.config.listen_port);
            let (socket, port) =
                match binding::bind_with_fallback(requested, self.inner.config.port_fallback_span) {
                    Ok(bound) => bound,
                    Err(e) => {
                        error!("Listener failed to start: {}", e);
                        table.state = ServiceState::Failed(e.to_string());
                        return Err(e);
                    }
                };

            let socket = Arc::new(socket);
            let task = tokio::spawn(listen_loop(
                Arc::downgrade(&self.inner),
                Arc::clone(&socket),
                self.inner.config.max_datagram_size,
            ));
            table.listener = Some(ListenerHandle { port, socket, task });
            info!("Transport listening on port {}", port);
        } else {
            info!("Transport started as dialer");
        }

        table.state = table.idle_state();
        Ok(())
    }

    /// Dial `peer` from an ephemeral local port
    pub async fn connect(&self, peer: SocketAddr) -> TransportResult<ConnectionId> {
        let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0))).await?;
        socket.connect(peer).await?;
        Ok(self.register_dialed(peer, Arc::new(socket)).await)
    }

    /// Adopt a socket punched by the NAT traversal manager
    pub async fn adopt(&self, direct: DirectConnection) -> ConnectionId {
        debug!("Adopting direct connection to {}", direct.device_id);
        self.register_dialed(direct.peer, direct.socket).await
    }

    async fn register_dialed(&self, peer: SocketAddr, socket: Arc<UdpSocket>) -> ConnectionId {
        let (entry, cancelled) =
            ConnectionEntry::new(Role::Dialer, peer, Link::Dialed(Arc::clone(&socket)), None);
        let id = entry.id();
        tokio::spawn(receive_loop(
            Arc::downgrade(&self.inner),
            id,
            Inbound::Socket(socket),
            cancelled,
            self.inner.config.max_datagram_size,
        ));

        let mut table = self.inner.table.lock().await;
        table.insert(entry);
        table.mark_ready(id);
        id
    }

    /// Send one event as one datagram
    pub async fn send(&self, event: &AppEvent, connection: ConnectionId) -> TransportResult<()> {
        let (link, peer) = {
            let table = self.inner.table.lock().await;
            let entry = table
                .connections
                .get(&connection)
                .ok_or(TransportError::ConnectionNotFound(connection))?;
            (entry.link.clone(), entry.info.peer)
        };

        let bytes = event.encode()?;
        let max = self.inner.config.max_datagram_size;
        if bytes.len() > max {
            return Err(TransportError::Oversized {
                len: bytes.len(),
                max,
            });
        }

        link.send(peer, &bytes).await.map_err(TransportError::Send)?;
        debug!("Sent {} to {}", event.kind(), peer);
        Ok(())
    }

    /// Close a connection: notify the peer, cancel the receive loop and
    /// drop the entry
    pub async fn disconnect(&self, connection: ConnectionId) -> TransportResult<()> {
        let mut table = self.inner.table.lock().await;
        let entry = table
            .remove(connection)
            .ok_or(TransportError::ConnectionNotFound(connection))?;

        if let Err(e) = entry.link.send(entry.info.peer, &[]).await {
            debug!("Close signal to {} failed: {}", entry.info.peer, e);
        }
        info!("Disconnected {} ({})", connection, entry.info.peer);
        Ok(())
    }

    /// Cancel the listener and every connection; state returns to idle
    pub async fn stop(&self) {
        let mut table = self.inner.table.lock().await;
        teardown(&mut table).await;
        info!("Transport stopped");
    }

    pub async fn state(&self) -> ServiceState {
        self.inner.table.lock().await.state.clone()
    }

    pub async fn role(&self) -> Option<Role> {
        self.inner.table.lock().await.role
    }

    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        let table = self.inner.table.lock().await;
        let mut infos: Vec<_> = table.connections.values().map(|e| e.info.clone()).collect();
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    pub async fn connection(&self, connection: ConnectionId) -> Option<ConnectionInfo> {
        let table = self.inner.table.lock().await;
        table.connections.get(&connection).map(|e| e.info.clone())
    }

    /// Port the listener is bound to
    pub async fn local_port(&self) -> TransportResult<u16> {
        let table = self.inner.table.lock().await;
        let listener = table.listener.as_ref().ok_or(TransportError::NotListening)?;
        Ok(listener.socket.local_addr()?.port())
    }
}

/// Cancel the listener and drop every connection, leaving an idle table
async fn teardown(table: &mut Table) {
    if let Some(mut listener) = table.listener.take() {
        listener.task.abort();
        // Wait for the task to drop its socket so the port is free again
        let _ = (&mut listener.task).await;
        debug!("Listener on port {} cancelled", listener.port);
    }

    let ids: Vec<_> = table.connections.keys().copied().collect();
    for id in ids {
        if let Some(entry) = table.remove(id) {
            if let Err(e) = entry.link.send(entry.info.peer, &[]).await {
                debug!("Close signal to {} failed: {}", entry.info.peer, e);
            }
        }
    }

    table.by_peer.clear();
    table.role = None;
    table.state = ServiceState::Idle;
}

impl Inner {
    async fn deliver(&self, connection: ConnectionId, event: AppEvent) {
        match self.dispatch.read().await.as_ref() {
            Some(tx) => {
                if tx.send(Delivery { connection, event }).is_err() {
                    warn!("Event dispatcher has stopped");
                }
            }
            None => debug!("No event handler registered, dropping {}", event.kind()),
        }
    }

    /// Peer-initiated close
    async fn closed_by_peer(&self, connection: ConnectionId) {
        if let Some(entry) = self.table.lock().await.remove(connection) {
            info!("Connection {} closed by {}", connection, entry.info.peer);
        }
    }

    /// Record a terminal read error; the entry stays for inspection
    async fn fail(&self, connection: ConnectionId, reason: String) {
        let mut table = self.table.lock().await;
        if let Some(entry) = table.connections.get_mut(&connection) {
            warn!("Connection {} to {} failed: {}", connection, entry.info.peer, reason);
            entry.info.state = ConnectionState::Failed(reason.clone());
            entry.info.last_error = Some(reason);
            entry.inbox = None;
        }
        table.recompute();
    }

    /// Route a listener datagram to its connection, creating one for a new
    /// peer. Never blocks on a slow connection.
    async fn route(self: &Arc<Self>, from: SocketAddr, datagram: Vec<u8>, socket: &Arc<UdpSocket>) {
        let mut table = self.table.lock().await;

        if let Some(id) = table.by_peer.get(&from).copied() {
            let inbox = table.connections.get(&id).and_then(|e| e.inbox.clone());
            match inbox {
                Some(inbox) => {
                    if let Err(e) = inbox.try_send(datagram) {
                        warn!("Dropping datagram from {}: {}", from, e);
                    }
                }
                None => debug!("Datagram from {} for inactive connection", from),
            }
            return;
        }

        if datagram.is_empty() {
            return;
        }

        let (inbox_tx, inbox_rx) = mpsc::channel(self.config.inbox_capacity.max(1));
        let (entry, cancelled) = ConnectionEntry::new(
            Role::Listener,
            from,
            Link::Accepted(Arc::clone(socket)),
            Some(inbox_tx.clone()),
        );
        let id = entry.id();
        let _ = inbox_tx.try_send(datagram);
        tokio::spawn(receive_loop(
            Arc::downgrade(self),
            id,
            Inbound::Inbox(inbox_rx),
            cancelled,
            self.config.max_datagram_size,
        ));

        info!("Accepted connection {} from {}", id, from);
        table.insert(entry);
        table.mark_ready(id);
    }
}

async fn listen_loop(inner: Weak<Inner>, socket: Arc<UdpSocket>, max_datagram: usize) {
    let mut buffer = vec![0u8; max_datagram];
    loop {
        let (len, from) = match socket.recv_from(&mut buffer).await {
            Ok(received) => received,
            Err(e) => {
                // Unconnected sockets can surface ICMP errors from old peers
                debug!("Listener receive error: {}", e);
                continue;
            }
        };
        let datagram = &buffer[..len];

        // Peers punching towards us get an ack and no connection entry
        if ProbePacket::looks_like_probe(datagram) {
            if let Ok(probe) = ProbePacket::from_bytes(datagram) {
                if probe.kind == ProbeKind::Punch {
                    let _ = socket.send_to(&probe.ack_for().to_bytes(), from).await;
                }
            }
            continue;
        }

        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.route(from, datagram.to_vec(), &socket).await;
    }
}

/// One per connection: decode datagrams until the peer closes, the read
/// fails, or the connection is cancelled
async fn receive_loop(
    inner: Weak<Inner>,
    connection: ConnectionId,
    mut inbound: Inbound,
    mut cancelled: watch::Receiver<bool>,
    max_datagram: usize,
) {
    let mut buffer = vec![0u8; max_datagram];
    loop {
        let received = tokio::select! {
            _ = cancelled.changed() => {
                debug!("Receive loop for {} cancelled", connection);
                return;
            }
            received = inbound.recv(&mut buffer) => received,
        };
        if *cancelled.borrow() {
            return;
        }
        let Some(inner) = inner.upgrade() else {
            return;
        };

        match received {
            Ok(datagram) if datagram.is_empty() => {
                inner.closed_by_peer(connection).await;
                return;
            }
            Ok(datagram) if ProbePacket::looks_like_probe(&datagram) => {
                debug!("Late punch probe on {}", connection);
            }
            Ok(datagram) => match AppEvent::decode(&datagram) {
                Ok(event) => {
                    debug!("Received {} on {}", event.kind(), connection);
                    inner.deliver(connection, event).await;
                }
                Err(e) => warn!("Skipping malformed event on {}: {}", connection, e),
            },
            Err(e) => {
                inner.fail(connection, TransportError::Receive(e).to_string()).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::binding::test_ports::{free_base, occupy_consecutive};
    use super::*;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    fn manager() -> TransportManager {
        TransportManager::new(TransportConfig::default())
    }

    async fn wait_until(
        transport: &TransportManager,
        check: impl Fn(&ServiceState, &[ConnectionInfo]) -> bool,
    ) {
        for _ in 0..100 {
            if check(&transport.state().await, &transport.connections().await) {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn restart_is_not_additive() {
        let transport = manager();
        let base = free_base();

        transport.start(Role::Listener, Some(base)).await.unwrap();
        transport.start(Role::Listener, Some(base)).await.unwrap();

        assert_eq!(transport.local_port().await.unwrap(), base);
        assert_eq!(transport.state().await, ServiceState::Listening(base));
    }

    #[tokio::test]
    async fn listener_falls_back_past_taken_port() {
        let (base, held) = occupy_consecutive(1);
        let transport = manager();
        transport.start(Role::Listener, Some(base)).await.unwrap();
        drop(held);

        let port = transport.local_port().await.unwrap();
        assert!(port > base && port < base + 16);
    }

    #[tokio::test]
    async fn exhausted_ports_fail_the_service() {
        let (base, held) = occupy_consecutive(16);
        let transport = manager();
        let err = transport.start(Role::Listener, Some(base)).await.unwrap_err();
        drop(held);

        assert!(matches!(err, TransportError::Bind { port, .. } if port == base + 15));
        assert!(matches!(transport.state().await, ServiceState::Failed(_)));
        assert!(matches!(transport.local_port().await, Err(TransportError::NotListening)));
    }

    #[tokio::test]
    async fn send_on_stale_connection() {
        let transport = manager();
        transport.start(Role::Dialer, None).await.unwrap();
        let stale = ConnectionId::new_v4();

        let err = transport.send(&AppEvent::KeepAlive, stale).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionNotFound(id) if id == stale));
        assert!(matches!(
            transport.disconnect(stale).await,
            Err(TransportError::ConnectionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn malformed_datagram_does_not_kill_the_connection() {
        let listener = manager();
        let (tx, mut rx) = mpsc::unbounded_channel();
        listener
            .set_event_handler(Arc::new(move |_, event| {
                let _ = tx.send(event);
            }))
            .await;
        listener.start(Role::Listener, Some(0)).await.unwrap();
        let port = listener.local_port().await.unwrap();

        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        raw.connect(("127.0.0.1", port)).await.unwrap();
        raw.send(b"{\"type\":\"nonsense\"}").await.unwrap();
        raw.send(&AppEvent::text("still here").encode().unwrap()).await.unwrap();

        let event = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(event, AppEvent::text("still here"));
        assert_eq!(listener.connections().await.len(), 1);
    }

    #[tokio::test]
    async fn dialer_state_follows_connections() {
        let listener = manager();
        listener.start(Role::Listener, Some(0)).await.unwrap();
        let port = listener.local_port().await.unwrap();

        let dialer = manager();
        dialer.start(Role::Dialer, None).await.unwrap();
        assert_eq!(dialer.state().await, ServiceState::Idle);

        let id = dialer.connect(([127, 0, 0, 1], port).into()).await.unwrap();
        assert_eq!(dialer.state().await, ServiceState::Connected);
        dialer.send(&AppEvent::KeepAlive, id).await.unwrap();
        wait_until(&listener, |state, _| *state == ServiceState::Connected).await;

        dialer.disconnect(id).await.unwrap();
        assert_eq!(dialer.state().await, ServiceState::Idle);
        wait_until(&listener, |_, connections| connections.is_empty()).await;
        assert_eq!(listener.state().await, ServiceState::Listening(port));
    }

    #[tokio::test]
    async fn stop_empties_the_table() {
        let listener = manager();
        listener.start(Role::Listener, Some(0)).await.unwrap();
        let port = listener.local_port().await.unwrap();

        let dialer = manager();
        dialer.start(Role::Dialer, None).await.unwrap();
        for _ in 0..3 {
            let id = dialer.connect(([127, 0, 0, 1], port).into()).await.unwrap();
            dialer.send(&AppEvent::KeepAlive, id).await.unwrap();
        }
        wait_until(&listener, |_, connections| connections.len() == 3).await;

        listener.stop().await;
        dialer.stop().await;
        assert!(listener.connections().await.is_empty());
        assert!(dialer.connections().await.is_empty());
        assert_eq!(listener.state().await, ServiceState::Idle);
        assert_eq!(dialer.state().await, ServiceState::Idle);
        assert_eq!(dialer.role().await, None);
    }
}
