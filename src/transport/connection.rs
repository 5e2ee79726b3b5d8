/**
 * transport/connection.rs
 *
 * Connection handles: how a table entry sends, and where its receive
 * loop reads from
 */

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

use super::types::{ConnectionId, ConnectionInfo, ConnectionState, Role};

/// Outbound half of a connection
#[derive(Debug, Clone)]
pub(crate) enum Link {
    /// Own socket, connected to the peer
    Dialed(Arc<UdpSocket>),
    /// Shares the listener socket; replies go to the peer address
    Accepted(Arc<UdpSocket>),
}

impl Link {
    pub(crate) async fn send(&self, peer: SocketAddr, bytes: &[u8]) -> io::Result<usize> {
        match self {
            Link::Dialed(socket) => socket.send(bytes).await,
            Link::Accepted(socket) => socket.send_to(bytes, peer).await,
        }
    }
}

/// Inbound half of a connection, owned by its receive loop
pub(crate) enum Inbound {
    Socket(Arc<UdpSocket>),
    /// Datagrams routed by the listener demultiplexer
    Inbox(mpsc::Receiver<Vec<u8>>),
}

impl Inbound {
    /// Next datagram. An empty datagram means the peer closed; a closed
    /// inbox reads as one too.
    pub(crate) async fn recv(&mut self, buffer: &mut [u8]) -> io::Result<Vec<u8>> {
        match self {
            Inbound::Socket(socket) => {
                let len = socket.recv(buffer).await?;
                Ok(buffer[..len].to_vec())
            }
            Inbound::Inbox(inbox) => Ok(inbox.recv().await.unwrap_or_default()),
        }
    }
}

/// Connection table entry
pub(crate) struct ConnectionEntry {
    pub info: ConnectionInfo,
    pub link: Link,
    /// Inbox feeding the receive loop of an accepted connection
    pub inbox: Option<mpsc::Sender<Vec<u8>>>,
    pub cancel: watch::Sender<bool>,
}

impl ConnectionEntry {
    pub(crate) fn new(
        role: Role,
        peer: SocketAddr,
        link: Link,
        inbox: Option<mpsc::Sender<Vec<u8>>>,
    ) -> (Self, watch::Receiver<bool>) {
        let (cancel, cancelled) = watch::channel(false);
        let entry = Self {
            info: ConnectionInfo {
                id: ConnectionId::new_v4(),
                role,
                peer,
                state: ConnectionState::Setup,
                last_error: None,
                created_at: Utc::now(),
            },
            link,
            inbox,
            cancel,
        };
        (entry, cancelled)
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.info.id
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.info.state == ConnectionState::Ready
    }

    /// Signal the receive loop; it exits at its next read boundary
    pub(crate) fn cancel(&mut self) {
        self.info.state = ConnectionState::Cancelled;
        let _ = self.cancel.send(true);
        self.inbox = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closed_inbox_reads_as_peer_close() {
        let (tx, rx) = mpsc::channel(4);
        let mut inbound = Inbound::Inbox(rx);
        tx.send(b"one".to_vec()).await.unwrap();
        drop(tx);

        let mut buffer = [0u8; 16];
        assert_eq!(inbound.recv(&mut buffer).await.unwrap(), b"one");
        assert!(inbound.recv(&mut buffer).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_marks_entry_and_signals_loop() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer = socket.local_addr().unwrap();
        let (mut entry, mut cancelled) =
            ConnectionEntry::new(Role::Dialer, peer, Link::Dialed(socket), None);
        assert_eq!(entry.info.state, ConnectionState::Setup);

        entry.cancel();
        cancelled.changed().await.unwrap();
        assert!(*cancelled.borrow());
        assert_eq!(entry.info.state, ConnectionState::Cancelled);
    }
}
