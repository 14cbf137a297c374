use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::net::UdpSocket;
use tracing::error;

/// Seam between the session engine and the actual network. The engine only
/// ever sends towards a single peer; errors are logged and swallowed because a
/// lost datagram is indistinguishable from a send failure at this layer and is
/// handled by retransmission anyway.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSink: Send + Sync + 'static {
    async fn send_datagram(&self, buf: &[u8]);
}

/// production impl: a shared UDP socket with a fixed peer address
pub struct PeerSink {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl PeerSink {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        PeerSink { socket, peer }
    }
}

#[async_trait]
impl DatagramSink for PeerSink {
    async fn send_datagram(&self, buf: &[u8]) {
        if let Err(e) = self.socket.send_to(buf, self.peer).await {
            error!("error sending datagram to {}: {}", self.peer, e);
        }
    }
}
