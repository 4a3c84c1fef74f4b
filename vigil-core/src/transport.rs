use std::net::SocketAddr;

use async_trait::async_trait;
use serde::Serialize;
use tokio::net::UdpSocket;
use tracing::trace;

use crate::error::ClusterError;
use crate::gossip::GossipMessage;

/// Largest payload a single UDP datagram can carry over IPv4.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Number of bytes `value` occupies on the wire.
pub fn encoded_len<T: Serialize + ?Sized>(value: &T) -> Result<usize, ClusterError> {
    let len = bincode::serialized_size(value)
        .map_err(|err| ClusterError::Serialization(err.to_string()))?;
    usize::try_from(len).map_err(|_| ClusterError::MessageTooLarge(usize::MAX))
}

/// Best-effort, unordered, at-most-once message delivery between peers.
///
/// Framing, encoding and integrity checks live behind this seam; the core only ever sees
/// decoded [`GossipMessage`] values.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `message` to `addr`. Delivery is not guaranteed.
    async fn send(&self, message: &GossipMessage, addr: SocketAddr) -> Result<(), ClusterError>;

    /// Waits for the next inbound message.
    async fn recv(&self) -> Result<(GossipMessage, SocketAddr), ClusterError>;

    /// Address peers should use to reach this transport.
    fn local_addr(&self) -> Result<SocketAddr, ClusterError>;

    /// Releases any per-peer resources held for `addr`.
    fn release(&self, _addr: SocketAddr) {}
}

/// Gossip over UDP: one bincode-encoded [`GossipMessage`] per datagram, bounded by
/// `max_message_size` in both directions.
pub struct UdpTransport {
    socket: UdpSocket,
    max_message_size: usize,
}

impl UdpTransport {
    /// Binds `bind_addr` with the given datagram budget, clamped to [`MAX_DATAGRAM_SIZE`].
    pub async fn bind(bind_addr: SocketAddr, max_message_size: usize) -> Result<Self, ClusterError> {
        Ok(Self {
            socket: UdpSocket::bind(bind_addr).await?,
            max_message_size: max_message_size.min(MAX_DATAGRAM_SIZE),
        })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, message: &GossipMessage, addr: SocketAddr) -> Result<(), ClusterError> {
        let len = encoded_len(message)?;
        if len > self.max_message_size {
            return Err(ClusterError::MessageTooLarge(len));
        }
        let payload =
            bincode::serialize(message).map_err(|err| ClusterError::Serialization(err.to_string()))?;
        self.socket.send_to(&payload, addr).await?;
        trace!(%addr, bytes = len, digests = message.digests().len(), "gossip datagram sent");
        Ok(())
    }

    async fn recv(&self) -> Result<(GossipMessage, SocketAddr), ClusterError> {
        // One spare byte exposes datagrams the socket had to truncate.
        let mut buf = vec![0u8; self.max_message_size + 1];
        let (len, addr) = self.socket.recv_from(&mut buf).await?;
        if len > self.max_message_size {
            return Err(ClusterError::MessageTooLarge(len));
        }
        let message = bincode::deserialize(&buf[..len])
            .map_err(|err| ClusterError::Serialization(err.to_string()))?;
        Ok((message, addr))
    }

    fn local_addr(&self) -> Result<SocketAddr, ClusterError> {
        Ok(self.socket.local_addr()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    #[tokio::test]
    async fn round_trips_a_datagram() {
        let a = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), 1_400).await.unwrap();
        let b = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), 1_400).await.unwrap();
        let message = GossipMessage::Syn {
            from: Identity::new(1, 1, 1),
            digests: Vec::new(),
        };
        a.send(&message, b.local_addr().unwrap()).await.unwrap();
        let (received, from) = b.recv().await.unwrap();
        assert_eq!(received, message);
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[tokio::test]
    async fn oversized_payloads_are_refused() {
        let a = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), 8).await.unwrap();
        let message = GossipMessage::Syn {
            from: Identity::new(1, 1, 1),
            digests: Vec::new(),
        };
        let target = a.local_addr().unwrap();
        assert!(matches!(
            a.send(&message, target).await,
            Err(ClusterError::MessageTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn truncated_datagrams_are_refused() {
        let small = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), 16).await.unwrap();
        let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(&[0u8; 64], small.local_addr().unwrap())
            .await
            .unwrap();
        assert!(matches!(
            small.recv().await,
            Err(ClusterError::MessageTooLarge(_))
        ));
    }

    #[test]
    fn encoded_len_matches_serialization() {
        let message = GossipMessage::Ack {
            from: Identity::new(1, 2, 3),
            digests: Vec::new(),
        };
        assert_eq!(
            encoded_len(&message).unwrap(),
            bincode::serialize(&message).unwrap().len()
        );
    }
}
