//! A framed TCP connection handed from the connection provider to a peer.

use std::fmt;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use dscuss_shared::constants::IO_DEADLINE;
use dscuss_shared::Packet;

use crate::codec::PacketCodec;
use crate::error::{NetError, Result};

/// Who initiated the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We dialled.
    Active,
    /// We accepted.
    Passive,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Active => f.write_str("active"),
            Direction::Passive => f.write_str("passive"),
        }
    }
}

pub struct Connection {
    framed: Framed<TcpStream, PacketCodec>,
    direction: Direction,
    addresses: Vec<String>,
    release_tx: Option<mpsc::UnboundedSender<String>>,
    closed: bool,
}

impl Connection {
    /// Wrap `stream`. `remote` becomes the first associated address; every
    /// associated address is sent to `release_tx` when the connection closes.
    pub fn new(
        stream: TcpStream,
        direction: Direction,
        remote: String,
        release_tx: Option<mpsc::UnboundedSender<String>>,
    ) -> Self {
        Self {
            framed: Framed::new(stream, PacketCodec::new()),
            direction,
            addresses: vec![remote],
            release_tx,
            closed: false,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_active(&self) -> bool {
        self.direction == Direction::Active
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    pub fn remote_addr(&self) -> &str {
        self.addresses.first().map(String::as_str).unwrap_or("")
    }

    pub fn add_addresses(&mut self, addrs: Vec<String>) {
        for addr in addrs {
            if !self.addresses.contains(&addr) {
                self.addresses.push(addr);
            }
        }
    }

    /// Give up the associated addresses so that closing this connection
    /// releases nothing.
    pub fn take_addresses(&mut self) -> Vec<String> {
        std::mem::take(&mut self.addresses)
    }

    pub async fn write(&mut self, packet: Packet) -> Result<()> {
        tracing::debug!(addr = %self.remote_addr(), packet = %packet, "send");
        match tokio::time::timeout(IO_DEADLINE, self.framed.send(packet)).await {
            Ok(res) => res,
            Err(_) => Err(NetError::Timeout),
        }
    }

    /// Read one packet, waiting at most `deadline`.
    pub async fn read_timeout(&mut self, deadline: Duration) -> Result<Packet> {
        match tokio::time::timeout(deadline, self.framed.next()).await {
            Ok(Some(res)) => {
                let packet = res?;
                tracing::debug!(addr = %self.remote_addr(), packet = %packet, "recv");
                Ok(packet)
            }
            Ok(None) => Err(NetError::ConnectionClosed),
            Err(_) => Err(NetError::Timeout),
        }
    }

    pub async fn read(&mut self) -> Result<Packet> {
        self.read_timeout(IO_DEADLINE).await
    }

    /// Wait for the next packet with no deadline. Cancel-safe, so it can
    /// sit in a `select!` next to other event sources.
    pub async fn next_packet(&mut self) -> Result<Packet> {
        match self.framed.next().await {
            Some(res) => {
                let packet = res?;
                tracing::debug!(addr = %self.remote_addr(), packet = %packet, "recv");
                Ok(packet)
            }
            None => Err(NetError::ConnectionClosed),
        }
    }

    /// Release every associated address. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(tx) = self.release_tx.take() {
            for addr in self.addresses.drain(..) {
                let _ = tx.send(addr);
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("direction", &self.direction)
            .field("addresses", &self.addresses)
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::test_util::pair;
    use super::*;
    use dscuss_shared::{Id, PrivateKey};

    #[tokio::test]
    async fn test_write_read() {
        let (mut a, mut b) = pair(None).await;
        let key = PrivateKey::generate();
        let p = Packet::announce(Id::digest(b"x"), &key).unwrap();
        a.write(p.clone()).await.unwrap();
        assert_eq!(b.read().await.unwrap(), p);
        assert!(a.is_active());
        assert_eq!(b.direction(), Direction::Passive);
    }

    #[tokio::test]
    async fn test_read_deadline() {
        let (_a, mut b) = pair(None).await;
        assert!(matches!(
            b.read_timeout(Duration::from_millis(50)).await,
            Err(NetError::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_close_releases_all_addresses_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (mut a, b) = pair(Some(tx)).await;
        drop(b);
        a.add_addresses(vec!["example.org:8004".into(), "example.org:8004".into()]);
        let first = a.remote_addr().to_string();
        a.close();
        a.close();
        drop(a);

        let mut released = Vec::new();
        while let Ok(addr) = rx.try_recv() {
            released.push(addr);
        }
        // The passive side released its own remote address on drop.
        assert_eq!(released.len(), 3);
        assert!(released.contains(&first));
        assert!(released.contains(&"example.org:8004".to_string()));
    }

    #[tokio::test]
    async fn test_taken_addresses_not_released() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (mut a, _b) = pair(Some(tx)).await;
        let taken = a.take_addresses();
        assert_eq!(taken.len(), 1);
        a.close();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remote_close() {
        let (a, mut b) = pair(None).await;
        drop(a);
        assert!(matches!(b.next_packet().await, Err(NetError::ConnectionClosed)));
    }
}
