//! Client identity for an accepted connection.
//!
//! # Responsibilities
//! - Bind a live TCP stream to its remote address for the connection's lifetime
//! - Generate unique connection IDs for tracing
//! - Half-close either direction independently

use std::io;
use std::net::{IpAddr, Shutdown, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};

use socket2::SockRef;
use tokio::net::TcpStream;

/// Source of connection ids; only uniqueness matters.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// An accepted connection and the address it came from.
///
/// Reader and writer borrow it; neither takes ownership, so the same identity
/// carries a request read and the response write that follows it.
#[derive(Debug)]
pub struct ClientNetworkId {
    id: ConnectionId,
    stream: TcpStream,
    peer_addr: SocketAddr,
}

impl ClientNetworkId {
    /// Wrap a stream, looking up its remote address.
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        Ok(Self::from_parts(stream, peer_addr))
    }

    /// Wrap a stream whose remote address is already known (e.g. from `accept`).
    pub fn from_parts(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self {
            id: ConnectionId::new(),
            stream,
            peer_addr,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Source IP, the key used by the request monitor.
    pub fn ip(&self) -> IpAddr {
        self.peer_addr.ip()
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Stop reading; the output direction stays open.
    pub fn shutdown_input(&self) -> io::Result<()> {
        SockRef::from(&self.stream).shutdown(Shutdown::Read)
    }

    /// Send FIN; the input direction stays open.
    pub fn shutdown_output(&self) -> io::Result<()> {
        SockRef::from(&self.stream).shutdown(Shutdown::Write)
    }

    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
        assert!(id1.to_string().starts_with("conn-"));
    }

    #[tokio::test]
    async fn half_close_keeps_other_direction() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut peer = TcpStream::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();

        let client = ClientNetworkId::new(stream).unwrap();
        assert_eq!(client.peer_addr(), peer.local_addr().unwrap());

        client.shutdown_output().unwrap();
        let mut received = Vec::new();
        peer.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());

        // Our input is still open: the peer can keep writing.
        peer.write_all(b"still here").await.unwrap();
        let mut buf = [0u8; 16];
        let n = loop {
            client.stream().readable().await.unwrap();
            match client.stream().try_read(&mut buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => panic!("read failed: {e}"),
            }
        };
        assert_eq!(&buf[..n], b"still here");
    }
}
