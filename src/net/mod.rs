//! Socket abstraction (spec.md §6.1).
//!
//! The spec describes a callback-style interface (`onData`/`onClose`/`onError`).
//! That shape exists so a host can relay sockets through a native companion
//! process; in this engine the same seam is realized as async `Read`/`Write`
//! halves plus an explicit close, which is what the suspension points in
//! spec.md §5 actually need. `SocketFactory` is the injectable seam: production
//! code gets `TokioSocketFactory`, tests get `MemorySocketFactory`.

pub mod memory;
pub mod tokio_net;

use std::fmt::Debug;
use std::net::SocketAddr;

use async_trait::async_trait;

pub use memory::{MemorySocketFactory, MemoryTcpServer, MemoryTcpSocket, MemoryUdpSocket};
pub use tokio_net::{TokioSocketFactory, TokioTcpServer, TokioTcpSocket, TokioUdpSocket};

pub const NET_LOG_TARGET: &str = "NET";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum NetError {
    #[error("io error: {0}")]
    Io(String),
    #[error("socket closed")]
    Closed,
}

impl From<std::io::Error> for NetError {
    fn from(err: std::io::Error) -> Self {
        NetError::Io(err.to_string())
    }
}

/// A single outbound/inbound TCP connection, owned by exactly one
/// `PeerConnection` (spec.md §5: "Sockets are owned by exactly one
/// PeerConnection; closing is idempotent.").
#[async_trait]
pub trait TcpSocket: Send + Sync + Debug {
    /// Sends bytes on the connection. Completes when handed to the OS, not
    /// when the remote acknowledges it.
    async fn send(&mut self, bytes: &[u8]) -> Result<(), NetError>;

    /// Reads the next chunk of bytes, or `Ok(None)` once the peer has closed
    /// its write half.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, NetError>;

    /// Idempotent: closing an already-closed socket is a no-op.
    async fn close(&mut self);

    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// A listening TCP server yielding inbound connections.
#[async_trait]
pub trait TcpServer: Send + Sync {
    async fn accept(&mut self) -> Result<Box<dyn TcpSocket>, NetError>;

    fn local_addr(&self) -> SocketAddr;
}

/// A bound UDP socket (used by both the tracker client and the DHT node).
#[async_trait]
pub trait UdpSocket: Send + Sync + Debug {
    async fn send_to(&self, addr: SocketAddr, bytes: &[u8]) -> Result<(), NetError>;

    async fn recv_from(&self) -> Result<(SocketAddr, Vec<u8>), NetError>;

    fn local_addr(&self) -> SocketAddr;
}

/// Injectable seam creating the three socket kinds (spec.md §6.1).
#[async_trait]
pub trait SocketFactory: Send + Sync {
    async fn create_tcp_socket(&self, host: &str, port: u16) -> Result<Box<dyn TcpSocket>, NetError>;

    async fn create_tcp_server(&self, port: u16) -> Result<Box<dyn TcpServer>, NetError>;

    async fn create_udp_socket(&self, bind_addr: SocketAddr) -> Result<Box<dyn UdpSocket>, NetError>;
}
