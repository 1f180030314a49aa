//! In-memory `SocketFactory` for deterministic tests (spec.md §6.1:
//! "Implementations may be OS sockets, in-memory pipes (for tests)...").
//!
//! `MemorySocketFactory` keeps a registry of listening servers keyed by port,
//! so a test can spin up a `TcpServer` on one handle and `connect` to it from
//! another, entirely off the real network stack.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{NetError, SocketFactory, TcpServer, TcpSocket, UdpSocket as UdpSocketTrait};

const CHANNEL_CAPACITY: usize = 256;

struct PendingConnection {
    local_addr: SocketAddr,
    to_server: mpsc::Sender<Vec<u8>>,
    from_server: mpsc::Receiver<Vec<u8>>,
}

#[derive(Default)]
struct Registry {
    listeners: HashMap<u16, mpsc::Sender<PendingConnection>>,
    udp_sinks: HashMap<SocketAddr, mpsc::Sender<(SocketAddr, Vec<u8>)>>,
}

/// Shared network fabric. Clone to hand the same fabric to multiple
/// `MemorySocketFactory` instances that should be able to see each other.
#[derive(Clone, Default)]
pub struct MemorySocketFactory {
    registry: Arc<Mutex<Registry>>,
    next_ephemeral_port: Arc<AtomicU16>,
}

impl MemorySocketFactory {
    #[must_use]
    pub fn new() -> Self {
        Self { registry: Arc::default(), next_ephemeral_port: Arc::new(AtomicU16::new(40000)) }
    }
}

#[async_trait]
impl SocketFactory for MemorySocketFactory {
    async fn create_tcp_socket(&self, host: &str, port: u16) -> Result<Box<dyn TcpSocket>, NetError> {
        let sender = {
            let registry = self.registry.lock();
            registry.listeners.get(&port).cloned()
        };
        let Some(sender) = sender else {
            return Err(NetError::Io(format!("connection refused: no listener on {host}:{port}")));
        };

        let (to_server_tx, to_server_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (from_server_tx, from_server_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let local_port = self.next_ephemeral_port.fetch_add(1, Ordering::Relaxed);
        let local_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local_port);

        sender
            .send(PendingConnection { local_addr, to_server: from_server_tx, from_server: to_server_rx })
            .await
            .map_err(|_| NetError::Io("listener dropped".to_owned()))?;

        Ok(Box::new(MemoryTcpSocket {
            peer_addr: Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)),
            tx: to_server_tx,
            rx: from_server_rx,
            closed: false,
        }))
    }

    async fn create_tcp_server(&self, port: u16) -> Result<Box<dyn TcpServer>, NetError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.registry.lock().listeners.insert(port, tx);
        Ok(Box::new(MemoryTcpServer { port, incoming: rx }))
    }

    async fn create_udp_socket(&self, bind_addr: SocketAddr) -> Result<Box<dyn UdpSocketTrait>, NetError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.registry.lock().udp_sinks.insert(bind_addr, tx);
        Ok(Box::new(MemoryUdpSocket { local_addr: bind_addr, registry: self.registry.clone(), inbox: Mutex::new(rx) }))
    }
}

pub struct MemoryTcpSocket {
    peer_addr: Option<SocketAddr>,
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
    closed: bool,
}

impl fmt::Debug for MemoryTcpSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTcpSocket").field("peer_addr", &self.peer_addr).finish_non_exhaustive()
    }
}

#[async_trait]
impl TcpSocket for MemoryTcpSocket {
    async fn send(&mut self, bytes: &[u8]) -> Result<(), NetError> {
        if self.closed {
            return Err(NetError::Closed);
        }
        self.tx.send(bytes.to_vec()).await.map_err(|_| NetError::Closed)
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, NetError> {
        if self.closed {
            return Ok(None);
        }
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) {
        self.closed = true;
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

pub struct MemoryTcpServer {
    port: u16,
    incoming: mpsc::Receiver<PendingConnection>,
}

#[async_trait]
impl TcpServer for MemoryTcpServer {
    async fn accept(&mut self) -> Result<Box<dyn TcpSocket>, NetError> {
        let pending = self.incoming.recv().await.ok_or(NetError::Closed)?;
        Ok(Box::new(MemoryTcpSocket {
            peer_addr: Some(pending.local_addr),
            tx: pending.to_server,
            rx: pending.from_server,
            closed: false,
        }))
    }

    fn local_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port)
    }
}

pub struct MemoryUdpSocket {
    local_addr: SocketAddr,
    registry: Arc<Mutex<Registry>>,
    inbox: Mutex<mpsc::Receiver<(SocketAddr, Vec<u8>)>>,
}

impl fmt::Debug for MemoryUdpSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryUdpSocket").field("local_addr", &self.local_addr).finish()
    }
}

#[async_trait]
impl UdpSocketTrait for MemoryUdpSocket {
    async fn send_to(&self, addr: SocketAddr, bytes: &[u8]) -> Result<(), NetError> {
        let sink = self.registry.lock().udp_sinks.get(&addr).cloned();
        let Some(sink) = sink else {
            return Err(NetError::Io(format!("no udp socket bound at {addr}")));
        };
        sink.send((self.local_addr, bytes.to_vec())).await.map_err(|_| NetError::Closed)
    }

    async fn recv_from(&self) -> Result<(SocketAddr, Vec<u8>), NetError> {
        self.inbox.lock().recv().await.ok_or(NetError::Closed)
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn should_deliver_bytes_between_a_memory_tcp_server_and_client() {
        let factory = MemorySocketFactory::new();
        let mut server = factory.create_tcp_server(7001).await.unwrap();

        let client_factory = factory.clone();
        let client_task = tokio::spawn(async move {
            let mut client = client_factory.create_tcp_socket("127.0.0.1", 7001).await.unwrap();
            client.send(b"hello").await.unwrap();
            client
        });

        let mut server_side = server.accept().await.unwrap();
        let received = server_side.recv().await.unwrap().unwrap();
        assert_eq!(received, b"hello");

        client_task.await.unwrap();
    }

    #[tokio::test]
    async fn should_deliver_datagrams_between_two_memory_udp_sockets() {
        let factory = MemorySocketFactory::new();
        let a_addr: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let b_addr: SocketAddr = "127.0.0.1:9002".parse().unwrap();

        let a = factory.create_udp_socket(a_addr).await.unwrap();
        let b = factory.create_udp_socket(b_addr).await.unwrap();

        a.send_to(b_addr, b"ping").await.unwrap();
        let (from, payload) = b.recv_from().await.unwrap();

        assert_eq!(from, a_addr);
        assert_eq!(payload, b"ping");
    }
}
