//! Tokio-backed `SocketFactory` (spec.md §6.1), grounded in the teacher's
//! `BoundSocket` wrapper around `tokio::net::UdpSocket`.

use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::{NetError, SocketFactory, TcpServer, TcpSocket, UdpSocket as UdpSocketTrait, NET_LOG_TARGET};

const RECV_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Default, Debug, Clone, Copy)]
pub struct TokioSocketFactory;

#[async_trait]
impl SocketFactory for TokioSocketFactory {
    async fn create_tcp_socket(&self, host: &str, port: u16) -> Result<Box<dyn TcpSocket>, NetError> {
        let stream = TcpStream::connect((host, port)).await?;
        tracing::debug!(target: NET_LOG_TARGET, host, port, "tcp connected");
        Ok(Box::new(TokioTcpSocket::new(stream)))
    }

    async fn create_tcp_server(&self, port: u16) -> Result<Box<dyn TcpServer>, NetError> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        tracing::debug!(target: NET_LOG_TARGET, port, "tcp listening");
        Ok(Box::new(TokioTcpServer { listener }))
    }

    async fn create_udp_socket(&self, bind_addr: SocketAddr) -> Result<Box<dyn UdpSocketTrait>, NetError> {
        let socket = tokio::net::UdpSocket::bind(bind_addr).await?;
        tracing::debug!(target: NET_LOG_TARGET, %bind_addr, "udp bound");
        Ok(Box::new(TokioUdpSocket { socket }))
    }
}

pub struct TokioTcpSocket {
    stream: TcpStream,
    peer_addr: Option<SocketAddr>,
    closed: bool,
}

impl TokioTcpSocket {
    fn new(stream: TcpStream) -> Self {
        let peer_addr = stream.peer_addr().ok();
        Self { stream, peer_addr, closed: false }
    }
}

impl fmt::Debug for TokioTcpSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioTcpSocket").field("peer_addr", &self.peer_addr).finish_non_exhaustive()
    }
}

#[async_trait]
impl TcpSocket for TokioTcpSocket {
    async fn send(&mut self, bytes: &[u8]) -> Result<(), NetError> {
        if self.closed {
            return Err(NetError::Closed);
        }
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, NetError> {
        if self.closed {
            return Ok(None);
        }
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let n = self.stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf))
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.stream.shutdown().await;
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

pub struct TokioTcpServer {
    listener: TcpListener,
}

#[async_trait]
impl TcpServer for TokioTcpServer {
    async fn accept(&mut self) -> Result<Box<dyn TcpSocket>, NetError> {
        let (stream, addr) = self.listener.accept().await?;
        tracing::debug!(target: NET_LOG_TARGET, %addr, "tcp accepted");
        Ok(Box::new(TokioTcpSocket::new(stream)))
    }

    fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr().expect("bound listener should have a local address")
    }
}

pub struct TokioUdpSocket {
    socket: tokio::net::UdpSocket,
}

impl fmt::Debug for TokioUdpSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioUdpSocket").field("local_addr", &self.socket.local_addr().ok()).finish()
    }
}

#[async_trait]
impl UdpSocketTrait for TokioUdpSocket {
    async fn send_to(&self, addr: SocketAddr, bytes: &[u8]) -> Result<(), NetError> {
        self.socket.send_to(bytes, addr).await?;
        Ok(())
    }

    async fn recv_from(&self) -> Result<(SocketAddr, Vec<u8>), NetError> {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let (n, addr) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(n);
        Ok((addr, buf))
    }

    fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr().expect("bound socket should have a local address")
    }
}
