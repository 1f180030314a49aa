//! Post-handshake transport: RC4-encrypts/decrypts every byte crossing an
//! otherwise-plain `TcpSocket`, so the wire-protocol layer above never knows
//! encryption is in play (spec.md §4.4 step 6).

use std::net::SocketAddr;

use async_trait::async_trait;

use super::rc4_stream::Rc4Drop1024;
use crate::net::{NetError, TcpSocket};

pub struct MseStream {
    inner: Box<dyn TcpSocket>,
    encrypt: Rc4Drop1024,
    decrypt: Rc4Drop1024,
}

impl MseStream {
    #[must_use]
    pub fn new(inner: Box<dyn TcpSocket>, encrypt: Rc4Drop1024, decrypt: Rc4Drop1024) -> Self {
        Self { inner, encrypt, decrypt }
    }
}

impl std::fmt::Debug for MseStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MseStream").field("peer_addr", &self.inner.peer_addr()).finish_non_exhaustive()
    }
}

#[async_trait]
impl TcpSocket for MseStream {
    async fn send(&mut self, bytes: &[u8]) -> Result<(), NetError> {
        let mut buf = bytes.to_vec();
        self.encrypt.apply(&mut buf);
        self.inner.send(&buf).await
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, NetError> {
        let Some(mut data) = self.inner.recv().await? else {
            return Ok(None);
        };
        self.decrypt.apply(&mut data);
        Ok(Some(data))
    }

    async fn close(&mut self) {
        self.inner.close().await;
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr()
    }
}
