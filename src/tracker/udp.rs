//! UDP tracker client (BEP 15) over the injectable [`UdpSocket`] abstraction
//! (spec.md §4.5, §6.1): connect/announce/scrape handshake with 4-byte
//! transaction ids, a connection-id cached for one minute, and the
//! `15 * 2^n` retry schedule.

use std::io::Cursor;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU16;
use std::time::Duration;

use aquatic_udp_protocol::{
    AnnounceEvent as AquaticAnnounceEvent, AnnounceRequest, ConnectRequest, ConnectionId, NumberOfBytes, NumberOfPeers, PeerKey,
    Port, Request, Response, ScrapeRequest, TransactionId,
};
use rand::RngCore;
use torrentd_primitives::address::PeerAddress;
use torrentd_primitives::announce_event::AnnounceEvent;
use torrentd_primitives::info_hash::InfoHash;
use tracing::debug;

use crate::net::{NetError, UdpSocket};

use super::{AnnounceOutcome, AnnounceParams};

pub const TRACKER_UDP_LOG_TARGET: &str = "TRACKER UDP";

/// De-facto tracker wire limit for a single datagram (spec.md §4.5).
const MAX_PACKET_SIZE: usize = 1496;

/// A `connect` reply is only valid for this long (spec.md §4.5:
/// "connection-id expires after 1 minute").
const CONNECTION_TTL: Duration = Duration::from_secs(60);

/// Retry schedule `15 * 2^n` seconds, `n = 0..8` (spec.md §4.5), after which
/// the client gives up until the caller's next scheduled announce.
const MAX_RETRIES: u32 = 8;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum UdpTrackerError {
    #[error("udp socket error: {0}")]
    Net(#[from] NetError),
    #[error("udp tracker request timed out after {0} retries")]
    TimedOut(u32),
    #[error("tracker sent an error response: {0}")]
    Rejected(String),
    #[error("unexpected response type from tracker")]
    UnexpectedResponse,
}

#[derive(Debug, Clone, Copy)]
pub struct ScrapeStats {
    pub seeders: u32,
    pub leechers: u32,
    pub completed: u32,
}

fn now() -> Duration {
    torrentd_clock::clock::Working::now()
}

struct CachedConnection {
    id: ConnectionId,
    obtained_at: Duration,
}

/// One tracker's UDP client, bound to a single remote tracker address for
/// its lifetime (spec.md §4.1: "Each Torrent exclusively owns... tracker
/// clients").
pub struct UdpTrackerClient {
    socket: Box<dyn UdpSocket>,
    tracker_addr: SocketAddr,
    connection: Option<CachedConnection>,
}

impl UdpTrackerClient {
    #[must_use]
    pub fn new(socket: Box<dyn UdpSocket>, tracker_addr: SocketAddr) -> Self {
        Self { socket, tracker_addr, connection: None }
    }

    /// # Errors
    ///
    /// Returns [`UdpTrackerError`] if every retry in the schedule times out,
    /// the socket itself errors, or the tracker replies with an error packet.
    pub async fn announce(&mut self, params: &AnnounceParams) -> Result<AnnounceOutcome, UdpTrackerError> {
        let connection_id = self.connection_id().await?;
        let transaction_id = TransactionId::new(random_transaction_id());

        let port = NonZeroU16::new(params.port).map_or(Port::new(NonZeroU16::MIN), Port::new);

        let request = AnnounceRequest {
            connection_id,
            transaction_id,
            info_hash: aquatic_udp_protocol::InfoHash(params.info_hash.bytes()),
            peer_id: aquatic_udp_protocol::PeerId(params.peer_id.bytes()),
            bytes_downloaded: NumberOfBytes(i64::try_from(params.downloaded).unwrap_or(i64::MAX)),
            bytes_uploaded: NumberOfBytes(i64::try_from(params.uploaded).unwrap_or(i64::MAX)),
            bytes_left: NumberOfBytes(i64::try_from(params.left).unwrap_or(i64::MAX)),
            event: to_aquatic_event(params.event),
            ip_address: None,
            key: PeerKey(0),
            peers_wanted: NumberOfPeers(params.num_want),
            port,
        };

        let response = self.send_with_retries(request.into(), transaction_id).await?;

        match response {
            Response::AnnounceIpv4(announce) => Ok(AnnounceOutcome {
                interval: Duration::from_secs(u64::from(u32::try_from(announce.fixed.announce_interval.0).unwrap_or(0))),
                min_interval: None,
                peers: announce
                    .peers
                    .iter()
                    .map(|p| PeerAddress::new(SocketAddr::new(IpAddr::V4(p.ip_address.into()), p.port.0), false))
                    .collect(),
                seeders: u32::try_from(announce.fixed.seeders.0).unwrap_or(0),
                leechers: u32::try_from(announce.fixed.leechers.0).unwrap_or(0),
            }),
            Response::AnnounceIpv6(announce) => Ok(AnnounceOutcome {
                interval: Duration::from_secs(u64::from(u32::try_from(announce.fixed.announce_interval.0).unwrap_or(0))),
                min_interval: None,
                peers: announce
                    .peers
                    .iter()
                    .map(|p| PeerAddress::new(SocketAddr::new(IpAddr::V6(p.ip_address.into()), p.port.0), false))
                    .collect(),
                seeders: u32::try_from(announce.fixed.seeders.0).unwrap_or(0),
                leechers: u32::try_from(announce.fixed.leechers.0).unwrap_or(0),
            }),
            Response::Error(err) => Err(UdpTrackerError::Rejected(err.message.to_string())),
            _ => Err(UdpTrackerError::UnexpectedResponse),
        }
    }

    /// # Errors
    ///
    /// Same failure modes as [`Self::announce`].
    pub async fn scrape(&mut self, info_hashes: &[InfoHash]) -> Result<Vec<ScrapeStats>, UdpTrackerError> {
        let connection_id = self.connection_id().await?;
        let transaction_id = TransactionId::new(random_transaction_id());

        let request = ScrapeRequest {
            connection_id,
            transaction_id,
            info_hashes: info_hashes.iter().map(|h| aquatic_udp_protocol::InfoHash(h.bytes())).collect(),
        };

        let response = self.send_with_retries(request.into(), transaction_id).await?;

        match response {
            Response::Scrape(scrape) => Ok(scrape
                .torrent_stats
                .iter()
                .map(|s| ScrapeStats {
                    seeders: u32::try_from(s.seeders.0).unwrap_or(0),
                    leechers: u32::try_from(s.leechers.0).unwrap_or(0),
                    completed: u32::try_from(s.completed.0).unwrap_or(0),
                })
                .collect()),
            Response::Error(err) => Err(UdpTrackerError::Rejected(err.message.to_string())),
            _ => Err(UdpTrackerError::UnexpectedResponse),
        }
    }

    /// Returns the cached connection id if still within its 1-minute TTL,
    /// otherwise performs a fresh `connect` handshake (spec.md §4.5).
    async fn connection_id(&mut self) -> Result<ConnectionId, UdpTrackerError> {
        if let Some(cached) = &self.connection {
            if now().saturating_sub(cached.obtained_at) < CONNECTION_TTL {
                return Ok(cached.id);
            }
        }

        let transaction_id = TransactionId::new(random_transaction_id());
        let request = ConnectRequest { transaction_id };
        let response = self.send_with_retries(request.into(), transaction_id).await?;

        match response {
            Response::Connect(connect) => {
                self.connection = Some(CachedConnection { id: connect.connection_id, obtained_at: now() });
                Ok(connect.connection_id)
            }
            Response::Error(err) => Err(UdpTrackerError::Rejected(err.message.to_string())),
            _ => Err(UdpTrackerError::UnexpectedResponse),
        }
    }

    /// Sends `request` and waits for a matching-transaction-id reply,
    /// retrying on timeout per the `15 * 2^n` schedule (spec.md §4.5).
    async fn send_with_retries(&self, request: Request, transaction_id: TransactionId) -> Result<Response, UdpTrackerError> {
        let mut buffer = vec![0u8; MAX_PACKET_SIZE];
        let written = {
            let mut cursor = Cursor::new(&mut buffer[..]);
            request.write_bytes(&mut cursor).map_err(|e| UdpTrackerError::Net(NetError::Io(e.to_string())))?;
            usize::try_from(cursor.position()).unwrap_or(0)
        };
        let bytes = &buffer[..written];

        for attempt in 0..=MAX_RETRIES {
            self.socket.send_to(self.tracker_addr, bytes).await?;

            let wait = Duration::from_secs(15 * 2u64.pow(attempt));
            let Ok(recv_result) = tokio::time::timeout(wait, self.socket.recv_from()).await else {
                debug!(target: TRACKER_UDP_LOG_TARGET, attempt, tracker = %self.tracker_addr, "udp tracker request timed out, retrying");
                continue;
            };
            let (_, payload) = recv_result?;

            let Ok(response) = Response::parse_bytes(&payload, true) else { continue };
            if response_transaction_id(&response) != Some(transaction_id) {
                continue;
            }
            return Ok(response);
        }

        Err(UdpTrackerError::TimedOut(MAX_RETRIES))
    }
}

fn response_transaction_id(response: &Response) -> Option<TransactionId> {
    match response {
        Response::Connect(r) => Some(r.transaction_id),
        Response::AnnounceIpv4(r) => Some(r.fixed.transaction_id),
        Response::AnnounceIpv6(r) => Some(r.fixed.transaction_id),
        Response::Scrape(r) => Some(r.transaction_id),
        Response::Error(r) => Some(r.transaction_id),
    }
}

fn to_aquatic_event(event: AnnounceEvent) -> AquaticAnnounceEvent {
    match event {
        AnnounceEvent::Started => AquaticAnnounceEvent::Started,
        AnnounceEvent::Stopped => AquaticAnnounceEvent::Stopped,
        AnnounceEvent::Completed => AquaticAnnounceEvent::Completed,
        AnnounceEvent::None => AquaticAnnounceEvent::None,
    }
}

fn random_transaction_id() -> i32 {
    #[allow(clippy::cast_possible_wrap)]
    let id = rand::thread_rng().next_u32() as i32;
    id
}

#[cfg(test)]
mod tests {
    use torrentd_primitives::peer_id::PeerId;

    use super::*;
    use crate::net::{MemorySocketFactory, SocketFactory};

    fn announce_params() -> AnnounceParams {
        AnnounceParams {
            info_hash: InfoHash::from([9u8; 20]),
            peer_id: PeerId::generate(b"-TD0001-"),
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 100,
            event: AnnounceEvent::Started,
            num_want: 50,
        }
    }

    #[tokio::test]
    async fn should_connect_then_announce_against_a_fake_tracker() {
        let factory = MemorySocketFactory::new();
        let tracker_addr: SocketAddr = "127.0.0.1:7001".parse().unwrap();
        let client_addr: SocketAddr = "127.0.0.1:7002".parse().unwrap();

        let tracker_socket = factory.create_udp_socket(tracker_addr).await.unwrap();
        let client_socket = factory.create_udp_socket(client_addr).await.unwrap();

        let tracker_task = tokio::spawn(async move {
            let (from, payload) = tracker_socket.recv_from().await.unwrap();
            let Request::Connect(connect) = Request::from_bytes(&payload, 74).unwrap() else { panic!("expected connect") };
            let connect_response = aquatic_udp_protocol::ConnectResponse {
                transaction_id: connect.transaction_id,
                connection_id: ConnectionId(99),
            };
            let mut buffer = vec![0u8; MAX_PACKET_SIZE];
            let written = {
                let mut cursor = Cursor::new(&mut buffer[..]);
                Response::from(connect_response).write_bytes(&mut cursor).unwrap();
                usize::try_from(cursor.position()).unwrap()
            };
            tracker_socket.send_to(from, &buffer[..written]).await.unwrap();

            let (from, payload) = tracker_socket.recv_from().await.unwrap();
            let Request::Announce(announce) = Request::from_bytes(&payload, 74).unwrap() else { panic!("expected announce") };
            let announce_response = aquatic_udp_protocol::AnnounceResponse {
                fixed: aquatic_udp_protocol::AnnounceResponseFixedData {
                    transaction_id: announce.transaction_id,
                    announce_interval: aquatic_udp_protocol::AnnounceInterval(900),
                    leechers: NumberOfPeers(1),
                    seeders: NumberOfPeers(2),
                },
                peers: vec![aquatic_udp_protocol::ResponsePeer {
                    ip_address: std::net::Ipv4Addr::new(127, 0, 0, 3).into(),
                    port: Port::new(NonZeroU16::new(51413).unwrap()),
                }],
            };
            let mut buffer = vec![0u8; MAX_PACKET_SIZE];
            let written = {
                let mut cursor = Cursor::new(&mut buffer[..]);
                Response::from(announce_response).write_bytes(&mut cursor).unwrap();
                usize::try_from(cursor.position()).unwrap()
            };
            tracker_socket.send_to(from, &buffer[..written]).await.unwrap();
        });

        let mut client = UdpTrackerClient::new(client_socket, tracker_addr);
        let outcome = client.announce(&announce_params()).await.unwrap();

        assert_eq!(outcome.peers.len(), 1);
        assert_eq!(outcome.seeders, 2);
        assert_eq!(outcome.leechers, 1);
        assert_eq!(outcome.interval, Duration::from_secs(900));

        tracker_task.await.unwrap();
    }

    #[tokio::test]
    async fn should_reuse_a_cached_connection_id_within_its_ttl() {
        let factory = MemorySocketFactory::new();
        let tracker_addr: SocketAddr = "127.0.0.1:7101".parse().unwrap();
        let client_addr: SocketAddr = "127.0.0.1:7102".parse().unwrap();

        let client_socket = factory.create_udp_socket(client_addr).await.unwrap();
        let mut client = UdpTrackerClient::new(client_socket, tracker_addr);
        client.connection = Some(CachedConnection { id: ConnectionId(7), obtained_at: now() });

        let id = client.connection_id().await.unwrap();
        assert_eq!(id, ConnectionId(7));
    }
}
