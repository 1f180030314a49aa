//! The DHT node (spec.md §4.7): owns the routing table, token and peer
//! stores, and the transaction manager; drives KRPC query handling,
//! iterative `get_peers` lookups, and periodic maintenance over one UDP
//! socket.

use std::collections::HashMap;
use std::time::Duration;

use torrentd_clock::clock::Time;
use torrentd_primitives::address::PeerAddress;
use torrentd_primitives::info_hash::InfoHash;
use tracing::{debug, warn};

use crate::net::{NetError, UdpSocket};

use super::compact::{encode_nodes, encode_peer, CompactNode};
use super::krpc::{Body, Envelope, KrpcError, Query, Response};
use super::lookup::{Lookup, LookupResult};
use super::node_id::NodeId;
use super::peer_store::{PeerStore, DEFAULT_MAX_PEERS_PER_TORRENT};
use super::routing_table::{DhtNode, InsertOutcome, RoutingTable, K};
use super::token_store::TokenStore;
use super::transaction::TransactionManager;

pub const DHT_LOG_TARGET: &str = "DHT";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DhtError {
    #[error("dht socket error: {0}")]
    Net(#[from] NetError),
    #[error("krpc query timed out")]
    Timeout,
    #[error("remote returned krpc error {code}: {message}")]
    Remote { code: i64, message: String },
}

/// KRPC `v` string advertised in outgoing messages (spec.md §4.7: "`v`
/// (client version, optional)").
const CLIENT_VERSION: &[u8] = b"TD01";

/// How long [`DhtNodeHandle::ping`] waits for `pong` before declaring the
/// oldest bucket occupant stale (spec.md §4.7 step 4).
const PING_TIMEOUT: Duration = Duration::from_secs(5);

pub struct DhtNodeHandle {
    local_id: NodeId,
    socket: Box<dyn UdpSocket>,
    routing_table: RoutingTable,
    token_store: TokenStore,
    peer_store: PeerStore,
    transactions: TransactionManager,
}

impl DhtNodeHandle {
    #[must_use]
    pub fn new(socket: Box<dyn UdpSocket>, local_id: NodeId, now: Duration) -> Self {
        Self {
            local_id,
            socket,
            routing_table: RoutingTable::new(local_id),
            token_store: TokenStore::new(now),
            peer_store: PeerStore::new(DEFAULT_MAX_PEERS_PER_TORRENT),
            transactions: TransactionManager::new(),
        }
    }

    #[must_use]
    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    #[must_use]
    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    /// Reads one datagram and dispatches it: queries get answered inline,
    /// responses/errors are routed to the pending transaction (and silently
    /// dropped if the transaction id is unknown, spec.md §4.7).
    ///
    /// # Errors
    ///
    /// Returns [`DhtError::Net`] if the socket read itself fails.
    pub async fn poll_once(&mut self) -> Result<(), DhtError> {
        let (from_addr, bytes) = self.socket.recv_from().await?;
        let from = PeerAddress::new(from_addr, false);
        let Ok(envelope) = Envelope::decode(&bytes) else {
            debug!(target: DHT_LOG_TARGET, %from, "dropping malformed krpc packet");
            return Ok(());
        };

        match envelope.body {
            Body::Query { query } => self.handle_query(from, envelope.transaction_id, query).await,
            Body::Response { response } => {
                self.remember_node(&response.id, from).await;
                self.transactions.resolve(&envelope.transaction_id);
                Ok(())
            }
            Body::Error { error } => {
                if self.transactions.resolve(&envelope.transaction_id).is_none() {
                    debug!(target: DHT_LOG_TARGET, %from, "dropping krpc error for unknown transaction");
                } else {
                    warn!(target: DHT_LOG_TARGET, %from, code = error.0, message = %error.1, "peer returned krpc error");
                }
                Ok(())
            }
        }
    }

    async fn handle_query(&mut self, from: PeerAddress, transaction_id: Vec<u8>, query: Query) -> Result<(), DhtError> {
        let response = match &query {
            Query::Ping { id } => {
                self.remember_node(id, from).await;
                self.self_response()
            }
            Query::FindNode { id, target } => {
                self.remember_node(id, from).await;
                let target_id = NodeId::from_slice(target).unwrap_or_else(|_| NodeId::generate());
                let nodes = self.routing_table.closest(&target_id, K);
                Response { nodes: Some(encode_nodes(&to_compact(&nodes)).into()), ..self.self_response() }
            }
            Query::GetPeers { id, info_hash } => {
                self.remember_node(id, from).await;
                let info_hash = InfoHash::try_from(info_hash.clone()).unwrap_or_default();
                let token = self.token_store.issue(from.ip());
                let peers = self.peer_store.get_peers(&info_hash, now());
                if peers.is_empty() {
                    let target = NodeId::from_slice(&info_hash.bytes()).unwrap_or_else(|_| NodeId::generate());
                    let nodes = self.routing_table.closest(&target, K);
                    Response { token: Some(token.to_vec().into()), nodes: Some(encode_nodes(&to_compact(&nodes)).into()), ..self.self_response() }
                } else {
                    let values = peers.into_iter().map(|p| serde_bytes::ByteBuf::from(encode_peer(p))).collect();
                    Response { token: Some(token.to_vec().into()), values: Some(values), ..self.self_response() }
                }
            }
            Query::AnnouncePeer { id, info_hash, port, token, implied_port } => {
                self.remember_node(id, from).await;
                let info_hash = InfoHash::try_from(info_hash.clone()).unwrap_or_default();
                if !self.token_store.validate(token, from.ip()) {
                    let error = Envelope::error(transaction_id, KrpcError(203, "bad token".to_owned()));
                    return self.send_envelope(from.socket_addr(), &error).await;
                }
                let announced_port = if implied_port.unwrap_or(0) != 0 { from.port() } else { *port };
                let addr = PeerAddress::new(std::net::SocketAddr::new(from.ip(), announced_port), false);
                self.peer_store.announce(info_hash, addr, now());
                self.self_response()
            }
        };
        let reply = Envelope::response(transaction_id, response);
        self.send_envelope(from.socket_addr(), &reply).await
    }

    fn self_response(&self) -> Response {
        Response { id: self.local_id.bytes().to_vec(), ..Default::default() }
    }

    /// Folds a node we just heard from into the routing table (spec.md
    /// §4.7 insertion rule). When the owning bucket is full and
    /// unsplittable, pings the oldest occupant inline and evicts it in
    /// favor of `from` only if that ping times out (step 4/5).
    async fn remember_node(&mut self, id: &[u8], from: PeerAddress) {
        let Ok(node_id) = NodeId::from_slice(id) else { return };
        let node = DhtNode { id: node_id, addr: from, last_seen: now() };
        if let InsertOutcome::PingOldest(oldest) = self.routing_table.insert(node.clone(), now()) {
            debug!(target: DHT_LOG_TARGET, oldest = %oldest.id, "bucket full, pinging oldest occupant");
            if self.ping(oldest.addr, PING_TIMEOUT).await.is_err() {
                self.routing_table.replace(&oldest.id, node, now());
            }
        }
    }

    /// Sends `ping` to `target` and waits up to `timeout` for its `pong`.
    /// Consumes the socket exclusively while waiting, consistent with this
    /// engine's cooperative single-mutator model: a ping is only issued
    /// from call sites (`remember_node`) that already own the socket.
    ///
    /// # Errors
    ///
    /// Returns [`DhtError::Timeout`] if no reply arrives in time, or
    /// [`DhtError::Net`] if the socket itself fails.
    pub async fn ping(&mut self, target: PeerAddress, timeout: Duration) -> Result<(), DhtError> {
        let query = Query::Ping { id: self.local_id.bytes().to_vec() };
        let id = self.transactions.start(target, query.clone(), now());
        let mut envelope = Envelope::query(id.to_vec(), query);
        envelope.version = Some(serde_bytes::ByteBuf::from(CLIENT_VERSION.to_vec()));
        self.send_envelope(target.socket_addr(), &envelope).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.checked_duration_since(tokio::time::Instant::now()).ok_or(DhtError::Timeout)?;
            if remaining.is_zero() {
                self.transactions.resolve(&id);
                return Err(DhtError::Timeout);
            }
            let Ok(recv_result) = tokio::time::timeout(remaining, self.socket.recv_from()).await else {
                self.transactions.resolve(&id);
                return Err(DhtError::Timeout);
            };
            let (from_addr, bytes) = recv_result?;
            let from = PeerAddress::new(from_addr, false);
            let Ok(envelope) = Envelope::decode(&bytes) else { continue };
            if envelope.transaction_id == id.to_vec() {
                self.transactions.resolve(&id);
                // Refresh the responder directly rather than recursing back
                // through `remember_node` (which is what got us here).
                if let Body::Response { response } = envelope.body {
                    if let Ok(node_id) = NodeId::from_slice(&response.id) {
                        self.routing_table.insert(DhtNode { id: node_id, addr: from, last_seen: now() }, now());
                    }
                }
                return Ok(());
            }
        }
    }

    async fn send_envelope(&self, to: std::net::SocketAddr, envelope: &Envelope) -> Result<(), DhtError> {
        let bytes = envelope.encode().map_err(|e| {
            warn!(target: DHT_LOG_TARGET, error = %e, "failed to encode outgoing krpc envelope");
            NetError::Io(e.to_string())
        })?;
        self.socket.send_to(to, &bytes).await?;
        Ok(())
    }

    async fn send_query(&mut self, target: PeerAddress, query: Query) -> Result<(), DhtError> {
        let id = self.transactions.start(target, query.clone(), now());
        let mut envelope = Envelope::query(id.to_vec(), query);
        envelope.version = Some(serde_bytes::ByteBuf::from(CLIENT_VERSION.to_vec()));
        self.send_envelope(target.socket_addr(), &envelope).await
    }

    /// Performs `find_node(self)` against every seed address, used once at
    /// startup to populate the routing table (spec.md §4.7 "Bootstrap").
    ///
    /// # Errors
    ///
    /// Returns [`DhtError::Net`] if sending to a seed fails outright; an
    /// individual seed not responding is not an error (it simply never
    /// contributes a routing-table entry).
    pub async fn bootstrap(&mut self, seeds: &[PeerAddress]) -> Result<(), DhtError> {
        for &seed in seeds {
            let query = Query::FindNode { id: self.local_id.bytes().to_vec(), target: self.local_id.bytes().to_vec() };
            self.send_query(seed, query).await?;
        }
        Ok(())
    }

    /// Drives an iterative `get_peers` lookup to convergence (spec.md §4.7).
    /// Queries are sent `ALPHA` at a time; the caller's event loop must keep
    /// calling [`Self::poll_once`] concurrently so responses land in the
    /// pending transaction map and get folded back in here.
    ///
    /// # Errors
    ///
    /// Returns [`DhtError::Net`] if sending a query fails outright.
    pub async fn get_peers(&mut self, info_hash: &InfoHash, round_wait: Duration) -> Result<LookupResult, DhtError> {
        let local_id = self.local_id;
        let target = NodeId::from_slice(&info_hash.bytes()).expect("info-hash is 20 bytes");
        let seeds = self.routing_table.closest(&target, K);
        let mut lookup = Lookup::new(local_id, info_hash, seeds);

        loop {
            let batch = lookup.next_batch();
            if batch.is_empty() {
                break;
            }

            let mut awaiting: HashMap<[u8; 2], DhtNode> = HashMap::new();
            for node in &batch {
                let query = Query::GetPeers { id: local_id.bytes().to_vec(), info_hash: info_hash.bytes().to_vec() };
                let id = self.transactions.start(node.addr, query.clone(), now());
                let mut envelope = Envelope::query(id.to_vec(), query);
                envelope.version = Some(serde_bytes::ByteBuf::from(CLIENT_VERSION.to_vec()));
                self.send_envelope(node.addr.socket_addr(), &envelope).await?;
                awaiting.insert(id, node.clone());
            }

            // Drain replies until every query in this round has either
            // answered or the round's wait budget elapses (spec.md §4.7:
            // non-responsive nodes never block convergence).
            let deadline = tokio::time::Instant::now() + round_wait;
            while !awaiting.is_empty() {
                let Ok(remaining) = deadline.checked_duration_since(tokio::time::Instant::now()) else { break };
                if remaining.is_zero() {
                    break;
                }
                let Ok(Ok((from_addr, bytes))) = tokio::time::timeout(remaining, self.socket.recv_from()).await else { break };
                let from = PeerAddress::new(from_addr, false);
                let Ok(envelope) = Envelope::decode(&bytes) else { continue };

                match envelope.body {
                    Body::Response { response } => {
                        let Some(key): Option<[u8; 2]> = envelope.transaction_id.as_slice().try_into().ok() else { continue };
                        let Some(node) = awaiting.remove(&key) else { continue };
                        self.transactions.resolve(&envelope.transaction_id);
                        self.remember_node(&response.id, from).await;
                        lookup.on_response(&node, &response);
                    }
                    Body::Error { .. } => {
                        let Some(key): Option<[u8; 2]> = envelope.transaction_id.as_slice().try_into().ok() else { continue };
                        if let Some(node) = awaiting.remove(&key) {
                            self.transactions.resolve(&envelope.transaction_id);
                            lookup.on_timeout(&node);
                        }
                    }
                    Body::Query { query } => {
                        // A stray inbound query while we're mid-lookup; answer
                        // it normally rather than dropping it on the floor.
                        let _ = self.handle_query(from, envelope.transaction_id, query).await;
                    }
                }
            }

            for (id, node) in awaiting {
                self.transactions.resolve(&id);
                lookup.on_timeout(&node);
            }

            if lookup.is_converged() {
                break;
            }
        }

        Ok(lookup.into_result())
    }
}

fn to_compact(nodes: &[DhtNode]) -> Vec<CompactNode> {
    nodes
        .iter()
        .filter_map(|n| match n.addr.socket_addr() {
            std::net::SocketAddr::V4(v4) => Some(CompactNode { id: n.id, addr: v4 }),
            std::net::SocketAddr::V6(_) => None,
        })
        .collect()
}

fn now() -> Duration {
    torrentd_clock::clock::Working::now()
}
