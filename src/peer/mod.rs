//! One peer connection's wire state and the choke/unchoke policy across all
//! of them (spec.md §3 `PeerConnection`, §4.3, §4.4).

pub mod choke;

use std::collections::HashMap;
use std::time::Duration;

use torrentd_primitives::address::PeerAddress;
use torrentd_primitives::bitfield::BitField;
use torrentd_primitives::info_hash::InfoHash;
use torrentd_primitives::peer_id::PeerId;

pub use choke::{ChokeManager, ChokeManagerConfig};

use crate::net::{NetError, TcpSocket};
use crate::wire::{decode_message, encode_message, Handshake, Message, ProtocolError, MAX_NON_PIECE_MESSAGE_LEN};

pub const PEER_LOG_TARGET: &str = "PEER";

/// No message received for this long closes the connection (spec.md §4.3
/// "Keepalive/idle policy").
pub const IDLE_CLOSE_TIMEOUT: Duration = Duration::from_secs(180);
/// We send our own keepalive at this interval of outbound silence (spec.md
/// §4.3).
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(120);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("network error: {0}")]
    Net(#[from] NetError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("peer was idle for longer than {0:?}")]
    Idle(Duration),
}

/// Per-peer wire-level state (spec.md §3 `PeerConnection`). `PeerConnection`
/// owns this and the socket; `crate::torrent` owns the `PeerConnection` and
/// everything above the wire (piece selection, bans).
#[derive(Debug, Clone)]
pub struct PeerState {
    pub address: PeerAddress,
    pub peer_id: Option<PeerId>,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub supports_fast_extension: bool,
    pub supports_extension_protocol: bool,
    pub supports_dht: bool,
    /// Pieces this peer has announced (`bitfield`/`have`), grown lazily once
    /// the torrent's piece count is known.
    pub bitfield: Option<BitField>,
    /// BEP 10 extension name -> id, from the peer's extended handshake.
    pub extensions: HashMap<String, u8>,
    /// Requests we have sent that are still outstanding, for cancel-on-choke
    /// bookkeeping at the `crate::piece` level (that module is the source
    /// of truth; this is only what the wire layer has sent).
    pub outstanding_requests: Vec<(u32, u32, u32)>,
    pub last_received_at: Duration,
    pub last_sent_at: Duration,
    pub downloaded_from: u64,
    pub uploaded_to: u64,
}

impl PeerState {
    #[must_use]
    pub fn new(address: PeerAddress, handshake: &Handshake, now: Duration) -> Self {
        Self {
            address,
            peer_id: Some(handshake.peer_id),
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            supports_fast_extension: handshake.supports_fast_extension(),
            supports_extension_protocol: handshake.supports_extension_protocol(),
            supports_dht: handshake.supports_dht(),
            bitfield: None,
            extensions: HashMap::new(),
            outstanding_requests: Vec::new(),
            last_received_at: now,
            last_sent_at: now,
            downloaded_from: 0,
            uploaded_to: 0,
        }
    }

    /// Applies an incoming message's effect on wire-level flags and
    /// bookkeeping; piece-selection/verification effects are the caller's
    /// job (spec.md §4.1/§4.2 own that).
    pub fn apply_incoming(&mut self, message: &Message, piece_count: usize, now: Duration) -> Result<(), ProtocolError> {
        self.last_received_at = now;
        match message {
            Message::Choke => self.peer_choking = true,
            Message::Unchoke => self.peer_choking = false,
            Message::Interested => self.peer_interested = true,
            Message::NotInterested => self.peer_interested = false,
            Message::Have { index } => {
                let bitfield = self.bitfield.get_or_insert_with(|| BitField::new(piece_count));
                if *index as usize >= piece_count {
                    return Err(ProtocolError::HaveOutOfRange { index: *index, piece_count: piece_count as u32 });
                }
                bitfield.set(*index as usize, true).map_err(|_| ProtocolError::HaveOutOfRange { index: *index, piece_count: piece_count as u32 })?;
            }
            Message::Bitfield { bytes } => {
                let bitfield = BitField::from_bytes(piece_count, bytes).map_err(|_| ProtocolError::BadBitfieldLength { piece_count: piece_count as u32 })?;
                self.bitfield = Some(bitfield);
            }
            Message::HaveAll => {
                let mut bitfield = BitField::new(piece_count);
                for i in 0..piece_count {
                    let _ = bitfield.set(i, true);
                }
                self.bitfield = Some(bitfield);
            }
            Message::HaveNone => {
                self.bitfield = Some(BitField::new(piece_count));
            }
            Message::Piece { index, begin, data } => {
                self.outstanding_requests.retain(|(i, b, l)| !(*i == *index && *b == *begin && *l == data.len() as u32));
                self.downloaded_from += data.len() as u64;
            }
            Message::Request { .. } | Message::Cancel { .. } | Message::KeepAlive | Message::Port { .. } => {}
            Message::SuggestPiece { .. } | Message::RejectRequest { .. } | Message::AllowedFast { .. } | Message::Extended { .. } => {}
        }
        Ok(())
    }

    #[must_use]
    pub fn has_piece(&self, index: usize) -> bool {
        self.bitfield.as_ref().is_some_and(|b| b.get(index))
    }
}

/// Accumulates bytes from the socket and yields complete length-prefixed
/// frames (spec.md §6.5). Mirrors `TcpSocket::recv`'s "arbitrary chunking"
/// contract: a frame may arrive split across many `recv` calls, or several
/// frames may arrive in one.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buffer: Vec<u8>,
}

impl FrameBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pops and decodes the next complete frame, if one is fully buffered.
    ///
    /// # Errors
    ///
    /// Propagates [`ProtocolError`] from `crate::wire::decode_message`.
    pub fn next_message(&mut self, max_len: u32) -> Result<Option<Message>, ProtocolError> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }
        let length = u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]]) as usize;
        if self.buffer.len() < 4 + length {
            return Ok(None);
        }
        let frame: Vec<u8> = self.buffer.drain(0..4 + length).collect();
        decode_message(&frame, max_len).map(Some)
    }
}

/// One live peer connection: the socket plus its [`PeerState`] (spec.md §3
/// `PeerConnection`). Encryption, if any, has already been applied by the
/// socket handed in (`crate::mse::MseStream` implements [`TcpSocket`]
/// transparently), so this type only ever speaks plaintext BEP 3/6/10.
pub struct PeerConnection {
    socket: Box<dyn TcpSocket>,
    pub state: PeerState,
    buffer: FrameBuffer,
}

impl PeerConnection {
    #[must_use]
    pub fn new(socket: Box<dyn TcpSocket>, state: PeerState) -> Self {
        Self { socket, state, buffer: FrameBuffer::new() }
    }

    #[must_use]
    pub fn address(&self) -> PeerAddress {
        self.state.address
    }

    /// Seeds the frame buffer with bytes already read past the BEP 3
    /// handshake (e.g. the trailing bytes of an MSE `initial_payload`),
    /// so a message coalesced with the handshake by the peer is not lost.
    pub fn prime(&mut self, bytes: &[u8]) {
        self.buffer.feed(bytes);
    }

    /// # Errors
    ///
    /// Returns [`PeerError::Net`] if the underlying socket write fails.
    pub async fn send(&mut self, message: &Message, now: Duration) -> Result<(), PeerError> {
        self.socket.send(&encode_message(message)).await?;
        self.state.last_sent_at = now;
        Ok(())
    }

    /// Reads from the socket until either a complete message is decoded or
    /// the peer closes its write half (`Ok(None)`).
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Net`] on a read failure or [`PeerError::Protocol`]
    /// if a frame fails to decode.
    pub async fn recv(&mut self, piece_count: usize, now: Duration) -> Result<Option<Message>, PeerError> {
        loop {
            if let Some(message) = self.buffer.next_message(MAX_NON_PIECE_MESSAGE_LEN)? {
                self.state.apply_incoming(&message, piece_count, now)?;
                return Ok(Some(message));
            }
            match self.socket.recv().await? {
                Some(bytes) => self.buffer.feed(&bytes),
                None => return Ok(None),
            }
        }
    }

    #[must_use]
    pub fn is_idle(&self, now: Duration) -> bool {
        now.saturating_sub(self.state.last_received_at) >= IDLE_CLOSE_TIMEOUT
    }

    #[must_use]
    pub fn needs_keepalive(&self, now: Duration) -> bool {
        now.saturating_sub(self.state.last_sent_at) >= KEEPALIVE_INTERVAL
    }

    pub async fn close(&mut self) {
        self.socket.close().await;
    }
}

/// Commands a [`PeerConnection`]'s driving task accepts from `crate::torrent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCommand {
    Send(Message),
    Close,
}

/// Events a [`PeerConnection`]'s driving task reports back to `crate::torrent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Message(Message),
    Disconnected,
    Error(String),
}

/// Drives one [`PeerConnection`] to completion: every suspension point is an
/// explicit socket read or the command channel (spec.md §5). Runs as its own
/// task so N peers never contend over one connection's mutable state; all
/// cross-peer decisions (choke policy, piece selection) stay in
/// `crate::torrent`, reached only through `events`/`commands`. Events are
/// tagged with `info_hash` so `crate::engine::Engine` can fan in every
/// torrent's peer tasks onto one channel and route each event back to the
/// owning [`crate::torrent::Torrent`].
pub async fn run_peer_connection(
    mut connection: PeerConnection,
    info_hash: InfoHash,
    address_key: String,
    piece_count: usize,
    mut commands: tokio::sync::mpsc::UnboundedReceiver<PeerCommand>,
    events: tokio::sync::mpsc::UnboundedSender<(InfoHash, String, PeerEvent)>,
) {
    loop {
        let now = torrentd_clock::clock::Working::now();
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(PeerCommand::Send(message)) => {
                        if connection.send(&message, now).await.is_err() {
                            let _ = events.send((info_hash, address_key.clone(), PeerEvent::Disconnected));
                            return;
                        }
                    }
                    Some(PeerCommand::Close) | None => {
                        connection.close().await;
                        return;
                    }
                }
            }
            received = connection.recv(piece_count, now) => {
                match received {
                    Ok(Some(message)) => {
                        if events.send((info_hash, address_key.clone(), PeerEvent::Message(message))).is_err() {
                            return;
                        }
                    }
                    Ok(None) => {
                        let _ = events.send((info_hash, address_key.clone(), PeerEvent::Disconnected));
                        return;
                    }
                    Err(error) => {
                        let _ = events.send((info_hash, address_key.clone(), PeerEvent::Error(error.to_string())));
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use torrentd_primitives::info_hash::InfoHash;

    use super::*;

    fn state() -> PeerState {
        let handshake = Handshake::new(InfoHash::from([1u8; 20]), PeerId::from([2u8; 20]));
        let address = PeerAddress::new("127.0.0.1:6881".parse().unwrap(), true);
        PeerState::new(address, &handshake, Duration::ZERO)
    }

    #[test]
    fn should_start_choked_and_not_interested_both_ways() {
        let s = state();
        assert!(s.am_choking);
        assert!(s.peer_choking);
        assert!(!s.am_interested);
        assert!(!s.peer_interested);
    }

    #[test]
    fn should_track_have_messages_into_a_bitfield() {
        let mut s = state();
        s.apply_incoming(&Message::Have { index: 3 }, 10, Duration::ZERO).unwrap();
        assert!(s.has_piece(3));
        assert!(!s.has_piece(4));
    }

    #[test]
    fn should_reject_have_out_of_range() {
        let mut s = state();
        let err = s.apply_incoming(&Message::Have { index: 99 }, 10, Duration::ZERO);
        assert!(err.is_err());
    }

    #[test]
    fn should_buffer_a_split_frame_across_two_feeds() {
        let mut buf = FrameBuffer::new();
        let encoded = encode_message(&Message::Unchoke);
        buf.feed(&encoded[0..1]);
        assert!(buf.next_message(MAX_NON_PIECE_MESSAGE_LEN).unwrap().is_none());
        buf.feed(&encoded[1..]);
        assert_eq!(buf.next_message(MAX_NON_PIECE_MESSAGE_LEN).unwrap(), Some(Message::Unchoke));
    }

    #[test]
    fn should_yield_two_messages_fed_in_one_chunk() {
        let mut buf = FrameBuffer::new();
        let mut both = encode_message(&Message::Choke);
        both.extend_from_slice(&encode_message(&Message::Unchoke));
        buf.feed(&both);
        assert_eq!(buf.next_message(MAX_NON_PIECE_MESSAGE_LEN).unwrap(), Some(Message::Choke));
        assert_eq!(buf.next_message(MAX_NON_PIECE_MESSAGE_LEN).unwrap(), Some(Message::Unchoke));
        assert_eq!(buf.next_message(MAX_NON_PIECE_MESSAGE_LEN).unwrap(), None);
    }
}
