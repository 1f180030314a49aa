//! The per-torrent orchestrator (spec.md §3 `Torrent`, §4.1): owns the
//! piece/block state, the swarm, and every connected peer's wire-level
//! record, and drives the pipeline filler and verification pipeline. Pure
//! decision logic lives here; `crate::peer::run_peer_connection` tasks are
//! the only thing that ever touches a socket.

pub mod layout;

use std::collections::HashMap;
use std::time::Duration;

use sha1::{Digest, Sha1};
use tokio::sync::mpsc::UnboundedSender;
use torrentd_primitives::address::PeerAddress;
use torrentd_primitives::bitfield::BitField;
use torrentd_primitives::info_hash::InfoHash;
use torrentd_primitives::metadata::Metadata;
use tracing::{info, warn};

pub use layout::{FileLayout, FileSpan};

use crate::peer::{ChokeManager, ChokeManagerConfig, PeerCommand, PeerState};
use crate::piece::{ActivePieceManager, ActivePieceManagerConfig, MAX_PIPELINE};
use crate::session::UserState;
use crate::storage::FileSystem;
use crate::swarm::{PeerSource, Swarm};
use crate::wire::extension::{ExtendedHandshake, PexDelta, EXTENSION_UT_METADATA, EXTENSION_UT_PEX};
use crate::wire::{Message, MetadataMessage};

pub const TORRENT_LOG_TARGET: &str = "TORRENT";

/// Extension ids we advertise in our own extended handshake's `m` table
/// (spec.md §4.3, BEP 10): a peer addressing a message to us uses these,
/// not whatever id it assigned the same extension in its own handshake.
const LOCAL_EXT_ID_UT_METADATA: u8 = 1;
const LOCAL_EXT_ID_UT_PEX: u8 = 2;

/// In-progress BEP 9 assembly of the `info` dictionary from 16 KiB pieces
/// (spec.md §3: metadata "may arrive... via BEP-9 metadata exchange").
struct MetadataAssembly {
    pieces: Vec<Option<Vec<u8>>>,
}

impl MetadataAssembly {
    fn new(total_size: u32) -> Self {
        let piece_count = (total_size as usize).div_ceil(torrentd_primitives::metadata::METADATA_PIECE_SIZE).max(1);
        Self { pieces: vec![None; piece_count] }
    }

    fn is_complete(&self) -> bool {
        self.pieces.iter().all(Option::is_some)
    }

    fn assemble(&self) -> Vec<u8> {
        self.pieces.iter().flatten().flat_map(|piece| piece.iter().copied()).collect()
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TorrentError {
    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),
    #[error("metadata hash mismatch: expected {expected}, computed {computed}")]
    MetadataHashMismatch { expected: String, computed: String },
    #[error("metadata for this torrent has not been resolved yet")]
    MetadataNotReady,
}

#[derive(Debug, Clone, Copy)]
pub struct TorrentConfig {
    /// Period of the periodic maintenance tick: pipeline refill, timeout
    /// sweep, choke rounds, tracker re-announce check (spec.md §4.1).
    pub maintenance_tick: Duration,
    pub active_piece_manager: ActivePieceManagerConfig,
    pub choke_manager: ChokeManagerConfig,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self { maintenance_tick: Duration::from_secs(5), active_piece_manager: ActivePieceManagerConfig::default(), choke_manager: ChokeManagerConfig::default() }
    }
}

#[derive(Debug, Clone)]
pub enum TorrentEvent {
    MetadataReady { info_hash: InfoHash },
    /// Piece `index` hashed correctly; `data` is the assembled piece buffer
    /// for the caller to persist through its `FileSystem` handle (spec.md
    /// §4.1: verification and persistence are both suspension points, never
    /// inline in message handling).
    PieceVerified { index: u32, data: Vec<u8> },
    Complete,
    Error { message: String },
    PeerCountChanged { connected: usize },
    /// `address_key` requested `(index, begin, length)` and we are not
    /// choking them; the caller owns the `FileSystem` handle needed to read
    /// it off disk, so it reads the block and calls [`Torrent::serve_block`]
    /// to turn it into an outgoing command (spec.md §4.1: uploading is a
    /// suspension point, never inline in message handling).
    BlockRequested { address_key: String, index: u32, begin: u32, length: u32 },
}

/// Per-file download priority (spec.md §4.1 `setFilePriority(fileIndex,
/// prio)`). A piece overlapping only `Skip` files is never requested; one
/// overlapping any `Normal`/`High` file is still fetched in full, since
/// pieces aren't split across priority boundaries. `High` pieces sort ahead
/// of `Normal` ones within the rarest-first order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilePriority {
    Skip,
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub downloaded: u64,
    pub uploaded: u64,
    pub total: u64,
    pub percent: f64,
}

struct ConnectedPeer {
    wire: PeerState,
    commands: UnboundedSender<PeerCommand>,
}

/// One torrent's full orchestration state (spec.md §3 `Torrent`).
pub struct Torrent {
    pub info_hash: InfoHash,
    pub storage_key: String,
    pub user_state: UserState,
    config: TorrentConfig,
    metadata: Option<Metadata>,
    layout: Option<FileLayout>,
    piece_manager: Option<ActivePieceManager>,
    our_bitfield: Option<BitField>,
    metadata_assembly: Option<MetadataAssembly>,
    file_priorities: Vec<FilePriority>,
    swarm: Swarm,
    peers: HashMap<String, ConnectedPeer>,
    choke_manager: ChokeManager,
    uploaded: u64,
    downloaded: u64,
    events: UnboundedSender<TorrentEvent>,
}

impl Torrent {
    #[must_use]
    pub fn new(info_hash: InfoHash, metadata: Option<Metadata>, storage_key: String, config: TorrentConfig, events: UnboundedSender<TorrentEvent>) -> Self {
        let mut torrent = Self {
            info_hash,
            storage_key,
            user_state: UserState::Stopped,
            choke_manager: ChokeManager::new(config.choke_manager),
            config,
            metadata: None,
            layout: None,
            piece_manager: None,
            our_bitfield: None,
            metadata_assembly: None,
            file_priorities: Vec::new(),
            swarm: Swarm::new(),
            peers: HashMap::new(),
            uploaded: 0,
            downloaded: 0,
            events,
        };
        if let Some(metadata) = metadata {
            torrent.adopt_metadata(metadata);
        }
        torrent
    }

    #[must_use]
    pub fn has_metadata(&self) -> bool {
        self.metadata.is_some()
    }

    #[must_use]
    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    /// Adopts resolved metadata, whether from a `.torrent` file at
    /// construction or a completed BEP 9 exchange (spec.md §3
    /// "Metadata... may arrive either in a `.torrent` file or via BEP-9
    /// metadata exchange").
    pub fn adopt_metadata(&mut self, metadata: Metadata) {
        let piece_lengths: Vec<u32> = (0..metadata.piece_count()).map(|i| metadata.piece_length(i)).collect();
        self.layout = Some(FileLayout::from_metadata(&metadata));
        self.piece_manager = Some(ActivePieceManager::new(piece_lengths, self.config.active_piece_manager));
        self.our_bitfield = Some(BitField::new(metadata.piece_count()));
        self.file_priorities = vec![FilePriority::default(); metadata.files.len()];
        let info_hash = metadata.info_hash;
        self.metadata = Some(metadata);
        let _ = self.events.send(TorrentEvent::MetadataReady { info_hash });
    }

    /// Sets `file_index`'s download priority (spec.md §4.1
    /// `setFilePriority(fileIndex, prio)`). Out-of-range indices are ignored,
    /// matching this engine's general policy of tolerating bad host input
    /// without panicking.
    pub fn set_file_priority(&mut self, file_index: usize, priority: FilePriority) {
        if let Some(slot) = self.file_priorities.get_mut(file_index) {
            *slot = priority;
        }
    }

    #[must_use]
    pub fn file_priority(&self, file_index: usize) -> Option<FilePriority> {
        self.file_priorities.get(file_index).copied()
    }

    /// Pieces that overlap only `Skip`-priority files, derived fresh from
    /// `file_priorities` each call since priorities change rarely relative
    /// to piece selection.
    fn skipped_pieces(&self) -> Option<Vec<bool>> {
        let metadata = self.metadata.as_ref()?;
        let layout = self.layout.as_ref()?;
        let piece_count = metadata.piece_count();
        let mut skip = vec![true; piece_count];
        for (file_index, priority) in self.file_priorities.iter().enumerate() {
            if *priority == FilePriority::Skip {
                continue;
            }
            if let Some((first, last)) = layout.file_piece_range(file_index, metadata.piece_length) {
                for index in first..=last {
                    if let Some(slot) = skip.get_mut(index as usize) {
                        *slot = false;
                    }
                }
            }
        }
        Some(skip)
    }

    /// Pieces that overlap any `High`-priority file.
    fn high_priority_pieces(&self) -> Option<Vec<bool>> {
        let metadata = self.metadata.as_ref()?;
        let layout = self.layout.as_ref()?;
        let piece_count = metadata.piece_count();
        let mut high = vec![false; piece_count];
        for (file_index, priority) in self.file_priorities.iter().enumerate() {
            if *priority != FilePriority::High {
                continue;
            }
            if let Some((first, last)) = layout.file_piece_range(file_index, metadata.piece_length) {
                for index in first..=last {
                    if let Some(slot) = high.get_mut(index as usize) {
                        *slot = true;
                    }
                }
            }
        }
        Some(high)
    }

    pub fn start(&mut self) {
        self.user_state = UserState::Active;
    }

    /// Stops downloading/seeding, closing every live peer connection
    /// (spec.md §4.1 `stop()`).
    pub fn stop(&mut self) -> Vec<(String, PeerCommand)> {
        self.user_state = UserState::Stopped;
        self.peers.keys().map(|key| (key.clone(), PeerCommand::Close)).collect()
    }

    /// Discards all downloaded data bookkeeping so a subsequent
    /// [`Self::recheck_data`] starts from a clean slate (spec.md §4.1
    /// `resetState()`).
    pub fn reset_state(&mut self) {
        if let Some(metadata) = self.metadata.clone() {
            self.adopt_metadata(metadata);
        }
        self.downloaded = 0;
    }

    #[must_use]
    pub fn get_progress(&self) -> Progress {
        let total = self.metadata.as_ref().map_or(0, |m| m.total_length);
        let percent = if total == 0 { 0.0 } else { (self.downloaded as f64 / total as f64) * 100.0 };
        Progress { downloaded: self.downloaded, uploaded: self.uploaded, total, percent }
    }

    /// Re-hashes every piece already on disk and rebuilds the bitfield from
    /// what verifies (spec.md §4.1 `recheckData()`). Used after a crash
    /// recovery or a user-requested recheck.
    ///
    /// # Errors
    ///
    /// Returns [`TorrentError::MetadataNotReady`] before metadata resolves,
    /// or [`TorrentError::Storage`] on an I/O failure.
    pub async fn recheck_data(&mut self, fs: &dyn FileSystem) -> Result<(), TorrentError> {
        let metadata = self.metadata.clone().ok_or(TorrentError::MetadataNotReady)?;
        let layout = self.layout.clone().ok_or(TorrentError::MetadataNotReady)?;
        let mut bitfield = BitField::new(metadata.piece_count());
        let mut downloaded = 0u64;

        for index in 0..metadata.piece_count() {
            let piece_length = metadata.piece_length(index);
            let offset = FileLayout::piece_offset(metadata.piece_length, index as u32);
            let mut buffer = vec![0u8; piece_length as usize];
            let mut cursor = 0usize;
            let mut readable = true;
            for span in layout.spans(offset, u64::from(piece_length)) {
                match fs.open(&self.storage_key, &span.path, crate::storage::OpenMode::Read).await {
                    Ok(mut handle) => {
                        let slice = &mut buffer[cursor..cursor + span.length as usize];
                        if handle.read(slice, span.file_offset).await.is_err() {
                            readable = false;
                        }
                        let _ = handle.close().await;
                    }
                    Err(_) => readable = false,
                }
                cursor += span.length as usize;
            }
            if readable && sha1_of(&buffer) == metadata.piece_hashes[index] {
                let _ = bitfield.set(index, true);
                downloaded += u64::from(piece_length);
            }
        }

        self.our_bitfield = Some(bitfield);
        self.downloaded = downloaded;
        if downloaded == metadata.total_length {
            let _ = self.events.send(TorrentEvent::Complete);
        }
        Ok(())
    }

    pub fn add_discovered_peers(&mut self, addresses: impl IntoIterator<Item = PeerAddress>, source: PeerSource) {
        self.swarm.add_peers(addresses, source);
    }

    /// The extended handshake we send immediately after the BEP 3 handshake
    /// to any peer that advertised extension-protocol support (spec.md §4.3,
    /// BEP 10), advertising our local `ut_metadata`/`ut_pex` ids and, once
    /// metadata is known, its size.
    #[must_use]
    pub fn extended_handshake_message(&self) -> Message {
        let mut supported = std::collections::BTreeMap::new();
        supported.insert(EXTENSION_UT_METADATA.to_owned(), LOCAL_EXT_ID_UT_METADATA);
        supported.insert(EXTENSION_UT_PEX.to_owned(), LOCAL_EXT_ID_UT_PEX);
        let metadata_size = self.metadata.as_ref().map(|m| m.raw_info.len() as u32);
        let handshake = ExtendedHandshake::new(supported, None, metadata_size);
        Message::Extended { extension_id: 0, payload: handshake.encode() }
    }

    /// Our own bitfield as the message sent immediately after the BEP 3/10
    /// handshakes to a newly registered peer (spec.md §4.3), or `None`
    /// before metadata resolves (piece count, and so bitfield length, is
    /// not yet known).
    #[must_use]
    pub fn bitfield_message(&self) -> Option<Message> {
        self.our_bitfield.as_ref().map(|bitfield| Message::Bitfield { bytes: bitfield.as_bytes().to_vec() })
    }

    pub fn register_peer(&mut self, address_key: String, wire: PeerState, commands: UnboundedSender<PeerCommand>) {
        if let Some(peer_id) = wire.peer_id {
            self.swarm.mark_connected(&address_key, peer_id);
        }
        self.peers.insert(address_key, ConnectedPeer { wire, commands });
        let _ = self.events.send(TorrentEvent::PeerCountChanged { connected: self.peers.len() });
    }

    /// How many peers are currently connected, for the caller to compute how
    /// many more dial slots to fill (spec.md §4.6).
    #[must_use]
    pub fn connected_count(&self) -> usize {
        self.peers.len()
    }

    /// Whether `peer_id` is already connected under some address (spec.md
    /// §4.6 "never connect to ourselves twice under a different address").
    #[must_use]
    pub fn is_peer_id_connected(&self, peer_id: &torrentd_primitives::peer_id::PeerId) -> bool {
        self.swarm.is_peer_id_connected(peer_id)
    }

    /// Marks a swarm entry as being dialed, starting its backoff clock
    /// (spec.md §4.6 "Connect backoff").
    pub fn mark_connecting(&mut self, address_key: &str, now: Duration) {
        self.swarm.mark_connecting(address_key, now);
    }

    /// Marks a dial attempt as failed, so the next [`Self::connectable_peers`]
    /// call respects its backoff window (spec.md §4.6).
    pub fn mark_connect_failed(&mut self, address_key: &str) {
        self.swarm.mark_failed(address_key);
    }

    /// Sends every `(address_key, command)` pair produced by
    /// [`Self::on_peer_message`], [`Self::on_maintenance_tick`] or
    /// [`Self::stop`] to its peer's command channel. Silently drops commands
    /// for a peer that has already disconnected (its task has dropped the
    /// receiver by then).
    pub fn dispatch(&self, outgoing: Vec<(String, PeerCommand)>) {
        for (address_key, command) in outgoing {
            if let Some(peer) = self.peers.get(&address_key) {
                let _ = peer.commands.send(command);
            }
        }
    }

    pub fn remove_peer(&mut self, address_key: &str) {
        if let Some(peer) = self.peers.remove(address_key) {
            if let Some(manager) = &mut self.piece_manager {
                manager.on_choke(address_key);
            }
            drop(peer);
        }
        self.swarm.mark_disconnected(address_key);
        let _ = self.events.send(TorrentEvent::PeerCountChanged { connected: self.peers.len() });
    }

    /// Rarest-first candidate order among pieces we don't have yet,
    /// computed from every connected peer's bitfield (spec.md §4.1
    /// "Piece selection: rarest-first").
    fn rarest_first_order(&self) -> Vec<u32> {
        let Some(our_bitfield) = &self.our_bitfield else { return Vec::new() };
        let piece_count = our_bitfield.piece_count();
        let mut counts = vec![0u32; piece_count];
        for peer in self.peers.values() {
            if let Some(bitfield) = &peer.wire.bitfield {
                for index in bitfield.iter_set() {
                    if index < piece_count {
                        counts[index] += 1;
                    }
                }
            }
        }
        let skipped = self.skipped_pieces();
        let high = self.high_priority_pieces();
        let mut order: Vec<u32> = (0..piece_count as u32)
            .filter(|&i| !our_bitfield.get(i as usize))
            .filter(|&i| !skipped.as_ref().is_some_and(|s| s[i as usize]))
            .collect();
        order.sort_by_key(|&i| {
            let is_high = high.as_ref().is_some_and(|h| h[i as usize]);
            (!is_high, counts[i as usize], i)
        });
        order
    }

    /// Handles one incoming wire message from `address_key` (spec.md §4.1,
    /// §4.3). Returns outgoing commands the caller should dispatch to the
    /// named peers' tasks — this method never touches a socket itself.
    pub fn on_peer_message(&mut self, address_key: &str, message: Message, now: Duration) -> Vec<(String, PeerCommand)> {
        let piece_count = self.our_bitfield.as_ref().map_or(0, BitField::piece_count);
        if let Some(peer) = self.peers.get_mut(address_key) {
            if let Err(error) = peer.wire.apply_incoming(&message, piece_count, now) {
                warn!(target: TORRENT_LOG_TARGET, %error, peer = address_key, "dropping peer after a protocol violation");
                self.swarm.ban(address_key);
                return vec![(address_key.to_owned(), PeerCommand::Close)];
            }
        } else {
            return Vec::new();
        }

        match message {
            Message::Choke => {
                if let Some(manager) = &mut self.piece_manager {
                    manager.on_choke(address_key);
                }
                Vec::new()
            }
            Message::Unchoke | Message::Have { .. } | Message::Bitfield { .. } | Message::HaveAll | Message::HaveNone => {
                self.fill_pipeline_for(address_key, now)
            }
            Message::Request { index, begin, length } => self.handle_request(address_key, index, begin, length),
            Message::Piece { index, begin, data } => self.handle_piece_received(address_key, index, begin, data, now),
            Message::Interested => {
                if let Some(peer) = self.peers.get_mut(address_key) {
                    peer.wire.peer_interested = true;
                }
                Vec::new()
            }
            Message::NotInterested => {
                if let Some(peer) = self.peers.get_mut(address_key) {
                    peer.wire.peer_interested = false;
                }
                Vec::new()
            }
            Message::Extended { extension_id, payload } => self.handle_extended(address_key, extension_id, &payload),
            _ => Vec::new(),
        }
    }

    /// Dispatches one BEP 10 extended message by the local id we advertised
    /// for it in our own handshake (spec.md §4.3); `extension_id == 0` is
    /// always the handshake itself, never a negotiated sub-extension.
    fn handle_extended(&mut self, address_key: &str, extension_id: u8, payload: &[u8]) -> Vec<(String, PeerCommand)> {
        match extension_id {
            0 => self.handle_extended_handshake(address_key, payload),
            LOCAL_EXT_ID_UT_METADATA => self.handle_ut_metadata(address_key, payload),
            LOCAL_EXT_ID_UT_PEX => self.handle_ut_pex(payload),
            _ => Vec::new(),
        }
    }

    fn handle_extended_handshake(&mut self, address_key: &str, payload: &[u8]) -> Vec<(String, PeerCommand)> {
        let Ok(handshake) = ExtendedHandshake::decode(payload) else { return Vec::new() };
        if let Some(peer) = self.peers.get_mut(address_key) {
            peer.wire.extensions = handshake.supported.into_iter().collect();
        }
        if self.metadata.is_none() {
            if let Some(size) = handshake.metadata_size {
                self.metadata_assembly.get_or_insert_with(|| MetadataAssembly::new(size));
                return self.request_metadata_pieces(address_key);
            }
        }
        Vec::new()
    }

    /// Requests every metadata piece we don't have yet from `address_key`
    /// (spec.md §3 BEP-9 supplement). Simple rather than pipelined: a magnet
    /// resolve is a one-time, small (a handful of 16 KiB pieces) transfer,
    /// not the bulk-data path `crate::piece` optimizes.
    fn request_metadata_pieces(&mut self, address_key: &str) -> Vec<(String, PeerCommand)> {
        let Some(assembly) = &self.metadata_assembly else { return Vec::new() };
        let Some(peer) = self.peers.get(address_key) else { return Vec::new() };
        let Some(&ext_id) = peer.wire.extensions.get(EXTENSION_UT_METADATA) else { return Vec::new() };
        assembly
            .pieces
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(piece, _)| {
                let request = MetadataMessage::Request { piece: piece as u32 };
                (address_key.to_owned(), PeerCommand::Send(Message::Extended { extension_id: ext_id, payload: request.encode() }))
            })
            .collect()
    }

    fn handle_ut_metadata(&mut self, address_key: &str, payload: &[u8]) -> Vec<(String, PeerCommand)> {
        let Ok(message) = MetadataMessage::decode(payload) else { return Vec::new() };
        let Some(peer) = self.peers.get(address_key) else { return Vec::new() };
        let Some(&ext_id) = peer.wire.extensions.get(EXTENSION_UT_METADATA) else { return Vec::new() };

        match message {
            MetadataMessage::Request { piece } => {
                let reject = || vec![(address_key.to_owned(), PeerCommand::Send(Message::Extended { extension_id: ext_id, payload: MetadataMessage::Reject { piece }.encode() }))];
                let Some(metadata) = &self.metadata else { return reject() };
                let piece_size = torrentd_primitives::metadata::METADATA_PIECE_SIZE;
                let start = piece as usize * piece_size;
                let Some(chunk) = metadata.raw_info.get(start..) else { return reject() };
                let end = chunk.len().min(piece_size);
                let response = MetadataMessage::Data { piece, total_size: metadata.raw_info.len() as u32, data: chunk[..end].to_vec() };
                vec![(address_key.to_owned(), PeerCommand::Send(Message::Extended { extension_id: ext_id, payload: response.encode() }))]
            }
            MetadataMessage::Data { piece, total_size, data } => {
                let assembly = self.metadata_assembly.get_or_insert_with(|| MetadataAssembly::new(total_size));
                if let Some(slot) = assembly.pieces.get_mut(piece as usize) {
                    *slot = Some(data);
                }
                if assembly.is_complete() {
                    let raw_info = assembly.assemble();
                    self.metadata_assembly = None;
                    match torrentd_primitives::metadata::Metadata::from_info_dict_bytes(&raw_info) {
                        Ok(metadata) if metadata.info_hash == self.info_hash => self.adopt_metadata(metadata),
                        _ => warn!(target: TORRENT_LOG_TARGET, "discarding ut_metadata assembly: hash mismatch or malformed info dict"),
                    }
                }
                Vec::new()
            }
            MetadataMessage::Reject { piece } => {
                warn!(target: TORRENT_LOG_TARGET, piece, peer = address_key, "peer rejected a ut_metadata request");
                Vec::new()
            }
        }
    }

    /// Folds a `ut_pex` delta's added peers into the swarm (spec.md §4.6,
    /// BEP 10 `ut_pex`). Dropped peers are not actively disconnected: they
    /// simply stop being redundantly rediscovered once they leave a remote
    /// peer's own swarm view.
    fn handle_ut_pex(&mut self, payload: &[u8]) -> Vec<(String, PeerCommand)> {
        if let Ok(delta) = PexDelta::decode(payload) {
            let added = delta
                .added_v4
                .into_iter()
                .map(std::net::SocketAddr::V4)
                .chain(delta.added_v6.into_iter().map(std::net::SocketAddr::V6))
                .map(|addr| PeerAddress::new(addr, true));
            self.add_discovered_peers(added, PeerSource::Pex);
        }
        Vec::new()
    }

    fn fill_pipeline_for(&mut self, address_key: &str, now: Duration) -> Vec<(String, PeerCommand)> {
        let Some(manager) = &mut self.piece_manager else { return Vec::new() };
        let Some(peer) = self.peers.get(address_key) else { return Vec::new() };
        let Some(peer_bitfield) = peer.wire.bitfield.clone() else { return Vec::new() };
        if peer.wire.peer_choking {
            return Vec::new();
        }

        let order = self.rarest_first_order();
        let endgame = manager.unrequested_block_count() < MAX_PIPELINE;
        let mut outgoing = Vec::new();
        let in_flight = self.peers.get(address_key).map_or(0, |p| p.wire.outstanding_requests.len());
        let mut budget = MAX_PIPELINE.saturating_sub(in_flight);
        while budget > 0 {
            let Some((index, begin, length)) = manager.select_block(address_key, &peer_bitfield, &order, endgame, now) else { break };
            outgoing.push((address_key.to_owned(), PeerCommand::Send(Message::Request { index, begin, length })));
            if let Some(peer) = self.peers.get_mut(address_key) {
                peer.wire.outstanding_requests.push((index, begin, length));
            }
            budget -= 1;
        }
        outgoing
    }

    fn handle_request(&mut self, address_key: &str, index: u32, begin: u32, length: u32) -> Vec<(String, PeerCommand)> {
        let Some(peer) = self.peers.get(address_key) else { return Vec::new() };
        if peer.wire.am_choking {
            return Vec::new();
        }
        let Some(our_bitfield) = &self.our_bitfield else { return Vec::new() };
        if !our_bitfield.get(index as usize) {
            return Vec::new();
        }
        // Reading the block off disk is the caller's job (it owns the
        // `FileSystem` handle); it reads the block and calls
        // `serve_block` once it has the bytes.
        let _ = self.events.send(TorrentEvent::BlockRequested { address_key: address_key.to_owned(), index, begin, length });
        Vec::new()
    }

    /// Turns a block read off disk in response to a [`TorrentEvent::BlockRequested`]
    /// into the outgoing `piece` message, recording the upload for rate
    /// accounting (spec.md §4.1).
    pub fn serve_block(&mut self, address_key: &str, index: u32, begin: u32, data: Vec<u8>) -> Vec<(String, PeerCommand)> {
        let length = data.len() as u64;
        if let Some(peer) = self.peers.get_mut(address_key) {
            peer.wire.uploaded_to += length;
        }
        self.uploaded += length;
        vec![(address_key.to_owned(), PeerCommand::Send(Message::Piece { index, begin, data }))]
    }

    /// Records one received block and, once a piece completes, hashes and
    /// persists it (spec.md §4.1 "critical ordering": the pipeline for the
    /// contributing peer is refilled *before* the hash/persist await, never
    /// after — reversing the order starves that peer's pipeline for the
    /// duration of the disk write).
    fn handle_piece_received(&mut self, address_key: &str, index: u32, begin: u32, data: Vec<u8>, now: Duration) -> Vec<(String, PeerCommand)> {
        self.downloaded += data.len() as u64;
        let Some(manager) = &mut self.piece_manager else { return Vec::new() };
        let verified_blocks = manager.on_block(index, begin, &data, address_key);

        let mut outgoing = self.fill_pipeline_for(address_key, now);

        if let Some(blocks) = verified_blocks {
            let Some(metadata) = &self.metadata else { return outgoing };
            if sha1_of(&blocks.data) == metadata.piece_hashes[blocks.index as usize] {
                if let Some(bitfield) = &mut self.our_bitfield {
                    let _ = bitfield.set(blocks.index as usize, true);
                }
                if let Some(manager) = &mut self.piece_manager {
                    manager.complete_piece(blocks.index);
                }
                let _ = self.events.send(TorrentEvent::PieceVerified { index: blocks.index, data: blocks.data.clone() });
                for key in self.peers.keys() {
                    outgoing.push((key.clone(), PeerCommand::Send(Message::Have { index: blocks.index })));
                }
                if self.is_complete() {
                    self.user_state = UserState::Completed;
                    let _ = self.events.send(TorrentEvent::Complete);
                }
            } else {
                warn!(target: TORRENT_LOG_TARGET, index = blocks.index, "piece hash mismatch");
                if let Some(manager) = &mut self.piece_manager {
                    manager.discard_piece(blocks.index);
                }
                // A single contributor is the unambiguous culprit; more than
                // one means we cannot tell who corrupted the data, so none
                // are banned and the piece is simply re-requested (spec.md
                // §4.3 "Ban policy").
                if blocks.contributors.len() == 1 {
                    self.swarm.ban(&blocks.contributors[0]);
                    outgoing.push((blocks.contributors[0].clone(), PeerCommand::Close));
                }
            }
        }
        outgoing
    }

    /// Periodic maintenance: pipeline refill after request timeouts, choke
    /// round, idle-peer sweep (spec.md §4.1).
    pub fn on_maintenance_tick(&mut self, now: Duration, rng: &mut impl rand::Rng) -> Vec<(String, PeerCommand)> {
        let mut outgoing = Vec::new();

        if let Some(manager) = &mut self.piece_manager {
            if manager.on_timeout_tick(now) > 0 {
                let keys: Vec<String> = self.peers.keys().cloned().collect();
                for key in keys {
                    outgoing.extend(self.fill_pipeline_for(&key, now));
                }
            }
        }

        let candidates: Vec<crate::peer::choke::PeerCandidate> = self
            .peers
            .iter()
            .map(|(key, peer)| crate::peer::choke::PeerCandidate {
                key: key.clone(),
                download_rate: peer.wire.downloaded_from as f64,
                interested: peer.wire.peer_interested,
            })
            .collect();
        let should_unchoke = self.choke_manager.run_round(&candidates, rng);
        for (key, peer) in &mut self.peers {
            let should = should_unchoke.contains(key);
            if should && peer.wire.am_choking {
                peer.wire.am_choking = false;
                outgoing.push((key.clone(), PeerCommand::Send(Message::Unchoke)));
            } else if !should && !peer.wire.am_choking {
                peer.wire.am_choking = true;
                outgoing.push((key.clone(), PeerCommand::Send(Message::Choke)));
            }
        }

        let idle: Vec<String> = self.peers.iter().filter(|(_, p)| now.saturating_sub(p.wire.last_received_at) >= crate::peer::IDLE_CLOSE_TIMEOUT).map(|(k, _)| k.clone()).collect();
        for key in idle {
            outgoing.push((key, PeerCommand::Close));
        }

        self.swarm.unban_recoverable();
        outgoing
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.our_bitfield.as_ref().is_some_and(|b| b.count() == b.piece_count())
    }

    /// Number of pieces verified so far, for the host-facing `statsTick`
    /// event (spec.md §6.6).
    #[must_use]
    pub fn verified_piece_count(&self) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        self.our_bitfield.as_ref().map_or(0, |b| b.count() as u32)
    }

    #[must_use]
    pub fn connectable_peers(&self, limit: usize, now: Duration, rng: &mut impl rand::Rng) -> Vec<PeerAddress> {
        self.swarm.connectable_peers(limit, now, rng)
    }
}

fn sha1_of(bytes: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

#[cfg(test)]
mod tests {
    use torrentd_primitives::metadata::FileEntry;

    use super::*;

    fn metadata() -> Metadata {
        let mut hasher = Sha1::new();
        hasher.update(vec![7u8; 16]);
        let hash = hasher.finalize();
        Metadata {
            info_hash: InfoHash::from([9u8; 20]),
            name: "t".to_owned(),
            piece_length: 16,
            total_length: 16,
            files: vec![FileEntry { path: vec!["t.bin".to_owned()], length: 16 }],
            piece_hashes: vec![hash.into()],
            raw_info: vec![],
        }
    }

    fn new_torrent() -> (Torrent, tokio::sync::mpsc::UnboundedReceiver<TorrentEvent>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let torrent = Torrent::new(InfoHash::from([9u8; 20]), Some(metadata()), "default".to_owned(), TorrentConfig::default(), tx);
        (torrent, rx)
    }

    #[test]
    fn should_emit_metadata_ready_on_construction_with_known_metadata() {
        let (_torrent, mut rx) = new_torrent();
        assert!(matches!(rx.try_recv(), Ok(TorrentEvent::MetadataReady { .. })));
    }

    #[test]
    fn should_report_zero_progress_before_any_data() {
        let (torrent, _rx) = new_torrent();
        let progress = torrent.get_progress();
        assert_eq!(progress.downloaded, 0);
        assert_eq!(progress.total, 16);
    }

    #[test]
    fn should_verify_a_complete_piece_and_mark_the_torrent_done() {
        let (mut torrent, mut rx) = new_torrent();
        let (tx, _cmd_rx) = tokio::sync::mpsc::unbounded_channel();
        let handshake = crate::wire::Handshake::new(InfoHash::from([9u8; 20]), torrentd_primitives::peer_id::PeerId::from([1u8; 20]));
        let address = PeerAddress::new("127.0.0.1:6881".parse().unwrap(), true);
        let mut wire = PeerState::new(address, &handshake, Duration::ZERO);
        wire.peer_choking = false;
        torrent.register_peer("peerA".to_owned(), wire, tx);

        torrent.handle_piece_received("peerA", 0, 0, vec![7u8; 16], Duration::ZERO);

        let mut saw_verified = false;
        let mut saw_complete = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                TorrentEvent::PieceVerified { index: 0, .. } => saw_verified = true,
                TorrentEvent::Complete => saw_complete = true,
                _ => {}
            }
        }
        assert!(saw_verified);
        assert!(saw_complete);
        assert!(torrent.is_complete());
    }

    #[test]
    fn should_ban_the_sole_contributor_on_a_hash_mismatch() {
        let (mut torrent, _rx) = new_torrent();
        let (tx, _cmd_rx) = tokio::sync::mpsc::unbounded_channel();
        let handshake = crate::wire::Handshake::new(InfoHash::from([9u8; 20]), torrentd_primitives::peer_id::PeerId::from([1u8; 20]));
        let address = PeerAddress::new("127.0.0.1:6881".parse().unwrap(), true);
        let mut wire = PeerState::new(address, &handshake, Duration::ZERO);
        wire.peer_choking = false;
        torrent.register_peer("peerA".to_owned(), wire, tx);

        let outgoing = torrent.handle_piece_received("peerA", 0, 0, vec![0u8; 16], Duration::ZERO);
        assert!(outgoing.iter().any(|(key, cmd)| key == "peerA" && *cmd == PeerCommand::Close));
    }

    fn multi_file_metadata() -> Metadata {
        // piece_length 16, two files each spanning exactly one piece.
        let pieces = [[1u8; 16], [2u8; 16]];
        let hashes = pieces
            .iter()
            .map(|piece| {
                let mut hasher = Sha1::new();
                hasher.update(piece);
                hasher.finalize().into()
            })
            .collect();
        Metadata {
            info_hash: InfoHash::from([9u8; 20]),
            name: "t".to_owned(),
            piece_length: 16,
            total_length: 32,
            files: vec![FileEntry { path: vec!["a.bin".to_owned()], length: 16 }, FileEntry { path: vec!["b.bin".to_owned()], length: 16 }],
            piece_hashes: hashes,
            raw_info: vec![],
        }
    }

    fn new_multi_file_torrent() -> (Torrent, tokio::sync::mpsc::UnboundedReceiver<TorrentEvent>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let torrent = Torrent::new(InfoHash::from([9u8; 20]), Some(multi_file_metadata()), "default".to_owned(), TorrentConfig::default(), tx);
        (torrent, rx)
    }

    #[test]
    fn should_default_every_file_to_normal_priority() {
        let (torrent, _rx) = new_multi_file_torrent();
        assert_eq!(torrent.file_priority(0), Some(FilePriority::Normal));
        assert_eq!(torrent.file_priority(1), Some(FilePriority::Normal));
        assert_eq!(torrent.file_priority(2), None);
    }

    #[test]
    fn should_exclude_a_skipped_files_piece_from_rarest_first_order() {
        let (mut torrent, _rx) = new_multi_file_torrent();
        torrent.set_file_priority(0, FilePriority::Skip);
        let order = torrent.rarest_first_order();
        assert_eq!(order, vec![1]);
    }

    #[test]
    fn should_still_fetch_a_piece_spanning_a_skipped_and_wanted_file() {
        let (mut torrent, _rx) = new_multi_file_torrent();
        // Both files map to distinct pieces in this fixture, so emulate the
        // overlap case directly through the layout helper instead.
        let layout = torrent.layout.clone().unwrap();
        assert_eq!(layout.file_piece_range(0, 16), Some((0, 0)));
        assert_eq!(layout.file_piece_range(1, 16), Some((1, 1)));
        torrent.set_file_priority(0, FilePriority::Skip);
        torrent.set_file_priority(1, FilePriority::Normal);
        let order = torrent.rarest_first_order();
        assert!(!order.contains(&0));
        assert!(order.contains(&1));
    }

    #[test]
    fn should_sort_high_priority_pieces_before_normal_ones() {
        let (mut torrent, _rx) = new_multi_file_torrent();
        torrent.set_file_priority(1, FilePriority::High);
        let order = torrent.rarest_first_order();
        assert_eq!(order, vec![1, 0]);
    }

    #[test]
    fn should_ignore_an_out_of_range_file_index() {
        let (mut torrent, _rx) = new_multi_file_torrent();
        torrent.set_file_priority(5, FilePriority::Skip);
        assert_eq!(torrent.file_priority(5), None);
        assert_eq!(torrent.rarest_first_order(), vec![0, 1]);
    }
}
