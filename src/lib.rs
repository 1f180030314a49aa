//! `torrentd` is an embeddable [`BitTorrent`](https://www.bittorrent.org/) client engine.
//!
//! [`BitTorrent`](https://en.wikipedia.org/wiki/BitTorrent) is a protocol for distributing files over a peer-to-peer network.
//! This crate implements the client side of that protocol — downloading and seeding torrents — as a library a host
//! application embeds and drives, not a standalone daemon.
//!
//! You can learn more about `BitTorrent` on these sites:
//!
//! - <https://www.bittorrent.org/>
//! - <https://en.wikipedia.org/wiki/BitTorrent>
//!
//! # Design
//!
//! The engine owns no UI and makes no policy decisions about which torrents to run; it exposes an `Engine` a host
//! constructs with injectable seams for sockets ([`net::SocketFactory`]), disk access ([`storage::FileSystem`]) and
//! state persistence ([`session::SessionStore`]), and drives with `.torrent` files or magnet URIs. Everything
//! stateful lives behind one of those seams or inside a `Torrent`; nothing here reaches for `std::fs`, real sockets,
//! or the system clock directly outside the `tokio`-backed production implementations of those seams.
//!
//! # Modules
//!
//! - [`engine`] — top-level `Engine`: owns every `Torrent`, the DHT node, and the maintenance loop tying them together.
//! - [`torrent`] — per-torrent orchestration: piece selection, pipeline fill, verification.
//! - [`swarm`] — known peer addresses for one torrent, their discovery source, backoff and ban state.
//! - [`peer`] — one peer connection's wire-level state and the choke/unchoke policy.
//! - [`piece`] — in-flight block tracking, endgame mode, and hash verification bookkeeping.
//! - [`wire`] — BEP 3 handshake/messages, BEP 6 fast extension, BEP 10 extension protocol.
//! - [`mse`] — Message Stream Encryption (MSE/PE): DH key exchange and RC4 stream wrapping.
//! - [`tracker`] — HTTP (BEP 3) and UDP (BEP 15) tracker clients.
//! - [`dht`] — Mainline DHT (BEP 5): routing table, KRPC codec, iterative lookups.
//! - [`net`] — injectable socket abstraction (production: `tokio`; tests: in-memory).
//! - [`storage`] — injectable filesystem abstraction, scoped by storage root.
//! - [`session`] — persisted session state: torrent list, per-torrent state, binary blobs.
//! - [`magnet`] — `magnet:` URI parsing (BEP 9).
//! - [`error`] — top-level error types surfaced across the `Engine`/`Torrent` boundary.

pub mod dht;
pub mod engine;
pub mod error;
pub mod magnet;
pub mod mse;
pub mod net;
pub mod peer;
pub mod piece;
pub mod session;
pub mod storage;
pub mod swarm;
pub mod torrent;
pub mod tracker;
pub mod wire;

pub use engine::{Engine, EngineEvent};
pub use error::{EngineError, StartupError};
