//! Peer wire protocol: BEP 3 handshake and messages, BEP 6 fast extension,
//! BEP 10 extension protocol (spec.md §4.3, §6.5).

pub mod codec;
pub mod extension;
pub mod handshake;
pub mod message;
pub mod ut_metadata;

pub use codec::{decode_message, encode_message};
pub use handshake::Handshake;
pub use message::Message;
pub use ut_metadata::MetadataMessage;

pub const WIRE_LOG_TARGET: &str = "WIRE";

/// Hard ceiling for non-`Piece` message length (spec.md §4.3).
pub const MAX_NON_PIECE_MESSAGE_LEN: u32 = 1024 * 1024;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("handshake protocol string mismatch")]
    BadProtocolString,
    #[error("handshake info-hash does not match any known torrent")]
    UnknownInfoHash,
    #[error("handshake peer-id did not match the expected outgoing target")]
    PeerIdMismatch,
    #[error("message of length {length} exceeds the {limit}-byte ceiling")]
    MessageTooLarge { length: u32, limit: u32 },
    #[error("have(index={index}) is out of range for {piece_count} pieces")]
    HaveOutOfRange { index: u32, piece_count: u32 },
    #[error("bitfield has wrong length for {piece_count} pieces")]
    BadBitfieldLength { piece_count: u32 },
    #[error("request for a piece we do not advertise: index={index}")]
    RequestForUnadvertisedPiece { index: u32 },
    #[error("piece block (index={index}, begin={begin}, length={length}) was never requested")]
    UnrequestedPiece { index: u32, begin: u32, length: u32 },
    #[error("unknown message id {0}")]
    UnknownMessageId(u8),
    #[error("truncated message")]
    Truncated,
    #[error("malformed extended-handshake dictionary: {0}")]
    MalformedExtensionDict(String),
}
