//! KRPC: the bencoded-dictionary RPC encoding the DHT runs over UDP
//! (spec.md §4.7, §6.5). One dictionary per packet, `t`/`y`/`q|r|e`/`v?`.
//!
//! Queries and the generic response shape are modeled as `serde`-derived
//! enums serialized with `serde_bencode`, the same flatten-plus-internal-tag
//! shape `dht-crawler`'s `krpc_protocol` crate uses (see
//! `examples/other_examples/2604b3f4_..._messages.rs.rs`), adapted to this
//! engine's naming and to a single generic response struct (KRPC responses
//! carry no query name, so the field set is a superset covering every query
//! this engine sends).

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use super::node_id::NodeId;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum KrpcCodecError {
    #[error("failed to decode krpc message: {0}")]
    Decode(String),
    #[error("failed to encode krpc message: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    #[serde(rename = "t", with = "serde_bytes")]
    pub transaction_id: Vec<u8>,
    #[serde(flatten)]
    pub body: Body,
    #[serde(rename = "v", default, skip_serializing_if = "Option::is_none")]
    pub version: Option<ByteBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "y")]
pub enum Body {
    #[serde(rename = "q")]
    Query {
        #[serde(flatten)]
        query: Query,
    },
    #[serde(rename = "r")]
    Response {
        #[serde(rename = "r")]
        response: Response,
    },
    #[serde(rename = "e")]
    Error {
        #[serde(rename = "e")]
        error: KrpcError,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "q", content = "a")]
pub enum Query {
    #[serde(rename = "ping")]
    Ping { #[serde(with = "serde_bytes")] id: Vec<u8> },
    #[serde(rename = "find_node")]
    FindNode {
        #[serde(with = "serde_bytes")]
        id: Vec<u8>,
        #[serde(with = "serde_bytes")]
        target: Vec<u8>,
    },
    #[serde(rename = "get_peers")]
    GetPeers {
        #[serde(with = "serde_bytes")]
        id: Vec<u8>,
        #[serde(rename = "info_hash", with = "serde_bytes")]
        info_hash: Vec<u8>,
    },
    #[serde(rename = "announce_peer")]
    AnnouncePeer {
        #[serde(with = "serde_bytes")]
        id: Vec<u8>,
        #[serde(rename = "info_hash", with = "serde_bytes")]
        info_hash: Vec<u8>,
        port: u16,
        #[serde(with = "serde_bytes")]
        token: Vec<u8>,
        #[serde(default, rename = "implied_port", skip_serializing_if = "Option::is_none")]
        implied_port: Option<u8>,
    },
}

/// Every response this engine can receive, in one struct (KRPC responses
/// don't repeat the query name, so the shape is inferred by the transaction
/// manager from the pending query it answers).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Response {
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<ByteBuf>,
    /// Compact node list (`26*N` bytes), present on `find_node`/`get_peers`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<ByteBuf>,
    /// Compact peer entries, present on a `get_peers` hit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<ByteBuf>>,
}

/// `(code, message)` per BEP 5 (spec.md §7: `KrpcError(code, msg)`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KrpcError(pub i64, pub String);

impl Envelope {
    #[must_use]
    pub fn query(transaction_id: Vec<u8>, query: Query) -> Self {
        Self { transaction_id, body: Body::Query { query }, version: None }
    }

    #[must_use]
    pub fn response(transaction_id: Vec<u8>, response: Response) -> Self {
        Self { transaction_id, body: Body::Response { response }, version: None }
    }

    #[must_use]
    pub fn error(transaction_id: Vec<u8>, error: KrpcError) -> Self {
        Self { transaction_id, body: Body::Error { error }, version: None }
    }

    /// # Errors
    ///
    /// Returns [`KrpcCodecError::Decode`] on malformed bencode or a shape
    /// that doesn't match any known query/response/error variant.
    pub fn decode(bytes: &[u8]) -> Result<Self, KrpcCodecError> {
        serde_bencode::de::from_bytes(bytes).map_err(|e| KrpcCodecError::Decode(e.to_string()))
    }

    /// # Errors
    ///
    /// Returns [`KrpcCodecError::Encode`] if `serde_bencode` fails to
    /// serialize the envelope (practically unreachable for well-formed data).
    pub fn encode(&self) -> Result<Vec<u8>, KrpcCodecError> {
        serde_bencode::ser::to_bytes(self).map_err(|e| KrpcCodecError::Encode(e.to_string()))
    }
}

/// Encodes a node id's `Vec<u8>` payload from a [`NodeId`].
#[must_use]
pub fn id_bytes(id: NodeId) -> Vec<u8> {
    id.bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_round_trip_a_ping_query() {
        let envelope = Envelope::query(vec![0, 1], Query::Ping { id: vec![7u8; 20] });
        let encoded = envelope.encode().unwrap();
        let decoded = Envelope::decode(&encoded).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn should_round_trip_a_find_node_response() {
        let response = Response { id: vec![1u8; 20], ..Default::default() };
        let envelope = Envelope::response(vec![9, 9], response);
        let encoded = envelope.encode().unwrap();
        let decoded = Envelope::decode(&encoded).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn should_round_trip_a_get_peers_response_with_values_and_token() {
        let response = Response {
            id: vec![2u8; 20],
            token: Some(ByteBuf::from(vec![1, 2, 3, 4])),
            nodes: None,
            values: Some(vec![ByteBuf::from(vec![127, 0, 0, 1, 0x1a, 0xe1])]),
        };
        let envelope = Envelope::response(vec![0, 1], response);
        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn should_round_trip_an_error() {
        let envelope = Envelope::error(vec![1, 2], KrpcError(202, "Server Error".to_owned()));
        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn should_silently_fail_to_decode_garbage_rather_than_panic() {
        assert!(Envelope::decode(b"not bencode").is_err());
    }
}
