//! BEP 3 handshake: 68 bytes exact (spec.md §6.5).

use torrentd_primitives::info_hash::InfoHash;
use torrentd_primitives::peer_id::PeerId;

use super::ProtocolError;

pub const PROTOCOL_STRING: &[u8; 19] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 1 + 19 + 8 + 20 + 20;

const RESERVED_BIT_EXTENSION_PROTOCOL: usize = 20;
const RESERVED_BIT_FAST_EXTENSION: usize = 44;
const RESERVED_BIT_DHT: usize = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    #[must_use]
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        let mut reserved = [0u8; 8];
        set_bit(&mut reserved, RESERVED_BIT_EXTENSION_PROTOCOL);
        set_bit(&mut reserved, RESERVED_BIT_DHT);
        Self { reserved, info_hash, peer_id }
    }

    #[must_use]
    pub fn supports_extension_protocol(&self) -> bool {
        bit(&self.reserved, RESERVED_BIT_EXTENSION_PROTOCOL)
    }

    #[must_use]
    pub fn supports_dht(&self) -> bool {
        bit(&self.reserved, RESERVED_BIT_DHT)
    }

    #[must_use]
    pub fn supports_fast_extension(&self) -> bool {
        bit(&self.reserved, RESERVED_BIT_FAST_EXTENSION)
    }

    #[must_use]
    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut out = [0u8; HANDSHAKE_LEN];
        out[0] = 0x13;
        out[1..20].copy_from_slice(PROTOCOL_STRING);
        out[20..28].copy_from_slice(&self.reserved);
        out[28..48].copy_from_slice(&self.info_hash.bytes());
        out[48..68].copy_from_slice(&self.peer_id.bytes());
        out
    }

    /// # Errors
    ///
    /// Returns [`ProtocolError::BadProtocolString`] if the header byte or
    /// protocol string do not match BEP 3 exactly.
    pub fn decode(bytes: &[u8; HANDSHAKE_LEN]) -> Result<Self, ProtocolError> {
        if bytes[0] != 0x13 || &bytes[1..20] != PROTOCOL_STRING {
            return Err(ProtocolError::BadProtocolString);
        }
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&bytes[20..28]);
        let mut info_hash_bytes = [0u8; 20];
        info_hash_bytes.copy_from_slice(&bytes[28..48]);
        let mut peer_id_bytes = [0u8; 20];
        peer_id_bytes.copy_from_slice(&bytes[48..68]);
        Ok(Self { reserved, info_hash: InfoHash::from(info_hash_bytes), peer_id: PeerId::from(peer_id_bytes) })
    }
}

fn set_bit(reserved: &mut [u8; 8], bit_index: usize) {
    let byte = bit_index / 8;
    let shift = 7 - (bit_index % 8);
    reserved[byte] |= 1 << shift;
}

fn bit(reserved: &[u8; 8], bit_index: usize) -> bool {
    let byte = bit_index / 8;
    let shift = 7 - (bit_index % 8);
    reserved[byte] & (1 << shift) != 0
}

#[cfg(test)]
mod tests {
    use torrentd_primitives::info_hash::InfoHash;
    use torrentd_primitives::peer_id::PeerId;

    use super::{Handshake, HANDSHAKE_LEN};

    #[test]
    fn should_round_trip_through_its_wire_encoding() {
        let handshake = Handshake::new(InfoHash::from([7u8; 20]), PeerId::from([9u8; 20]));
        let encoded = handshake.encode();
        let decoded = Handshake::decode(&encoded).unwrap();
        assert_eq!(handshake, decoded);
    }

    #[test]
    fn should_advertise_extension_protocol_and_dht_by_default() {
        let handshake = Handshake::new(InfoHash::from([0u8; 20]), PeerId::from([0u8; 20]));
        assert!(handshake.supports_extension_protocol());
        assert!(handshake.supports_dht());
        assert!(!handshake.supports_fast_extension());
    }

    #[test]
    fn should_reject_a_bad_protocol_string() {
        let mut bytes = [0u8; HANDSHAKE_LEN];
        bytes[0] = 0x13;
        bytes[1..20].copy_from_slice(b"NotBitTorrentProto!");
        assert!(Handshake::decode(&bytes).is_err());
    }
}
