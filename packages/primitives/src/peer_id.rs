use std::panic::Location;
use std::str::FromStr;

use rand::RngCore;
use thiserror::Error;

/// 20-byte client identifier generated once at engine construction and held
/// stable for the engine's lifetime. Equality and ordering are byte-wise.
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug, PartialOrd, Ord)]
pub struct PeerId(pub [u8; 20]);

pub const PEER_ID_BYTES_LEN: usize = 20;

impl PeerId {
    /// Generates a new random peer id with the given two-character client
    /// prefix (Azureus-style, e.g. `-TD0001-` is built by the caller; this
    /// only fills the trailing random bytes after whatever prefix is given).
    #[must_use]
    pub fn generate(prefix: &[u8]) -> Self {
        let mut bytes = [0u8; 20];
        let take = prefix.len().min(20);
        bytes[..take].copy_from_slice(&prefix[..take]);
        rand::thread_rng().fill_bytes(&mut bytes[take..]);
        Self(bytes)
    }

    #[must_use]
    pub fn bytes(&self) -> [u8; 20] {
        self.0
    }

    #[must_use]
    pub fn to_hex_string(&self) -> String {
        self.to_string()
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self([0u8; 20])
    }
}

impl From<[u8; 20]> for PeerId {
    fn from(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }
}

impl From<PeerId> for aquatic_udp_protocol::PeerId {
    fn from(id: PeerId) -> Self {
        aquatic_udp_protocol::PeerId(id.0)
    }
}

impl From<aquatic_udp_protocol::PeerId> for PeerId {
    fn from(id: aquatic_udp_protocol::PeerId) -> Self {
        Self(id.0)
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut chars = [0u8; 40];
        binascii::bin2hex(&self.0, &mut chars).expect("20 bytes hexlify into a 40 byte buffer");
        write!(f, "{}", std::str::from_utf8(&chars).unwrap())
    }
}

/// Errors converting a byte slice or hex string into a [`PeerId`].
#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("not enough bytes for peer id: {message} {location}")]
    NotEnoughBytes {
        location: &'static Location<'static>,
        message: String,
    },
    #[error("too many bytes for peer id: {message} {location}")]
    TooManyBytes {
        location: &'static Location<'static>,
        message: String,
    },
    #[error("invalid hex string for peer id")]
    InvalidHex,
}

impl FromStr for PeerId {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 40 {
            return Err(ConversionError::InvalidHex);
        }
        let mut bytes = [0u8; 20];
        binascii::hex2bin(s.as_bytes(), &mut bytes).map_err(|_| ConversionError::InvalidHex)?;
        Ok(Self(bytes))
    }
}

impl TryFrom<&[u8]> for PeerId {
    type Error = ConversionError;

    #[track_caller]
    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() < PEER_ID_BYTES_LEN {
            return Err(ConversionError::NotEnoughBytes {
                location: Location::caller(),
                message: format!("got {} bytes, expected {PEER_ID_BYTES_LEN}", bytes.len()),
            });
        }
        if bytes.len() > PEER_ID_BYTES_LEN {
            return Err(ConversionError::TooManyBytes {
                location: Location::caller(),
                message: format!("got {} bytes, expected {PEER_ID_BYTES_LEN}", bytes.len()),
            });
        }
        let mut array = [0u8; 20];
        array.copy_from_slice(bytes);
        Ok(Self(array))
    }
}

impl serde::ser::Serialize for PeerId {
    fn serialize<S: serde::ser::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex_string())
    }
}

impl<'de> serde::de::Deserialize<'de> for PeerId {
    fn deserialize<D: serde::de::Deserializer<'de>>(des: D) -> Result<Self, D::Error> {
        des.deserialize_str(PeerIdVisitor)
    }
}

struct PeerIdVisitor;

impl serde::de::Visitor<'_> for PeerIdVisitor {
    type Value = PeerId;

    fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "a 40 character long hex string")
    }

    fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
        PeerId::from_str(v).map_err(|_| serde::de::Error::invalid_value(serde::de::Unexpected::Str(v), &self))
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::PeerId;

    #[test]
    fn should_roundtrip_through_hex_string() {
        let id = PeerId::generate(b"-TD0001-");
        let hex = id.to_hex_string();
        assert_eq!(PeerId::from_str(&hex).unwrap(), id);
    }

    #[test]
    fn should_keep_the_requested_prefix() {
        let id = PeerId::generate(b"-TD0001-");
        assert_eq!(&id.0[..8], b"-TD0001-");
    }

    #[test]
    fn should_be_stable_for_the_same_bytes() {
        let a = PeerId::from([3u8; 20]);
        let b = PeerId::from([3u8; 20]);
        assert_eq!(a, b);
    }
}
