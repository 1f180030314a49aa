//! BEP 10 extended handshake and its negotiated sub-extensions: `ut_pex`,
//! `ut_metadata` (BEP 9), `lt_donthave` (spec.md §4.3).
//!
//! PEX IPv6 records are 18 bytes (`ip(16)||port(2)`) per spec.md §6.5 — the
//! source's known bug of reusing the 6-byte IPv4 record length for `added6`/
//! `dropped6` must not reappear here.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use bencode::{ben_bytes, ben_int, ben_map, BDictAccess, BMutAccess, BRefAccess, BencodeMut, BencodeRef};

use super::ProtocolError;

pub const EXTENSION_UT_PEX: &str = "ut_pex";
pub const EXTENSION_UT_METADATA: &str = "ut_metadata";
pub const EXTENSION_LT_DONTHAVE: &str = "lt_donthave";

/// The decoded `m: {name: id}` table plus the peer's advertised client
/// version string, from the extended-handshake message (`ext_id=0`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtendedHandshake {
    pub supported: BTreeMap<String, u8>,
    pub client_version: Option<String>,
    pub metadata_size: Option<u32>,
}

impl ExtendedHandshake {
    #[must_use]
    pub fn new(supported: BTreeMap<String, u8>, client_version: Option<String>, metadata_size: Option<u32>) -> Self {
        Self { supported, client_version, metadata_size }
    }

    #[must_use]
    pub fn extension_id(&self, name: &str) -> Option<u8> {
        self.supported.get(name).copied()
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut m = BencodeMut::new_dict();
        {
            let m_dict = m.dict_mut().expect("freshly constructed dict");
            for (name, id) in &self.supported {
                m_dict.insert(name.as_bytes().into(), ben_int!(i64::from(*id)));
            }
        }

        let mut top = ben_map! {
            "m" => m
        };
        {
            let dict = top.dict_mut().expect("freshly constructed dict");
            if let Some(version) = &self.client_version {
                dict.insert("v".as_bytes().into(), ben_bytes!(version.as_bytes()));
            }
            if let Some(size) = self.metadata_size {
                dict.insert("metadata_size".as_bytes().into(), ben_int!(i64::from(size)));
            }
        }
        top.encode()
    }

    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedExtensionDict`] if `bytes` is not a
    /// bencoded dictionary with an `m` sub-dictionary of integers.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let decoded =
            BencodeRef::decode(bytes, bencode::BDecodeOpt::default()).map_err(|e| ProtocolError::MalformedExtensionDict(e.to_string()))?;
        let dict = decoded.dict().ok_or_else(|| ProtocolError::MalformedExtensionDict("not a dictionary".to_owned()))?;

        let m_dict = dict
            .lookup(b"m")
            .and_then(BRefAccess::dict)
            .ok_or_else(|| ProtocolError::MalformedExtensionDict("missing `m` dictionary".to_owned()))?;

        let mut supported = BTreeMap::new();
        for (key, value) in m_dict.to_list() {
            let name = std::str::from_utf8(*key).map_err(|_| ProtocolError::MalformedExtensionDict("non-utf8 extension name".to_owned()))?;
            let id = BRefAccess::int(value).ok_or_else(|| ProtocolError::MalformedExtensionDict("extension id not an integer".to_owned()))?;
            #[allow(clippy::cast_possible_truncation)]
            supported.insert(name.to_owned(), id as u8);
        }

        let client_version = dict.lookup(b"v").and_then(BRefAccess::str).map(str::to_owned);
        let metadata_size = dict.lookup(b"metadata_size").and_then(BRefAccess::int).map(|n| n as u32);

        Ok(Self { supported, client_version, metadata_size })
    }
}

/// One `ut_pex` payload direction (added or dropped peers).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PexDelta {
    pub added_v4: Vec<SocketAddrV4>,
    pub dropped_v4: Vec<SocketAddrV4>,
    pub added_v6: Vec<SocketAddrV6>,
    pub dropped_v6: Vec<SocketAddrV6>,
}

impl PexDelta {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut top = BencodeMut::new_dict();
        {
            let dict = top.dict_mut().expect("freshly constructed dict");
            dict.insert("added".as_bytes().into(), ben_bytes!(encode_v4(&self.added_v4)));
            dict.insert("dropped".as_bytes().into(), ben_bytes!(encode_v4(&self.dropped_v4)));
            dict.insert("added6".as_bytes().into(), ben_bytes!(encode_v6(&self.added_v6)));
            dict.insert("dropped6".as_bytes().into(), ben_bytes!(encode_v6(&self.dropped_v6)));
        }
        top.encode()
    }

    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedExtensionDict`] on non-dictionary
    /// input or compact-peer byte strings whose length is not a multiple of
    /// the expected record size (6 bytes for v4, 18 for v6).
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let decoded =
            BencodeRef::decode(bytes, bencode::BDecodeOpt::default()).map_err(|e| ProtocolError::MalformedExtensionDict(e.to_string()))?;
        let dict = decoded.dict().ok_or_else(|| ProtocolError::MalformedExtensionDict("not a dictionary".to_owned()))?;

        Ok(Self {
            added_v4: decode_v4(dict.lookup(b"added").and_then(BRefAccess::bytes).unwrap_or(&[]))?,
            dropped_v4: decode_v4(dict.lookup(b"dropped").and_then(BRefAccess::bytes).unwrap_or(&[]))?,
            added_v6: decode_v6(dict.lookup(b"added6").and_then(BRefAccess::bytes).unwrap_or(&[]))?,
            dropped_v6: decode_v6(dict.lookup(b"dropped6").and_then(BRefAccess::bytes).unwrap_or(&[]))?,
        })
    }
}

fn encode_v4(addrs: &[SocketAddrV4]) -> Vec<u8> {
    let mut out = Vec::with_capacity(addrs.len() * 6);
    for addr in addrs {
        out.extend_from_slice(&addr.ip().octets());
        out.extend_from_slice(&addr.port().to_be_bytes());
    }
    out
}

fn decode_v4(bytes: &[u8]) -> Result<Vec<SocketAddrV4>, ProtocolError> {
    if bytes.len() % 6 != 0 {
        return Err(ProtocolError::MalformedExtensionDict("compact ipv4 peer list has wrong length".to_owned()));
    }
    Ok(bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddrV4::new(ip, port)
        })
        .collect())
}

/// BEP 6.5: "IPv6: 18 bytes, `ip(16)||port(2)`" — both `added6` and
/// `dropped6` use this 18-byte record, not the 6-byte v4 record.
fn encode_v6(addrs: &[SocketAddrV6]) -> Vec<u8> {
    let mut out = Vec::with_capacity(addrs.len() * 18);
    for addr in addrs {
        out.extend_from_slice(&addr.ip().octets());
        out.extend_from_slice(&addr.port().to_be_bytes());
    }
    out
}

fn decode_v6(bytes: &[u8]) -> Result<Vec<SocketAddrV6>, ProtocolError> {
    if bytes.len() % 18 != 0 {
        return Err(ProtocolError::MalformedExtensionDict("compact ipv6 peer list has wrong length".to_owned()));
    }
    Ok(bytes
        .chunks_exact(18)
        .map(|chunk| {
            let mut ip_bytes = [0u8; 16];
            ip_bytes.copy_from_slice(&chunk[..16]);
            let ip = Ipv6Addr::from(ip_bytes);
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            SocketAddrV6::new(ip, port, 0, 0)
        })
        .collect())
}

#[must_use]
pub fn socket_addr_v4(addr: SocketAddr) -> Option<SocketAddrV4> {
    match addr {
        SocketAddr::V4(v4) => Some(v4),
        SocketAddr::V6(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_round_trip_an_extended_handshake() {
        let mut supported = BTreeMap::new();
        supported.insert(EXTENSION_UT_METADATA.to_owned(), 1);
        supported.insert(EXTENSION_UT_PEX.to_owned(), 2);
        let handshake = ExtendedHandshake::new(supported, Some("torrentd/3.0".to_owned()), Some(16384));

        let encoded = handshake.encode();
        let decoded = ExtendedHandshake::decode(&encoded).unwrap();

        assert_eq!(decoded.extension_id(EXTENSION_UT_METADATA), Some(1));
        assert_eq!(decoded.extension_id(EXTENSION_UT_PEX), Some(2));
        assert_eq!(decoded.client_version.as_deref(), Some("torrentd/3.0"));
        assert_eq!(decoded.metadata_size, Some(16384));
    }

    #[test]
    fn should_round_trip_pex_deltas_with_eighteen_byte_ipv6_records() {
        let delta = PexDelta {
            added_v4: vec![SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 6881)],
            dropped_v4: vec![],
            added_v6: vec![SocketAddrV6::new(Ipv6Addr::LOCALHOST, 6881, 0, 0)],
            dropped_v6: vec![],
        };

        let encoded = delta.encode();
        let decoded = PexDelta::decode(&encoded).unwrap();

        assert_eq!(decoded.added_v4, delta.added_v4);
        assert_eq!(decoded.added_v6, delta.added_v6);
    }

    #[test]
    fn should_reject_a_compact_ipv6_list_whose_length_is_not_a_multiple_of_eighteen() {
        let result = decode_v6(&[0u8; 17]);
        assert!(result.is_err());
    }
}
