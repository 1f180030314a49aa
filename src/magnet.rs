//! Magnet URI parsing (BEP 9): `magnet:?xt=urn:btih:<hash>&dn=<name>&tr=<url>...`.
//! Metadata itself is never carried by the URI; a torrent added this way
//! starts with `info_hash` only and resolves `Metadata` later through BEP 9
//! `ut_metadata` exchange (spec.md §3 "Metadata... may arrive either in a
//! `.torrent` file or via BEP-9 metadata exchange").

use torrentd_primitives::info_hash::InfoHash;
use url::Url;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MagnetError {
    #[error("not a magnet: URI")]
    NotAMagnetUri,
    #[error("missing an `xt=urn:btih:<hash>` parameter")]
    MissingInfoHash,
    #[error("`xt` info-hash is neither 40 hex characters nor 32 base32 characters")]
    InvalidInfoHash,
}

/// A parsed magnet link (spec.md §3 `SessionState.source == "magnet"`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {
    pub info_hash: InfoHash,
    pub display_name: Option<String>,
    /// Repeated `tr=` parameters, in the order they appeared (fed straight
    /// into a single-tier [`crate::tracker::TrackerList`] — a magnet link
    /// has no BEP 12 tier structure of its own).
    pub trackers: Vec<String>,
}

/// # Errors
///
/// Returns [`MagnetError::NotAMagnetUri`] if `uri` does not parse as a
/// `magnet:` URI, or [`MagnetError::MissingInfoHash`]/[`MagnetError::InvalidInfoHash`]
/// if `xt=urn:btih:...` is absent or malformed.
pub fn parse(uri: &str) -> Result<MagnetLink, MagnetError> {
    let url = Url::parse(uri).map_err(|_| MagnetError::NotAMagnetUri)?;
    if url.scheme() != "magnet" {
        return Err(MagnetError::NotAMagnetUri);
    }

    let mut info_hash = None;
    let mut display_name = None;
    let mut trackers = Vec::new();

    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "xt" => {
                if let Some(encoded) = value.strip_prefix("urn:btih:") {
                    info_hash = Some(decode_btih(encoded)?);
                }
            }
            "dn" => display_name = Some(value.into_owned()),
            "tr" => trackers.push(value.into_owned()),
            _ => {}
        }
    }

    Ok(MagnetLink { info_hash: info_hash.ok_or(MagnetError::MissingInfoHash)?, display_name, trackers })
}

fn decode_btih(encoded: &str) -> Result<InfoHash, MagnetError> {
    if encoded.len() == 40 {
        encoded.parse::<InfoHash>().map_err(|_| MagnetError::InvalidInfoHash)
    } else if encoded.len() == 32 {
        let bytes = base32_decode(encoded).ok_or(MagnetError::InvalidInfoHash)?;
        let bytes: [u8; 20] = bytes.try_into().map_err(|_| MagnetError::InvalidInfoHash)?;
        Ok(InfoHash::from(bytes))
    } else {
        Err(MagnetError::InvalidInfoHash)
    }
}

/// RFC 4648 base32 decode (no padding), the legacy encoding some magnet
/// links still use for `xt=urn:btih:` alongside the more common hex form.
fn base32_decode(input: &str) -> Option<Vec<u8>> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut bits: u64 = 0;
    let mut bit_count = 0u32;
    let mut out = Vec::with_capacity(input.len() * 5 / 8);
    for ch in input.to_ascii_uppercase().bytes() {
        let value = ALPHABET.iter().position(|&c| c == ch)? as u64;
        bits = (bits << 5) | value;
        bit_count += 5;
        if bit_count >= 8 {
            bit_count -= 8;
            out.push(((bits >> bit_count) & 0xFF) as u8);
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_parse_a_hex_info_hash_with_trackers_and_name() {
        let link = parse(
            "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=My+Torrent&tr=http%3A%2F%2Fa%2Fannounce&tr=http%3A%2F%2Fb%2Fannounce",
        )
        .unwrap();
        assert_eq!(link.display_name.as_deref(), Some("My Torrent"));
        assert_eq!(link.trackers, vec!["http://a/announce".to_owned(), "http://b/announce".to_owned()]);
    }

    #[test]
    fn should_reject_a_non_magnet_uri() {
        assert_eq!(parse("http://example.com"), Err(MagnetError::NotAMagnetUri));
    }

    #[test]
    fn should_reject_a_magnet_uri_with_no_xt_parameter() {
        assert_eq!(parse("magnet:?dn=no-hash-here"), Err(MagnetError::MissingInfoHash));
    }

    #[test]
    fn should_round_trip_a_base32_info_hash() {
        let hex = "0123456789abcdef0123456789abcdef01234567";
        let expected: InfoHash = hex.parse().unwrap();
        let base32 = base32_encode_for_test(&expected.bytes());
        let uri = format!("magnet:?xt=urn:btih:{base32}");
        assert_eq!(parse(&uri).unwrap().info_hash, expected);
    }

    fn base32_encode_for_test(bytes: &[u8]) -> String {
        const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
        let mut bits: u64 = 0;
        let mut bit_count = 0u32;
        let mut out = String::new();
        for &byte in bytes {
            bits = (bits << 8) | u64::from(byte);
            bit_count += 8;
            while bit_count >= 5 {
                bit_count -= 5;
                out.push(ALPHABET[((bits >> bit_count) & 0x1F) as usize] as char);
            }
        }
        if bit_count > 0 {
            out.push(ALPHABET[((bits << (5 - bit_count)) & 0x1F) as usize] as char);
        }
        out
    }
}
