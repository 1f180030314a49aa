//! Torrent metadata: name, piece layout, per-file layout, and piece hashes.
//! Parsed either from a complete `.torrent` file (§3: "Metadata... may
//! arrive either in a `.torrent` file or via BEP-9 metadata exchange").
//!
//! The info-hash is always computed from the *raw bencoded bytes* of the
//! `info` dictionary rather than a re-serialization of a parsed struct, so
//! that unknown/extra keys and the original key order are preserved exactly
//! as the remote peer or `.torrent` author wrote them.

use bencode::{BDictAccess, BRefAccess, BencodeRef};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::info_hash::InfoHash;

pub const BLOCK_SIZE: usize = 16 * 1024;
/// BEP 9 metadata is exchanged in fixed 16 KiB pieces regardless of the
/// torrent's own piece size.
pub const METADATA_PIECE_SIZE: usize = 16 * 1024;

/// One entry in a multi-file torrent's file list, in the order BEP 3 `info.files` lists them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path components relative to the torrent's root directory.
    pub path: Vec<String>,
    pub length: u64,
}

/// Parsed torrent metadata (the `info` dictionary plus the computed hash).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub info_hash: InfoHash,
    pub name: String,
    pub piece_length: u32,
    pub total_length: u64,
    pub files: Vec<FileEntry>,
    pub piece_hashes: Vec<[u8; 20]>,
    /// The raw bencoded `info` dictionary, kept so it can be handed out
    /// verbatim over BEP 9 `ut_metadata` without re-encoding.
    #[serde(with = "serde_bytes_vec")]
    pub raw_info: Vec<u8>,
}

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("failed to parse bencoded data: {0}")]
    BencodeParse(String),
    #[error("missing required field `{0}` in info dictionary")]
    MissingField(&'static str),
    #[error("info dictionary has both `length` and `files` fields, or neither")]
    AmbiguousLayout,
    #[error("piece hash list length ({0}) is not a multiple of 20 bytes")]
    InvalidPieceHashLength(usize),
}

impl Metadata {
    /// Parses a complete `.torrent` file's top-level dictionary and extracts
    /// the `info` sub-dictionary, computing its info-hash from the raw bytes.
    pub fn from_torrent_file_bytes(bytes: &[u8]) -> Result<Self, MetadataError> {
        let decoded =
            BencodeRef::decode(bytes, bencode::BDecodeOpt::default()).map_err(|e| MetadataError::BencodeParse(e.to_string()))?;
        let top = decoded.dict().ok_or(MetadataError::MissingField("<root>"))?;
        let info = top.lookup(b"info").ok_or(MetadataError::MissingField("info"))?;
        Self::from_info_bencode(info)
    }

    /// Parses just the raw bytes of a BEP 9 assembled `info` dictionary
    /// (what `ut_metadata` transfers piece by piece), verifying they decode
    /// cleanly before use.
    pub fn from_info_dict_bytes(raw_info: &[u8]) -> Result<Self, MetadataError> {
        let info =
            BencodeRef::decode(raw_info, bencode::BDecodeOpt::default()).map_err(|e| MetadataError::BencodeParse(e.to_string()))?;
        Self::from_info_bencode(&info)
    }

    fn from_info_bencode(info: &BencodeRef<'_>) -> Result<Self, MetadataError> {
        let raw_info = info.buffer().to_vec();
        let info_hash = InfoHash::from(sha1_20(&raw_info));

        let dict = info.dict().ok_or(MetadataError::MissingField("info"))?;

        let name = dict
            .lookup(b"name")
            .and_then(BRefAccess::str)
            .map(str::to_owned)
            .ok_or(MetadataError::MissingField("name"))?;

        let piece_length = dict
            .lookup(b"piece length")
            .and_then(BRefAccess::int)
            .ok_or(MetadataError::MissingField("piece length"))?;

        let pieces = dict
            .lookup(b"pieces")
            .and_then(BRefAccess::bytes)
            .ok_or(MetadataError::MissingField("pieces"))?;
        if pieces.len() % 20 != 0 {
            return Err(MetadataError::InvalidPieceHashLength(pieces.len()));
        }
        let piece_hashes = pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let single_length = dict.lookup(b"length").and_then(BRefAccess::int);
        let files_list = dict.lookup(b"files").and_then(BRefAccess::list);

        let files = match (single_length, files_list) {
            (Some(length), None) => vec![FileEntry {
                path: vec![name.clone()],
                length: u64::try_from(length).unwrap_or_default(),
            }],
            (None, Some(list)) => {
                let mut files = Vec::new();
                for i in 0..list.len() {
                    let entry = list.get(i).ok_or(MetadataError::MissingField("files[]"))?;
                    let entry_dict = entry.dict().ok_or(MetadataError::MissingField("files[]"))?;
                    let length = entry_dict
                        .lookup(b"length")
                        .and_then(BRefAccess::int)
                        .ok_or(MetadataError::MissingField("files[].length"))?;
                    let path_list = entry_dict
                        .lookup(b"path")
                        .and_then(BRefAccess::list)
                        .ok_or(MetadataError::MissingField("files[].path"))?;
                    let mut path = Vec::new();
                    for j in 0..path_list.len() {
                        let component = path_list
                            .get(j)
                            .and_then(BRefAccess::str)
                            .ok_or(MetadataError::MissingField("files[].path[]"))?;
                        path.push(component.to_owned());
                    }
                    files.push(FileEntry {
                        path,
                        length: u64::try_from(length).unwrap_or_default(),
                    });
                }
                files
            }
            _ => return Err(MetadataError::AmbiguousLayout),
        };

        let total_length = files.iter().map(|f| f.length).sum();

        Ok(Self {
            info_hash,
            name,
            #[allow(clippy::cast_possible_truncation)]
            piece_length: piece_length as u32,
            total_length,
            files,
            piece_hashes,
            raw_info,
        })
    }

    #[must_use]
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Length of piece `index`, accounting for the (possibly shorter) final piece.
    #[must_use]
    pub fn piece_length(&self, index: usize) -> u32 {
        if index + 1 == self.piece_count() {
            let remainder = self.total_length % u64::from(self.piece_length);
            if remainder == 0 {
                self.piece_length
            } else {
                #[allow(clippy::cast_possible_truncation)]
                {
                    remainder as u32
                }
            }
        } else {
            self.piece_length
        }
    }

    /// Number of 16 KiB metadata pieces needed to transfer `raw_info` over BEP 9.
    #[must_use]
    pub fn metadata_piece_count(&self) -> usize {
        (self.raw_info.len() + METADATA_PIECE_SIZE - 1) / METADATA_PIECE_SIZE
    }
}

fn sha1_20(bytes: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

mod serde_bytes_vec {
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        serde_bytes::serialize(bytes, ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        serde_bytes::deserialize(de)
    }
}

#[cfg(test)]
mod tests {
    use super::Metadata;

    fn single_file_torrent() -> Vec<u8> {
        let raw = b"d8:announce4:foo:4:infod6:lengthi10e4:name8:file.txt12:piece lengthi16384e6:pieces20:aaaaaaaaaaaaaaaaaaaaee";
        raw.to_vec()
    }

    #[test]
    fn should_parse_a_single_file_torrent() {
        let metadata = Metadata::from_torrent_file_bytes(&single_file_torrent()).unwrap();
        assert_eq!(metadata.name, "file.txt");
        assert_eq!(metadata.total_length, 10);
        assert_eq!(metadata.piece_count(), 1);
        assert_eq!(metadata.files.len(), 1);
        assert_eq!(metadata.files[0].path, vec!["file.txt".to_string()]);
    }

    #[test]
    fn should_round_trip_info_hash_from_raw_info_bytes() {
        let metadata = Metadata::from_torrent_file_bytes(&single_file_torrent()).unwrap();
        let reparsed = Metadata::from_info_dict_bytes(&metadata.raw_info).unwrap();
        assert_eq!(metadata.info_hash, reparsed.info_hash);
    }
}
