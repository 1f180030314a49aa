//! BEP 9 (`ut_metadata`) messages: `request`/`data`/`reject` for fetching a
//! torrent's `info` dictionary after a magnet-link handshake (spec.md §3,
//! SPEC_FULL.md §4.3 supplement).
//!
//! Each message is a bencoded dictionary `{msg_type, piece}` (plus
//! `total_size` on `data`) immediately followed — for `data` only — by the
//! raw 16 KiB metadata piece bytes, appended after the dictionary rather
//! than embedded in it.

use bencode::{ben_int, ben_map, BDictAccess, BRefAccess, BencodeMut, BencodeRef};

use super::ProtocolError;

const MSG_TYPE_REQUEST: i64 = 0;
const MSG_TYPE_DATA: i64 = 1;
const MSG_TYPE_REJECT: i64 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMessage {
    Request { piece: u32 },
    Data { piece: u32, total_size: u32, data: Vec<u8> },
    Reject { piece: u32 },
}

impl MetadataMessage {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            MetadataMessage::Request { piece } => encode_dict(MSG_TYPE_REQUEST, *piece, None),
            MetadataMessage::Reject { piece } => encode_dict(MSG_TYPE_REJECT, *piece, None),
            MetadataMessage::Data { piece, total_size, data } => {
                let mut out = encode_dict(MSG_TYPE_DATA, *piece, Some(*total_size));
                out.extend_from_slice(data);
                out
            }
        }
    }

    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedExtensionDict`] if the leading
    /// bencoded dictionary is missing `msg_type`/`piece`, or `data` is
    /// missing `total_size`.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let decoded = BencodeRef::decode(bytes, bencode::BDecodeOpt::new(50, false, false))
            .map_err(|e| ProtocolError::MalformedExtensionDict(e.to_string()))?;
        let dict_len = decoded.buffer().len();
        let dict = decoded.dict().ok_or_else(|| ProtocolError::MalformedExtensionDict("not a dictionary".to_owned()))?;

        let msg_type = dict
            .lookup(b"msg_type")
            .and_then(BRefAccess::int)
            .ok_or_else(|| ProtocolError::MalformedExtensionDict("missing msg_type".to_owned()))?;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let piece = dict
            .lookup(b"piece")
            .and_then(BRefAccess::int)
            .ok_or_else(|| ProtocolError::MalformedExtensionDict("missing piece".to_owned()))? as u32;

        match msg_type {
            MSG_TYPE_REQUEST => Ok(MetadataMessage::Request { piece }),
            MSG_TYPE_REJECT => Ok(MetadataMessage::Reject { piece }),
            MSG_TYPE_DATA => {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let total_size = dict
                    .lookup(b"total_size")
                    .and_then(BRefAccess::int)
                    .ok_or_else(|| ProtocolError::MalformedExtensionDict("data message missing total_size".to_owned()))?
                    as u32;
                let trailing = bytes.get(dict_len..).unwrap_or(&[]).to_vec();
                Ok(MetadataMessage::Data { piece, total_size, data: trailing })
            }
            other => Err(ProtocolError::MalformedExtensionDict(format!("unknown ut_metadata msg_type {other}"))),
        }
    }
}

fn encode_dict(msg_type: i64, piece: u32, total_size: Option<u32>) -> Vec<u8> {
    let mut top = ben_map! {
        "msg_type" => ben_int!(msg_type),
        "piece" => ben_int!(i64::from(piece))
    };
    if let Some(total_size) = total_size {
        let dict = top.dict_mut().expect("freshly constructed dict");
        dict.insert("total_size".as_bytes().into(), BencodeMut::new_int(i64::from(total_size)));
    }
    top.encode()
}

#[cfg(test)]
mod tests {
    use super::MetadataMessage;

    #[test]
    fn should_round_trip_a_request() {
        let msg = MetadataMessage::Request { piece: 3 };
        let encoded = msg.encode();
        assert_eq!(MetadataMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn should_round_trip_a_reject() {
        let msg = MetadataMessage::Reject { piece: 1 };
        let encoded = msg.encode();
        assert_eq!(MetadataMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn should_round_trip_data_with_trailing_payload_bytes() {
        let msg = MetadataMessage::Data { piece: 0, total_size: 4, data: vec![1, 2, 3, 4] };
        let encoded = msg.encode();
        let decoded = MetadataMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }
}
