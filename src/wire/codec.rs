//! Length-prefixed message framing: 4-byte big-endian length, then an id
//! byte (absent when length is zero, the keepalive), then payload
//! (spec.md §6.5).

use super::message::{
    Message, ID_ALLOWED_FAST, ID_BITFIELD, ID_CANCEL, ID_CHOKE, ID_EXTENDED, ID_HAVE, ID_HAVE_ALL, ID_HAVE_NONE, ID_INTERESTED,
    ID_NOT_INTERESTED, ID_PIECE, ID_PORT, ID_REJECT_REQUEST, ID_REQUEST, ID_SUGGEST_PIECE, ID_UNCHOKE,
};
use super::ProtocolError;

/// Encodes one complete frame (length prefix included).
#[must_use]
pub fn encode_message(message: &Message) -> Vec<u8> {
    let mut out = Vec::new();
    match message {
        Message::KeepAlive => {
            out.extend_from_slice(&0u32.to_be_bytes());
        }
        Message::Choke => push_frame(&mut out, ID_CHOKE, &[]),
        Message::Unchoke => push_frame(&mut out, ID_UNCHOKE, &[]),
        Message::Interested => push_frame(&mut out, ID_INTERESTED, &[]),
        Message::NotInterested => push_frame(&mut out, ID_NOT_INTERESTED, &[]),
        Message::Have { index } => push_frame(&mut out, ID_HAVE, &index.to_be_bytes()),
        Message::Bitfield { bytes } => push_frame(&mut out, ID_BITFIELD, bytes),
        Message::Request { index, begin, length } => {
            let mut payload = Vec::with_capacity(12);
            payload.extend_from_slice(&index.to_be_bytes());
            payload.extend_from_slice(&begin.to_be_bytes());
            payload.extend_from_slice(&length.to_be_bytes());
            push_frame(&mut out, ID_REQUEST, &payload);
        }
        Message::Piece { index, begin, data } => {
            let mut payload = Vec::with_capacity(8 + data.len());
            payload.extend_from_slice(&index.to_be_bytes());
            payload.extend_from_slice(&begin.to_be_bytes());
            payload.extend_from_slice(data);
            push_frame(&mut out, ID_PIECE, &payload);
        }
        Message::Cancel { index, begin, length } => {
            let mut payload = Vec::with_capacity(12);
            payload.extend_from_slice(&index.to_be_bytes());
            payload.extend_from_slice(&begin.to_be_bytes());
            payload.extend_from_slice(&length.to_be_bytes());
            push_frame(&mut out, ID_CANCEL, &payload);
        }
        Message::Port { port } => push_frame(&mut out, ID_PORT, &port.to_be_bytes()),
        Message::HaveAll => push_frame(&mut out, ID_HAVE_ALL, &[]),
        Message::HaveNone => push_frame(&mut out, ID_HAVE_NONE, &[]),
        Message::SuggestPiece { index } => push_frame(&mut out, ID_SUGGEST_PIECE, &index.to_be_bytes()),
        Message::RejectRequest { index, begin, length } => {
            let mut payload = Vec::with_capacity(12);
            payload.extend_from_slice(&index.to_be_bytes());
            payload.extend_from_slice(&begin.to_be_bytes());
            payload.extend_from_slice(&length.to_be_bytes());
            push_frame(&mut out, ID_REJECT_REQUEST, &payload);
        }
        Message::AllowedFast { index } => push_frame(&mut out, ID_ALLOWED_FAST, &index.to_be_bytes()),
        Message::Extended { extension_id, payload } => {
            let mut full_payload = Vec::with_capacity(1 + payload.len());
            full_payload.push(*extension_id);
            full_payload.extend_from_slice(payload);
            push_frame(&mut out, ID_EXTENDED, &full_payload);
        }
    }
    out
}

fn push_frame(out: &mut Vec<u8>, id: u8, payload: &[u8]) {
    let len = 1 + payload.len() as u32;
    out.extend_from_slice(&len.to_be_bytes());
    out.push(id);
    out.extend_from_slice(payload);
}

/// Decodes a single message whose complete frame (length prefix included) is
/// already present in `frame`. Callers are responsible for buffering partial
/// reads until a full frame is available; this function never reads past
/// `frame`'s end.
///
/// # Errors
///
/// Returns [`ProtocolError::MessageTooLarge`], [`ProtocolError::Truncated`],
/// or [`ProtocolError::UnknownMessageId`] as appropriate.
pub fn decode_message(frame: &[u8], max_len: u32) -> Result<Message, ProtocolError> {
    if frame.len() < 4 {
        return Err(ProtocolError::Truncated);
    }
    let length = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
    if length == 0 {
        return Ok(Message::KeepAlive);
    }
    if frame.len() < 4 + length as usize {
        return Err(ProtocolError::Truncated);
    }
    let id = frame[4];
    let payload = &frame[5..4 + length as usize];

    if id != crate::wire::message::ID_PIECE && length > max_len {
        return Err(ProtocolError::MessageTooLarge { length, limit: max_len });
    }

    match id {
        ID_CHOKE => Ok(Message::Choke),
        ID_UNCHOKE => Ok(Message::Unchoke),
        ID_INTERESTED => Ok(Message::Interested),
        ID_NOT_INTERESTED => Ok(Message::NotInterested),
        ID_HAVE => Ok(Message::Have { index: read_u32(payload, 0)? }),
        ID_BITFIELD => Ok(Message::Bitfield { bytes: payload.to_vec() }),
        ID_REQUEST => Ok(Message::Request {
            index: read_u32(payload, 0)?,
            begin: read_u32(payload, 4)?,
            length: read_u32(payload, 8)?,
        }),
        ID_PIECE => {
            if payload.len() < 8 {
                return Err(ProtocolError::Truncated);
            }
            Ok(Message::Piece { index: read_u32(payload, 0)?, begin: read_u32(payload, 4)?, data: payload[8..].to_vec() })
        }
        ID_CANCEL => Ok(Message::Cancel {
            index: read_u32(payload, 0)?,
            begin: read_u32(payload, 4)?,
            length: read_u32(payload, 8)?,
        }),
        ID_PORT => {
            if payload.len() < 2 {
                return Err(ProtocolError::Truncated);
            }
            Ok(Message::Port { port: u16::from_be_bytes([payload[0], payload[1]]) })
        }
        super::message::ID_HAVE_ALL => Ok(Message::HaveAll),
        super::message::ID_HAVE_NONE => Ok(Message::HaveNone),
        super::message::ID_SUGGEST_PIECE => Ok(Message::SuggestPiece { index: read_u32(payload, 0)? }),
        super::message::ID_REJECT_REQUEST => Ok(Message::RejectRequest {
            index: read_u32(payload, 0)?,
            begin: read_u32(payload, 4)?,
            length: read_u32(payload, 8)?,
        }),
        super::message::ID_ALLOWED_FAST => Ok(Message::AllowedFast { index: read_u32(payload, 0)? }),
        ID_EXTENDED => {
            if payload.is_empty() {
                return Err(ProtocolError::Truncated);
            }
            Ok(Message::Extended { extension_id: payload[0], payload: payload[1..].to_vec() })
        }
        other => Err(ProtocolError::UnknownMessageId(other)),
    }
}

fn read_u32(payload: &[u8], offset: usize) -> Result<u32, ProtocolError> {
    payload
        .get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(ProtocolError::Truncated)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: Message) {
        let encoded = encode_message(&message);
        let decoded = decode_message(&encoded, super::super::MAX_NON_PIECE_MESSAGE_LEN).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn should_round_trip_every_bep3_message() {
        round_trip(Message::KeepAlive);
        round_trip(Message::Choke);
        round_trip(Message::Unchoke);
        round_trip(Message::Interested);
        round_trip(Message::NotInterested);
        round_trip(Message::Have { index: 42 });
        round_trip(Message::Bitfield { bytes: vec![0xff, 0x00] });
        round_trip(Message::Request { index: 1, begin: 2, length: 16384 });
        round_trip(Message::Piece { index: 1, begin: 0, data: vec![1, 2, 3, 4] });
        round_trip(Message::Cancel { index: 1, begin: 2, length: 16384 });
        round_trip(Message::Port { port: 6881 });
    }

    #[test]
    fn should_round_trip_fast_extension_messages() {
        round_trip(Message::HaveAll);
        round_trip(Message::HaveNone);
        round_trip(Message::SuggestPiece { index: 3 });
        round_trip(Message::RejectRequest { index: 1, begin: 0, length: 16384 });
        round_trip(Message::AllowedFast { index: 5 });
    }

    #[test]
    fn should_round_trip_an_extended_message() {
        round_trip(Message::Extended { extension_id: 1, payload: vec![b'd', b'e'] });
    }

    #[test]
    fn should_reject_a_non_piece_message_over_the_length_ceiling() {
        let huge = vec![0u8; 2 * 1024 * 1024];
        let message = Message::Bitfield { bytes: huge };
        let encoded = encode_message(&message);
        let result = decode_message(&encoded, super::super::MAX_NON_PIECE_MESSAGE_LEN);
        assert!(matches!(result, Err(ProtocolError::MessageTooLarge { .. })));
    }

    #[test]
    fn should_reject_an_unknown_message_id() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&1u32.to_be_bytes());
        frame.push(250);
        let result = decode_message(&frame, super::super::MAX_NON_PIECE_MESSAGE_LEN);
        assert!(matches!(result, Err(ProtocolError::UnknownMessageId(250))));
    }
}
