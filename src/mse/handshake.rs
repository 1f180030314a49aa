//! The Vuze-de-facto MSE/PE handshake algorithm (spec.md §4.4 steps 1-6).
//!
//! The DH public keys are fixed-width (96 bytes) so both sides read them
//! unambiguously; the random padding that follows each is not. The
//! responder resolves that ambiguity by scanning for the initiator's plain
//! `HASH('req1'||S)` marker (only the initiator can send a searchable
//! plaintext marker, since it computes `S` first). The initiator has no
//! such marker available for the responder's reply — by the time the
//! responder answers, everything is already RC4-encrypted — so it resolves
//! its own padding ambiguity by trial-decrypting candidate offsets and
//! checking whether the recovered `VC` is all zero, the standard technique
//! real MSE implementations use for this side of the handshake.

use rand::Rng;
use sha1::{Digest, Sha1};
use tokio::time::timeout;
use torrentd_configuration::EncryptionPolicy;
use torrentd_primitives::info_hash::InfoHash;

use super::dh::{DhKeyPair, PUBLIC_KEY_LEN};
use super::rc4_stream::Rc4Drop1024;
use super::stream::MseStream;
use super::{MseError, CRYPTO_PLAINTEXT, CRYPTO_RC4, MSE_HANDSHAKE_TIMEOUT, MSE_SYNC_SCAN_CAP};
use crate::net::TcpSocket;

const VC: [u8; 8] = [0u8; 8];

pub struct HandshakeOutcome {
    pub stream: MseStream,
    /// Bytes already decrypted past the handshake boundary (e.g. the start
    /// of the remote's BT handshake), to be fed to the wire-protocol parser
    /// before reading anything further from the socket.
    pub initial_payload: Vec<u8>,
}

pub enum Acceptance {
    /// First byte was `0x13`: a plaintext BEP 3 handshake.
    Plaintext { socket: Box<dyn TcpSocket>, initial_payload: Vec<u8> },
    Encrypted { info_hash: InfoHash, stream: MseStream, initial_payload: Vec<u8> },
}

/// Buffers bytes pulled from a socket so the handshake can search for or
/// peek at data without losing unconsumed bytes between reads.
struct SocketReader<'a> {
    socket: &'a mut dyn TcpSocket,
    buf: Vec<u8>,
}

impl<'a> SocketReader<'a> {
    fn new(socket: &'a mut dyn TcpSocket) -> Self {
        Self { socket, buf: Vec::new() }
    }

    async fn fill_to(&mut self, n: usize) -> Result<(), MseError> {
        while self.buf.len() < n {
            let chunk = self.socket.recv().await.map_err(|_| MseError::Closed)?.ok_or(MseError::Closed)?;
            self.buf.extend_from_slice(&chunk);
        }
        Ok(())
    }

    async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, MseError> {
        self.fill_to(n).await?;
        Ok(self.buf.drain(..n).collect())
    }

    async fn peek(&mut self, offset: usize, len: usize) -> Result<Vec<u8>, MseError> {
        self.fill_to(offset + len).await?;
        Ok(self.buf[offset..offset + len].to_vec())
    }

    fn consume(&mut self, n: usize) {
        self.buf.drain(..n);
    }

    /// Scans for `marker`, consuming (and discarding) all bytes up to and
    /// including its first occurrence.
    async fn scan_for(&mut self, marker: &[u8], cap: usize) -> Result<(), MseError> {
        loop {
            if let Some(pos) = find_subslice(&self.buf, marker) {
                self.consume(pos + marker.len());
                return Ok(());
            }
            if self.buf.len() > cap {
                return Err(MseError::SyncNotFound);
            }
            let chunk = self.socket.recv().await.map_err(|_| MseError::Closed)?.ok_or(MseError::Closed)?;
            self.buf.extend_from_slice(&chunk);
        }
    }

    fn into_remaining(self) -> Vec<u8> {
        self.buf
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn sha1(parts: &[&[u8]]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(&hasher.finalize());
    out
}

fn xor20(a: &[u8; 20], b: &[u8; 20]) -> [u8; 20] {
    let mut out = [0u8; 20];
    for i in 0..20 {
        out[i] = a[i] ^ b[i];
    }
    out
}

fn random_padding() -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let len = rng.gen_range(0..=512usize);
    let mut pad = vec![0u8; len];
    rng.fill(&mut pad[..]);
    pad
}

/// Scans candidate byte offsets for the point at which decrypting the next
/// 8 bytes with a fresh RC4-drop1024 keystream (keyed by `key`) yields an
/// all-zero `VC`. Returns the cipher advanced exactly past those 8 bytes,
/// ready to continue decrypting the rest of the stream.
async fn find_vc_by_trial_decryption(reader: &mut SocketReader<'_>, key: &[u8; 20], cap: usize) -> Result<Rc4Drop1024, MseError> {
    let mut offset = 0usize;
    loop {
        let candidate = reader.peek(offset, 8).await?;
        let mut trial = Rc4Drop1024::new(key);
        let mut probe = candidate;
        trial.apply(&mut probe);
        if probe == VC {
            reader.consume(offset);
            return Ok(trial);
        }
        offset += 1;
        if offset > cap {
            return Err(MseError::SyncNotFound);
        }
    }
}

/// Runs the initiator (outgoing-connection) side of the handshake.
///
/// # Errors
///
/// Returns [`MseError::Timeout`] if the whole exchange exceeds 30 s, or any
/// other [`MseError`] variant on protocol failure.
pub async fn initiate(mut socket: Box<dyn TcpSocket>, info_hash: InfoHash, initial_payload: &[u8]) -> Result<HandshakeOutcome, MseError> {
    let result = timeout(MSE_HANDSHAKE_TIMEOUT, async {
        let keypair = DhKeyPair::generate();
        let our_public = keypair.public_key_bytes();
        let padding = random_padding();

        let mut outgoing = Vec::with_capacity(our_public.len() + padding.len());
        outgoing.extend_from_slice(&our_public);
        outgoing.extend_from_slice(&padding);
        socket.send(&outgoing).await.map_err(|_| MseError::Closed)?;

        let mut reader = SocketReader::new(socket.as_mut());
        let peer_public = reader.read_exact(PUBLIC_KEY_LEN).await?;
        let shared_secret = keypair.shared_secret(&peer_public);

        let key_a = sha1(&[b"keyA", &shared_secret, info_hash.bytes().as_slice()]);
        let key_b = sha1(&[b"keyB", &shared_secret, info_hash.bytes().as_slice()]);

        let req1 = sha1(&[b"req1", &shared_secret]);
        let req2 = sha1(&[b"req2", info_hash.bytes().as_slice()]);
        let req3 = sha1(&[b"req3", &shared_secret]);
        let obfuscated_info_hash = xor20(&req2, &req3);

        let our_padding_c = random_padding();
        let mut encrypt = Rc4Drop1024::new(&key_a);
        let mut outgoing_encrypted = Vec::new();
        outgoing_encrypted.extend_from_slice(&VC);
        outgoing_encrypted.extend_from_slice(&(CRYPTO_PLAINTEXT | CRYPTO_RC4).to_be_bytes());
        #[allow(clippy::cast_possible_truncation)]
        outgoing_encrypted.extend_from_slice(&(our_padding_c.len() as u16).to_be_bytes());
        outgoing_encrypted.extend_from_slice(&our_padding_c);
        #[allow(clippy::cast_possible_truncation)]
        outgoing_encrypted.extend_from_slice(&(initial_payload.len() as u16).to_be_bytes());
        outgoing_encrypted.extend_from_slice(initial_payload);
        encrypt.apply(&mut outgoing_encrypted);

        let mut plain_prefix = Vec::with_capacity(40);
        plain_prefix.extend_from_slice(&req1);
        plain_prefix.extend_from_slice(&obfuscated_info_hash);
        socket.send(&plain_prefix).await.map_err(|_| MseError::Closed)?;
        socket.send(&outgoing_encrypted).await.map_err(|_| MseError::Closed)?;

        let mut reader = SocketReader::new(socket.as_mut());
        let mut decrypt = find_vc_by_trial_decryption(&mut reader, &key_b, MSE_SYNC_SCAN_CAP).await?;

        let method_bytes = reader.read_exact(4).await?;
        let mut method_bytes: [u8; 4] = method_bytes.try_into().expect("read_exact(4) yields 4 bytes");
        decrypt.apply(&mut method_bytes);
        let crypto_select = u32::from_be_bytes(method_bytes);
        if crypto_select & CRYPTO_RC4 == 0 && crypto_select & CRYPTO_PLAINTEXT == 0 {
            return Err(MseError::NoCommonMethod);
        }

        let mut pad_d_len_bytes = reader.read_exact(2).await?;
        decrypt.apply(&mut pad_d_len_bytes);
        let pad_d_len = u16::from_be_bytes([pad_d_len_bytes[0], pad_d_len_bytes[1]]) as usize;
        let mut pad_d = reader.read_exact(pad_d_len).await?;
        decrypt.apply(&mut pad_d);

        let mut remaining = reader.into_remaining();
        decrypt.apply(&mut remaining);

        Ok((encrypt, decrypt, remaining))
    })
    .await
    .map_err(|_| MseError::Timeout)??;

    let (encrypt, decrypt, remaining) = result;
    Ok(HandshakeOutcome { stream: MseStream::new(socket, encrypt, decrypt), initial_payload: remaining })
}

/// Runs the responder (inbound-connection) side of the handshake, or falls
/// back to plaintext detection per `policy` (spec.md §4.4 policy table).
///
/// # Errors
///
/// Returns [`MseError::PeerRejectedMethod`] if `policy` is `Required` and
/// the peer sent a plaintext handshake, or any other [`MseError`] variant
/// on protocol failure.
pub async fn accept(mut socket: Box<dyn TcpSocket>, policy: EncryptionPolicy, known_info_hashes: &[InfoHash]) -> Result<Acceptance, MseError> {
    timeout(MSE_HANDSHAKE_TIMEOUT, async {
        let mut reader = SocketReader::new(socket.as_mut());
        let first_byte = reader.peek(0, 1).await?;

        if first_byte[0] == 0x13 {
            if policy == EncryptionPolicy::Required {
                return Err(MseError::PeerRejectedMethod);
            }
            let remaining = reader.into_remaining();
            return Ok(Acceptance::Plaintext { socket, initial_payload: remaining });
        }

        let ya = reader.read_exact(PUBLIC_KEY_LEN).await?;
        let keypair = DhKeyPair::generate();
        let shared_secret = keypair.shared_secret(&ya);

        let req1 = sha1(&[b"req1", &shared_secret]);
        reader.scan_for(&req1, MSE_SYNC_SCAN_CAP).await?;

        let obfuscated_info_hash: [u8; 20] = reader.read_exact(20).await?.try_into().expect("read_exact(20) yields 20 bytes");
        let req3 = sha1(&[b"req3", &shared_secret]);
        let candidate_req2 = xor20(&obfuscated_info_hash, &req3);

        let info_hash = known_info_hashes
            .iter()
            .find(|candidate| sha1(&[b"req2", candidate.bytes().as_slice()]) == candidate_req2)
            .copied()
            .ok_or(MseError::UnknownInfoHash)?;

        let key_a = sha1(&[b"keyA", &shared_secret, info_hash.bytes().as_slice()]);
        let key_b = sha1(&[b"keyB", &shared_secret, info_hash.bytes().as_slice()]);

        let mut decrypt = Rc4Drop1024::new(&key_a);
        let mut vc = reader.read_exact(8).await?;
        decrypt.apply(&mut vc);
        if vc != VC {
            return Err(MseError::BadVc);
        }

        let mut crypto_provide_bytes = reader.read_exact(4).await?;
        decrypt.apply(&mut crypto_provide_bytes);
        let crypto_provide = u32::from_be_bytes(crypto_provide_bytes.try_into().expect("4 bytes"));

        let mut pad_c_len_bytes = reader.read_exact(2).await?;
        decrypt.apply(&mut pad_c_len_bytes);
        let pad_c_len = u16::from_be_bytes([pad_c_len_bytes[0], pad_c_len_bytes[1]]) as usize;
        let mut _pad_c = reader.read_exact(pad_c_len).await?;
        decrypt.apply(&mut _pad_c);

        let mut ia_len_bytes = reader.read_exact(2).await?;
        decrypt.apply(&mut ia_len_bytes);
        let ia_len = u16::from_be_bytes([ia_len_bytes[0], ia_len_bytes[1]]) as usize;
        let mut ia = reader.read_exact(ia_len).await?;
        decrypt.apply(&mut ia);

        let mut trailing = reader.into_remaining();
        decrypt.apply(&mut trailing);
        ia.extend_from_slice(&trailing);

        if crypto_provide & CRYPTO_RC4 == 0 {
            return Err(MseError::NoCommonMethod);
        }
        let crypto_select = CRYPTO_RC4;

        let yb = keypair.public_key_bytes();
        let padding = random_padding();
        let mut outgoing = Vec::with_capacity(yb.len() + padding.len());
        outgoing.extend_from_slice(&yb);
        outgoing.extend_from_slice(&padding);
        socket.send(&outgoing).await.map_err(|_| MseError::Closed)?;

        let mut encrypt = Rc4Drop1024::new(&key_b);
        let our_padding_d = random_padding();
        let mut reply = Vec::new();
        reply.extend_from_slice(&VC);
        reply.extend_from_slice(&crypto_select.to_be_bytes());
        #[allow(clippy::cast_possible_truncation)]
        reply.extend_from_slice(&(our_padding_d.len() as u16).to_be_bytes());
        reply.extend_from_slice(&our_padding_d);
        encrypt.apply(&mut reply);
        socket.send(&reply).await.map_err(|_| MseError::Closed)?;

        let mut remaining = reader.into_remaining();
        decrypt.apply(&mut remaining);
        ia.extend_from_slice(&remaining);

        Ok(Acceptance::Encrypted { info_hash, stream: MseStream::new(socket, encrypt, decrypt), initial_payload: ia })
    })
    .await
    .map_err(|_| MseError::Timeout)?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_xor_two_twenty_byte_arrays() {
        let a = [0xFFu8; 20];
        let b = [0x0Fu8; 20];
        let result = xor20(&a, &b);
        assert_eq!(result, [0xF0u8; 20]);
    }

    #[test]
    fn should_find_a_marker_within_a_haystack() {
        let haystack = b"garbagegarbageMARKERtrailing";
        assert_eq!(find_subslice(haystack, b"MARKER"), Some(14));
    }

    #[test]
    fn should_report_no_match_when_marker_is_absent() {
        let haystack = b"nothinghere";
        assert_eq!(find_subslice(haystack, b"MARKER"), None);
    }
}
