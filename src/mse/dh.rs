//! 768-bit Diffie-Hellman exchange (RFC 2409 Oakley Group 1 modulus, the
//! fixed prime MSE/PE negotiates over) backing the MSE handshake
//! (spec.md §4.4 step 1).

use num_bigint::{BigUint, RandBigInt};
use rand::rngs::OsRng;

pub const PUBLIC_KEY_LEN: usize = 96;

const GENERATOR: u32 = 2;

const PRIME_HEX: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD",
    "129024E088A67CC74020BBEA63B139B22514A08798E3404DD",
    "EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245",
    "E485B576625E7EC6F44C42E9A63A3620FFFFFFFFFFFFFFFF",
);

fn prime() -> BigUint {
    BigUint::parse_bytes(PRIME_HEX.as_bytes(), 16).expect("the fixed MSE prime is valid hex")
}

/// One side of a single DH exchange. Not reused across handshakes.
pub struct DhKeyPair {
    private: BigUint,
    public: BigUint,
}

impl DhKeyPair {
    #[must_use]
    pub fn generate() -> Self {
        let p = prime();
        let mut rng = OsRng;
        let private = rng.gen_biguint_below(&p);
        let public = BigUint::from(GENERATOR).modpow(&private, &p);
        Self { private, public }
    }

    #[must_use]
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        left_pad(&self.public.to_bytes_be())
    }

    /// Derives the shared secret `S` from the peer's 96-byte public key.
    #[must_use]
    pub fn shared_secret(&self, peer_public_key: &[u8]) -> [u8; PUBLIC_KEY_LEN] {
        let p = prime();
        let peer_public = BigUint::from_bytes_be(peer_public_key);
        let secret = peer_public.modpow(&self.private, &p);
        left_pad(&secret.to_bytes_be())
    }
}

fn left_pad(bytes: &[u8]) -> [u8; PUBLIC_KEY_LEN] {
    let mut out = [0u8; PUBLIC_KEY_LEN];
    let start = PUBLIC_KEY_LEN.saturating_sub(bytes.len());
    out[start..].copy_from_slice(&bytes[bytes.len().saturating_sub(PUBLIC_KEY_LEN)..]);
    out
}

#[cfg(test)]
mod tests {
    use super::DhKeyPair;

    #[test]
    fn should_derive_matching_shared_secrets_on_both_sides() {
        let a = DhKeyPair::generate();
        let b = DhKeyPair::generate();

        let secret_a = a.shared_secret(&b.public_key_bytes());
        let secret_b = b.shared_secret(&a.public_key_bytes());

        assert_eq!(secret_a, secret_b);
    }

    #[test]
    fn should_derive_different_secrets_for_different_keypairs() {
        let a = DhKeyPair::generate();
        let b = DhKeyPair::generate();
        let c = DhKeyPair::generate();

        let secret_ab = a.shared_secret(&b.public_key_bytes());
        let secret_ac = a.shared_secret(&c.public_key_bytes());

        assert_ne!(secret_ab, secret_ac);
    }
}
