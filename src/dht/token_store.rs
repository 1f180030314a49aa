//! DHT announce tokens (spec.md §4.7 "TokenStore"): short opaque blobs a
//! `get_peers` responder hands back so it can later verify an
//! `announce_peer` came from the same IP it issued the token to.

use std::net::IpAddr;
use std::time::Duration;

use rand::RngCore;
use sha1::{Digest, Sha1};

/// Tokens rotate on this period; the previous secret stays valid for one
/// more period, giving callers a two-generation grace window.
pub const ROTATION_PERIOD: Duration = Duration::from_secs(5 * 60);

const TOKEN_LEN: usize = 8;

pub struct TokenStore {
    current_secret: [u8; 20],
    previous_secret: [u8; 20],
    last_rotated_at: Duration,
}

impl TokenStore {
    #[must_use]
    pub fn new(now: Duration) -> Self {
        Self { current_secret: random_secret(), previous_secret: random_secret(), last_rotated_at: now }
    }

    /// Rotates the secret if `ROTATION_PERIOD` has elapsed since the last
    /// rotation. Call this from the DHT's periodic maintenance tick.
    pub fn rotate_if_due(&mut self, now: Duration) {
        if now.saturating_sub(self.last_rotated_at) >= ROTATION_PERIOD {
            self.previous_secret = self.current_secret;
            self.current_secret = random_secret();
            self.last_rotated_at = now;
        }
    }

    /// Issues a token for `remote_ip`, bound to the current secret
    /// generation (spec.md §4.7: `HASH(secret || remoteIP)[:8]`).
    #[must_use]
    pub fn issue(&self, remote_ip: IpAddr) -> [u8; TOKEN_LEN] {
        derive(&self.current_secret, remote_ip)
    }

    /// A token is valid if it matches either the current or the previous
    /// secret generation for the claimed remote IP.
    #[must_use]
    pub fn validate(&self, token: &[u8], remote_ip: IpAddr) -> bool {
        token == derive(&self.current_secret, remote_ip) || token == derive(&self.previous_secret, remote_ip)
    }
}

fn derive(secret: &[u8; 20], remote_ip: IpAddr) -> [u8; TOKEN_LEN] {
    let mut hasher = Sha1::new();
    hasher.update(secret);
    match remote_ip {
        IpAddr::V4(v4) => hasher.update(v4.octets()),
        IpAddr::V6(v6) => hasher.update(v6.octets()),
    }
    let digest = hasher.finalize();
    let mut token = [0u8; TOKEN_LEN];
    token.copy_from_slice(&digest[..TOKEN_LEN]);
    token
}

fn random_secret() -> [u8; 20] {
    let mut secret = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut secret);
    secret
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn should_validate_a_freshly_issued_token() {
        let store = TokenStore::new(Duration::ZERO);
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let token = store.issue(ip);
        assert!(store.validate(&token, ip));
    }

    #[test]
    fn should_reject_a_token_issued_for_a_different_ip() {
        let store = TokenStore::new(Duration::ZERO);
        let token = store.issue(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(!store.validate(&token, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))));
    }

    #[test]
    fn should_keep_validating_the_previous_generation_after_one_rotation() {
        let mut store = TokenStore::new(Duration::ZERO);
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let token = store.issue(ip);

        store.rotate_if_due(ROTATION_PERIOD);
        assert!(store.validate(&token, ip), "previous generation must still validate");

        store.rotate_if_due(ROTATION_PERIOD * 2);
        assert!(!store.validate(&token, ip), "two rotations away, the token must expire");
    }

    #[test]
    fn should_not_rotate_before_the_period_elapses() {
        let mut store = TokenStore::new(Duration::ZERO);
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let token = store.issue(ip);
        store.rotate_if_due(ROTATION_PERIOD - Duration::from_secs(1));
        assert!(store.validate(&token, ip));
    }
}
