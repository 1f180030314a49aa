use serde::{Deserialize, Serialize};

/// MSE/PE policy for outgoing and incoming peer connections.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionPolicy {
    /// Never negotiate MSE; always speak the plain BT handshake.
    Disabled,
    /// Prefer MSE but fall back to plaintext when a peer doesn't support it.
    Enabled,
    /// Drop peers that cannot complete the MSE handshake.
    Required,
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct Encryption {
    #[serde(default = "Encryption::default_policy")]
    pub policy: EncryptionPolicy,
}

impl Default for Encryption {
    fn default() -> Self {
        Self {
            policy: Self::default_policy(),
        }
    }
}

impl Encryption {
    fn default_policy() -> EncryptionPolicy {
        EncryptionPolicy::Enabled
    }
}

/// Opportunistic, best-effort subsystems that have no fallback consequence
/// if disabled or if they fail silently.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Copy)]
pub struct Dht {
    #[serde(default = "Dht::default_enabled")]
    pub enabled: bool,
}

impl Default for Dht {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
        }
    }
}

impl Dht {
    fn default_enabled() -> bool {
        true
    }
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Copy)]
pub struct Upnp {
    #[serde(default = "Upnp::default_enabled")]
    pub enabled: bool,
}

impl Default for Upnp {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
        }
    }
}

impl Upnp {
    fn default_enabled() -> bool {
        true
    }
}
