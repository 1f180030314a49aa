//! Trait to validate semantic errors.
//!
//! Errors could involve more than one configuration option. Some configuration
//! combinations can be incompatible even if each option is individually valid.
use thiserror::Error;

/// Errors that can occur validating the configuration.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SemanticValidationError {
    #[error("defaultRootKey `{0}` does not name any entry in storageRoots")]
    UnknownDefaultRootKey(String),
    #[error("storageRoots contains more than one entry with key `{0}`")]
    DuplicateStorageRootKey(String),
    #[error("maxPeersPerTorrent ({per_torrent}) exceeds maxGlobalConnections ({global})")]
    PeerCapExceedsGlobalCap { per_torrent: u32, global: u32 },
}

pub trait Validator {
    /// # Errors
    ///
    /// Will return an error if the configuration is invalid.
    fn validate(&self) -> Result<(), SemanticValidationError>;
}
