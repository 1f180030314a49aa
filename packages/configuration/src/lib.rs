//! Configuration for the `torrentd` `BitTorrent` engine.
//!
//! The engine has no on-disk config file format of its own to evolve — the
//! host application owns persistence of whatever it passes in — so unlike a
//! long-lived server there is a single [`EngineConfig`] struct rather than a
//! chain of versioned migrations.
//!
//! Configuration is loaded with a layered [`figment::Figment`]: compiled-in
//! defaults, then an optional TOML string or file, then environment
//! variables prefixed `TORRENTD_CONFIG_OVERRIDE_` (double underscore
//! separates nested keys, e.g. `TORRENTD_CONFIG_OVERRIDE_NETWORK__LISTEN_PORT`).
//!
//! ## Sections
//!
//! - [`logging::Logging`] — log level, surfaced to the host's `tracing` subscriber.
//! - [`network::Network`] — listen port, connection caps, rate limits.
//! - [`encryption::Encryption`] — MSE/PE policy.
//! - [`encryption::Dht`] / [`encryption::Upnp`] — opportunistic subsystem toggles.
//! - [`storage::Storage`] — storage roots and the default root for new torrents.

pub mod encryption;
pub mod logging;
pub mod network;
pub mod storage;
pub mod validator;

use std::sync::Arc;
use std::{env, fs};

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use torrentd_located_error::{DynError, Located, LocatedError};

pub use crate::encryption::{Dht, Encryption, EncryptionPolicy, Upnp};
pub use crate::logging::{LogLevel, Logging};
pub use crate::network::Network;
pub use crate::storage::{Storage, StorageRoot};
pub use crate::validator::{SemanticValidationError, Validator};

/// Prefix for env vars that overwrite configuration options.
const CONFIG_OVERRIDE_PREFIX: &str = "TORRENTD_CONFIG_OVERRIDE_";
/// Path separator in env var names for nested values in configuration.
const CONFIG_OVERRIDE_SEPARATOR: &str = "__";

/// Information required to load configuration: either an inline TOML string
/// (as would arrive through an environment variable) or a file path, plus an
/// optional override for frequently-injected secrets.
#[derive(Debug, Default, Clone)]
pub struct Info {
    pub config_toml: Option<String>,
    pub config_toml_path: String,
}

impl Info {
    /// Builds [`Info`] from the conventional environment variable names:
    /// `env_var_config` (inline TOML) takes priority over
    /// `env_var_path_config` (a file path), which itself falls back to
    /// `default_path_config`.
    ///
    /// # Errors
    ///
    /// Will return `Err` if a configured file path cannot be read.
    pub fn new(env_var_config: &str, env_var_path_config: &str, default_path_config: &str) -> Result<Self, Error> {
        let config_toml = env::var(env_var_config).ok();
        let config_toml_path = env::var(env_var_path_config).unwrap_or_else(|_| default_path_config.to_string());

        if config_toml.is_none() {
            // Fail fast if neither the inline var nor a readable file is available,
            // mirroring the teacher's "create a default file then exit" first-run flow.
            if !std::path::Path::new(&config_toml_path).exists() {
                return Ok(Self {
                    config_toml: None,
                    config_toml_path,
                });
            }
            fs::read_to_string(&config_toml_path).map_err(|e| Error::UnableToLoadFromConfigFile {
                source: (Arc::new(e) as DynError).into(),
            })?;
        }

        Ok(Self {
            config_toml,
            config_toml_path,
        })
    }
}

/// Errors that can occur when loading the configuration.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unable to load from config file: {source}")]
    UnableToLoadFromConfigFile {
        source: LocatedError<'static, dyn std::error::Error + Send + Sync>,
    },

    #[error("failed processing the configuration: {source}")]
    FigmentError {
        source: LocatedError<'static, figment::Error>,
    },

    #[error("invalid configuration: {0}")]
    Invalid(#[from] SemanticValidationError),
}

impl From<figment::Error> for Error {
    #[track_caller]
    fn from(err: figment::Error) -> Self {
        Self::FigmentError {
            source: Located(err).into(),
        }
    }
}

/// Full engine configuration, enumerated per spec.md §6.7.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct EngineConfig {
    #[serde(default = "EngineConfig::default_logging")]
    pub logging: Logging,

    #[serde(default = "EngineConfig::default_network")]
    pub network: Network,

    #[serde(default = "EngineConfig::default_encryption")]
    pub encryption: Encryption,

    #[serde(default = "EngineConfig::default_dht")]
    pub dht: Dht,

    #[serde(default = "EngineConfig::default_upnp")]
    pub upnp: Upnp,

    #[serde(default = "EngineConfig::default_storage")]
    pub storage: Storage,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            logging: Self::default_logging(),
            network: Self::default_network(),
            encryption: Self::default_encryption(),
            dht: Self::default_dht(),
            upnp: Self::default_upnp(),
            storage: Self::default_storage(),
        }
    }
}

impl EngineConfig {
    fn default_logging() -> Logging {
        Logging::default()
    }

    fn default_network() -> Network {
        Network::default()
    }

    fn default_encryption() -> Encryption {
        Encryption::default()
    }

    fn default_dht() -> Dht {
        Dht::default()
    }

    fn default_upnp() -> Upnp {
        Upnp::default()
    }

    fn default_storage() -> Storage {
        Storage::default()
    }

    /// Loads the configuration from the `Info` struct, overlaying compiled
    /// defaults with an inline TOML string or file and then environment
    /// overrides, and validates the merged result.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the merged configuration cannot be deserialized
    /// or fails semantic validation.
    pub fn load(info: &Info) -> Result<EngineConfig, Error> {
        let figment = if let Some(config_toml) = &info.config_toml {
            Figment::from(Serialized::defaults(EngineConfig::default()))
                .merge(Toml::string(config_toml))
                .merge(Env::prefixed(CONFIG_OVERRIDE_PREFIX).split(CONFIG_OVERRIDE_SEPARATOR))
        } else {
            Figment::from(Serialized::defaults(EngineConfig::default()))
                .merge(Toml::file(&info.config_toml_path))
                .merge(Env::prefixed(CONFIG_OVERRIDE_PREFIX).split(CONFIG_OVERRIDE_SEPARATOR))
        };

        let config: EngineConfig = figment.extract()?;
        config.validate()?;

        Ok(config)
    }

    /// Saves the default configuration at the given path.
    ///
    /// # Errors
    ///
    /// Will return `Err` if `path` is not writable.
    pub fn create_default_configuration_file(path: &str) -> Result<EngineConfig, Error> {
        let config = EngineConfig::default();
        config.save_to_file(path)?;
        Ok(config)
    }

    /// Saves the configuration to the configuration file.
    ///
    /// # Panics
    ///
    /// Will panic if the configuration cannot be encoded to TOML or the file
    /// cannot be written.
    pub fn save_to_file(&self, path: &str) -> Result<(), Error> {
        fs::write(path, self.to_toml()).expect("could not write configuration file");
        Ok(())
    }

    fn to_toml(&self) -> String {
        toml::to_string(self).expect("could not encode configuration as toml")
    }
}

impl Validator for EngineConfig {
    fn validate(&self) -> Result<(), SemanticValidationError> {
        use std::collections::HashSet;

        let mut seen = HashSet::new();
        for root in &self.storage.storage_roots {
            if !seen.insert(root.key.as_str()) {
                return Err(SemanticValidationError::DuplicateStorageRootKey(root.key.clone()));
            }
        }
        if !self.storage.storage_roots.iter().any(|r| r.key == self.storage.default_root_key) {
            return Err(SemanticValidationError::UnknownDefaultRootKey(
                self.storage.default_root_key.clone(),
            ));
        }
        if self.network.max_peers_per_torrent > self.network.max_global_connections {
            return Err(SemanticValidationError::PeerCapExceedsGlobalCap {
                per_torrent: self.network.max_peers_per_torrent,
                global: self.network.max_global_connections,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{EngineConfig, Info};

    #[test]
    fn engine_config_should_have_sane_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.network.listen_port, 6881);
        assert!(config.dht.enabled);
        assert_eq!(config.storage.default_root_key, "default");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_configuration_should_use_the_default_values() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("torrentd.toml", "")?;

            let info = Info {
                config_toml: Some(String::new()),
                config_toml_path: "torrentd.toml".to_string(),
            };

            let config = EngineConfig::load(&info).expect("could not load configuration");

            assert_eq!(config, EngineConfig::default());

            Ok(())
        });
    }

    #[test]
    fn configuration_could_be_overwritten_from_a_toml_string() {
        figment::Jail::expect_with(|_jail| {
            let config_toml = r#"
                [network]
                listen_port = 51413
            "#
            .to_string();

            let info = Info {
                config_toml: Some(config_toml),
                config_toml_path: String::new(),
            };

            let config = EngineConfig::load(&info).expect("could not load configuration");

            assert_eq!(config.network.listen_port, 51413);

            Ok(())
        });
    }

    #[test]
    fn configuration_could_be_overwritten_from_an_env_var() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("TORRENTD_CONFIG_OVERRIDE_NETWORK__LISTEN_PORT", "6882");

            let info = Info {
                config_toml: Some(String::new()),
                config_toml_path: String::new(),
            };

            let config = EngineConfig::load(&info).expect("could not load configuration");

            assert_eq!(config.network.listen_port, 6882);

            Ok(())
        });
    }

    #[test]
    fn validation_should_reject_an_unknown_default_root_key() {
        let mut config = EngineConfig::default();
        config.storage.default_root_key = "missing".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_should_reject_a_per_torrent_cap_above_the_global_cap() {
        let mut config = EngineConfig::default();
        config.network.max_peers_per_torrent = config.network.max_global_connections + 1;
        assert!(config.validate().is_err());
    }
}
