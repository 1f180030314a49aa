//! Engine configuration factories for testing.
use torrentd_configuration::{EncryptionPolicy, EngineConfig, LogLevel};

/// Configuration used for integration tests. It binds to an ephemeral
/// (`0`) listen port so concurrently-running tests never collide, disables
/// DHT and UPnP (both opportunistic, both noisy against a test network) and
/// sets the storage root to a single `test` entry so every test starts from
/// the same well-known key.
///
/// > **NOTICE**: You can change the log level to `debug` to see the engine's
/// traces while running the tests. That can be particularly useful when
/// debugging tests.
#[must_use]
pub fn ephemeral() -> EngineConfig {
    let mut config = EngineConfig {
        logging: torrentd_configuration::Logging {
            log_level: LogLevel::Off, // Change to `Debug` for tests debugging
        },
        ..Default::default()
    };

    config.network.listen_port = 0;
    config.dht.enabled = false;
    config.upnp.enabled = false;

    config
}

/// Ephemeral configuration with encryption required, for testing MSE/PE
/// negotiation paths.
#[must_use]
pub fn ephemeral_with_encryption_required() -> EngineConfig {
    let mut config = ephemeral();

    config.encryption.policy = EncryptionPolicy::Required;

    config
}

/// Ephemeral configuration with encryption disabled entirely.
#[must_use]
pub fn ephemeral_with_encryption_disabled() -> EngineConfig {
    let mut config = ephemeral();

    config.encryption.policy = EncryptionPolicy::Disabled;

    config
}

/// Ephemeral configuration with the DHT subsystem enabled, for DHT-specific
/// integration tests.
#[must_use]
pub fn ephemeral_with_dht() -> EngineConfig {
    let mut config = ephemeral();

    config.dht.enabled = true;

    config
}
