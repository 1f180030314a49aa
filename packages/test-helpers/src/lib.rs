//! Test-only helpers shared across the `torrentd` workspace: engine
//! configuration factories and random data generators. Not meant for use
//! outside `#[cfg(test)]` / dev-dependency contexts.

pub mod configuration;
pub mod random;
