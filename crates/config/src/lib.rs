//! Standalone crate for aqua configuration types.

#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]

pub mod config;
pub use config::{Config, DownloaderConfig, SyncConfig};

/// Reads a [`Config`] from a TOML file, writing the defaults first if the file does not exist.
pub fn load_or_default(path: impl AsRef<std::path::Path>) -> Result<Config, confy::ConfyError> {
    confy::load_path(path)
}
