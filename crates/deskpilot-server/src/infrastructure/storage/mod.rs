//! On-disk persistence: the TOML config file and the JSON session snapshot.

pub mod config;
pub mod snapshot;

pub use config::{load_config, save_config, ConfigError};
pub use snapshot::JsonSnapshotSink;
