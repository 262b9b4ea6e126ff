//! Domain layer: the typed configuration the rest of the server consumes.

pub mod config;
