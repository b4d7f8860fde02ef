// src/config/mod.rs

//! Configuration loading and validation for command senders.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a config file from disk (`loader.rs`).
//! - Validate channel names and durations and build sender definitions
//!   (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{load_and_validate, load_from_path};
pub use model::{
    ConfigFile, DefaultsSection, ParameterDefinition, RawConfigFile, RawParameter, RawSender,
    SenderDefinition,
};
pub use validate::parse_duration;
