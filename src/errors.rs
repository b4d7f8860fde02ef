// src/errors.rs

//! Crate-wide error types.

use std::time::Duration;

use thiserror::Error;

use crate::types::ValueKind;

/// Errors reported by a [`crate::channel::ChannelService`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChannelError {
    #[error("channel '{channel}' is unreachable: {reason}")]
    Unreachable { channel: String, reason: String },

    #[error("channel '{channel}' did not respond within {after:?}")]
    Timeout { channel: String, after: Duration },

    #[error("channel '{channel}' is disconnected")]
    Disconnected { channel: String },

    #[error("channel '{channel}' carries {expected} values, got {actual}")]
    TypeMismatch {
        channel: String,
        expected: ValueKind,
        actual: ValueKind,
    },

    #[error("channel service is closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum CommandError {
    #[error(
        "parameter '{name}' already exists as {existing_kind} on '{existing_channel}' \
         (requested {requested_kind} on '{requested_channel}')"
    )]
    ParameterConflict {
        name: String,
        existing_kind: ValueKind,
        existing_channel: String,
        requested_kind: ValueKind,
        requested_channel: String,
    },

    #[error("Parameter not found: {0}")]
    ParameterNotFound(String),

    #[error("parameter '{name}' holds {expected} values, got {actual}")]
    InvalidValue {
        name: String,
        expected: ValueKind,
        actual: ValueKind,
    },

    #[error("could not connect channel '{channel}': {source}")]
    ChannelConnection {
        channel: String,
        #[source]
        source: ChannelError,
    },

    #[error("write to channel '{channel}' not acknowledged within {after:?}")]
    ChannelTimeout { channel: String, after: Duration },

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("command sender '{sender}' is busy with execution {execution}")]
    CommandBusy { sender: String, execution: u64 },

    #[error("command sender '{sender}' has been shut down")]
    SenderClosed { sender: String },

    #[error("gave up waiting for command completion after {after:?}")]
    WaitTimeout { after: Duration },

    #[error("wait for command completion was interrupted")]
    Interrupted,

    #[error("invalid {kind} value '{text}': {reason}")]
    InvalidLiteral {
        kind: ValueKind,
        text: String,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CommandError>;

/// Why a triggered execution ended in `Failure`.
///
/// Never returned as an `Err` from a call: it is only observable through the
/// monitor of the execution it belongs to.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandFailure {
    #[error("command rejected by the apply record: {message}")]
    Remote { message: String },

    #[error("no completion observed within {after:?}")]
    Timeout { after: Duration },

    #[error("channel '{channel}' failed during execution: {reason}")]
    Channel { channel: String, reason: String },
}
