// src/config/model.rs

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::sender::{ApplyChannels, SenderConfig};
use crate::types::ValueKind;

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [defaults]
/// command_timeout = "60s"
///
/// [sender.applyGmos]
/// description = "GMOS observe"
/// apply = "gmos:apply"
/// car = "gmos:applyC"
///
/// [sender.applyGmos.parameter.exposureTime]
/// channel = "gmos:expTime"
/// type = "double"
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RawConfigFile {
    /// Timeouts applied to senders that do not override them.
    #[serde(default)]
    pub defaults: DefaultsSection,

    /// All senders from `[sender.<name>]`, keyed by sender name.
    #[serde(default)]
    pub sender: BTreeMap<String, RawSender>,
}

/// `[defaults]` section. Durations are strings such as `"500ms"` or `"2s"`.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct DefaultsSection {
    #[serde(default)]
    pub connect_timeout: Option<String>,
    #[serde(default)]
    pub write_timeout: Option<String>,
    #[serde(default)]
    pub command_timeout: Option<String>,
}

/// `[sender.<name>]` section.
///
/// The channels are given either as record names (`apply` + `car`, expanded
/// to the standard fields) or explicitly (`directive` + `status`). Explicit
/// fields override the expanded ones.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RawSender {
    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub apply: Option<String>,
    #[serde(default)]
    pub car: Option<String>,

    #[serde(default)]
    pub directive: Option<String>,
    #[serde(default)]
    pub mark: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,

    #[serde(default)]
    pub connect_timeout: Option<String>,
    #[serde(default)]
    pub write_timeout: Option<String>,
    #[serde(default)]
    pub command_timeout: Option<String>,

    /// `[sender.<name>.parameter.<param>]` tables.
    #[serde(default)]
    pub parameter: BTreeMap<String, RawParameter>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawParameter {
    pub channel: String,
    #[serde(rename = "type")]
    pub kind: ValueKind,
    #[serde(default)]
    pub description: Option<String>,
}

/// Validated configuration, produced by `ConfigFile::try_from(raw)`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub senders: BTreeMap<String, SenderDefinition>,
}

impl ConfigFile {
    pub fn sender(&self, name: &str) -> Option<&SenderDefinition> {
        self.senders.get(name)
    }
}

/// Everything needed to build one `CommandSender`.
#[derive(Debug, Clone)]
pub struct SenderDefinition {
    pub name: String,
    pub description: String,
    pub apply: ApplyChannels,
    pub config: SenderConfig,
    pub parameters: BTreeMap<String, ParameterDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterDefinition {
    pub channel: String,
    pub kind: ValueKind,
    pub description: Option<String>,
}
