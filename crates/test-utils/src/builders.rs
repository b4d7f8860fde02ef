#![allow(dead_code)]

use epics_acm::config::{ConfigFile, RawConfigFile, RawParameter, RawSender};
use epics_acm::ValueKind;

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile::default(),
        }
    }

    pub fn with_sender(mut self, name: &str, sender: RawSender) -> Self {
        self.config.sender.insert(name.to_string(), sender);
        self
    }

    pub fn with_default_command_timeout(mut self, value: &str) -> Self {
        self.config.defaults.command_timeout = Some(value.to_string());
        self
    }

    pub fn with_default_write_timeout(mut self, value: &str) -> Self {
        self.config.defaults.write_timeout = Some(value.to_string());
        self
    }

    pub fn build_raw(self) -> RawConfigFile {
        self.config
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `RawSender`.
pub struct SenderBuilder {
    sender: RawSender,
}

impl SenderBuilder {
    /// Sender using the standard `<apply>.DIR` / `<car>.VAL` / `<car>.OMSS` layout.
    pub fn records(apply: &str, car: &str) -> Self {
        Self {
            sender: RawSender {
                apply: Some(apply.to_string()),
                car: Some(car.to_string()),
                ..RawSender::default()
            },
        }
    }

    /// Sender with explicit directive and status channels.
    pub fn channels(directive: &str, status: &str) -> Self {
        Self {
            sender: RawSender {
                directive: Some(directive.to_string()),
                status: Some(status.to_string()),
                ..RawSender::default()
            },
        }
    }

    pub fn description(mut self, text: &str) -> Self {
        self.sender.description = Some(text.to_string());
        self
    }

    pub fn message(mut self, channel: &str) -> Self {
        self.sender.message = Some(channel.to_string());
        self
    }

    pub fn command_timeout(mut self, value: &str) -> Self {
        self.sender.command_timeout = Some(value.to_string());
        self
    }

    pub fn parameter(mut self, name: &str, channel: &str, kind: ValueKind) -> Self {
        self.sender.parameter.insert(
            name.to_string(),
            RawParameter {
                channel: channel.to_string(),
                kind,
                description: None,
            },
        );
        self
    }

    pub fn build(self) -> RawSender {
        self.sender
    }
}
