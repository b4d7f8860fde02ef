// src/config/validate.rs

use std::collections::BTreeMap;
use std::time::Duration;

use regex::Regex;

use crate::config::model::{
    ConfigFile, DefaultsSection, ParameterDefinition, RawConfigFile, RawSender, SenderDefinition,
};
use crate::errors::{CommandError, Result};
use crate::sender::{ApplyChannels, SenderConfig};

/// Characters allowed in an EPICS process variable name.
const PV_NAME_PATTERN: &str = r"^[A-Za-z0-9_:\-\.\[\]<>;$]+$";

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = CommandError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        ensure_has_senders(&raw)?;

        let pv_name = Regex::new(PV_NAME_PATTERN)
            .map_err(|e| CommandError::ConfigError(format!("invalid PV name pattern: {e}")))?;
        let defaults = resolve_defaults(&raw.defaults)?;

        let mut senders = BTreeMap::new();
        for (name, sender) in raw.sender {
            let definition = build_sender(&name, sender, defaults, &pv_name)?;
            senders.insert(name, definition);
        }

        Ok(ConfigFile { senders })
    }
}

fn ensure_has_senders(cfg: &RawConfigFile) -> Result<()> {
    if cfg.sender.is_empty() {
        return Err(CommandError::ConfigError(
            "config must contain at least one [sender.<name>] section".to_string(),
        ));
    }
    Ok(())
}

fn resolve_defaults(section: &DefaultsSection) -> Result<SenderConfig> {
    let base = SenderConfig::default();
    Ok(SenderConfig {
        connect_timeout: duration_or("[defaults].connect_timeout", &section.connect_timeout, base.connect_timeout)?,
        write_timeout: duration_or("[defaults].write_timeout", &section.write_timeout, base.write_timeout)?,
        command_timeout: duration_or("[defaults].command_timeout", &section.command_timeout, base.command_timeout)?,
    })
}

fn build_sender(
    name: &str,
    raw: RawSender,
    defaults: SenderConfig,
    pv_name: &Regex,
) -> Result<SenderDefinition> {
    let apply = resolve_channels(name, &raw)?;

    let mut channels = vec![
        ("directive", apply.directive.as_str()),
        ("mark", apply.mark.as_str()),
        ("status", apply.status.as_str()),
    ];
    if let Some(message) = &apply.message {
        channels.push(("message", message.as_str()));
    }
    for (role, channel) in channels {
        check_pv_name(pv_name, channel, &format!("sender '{name}' {role} channel"))?;
    }

    let config = SenderConfig {
        connect_timeout: duration_or(
            &format!("[sender.{name}].connect_timeout"),
            &raw.connect_timeout,
            defaults.connect_timeout,
        )?,
        write_timeout: duration_or(
            &format!("[sender.{name}].write_timeout"),
            &raw.write_timeout,
            defaults.write_timeout,
        )?,
        command_timeout: duration_or(
            &format!("[sender.{name}].command_timeout"),
            &raw.command_timeout,
            defaults.command_timeout,
        )?,
    };

    let mut parameters = BTreeMap::new();
    for (param, def) in raw.parameter {
        check_pv_name(
            pv_name,
            &def.channel,
            &format!("sender '{name}' parameter '{param}'"),
        )?;
        parameters.insert(
            param,
            ParameterDefinition {
                channel: def.channel,
                kind: def.kind,
                description: def.description,
            },
        );
    }

    Ok(SenderDefinition {
        name: name.to_string(),
        description: raw.description.unwrap_or_default(),
        apply,
        config,
        parameters,
    })
}

fn resolve_channels(name: &str, raw: &RawSender) -> Result<ApplyChannels> {
    let base = match (&raw.apply, &raw.car) {
        (Some(apply), Some(car)) => Some(ApplyChannels::from_records(apply, car)),
        (Some(_), None) | (None, Some(_)) => {
            return Err(CommandError::ConfigError(format!(
                "sender '{name}': `apply` and `car` must be given together"
            )));
        }
        (None, None) => None,
    };

    let directive = raw
        .directive
        .clone()
        .or_else(|| base.as_ref().map(|b| b.directive.clone()));
    let status = raw
        .status
        .clone()
        .or_else(|| base.as_ref().map(|b| b.status.clone()));

    let (Some(directive), Some(status)) = (directive, status) else {
        return Err(CommandError::ConfigError(format!(
            "sender '{name}' needs either `apply` + `car` or `directive` + `status`"
        )));
    };

    let mut channels = ApplyChannels::new(&directive, &status);
    channels.message = base.and_then(|b| b.message);
    if let Some(mark) = &raw.mark {
        channels = channels.with_mark_channel(mark);
    }
    if let Some(message) = &raw.message {
        channels = channels.with_message_channel(message);
    }
    Ok(channels)
}

fn check_pv_name(pattern: &Regex, channel: &str, what: &str) -> Result<()> {
    if pattern.is_match(channel) {
        return Ok(());
    }
    Err(CommandError::ConfigError(format!(
        "{what}: '{channel}' is not a valid channel name"
    )))
}

fn duration_or(field: &str, value: &Option<String>, default: Duration) -> Result<Duration> {
    let Some(text) = value else {
        return Ok(default);
    };

    let duration = parse_duration(text)
        .map_err(|e| CommandError::ConfigError(format!("{field}: {e}")))?;
    if duration.is_zero() {
        return Err(CommandError::ConfigError(format!(
            "{field} must be greater than zero"
        )));
    }
    Ok(duration)
}

/// Parse durations like `"500ms"`, `"3s"`, `"2m"` or `"1h"`.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| "duration missing unit suffix".to_string())?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;
    let unit = unit_part.trim().to_lowercase();

    match unit.as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        _ => Err(format!(
            "unsupported duration unit '{}'; expected ms, s, m, or h",
            unit
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_supported_units() {
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration(" 3s "), Ok(Duration::from_secs(3)));
        assert_eq!(parse_duration("2m"), Ok(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
    }

    #[test]
    fn rejects_malformed_durations() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("5d").is_err());
    }

    #[test]
    fn pv_pattern_accepts_record_fields() {
        let re = Regex::new(PV_NAME_PATTERN).unwrap();
        assert!(re.is_match("gmos:apply.DIR"));
        assert!(re.is_match("tcs:sad:m2[0]"));
        assert!(!re.is_match("has space"));
        assert!(!re.is_match(""));
    }
}
