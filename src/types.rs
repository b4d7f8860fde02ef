// src/types.rs

//! Value kinds carried by parameters and the apply/CAR record codes.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::errors::{CommandError, Result};

/// The closed set of value kinds a parameter channel may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Integer,
    Double,
    Float,
    String,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueKind::Integer => "integer",
            ValueKind::Double => "double",
            ValueKind::Float => "float",
            ValueKind::String => "string",
        };
        f.write_str(s)
    }
}

impl FromStr for ValueKind {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "integer" | "int" => Ok(ValueKind::Integer),
            "double" => Ok(ValueKind::Double),
            "float" => Ok(ValueKind::Float),
            "string" => Ok(ValueKind::String),
            other => Err(CommandError::ConfigError(format!(
                "invalid value type: {other} (expected integer, double, float or string)"
            ))),
        }
    }
}

/// A value written to or read from a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i32),
    Double(f64),
    Float(f32),
    String(String),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Integer(_) => ValueKind::Integer,
            Value::Double(_) => ValueKind::Double,
            Value::Float(_) => ValueKind::Float,
            Value::String(_) => ValueKind::String,
        }
    }

    /// Parse a textual value as the given kind (used for `--set name=value`).
    pub fn parse(kind: ValueKind, text: &str) -> Result<Value> {
        let text = text.trim();
        let invalid = |reason: String| CommandError::InvalidLiteral {
            kind,
            text: text.to_string(),
            reason,
        };
        match kind {
            ValueKind::Integer => text
                .parse()
                .map(Value::Integer)
                .map_err(|e: std::num::ParseIntError| invalid(e.to_string())),
            ValueKind::Double => text
                .parse()
                .map(Value::Double)
                .map_err(|e: std::num::ParseFloatError| invalid(e.to_string())),
            ValueKind::Float => text
                .parse()
                .map(Value::Float)
                .map_err(|e: std::num::ParseFloatError| invalid(e.to_string())),
            ValueKind::String => Ok(Value::String(text.to_string())),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::String(v) => f.write_str(v),
        }
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Rust types that can back a [`crate::params::Parameter`].
///
/// Implemented for `i32`, `f64`, `f32` and `String` only.
pub trait ParameterValue: sealed::Sealed + Clone + Send + Sync + 'static {
    const KIND: ValueKind;

    fn into_value(self) -> Value;

    fn from_value(value: &Value) -> Option<Self>;
}

macro_rules! impl_parameter_value {
    ($ty:ty, $variant:ident) => {
        impl sealed::Sealed for $ty {}

        impl ParameterValue for $ty {
            const KIND: ValueKind = ValueKind::$variant;

            fn into_value(self) -> Value {
                Value::$variant(self)
            }

            fn from_value(value: &Value) -> Option<Self> {
                match value {
                    Value::$variant(v) => Some(v.clone()),
                    _ => None,
                }
            }
        }
    };
}

impl_parameter_value!(i32, Integer);
impl_parameter_value!(f64, Double);
impl_parameter_value!(f32, Float);
impl_parameter_value!(String, String);

/// Directive codes understood by an apply record's `DIR` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Mark,
    Clear,
    Preset,
    Start,
    Stop,
}

impl Directive {
    pub fn code(self) -> i32 {
        match self {
            Directive::Mark => 0,
            Directive::Clear => 1,
            Directive::Preset => 2,
            Directive::Start => 3,
            Directive::Stop => 4,
        }
    }

    pub fn value(self) -> Value {
        Value::Integer(self.code())
    }

    pub fn from_value(value: &Value) -> Option<Directive> {
        match value {
            Value::Integer(0) => Some(Directive::Mark),
            Value::Integer(1) => Some(Directive::Clear),
            Value::Integer(2) => Some(Directive::Preset),
            Value::Integer(3) => Some(Directive::Start),
            Value::Integer(4) => Some(Directive::Stop),
            _ => None,
        }
    }
}

/// State reported by a CAR (command action response) record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarState {
    Idle,
    Paused,
    Busy,
    Error,
}

impl CarState {
    pub fn code(self) -> i32 {
        match self {
            CarState::Idle => 0,
            CarState::Paused => 1,
            CarState::Busy => 2,
            CarState::Error => 3,
        }
    }

    pub fn value(self) -> Value {
        Value::Integer(self.code())
    }

    /// Decode a status channel payload.
    ///
    /// Enum fields arrive either as their index or as their string label,
    /// depending on how the channel was requested.
    pub fn from_value(value: &Value) -> Option<CarState> {
        match value {
            Value::Integer(0) => Some(CarState::Idle),
            Value::Integer(1) => Some(CarState::Paused),
            Value::Integer(2) => Some(CarState::Busy),
            Value::Integer(3) => Some(CarState::Error),
            Value::String(s) => match s.trim().to_uppercase().as_str() {
                "IDLE" => Some(CarState::Idle),
                "PAUSED" => Some(CarState::Paused),
                "BUSY" => Some(CarState::Busy),
                "ERROR" | "ERR" => Some(CarState::Error),
                _ => None,
            },
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn car_state_decodes_codes_and_labels() {
        assert_eq!(CarState::from_value(&Value::Integer(2)), Some(CarState::Busy));
        assert_eq!(
            CarState::from_value(&Value::String("err".into())),
            Some(CarState::Error)
        );
        assert_eq!(CarState::from_value(&Value::Integer(9)), None);
        assert_eq!(CarState::from_value(&Value::Double(0.0)), None);
    }

    #[test]
    fn value_parse_respects_kind() {
        assert_eq!(Value::parse(ValueKind::Integer, " 2 ").unwrap(), Value::Integer(2));
        assert_eq!(Value::parse(ValueKind::Double, "30").unwrap(), Value::Double(30.0));
        assert_eq!(
            Value::parse(ValueKind::String, "open").unwrap(),
            Value::String("open".into())
        );

        let err = Value::parse(ValueKind::Integer, "2.5").unwrap_err();
        assert!(matches!(
            &err,
            CommandError::InvalidLiteral { kind: ValueKind::Integer, text, .. } if text == "2.5"
        ));
    }

    #[test]
    fn value_kind_names_parse() {
        assert_eq!("int".parse::<ValueKind>().unwrap(), ValueKind::Integer);
        assert_eq!(" Double ".parse::<ValueKind>().unwrap(), ValueKind::Double);
        assert!(matches!(
            "long".parse::<ValueKind>(),
            Err(CommandError::ConfigError(_))
        ));
    }

    #[test]
    fn parameter_value_rejects_other_variants() {
        assert_eq!(i32::from_value(&Value::Integer(4)), Some(4));
        assert_eq!(i32::from_value(&Value::Double(4.0)), None);
        assert_eq!(<String as ParameterValue>::KIND, ValueKind::String);
    }
}
