//! ---
//! ms_section: "02-routing"
//! ms_subsection: "module"
//! ms_type: "source"
//! ms_scope: "code"
//! ms_description: "Pattern-based routing of process variables to typed channels."
//! ms_version: "v0.0.0-prealpha"
//! ms_owner: "tbd"
//! ---
//! Maps arbitrary process-variable names onto typed channels.
//!
//! Routes are registered as (pattern, [`SemanticType`], handlers). A lookup
//! scans every route in registration order and keeps the *last* match, so
//! later, more specific routes override earlier catch-alls. The resulting
//! [`Channel`] is built once per concrete name and cached for the life of the
//! router.

pub mod channel;
pub mod router;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use channel::{Channel, Getter, Setter, SubscriptionHook};
pub use router::{ChannelRouter, Route};

/// Data type a route declares for the channels it produces.
///
/// The first five variants follow host-language conventions, the rest the
/// control-system field types. Both families resolve to a [`ChannelKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticType {
    Text,
    Bytes,
    Int,
    Float,
    Bool,
    String,
    Short,
    Long,
    Double,
    Enum,
    Char,
}

impl SemanticType {
    pub fn kind(self) -> ChannelKind {
        match self {
            SemanticType::Text | SemanticType::Char => ChannelKind::Char,
            SemanticType::Bytes => ChannelKind::Byte,
            SemanticType::Int | SemanticType::Long => ChannelKind::Integer,
            SemanticType::Float | SemanticType::Double => ChannelKind::Double,
            SemanticType::Bool => ChannelKind::Bool,
            SemanticType::String => ChannelKind::String,
            SemanticType::Short => ChannelKind::Short,
            SemanticType::Enum => ChannelKind::Enum,
        }
    }
}

/// Channel constructor family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Char,
    Byte,
    Integer,
    Double,
    Bool,
    String,
    Short,
    Enum,
}

impl ChannelKind {
    /// Value a fresh channel of this kind starts with.
    pub fn default_value(self) -> ChannelValue {
        match self {
            ChannelKind::Char | ChannelKind::String => ChannelValue::Text(String::new()),
            ChannelKind::Byte => ChannelValue::Bytes(Vec::new()),
            ChannelKind::Integer | ChannelKind::Short | ChannelKind::Enum => {
                ChannelValue::Integer(0)
            }
            ChannelKind::Double => ChannelValue::Double(0.0),
            ChannelKind::Bool => ChannelValue::Bool(false),
        }
    }

    /// Convert `value` into this kind, widening integers to doubles and
    /// range-checking shorts.
    pub fn coerce(self, value: ChannelValue) -> Result<ChannelValue, ChannelError> {
        match (self, value) {
            (ChannelKind::Char | ChannelKind::String, v @ ChannelValue::Text(_)) => Ok(v),
            (ChannelKind::Byte, v @ ChannelValue::Bytes(_)) => Ok(v),
            (ChannelKind::Bool, v @ ChannelValue::Bool(_)) => Ok(v),
            (ChannelKind::Integer | ChannelKind::Enum, v @ ChannelValue::Integer(_)) => Ok(v),
            (ChannelKind::Short, ChannelValue::Integer(i)) => i16::try_from(i)
                .map(|s| ChannelValue::Integer(i64::from(s)))
                .map_err(|_| ChannelError::OutOfRange {
                    kind: self,
                    value: i.to_string(),
                }),
            (ChannelKind::Double, v @ ChannelValue::Double(_)) => Ok(v),
            (ChannelKind::Double, ChannelValue::Integer(i)) => Ok(ChannelValue::Double(i as f64)),
            (kind, value) => Err(ChannelError::TypeMismatch {
                expected: kind,
                found: value.type_name(),
            }),
        }
    }
}

/// Value held by a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelValue {
    Bool(bool),
    Integer(i64),
    Double(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl ChannelValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ChannelValue::Bool(_) => "bool",
            ChannelValue::Integer(_) => "integer",
            ChannelValue::Double(_) => "double",
            ChannelValue::Text(_) => "text",
            ChannelValue::Bytes(_) => "bytes",
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ChannelValue::Double(v) => Some(*v),
            ChannelValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }
}

impl From<f64> for ChannelValue {
    fn from(value: f64) -> Self {
        ChannelValue::Double(value)
    }
}

impl From<i64> for ChannelValue {
    fn from(value: i64) -> Self {
        ChannelValue::Integer(value)
    }
}

impl From<bool> for ChannelValue {
    fn from(value: bool) -> Self {
        ChannelValue::Bool(value)
    }
}

impl From<&str> for ChannelValue {
    fn from(value: &str) -> Self {
        ChannelValue::Text(value.to_owned())
    }
}

/// Lookup failures.
#[derive(Debug, Error, PartialEq)]
pub enum RouterError {
    #[error("no route matches channel '{0}'")]
    NotFound(String),
    #[error("invalid route pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Failures raised while reading or writing a channel.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ChannelError {
    #[error("channel '{0}' is read-only")]
    ReadOnly(String),
    #[error("expected a {expected:?} value, got {found}")]
    TypeMismatch {
        expected: ChannelKind,
        found: &'static str,
    },
    #[error("{value} does not fit a {kind:?} channel")]
    OutOfRange { kind: ChannelKind, value: String },
    /// Handler-specific failure, e.g. the model rejected a write.
    #[error("{0}")]
    Handler(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semantic_types_map_to_constructor_families() {
        let expected = [
            (SemanticType::Text, ChannelKind::Char),
            (SemanticType::Bytes, ChannelKind::Byte),
            (SemanticType::Int, ChannelKind::Integer),
            (SemanticType::Float, ChannelKind::Double),
            (SemanticType::Bool, ChannelKind::Bool),
            (SemanticType::String, ChannelKind::String),
            (SemanticType::Short, ChannelKind::Short),
            (SemanticType::Long, ChannelKind::Integer),
            (SemanticType::Double, ChannelKind::Double),
            (SemanticType::Enum, ChannelKind::Enum),
            (SemanticType::Char, ChannelKind::Char),
        ];
        for (semantic, kind) in expected {
            assert_eq!(semantic.kind(), kind, "{semantic:?}");
        }
    }

    #[test]
    fn every_kind_has_a_default() {
        assert_eq!(ChannelKind::Byte.default_value(), ChannelValue::Bytes(Vec::new()));
        assert_eq!(ChannelKind::Double.default_value(), ChannelValue::Double(0.0));
        assert_eq!(ChannelKind::Enum.default_value(), ChannelValue::Integer(0));
        assert_eq!(ChannelKind::Char.default_value(), ChannelValue::Text(String::new()));
    }

    #[test]
    fn coercion_widens_and_range_checks() {
        assert_eq!(
            ChannelKind::Double.coerce(ChannelValue::Integer(3)),
            Ok(ChannelValue::Double(3.0))
        );
        assert!(matches!(
            ChannelKind::Short.coerce(ChannelValue::Integer(70_000)),
            Err(ChannelError::OutOfRange { .. })
        ));
        assert!(matches!(
            ChannelKind::Bool.coerce(ChannelValue::Text("yes".into())),
            Err(ChannelError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn values_deserialize_untagged() {
        let v: ChannelValue = serde_json::from_str("1.25").expect("double");
        assert_eq!(v, ChannelValue::Double(1.25));
        let v: ChannelValue = serde_json::from_str("7").expect("integer");
        assert_eq!(v, ChannelValue::Integer(7));
        let v: ChannelValue = serde_json::from_str("\"QF01\"").expect("text");
        assert_eq!(v, ChannelValue::Text("QF01".into()));
    }
}
