//! Tagged values crossing the script boundary.
//!
//! The rest of the crate never touches engine types; everything a command
//! script receives or returns is one of these variants.

use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

/// A value passed into or returned from a command script.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    /// Absent result (`()` in the engine).
    None,
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    /// Raw packet bytes.
    Bytes(Vec<u8>),
    /// Ordered list; fixed-size lists double as tuples.
    List(Vec<ScriptValue>),
    Dict(BTreeMap<String, ScriptValue>),
    /// An error value a script returns to have it rethrown
    /// (represented in scripts as `#{error: "..."}`).
    Throwable(String),
    /// Anything the engine produced that has no mapping; carries the type
    /// name for diagnostics.
    Other(String),
}

impl ScriptValue {
    /// Human/wire rendering used for response values and request info:
    /// strings pass through unquoted, everything else renders as JSON.
    pub fn to_plain_string(&self) -> String {
        match self {
            Self::Str(s) => s.clone(),
            other => other.to_json().to_string(),
        }
    }

    /// Lossy conversion into JSON (bytes become arrays of numbers).
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::None => JsonValue::Null,
            Self::Str(s) => JsonValue::String(s.clone()),
            Self::Int(i) => JsonValue::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Self::Bool(b) => JsonValue::Bool(*b),
            Self::Bytes(b) => JsonValue::Array(b.iter().map(|v| JsonValue::from(*v)).collect()),
            Self::List(items) => JsonValue::Array(items.iter().map(|v| v.to_json()).collect()),
            Self::Dict(map) => JsonValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Self::Throwable(msg) => {
                let mut m = serde_json::Map::new();
                m.insert("error".into(), JsonValue::String(msg.clone()));
                JsonValue::Object(m)
            }
            Self::Other(ty) => JsonValue::String(format!("<{ty}>")),
        }
    }

    /// Build from JSON (used for initial values and seeded device data).
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::None,
            JsonValue::Bool(b) => Self::Bool(*b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    Self::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            JsonValue::String(s) => Self::Str(s.clone()),
            JsonValue::Array(items) => Self::List(items.iter().map(Self::from_json).collect()),
            JsonValue::Object(map) => Self::Dict(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Parse an initial-value string the way the REST surface accepts it:
    /// a JSON object or array when it parses as one, a bare string otherwise.
    pub fn from_initial_value(raw: &str) -> Option<Self> {
        if raw.is_empty() {
            return None;
        }
        match serde_json::from_str::<JsonValue>(raw) {
            Ok(v @ (JsonValue::Object(_) | JsonValue::Array(_))) => Some(Self::from_json(&v)),
            _ => Some(Self::Str(raw.to_string())),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Engine-facing type name, for script error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Str(_) => "string",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Bool(_) => "bool",
            Self::Bytes(_) => "bytes",
            Self::List(_) => "list",
            Self::Dict(_) => "dict",
            Self::Throwable(_) => "throwable",
            Self::Other(_) => "other",
        }
    }
}

impl From<&str> for ScriptValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for ScriptValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for ScriptValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<Vec<u8>> for ScriptValue {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_string_rendering() {
        assert_eq!(ScriptValue::Str("abc".into()).to_plain_string(), "abc");
        assert_eq!(ScriptValue::Int(7).to_plain_string(), "7");
        assert_eq!(
            ScriptValue::List(vec![ScriptValue::Int(1), ScriptValue::Int(2)]).to_plain_string(),
            "[1,2]"
        );
    }

    #[test]
    fn test_initial_value_parsing() {
        assert!(ScriptValue::from_initial_value("").is_none());
        assert_eq!(
            ScriptValue::from_initial_value("plain"),
            Some(ScriptValue::Str("plain".into()))
        );
        match ScriptValue::from_initial_value(r#"{"a":"b"}"#).unwrap() {
            ScriptValue::Dict(m) => assert_eq!(m["a"], ScriptValue::Str("b".into())),
            other => panic!("expected dict, got {other:?}"),
        }
        match ScriptValue::from_initial_value(r#"["x","y"]"#).unwrap() {
            ScriptValue::List(items) => assert_eq!(items.len(), 2),
            other => panic!("expected list, got {other:?}"),
        }
        // bare numbers are kept as strings, matching the REST contract
        assert_eq!(
            ScriptValue::from_initial_value("42"),
            Some(ScriptValue::Str("42".into()))
        );
    }

    #[test]
    fn test_json_round_trip() {
        let v = ScriptValue::Dict(
            [
                ("a".to_string(), ScriptValue::Int(1)),
                ("b".to_string(), ScriptValue::List(vec![ScriptValue::Bool(true)])),
            ]
            .into_iter()
            .collect(),
        );
        let json = v.to_json();
        assert_eq!(ScriptValue::from_json(&json), v);
    }
}
