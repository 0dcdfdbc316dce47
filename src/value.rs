use serde::{Deserialize, Serialize};
use std::fmt;

/// Type tag of a property, fixed when the property is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueTag {
    Number,
    Text,
    /// Integers, also used for boolean flags such as `/Connected`.
    Integer,
}

impl ValueTag {
    /// Bus type signature for values carrying this tag.
    pub fn signature(self) -> &'static str {
        match self {
            ValueTag::Number => "d",
            ValueTag::Text => "s",
            ValueTag::Integer => "i",
        }
    }

    /// Fallback used when telemetry for a property is missing.
    pub fn zero(self) -> Value {
        match self {
            ValueTag::Number => Value::Number(0.0),
            ValueTag::Text => Value::Text(String::new()),
            ValueTag::Integer => Value::Integer(0),
        }
    }
}

impl fmt::Display for ValueTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueTag::Number => write!(f, "number"),
            ValueTag::Text => write!(f, "text"),
            ValueTag::Integer => write!(f, "integer"),
        }
    }
}

/// A property value as carried on the bus.
///
/// Serializes untagged so telemetry deltas can carry plain JSON scalars:
/// `12.6`, `"1.0"` or `1`. JSON booleans are accepted and become integers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Integer(i64),
    Number(f64),
    Text(String),
}

impl Value {
    pub fn tag(&self) -> ValueTag {
        match self {
            Value::Number(_) => ValueTag::Number,
            Value::Text(_) => ValueTag::Text,
            Value::Integer(_) => ValueTag::Integer,
        }
    }

    /// Numeric view of the value, `None` for text.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Number(n) => Some(n),
            Value::Integer(i) => Some(i as f64),
            Value::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Converts the value to `tag` when that can be done without losing
    /// meaning. Integers widen to numbers; numbers narrow to integers only
    /// when integral. Text never converts to or from a numeric tag.
    pub fn coerce_to(self, tag: ValueTag) -> Option<Value> {
        match (self, tag) {
            (v, t) if v.tag() == t => Some(v),
            (Value::Integer(i), ValueTag::Number) => Some(Value::Number(i as f64)),
            (Value::Number(n), ValueTag::Integer)
                if n.is_finite() && n.fract() == 0.0 && n.abs() < i64::MAX as f64 =>
            {
                Some(Value::Integer(n as i64))
            }
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{}", n),
            Value::Text(s) => write!(f, "{}", s),
            Value::Integer(i) => write!(f, "{}", i),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Integer(i64::from(b))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bool(bool),
            Integer(i64),
            Number(f64),
            Text(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Bool(b) => Value::from(b),
            Raw::Integer(i) => Value::Integer(i),
            Raw::Number(n) => Value::Number(n),
            Raw::Text(s) => Value::Text(s),
        })
    }
}
