// ── Converted values handed to callbacks ──

use std::fmt;

use serde::Serialize;
use serde_json::Value;

/// An entity state after conversion through its declared [`ValueType`].
///
/// [`ValueType`]: super::ValueType
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StateValue {
    Number(f64),
    Text(String),
}

impl StateValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Number(_) => None,
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Self::Number(_))
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for StateValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for StateValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<String> for StateValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl PartialEq<f64> for StateValue {
    #[allow(clippy::float_cmp)]
    fn eq(&self, other: &f64) -> bool {
        self.as_f64().is_some_and(|n| n == *other)
    }
}

impl PartialEq<&str> for StateValue {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == Some(*other)
    }
}

/// Second argument of every change handler.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange<T> {
    pub prev_state: T,
}

/// One clause's current value, passed to combinator callbacks in
/// declaration order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PredicateValue {
    State(StateValue),
    Attribute(Value),
}

impl PredicateValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::State(v) => v.as_f64(),
            Self::Attribute(v) => v.as_f64(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::State(v) => v.as_str(),
            Self::Attribute(v) => v.as_str(),
        }
    }
}

impl fmt::Display for PredicateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::State(v) => v.fmt(f),
            Self::Attribute(Value::String(s)) => f.write_str(s),
            Self::Attribute(v) => v.fmt(f),
        }
    }
}
